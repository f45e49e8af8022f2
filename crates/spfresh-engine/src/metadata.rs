//! Per-vector metadata passthrough (§1 "metadata: an opaque byte-string
//! associated with a vector id" — explicitly in scope, unlike payload
//! storage beyond that).
//!
//! File format mirrors `spfresh_store::mapping`: `u32 count | count *
//! (u32 vid, u32 len, len bytes) | u64 checksum`, write-temp + rename.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;
use spfresh_core::ids::Vid;
use spfresh_core::SpfreshError;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

#[derive(Default)]
pub struct MetadataStore {
    entries: DashMap<Vid, Vec<u8>>,
}

impl MetadataStore {
    pub fn load(path: &Path) -> Result<Self, SpfreshError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)
            .map_err(|e| SpfreshError::Corrupted(format!("reading metadata file: {e}")))?;
        if bytes.len() < 4 + 8 {
            return Err(SpfreshError::Corrupted("metadata file too short".into()));
        }
        let (body, checksum_bytes) = bytes.split_at(bytes.len() - 8);
        let stored = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if u64::from(hasher.finalize()) != stored {
            return Err(SpfreshError::Corrupted(
                "metadata file checksum mismatch".into(),
            ));
        }

        let mut cursor = Cursor::new(body);
        let count = read_u32(&mut cursor)?;
        let entries = DashMap::with_capacity(count as usize);
        for _ in 0..count {
            let vid = read_u32(&mut cursor)?;
            let len = read_u32(&mut cursor)? as usize;
            let mut buf = vec![0u8; len];
            cursor
                .read_exact(&mut buf)
                .map_err(|e| SpfreshError::Corrupted(format!("truncated metadata entry: {e}")))?;
            entries.insert(Vid(vid), buf);
        }
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> Result<(), SpfreshError> {
        let mut body = Vec::new();
        write_u32(&mut body, self.entries.len() as u32).unwrap();
        for entry in &self.entries {
            write_u32(&mut body, entry.key().0).unwrap();
            write_u32(&mut body, entry.value().len() as u32).unwrap();
            body.extend_from_slice(entry.value());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let checksum = u64::from(hasher.finalize());

        let tmp_path = path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp_path)
                .map_err(|e| SpfreshError::Corrupted(format!("creating metadata temp file: {e}")))?;
            f.write_all(&body)
                .and_then(|()| f.write_all(&checksum.to_le_bytes()))
                .and_then(|()| f.sync_all())
                .map_err(|e| SpfreshError::Corrupted(format!("writing metadata temp file: {e}")))?;
        }
        std::fs::rename(&tmp_path, path)
            .map_err(|e| SpfreshError::Corrupted(format!("renaming metadata file: {e}")))?;
        Ok(())
    }

    pub fn set(&self, vid: Vid, value: Vec<u8>) {
        self.entries.insert(vid, value);
    }

    pub fn get(&self, vid: Vid) -> Option<Vec<u8>> {
        self.entries.get(&vid).map(|v| v.clone())
    }

    pub fn remove(&self, vid: Vid) {
        self.entries.remove(&vid);
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, SpfreshError> {
    r.read_u32::<LittleEndian>()
        .map_err(|e| SpfreshError::Corrupted(format!("truncated metadata file: {e}")))
}
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.bin");
        let store = MetadataStore::default();
        store.set(Vid(1), b"hello".to_vec());
        store.set(Vid(2), Vec::new());
        store.save(&path).unwrap();

        let loaded = MetadataStore::load(&path).unwrap();
        assert_eq!(loaded.get(Vid(1)), Some(b"hello".to_vec()));
        assert_eq!(loaded.get(Vid(2)), Some(Vec::new()));
        assert_eq!(loaded.get(Vid(3)), None);
    }

    #[test]
    fn remove_drops_entry() {
        let store = MetadataStore::default();
        store.set(Vid(1), b"x".to_vec());
        store.remove(Vid(1));
        assert_eq!(store.get(Vid(1)), None);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = MetadataStore::load(&dir.path().join("missing.bin")).unwrap();
        assert_eq!(loaded.get(Vid(1)), None);
    }
}
