//! Mapping file persistence (§6 "Mapping file format"): `u32 pid_count |
//! pid_count * (u64 start_block, u32 n_blocks) | u64 checksum`, written via
//! write-to-temp + atomic rename so a crash mid-flush never leaves a
//! half-written mapping in the real path (§4.C "post-crash state is
//! always a state reachable by applying a prefix of the update log").

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use spfresh_alloc::Run;
use spfresh_core::ids::Pid;
use spfresh_core::SpfreshError;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

pub fn load(path: &Path) -> Result<HashMap<Pid, Run>, SpfreshError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)
        .map_err(|e| SpfreshError::Corrupted(format!("reading mapping file: {e}")))?;
    if bytes.len() < 4 + 8 {
        return Err(SpfreshError::Corrupted("mapping file too short".into()));
    }
    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 8);
    let stored_checksum = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    let computed = u64::from(hasher.finalize());
    if computed != stored_checksum {
        return Err(SpfreshError::Corrupted(
            "mapping file checksum mismatch".into(),
        ));
    }

    let mut cursor = Cursor::new(body);
    let count = read_u32(&mut cursor)?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let pid = read_u32(&mut cursor)?;
        let start_block = read_u64(&mut cursor)?;
        let n_blocks = read_u32(&mut cursor)?;
        map.insert(
            Pid(pid),
            Run {
                start_block,
                block_count: n_blocks,
            },
        );
    }
    Ok(map)
}

pub fn save(path: &Path, map: &HashMap<Pid, Run>) -> Result<(), SpfreshError> {
    let mut body = Vec::new();
    write_u32(&mut body, map.len() as u32).unwrap();
    for (pid, run) in map {
        write_u32(&mut body, pid.0).unwrap();
        write_u64(&mut body, run.start_block).unwrap();
        write_u32(&mut body, run.block_count).unwrap();
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let checksum = u64::from(hasher.finalize());

    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)
            .map_err(|e| SpfreshError::Corrupted(format!("creating mapping temp file: {e}")))?;
        f.write_all(&body)
            .and_then(|()| f.write_all(&checksum.to_le_bytes()))
            .and_then(|()| f.sync_all())
            .map_err(|e| SpfreshError::Corrupted(format!("writing mapping temp file: {e}")))?;
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| SpfreshError::Corrupted(format!("renaming mapping file: {e}")))?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, SpfreshError> {
    r.read_u32::<LittleEndian>().map_err(io_corrupt)
}
fn read_u64<R: Read>(r: &mut R) -> Result<u64, SpfreshError> {
    r.read_u64::<LittleEndian>().map_err(io_corrupt)
}
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(v)
}
fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<LittleEndian>(v)
}

fn io_corrupt(e: io::Error) -> SpfreshError {
    SpfreshError::Corrupted(format!("truncated mapping file: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.bin");
        let mut map = HashMap::new();
        map.insert(
            Pid(1),
            Run {
                start_block: 0,
                block_count: 3,
            },
        );
        map.insert(
            Pid(2),
            Run {
                start_block: 3,
                block_count: 2,
            },
        );
        save(&path, &map).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.bin");
        save(&path, &HashMap::new()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(load(&path).unwrap().is_empty());
    }
}
