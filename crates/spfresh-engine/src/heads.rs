//! Durable snapshot of the head index's centroids (`u32 count | count *
//! (u32 hid, dim * f32) | u64 checksum`). The HNSW graph itself (§4.E) is
//! an in-memory external-collaborator structure with no persistence of
//! its own; this file is what makes a clean restart rebuild the same set
//! of heads instead of starting from zero and losing every posting's
//! route.

use byteorder::{ByteOrder, LittleEndian};
use spfresh_core::ids::Hid;
use std::io::{Read, Write};
use std::path::Path;

pub fn save(path: &Path, heads: &[(Hid, Vec<f32>)], dim: usize) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&(heads.len() as u32).to_le_bytes());
    for (hid, vector) in heads {
        debug_assert_eq!(vector.len(), dim);
        body.extend_from_slice(&hid.0.to_le_bytes());
        for &v in vector {
            body.extend_from_slice(&v.to_le_bytes());
        }
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let checksum = u64::from(hasher.finalize());

    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(&body)?;
        f.write_all(&checksum.to_le_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

pub fn load(path: &Path, dim: usize) -> std::io::Result<Vec<(Hid, Vec<f32>)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 12 {
        return Ok(Vec::new());
    }
    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 8);
    let stored = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if u64::from(hasher.finalize()) != stored {
        tracing::error!("head snapshot checksum mismatch, starting from an empty head index");
        return Ok(Vec::new());
    }

    let count = LittleEndian::read_u32(&body[0..4]) as usize;
    let stride = 4 + dim * 4;
    let mut out = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        if offset + stride > body.len() {
            break;
        }
        let hid = LittleEndian::read_u32(&body[offset..offset + 4]);
        let mut vector = Vec::with_capacity(dim);
        for chunk in body[offset + 4..offset + stride].chunks_exact(4) {
            vector.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        out.push((Hid(hid), vector));
        offset += stride;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heads.bin");
        let heads = vec![(Hid(1), vec![1.0, 2.0]), (Hid(7), vec![3.0, 4.0])];
        save(&path, &heads, 2).unwrap();
        let loaded = load(&path, 2).unwrap();
        assert_eq!(loaded, heads);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(load(&path, 4).unwrap().is_empty());
    }
}
