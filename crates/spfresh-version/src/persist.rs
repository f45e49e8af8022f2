//! On-disk form of the version map: `u32 count | count * (u8 version, u8
//! deleted) | u64 checksum`, written the same write-temp + atomic-rename +
//! crc32 way as the posting store's mapping file. This snapshot exists
//! because Recovery's invariant ("post-recovery state equivalent to
//! pre-crash state plus a suffix of in-flight work") only holds if
//! tombstones and version bumps already folded into a compacted-away
//! prefix of the persistent buffer are still reconstructible after a
//! crash (see DESIGN.md).

use crate::VersionMap;
use spfresh_core::ids::Vid;
use std::io::{self, Read, Write};
use std::path::Path;

pub fn save(path: &Path, vm: &VersionMap) -> io::Result<()> {
    let len = vm.len();
    let mut body = Vec::with_capacity(4 + len as usize * 2);
    body.extend_from_slice(&len.to_le_bytes());
    for i in 0..len {
        let (version, deleted) = vm.get(Vid(i));
        body.push(version.0);
        body.push(u8::from(deleted));
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

pub fn load(path: &Path) -> io::Result<VersionMap> {
    let vm = VersionMap::new();
    if !path.exists() {
        return Ok(vm);
    }
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 12 {
        return Ok(vm);
    }
    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 8);
    let stored = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if u64::from(hasher.finalize()) != stored {
        tracing::error!("version map checksum mismatch, starting from empty map");
        return Ok(vm);
    }
    let len = u32::from_le_bytes(body[0..4].try_into().unwrap());
    for i in 0..len {
        let off = 4 + i as usize * 2;
        if off + 2 > body.len() {
            break;
        }
        let version = body[off];
        let deleted = body[off + 1] != 0;
        vm.observe_vid(Vid(i));
        vm.set_version(Vid(i), spfresh_core::ids::Version(version));
        if deleted {
            vm.set_deleted(Vid(i));
        }
    }
    Ok(vm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version_map.bin");
        let vm = VersionMap::new();
        let v0 = vm.allocate_vid();
        let v1 = vm.allocate_vid();
        vm.bump_version(v0);
        vm.set_deleted(v1);
        save(&path, &vm).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.get(v0), vm.get(v0));
        assert_eq!(loaded.get(v1), vm.get(v1));
        assert_eq!(loaded.len(), vm.len());
    }
}
