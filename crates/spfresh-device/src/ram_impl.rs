use crate::{io_error, BlockDevice, IoResult, ReadCallback, WriteCallback};
use parking_lot::RwLock;
use spfresh_core::error::IoErrorKind;
use spfresh_core::BLOCK_SIZE;

/// In-memory `BlockDevice`, useful for unit and property tests that want
/// the posting store / allocator invariants without touching the
/// filesystem.
pub struct RamBlockDevice {
    data: RwLock<Vec<u8>>,
    capacity_blocks: u64,
}

impl RamBlockDevice {
    #[must_use]
    pub fn new(capacity_blocks: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; capacity_blocks as usize * BLOCK_SIZE]),
            capacity_blocks,
        }
    }
}

impl BlockDevice for RamBlockDevice {
    fn read(&self, block: u64, n_blocks: u32, cb: ReadCallback) {
        let start = block as usize * BLOCK_SIZE;
        let end = start + n_blocks as usize * BLOCK_SIZE;
        let guard = self.data.read();
        let res = if end > guard.len() {
            Err(io_error(block, IoErrorKind::Read, "out of range"))
        } else {
            Ok(guard[start..end].to_vec())
        };
        cb(res);
    }

    fn write(&self, block: u64, n_blocks: u32, data: Vec<u8>, cb: WriteCallback) {
        let start = block as usize * BLOCK_SIZE;
        let end = start + n_blocks as usize * BLOCK_SIZE;
        let mut guard = self.data.write();
        let res = if end > guard.len() {
            Err(io_error(block, IoErrorKind::Write, "out of range"))
        } else {
            guard[start..end].copy_from_slice(&data);
            Ok(())
        };
        cb(res);
    }

    fn flush(&self) -> IoResult<()> {
        Ok(())
    }

    fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dev = RamBlockDevice::new(8);
        dev.write_blocking(0, 1, vec![7u8; BLOCK_SIZE]).unwrap();
        assert_eq!(dev.read_blocking(0, 1).unwrap(), vec![7u8; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_read_errors() {
        let dev = RamBlockDevice::new(1);
        assert!(dev.read_blocking(5, 1).is_err());
    }
}
