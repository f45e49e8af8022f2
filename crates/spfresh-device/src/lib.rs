#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

//! The block device (§4.A): a fixed-block-size, asynchronous byte store.
//! `FileBlockDevice` is the file-backed fallback used when
//! `SPFRESH_SPDK_CONF`/`SPFRESH_SPDK_BDEV` are unset; real SPDK bdev access
//! is an external collaborator outside this repo's scope.

mod file_impl;
mod ram_impl;

pub use file_impl::FileBlockDevice;
pub use ram_impl::RamBlockDevice;

use spfresh_core::error::IoErrorKind;
use spfresh_core::{SpfreshError, BLOCK_SIZE};

pub type IoResult<T> = Result<T, SpfreshError>;

/// Completion callback: fires exactly once with the outcome of a submitted
/// read or write.
pub type ReadCallback = Box<dyn FnOnce(IoResult<Vec<u8>>) + Send>;
pub type WriteCallback = Box<dyn FnOnce(IoResult<()>) + Send>;

/// Fixed-block-size asynchronous byte store (§4.A).
///
/// Reads observe the last durable write for that block. Concurrent writes
/// to the *same* block are undefined; the allocator's single-writer-per-run
/// discipline is what makes that safe in practice (§4.B).
pub trait BlockDevice: Send + Sync {
    /// Submit an async read of `n_blocks` starting at `block`. `cb` fires
    /// once, on a worker thread, with the filled buffer or an error.
    fn read(&self, block: u64, n_blocks: u32, cb: ReadCallback);

    /// Submit an async write of `data` (must be `n_blocks * BLOCK_SIZE`
    /// bytes) starting at `block`. `cb` fires once the write is queued.
    fn write(&self, block: u64, n_blocks: u32, data: Vec<u8>, cb: WriteCallback);

    /// Block until every write submitted so far is durable.
    fn flush(&self) -> IoResult<()>;

    /// Total device capacity in blocks. Constant after construction.
    fn capacity_blocks(&self) -> u64;

    /// Convenience synchronous read built on the async API; used by callers
    /// (Posting Store, Recovery) that need the result before proceeding.
    fn read_blocking(&self, block: u64, n_blocks: u32) -> IoResult<Vec<u8>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.read(
            block,
            n_blocks,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.recv()
            .unwrap_or_else(|_| Err(io_error(block, IoErrorKind::Read, "callback dropped")))
    }

    /// Convenience synchronous write built on the async API.
    fn write_blocking(&self, block: u64, n_blocks: u32, data: Vec<u8>) -> IoResult<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.write(
            block,
            n_blocks,
            data,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.recv()
            .unwrap_or_else(|_| Err(io_error(block, IoErrorKind::Write, "callback dropped")))
    }
}

pub(crate) fn io_error(block: u64, kind: IoErrorKind, msg: &str) -> SpfreshError {
    SpfreshError::IoError {
        block,
        kind,
        source: std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()),
    }
}

/// Round a byte length up to a whole number of blocks.
#[must_use]
pub fn blocks_for_len(len: usize) -> u32 {
    ((len + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32
}

/// Configuration for opening the block device, read from the environment
/// (§6 "Environment"). SPDK bdevs are an external collaborator; when those
/// variables are set we log a fallback to the file-backed device rather
/// than fail, since SPDK's polling-mode driver is out of this repo's scope.
#[derive(Debug, Clone)]
pub struct BlockDeviceConfig {
    pub spdk_conf: Option<String>,
    pub spdk_bdev: Option<String>,
}

impl BlockDeviceConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            spdk_conf: std::env::var("SPFRESH_SPDK_CONF").ok(),
            spdk_bdev: std::env::var("SPFRESH_SPDK_BDEV").ok(),
        }
    }

    #[must_use]
    pub fn wants_spdk(&self) -> bool {
        self.spdk_conf.is_some() || self.spdk_bdev.is_some()
    }
}

/// Open the block device described by `--spdk-map <file>` (§6), the path
/// backing the file device (or the device mapping file when/if a real SPDK
/// bdev backend is linked in).
pub fn open(path: &std::path::Path, capacity_blocks: u64) -> std::io::Result<FileBlockDevice> {
    let cfg = BlockDeviceConfig::from_env();
    if cfg.wants_spdk() {
        tracing::warn!(
            spdk_conf = ?cfg.spdk_conf,
            spdk_bdev = ?cfg.spdk_bdev,
            "SPDK block device requested but not linked into this build; falling back to file-backed device"
        );
    }
    FileBlockDevice::open(path, capacity_blocks)
}
