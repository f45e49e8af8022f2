//! Crate-wide error taxonomy (§7 ERROR HANDLING DESIGN).
//!
//! `Corrupted` and an `IoError` that has exhausted its retry budget are the
//! only fatal variants; everything else is returned to the caller. The CLI
//! maps a fatal error to process exit code 1.

use crate::ids::Pid;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    Read,
    Write,
    Flush,
    QueueOverflow,
}

#[derive(Debug, Error)]
pub enum SpfreshError {
    #[error("io error on block {block} ({kind:?}): {source}")]
    IoError {
        block: u64,
        kind: IoErrorKind,
        #[source]
        source: std::io::Error,
    },

    #[error("no space: requested {requested} blocks, largest free run is {largest_free}")]
    NoSpace { requested: u32, largest_free: u32 },

    #[error("not found: {0}")]
    NotFound(Pid),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("empty index: no vectors have been built yet")]
    EmptyIndex,

    #[error("corrupted on-disk state: {0}")]
    Corrupted(String),

    #[error("aborted")]
    Aborted,
}

impl SpfreshError {
    /// `Corrupted` and exhausted-retry `IoError` are fatal; everything else
    /// is surfaced to the caller without stopping the process (§7).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SpfreshError::Corrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, SpfreshError>;
