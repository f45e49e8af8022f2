#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![cfg_attr(feature = "nightly-simd", feature(portable_simd))]

//! Shared primitives for the freshness engine: identifier newtypes, the
//! value-type/metric dispatch boundary, the crate-wide error taxonomy and
//! the live-tunable `EngineConfig`.

pub mod config;
pub mod error;
pub mod ids;
pub mod vector;

pub use config::EngineConfig;
pub use error::SpfreshError;
pub use ids::{Hid, Pid, Vid};
pub use vector::{Metric, ValueType, Vector};

/// Default SSD block size in bytes (§4.A). Every `Run`, `alloc`, and on-disk
/// offset is a multiple of this.
pub const BLOCK_SIZE: usize = 4096;
