//! Live-tunable engine configuration.
//!
//! One `Arc<EngineConfig>` is threaded through every API — every knob can
//! be retuned without restarting workers, since each field is its own
//! atomic rather than state behind a lock.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[derive(Debug)]
pub struct EngineConfig {
    /// R: number of heads each inserted vector is replicated to (§4.G).
    pub replica_count: AtomicUsize,
    /// Advisory I/O hint, max blocks per posting (§9 open question).
    pub posting_page_limit: AtomicUsize,
    /// RNG pruning factor applied during append (§4.G step 2).
    pub rng_factor_milli: AtomicU32,
    /// Below this posting length, mark for Merge (§4.G).
    pub merge_threshold: AtomicUsize,
    /// Above this posting length, trigger Split (§4.G).
    pub split_threshold: AtomicUsize,
    /// Search width `m`: candidate heads routed per query (§4.H).
    pub search_internal_result_num: AtomicUsize,
    /// Reject candidates farther than best-so-far * ratio (§4.H).
    pub max_dist_ratio_milli: AtomicU32,
    /// Hard cap on candidates examined per search (§4.H).
    pub max_candidates: AtomicUsize,
    /// Head-selection ratio used by the (external) head builder.
    pub head_ratio_milli: AtomicU32,
    /// Number of background append workers (§5).
    pub append_workers: AtomicUsize,
    /// Number of background reassign workers (§5).
    pub reassign_workers: AtomicUsize,
    /// Jobs batched per head before an append worker flushes (§4.G).
    pub append_batch_size: AtomicUsize,
    /// Bounded retry count for a worker observing `IoError` (§7).
    pub io_retry_limit: AtomicUsize,
}

impl EngineConfig {
    #[must_use]
    pub fn new(replica_count: usize) -> Self {
        Self {
            replica_count: AtomicUsize::new(replica_count),
            posting_page_limit: AtomicUsize::new(3),
            rng_factor_milli: AtomicU32::new(1000),
            merge_threshold: AtomicUsize::new(10),
            split_threshold: AtomicUsize::new(18 * replica_count.max(1)),
            search_internal_result_num: AtomicUsize::new(64),
            max_dist_ratio_milli: AtomicU32::new(10_000_000),
            max_candidates: AtomicUsize::new(4096),
            head_ratio_milli: AtomicU32::new(100),
            append_workers: AtomicUsize::new(4),
            reassign_workers: AtomicUsize::new(1),
            append_batch_size: AtomicUsize::new(10),
            io_retry_limit: AtomicUsize::new(3),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count.load(Ordering::Relaxed)
    }

    pub fn merge_threshold(&self) -> usize {
        self.merge_threshold.load(Ordering::Relaxed)
    }

    pub fn set_merge_threshold(&self, v: usize) {
        self.merge_threshold.store(v, Ordering::Relaxed);
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold.load(Ordering::Relaxed)
    }

    pub fn set_split_threshold(&self, v: usize) {
        self.split_threshold.store(v, Ordering::Relaxed);
    }

    pub fn rng_factor(&self) -> f32 {
        self.rng_factor_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn set_posting_page_limit(&self, v: usize) {
        self.posting_page_limit.store(v, Ordering::Relaxed);
    }

    pub fn head_ratio(&self) -> f32 {
        self.head_ratio_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn set_head_ratio(&self, v: f32) {
        self.head_ratio_milli
            .store((v * 1000.0) as u32, Ordering::Relaxed);
    }

    pub fn max_dist_ratio(&self) -> f32 {
        self.max_dist_ratio_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn set_max_dist_ratio(&self, v: f32) {
        self.max_dist_ratio_milli
            .store((v * 1000.0) as u32, Ordering::Relaxed);
    }

    pub fn search_internal_result_num(&self) -> usize {
        self.search_internal_result_num.load(Ordering::Relaxed)
    }

    pub fn set_search_internal_result_num(&self, v: usize) {
        self.search_internal_result_num.store(v, Ordering::Relaxed);
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates.load(Ordering::Relaxed)
    }

    pub fn append_workers(&self) -> usize {
        self.append_workers.load(Ordering::Relaxed)
    }

    pub fn set_append_workers(&self, v: usize) {
        self.append_workers.store(v.max(1), Ordering::Relaxed);
    }

    pub fn reassign_workers(&self) -> usize {
        self.reassign_workers.load(Ordering::Relaxed)
    }

    pub fn append_batch_size(&self) -> usize {
        self.append_batch_size.load(Ordering::Relaxed)
    }

    pub fn io_retry_limit(&self) -> usize {
        self.io_retry_limit.load(Ordering::Relaxed)
    }

    pub fn posting_page_limit(&self) -> usize {
        self.posting_page_limit.load(Ordering::Relaxed)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(8)
    }
}
