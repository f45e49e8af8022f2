#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! The block allocator (§4.B): a free-list of block runs over
//! `[0, capacity_blocks)`, best-fit, coalescing on release. All methods are
//! serialized internally by a single mutex (§5 "Block allocator: single
//! mutex") — `alloc` never overlaps a concurrent `alloc`/`free`.

use parking_lot::Mutex;
use spfresh_core::SpfreshError;
use std::collections::{BTreeMap, BTreeSet};

/// A contiguous span of blocks: `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Run {
    pub start_block: u64,
    pub block_count: u32,
}

impl Run {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start_block + u64::from(self.block_count)
    }
}

struct FreeState {
    /// Free runs keyed by start block, for neighbor coalescing.
    by_start: BTreeMap<u64, u32>,
    /// Free run start blocks keyed by length, for best-fit search.
    by_len: BTreeMap<u32, BTreeSet<u64>>,
}

impl FreeState {
    fn insert(&mut self, start: u64, len: u32) {
        self.by_start.insert(start, len);
        self.by_len.entry(len).or_default().insert(start);
    }

    fn remove(&mut self, start: u64, len: u32) {
        self.by_start.remove(&start);
        if let Some(set) = self.by_len.get_mut(&len) {
            set.remove(&start);
            if set.is_empty() {
                self.by_len.remove(&len);
            }
        }
    }

    /// Smallest free run whose length is >= `n`, or `None`.
    fn best_fit(&self, n: u32) -> Option<(u64, u32)> {
        self.by_len
            .range(n..)
            .next()
            .and_then(|(&len, starts)| starts.iter().next().map(|&start| (start, len)))
    }

    fn largest_free(&self) -> u32 {
        self.by_len.keys().next_back().copied().unwrap_or(0)
    }
}

/// Thread-safe best-fit allocator over `[0, capacity_blocks)`.
pub struct BlockAllocator {
    capacity_blocks: u64,
    state: Mutex<FreeState>,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(capacity_blocks: u64) -> Self {
        let mut by_start = BTreeMap::new();
        let mut by_len = BTreeMap::new();
        if capacity_blocks > 0 {
            by_start.insert(0u64, capacity_blocks as u32);
            by_len
                .entry(capacity_blocks as u32)
                .or_insert_with(BTreeSet::new)
                .insert(0u64);
        }
        Self {
            capacity_blocks,
            state: Mutex::new(FreeState { by_start, by_len }),
        }
    }

    /// Rebuild the free list from a set of runs already in use (used by
    /// Recovery when reconstructing the allocator from a persisted
    /// mapping, §4.J).
    #[must_use]
    pub fn from_used_runs(capacity_blocks: u64, used: &[Run]) -> Self {
        let alloc = Self::new(capacity_blocks);
        let mut sorted: Vec<Run> = used.to_vec();
        sorted.sort_by_key(|r| r.start_block);
        {
            let mut state = alloc.state.lock();
            for run in sorted {
                carve_out(&mut state, run);
            }
        }
        alloc
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    /// Return a contiguous run of >= `n` blocks, or `NoSpace` if the
    /// largest free run is smaller than `n`. Best-fit: the smallest free
    /// run that still satisfies the request, to bound fragmentation.
    pub fn alloc(&self, n: u32) -> Result<Run, SpfreshError> {
        if n == 0 {
            return Ok(Run {
                start_block: 0,
                block_count: 0,
            });
        }
        let mut state = self.state.lock();
        let Some((start, len)) = state.best_fit(n) else {
            return Err(SpfreshError::NoSpace {
                requested: n,
                largest_free: state.largest_free(),
            });
        };
        state.remove(start, len);
        if len > n {
            state.insert(start + u64::from(n), len - n);
        }
        Ok(Run {
            start_block: start,
            block_count: n,
        })
    }

    /// Return `run` to the free pool, coalescing with adjacent free runs.
    pub fn free(&self, run: Run) {
        if run.block_count == 0 {
            return;
        }
        let mut state = self.state.lock();
        let mut start = run.start_block;
        let mut len = run.block_count;

        // Coalesce with the run immediately before us.
        if let Some((&before_start, &before_len)) = state.by_start.range(..start).next_back() {
            if before_start + u64::from(before_len) == start {
                state.remove(before_start, before_len);
                start = before_start;
                len += before_len;
            }
        }
        // Coalesce with the run immediately after us.
        if let Some(&after_len) = state.by_start.get(&(start + u64::from(len))) {
            state.remove(start + u64::from(len), after_len);
            len += after_len;
        }
        state.insert(start, len);
    }

    /// Sum of all free run lengths, for monitoring.
    pub fn free_blocks(&self) -> u64 {
        self.state
            .lock()
            .by_start
            .values()
            .map(|&len| u64::from(len))
            .sum()
    }
}

fn carve_out(state: &mut FreeState, used: Run) {
    // Find the free run (if any) that contains `used` and split around it.
    let Some((&free_start, &free_len)) = state
        .by_start
        .range(..=used.start_block)
        .next_back()
        .filter(|(&s, &l)| s + u64::from(l) > used.start_block)
    else {
        return;
    };
    state.remove(free_start, free_len);
    if free_start < used.start_block {
        state.insert(free_start, (used.start_block - free_start) as u32);
    }
    let used_end = used.end();
    let free_end = free_start + u64::from(free_len);
    if used_end < free_end {
        state.insert(used_end, (free_end - used_end) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let a = BlockAllocator::new(100);
        let r1 = a.alloc(10).unwrap();
        assert_eq!(r1.start_block, 0);
        assert_eq!(a.free_blocks(), 90);
        a.free(r1);
        assert_eq!(a.free_blocks(), 100);
    }

    #[test]
    fn no_space_when_exhausted() {
        let a = BlockAllocator::new(10);
        let _ = a.alloc(10).unwrap();
        assert!(matches!(a.alloc(1), Err(SpfreshError::NoSpace { .. })));
    }

    #[test]
    fn coalesces_adjacent_runs() {
        let a = BlockAllocator::new(100);
        let r1 = a.alloc(10).unwrap();
        let r2 = a.alloc(10).unwrap();
        assert_eq!(a.free_blocks(), 80);
        a.free(r1);
        a.free(r2);
        // Fully coalesced back into a single 100-block run.
        let full = a.alloc(100).unwrap();
        assert_eq!(full.block_count, 100);
    }

    #[test]
    fn best_fit_minimizes_fragmentation() {
        let a = BlockAllocator::new(100);
        let small = a.alloc(5).unwrap();
        let _mid = a.alloc(20).unwrap();
        a.free(small);
        // A request that fits the 5-block hole exactly should reuse it,
        // not carve into the large remaining run.
        let r = a.alloc(5).unwrap();
        assert_eq!(r.start_block, 0);
    }

    #[test]
    fn from_used_runs_excludes_them() {
        let used = vec![Run {
            start_block: 10,
            block_count: 5,
        }];
        let a = BlockAllocator::from_used_runs(20, &used);
        assert_eq!(a.free_blocks(), 15);
        let r = a.alloc(5).unwrap();
        assert!(r.start_block < 10 || r.start_block >= 15);
    }
}
