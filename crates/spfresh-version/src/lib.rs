#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! The version map (§4.D): per-`Vid` `{version, tombstoned}`, append-only
//! growable in fixed-size segments behind an `ArcSwap<Vec<Arc<Segment>>>`,
//! so readers holding a segment reference never see it relocated under
//! them, and growth only ever appends a new segment rather than
//! reallocating existing ones.

mod persist;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use spfresh_core::ids::{Vid, Version};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Entries per growth segment (§4.D "1 Mi entries per block").
const SEGMENT_ENTRIES: usize = 1 << 20;

struct Segment {
    version: Vec<AtomicU8>,
    deleted: Vec<AtomicBool>,
}

impl Segment {
    fn new() -> Self {
        Self {
            version: (0..SEGMENT_ENTRIES).map(|_| AtomicU8::new(0)).collect(),
            deleted: (0..SEGMENT_ENTRIES).map(|_| AtomicBool::new(false)).collect(),
        }
    }
}

/// Lock-free-read, atomically-written version map. Pinned for the process
/// lifetime: readers hold an index into a stable arena, never a pointer
/// (§9 "Version Map slabs: pinned for the process lifetime").
pub struct VersionMap {
    segments: ArcSwap<Vec<Arc<Segment>>>,
    growth_lock: Mutex<()>,
    next_vid: AtomicU32,
}

impl VersionMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: ArcSwap::from_pointee(vec![Arc::new(Segment::new())]),
            growth_lock: Mutex::new(()),
            next_vid: AtomicU32::new(0),
        }
    }

    /// Atomically assign and return the next `Vid`, growing the backing
    /// arena if this is the first write to a new segment.
    pub fn allocate_vid(&self) -> Vid {
        let id = self.next_vid.fetch_add(1, Ordering::SeqCst);
        self.ensure_segment(id as usize / SEGMENT_ENTRIES);
        Vid(id)
    }

    /// Reserve vids `[start, start+len)` during recovery replay, advancing
    /// the counter without skipping ids that the crashed run already used.
    pub fn observe_vid(&self, vid: Vid) {
        self.ensure_segment(vid.0 as usize / SEGMENT_ENTRIES);
        let next = vid.0 + 1;
        self.next_vid.fetch_max(next, Ordering::SeqCst);
    }

    fn ensure_segment(&self, idx: usize) {
        if idx < self.segments.load().len() {
            return;
        }
        let _guard = self.growth_lock.lock();
        let mut segs = (**self.segments.load()).clone();
        while segs.len() <= idx {
            segs.push(Arc::new(Segment::new()));
        }
        self.segments.store(Arc::new(segs));
    }

    fn locate(&self, vid: Vid) -> (Arc<Vec<Arc<Segment>>>, usize, usize) {
        let segs = self.segments.load_full();
        let idx = vid.0 as usize;
        (segs, idx / SEGMENT_ENTRIES, idx % SEGMENT_ENTRIES)
    }

    /// Current `(version, deleted)` for `vid`.
    pub fn get(&self, vid: Vid) -> (Version, bool) {
        let (segs, seg_idx, local) = self.locate(vid);
        let seg = &segs[seg_idx];
        (
            Version(seg.version[local].load(Ordering::Acquire)),
            seg.deleted[local].load(Ordering::Acquire),
        )
    }

    /// Set the tombstone. Once true it never returns to false (invariant
    /// 2, §8).
    pub fn set_deleted(&self, vid: Vid) {
        let (segs, seg_idx, local) = self.locate(vid);
        segs[seg_idx].deleted[local].store(true, Ordering::Release);
    }

    pub fn is_deleted(&self, vid: Vid) -> bool {
        let (segs, seg_idx, local) = self.locate(vid);
        segs[seg_idx].deleted[local].load(Ordering::Acquire)
    }

    /// Increment the version byte (wrapping), making any stale replica of
    /// this vid in another posting droppable on its next rewrite. Returns
    /// the new version.
    pub fn bump_version(&self, vid: Vid) -> Version {
        let (segs, seg_idx, local) = self.locate(vid);
        let prev = segs[seg_idx].version[local].fetch_add(1, Ordering::AcqRel);
        Version(prev.wrapping_add(1))
    }

    /// Force the version to a specific value; used by Recovery replaying a
    /// `REASSIGN` record so the post-crash state matches exactly what was
    /// durable (rather than incrementing twice on a non-idempotent replay).
    pub fn set_version(&self, vid: Vid, version: Version) {
        let (segs, seg_idx, local) = self.locate(vid);
        segs[seg_idx].version[local].store(version.0, Ordering::Release);
    }

    /// One past the highest `Vid` ever allocated.
    pub fn len(&self) -> u32 {
        self.next_vid.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist `(version, deleted)` for every allocated vid to `path`
    /// (write-temp + rename, checksummed like the mapping file), needed so
    /// Recovery's invariant holds once the persistent buffer has been
    /// truncated past an entry whose version/tombstone effect must still
    /// survive a crash — see DESIGN.md.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        persist::save(path, self)
    }

    /// Load a previously-saved version map, or return an empty one if
    /// `path` does not exist yet (first run).
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        persist::load(path)
    }
}

impl Default for VersionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let vm = VersionMap::new();
        let ids: Vec<_> = (0..1000).map(|_| vm.allocate_vid().0).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn tombstone_is_sticky() {
        let vm = VersionMap::new();
        let v = vm.allocate_vid();
        assert!(!vm.is_deleted(v));
        vm.set_deleted(v);
        assert!(vm.is_deleted(v));
        vm.set_deleted(v);
        assert!(vm.is_deleted(v));
    }

    #[test]
    fn version_bumps_and_wraps() {
        let vm = VersionMap::new();
        let v = vm.allocate_vid();
        for expected in 1..=300u16 {
            let got = vm.bump_version(v);
            assert_eq!(got.0, (expected % 256) as u8);
        }
    }

    #[test]
    fn grows_across_segment_boundary() {
        let vm = VersionMap::new();
        for _ in 0..(SEGMENT_ENTRIES + 10) {
            vm.allocate_vid();
        }
        let last = Vid((SEGMENT_ENTRIES + 9) as u32);
        assert_eq!(vm.get(last), (Version(0), false));
    }
}
