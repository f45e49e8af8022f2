//! §8 invariant 1 (id monotonicity) and invariant 2 (tombstone
//! monotonicity) under concurrent access.

use proptest::prelude::*;
use spfresh_version::VersionMap;
use std::collections::HashSet;
use std::sync::Arc;

proptest! {
    #[test]
    fn concurrent_allocate_vid_is_unique(n_threads in 1usize..8, per_thread in 1usize..200) {
        let vm = Arc::new(VersionMap::new());
        let handles: Vec<_> = (0..n_threads)
            .map(|_| {
                let vm = Arc::clone(&vm);
                std::thread::spawn(move || {
                    (0..per_thread).map(|_| vm.allocate_vid().0).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }

        let unique: HashSet<_> = all.iter().copied().collect();
        prop_assert_eq!(unique.len(), all.len());
        prop_assert_eq!(all.len(), n_threads * per_thread);
    }
}

#[test]
fn tombstone_never_clears() {
    let vm = VersionMap::new();
    let v = vm.allocate_vid();
    vm.set_deleted(v);
    for _ in 0..5 {
        assert!(vm.is_deleted(v));
        vm.bump_version(v);
        assert!(vm.is_deleted(v));
    }
}
