//! Property test for §8 invariant 3 (mapping disjointness): at every point
//! in a random alloc/free sequence, live runs are pairwise disjoint and
//! stay within `[0, capacity)`.

use proptest::prelude::*;
use spfresh_alloc::BlockAllocator;

#[derive(Debug, Clone)]
enum Op {
    Alloc(u32),
    FreeOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..8).prop_map(Op::Alloc),
        Just(Op::FreeOldest),
    ]
}

proptest! {
    #[test]
    fn runs_stay_disjoint_and_in_bounds(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let capacity = 256u64;
        let alloc = BlockAllocator::new(capacity);
        let mut live: Vec<spfresh_alloc::Run> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(n) => {
                    if let Ok(run) = alloc.alloc(n) {
                        live.push(run);
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let run = live.remove(0);
                        alloc.free(run);
                    }
                }
            }

            let mut sorted = live.clone();
            sorted.sort_by_key(|r| r.start_block);
            for w in sorted.windows(2) {
                prop_assert!(w[0].end() <= w[1].start_block);
            }
            for run in &sorted {
                prop_assert!(run.end() <= capacity);
            }
        }
    }
}
