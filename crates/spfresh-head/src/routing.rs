//! The routing layer (§4.F): `route(query, n) -> [Pid]`, backed by a
//! small read-mostly `Hid -> Pid` table. The writer side is only ever
//! taken by Split/Merge (§5 "rwlock; writers only from Split/Merge").

use crate::HeadIndex;
use parking_lot::RwLock;
use spfresh_core::ids::{Hid, Pid};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RoutingLayer<H: HeadIndex + ?Sized> {
    head: Arc<H>,
    table: RwLock<HashMap<Hid, Pid>>,
}

impl<H: HeadIndex + ?Sized> RoutingLayer<H> {
    #[must_use]
    pub fn new(head: Arc<H>) -> Self {
        Self {
            head,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// `n` candidate posting ids for `query`. For a head that has never
    /// been split, `Pid == Hid` (§3); the table only needs an entry once
    /// a Split or Merge changes that.
    pub fn route(&self, query: &[f32], n: usize) -> Vec<Pid> {
        let table = self.table.read();
        self.head
            .search(query, n)
            .into_iter()
            .map(|hid| table.get(&hid).copied().unwrap_or_else(|| hid.into()))
            .collect()
    }

    /// Look up a single head's current posting, for callers (append
    /// worker) that already know which head they are targeting.
    pub fn pid_for(&self, hid: Hid) -> Pid {
        self.table
            .read()
            .get(&hid)
            .copied()
            .unwrap_or_else(|| hid.into())
    }

    /// Install/overwrite the `Hid -> Pid` mapping for `hid`. Used by Split
    /// (new heads get an explicit entry) and Merge (the retired head's
    /// entry is removed, §4.G).
    pub fn set(&self, hid: Hid, pid: Pid) {
        self.table.write().insert(hid, pid);
    }

    pub fn remove(&self, hid: Hid) {
        self.table.write().remove(&hid);
    }

    pub fn head(&self) -> &Arc<H> {
        &self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HnswHeadIndex;
    use spfresh_core::vector::Metric;

    #[test]
    fn defaults_to_identity_mapping() {
        let head = Arc::new(HnswHeadIndex::new(2, Metric::L2));
        head.add(Hid(5), vec![1.0, 2.0]);
        let routing = RoutingLayer::new(head);
        assert_eq!(routing.pid_for(Hid(5)), Pid(5));
    }

    #[test]
    fn split_overrides_identity_mapping() {
        let head = Arc::new(HnswHeadIndex::new(2, Metric::L2));
        head.add(Hid(5), vec![1.0, 2.0]);
        let routing = RoutingLayer::new(head);
        routing.set(Hid(5), Pid(99));
        assert_eq!(routing.pid_for(Hid(5)), Pid(99));
    }
}
