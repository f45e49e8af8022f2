#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

//! The head index (§4.E, external collaborator) and the routing layer
//! (§4.F) that sits on top of it. §1 explicitly puts the head-index
//! *builder* (k-means/BKT construction) out of scope; `HnswHeadIndex` is
//! the "some concrete implementer" the rest of the system needs to run
//! end to end, a greedy-descend HNSW graph trimmed down to the four
//! operations §4.E actually consumes — metadata/filter indexing and an
//! on-disk snapshot format are out of scope here (per §1, per-vector
//! metadata lives in the engine as an opaque byte string, not inside the
//! head index).

mod routing;

pub use routing::RoutingLayer;

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rand::Rng;
use spfresh_core::ids::Hid;
use spfresh_core::vector::Metric;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Operations the rest of the core consumes from a head index (§4.E).
/// The builder that would produce a *good* graph from a fresh dataset is
/// explicitly out of scope; callers only rely on these four methods.
pub trait HeadIndex: Send + Sync {
    /// The `n` nearest head vectors to `query`.
    fn search(&self, query: &[f32], n: usize) -> Vec<Hid>;
    /// Insert a new head under a caller-assigned id. The id must come from
    /// the same `Vid` space as everything else (§3 "Hid ... also a Vid"),
    /// so assignment is the caller's (engine's) responsibility, not the
    /// head index's: only the engine holds the shared `Vid`/`Hid` counter
    /// (`VersionMap::allocate_vid`), so a self-minting `add` would need a
    /// second, independent id source and risk colliding with it.
    fn add(&self, hid: Hid, vector: Vec<f32>);
    /// Remove a head. Lazy: the node is marked tombstoned and excluded
    /// from future search results and neighbor lists it is touched by,
    /// but existing edges into it are cleaned up opportunistically rather
    /// than eagerly re-linked.
    fn remove(&self, hid: Hid);
    fn distance(&self, a: Hid, b: Hid) -> f32;
    /// The raw centroid vector for `hid`, used by the append worker's RNG
    /// pruning and by Split's k-means (§4.G).
    fn vector(&self, hid: Hid) -> Option<Vec<f32>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const DEFAULT_M: usize = 16;
const DEFAULT_M0: usize = 32;
const DEFAULT_EF_CONSTRUCTION: usize = 128;
const DEFAULT_EF_SEARCH: usize = 64;

struct Node {
    vector: Vec<f32>,
    /// `layers[l]` is the neighbor list at layer `l`, layer 0 upward.
    layers: Vec<RwLock<Vec<u32>>>,
    removed: std::sync::atomic::AtomicBool,
}

/// HNSW reference implementation of `HeadIndex`, generic only in the
/// sense that its `Metric` is chosen at construction time (§9 "Dynamic
/// dispatch": metric is a tagged enum, not a compile-time type parameter).
pub struct HnswHeadIndex {
    metric: Metric,
    dim: usize,
    nodes: DashMap<u32, Node>,
    entry_point: AtomicI64,
    max_layer: AtomicUsize,
    m: usize,
    m0: usize,
    ef_construction: usize,
    ef_search: usize,
    count: AtomicUsize,
}

impl HnswHeadIndex {
    #[must_use]
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            metric,
            dim,
            nodes: DashMap::new(),
            entry_point: AtomicI64::new(-1),
            max_layer: AtomicUsize::new(0),
            m: DEFAULT_M,
            m0: DEFAULT_M0,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Every live (non-removed) head id and its centroid, for callers
    /// that need to persist or rebuild the index externally (§4.E is an
    /// external-collaborator boundary; this crate only owns the
    /// in-memory graph).
    pub fn snapshot(&self) -> Vec<(Hid, Vec<f32>)> {
        self.nodes
            .iter()
            .filter(|entry| !entry.value().removed.load(Ordering::Relaxed))
            .map(|entry| (Hid(*entry.key()), entry.value().vector.clone()))
            .collect()
    }

    fn random_level(&self) -> usize {
        let mut rng = rand::thread_rng();
        let r: f64 = rng.gen_range(f64::EPSILON..1.0);
        let level_mult = 1.0 / (self.m as f64).ln();
        (-r.ln() * level_mult).floor() as usize
    }

    fn dist(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.distance(a, b)
    }

    fn node_vector(&self, id: u32) -> Option<Vec<f32>> {
        self.nodes.get(&id).map(|n| n.vector.clone())
    }

    fn is_removed(&self, id: u32) -> bool {
        self.nodes
            .get(&id)
            .map(|n| n.removed.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    /// Greedy single-path descent from `entry` down to (not including)
    /// `target_layer`, used to find a good entry point before a wider
    /// beam search at the target layer.
    fn greedy_descend(&self, query: &[f32], entry: u32, from_layer: usize, target_layer: usize) -> u32 {
        let mut current = entry;
        let mut current_dist = self
            .node_vector(current)
            .map(|v| self.dist(query, &v))
            .unwrap_or(f32::MAX);

        for layer in (target_layer + 1..=from_layer).rev() {
            loop {
                let neighbors = self
                    .nodes
                    .get(&current)
                    .and_then(|n| n.layers.get(layer).map(|l| l.read().clone()))
                    .unwrap_or_default();
                let mut improved = false;
                for nb in neighbors {
                    if self.is_removed(nb) {
                        continue;
                    }
                    if let Some(v) = self.node_vector(nb) {
                        let d = self.dist(query, &v);
                        if d < current_dist {
                            current = nb;
                            current_dist = d;
                            improved = true;
                        }
                    }
                }
                if !improved {
                    break;
                }
            }
        }
        current
    }

    /// Beam search at a single layer, returning up to `ef` candidates
    /// ordered nearest-first.
    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, layer: usize) -> Vec<(u32, f32)> {
        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);

        let entry_dist = self
            .node_vector(entry)
            .map(|v| self.dist(query, &v))
            .unwrap_or(f32::MAX);

        // Min-heap of candidates to explore, max-heap of current results.
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>> = BinaryHeap::new();
        candidates.push(Reverse((OrderedFloat(entry_dist), entry)));
        let mut results: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::new();
        if !self.is_removed(entry) {
            results.push((OrderedFloat(entry_dist), entry));
        }

        while let Some(Reverse((dist, node))) = candidates.pop() {
            if let Some((worst, _)) = results.peek() {
                if results.len() >= ef && dist > *worst {
                    break;
                }
            }
            let neighbors = self
                .nodes
                .get(&node)
                .and_then(|n| n.layers.get(layer).map(|l| l.read().clone()))
                .unwrap_or_default();
            for nb in neighbors {
                if !visited.insert(nb) {
                    continue;
                }
                let Some(v) = self.node_vector(nb) else {
                    continue;
                };
                let d = self.dist(query, &v);
                let should_add = results.len() < ef
                    || results.peek().map(|(w, _)| d < w.0).unwrap_or(true);
                if should_add {
                    candidates.push(Reverse((OrderedFloat(d), nb)));
                    if !self.is_removed(nb) {
                        results.push((OrderedFloat(d), nb));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results.into_iter().map(|(d, id)| (id, d.0)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        out
    }

    /// Select up to `max_neighbors` from `candidates`, closest first
    /// (simple heuristic selection, not a diversity-aware RNG prune —
    /// acceptable here since graph construction quality is explicitly
    /// out of scope, §1).
    fn select_neighbors(candidates: &[(u32, f32)], max_neighbors: usize) -> Vec<u32> {
        candidates
            .iter()
            .take(max_neighbors)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl HeadIndex for HnswHeadIndex {
    fn search(&self, query: &[f32], n: usize) -> Vec<Hid> {
        let entry = self.entry_point.load(Ordering::Acquire);
        if entry < 0 {
            return Vec::new();
        }
        let entry = entry as u32;
        let max_layer = self.max_layer.load(Ordering::Acquire);
        let entry_at_target = self.greedy_descend(query, entry, max_layer, 0);
        let ef = n.max(self.ef_search);
        self.search_layer(query, entry_at_target, ef, 0)
            .into_iter()
            .filter(|(id, _)| !self.is_removed(*id))
            .take(n)
            .map(|(id, _)| Hid(id))
            .collect()
    }

    fn add(&self, hid: Hid, vector: Vec<f32>) {
        debug_assert_eq!(vector.len(), self.dim);
        let id = hid.0;
        let level = self.random_level();
        let layers = (0..=level).map(|_| RwLock::new(Vec::new())).collect();
        self.nodes.insert(
            id,
            Node {
                vector: vector.clone(),
                layers,
                removed: std::sync::atomic::AtomicBool::new(false),
            },
        );
        self.count.fetch_add(1, Ordering::Relaxed);

        let entry = self.entry_point.swap(id as i64, Ordering::AcqRel);
        if entry < 0 {
            self.max_layer.store(level, Ordering::Release);
            return;
        }
        let entry = entry as u32;
        if entry == id {
            return;
        }

        let prev_max_layer = self.max_layer.fetch_max(level, Ordering::AcqRel).max(level);
        let mut current = self.greedy_descend(&vector, entry, prev_max_layer, level.min(prev_max_layer));

        for layer in (0..=level.min(prev_max_layer)).rev() {
            let candidates = self.search_layer(&vector, current, self.ef_construction, layer);
            let max_neighbors = if layer == 0 { self.m0 } else { self.m };
            let selected = Self::select_neighbors(&candidates, max_neighbors);

            if let Some(node) = self.nodes.get(&id) {
                if let Some(l) = node.layers.get(layer) {
                    *l.write() = selected.clone();
                }
            }
            for &nb in &selected {
                if let Some(nb_node) = self.nodes.get(&nb) {
                    if let Some(l) = nb_node.layers.get(layer) {
                        let mut guard = l.write();
                        guard.push(id);
                        if guard.len() > max_neighbors {
                            // Re-rank and keep the closest `max_neighbors`.
                            let Some(nb_vec) = self.node_vector(nb) else {
                                continue;
                            };
                            let mut scored: Vec<(u32, f32)> = guard
                                .iter()
                                .filter_map(|&n| self.node_vector(n).map(|v| (n, self.dist(&nb_vec, &v))))
                                .collect();
                            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
                            *guard = scored.into_iter().take(max_neighbors).map(|(n, _)| n).collect();
                        }
                    }
                }
            }
            if !candidates.is_empty() {
                current = candidates[0].0;
            }
        }
    }

    fn remove(&self, hid: Hid) {
        if let Some(node) = self.nodes.get(&hid.0) {
            node.removed.store(true, Ordering::Release);
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        // Lazy removal: the node stays in the graph (for connectivity) but
        // is filtered out of `search` results and reselected out of
        // neighbor lists the next time those lists are rebuilt.
        if self.entry_point.load(Ordering::Acquire) == i64::from(hid.0) {
            // Re-point the entry to any other live node so future inserts
            // and searches don't start from a removed one.
            if let Some(replacement) = self
                .nodes
                .iter()
                .find(|e| *e.key() != hid.0 && !e.value().removed.load(Ordering::Acquire))
                .map(|e| *e.key())
            {
                self.entry_point
                    .store(i64::from(replacement), Ordering::Release);
            } else {
                self.entry_point.store(-1, Ordering::Release);
            }
        }
    }

    fn distance(&self, a: Hid, b: Hid) -> f32 {
        match (self.node_vector(a.0), self.node_vector(b.0)) {
            (Some(va), Some(vb)) => self.dist(&va, &vb),
            _ => f32::MAX,
        }
    }

    fn vector(&self, hid: Hid) -> Option<Vec<f32>> {
        self.node_vector(hid.0)
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_vector(i: u32, dim: usize) -> Vec<f32> {
        (0..dim).map(|d| (i as f32) + d as f32 * 0.001).collect()
    }

    #[test]
    fn finds_nearest_after_insert() {
        let idx = HnswHeadIndex::new(4, Metric::L2);
        for i in 0..50u32 {
            idx.add(Hid(i), grid_vector(i, 4));
        }
        let results = idx.search(&grid_vector(7, 4), 5);
        assert!(results.contains(&Hid(7)), "{results:?}");
    }

    #[test]
    fn removed_heads_are_excluded() {
        let idx = HnswHeadIndex::new(4, Metric::L2);
        for i in 0..20u32 {
            idx.add(Hid(i), grid_vector(i, 4));
        }
        idx.remove(Hid(7));
        let results = idx.search(&grid_vector(7, 4), 20);
        assert!(!results.contains(&Hid(7)));
        assert_eq!(idx.len(), 19);
    }

    #[test]
    fn distance_matches_metric() {
        let idx = HnswHeadIndex::new(2, Metric::L2);
        idx.add(Hid(0), vec![0.0, 0.0]);
        idx.add(Hid(1), vec![3.0, 4.0]);
        assert!((idx.distance(Hid(0), Hid(1)) - 5.0).abs() < 1e-4);
    }
}
