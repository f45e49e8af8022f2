//! The search engine (§4.H): route to a handful of candidate heads,
//! gather their postings, dedup by `Vid` keeping the closest replica,
//! and filter out tombstoned or superseded versions before ranking.

use crate::records::decode;
use crate::Engine;
use spfresh_core::ids::Vid;
use spfresh_core::SpfreshError;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Overrides `EngineConfig::search_internal_result_num` for this call.
    pub internal_result_num: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub vid: Vid,
    pub distance: f32,
}

/// Two-stage search consistent with concurrent updates (§4.H): a result
/// only ever reflects a `Vid`'s current `(version, deleted)` state, never
/// a replica that a background worker has already superseded.
pub fn search(
    engine: &Engine,
    query: &[f32],
    k: usize,
    opts: &SearchOptions,
) -> Result<Vec<SearchHit>, SpfreshError> {
    if engine.routing.head().is_empty() {
        return Err(SpfreshError::EmptyIndex);
    }
    let m = opts
        .internal_result_num
        .unwrap_or_else(|| engine.config.search_internal_result_num());
    let pids = engine.routing.route(query, m);

    let max_candidates = engine.config.max_candidates();
    let max_ratio = engine.config.max_dist_ratio();
    let mut best_so_far = f32::INFINITY;
    let mut examined = 0usize;
    let mut candidates: HashMap<Vid, f32> = HashMap::new();

    'outer: for pid in pids {
        let Ok(bytes) = engine.store.get(pid) else {
            continue;
        };
        let records = decode(&bytes, engine.dim, engine.value_type);
        for rec in records {
            if examined >= max_candidates {
                break 'outer;
            }
            examined += 1;

            if engine.version_map.is_deleted(rec.vid) {
                continue;
            }
            let (current_version, _) = engine.version_map.get(rec.vid);
            if current_version != rec.version {
                // A background worker already rewrote this vid's replica
                // with a newer version; this one is stale, skip it.
                continue;
            }

            let dist = engine.metric.distance(query, &rec.vector);
            if dist > best_so_far * max_ratio {
                continue;
            }
            if dist < best_so_far {
                best_so_far = dist;
            }
            candidates
                .entry(rec.vid)
                .and_modify(|d| {
                    if dist < *d {
                        *d = dist;
                    }
                })
                .or_insert(dist);
        }
    }

    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .map(|(vid, distance)| SearchHit { vid, distance })
        .collect();
    hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(k);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use spfresh_core::{EngineConfig, Metric, ValueType};

    fn engine(dir: &std::path::Path) -> Engine {
        Engine::open(
            dir,
            &dir.join("postings.bin"),
            2,
            ValueType::Float,
            Metric::L2,
            4096,
            EngineConfig::new(2),
        )
        .unwrap()
    }

    #[test]
    fn empty_index_errors() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let err = e.search(&[0.0, 0.0], 5, &SearchOptions::default());
        assert!(matches!(err, Err(SpfreshError::EmptyIndex)));
    }

    #[test]
    fn finds_inserted_vector() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let vid = e.insert(vec![1.0, 1.0]).unwrap();
        e.drain();
        let hits = e.search(&[1.0, 1.0], 1, &SearchOptions::default()).unwrap();
        assert_eq!(hits[0].vid, vid);
        assert!(hits[0].distance < 1e-5);
    }

    #[test]
    fn deleted_vector_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let vid = e.insert(vec![1.0, 1.0]).unwrap();
        e.drain();
        e.delete(vid).unwrap();
        let hits = e.search(&[1.0, 1.0], 5, &SearchOptions::default()).unwrap();
        assert!(hits.iter().all(|h| h.vid != vid));
    }
}
