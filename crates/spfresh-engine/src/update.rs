//! The update engine (§4.G): a fast foreground path that only has to
//! allocate a `Vid`, fsync a persistent-buffer record and hand off to a
//! background worker pool, plus the background workers that actually
//! rewrite postings, RNG-prune near-duplicates and trigger Split/Merge.

use crate::buffer::BufferRecord;
use crate::records::{decode, encode, PostingRecord};
use crate::PersistentBuffer;
use parking_lot::{Condvar, Mutex};
use spfresh_core::ids::{Hid, Pid, Vid, Version};
use spfresh_core::{EngineConfig, Metric, SpfreshError, ValueType};
use spfresh_head::routing::RoutingLayer;
use spfresh_head::{HeadIndex, HnswHeadIndex};
use spfresh_store::PostingStore;
use spfresh_version::VersionMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Per-`Pid` mutex stripes (§5 "striped per-Pid mutexes, 4096 stripes").
const STRIPES: usize = 4096;

/// One replica write destined for `hid`, queued by the foreground insert
/// path and consumed by a background append worker.
#[derive(Debug, Clone)]
pub struct AppendJob {
    pub hid: Hid,
    pub vid: Vid,
    pub version: Version,
    pub vector: Vec<f32>,
}

struct UpdateInner {
    config: Arc<EngineConfig>,
    version_map: Arc<VersionMap>,
    store: Arc<PostingStore>,
    routing: Arc<RoutingLayer<HnswHeadIndex>>,
    buffer: Arc<PersistentBuffer>,
    dim: usize,
    value_type: ValueType,
    metric: Metric,
    pid_locks: Vec<Mutex<()>>,
    pending_count: AtomicUsize,
    drain_cv: (Mutex<()>, Condvar),
}

impl UpdateInner {
    fn stripe(&self, pid: Pid) -> &Mutex<()> {
        &self.pid_locks[pid.0 as usize % self.pid_locks.len()]
    }

    /// Merge `jobs` into `hid`'s posting: decode what's there, RNG-prune
    /// and append the jobs whose vid is still live and on the version it
    /// was queued at, re-encode, write back, then check for Split/Merge
    /// (§4.G steps 2-4).
    fn flush_batch(&self, hid: Hid, jobs: Vec<AppendJob>) {
        let n = jobs.len();
        let pid = self.routing.pid_for(hid);
        let _guard = self.stripe(pid).lock();

        let existing = self.store.get(pid).unwrap_or_default();
        let mut records = decode(&existing, self.dim, self.value_type);
        let head_vector = self
            .routing
            .head()
            .vector(hid)
            .unwrap_or_else(|| jobs[0].vector.clone());
        let rng_factor = self.config.rng_factor();
        let mut accepted: Vec<Vec<f32>> = records.iter().map(|r| r.vector.clone()).collect();

        for job in jobs {
            if self.version_map.is_deleted(job.vid) {
                continue;
            }
            let (current_version, _) = self.version_map.get(job.vid);
            if current_version != job.version {
                continue;
            }
            if rng_admit(self.metric, &head_vector, &job.vector, &accepted, rng_factor) {
                accepted.push(job.vector.clone());
                records.push(PostingRecord {
                    vid: job.vid,
                    version: job.version,
                    vector: job.vector,
                });
            }
        }

        if let Err(e) = self.store.put(pid, &encode(&records, self.value_type)) {
            tracing::error!(hid = %hid, error = %e, "append worker failed to flush posting");
        }

        self.pending_count.fetch_sub(n, Ordering::SeqCst);
        {
            let (lock, cv) = &self.drain_cv;
            let _g = lock.lock();
            cv.notify_all();
        }

        if let Err(e) = self.maybe_split_or_merge(hid, pid) {
            tracing::error!(hid = %hid, error = %e, "split/merge check failed");
        }
    }

    fn maybe_split_or_merge(&self, hid: Hid, pid: Pid) -> Result<(), SpfreshError> {
        let Ok(bytes) = self.store.get(pid) else {
            return Ok(());
        };
        let records = decode(&bytes, self.dim, self.value_type);
        let live = records
            .iter()
            .filter(|r| !self.version_map.is_deleted(r.vid))
            .count();
        if live > self.config.split_threshold() {
            self.split(hid, pid, records)?;
        } else if live > 0 && live < self.config.merge_threshold() {
            self.merge(hid, pid, records)?;
        }
        Ok(())
    }

    /// Bump each record's version and durably log a `Reassign` before it
    /// moves to a new posting, so a replica left behind under the old
    /// `Pid` is recognized as stale the next time it is read (§4.G step 6).
    fn reassign(&self, group: &mut [PostingRecord]) -> Result<(), SpfreshError> {
        for rec in group.iter_mut() {
            let version = self.version_map.bump_version(rec.vid);
            self.buffer.append(&BufferRecord::Reassign {
                vid: rec.vid,
                version,
            })?;
            rec.version = version;
        }
        Ok(())
    }

    /// Split an over-long posting into two, seeded by the two records
    /// farthest apart and assigned by nearest-seed (§4.G Split). The two
    /// new heads take fresh ids from the shared `Vid`/`Hid` counter.
    fn split(&self, hid: Hid, pid: Pid, records: Vec<PostingRecord>) -> Result<(), SpfreshError> {
        if records.len() < 2 {
            return Ok(());
        }
        let seed_a = records[0].vector.clone();
        let seed_b = records
            .iter()
            .max_by(|a, b| {
                let da = self.metric.distance(&seed_a, &a.vector);
                let db = self.metric.distance(&seed_a, &b.vector);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|r| r.vector.clone())
            .unwrap_or_else(|| seed_a.clone());

        let mut group_a = Vec::new();
        let mut group_b = Vec::new();
        for rec in records {
            let da = self.metric.distance(&seed_a, &rec.vector);
            let db = self.metric.distance(&seed_b, &rec.vector);
            if da <= db {
                group_a.push(rec);
            } else {
                group_b.push(rec);
            }
        }
        let (len_a, len_b) = (group_a.len(), group_b.len());

        // Every record changes which head (and so which replica slot) it
        // lives under; bump its version and log the reassignment durably
        // before the new posting is written, so a crash mid-split never
        // leaves a replica elsewhere searchable under a stale version
        // (§4.G step 6, §4.J).
        self.reassign(&mut group_a)?;
        self.reassign(&mut group_b)?;

        let new_hid_a = Hid::from(self.version_map.allocate_vid());
        let new_hid_b = Hid::from(self.version_map.allocate_vid());
        self.routing.head().add(new_hid_a, seed_a);
        self.routing.head().add(new_hid_b, seed_b);

        self.store
            .put(Pid::from(new_hid_a), &encode(&group_a, self.value_type))?;
        self.store
            .put(Pid::from(new_hid_b), &encode(&group_b, self.value_type))?;

        self.routing.head().remove(hid);
        self.routing.remove(hid);
        let _ = self.store.delete(pid);

        tracing::info!(hid = %hid, a = len_a, b = len_b, "split posting");
        Ok(())
    }

    /// Merge an under-long posting into its nearest surviving neighbor
    /// head and retire this one (§4.G Merge).
    fn merge(&self, hid: Hid, pid: Pid, records: Vec<PostingRecord>) -> Result<(), SpfreshError> {
        let Some(centroid) = self.routing.head().vector(hid) else {
            return Ok(());
        };
        let candidates = self.routing.head().search(&centroid, 2);
        let Some(&target_hid) = candidates.iter().find(|&&h| h != hid) else {
            return Ok(());
        };
        let target_pid = self.routing.pid_for(target_hid);
        let target_stripe_first = pid.0.min(target_pid.0);
        let target_stripe_second = pid.0.max(target_pid.0);
        // Lock both stripes in a fixed order to avoid deadlocking with a
        // concurrent merge/split touching the same pair from the other side.
        let _g1 = self.pid_locks[target_stripe_first as usize % self.pid_locks.len()].lock();
        let _g2 = if target_stripe_first % self.pid_locks.len() as u64
            == target_stripe_second % self.pid_locks.len() as u64
        {
            None
        } else {
            Some(self.pid_locks[target_stripe_second as usize % self.pid_locks.len()].lock())
        };

        let existing = self.store.get(target_pid).unwrap_or_default();
        let mut merged = decode(&existing, self.dim, self.value_type);
        merged.extend(records);
        self.store
            .put(target_pid, &encode(&merged, self.value_type))?;

        self.routing.head().remove(hid);
        self.routing.remove(hid);
        let _ = self.store.delete(pid);

        tracing::info!(hid = %hid, target = %target_hid, "merged posting");
        Ok(())
    }
}

/// RNG (relative neighborhood graph) admission test: drop `candidate` if
/// some already-accepted vector is closer to it than `candidate` is to
/// the head, scaled by `rng_factor` (§4.G step 2, bounds posting growth
/// from near-duplicate replicas landing on the same head).
fn rng_admit(
    metric: Metric,
    head_vector: &[f32],
    candidate: &[f32],
    accepted: &[Vec<f32>],
    rng_factor: f32,
) -> bool {
    let d_head = metric.distance(head_vector, candidate);
    for other in accepted {
        if metric.distance(candidate, other) < rng_factor * d_head {
            return false;
        }
    }
    true
}

fn run_worker(inner: Arc<UpdateInner>, receiver: crossbeam_channel::Receiver<AppendJob>) {
    let batch_size = inner.config.append_batch_size().max(1);
    let mut pending: HashMap<Hid, Vec<AppendJob>> = HashMap::new();
    loop {
        match receiver.recv() {
            Ok(job) => {
                let hid = job.hid;
                let batch = pending.entry(hid).or_default();
                batch.push(job);
                if batch.len() >= batch_size {
                    let batch = pending.remove(&hid).unwrap();
                    inner.flush_batch(hid, batch);
                }
            }
            Err(_) => {
                for (hid, batch) in pending.drain() {
                    inner.flush_batch(hid, batch);
                }
                break;
            }
        }
    }
}

/// Owns the append worker pool and the foreground insert/delete path.
pub struct UpdateEngine {
    inner: Arc<UpdateInner>,
    buffer: Arc<PersistentBuffer>,
    sender: Mutex<Option<crossbeam_channel::Sender<AppendJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl UpdateEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        version_map: Arc<VersionMap>,
        store: Arc<PostingStore>,
        routing: Arc<RoutingLayer<HnswHeadIndex>>,
        buffer: Arc<PersistentBuffer>,
        dim: usize,
        value_type: ValueType,
    ) -> Self {
        let metric = routing.head().metric();
        let worker_count = config.append_workers().max(1);
        let inner = Arc::new(UpdateInner {
            config,
            version_map,
            store,
            routing,
            buffer: Arc::clone(&buffer),
            dim,
            value_type,
            metric,
            pid_locks: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            pending_count: AtomicUsize::new(0),
            drain_cv: (Mutex::new(()), Condvar::new()),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let inner = Arc::clone(&inner);
            let rx = rx.clone();
            workers.push(thread::spawn(move || run_worker(inner, rx)));
        }

        Self {
            inner,
            buffer,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Allocate a `Vid`, durably log the insert, then hand replicas off
    /// to the background workers (§4.G foreground insert).
    pub fn insert(&self, vector: Vec<f32>) -> Result<Vid, SpfreshError> {
        let vid = self.inner.version_map.allocate_vid();
        self.buffer.append(&BufferRecord::Insert {
            vid,
            vector: vector.clone(),
        })?;
        self.replicate(vid, vector)?;
        Ok(vid)
    }

    /// Re-enqueue an insert recovered from the persistent buffer without
    /// re-logging it (it is already on disk); see `Engine::recover`.
    pub(crate) fn replay_insert(&self, vid: Vid, vector: Vec<f32>) -> Result<(), SpfreshError> {
        self.replicate(vid, vector)
    }

    fn replicate(&self, vid: Vid, vector: Vec<f32>) -> Result<(), SpfreshError> {
        let head = self.inner.routing.head();
        let replica_count = self.inner.config.replica_count().max(1);
        let mut heads = head.search(&vector, replica_count);
        if heads.is_empty() {
            let hid = Hid::from(vid);
            head.add(hid, vector.clone());
            heads.push(hid);
        }
        let (version, _) = self.inner.version_map.get(vid);

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(SpfreshError::Aborted);
        };
        for hid in heads {
            self.inner.pending_count.fetch_add(1, Ordering::SeqCst);
            let job = AppendJob {
                hid,
                vid,
                version,
                vector: vector.clone(),
            };
            if sender.send(job).is_err() {
                self.inner.pending_count.fetch_sub(1, Ordering::SeqCst);
                tracing::error!("append worker channel closed, dropping append job");
            }
        }
        Ok(())
    }

    /// Tombstone `vid` (§4.G delete): durably logged, takes effect
    /// immediately for search; stale replicas are dropped lazily the
    /// next time their posting is rewritten.
    pub fn delete(&self, vid: Vid) -> Result<(), SpfreshError> {
        self.buffer.append(&BufferRecord::Delete { vid })?;
        self.inner.version_map.set_deleted(vid);
        Ok(())
    }

    /// Block until every append job queued so far has been folded into
    /// a posting.
    pub fn drain(&self) {
        let (lock, cv) = &self.inner.drain_cv;
        let mut guard = lock.lock();
        while self.inner.pending_count.load(Ordering::SeqCst) > 0 {
            cv.wait(&mut guard);
        }
    }

    /// Drain, then close the job channel and join every worker thread.
    pub fn shutdown(&self) {
        self.drain();
        self.sender.lock().take();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
