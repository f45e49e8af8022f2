//! The Result Writer (§4.I): an append-only log of per-operation
//! outcomes. Each call claims the next slot in a ring via a fetch-add
//! counter; a single background flusher thread walks the ring in claim
//! order, writes `READY` slots to disk and frees them for reuse. A claim
//! that lands on a slot the flusher hasn't drained yet blocks until it
//! does — non-blocking would silently overwrite an unflushed record.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};
use spfresh_core::SpfreshError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ResultRecord {
    /// `tag(1B) | seq(8B) | internal_id(8B)`, 17 bytes total.
    Write { seq: u64, internal_id: u64 },
    /// `tag(1B) | seq(8B) | result_ids(k * 8B)`, `1 + 8 + 8k` bytes total.
    Read { seq: u64, result_ids: Vec<u64> },
}

impl ResultRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ResultRecord::Write { seq, internal_id } => {
                out.push(0);
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(&internal_id.to_le_bytes());
            }
            ResultRecord::Read { seq, result_ids } => {
                out.push(1);
                out.extend_from_slice(&seq.to_le_bytes());
                for id in result_ids {
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
        }
        out
    }
}

/// Decode a concatenated result log back into individual records, for
/// tests that need to check totality (§8 invariant 7).
#[must_use]
pub fn decode_log(bytes: &[u8]) -> Vec<ResultRecord> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 9 <= bytes.len() {
        let tag = bytes[offset];
        let seq = LittleEndian::read_u64(&bytes[offset + 1..offset + 9]);
        match tag {
            0 => {
                if offset + 17 > bytes.len() {
                    break;
                }
                let internal_id = LittleEndian::read_u64(&bytes[offset + 9..offset + 17]);
                out.push(ResultRecord::Write { seq, internal_id });
                offset += 17;
            }
            1 => {
                // A Read record has no explicit length field; callers
                // decoding a log produced with mixed k must track k out
                // of band. This harness always logs a single k per run.
                break;
            }
            _ => break,
        }
    }
    out
}

/// Decode a log that only ever contains `Read` records of a fixed `k`.
#[must_use]
pub fn decode_read_log(bytes: &[u8], k: usize) -> Vec<ResultRecord> {
    let stride = 9 + 8 * k;
    let mut out = Vec::with_capacity(bytes.len() / stride.max(1));
    let mut offset = 0;
    while offset + stride <= bytes.len() {
        let seq = LittleEndian::read_u64(&bytes[offset + 1..offset + 9]);
        let mut result_ids = Vec::with_capacity(k);
        for i in 0..k {
            let start = offset + 9 + i * 8;
            result_ids.push(LittleEndian::read_u64(&bytes[start..start + 8]));
        }
        out.push(ResultRecord::Read { seq, result_ids });
        offset += stride;
    }
    out
}

struct Slot {
    state: AtomicU8,
    data: Mutex<Option<ResultRecord>>,
}

struct Inner {
    slots: Vec<Slot>,
    claim_counter: AtomicU64,
    flush_cursor: AtomicU64,
    cv: Condvar,
    cv_lock: Mutex<()>,
    file: Mutex<File>,
    stopped: AtomicBool,
}

/// Lock-light (a short-held per-slot mutex stands in for a truly
/// lock-free cell) claim-counter ring, matching the shape of §4.I's
/// design without hand-rolled unsafe atomics.
pub struct ResultWriter {
    inner: Arc<Inner>,
    flusher: Option<JoinHandle<()>>,
}

impl ResultWriter {
    pub fn open(path: &Path, capacity: usize) -> Result<Self, SpfreshError> {
        let capacity = capacity.max(1);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SpfreshError::Corrupted(format!("opening result log: {e}")))?;

        let inner = Arc::new(Inner {
            slots: (0..capacity)
                .map(|_| Slot {
                    state: AtomicU8::new(FREE),
                    data: Mutex::new(None),
                })
                .collect(),
            claim_counter: AtomicU64::new(0),
            flush_cursor: AtomicU64::new(0),
            cv: Condvar::new(),
            cv_lock: Mutex::new(()),
            file: Mutex::new(file),
            stopped: AtomicBool::new(false),
        });

        let flusher_inner = Arc::clone(&inner);
        let flusher = std::thread::spawn(move || run_flusher(flusher_inner));

        Ok(Self {
            inner,
            flusher: Some(flusher),
        })
    }

    pub fn record_write(&self, seq: u64, internal_id: u64) {
        self.record(ResultRecord::Write { seq, internal_id });
    }

    pub fn record_read(&self, seq: u64, result_ids: Vec<u64>) {
        self.record(ResultRecord::Read { seq, result_ids });
    }

    fn record(&self, record: ResultRecord) {
        let idx = (self.inner.claim_counter.fetch_add(1, Ordering::SeqCst) as usize)
            % self.inner.slots.len();
        let slot = &self.inner.slots[idx];
        // If producers have outrun the flusher by a full lap of the ring,
        // this slot still holds an unflushed READY (or in-flight CLAIMED)
        // record; wait for it to drain to FREE instead of clobbering it.
        while slot.state.load(Ordering::Acquire) != FREE {
            let mut guard = self.inner.cv_lock.lock();
            if slot.state.load(Ordering::Acquire) == FREE {
                break;
            }
            self.inner.cv.wait_for(&mut guard, Duration::from_millis(20));
        }
        slot.state.store(CLAIMED, Ordering::Release);
        *slot.data.lock() = Some(record);
        slot.state.store(READY, Ordering::Release);
        self.inner.cv.notify_all();
    }

    /// Block until every record claimed so far is durable on disk
    /// (§4.I "`flush()` is synchronous").
    pub fn flush(&self) -> Result<(), SpfreshError> {
        let target = self.inner.claim_counter.load(Ordering::SeqCst);
        while self.inner.flush_cursor.load(Ordering::SeqCst) < target {
            std::thread::yield_now();
        }
        self.inner
            .file
            .lock()
            .sync_data()
            .map_err(|e| SpfreshError::Corrupted(format!("syncing result log: {e}")))
    }

    pub fn shutdown(mut self) -> Result<(), SpfreshError> {
        self.flush()?;
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cv.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for ResultWriter {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cv.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

fn run_flusher(inner: Arc<Inner>) {
    loop {
        let cursor = inner.flush_cursor.load(Ordering::SeqCst);
        let claimed = inner.claim_counter.load(Ordering::SeqCst);
        if cursor >= claimed {
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            let mut guard = inner.cv_lock.lock();
            inner.cv.wait_for(&mut guard, Duration::from_millis(20));
            continue;
        }

        let idx = (cursor as usize) % inner.slots.len();
        let slot = &inner.slots[idx];
        while slot.state.load(Ordering::Acquire) == CLAIMED {
            std::hint::spin_loop();
        }
        if slot.state.load(Ordering::Acquire) != READY {
            continue;
        }
        let record = slot.data.lock().take();
        if let Some(record) = record {
            let bytes = record.encode();
            if let Err(e) = inner.file.lock().write_all(&bytes) {
                tracing::error!(error = %e, "result writer failed to flush a record");
            }
        }
        slot.state.store(FREE, Ordering::Release);
        inner.flush_cursor.fetch_add(1, Ordering::SeqCst);
        inner.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totality_every_record_written_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.log");
        let writer = ResultWriter::open(&path, 8).unwrap();

        for seq in 0..200u64 {
            writer.record_write(seq, seq * 10);
        }
        writer.shutdown().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let records = decode_log(&bytes);
        assert_eq!(records.len(), 200);
        let mut seqs: Vec<u64> = records
            .iter()
            .map(|r| match r {
                ResultRecord::Write { seq, .. } => *seq,
                ResultRecord::Read { seq, .. } => *seq,
            })
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..200).collect::<Vec<_>>());
    }

    /// §8 Testable Property 7 (result-writer totality) under genuine ring
    /// overflow pressure: a tiny `capacity` and many concurrent producers
    /// guarantee the claim counter laps the ring many times over while the
    /// single flusher thread is still draining earlier slots, so `record`
    /// must actually wait for `FREE` rather than clobber an unflushed
    /// `READY`/`CLAIMED` slot.
    #[test]
    fn totality_holds_under_ring_overflow_with_many_producers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results_overflow.log");
        let writer = Arc::new(ResultWriter::open(&path, 4).unwrap());

        const THREADS: u64 = 16;
        const PER_THREAD: u64 = 500;
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let seq = t * PER_THREAD + i;
                        writer.record_write(seq, seq);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        Arc::try_unwrap(writer).ok().unwrap().shutdown().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let records = decode_log(&bytes);
        assert_eq!(records.len() as u64, THREADS * PER_THREAD);
        let mut seqs: Vec<u64> = records
            .iter()
            .map(|r| match r {
                ResultRecord::Write { seq, .. } => *seq,
                ResultRecord::Read { seq, .. } => *seq,
            })
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    }

    #[test]
    fn read_records_roundtrip_with_fixed_k() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.log");
        let writer = ResultWriter::open(&path, 4).unwrap();
        for seq in 0..16u64 {
            writer.record_read(seq, vec![seq, seq + 1, seq + 2]);
        }
        writer.shutdown().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let records = decode_read_log(&bytes, 3);
        assert_eq!(records.len(), 16);
    }
}
