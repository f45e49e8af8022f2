//! The Trace Player (§4.I): a sliding-window reader over a binary vector
//! file. Records are produced strictly in file order with a monotonic
//! sequence number; a single prefetcher thread reads the file once,
//! filling a ring of `W` slots ahead of however many consumer threads
//! are calling `next()`. A `Guard` holds its slot until dropped, which
//! is what lets the prefetcher reuse it for a later record.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};
use spfresh_core::{SpfreshError, ValueType};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// `h(n) & 1` from the end-to-end scenarios: deterministic so two runs
/// over the same trace produce the same Read/Write assignment.
#[must_use]
pub fn default_hash(n: u64) -> u64 {
    n.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 63
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Write,
    Read,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub seq: u64,
    pub op: OpKind,
    pub vector: Vec<f32>,
}

struct Slot {
    record: Option<Record>,
    guarded: bool,
}

struct Inner {
    ring: Mutex<Vec<Slot>>,
    cv: Condvar,
    window: usize,
    total: u64,
    fill_cursor: AtomicU64,
    consume_cursor: AtomicU64,
    error: Mutex<Option<String>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Inner {
    fn wake(&self) {
        self.cv.notify_all();
    }
}

/// A claimed slot; the record is returned to the pool when this is
/// dropped, letting the prefetcher refill it with a later record.
pub struct Guard {
    inner: Arc<Inner>,
    slot: usize,
    record: Option<Record>,
}

impl Guard {
    #[must_use]
    pub fn record(&self) -> &Record {
        self.record.as_ref().expect("guard always holds a record until drop")
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        {
            let mut ring = self.inner.ring.lock();
            ring[self.slot].guarded = false;
        }
        self.inner.wake();
    }
}

/// Sliding-window binary trace reader (§4.I Trace Player).
pub struct TracePlayer {
    inner: Arc<Inner>,
    prefetcher: Option<JoinHandle<()>>,
}

impl TracePlayer {
    /// Open `path` (`u32 vector_count | u32 dim | vector_count * dim *
    /// sizeof(T)` bytes) and start the prefetcher thread filling up to
    /// `window` slots ahead of consumers.
    pub fn open(
        path: &Path,
        window: usize,
        value_type: ValueType,
        hash: fn(u64) -> u64,
    ) -> Result<Self, SpfreshError> {
        let window = window.max(1);
        let mut file = File::open(path)
            .map_err(|e| SpfreshError::Corrupted(format!("opening trace file: {e}")))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|e| SpfreshError::Corrupted(format!("reading trace header: {e}")))?;
        let count = LittleEndian::read_u32(&header[0..4]) as u64;
        let dim = LittleEndian::read_u32(&header[4..8]) as usize;

        let inner = Arc::new(Inner {
            ring: Mutex::new((0..window).map(|_| Slot { record: None, guarded: false }).collect()),
            cv: Condvar::new(),
            window,
            total: count,
            fill_cursor: AtomicU64::new(0),
            consume_cursor: AtomicU64::new(0),
            error: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        let prefetch_inner = Arc::clone(&inner);
        let element_size = value_type.element_size();
        let record_bytes = dim * element_size;
        let prefetcher = std::thread::spawn(move || {
            run_prefetcher(prefetch_inner, file, dim, value_type, record_bytes, hash);
        });

        Ok(Self {
            inner,
            prefetcher: Some(prefetcher),
        })
    }

    /// Total number of records in the trace.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner.total
    }

    /// Claim the next record in file order, blocking until it is
    /// available or the trace is exhausted. `Ok(None)` once every record
    /// has been delivered.
    pub fn next(&self) -> Result<Option<Guard>, SpfreshError> {
        let seq = self.inner.consume_cursor.fetch_add(1, Ordering::SeqCst);
        if seq >= self.inner.total {
            return Ok(None);
        }
        let slot_idx = (seq % self.inner.window as u64) as usize;
        let mut ring = self.inner.ring.lock();
        loop {
            if let Some(err) = self.inner.error.lock().clone() {
                return Err(SpfreshError::Corrupted(err));
            }
            let matches = ring[slot_idx]
                .record
                .as_ref()
                .is_some_and(|r| r.seq == seq);
            if matches {
                let record = ring[slot_idx].record.take();
                ring[slot_idx].guarded = true;
                drop(ring);
                return Ok(Some(Guard {
                    inner: Arc::clone(&self.inner),
                    slot: slot_idx,
                    record,
                }));
            }
            self.inner.cv.wait(&mut ring);
        }
    }
}

impl Drop for TracePlayer {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake();
        if let Some(handle) = self.prefetcher.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_prefetcher(
    inner: Arc<Inner>,
    mut file: File,
    dim: usize,
    value_type: ValueType,
    record_bytes: usize,
    hash: fn(u64) -> u64,
) {
    for seq in 0..inner.total {
        let slot_idx = (seq % inner.window as u64) as usize;
        {
            let mut ring = inner.ring.lock();
            while ring[slot_idx].record.is_some() || ring[slot_idx].guarded {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                inner.cv.wait(&mut ring);
            }
        }
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut buf = vec![0u8; record_bytes];
        if let Err(e) = file
            .seek(SeekFrom::Start(8 + seq * record_bytes as u64))
            .and_then(|_| file.read_exact(&mut buf))
        {
            *inner.error.lock() = Some(format!("reading trace record {seq}: {e}"));
            inner.wake();
            return;
        }
        let vector = value_type.decode(&buf, dim);
        let op = if hash(seq) & 1 == 0 {
            OpKind::Write
        } else {
            OpKind::Read
        };

        {
            let mut ring = inner.ring.lock();
            ring[slot_idx].record = Some(Record { seq, op, vector });
        }
        inner.fill_cursor.fetch_add(1, Ordering::SeqCst);
        inner.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn write_trace(path: &Path, count: u32, dim: u32) {
        let mut f = File::create(path).unwrap();
        f.write_u32::<LittleEndian>(count).unwrap();
        f.write_u32::<LittleEndian>(dim).unwrap();
        for i in 0..count {
            for d in 0..dim {
                f.write_f32::<LittleEndian>((i * dim + d) as f32).unwrap();
            }
        }
    }

    #[test]
    fn delivers_every_record_exactly_once_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        write_trace(&path, 50, 4);
        let player = TracePlayer::open(&path, 4, ValueType::Float, default_hash).unwrap();

        let mut seqs = Vec::new();
        while let Some(guard) = player.next().unwrap() {
            seqs.push(guard.record().seq);
        }
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn op_kind_is_deterministic_for_a_fixed_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        write_trace(&path, 20, 2);

        let collect_ops = || {
            let player = TracePlayer::open(&path, 4, ValueType::Float, default_hash).unwrap();
            let mut ops = Vec::new();
            while let Some(guard) = player.next().unwrap() {
                ops.push(guard.record().op);
            }
            ops
        };
        assert_eq!(collect_ops(), collect_ops());
    }

    #[test]
    fn concurrent_consumers_each_get_distinct_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        write_trace(&path, 200, 8);
        let player = Arc::new(TracePlayer::open(&path, 8, ValueType::Float, default_hash).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let player = Arc::clone(&player);
                std::thread::spawn(move || {
                    let mut seqs = Vec::new();
                    while let Some(guard) = player.next().unwrap() {
                        seqs.push(guard.record().seq);
                    }
                    seqs
                })
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }
}
