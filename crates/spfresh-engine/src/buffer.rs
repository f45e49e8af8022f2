//! The persistent buffer (§4.G, §6 "Persistent buffer format"): a
//! durability log of every foreground mutation, appended to before an
//! insert/delete/reassign is acknowledged, and replayed by Recovery
//! (§4.J) to reconstruct in-flight background work after a crash.
//!
//! Record format, one after another with no separators:
//! `u64 seq | u8 kind | u32 vid | u8 version | u32 dim | dim * f32 (INSERT only)`.
//! `kind`: 0 = Insert, 1 = Delete, 2 = Reassign. `seq` is a monotonic
//! fetch-add counter assigned at serialization time (§10.6.4), giving
//! Recovery a total order to replay independent of file-position ties.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use spfresh_core::ids::{Vid, Version};
use spfresh_core::SpfreshError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum BufferRecord {
    Insert { vid: Vid, vector: Vec<f32> },
    Delete { vid: Vid },
    Reassign { vid: Vid, version: Version },
}

impl BufferRecord {
    fn kind(&self) -> u8 {
        match self {
            BufferRecord::Insert { .. } => 0,
            BufferRecord::Delete { .. } => 1,
            BufferRecord::Reassign { .. } => 2,
        }
    }

    /// Serialize with `seq` as the first 8 bytes, assigned by the caller
    /// (`PersistentBuffer::append`) via its fetch-add counter right before
    /// this is called — `seq` never exists anywhere but on the wire.
    fn encode(&self, seq: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&seq.to_le_bytes());
        out.push(self.kind());
        match self {
            BufferRecord::Insert { vid, vector } => {
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, vid.0);
                out.extend_from_slice(&buf);
                out.push(0);
                LittleEndian::write_u32(&mut buf, vector.len() as u32);
                out.extend_from_slice(&buf);
                for &v in vector {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            BufferRecord::Delete { vid } => {
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, vid.0);
                out.extend_from_slice(&buf);
                out.push(0);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
            BufferRecord::Reassign { vid, version } => {
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, vid.0);
                out.extend_from_slice(&buf);
                out.push(version.0);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        out
    }
}

/// A record as read back off disk, paired with the `seq` it was
/// assigned on write (§10.6.4).
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRecord {
    pub seq: u64,
    pub record: BufferRecord,
}

/// Append-only durability log, flushed to disk on every `append` (§4.G
/// "persistent buffer append" happens before a foreground call returns).
pub struct PersistentBuffer {
    path: PathBuf,
    file: Mutex<File>,
    seq: AtomicU64,
}

impl PersistentBuffer {
    pub fn open(path: PathBuf) -> Result<Self, SpfreshError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| SpfreshError::Corrupted(format!("opening persistent buffer: {e}")))?;
        // Resume the counter one past the highest seq already on disk, so a
        // reopened buffer's seq stays monotonic across process restarts
        // even though Recovery truncates the log after folding it in.
        let next_seq = Self::replay(&path)?
            .last()
            .map_or(0, |logged| logged.seq + 1);
        Ok(Self {
            path,
            file: Mutex::new(file),
            seq: AtomicU64::new(next_seq),
        })
    }

    /// Append `record`, `fsync`-ing before returning so the record is
    /// durable by the time the foreground caller is acknowledged. Returns
    /// the `seq` assigned to it.
    pub fn append(&self, record: &BufferRecord) -> Result<u64, SpfreshError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let bytes = record.encode(seq);
        let mut file = self.file.lock();
        file.write_all(&bytes)
            .and_then(|()| file.sync_data())
            .map_err(|e| SpfreshError::Corrupted(format!("appending to persistent buffer: {e}")))?;
        Ok(seq)
    }

    /// Replay every record currently on disk, in append (== seq) order
    /// (§4.J Recovery step 2).
    pub fn replay(path: &Path) -> Result<Vec<LoggedRecord>, SpfreshError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| SpfreshError::Corrupted(format!("reading persistent buffer: {e}")))?;

        let mut out = Vec::new();
        let mut offset = 0;
        const HEADER_LEN: usize = 18;
        while offset + HEADER_LEN <= bytes.len() {
            let seq = LittleEndian::read_u64(&bytes[offset..offset + 8]);
            let kind = bytes[offset + 8];
            let vid = Vid(LittleEndian::read_u32(&bytes[offset + 9..offset + 13]));
            let version = bytes[offset + 13];
            let dim = LittleEndian::read_u32(&bytes[offset + 14..offset + HEADER_LEN]) as usize;
            let needed = HEADER_LEN + if kind == 0 { dim * 4 } else { 0 };
            if offset + needed > bytes.len() {
                tracing::warn!("persistent buffer truncated mid-record, stopping replay");
                break;
            }
            let record = match kind {
                0 => {
                    let mut vector = Vec::with_capacity(dim);
                    let vec_start = offset + HEADER_LEN;
                    for chunk in bytes[vec_start..vec_start + dim * 4].chunks_exact(4) {
                        vector.push(f32::from_le_bytes(chunk.try_into().unwrap()));
                    }
                    BufferRecord::Insert { vid, vector }
                }
                1 => BufferRecord::Delete { vid },
                2 => BufferRecord::Reassign {
                    vid,
                    version: Version(version),
                },
                other => {
                    tracing::error!(kind = other, "unknown persistent buffer record kind, stopping replay");
                    break;
                }
            };
            out.push(LoggedRecord { seq, record });
            offset += needed;
        }
        Ok(out)
    }

    /// Truncate the log to empty once every record in it has been durably
    /// folded into the posting store and version map (§4.G, compaction).
    pub fn truncate(&self) -> Result<(), SpfreshError> {
        let mut file = self.file.lock();
        file.set_len(0)
            .map_err(|e| SpfreshError::Corrupted(format!("truncating persistent buffer: {e}")))?;
        *file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SpfreshError::Corrupted(format!("reopening persistent buffer: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_recovers_all_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        let buffer = PersistentBuffer::open(path.clone()).unwrap();

        let records = vec![
            BufferRecord::Insert {
                vid: Vid(1),
                vector: vec![1.0, 2.0, 3.0],
            },
            BufferRecord::Delete { vid: Vid(1) },
            BufferRecord::Reassign {
                vid: Vid(2),
                version: Version(7),
            },
        ];
        for r in &records {
            buffer.append(r).unwrap();
        }

        let replayed = PersistentBuffer::replay(&path).unwrap();
        let seqs: Vec<u64> = replayed.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let just_records: Vec<BufferRecord> = replayed.into_iter().map(|r| r.record).collect();
        assert_eq!(just_records, records);
    }

    #[test]
    fn seq_resumes_monotonically_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        {
            let buffer = PersistentBuffer::open(path.clone()).unwrap();
            let seq0 = buffer.append(&BufferRecord::Delete { vid: Vid(1) }).unwrap();
            let seq1 = buffer.append(&BufferRecord::Delete { vid: Vid(2) }).unwrap();
            assert_eq!((seq0, seq1), (0, 1));
        }
        let buffer = PersistentBuffer::open(path.clone()).unwrap();
        let seq2 = buffer.append(&BufferRecord::Delete { vid: Vid(3) }).unwrap();
        assert_eq!(seq2, 2);
    }

    #[test]
    fn truncate_clears_future_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        let buffer = PersistentBuffer::open(path.clone()).unwrap();
        buffer
            .append(&BufferRecord::Delete { vid: Vid(5) })
            .unwrap();
        buffer.truncate().unwrap();
        assert!(PersistentBuffer::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");
        assert!(PersistentBuffer::replay(&path).unwrap().is_empty());
    }
}
