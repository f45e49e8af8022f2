//! §8 end-to-end scenario S6: replaying the same trace with the same
//! thread count twice must produce result logs that are identical as
//! multisets (thread scheduling can reorder *which* consumer gets a
//! given record, but never duplicates or drops one, and `default_hash`
//! fixes the Read/Write split independent of scheduling).

use byteorder::{LittleEndian, WriteBytesExt};
use spfresh_core::ValueType;
use spfresh_harness::{decode_log, default_hash, OpKind, ResultWriter, TracePlayer};
use std::sync::Arc;

fn write_trace(path: &std::path::Path, count: u32, dim: u32) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_u32::<LittleEndian>(count).unwrap();
    f.write_u32::<LittleEndian>(dim).unwrap();
    for i in 0..count {
        for d in 0..dim {
            f.write_f32::<LittleEndian>((i * dim + d) as f32).unwrap();
        }
    }
}

/// Play the whole trace with `threads` concurrent consumers, logging one
/// `Write` record per op (the `internal_id` is just the seq, so the
/// resulting multiset of seqs is what we compare across runs).
fn run_once(trace_path: &std::path::Path, result_path: &std::path::Path, threads: usize) {
    let player = Arc::new(TracePlayer::open(trace_path, 8, ValueType::Float, default_hash).unwrap());
    let writer = Arc::new(ResultWriter::open(result_path, 16).unwrap());

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let player = Arc::clone(&player);
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                while let Some(guard) = player.next().unwrap() {
                    let rec = guard.record();
                    writer.record_write(rec.seq, rec.seq);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    Arc::try_unwrap(writer).ok().unwrap().shutdown().unwrap();
}

#[test]
fn two_runs_with_same_thread_count_agree_on_seq_multiset() {
    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("trace.bin");
    write_trace(&trace_path, 2000, 4);

    let result_a = dir.path().join("a.log");
    let result_b = dir.path().join("b.log");
    run_once(&trace_path, &result_a, 4);
    run_once(&trace_path, &result_b, 4);

    let mut seqs_a: Vec<u64> = decode_log(&std::fs::read(&result_a).unwrap())
        .into_iter()
        .map(|r| match r {
            spfresh_harness::ResultRecord::Write { seq, .. } => seq,
            spfresh_harness::ResultRecord::Read { seq, .. } => seq,
        })
        .collect();
    let mut seqs_b: Vec<u64> = decode_log(&std::fs::read(&result_b).unwrap())
        .into_iter()
        .map(|r| match r {
            spfresh_harness::ResultRecord::Write { seq, .. } => seq,
            spfresh_harness::ResultRecord::Read { seq, .. } => seq,
        })
        .collect();
    seqs_a.sort_unstable();
    seqs_b.sort_unstable();

    assert_eq!(seqs_a, (0..2000).collect::<Vec<_>>());
    assert_eq!(seqs_a, seqs_b);
}

#[test]
fn op_kind_split_is_stable_across_thread_counts() {
    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("trace.bin");
    write_trace(&trace_path, 500, 4);

    let collect_ops = |threads: usize| -> Vec<(u64, OpKind)> {
        let player = TracePlayer::open(&trace_path, 8, ValueType::Float, default_hash).unwrap();
        let mut ops = Vec::new();
        while let Some(guard) = player.next().unwrap() {
            let rec = guard.record();
            ops.push((rec.seq, rec.op));
        }
        let _ = threads;
        ops.sort_by_key(|(seq, _)| *seq);
        ops
    };

    assert_eq!(collect_ops(1), collect_ops(4));
}
