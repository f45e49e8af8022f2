use spfresh_core::{EngineConfig, Metric, ValueType};
use spfresh_engine::Engine;

#[test]
fn reopen_after_clean_shutdown_preserves_search_results() {
    let dir = tempfile::tempdir().unwrap();

    let vid = {
        let engine = Engine::open(
            dir.path(),
            &dir.path().join("postings.bin"),
            3,
            ValueType::Float,
            Metric::L2,
            1 << 16,
            EngineConfig::new(2),
        )
        .unwrap();
        let vid = engine.insert(vec![1.0, 2.0, 3.0]).unwrap();
        engine.drain();
        engine.shutdown().unwrap();
        vid
    };

    let engine = Engine::open(
        dir.path(),
        &dir.path().join("postings.bin"),
        3,
        ValueType::Float,
        Metric::L2,
        1 << 16,
        EngineConfig::new(2),
    )
    .unwrap();
    let hits = engine
        .search(&[1.0, 2.0, 3.0], 1, &spfresh_engine::SearchOptions::default())
        .unwrap();
    assert_eq!(hits[0].vid, vid);
}

#[test]
fn replaying_an_unflushed_buffer_recovers_the_insert() {
    let dir = tempfile::tempdir().unwrap();

    let vid = {
        let engine = Engine::open(
            dir.path(),
            &dir.path().join("postings.bin"),
            3,
            ValueType::Float,
            Metric::L2,
            1 << 16,
            EngineConfig::new(2),
        )
        .unwrap();
        // Insert is durably logged to the persistent buffer before this
        // call returns; dropping the engine here without calling
        // `shutdown` simulates a crash before the mapping/version-map
        // snapshot was taken.
        engine.insert(vec![4.0, 5.0, 6.0]).unwrap()
    };

    let engine = Engine::open(
        dir.path(),
        &dir.path().join("postings.bin"),
        3,
        ValueType::Float,
        Metric::L2,
        1 << 16,
        EngineConfig::new(2),
    )
    .unwrap();
    engine.drain();
    let hits = engine
        .search(&[4.0, 5.0, 6.0], 1, &spfresh_engine::SearchOptions::default())
        .unwrap();
    assert_eq!(hits[0].vid, vid);
}

#[test]
fn deletes_survive_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let vid = {
        let engine = Engine::open(
            dir.path(),
            &dir.path().join("postings.bin"),
            2,
            ValueType::Float,
            Metric::L2,
            1 << 16,
            EngineConfig::new(1),
        )
        .unwrap();
        let vid = engine.insert(vec![1.0, 1.0]).unwrap();
        engine.drain();
        engine.delete(vid).unwrap();
        vid
    };

    let engine = Engine::open(
        dir.path(),
        &dir.path().join("postings.bin"),
        2,
        ValueType::Float,
        Metric::L2,
        1 << 16,
        EngineConfig::new(1),
    )
    .unwrap();
    engine.drain();
    let hits = engine
        .search(&[1.0, 1.0], 5, &spfresh_engine::SearchOptions::default())
        .unwrap_or_default();
    assert!(hits.iter().all(|h| h.vid != vid));
}
