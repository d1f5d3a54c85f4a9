//! E2E Test Suite 02: Scheduling
//!
//! Priority ordering at the backend, priority updates, read deduplication,
//! back-pressure from tiny pools, the block cache and the threaded service
//! loop.

mod common;

use common::*;
use iostore::config::KB;
use iostore::types::IoPriorityHint;
use iostore::{CompressionMethod, Engine, EngineConfig, IoRequest, Priority, ReadOptions, WriterSettings};
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: higher priority reads reach the backend first
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_priority_ordering_at_backend() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let chunks: Vec<_> = (0..3).map(|i| (chunk(i), sample_data(12 * KB, i as u8))).collect();
    let base = write_container(dir.path(), "prio", WriterSettings::default().with_block_size(4096), &chunks);

    let (backend, log) = RecordingBackend::new();
    let engine = Engine::with_backend(small_config(), Box::new(backend)).unwrap();
    engine.mount(&base, 0).unwrap();

    for (i, priority) in [Priority::Low, Priority::Medium, Priority::High].into_iter().enumerate() {
        engine.resolve(IoRequest::new(chunk(i as u64)).with_priority(priority)).unwrap();
    }
    let done = drain(&engine, 3);
    assert!(done.iter().all(|c| c.is_ok()));

    let log = log.lock().unwrap();
    assert_eq!(log.reads.len(), 9);
    let priorities: Vec<Priority> = log.reads.iter().map(|(p, _)| *p).collect();
    assert!(
        priorities.windows(2).all(|w| w[0] >= w[1]),
        "reads started out of priority order: {:?}",
        priorities
    );
    assert_eq!(priorities[0], Priority::High);
    assert_eq!(log.hints.first(), Some(&IoPriorityHint::Max));
    assert_eq!(log.hints.last(), Some(&IoPriorityHint::Min));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: identical requests share physical reads
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_identical_requests_read_once() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let data = sample_data(10 * KB, 5);
    let base = write_container(dir.path(), "dedup", WriterSettings::default().with_block_size(1024), &[(chunk(1), data.clone())]);

    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| engine.resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(100, 9000))).unwrap());
        }
    });
    let done = drain(&engine, 8);
    assert_eq!(done.len(), 8);
    for completed in &done {
        assert_eq!(completed.data().unwrap(), &data[100..9100]);
    }
    // [100, 9100) spans raw blocks 0, 1 and 2 of 4 KiB each.
    assert_eq!(engine.stats().reads_started, 3);
}

#[test]
fn test_overlapping_requests_in_one_block() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(4000, 6);
    let base = write_container(
        dir.path(),
        "overlap",
        WriterSettings::default().with_block_size(4096).with_method(CompressionMethod::Zlib),
        &[(chunk(1), data.clone())],
    );
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    let a = engine.resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(10, 1500))).unwrap();
    let b = engine.resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(900, 3000))).unwrap();
    let done = by_id(drain(&engine, 2));
    assert_eq!(done[&a].data().unwrap(), &data[10..1510]);
    assert_eq!(done[&b].data().unwrap(), &data[900..3900]);
    let stats = engine.stats();
    assert_eq!(stats.reads_started, 1);
    assert_eq!(stats.blocks_decoded(), 1);
}

#[test]
fn test_same_block_at_two_priorities_is_tracked_twice() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(2000, 7);
    let base = write_container(dir.path(), "twice", WriterSettings::default(), &[(chunk(1), data.clone())]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    engine.resolve(IoRequest::new(chunk(1)).with_priority(Priority::Low)).unwrap();
    engine.resolve(IoRequest::new(chunk(1)).with_priority(Priority::High)).unwrap();
    let done = drain(&engine, 2);
    assert!(done.iter().all(|c| c.data() == Some(&data[..])));
    assert_eq!(engine.stats().reads_started, 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: one buffer, one scratch context
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_tiny_pools_apply_back_pressure() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let chunks: Vec<_> = (0..4).map(|i| (chunk(i), sample_data(40 * KB, 10 + i as u8))).collect();
    // 8 KiB blocks over 4 KiB raw reads: every block spans several reads.
    let base = write_container(
        dir.path(),
        "tiny",
        WriterSettings::default().with_block_size(8192),
        &chunks,
    );

    for scheduling in [iostore::Scheduling::Cooperative, iostore::Scheduling::Threaded { decompression_workers: 1 }] {
        let config = EngineConfig {
            buffer_memory: 4 * KB,
            decompression_contexts: 1,
            scheduling,
            ..small_config()
        };
        let engine = Engine::new(config).unwrap();
        engine.mount(&base, 0).unwrap();
        let mut expected = std::collections::HashMap::new();
        for (id, data) in &chunks {
            expected.insert(engine.resolve(IoRequest::new(*id)).unwrap(), data.clone());
        }
        for completed in drain(&engine, expected.len()) {
            assert_eq!(completed.data().unwrap(), &expected[&completed.id][..]);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: partially used raw blocks are cached
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cache_serves_repeated_partial_reads() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(16 * KB, 8);
    let base = write_container(dir.path(), "cache", WriterSettings::default().with_block_size(1024), &[(chunk(1), data.clone())]);
    let config = EngineConfig { cache_memory: 32 * KB, ..small_config() };
    let engine = Engine::new(config).unwrap();
    engine.mount(&base, 0).unwrap();

    let first = read(&engine, chunk(1), ReadOptions::range(5000, 100)).unwrap();
    let second = read(&engine, chunk(1), ReadOptions::range(6000, 100)).unwrap();
    assert_eq!(first, &data[5000..5100]);
    assert_eq!(second, &data[6000..6100]);

    let stats = engine.stats();
    assert_eq!(stats.cache_stores, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.reads_started, 1);
}

#[test]
fn test_fully_used_blocks_skip_the_cache() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(8 * KB, 9);
    let base = write_container(dir.path(), "full", WriterSettings::default().with_block_size(1024), &[(chunk(1), data.clone())]);
    let config = EngineConfig { cache_memory: 32 * KB, ..small_config() };
    let engine = Engine::new(config).unwrap();
    engine.mount(&base, 0).unwrap();

    assert_eq!(read_all(&engine, chunk(1)).unwrap(), data);
    assert_eq!(read_all(&engine, chunk(1)).unwrap(), data);
    let stats = engine.stats();
    assert_eq!(stats.cache_stores, 0);
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.reads_started, 4);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: the service thread shuts down cleanly
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_threaded_engine_drops_with_reads_in_flight() {
    let dir = TempDir::new().unwrap();
    let base = write_container(
        dir.path(),
        "drop",
        WriterSettings::default().with_block_size(1024).with_method(CompressionMethod::Lz4),
        &[(chunk(1), sample_data(64 * KB, 1))],
    );
    let engine = Engine::new(threaded_config(2)).unwrap();
    engine.mount(&base, 0).unwrap();
    for _ in 0..10 {
        engine.resolve(IoRequest::new(chunk(1))).unwrap();
    }
    drop(engine);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: raising a request's priority reorders its queued reads
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_raised_priority_overtakes_queued_reads() {
    init_logging();
    let dir = TempDir::new().unwrap();
    // Three chunks of two 4 KiB raw reads each: chunk n starts at n * 8 KiB.
    let chunks: Vec<_> = (0..3).map(|i| (chunk(i), sample_data(8 * KB, 30 + i as u8))).collect();
    let base = write_container(dir.path(), "raise", WriterSettings::default().with_block_size(4096), &chunks);

    let (backend, log) = RecordingBackend::new();
    let engine = Engine::with_backend(small_config(), Box::new(backend)).unwrap();
    engine.mount(&base, 0).unwrap();

    engine.resolve(IoRequest::new(chunk(0)).with_priority(Priority::Medium)).unwrap();
    engine.resolve(IoRequest::new(chunk(1)).with_priority(Priority::Medium)).unwrap();
    let late = engine.resolve(IoRequest::new(chunk(2)).with_priority(Priority::Low)).unwrap();
    engine.update_priority(late, Priority::High);
    // Lowering is ignored.
    engine.update_priority(late, Priority::Min);

    let done = by_id(drain(&engine, 3));
    assert_eq!(done[&late].data().unwrap(), &chunks[2].1[..]);

    let log = log.lock().unwrap();
    let offsets: Vec<u64> = log.reads.iter().map(|(_, offset)| *offset).collect();
    assert_eq!(offsets, [16 * KB as u64, 20 * KB as u64, 0, 4 * KB as u64, 8 * KB as u64, 12 * KB as u64]);
    assert_eq!(log.reads[0].0, Priority::High);
    assert_eq!(log.reads[2].0, Priority::Medium);
    assert_eq!(log.hints.first(), Some(&IoPriorityHint::Max));
}

#[test]
fn test_priority_update_after_completion_is_ignored() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(3000, 12);
    let base = write_container(dir.path(), "finished", WriterSettings::default(), &[(chunk(1), data.clone())]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    let id = engine.resolve(IoRequest::new(chunk(1))).unwrap();
    let done = drain(&engine, 1);
    assert_eq!(done[0].id, id);
    engine.update_priority(id, Priority::Max);
    engine.flush_reads();
    assert!(engine.get_completed_requests().is_empty());
    assert_eq!(engine.stats().reads_started, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: a cache hit seen when a read is queued survives until it starts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_queued_cache_hit_is_not_evicted() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let data = sample_data(8 * KB, 13);
    let base = write_container(dir.path(), "pinned", WriterSettings::default().with_block_size(1024), &[(chunk(1), data.clone())]);
    // One read buffer and one cached raw block.
    let config = EngineConfig { buffer_memory: 4 * KB, cache_memory: 4 * KB, ..small_config() };
    let engine = Engine::new(config).unwrap();
    engine.mount(&base, 0).unwrap();

    // Leaves raw block 0 in the cache.
    assert_eq!(read(&engine, chunk(1), ReadOptions::range(0, 100)).unwrap(), &data[..100]);
    assert_eq!(engine.stats().cache_stores, 1);

    // The High read of raw block 1 takes the only buffer first and then
    // tries to cache its block, while the Low read waits for the buffer.
    let low = engine
        .resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(10, 100)).with_priority(Priority::Low))
        .unwrap();
    let high = engine
        .resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(4096, 100)).with_priority(Priority::High))
        .unwrap();
    let done = by_id(drain(&engine, 2));
    assert_eq!(done[&low].data().unwrap(), &data[10..110]);
    assert_eq!(done[&high].data().unwrap(), &data[4096..4196]);

    let stats = engine.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_stores, 1);
    assert_eq!(stats.reads_started, 2);
}
