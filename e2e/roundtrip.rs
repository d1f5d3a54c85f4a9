//! E2E Test Suite 01: Round Trip
//!
//! Writes containers with every storage option, mounts them and reads chunks
//! back through the full pipeline: resolution, raw reads, assembly, decode
//! and scatter.

mod common;

use common::*;
use iostore::crypto::AES_KEY_SIZE;
use iostore::{
    AesKey, CompressionMethod, Engine, IoRequest, IoStoreError, KeyGuid, Priority, ReadOptions, WriterSettings,
};
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: stored chunk, assorted sub-ranges
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_stored_chunk_sub_ranges() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let data = sample_data(10_000, 3);
    let base = write_container(
        dir.path(),
        "stored",
        WriterSettings::default().with_block_size(1024),
        &[(chunk(1), data.clone())],
    );

    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    for offset in [0u64, 1, 1023, 1024, 4095, 4096, 5000, 9999] {
        for size in [1u64, 100, 2048, 5000, u64::MAX] {
            let got = read(&engine, chunk(1), ReadOptions::range(offset, size)).unwrap();
            let end = (offset + size.min(10_000 - offset)) as usize;
            assert_eq!(got, &data[offset as usize..end], "offset {} size {}", offset, size);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: every method / encryption / signature combination, both schedulers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_all_storage_options_round_trip() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let guid = KeyGuid([9; 16]);
    let key = AesKey([0x5A; AES_KEY_SIZE]);
    let chunks = vec![
        (chunk(1), sample_data(30_000, 1)),
        (chunk(2), sample_data(777, 2)),
        (chunk(3), sample_data(4096, 3)),
    ];

    let mut n = 0;
    for method in CompressionMethod::ALL {
        for encrypted in [false, true] {
            for signed in [false, true] {
                let mut settings = WriterSettings::default().with_block_size(2048).with_method(method);
                if encrypted {
                    settings = settings.with_encryption(guid, key);
                }
                if signed {
                    settings = settings.signed();
                }
                n += 1;
                let base = write_container(dir.path(), &format!("c{}", n), settings, &chunks);

                for config in [small_config(), threaded_config(2)] {
                    let engine = Engine::new(config).unwrap();
                    engine.register_encryption_key(guid, key);
                    engine.mount(&base, 0).unwrap();
                    for (id, data) in &chunks {
                        let got = read_all(&engine, *id).unwrap();
                        assert_eq!(&got, data, "{} encrypted={} signed={} chunk {}", method, encrypted, signed, id);
                    }
                    assert_eq!(engine.stats().signature_errors, 0);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: many requests in flight at once
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_batch_of_requests_threaded() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let chunks: Vec<_> = (0..20).map(|i| (chunk(i), sample_data(3000 + 811 * i as usize, i as u8))).collect();
    let base = write_container(
        dir.path(),
        "batch",
        WriterSettings::default().with_block_size(1024).with_method(CompressionMethod::Lz4),
        &chunks,
    );

    let engine = Engine::new(threaded_config(3)).unwrap();
    engine.mount(&base, 0).unwrap();

    let mut expected = std::collections::HashMap::new();
    for (i, (id, data)) in chunks.iter().enumerate() {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let offset = (i * 37) as u64;
        let request = engine
            .resolve(IoRequest::new(*id).with_priority(priority).with_options(ReadOptions::range(offset, 2500)))
            .unwrap();
        expected.insert(request, data[offset as usize..offset as usize + 2500].to_vec());
    }

    let done = drain(&engine, expected.len());
    for completed in done {
        assert_eq!(completed.data().unwrap(), &expected[&completed.id][..]);
    }
    let stats = engine.stats();
    assert_eq!(stats.requests_completed, 20);
    assert!(stats.blocks_decoded_async > 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: caller-provided targets and clamping
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_target_buffer_is_filled_in_place() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(5000, 4);
    let base = write_container(dir.path(), "target", WriterSettings::default().with_block_size(1024), &[(chunk(1), data.clone())]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    let target = vec![0xEE; 110];
    engine
        .resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(1000, 100).with_target(target)))
        .unwrap();
    let done = drain(&engine, 1).pop().unwrap();
    let buf = done.result.unwrap();
    assert_eq!(buf.len(), 110);
    assert_eq!(&buf[..100], &data[1000..1100]);
    assert!(buf[100..].iter().all(|&b| b == 0xEE));
}

#[test]
fn test_short_target_is_invalid() {
    let dir = TempDir::new().unwrap();
    let base = write_container(dir.path(), "short", WriterSettings::default(), &[(chunk(1), sample_data(500, 1))]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    let err = engine
        .resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::new().with_target(vec![0; 10])))
        .unwrap_err();
    assert!(matches!(err, IoStoreError::InvalidParameter(_)));
}

#[test]
fn test_range_past_end_completes_empty() {
    let dir = TempDir::new().unwrap();
    let base = write_container(dir.path(), "clamp", WriterSettings::default(), &[(chunk(1), sample_data(500, 1))]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    let request = engine.resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(600, 10))).unwrap();
    // Visible without pumping.
    let done = engine.get_completed_requests();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, request);
    assert_eq!(done[0].size, 0);
    assert_eq!(done[0].data().unwrap(), b"");
    assert_eq!(engine.stats().reads_started, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: resolution across mounts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_lookup_helpers() {
    let dir = TempDir::new().unwrap();
    let base = write_container(dir.path(), "lookup", WriterSettings::default(), &[(chunk(1), sample_data(1234, 1))]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    assert!(engine.does_chunk_exist(&chunk(1)));
    assert!(!engine.does_chunk_exist(&chunk(2)));
    assert_eq!(engine.get_size_for_chunk(&chunk(1)), Some(1234));
    assert_eq!(engine.get_size_for_chunk(&chunk(2)), None);
    let err = engine.resolve(IoRequest::new(chunk(2))).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_higher_order_container_shadows_lower() {
    let dir = TempDir::new().unwrap();
    let base_a = write_container(dir.path(), "a", WriterSettings::default(), &[(chunk(1), b"from a".to_vec())]);
    let base_b = write_container(dir.path(), "b", WriterSettings::default(), &[(chunk(1), b"from b".to_vec())]);
    let base_c = write_container(
        dir.path(),
        "c",
        WriterSettings::default(),
        &[(chunk(1), b"from c".to_vec()), (chunk(2), b"only c".to_vec())],
    );

    let engine = Engine::new(small_config()).unwrap();
    let a = engine.mount(&base_a, 10).unwrap();
    let b = engine.mount(&base_b, 10).unwrap();
    let c = engine.mount(&base_c, 0).unwrap();

    // Equal order: the later mount wins.
    assert_eq!(engine.mounted_containers(), vec![b, a, c]);
    assert_eq!(read_all(&engine, chunk(1)).unwrap(), b"from b");
    assert_eq!(read_all(&engine, chunk(2)).unwrap(), b"only c");
}
