//! E2E Test Suite 03: Integrity
//!
//! Signature mismatches and their callback, late encryption keys, corrupt
//! or truncated containers and cache isolation between containers.

mod common;

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use common::*;
use iostore::config::KB;
use iostore::crypto::{sign_block, AES_KEY_SIZE};
use iostore::toc::TocResource;
use iostore::{
    AesKey, CompressionMethod, ContainerId, Engine, EngineConfig, IoRequest, IoStoreError, KeyGuid, ReadOptions,
    SignatureError, WriterSettings,
};
use tempfile::TempDir;

fn patch_file(path: &std::path::Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: signature mismatch is reported, the read still completes
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_signature_mismatch_is_reported_not_fatal() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let data = sample_data(4096, 1);
    let base = write_container(
        dir.path(),
        "signed",
        WriterSettings::default().with_block_size(1024).signed(),
        &[(chunk(1), data.clone())],
    );
    let flipped = data[1500] ^ 0xFF;
    patch_file(&base.with_extension("data"), 1500, &[flipped]);
    // Block 1 is stored at [1024, 2048).
    let recorded = TocResource::read_file(&base.with_extension("toc")).unwrap().signatures[1];
    let on_disk = sign_block(&fs::read(base.with_extension("data")).unwrap()[1024..2048]);
    assert_ne!(recorded, on_disk);

    for config in [small_config(), threaded_config(2)] {
        let engine = Engine::new(config).unwrap();
        let seen: Arc<Mutex<Vec<SignatureError>>> = Arc::default();
        let sink = Arc::clone(&seen);
        engine.on_signature_error(move |e| sink.lock().unwrap().push(e.clone()));
        let id = engine.mount(&base, 0).unwrap();

        let got = read_all(&engine, chunk(1)).unwrap();
        let mut expected = data.clone();
        expected[1500] = flipped;
        assert_eq!(got, expected);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].container, id);
        assert_eq!(seen[0].block_index, 1);
        assert_eq!(seen[0].expected, recorded);
        assert_eq!(seen[0].actual, on_disk);
        assert!(seen[0].to_string().contains("expected "));
        assert_eq!(engine.stats().signature_errors, 1);
    }
}

#[test]
fn test_signature_callback_may_call_into_engine() {
    let dir = TempDir::new().unwrap();
    let data = sample_data(2048, 2);
    let base = write_container(
        dir.path(),
        "reentrant",
        WriterSettings::default().with_block_size(1024).signed(),
        &[(chunk(1), data.clone())],
    );
    patch_file(&base.with_extension("data"), 10, &[data[10] ^ 1]);

    for config in [small_config(), threaded_config(1)] {
        let engine = Arc::new(Engine::new(config).unwrap());
        engine.mount(&base, 0).unwrap();
        let seen: Arc<Mutex<Vec<(usize, bool)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let weak = Arc::downgrade(&engine);
        engine.on_signature_error(move |_| {
            if let Some(engine) = weak.upgrade() {
                let deferred = engine.deferred_requests();
                sink.lock().unwrap().push((deferred, engine.does_chunk_exist(&chunk(1))));
            }
        });

        assert_eq!(read_all(&engine, chunk(1)).unwrap().len(), 2048);
        assert_eq!(*seen.lock().unwrap(), [(0, true)]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: reads wait for a late encryption key
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_reads_deferred_until_key_registered() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let guid = KeyGuid([0xAB; 16]);
    let key = AesKey([3; AES_KEY_SIZE]);
    let data = sample_data(9000, 2);
    let base = write_container(
        dir.path(),
        "encrypted",
        WriterSettings::default().with_block_size(2048).with_method(CompressionMethod::Lz4).with_encryption(guid, key),
        &[(chunk(1), data.clone())],
    );

    for config in [small_config(), threaded_config(2)] {
        let engine = Engine::new(config).unwrap();
        engine.mount(&base, 0).unwrap();

        let whole = engine.resolve(IoRequest::new(chunk(1))).unwrap();
        let part = engine.resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(3000, 10))).unwrap();
        engine.flush_reads();
        assert!(engine.get_completed_requests().is_empty());
        assert_eq!(engine.deferred_requests(), 2);
        assert_eq!(engine.stats().reads_started, 0);
        assert_eq!(engine.stats().requests_deferred, 2);

        engine.register_encryption_key(guid, key);
        let done = by_id(drain(&engine, 2));
        assert_eq!(done[&whole].data().unwrap(), &data[..]);
        assert_eq!(done[&part].data().unwrap(), &data[3000..3010]);
        assert_eq!(engine.deferred_requests(), 0);
    }
}

#[test]
fn test_key_registered_before_mount() {
    let dir = TempDir::new().unwrap();
    let guid = KeyGuid([1; 16]);
    let key = AesKey([2; AES_KEY_SIZE]);
    let data = sample_data(3000, 3);
    let base = write_container(
        dir.path(),
        "early",
        WriterSettings::default().with_encryption(guid, key),
        &[(chunk(1), data.clone())],
    );
    let engine = Engine::new(small_config()).unwrap();
    engine.register_encryption_key(guid, key);
    engine.mount(&base, 0).unwrap();
    assert_eq!(read_all(&engine, chunk(1)).unwrap(), data);
    assert_eq!(engine.stats().requests_deferred, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: a container that fails validation is never registered
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_chunk_past_container_size_fails_mount() {
    let dir = TempDir::new().unwrap();
    let base = write_container(dir.path(), "bounds", WriterSettings::default(), &[(chunk(1), sample_data(500, 1))]);
    let toc_path = base.with_extension("toc");
    let mut toc = TocResource::read_file(&toc_path).unwrap();
    toc.chunks[0].length += 10_000;
    fs::write(&toc_path, toc.to_bytes().unwrap()).unwrap();

    let engine = Engine::new(small_config()).unwrap();
    let err = engine.mount(&base, 0).unwrap_err();
    assert!(matches!(err, IoStoreError::CorruptToc(_)), "{}", err);
    assert!(engine.mounted_containers().is_empty());
    assert!(!engine.does_chunk_exist(&chunk(1)));
}

#[test]
fn test_short_block_inside_chunk_fails_mount() {
    let dir = TempDir::new().unwrap();
    let base = write_container(
        dir.path(),
        "short",
        WriterSettings::default().with_block_size(1024),
        &[(chunk(1), sample_data(1500, 5))],
    );
    // Block 0 claims only half of its logical span while the chunk runs on
    // into block 1.
    let toc_path = base.with_extension("toc");
    let mut toc = TocResource::read_file(&toc_path).unwrap();
    toc.blocks[0].compressed_size = 512;
    toc.blocks[0].uncompressed_size = 512;
    fs::write(&toc_path, toc.to_bytes().unwrap()).unwrap();

    let engine = Engine::new(small_config()).unwrap();
    let err = engine.mount(&base, 0).unwrap_err();
    assert!(matches!(err, IoStoreError::CorruptToc(_)), "{}", err);
    assert!(engine.mounted_containers().is_empty());
    assert!(matches!(engine.resolve(IoRequest::new(chunk(1))), Err(IoStoreError::NotFound)));
}

#[test]
fn test_truncated_data_file_fails_mount() {
    let dir = TempDir::new().unwrap();
    let good = write_container(dir.path(), "good", WriterSettings::default(), &[(chunk(7), sample_data(100, 7))]);
    let base = write_container(
        dir.path(),
        "truncated",
        WriterSettings::default().with_block_size(1024),
        &[(chunk(1), sample_data(5000, 1))],
    );
    OpenOptions::new().write(true).open(base.with_extension("data")).unwrap().set_len(2000).unwrap();

    let engine = Engine::new(small_config()).unwrap();
    assert!(matches!(engine.mount(&base, 0), Err(IoStoreError::CorruptToc(_))));
    // Other mounts are unaffected, and the failed one used no id.
    assert_eq!(engine.mount(&good, 0).unwrap(), ContainerId(0));
    assert!(engine.does_chunk_exist(&chunk(7)));
}

#[test]
fn test_missing_files_fail_to_open() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(small_config()).unwrap();
    assert!(matches!(engine.mount(dir.path().join("nothing"), 0), Err(IoStoreError::FileOpenFailed(_))));

    let base = write_container(dir.path(), "no_toc", WriterSettings::default(), &[(chunk(1), vec![1, 2, 3])]);
    fs::remove_file(base.with_extension("toc")).unwrap();
    assert!(matches!(engine.mount(&base, 0), Err(IoStoreError::FileOpenFailed(_))));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: failures after mount reach every dependent request
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_read_error_fails_request() {
    let dir = TempDir::new().unwrap();
    let base = write_container(dir.path(), "shrinks", WriterSettings::default(), &[(chunk(1), sample_data(3000, 1))]);
    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();
    OpenOptions::new().write(true).open(base.with_extension("data")).unwrap().set_len(0).unwrap();

    let err = read_all(&engine, chunk(1)).unwrap_err();
    let err = err.downcast::<IoStoreError>().unwrap();
    assert!(matches!(err, IoStoreError::ReadError(_)), "{}", err);
    let stats = engine.stats();
    assert_eq!(stats.reads_failed, 1);
    assert_eq!(stats.requests_failed, 1);
}

#[test]
fn test_corrupt_compressed_block_fails_decode() {
    let dir = TempDir::new().unwrap();
    let base = write_container(
        dir.path(),
        "garbled",
        WriterSettings::default().with_method(CompressionMethod::Zlib),
        &[(chunk(1), sample_data(20_000, 4))],
    );
    let toc = TocResource::read_file(&base.with_extension("toc")).unwrap();
    let block = toc.blocks[0];
    assert_eq!(block.method_index, 1, "sample data must compress");
    patch_file(&base.with_extension("data"), block.offset, &vec![0xFF; block.compressed_size as usize]);

    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();
    let a = engine.resolve(IoRequest::new(chunk(1))).unwrap();
    let b = engine.resolve(IoRequest::new(chunk(1)).with_options(ReadOptions::range(10, 10))).unwrap();
    let done = by_id(drain(&engine, 2));
    for id in [a, b] {
        assert!(matches!(done[&id].result, Err(IoStoreError::DecompressionFailed(_))));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: cache keys never alias across containers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cache_isolates_containers_with_aliasing_blocks() {
    let dir = TempDir::new().unwrap();
    let one = sample_data(16 * KB, 21);
    let two = sample_data(16 * KB, 22);
    assert_ne!(one, two);
    let settings = WriterSettings::default().with_block_size(1024);
    let base_one = write_container(dir.path(), "one", settings.clone(), &[(chunk(1), one.clone())]);
    let base_two = write_container(dir.path(), "two", settings, &[(chunk(2), two.clone())]);

    // Room for a single cached raw block, so the second container evicts the first.
    let config = EngineConfig { cache_memory: 4 * KB, ..small_config() };
    let engine = Engine::new(config).unwrap();
    engine.mount(&base_one, 0).unwrap();
    engine.mount(&base_two, 0).unwrap();

    for (offset, size) in [(5000u64, 100u64), (6000, 100), (4100, 50), (7000, 900)] {
        let range = offset as usize..(offset + size) as usize;
        assert_eq!(read(&engine, chunk(1), ReadOptions::range(offset, size)).unwrap(), &one[range.clone()]);
        assert_eq!(read(&engine, chunk(2), ReadOptions::range(offset, size)).unwrap(), &two[range]);
    }
    assert!(engine.stats().cache_stores >= 2);
}
