//! E2E Test Suite 04: Memory-Mapped Chunks
//!
//! `Engine::open_mapped` hands out zero-copy views of stored chunks and
//! refuses anything that would need decoding.

mod common;

use common::*;
use iostore::crypto::AES_KEY_SIZE;
use iostore::mapped::platform_mapping_alignment;
use iostore::{AesKey, CompressionMethod, Engine, EngineConfig, IoStoreError, KeyGuid, ReadOptions, WriterSettings};
use tempfile::TempDir;

#[test]
fn test_mapped_view_matches_stored_bytes() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let align = platform_mapping_alignment();
    let first = sample_data(1000, 1);
    let second = sample_data(10_000, 2);
    let base = write_container(
        dir.path(),
        "mapped",
        WriterSettings::default().with_block_size(4096).with_mapping_alignment(align),
        &[(chunk(1), first.clone()), (chunk(2), second.clone())],
    );

    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&base, 0).unwrap();

    let whole = engine.open_mapped(&chunk(2), &ReadOptions::new()).unwrap();
    assert_eq!(whole.file_offset() % align, 0);
    assert_eq!(&whole[..], &second[..]);

    let part = engine.open_mapped(&chunk(2), &ReadOptions::range(5000, 3000)).unwrap();
    assert_eq!(part.as_slice(), &second[5000..8000]);

    let small = engine.open_mapped(&chunk(1), &ReadOptions::range(10, 20)).unwrap();
    assert_eq!(small.as_ref(), &first[10..30]);

    // The view agrees with a read through the pipeline and issues no reads.
    let before = engine.stats().reads_started;
    let _again = engine.open_mapped(&chunk(2), &ReadOptions::new()).unwrap();
    assert_eq!(engine.stats().reads_started, before);
    assert_eq!(read_all(&engine, chunk(2)).unwrap(), &whole[..]);
}

#[test]
fn test_unaligned_chunk_is_rejected() {
    let dir = TempDir::new().unwrap();
    let base = write_container(
        dir.path(),
        "packed",
        WriterSettings::default().with_block_size(1024),
        &[(chunk(1), sample_data(1000, 1)), (chunk(2), sample_data(1000, 2))],
    );
    let config = EngineConfig { memory_mapping_alignment: 4096, ..small_config() };
    let engine = Engine::new(config).unwrap();
    engine.mount(&base, 0).unwrap();

    // The first chunk starts at offset zero; the second right after it.
    assert!(engine.open_mapped(&chunk(1), &ReadOptions::new()).is_ok());
    let err = engine.open_mapped(&chunk(2), &ReadOptions::new()).unwrap_err();
    assert!(matches!(err, IoStoreError::InvalidParameter(_)), "{}", err);
}

#[test]
fn test_mapping_refuses_decoded_or_invalid_requests() {
    let dir = TempDir::new().unwrap();
    let compressed = write_container(
        dir.path(),
        "zlib",
        WriterSettings::default().with_method(CompressionMethod::Zlib),
        &[(chunk(1), sample_data(20_000, 1))],
    );
    let encrypted = write_container(
        dir.path(),
        "aes",
        WriterSettings::default().with_encryption(KeyGuid([5; 16]), AesKey([6; AES_KEY_SIZE])),
        &[(chunk(2), sample_data(2000, 2))],
    );
    let stored = write_container(dir.path(), "plain", WriterSettings::default(), &[(chunk(3), sample_data(2000, 3))]);

    let engine = Engine::new(small_config()).unwrap();
    engine.mount(&compressed, 0).unwrap();
    engine.mount(&encrypted, 0).unwrap();
    engine.mount(&stored, 0).unwrap();

    let invalid = |r: Result<_, IoStoreError>| matches!(r, Err(IoStoreError::InvalidParameter(_)));
    assert!(invalid(engine.open_mapped(&chunk(1), &ReadOptions::new())));
    assert!(invalid(engine.open_mapped(&chunk(2), &ReadOptions::new())));
    assert!(invalid(engine.open_mapped(&chunk(3), &ReadOptions::new().with_target(vec![0; 2000]))));
    assert!(invalid(engine.open_mapped(&chunk(3), &ReadOptions::range(2000, 1))));
    assert!(matches!(engine.open_mapped(&chunk(4), &ReadOptions::new()), Err(IoStoreError::NotFound)));
}
