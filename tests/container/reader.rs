// ContainerReader: mount-time validation and TOC queries.
//
// Coverage:
//   - open() exposes the chunk table, block table and flags written
//   - resolve() returns logical (offset, length); unknown ids are None
//   - signatures are only present for signed containers
//   - a TOC whose chunk range exceeds the logical size is CorruptToc
//   - a TOC whose block lies past the end of the data file is CorruptToc
//   - a garbled TOC body fails its checksum

use std::fs;

use super::{build, id};
use iostore::codec::CompressionMethod;
use iostore::container::{ContainerReader, WriterSettings};
use iostore::toc::TocResource;
use iostore::{ContainerId, IoStoreError, KeyGuid};
use iostore::crypto::AesKey;

#[test]
fn open_exposes_written_layout() {
    let dir = tempfile::tempdir().unwrap();
    let settings = WriterSettings::default().with_block_size(256).with_method(CompressionMethod::Zlib);
    let base = build(dir.path(), "layout", settings, &[(1, vec![b'a'; 1000]), (2, vec![b'b'; 10])]);

    let reader = ContainerReader::open(&base, ContainerId(3), 7).unwrap();
    assert_eq!(reader.id(), ContainerId(3));
    assert_eq!(reader.order(), 7);
    assert_eq!(reader.chunk_count(), 2);
    assert_eq!(reader.block_size(), 256);
    // 1000 bytes take four blocks; the next chunk starts on the fifth.
    assert_eq!(reader.resolve(&id(1)), Some((0, 1000)));
    assert_eq!(reader.resolve(&id(2)), Some((1024, 10)));
    assert_eq!(reader.resolve(&id(3)), None);
    assert_eq!(reader.block_count(), 5);
    assert_eq!(reader.logical_size(), 1034);
    assert!(reader.flags().is_compressed());
    assert!(!reader.is_encrypted());
    assert!(!reader.is_signed());
    assert!(reader.signature(0).is_none());

    let first = *reader.block(0).unwrap();
    assert_eq!(reader.method_of(&first), CompressionMethod::Zlib);
    assert!(reader.block(5).is_none());
}

#[test]
fn signed_encrypted_container_reports_key_and_signatures() {
    let dir = tempfile::tempdir().unwrap();
    let guid = KeyGuid([0x11; 16]);
    let settings = WriterSettings::default().with_block_size(64).with_encryption(guid, AesKey([1; 32])).signed();
    let base = build(dir.path(), "secure", settings, &[(1, vec![5u8; 200])]);

    let reader = ContainerReader::open(&base, ContainerId(0), 0).unwrap();
    assert!(reader.is_encrypted());
    assert!(reader.is_signed());
    assert_eq!(reader.key_guid(), guid);
    assert_eq!(reader.block_count(), 4);
    assert!((0..4).all(|i| reader.signature(i).is_some()));
}

#[test]
fn chunk_outside_logical_size_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let base = build(dir.path(), "oob", WriterSettings::default(), &[(1, vec![0u8; 100])]);
    let toc_path = base.with_extension("toc");
    let mut toc = TocResource::read_file(&toc_path).unwrap();
    toc.chunks[0].offset = 50;
    fs::write(&toc_path, toc.to_bytes().unwrap()).unwrap();

    let err = ContainerReader::open(&base, ContainerId(0), 0).unwrap_err();
    assert!(matches!(err, IoStoreError::CorruptToc(_)), "{}", err);
}

#[test]
fn block_past_data_file_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let base = build(dir.path(), "short", WriterSettings::default(), &[(1, vec![0u8; 100])]);
    let toc_path = base.with_extension("toc");
    let mut toc = TocResource::read_file(&toc_path).unwrap();
    toc.blocks[0].offset = 4096;
    fs::write(&toc_path, toc.to_bytes().unwrap()).unwrap();

    let err = ContainerReader::open(&base, ContainerId(0), 0).unwrap_err();
    assert!(matches!(err, IoStoreError::CorruptToc(_)), "{}", err);
}

#[test]
fn garbled_toc_body_fails_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let base = build(dir.path(), "garbled", WriterSettings::default(), &[(1, vec![0u8; 100])]);
    let toc_path = base.with_extension("toc");
    let mut bytes = fs::read(&toc_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x40;
    fs::write(&toc_path, bytes).unwrap();

    let err = ContainerReader::open(&base, ContainerId(0), 0).unwrap_err();
    assert!(matches!(err, IoStoreError::CorruptToc(_)), "{}", err);
}
