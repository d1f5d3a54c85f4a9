// ContainerWriter: the files it produces, read back through the TOC codec.

use std::fs;

use super::{build, id};
use iostore::codec::CompressionMethod;
use iostore::container::{container_paths, ContainerWriter, WriterSettings};
use iostore::crypto::{decrypt_in_place, sign_block, AesKey};
use iostore::toc::TocResource;
use iostore::{IoStoreError, KeyGuid};

#[test]
fn writes_toc_and_data_side_by_side() {
    let dir = tempfile::tempdir().unwrap();
    let base = build(dir.path(), "pair", WriterSettings::default(), &[(1, b"hello".to_vec())]);
    let (toc, data) = container_paths(&base);
    assert!(toc.exists());
    assert_eq!(fs::read(&data).unwrap(), b"hello\0\0\0\0\0\0\0\0\0\0\0");
}

#[test]
fn stored_blocks_decode_from_data_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let settings = WriterSettings::default().with_block_size(1024).with_method(CompressionMethod::Lz4);
    let base = build(dir.path(), "lz4", settings, &[(1, payload.clone())]);
    let (toc_path, data_path) = container_paths(&base);
    let toc = TocResource::read_file(&toc_path).unwrap();
    let data = fs::read(data_path).unwrap();

    let mut rebuilt = Vec::new();
    for block in &toc.blocks {
        let start = block.offset as usize;
        let stored = &data[start..start + block.compressed_size as usize];
        let mut out = vec![0u8; block.uncompressed_size as usize];
        toc.method_of(block).decompress(stored, &mut out).unwrap();
        rebuilt.extend_from_slice(&out);
    }
    assert_eq!(rebuilt, payload);
}

#[test]
fn encrypted_signed_blocks_verify_and_decrypt() {
    let dir = tempfile::tempdir().unwrap();
    let key = AesKey([0x42; 32]);
    let settings = WriterSettings::default()
        .with_block_size(128)
        .with_encryption(KeyGuid([7; 16]), key)
        .signed();
    let payload = vec![0x33u8; 300];
    let base = build(dir.path(), "secure", settings, &[(1, payload.clone())]);
    let (toc_path, data_path) = container_paths(&base);
    let toc = TocResource::read_file(&toc_path).unwrap();
    let data = fs::read(data_path).unwrap();

    let mut rebuilt = Vec::new();
    for (block, signature) in toc.blocks.iter().zip(&toc.signatures) {
        let span = &data[block.offset as usize..(block.offset + block.raw_size()) as usize];
        assert_eq!(&sign_block(span), signature);
        let mut plain = span.to_vec();
        decrypt_in_place(&mut plain, &key).unwrap();
        rebuilt.extend_from_slice(&plain[..block.uncompressed_size as usize]);
    }
    assert_eq!(rebuilt, payload);
}

#[test]
fn empty_chunk_has_no_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let base = build(dir.path(), "empty", WriterSettings::default(), &[(1, Vec::new()), (2, vec![1, 2, 3])]);
    let toc = TocResource::read_file(&base.with_extension("toc")).unwrap();
    assert_eq!(toc.chunks[0].length, 0);
    assert_eq!(toc.chunks[1].offset, 0);
    assert_eq!(toc.blocks.len(), 1);
}

#[test]
fn duplicate_ids_rejected() {
    let mut writer = ContainerWriter::new(WriterSettings::default()).unwrap();
    writer.add_chunk(id(1), vec![1]).unwrap();
    assert!(matches!(writer.add_chunk(id(1), vec![2]), Err(IoStoreError::InvalidParameter(_))));
}

#[test]
fn non_power_of_two_alignment_rejected() {
    let settings = WriterSettings::default().with_mapping_alignment(3000);
    assert!(matches!(ContainerWriter::new(settings), Err(IoStoreError::InvalidParameter(_))));
}
