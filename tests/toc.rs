// Integration tests for src/toc: the on-disk TOC format.
//
// Coverage:
//   - header field offsets match the documented layout
//   - bad magic, version, header size and flags are CorruptToc
//   - an unknown compression method name is CorruptToc
//   - packed block entries keep 40/24/24/8-bit fields
//   - method names are case-insensitive on read
//   - a block a chunk runs through must be full; empty stored blocks are CorruptToc

use iostore::codec::CompressionMethod;
use iostore::toc::header::{read_le32, read_le64, write_le32};
use iostore::toc::{
    ChunkEntry, CompressionBlockEntry, ContainerFlags, TocResource, BLOCK_ENTRY_SIZE, METHOD_NAME_SIZE,
    TOC_HEADER_SIZE, TOC_MAGIC, TOC_VERSION,
};
use iostore::xxhash::toc_checksum;
use iostore::{ChunkId, IoStoreError, KeyGuid};

fn sample() -> TocResource {
    TocResource {
        chunks: vec![ChunkEntry { id: ChunkId::from_u64(0xABCD, 2), offset: 0, length: 300 }],
        blocks: vec![
            CompressionBlockEntry { offset: 0, compressed_size: 90, uncompressed_size: 256, method_index: 1 },
            CompressionBlockEntry { offset: 96, compressed_size: 44, uncompressed_size: 44, method_index: 0 },
        ],
        methods: vec![CompressionMethod::None, CompressionMethod::Zlib],
        signatures: Vec::new(),
        block_size: 256,
        flags: ContainerFlags::COMPRESSED | ContainerFlags::ENCRYPTED,
        key_guid: KeyGuid([0x5C; 16]),
        logical_size: 300,
    }
}

fn expect_corrupt(bytes: &[u8]) {
    match TocResource::parse(bytes) {
        Err(IoStoreError::CorruptToc(_)) => {}
        other => panic!("expected CorruptToc, got {:?}", other.map(|t| t.chunks.len())),
    }
}

/// Rewrites the body checksum after a body edit.
fn reseal(bytes: &mut [u8]) {
    let sum = toc_checksum(&bytes[TOC_HEADER_SIZE..]);
    bytes[64..72].copy_from_slice(&sum.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Header layout
// ---------------------------------------------------------------------------

#[test]
fn header_fields_at_documented_offsets() {
    let bytes = sample().to_bytes().unwrap();
    assert_eq!(&bytes[..8], &TOC_MAGIC);
    assert_eq!(read_le32(&bytes, 8), TOC_VERSION);
    assert_eq!(read_le32(&bytes, 12), TOC_HEADER_SIZE as u32);
    assert_eq!(read_le32(&bytes, 16), 1);
    assert_eq!(read_le32(&bytes, 20), 2);
    assert_eq!(read_le32(&bytes, 24), 256);
    assert_eq!(read_le32(&bytes, 28), 1);
    assert_eq!(read_le32(&bytes, 32), 1 | 2);
    assert_eq!(read_le64(&bytes, 40), 300);
    assert_eq!(&bytes[48..64], &[0x5C; 16]);
    assert_eq!(read_le64(&bytes, 64), toc_checksum(&bytes[TOC_HEADER_SIZE..]));
    assert_eq!(bytes.len(), TOC_HEADER_SIZE + 12 + 16 + 2 * BLOCK_ENTRY_SIZE + METHOD_NAME_SIZE);
}

#[test]
fn bad_magic_is_corrupt() {
    let mut bytes = sample().to_bytes().unwrap();
    bytes[0] = b'+';
    expect_corrupt(&bytes);
}

#[test]
fn unsupported_version_is_corrupt() {
    let mut bytes = sample().to_bytes().unwrap();
    write_le32(&mut bytes, 8, TOC_VERSION + 1);
    expect_corrupt(&bytes);
}

#[test]
fn wrong_header_size_is_corrupt() {
    let mut bytes = sample().to_bytes().unwrap();
    write_le32(&mut bytes, 12, 64);
    expect_corrupt(&bytes);
}

#[test]
fn unknown_flags_are_corrupt() {
    let mut bytes = sample().to_bytes().unwrap();
    write_le32(&mut bytes, 32, 0x80);
    expect_corrupt(&bytes);
}

#[test]
fn truncated_header_is_corrupt() {
    let bytes = sample().to_bytes().unwrap();
    expect_corrupt(&bytes[..TOC_HEADER_SIZE - 1]);
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

#[test]
fn unknown_method_name_is_corrupt() {
    let mut bytes = sample().to_bytes().unwrap();
    let name_at = bytes.len() - METHOD_NAME_SIZE;
    bytes[name_at..name_at + 4].copy_from_slice(b"Zstd");
    reseal(&mut bytes);
    expect_corrupt(&bytes);
}

#[test]
fn method_names_ignore_case() {
    let mut bytes = sample().to_bytes().unwrap();
    let name_at = bytes.len() - METHOD_NAME_SIZE;
    bytes[name_at..name_at + 4].copy_from_slice(b"ZLIB");
    reseal(&mut bytes);
    let toc = TocResource::parse(&bytes).unwrap();
    assert_eq!(toc.methods, vec![CompressionMethod::None, CompressionMethod::Zlib]);
}

#[test]
fn method_index_out_of_table_is_corrupt() {
    let mut toc = sample();
    toc.blocks[1].method_index = 2;
    expect_corrupt(&toc.to_bytes().unwrap());
}

#[test]
fn logical_size_beyond_blocks_is_corrupt() {
    let mut toc = sample();
    toc.logical_size = 513;
    expect_corrupt(&toc.to_bytes().unwrap());
}

#[test]
fn packed_entry_field_widths() {
    let entry = CompressionBlockEntry {
        offset: (1 << 40) - 1,
        compressed_size: (1 << 24) - 1,
        uncompressed_size: 1,
        method_index: 255,
    };
    assert!(entry.is_encodable());
    assert_eq!(CompressionBlockEntry::decode(&entry.encode()), entry);

    let too_far = CompressionBlockEntry { offset: 1 << 40, ..entry };
    assert!(!too_far.is_encodable());
    let mut toc = sample();
    toc.blocks[0] = too_far;
    assert!(matches!(toc.to_bytes(), Err(IoStoreError::InvalidParameter(_))));
}

#[test]
fn signed_toc_requires_one_signature_per_block() {
    let mut toc = sample();
    toc.flags.insert(ContainerFlags::SIGNED);
    assert!(toc.to_bytes().is_err());
    toc.signatures = vec![[7; 32], [8; 32]];
    let parsed = TocResource::parse(&toc.to_bytes().unwrap()).unwrap();
    assert_eq!(parsed.signatures, toc.signatures);
}

// ---------------------------------------------------------------------------
// Block coverage
// ---------------------------------------------------------------------------

/// Two stored 512-byte blocks in a 1 KiB block grid, with a chunk that runs
/// from the first into the second.
fn short_leading_block() -> TocResource {
    TocResource {
        chunks: vec![ChunkEntry { id: ChunkId::from_u64(7, 0), offset: 0, length: 1500 }],
        blocks: vec![
            CompressionBlockEntry { offset: 0, compressed_size: 512, uncompressed_size: 512, method_index: 0 },
            CompressionBlockEntry { offset: 512, compressed_size: 1024, uncompressed_size: 1024, method_index: 0 },
        ],
        methods: vec![CompressionMethod::None],
        signatures: Vec::new(),
        block_size: 1024,
        flags: ContainerFlags::NONE,
        key_guid: KeyGuid::default(),
        logical_size: 2048,
    }
}

#[test]
fn short_block_inside_a_chunk_is_corrupt() {
    expect_corrupt(&short_leading_block().to_bytes().unwrap());
}

#[test]
fn short_block_at_chunk_end_is_accepted() {
    // Chunks start on block boundaries, so a chunk's last block may be short.
    let mut toc = short_leading_block();
    toc.chunks = vec![
        ChunkEntry { id: ChunkId::from_u64(7, 0), offset: 0, length: 512 },
        ChunkEntry { id: ChunkId::from_u64(8, 0), offset: 1024, length: 1000 },
    ];
    let parsed = TocResource::parse(&toc.to_bytes().unwrap()).unwrap();
    assert_eq!(parsed.chunks.len(), 2);

    // One byte past what block 1 holds.
    toc.chunks[1].length = 1024;
    toc.blocks[1].uncompressed_size = 1023;
    expect_corrupt(&toc.to_bytes().unwrap());
}

#[test]
fn block_without_stored_bytes_is_corrupt() {
    let mut toc = sample();
    toc.blocks[1].compressed_size = 0;
    expect_corrupt(&toc.to_bytes().unwrap());
}
