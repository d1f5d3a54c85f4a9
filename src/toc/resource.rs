//! Whole-file TOC encode/decode and validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::codec::CompressionMethod;
use crate::crypto::{BlockSignature, SIGNATURE_SIZE};
use crate::error::{IoStoreError, Result};
use crate::toc::block_entry::{CompressionBlockEntry, BLOCK_ENTRY_SIZE};
use crate::toc::header::{read_le64, ContainerFlags, TocHeader, TOC_HEADER_SIZE};
use crate::types::{ChunkId, KeyGuid, CHUNK_ID_SIZE};
use crate::xxhash::toc_checksum;

/// Width of one NUL-padded method name.
pub const METHOD_NAME_SIZE: usize = 32;

const CHUNK_RANGE_SIZE: usize = 16;

/// Logical placement of one chunk inside its container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkEntry {
    pub id: ChunkId,
    pub offset: u64,
    pub length: u64,
}

/// Decoded table of contents of one container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TocResource {
    pub chunks: Vec<ChunkEntry>,
    pub blocks: Vec<CompressionBlockEntry>,
    /// Method table; slot 0 is always [`CompressionMethod::None`].
    pub methods: Vec<CompressionMethod>,
    /// One entry per block when the container is signed, empty otherwise.
    pub signatures: Vec<BlockSignature>,
    pub block_size: u32,
    pub flags: ContainerFlags,
    pub key_guid: KeyGuid,
    pub logical_size: u64,
}

fn corrupt(msg: impl Into<String>) -> IoStoreError {
    IoStoreError::CorruptToc(msg.into())
}

impl TocResource {
    /// Reads and parses a TOC file. An unreadable file is `FileOpenFailed`.
    pub fn read_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| IoStoreError::FileOpenFailed(format!("{}: {}", path.display(), e)))?;
        Self::parse(&bytes)
    }

    /// Decodes a TOC and checks its internal consistency.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = TocHeader::read(bytes)?;
        let body = &bytes[TOC_HEADER_SIZE..];

        let entry_count = header.entry_count as usize;
        let block_count = header.block_count as usize;
        let method_count = header.method_count as usize;
        let signed = header.flags.is_signed();
        let expected = entry_count * (CHUNK_ID_SIZE + CHUNK_RANGE_SIZE)
            + block_count * BLOCK_ENTRY_SIZE
            + method_count * METHOD_NAME_SIZE
            + if signed { block_count * SIGNATURE_SIZE } else { 0 };
        if body.len() != expected {
            return Err(corrupt(format!("body is {} bytes, header implies {}", body.len(), expected)));
        }
        if toc_checksum(body) != header.body_checksum {
            return Err(corrupt("body checksum mismatch"));
        }

        let (ids, rest) = body.split_at(entry_count * CHUNK_ID_SIZE);
        let (ranges, rest) = rest.split_at(entry_count * CHUNK_RANGE_SIZE);
        let (entries, rest) = rest.split_at(block_count * BLOCK_ENTRY_SIZE);
        let (names, sigs) = rest.split_at(method_count * METHOD_NAME_SIZE);

        let chunks = ids
            .chunks_exact(CHUNK_ID_SIZE)
            .zip(ranges.chunks_exact(CHUNK_RANGE_SIZE))
            .map(|(id, range)| ChunkEntry {
                id: ChunkId::from_slice(id).unwrap_or_default(),
                offset: read_le64(range, 0),
                length: read_le64(range, 8),
            })
            .collect();

        let blocks = entries
            .chunks_exact(BLOCK_ENTRY_SIZE)
            .map(|raw| {
                let mut packed = [0u8; BLOCK_ENTRY_SIZE];
                packed.copy_from_slice(raw);
                CompressionBlockEntry::decode(&packed)
            })
            .collect();

        let mut methods = vec![CompressionMethod::None];
        for raw in names.chunks_exact(METHOD_NAME_SIZE) {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let name = std::str::from_utf8(&raw[..end]).map_err(|_| corrupt("method name is not UTF-8"))?;
            let method = CompressionMethod::from_name(name)
                .ok_or_else(|| corrupt(format!("unknown compression method '{}'", name)))?;
            methods.push(method);
        }

        let signatures = sigs
            .chunks_exact(SIGNATURE_SIZE)
            .map(|raw| {
                let mut sig = [0u8; SIGNATURE_SIZE];
                sig.copy_from_slice(raw);
                sig
            })
            .collect();

        let toc = TocResource {
            chunks,
            blocks,
            methods,
            signatures,
            block_size: header.block_size,
            flags: header.flags,
            key_guid: header.key_guid,
            logical_size: header.logical_size,
        };
        toc.check_layout()?;
        Ok(toc)
    }

    fn check_layout(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(corrupt("compression block size is zero"));
        }
        let addressable = self.blocks.len() as u64 * self.block_size as u64;
        if self.logical_size > addressable {
            return Err(corrupt(format!(
                "logical size {} exceeds {} blocks of {} bytes",
                self.logical_size,
                self.blocks.len(),
                self.block_size
            )));
        }

        for (i, block) in self.blocks.iter().enumerate() {
            if block.uncompressed_size == 0 || block.uncompressed_size > self.block_size {
                return Err(corrupt(format!(
                    "block {} has uncompressed size {}",
                    i, block.uncompressed_size
                )));
            }
            if block.compressed_size == 0 {
                return Err(corrupt(format!("block {} has no stored bytes", i)));
            }
            if block.method_index as usize >= self.methods.len() {
                return Err(corrupt(format!("block {} uses method index {}", i, block.method_index)));
            }
        }

        let mut seen = HashSet::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            if !seen.insert(chunk.id) {
                return Err(corrupt(format!("duplicate chunk {}", chunk.id)));
            }
            let end = chunk.offset.checked_add(chunk.length);
            match end {
                Some(end) if end <= self.logical_size => self.check_chunk_coverage(chunk, end)?,
                _ => {
                    return Err(corrupt(format!(
                        "chunk {} [{}, +{}) exceeds container size {}",
                        chunk.id, chunk.offset, chunk.length, self.logical_size
                    )))
                }
            }
        }
        Ok(())
    }

    /// Every block a chunk runs through must be full; the block holding its
    /// last byte must reach that byte.
    fn check_chunk_coverage(&self, chunk: &ChunkEntry, end: u64) -> Result<()> {
        if chunk.length == 0 {
            return Ok(());
        }
        let block_size = self.block_size as u64;
        let first = chunk.offset / block_size;
        let last = (end - 1) / block_size;
        for index in first..=last {
            let needed = if index == last { end - index * block_size } else { block_size };
            let have = self.blocks.get(index as usize).map_or(0, |b| b.uncompressed_size as u64);
            if have < needed {
                return Err(corrupt(format!(
                    "chunk {} needs {} bytes of block {}, which holds {}",
                    chunk.id, needed, index, have
                )));
            }
        }
        Ok(())
    }

    /// Checks every stored block against the size of the data file.
    pub fn validate_against(&self, data_file_size: u64) -> Result<()> {
        for (i, block) in self.blocks.iter().enumerate() {
            let end = block.offset.checked_add(block.raw_size());
            if end.map_or(true, |end| end > data_file_size) {
                return Err(corrupt(format!(
                    "block {} at {} (+{}) exceeds data file size {}",
                    i,
                    block.offset,
                    block.raw_size(),
                    data_file_size
                )));
            }
        }
        Ok(())
    }

    pub fn method_of(&self, block: &CompressionBlockEntry) -> CompressionMethod {
        self.methods
            .get(block.method_index as usize)
            .copied()
            .unwrap_or(CompressionMethod::None)
    }

    /// Serializes the TOC, computing header counts and the body checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.flags.is_signed() && self.signatures.len() != self.blocks.len() {
            return Err(IoStoreError::InvalidParameter(format!(
                "{} signatures for {} blocks",
                self.signatures.len(),
                self.blocks.len()
            )));
        }
        if self.methods.first() != Some(&CompressionMethod::None) {
            return Err(IoStoreError::InvalidParameter("method table must start with None".to_owned()));
        }
        if let Some(block) = self.blocks.iter().find(|b| !b.is_encodable()) {
            return Err(IoStoreError::InvalidParameter(format!("block entry {:?} does not fit", block)));
        }

        let mut body = Vec::new();
        for chunk in &self.chunks {
            body.extend_from_slice(chunk.id.as_bytes());
        }
        for chunk in &self.chunks {
            body.extend_from_slice(&chunk.offset.to_le_bytes());
            body.extend_from_slice(&chunk.length.to_le_bytes());
        }
        for block in &self.blocks {
            body.extend_from_slice(&block.encode());
        }
        for method in &self.methods[1..] {
            let mut name = [0u8; METHOD_NAME_SIZE];
            let bytes = method.name().as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            body.extend_from_slice(&name);
        }
        if self.flags.is_signed() {
            for sig in &self.signatures {
                body.extend_from_slice(sig);
            }
        }

        let header = TocHeader {
            entry_count: self.chunks.len() as u32,
            block_count: self.blocks.len() as u32,
            block_size: self.block_size,
            method_count: (self.methods.len() - 1) as u32,
            flags: self.flags,
            logical_size: self.logical_size,
            key_guid: self.key_guid,
            body_checksum: toc_checksum(&body),
        };
        let mut head = [0u8; TOC_HEADER_SIZE];
        header.write(&mut head);

        let mut out = Vec::with_capacity(TOC_HEADER_SIZE + body.len());
        out.extend_from_slice(&head);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TocResource {
        TocResource {
            chunks: vec![
                ChunkEntry { id: ChunkId::from_u64(1, 0), offset: 0, length: 100 },
                ChunkEntry { id: ChunkId::from_u64(2, 0), offset: 128, length: 50 },
            ],
            blocks: vec![
                CompressionBlockEntry { offset: 0, compressed_size: 60, uncompressed_size: 128, method_index: 1 },
                CompressionBlockEntry { offset: 64, compressed_size: 50, uncompressed_size: 50, method_index: 0 },
            ],
            methods: vec![CompressionMethod::None, CompressionMethod::Lz4],
            signatures: vec![[1; 32], [2; 32]],
            block_size: 128,
            flags: ContainerFlags::COMPRESSED | ContainerFlags::SIGNED,
            key_guid: KeyGuid::default(),
            logical_size: 178,
        }
    }

    #[test]
    fn parse_restores_serialized_toc() {
        let toc = sample();
        let bytes = toc.to_bytes().unwrap();
        let parsed = TocResource::parse(&bytes).unwrap();
        assert_eq!(parsed, toc);
        assert_eq!(parsed.method_of(&parsed.blocks[0]), CompressionMethod::Lz4);
    }

    #[test]
    fn chunk_past_logical_size_is_corrupt() {
        let mut toc = sample();
        toc.chunks[1].length = 51;
        let bytes = toc.to_bytes().unwrap();
        assert!(matches!(TocResource::parse(&bytes), Err(IoStoreError::CorruptToc(_))));
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let mut bytes = sample().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(TocResource::parse(&bytes), Err(IoStoreError::CorruptToc(_))));
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let bytes = sample().to_bytes().unwrap();
        assert!(TocResource::parse(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn duplicate_chunk_is_corrupt() {
        let mut toc = sample();
        toc.chunks[1].id = toc.chunks[0].id;
        assert!(TocResource::parse(&toc.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn zero_uncompressed_block_is_corrupt() {
        let mut toc = sample();
        toc.blocks[1].uncompressed_size = 0;
        assert!(TocResource::parse(&toc.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn empty_stored_block_is_corrupt() {
        let mut toc = sample();
        toc.blocks[0].compressed_size = 0;
        assert!(matches!(TocResource::parse(&toc.to_bytes().unwrap()), Err(IoStoreError::CorruptToc(_))));
    }

    #[test]
    fn short_block_inside_a_chunk_is_corrupt() {
        let mut toc = sample();
        // Chunk 1 now runs through block 0 into block 1.
        toc.chunks[0].length = 150;
        toc.chunks[1].offset = 150;
        toc.chunks[1].length = 28;
        toc.blocks[0].uncompressed_size = 100;
        let err = TocResource::parse(&toc.to_bytes().unwrap()).unwrap_err();
        assert!(err.to_string().contains("block 0"));

        toc.blocks[0].uncompressed_size = 128;
        assert!(TocResource::parse(&toc.to_bytes().unwrap()).is_ok());
    }

    #[test]
    fn block_past_data_file_is_corrupt() {
        let toc = sample();
        // Block 1 ends at 64 + align16(50) = 128.
        assert!(toc.validate_against(128).is_ok());
        assert!(matches!(toc.validate_against(127), Err(IoStoreError::CorruptToc(_))));
    }

    #[test]
    fn unknown_method_name_is_corrupt() {
        let mut bytes = sample().to_bytes().unwrap();
        // First method name follows the header, ids, ranges and block entries.
        let at = TOC_HEADER_SIZE + 2 * (CHUNK_ID_SIZE + CHUNK_RANGE_SIZE) + 2 * BLOCK_ENTRY_SIZE;
        bytes[at..at + 3].copy_from_slice(b"XYZ");
        let body_checksum = toc_checksum(&bytes[TOC_HEADER_SIZE..]);
        bytes[64..72].copy_from_slice(&body_checksum.to_le_bytes());
        let err = TocResource::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown compression method"));
    }

    #[test]
    fn signature_count_must_match() {
        let mut toc = sample();
        toc.signatures.pop();
        assert!(matches!(toc.to_bytes(), Err(IoStoreError::InvalidParameter(_))));
    }
}
