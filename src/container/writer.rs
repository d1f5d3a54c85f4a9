//! Builds container file pairs.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::CompressionMethod;
use crate::container::reader::container_paths;
use crate::crypto::{align_to_aes_block, encrypt_in_place, sign_block, AesKey, AES_BLOCK_SIZE};
use crate::error::{IoStoreError, Result};
use crate::toc::{ChunkEntry, CompressionBlockEntry, ContainerFlags, TocResource, MAX_BLOCK_SIZE};
use crate::types::{ChunkId, KeyGuid};

pub const DEFAULT_COMPRESSION_BLOCK_SIZE: u32 = 64 * 1024;

/// How a [`ContainerWriter`] stores its chunks.
#[derive(Clone, Debug)]
pub struct WriterSettings {
    /// Uncompressed bytes per compression block. Must be a non-zero multiple
    /// of the AES block size.
    pub block_size: u32,
    pub method: CompressionMethod,
    /// Encrypt every block with this key.
    pub encryption: Option<(KeyGuid, AesKey)>,
    /// Record a SHA-256 of every stored block.
    pub sign: bool,
    /// Start every chunk's data on a multiple of this many bytes, so that
    /// stored chunks can be memory mapped.
    pub mapping_alignment: Option<u64>,
}

impl Default for WriterSettings {
    fn default() -> Self {
        WriterSettings {
            block_size: DEFAULT_COMPRESSION_BLOCK_SIZE,
            method: CompressionMethod::None,
            encryption: None,
            sign: false,
            mapping_alignment: None,
        }
    }
}

impl WriterSettings {
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_encryption(mut self, guid: KeyGuid, key: AesKey) -> Self {
        self.encryption = Some((guid, key));
        self
    }

    pub fn signed(mut self) -> Self {
        self.sign = true;
        self
    }

    pub fn with_mapping_alignment(mut self, alignment: u64) -> Self {
        self.mapping_alignment = Some(alignment);
        self
    }
}

/// Accumulates chunks, then writes `<base>.toc` and `<base>.data`.
#[derive(Debug)]
pub struct ContainerWriter {
    settings: WriterSettings,
    chunks: Vec<(ChunkId, Vec<u8>)>,
    ids: HashSet<ChunkId>,
}

impl ContainerWriter {
    pub fn new(settings: WriterSettings) -> Result<Self> {
        let bs = settings.block_size;
        if bs == 0 || bs > MAX_BLOCK_SIZE || bs as usize % AES_BLOCK_SIZE != 0 {
            return Err(IoStoreError::InvalidParameter(format!("invalid compression block size {}", bs)));
        }
        if let Some(align) = settings.mapping_alignment {
            if !align.is_power_of_two() {
                return Err(IoStoreError::InvalidParameter(format!(
                    "mapping alignment {} is not a power of two",
                    align
                )));
            }
        }
        Ok(ContainerWriter { settings, chunks: Vec::new(), ids: HashSet::new() })
    }

    pub fn add_chunk(&mut self, id: ChunkId, data: impl Into<Vec<u8>>) -> Result<()> {
        if !self.ids.insert(id) {
            return Err(IoStoreError::InvalidParameter(format!("duplicate chunk {}", id)));
        }
        self.chunks.push((id, data.into()));
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Writes the container and returns its base path, ready for mounting.
    pub fn write(&self, base: &Path) -> Result<PathBuf> {
        let (toc_path, data_path) = container_paths(base);
        let io_err = |path: &Path, e: std::io::Error| IoStoreError::FileOpenFailed(format!("{}: {}", path.display(), e));

        let file = File::create(&data_path).map_err(|e| io_err(&data_path, e))?;
        let mut data = BufWriter::new(file);
        let toc = self.encode_blocks(&mut data).map_err(|e| io_err(&data_path, e))?;
        data.flush().map_err(|e| io_err(&data_path, e))?;

        let bytes = toc.to_bytes()?;
        std::fs::write(&toc_path, bytes).map_err(|e| io_err(&toc_path, e))?;

        log::debug!(
            "Wrote container {} chunks={} blocks={}",
            base.display(),
            toc.chunks.len(),
            toc.blocks.len()
        );
        Ok(base.to_path_buf())
    }

    fn encode_blocks(&self, data: &mut impl Write) -> std::io::Result<TocResource> {
        let settings = &self.settings;
        let block_size = settings.block_size as u64;

        let mut flags = ContainerFlags::NONE;
        let mut methods = vec![CompressionMethod::None];
        if !settings.method.is_none() {
            flags.insert(ContainerFlags::COMPRESSED);
            methods.push(settings.method);
        }
        if settings.encryption.is_some() {
            flags.insert(ContainerFlags::ENCRYPTED);
        }
        if settings.sign {
            flags.insert(ContainerFlags::SIGNED);
        }

        let mut chunks = Vec::with_capacity(self.chunks.len());
        let mut blocks = Vec::new();
        let mut signatures = Vec::new();
        let mut logical = 0u64;
        let mut physical = 0u64;

        for (id, bytes) in &self.chunks {
            chunks.push(ChunkEntry { id: *id, offset: logical, length: bytes.len() as u64 });

            if let Some(align) = settings.mapping_alignment {
                let aligned = (physical + align - 1) & !(align - 1);
                write_zeros(data, aligned - physical)?;
                physical = aligned;
            }

            for piece in bytes.chunks(settings.block_size as usize) {
                let (method_index, mut stored) = match settings.method.compress(piece) {
                    Ok(packed) if !settings.method.is_none() && packed.len() < piece.len() => (1u8, packed),
                    _ => (0u8, piece.to_vec()),
                };
                let compressed_size = stored.len() as u32;
                stored.resize(align_to_aes_block(stored.len() as u64) as usize, 0);
                if let Some((_, key)) = &settings.encryption {
                    encrypt_in_place(&mut stored, key)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                }
                if settings.sign {
                    signatures.push(sign_block(&stored));
                }
                blocks.push(CompressionBlockEntry {
                    offset: physical,
                    compressed_size,
                    uncompressed_size: piece.len() as u32,
                    method_index,
                });
                data.write_all(&stored)?;
                physical += stored.len() as u64;
            }

            logical = (logical + bytes.len() as u64).div_ceil(block_size) * block_size;
        }

        let logical_size = chunks.last().map_or(0, |c: &ChunkEntry| c.offset + c.length);
        Ok(TocResource {
            chunks,
            blocks,
            methods,
            signatures,
            block_size: settings.block_size,
            flags,
            key_guid: settings.encryption.map(|(guid, _)| guid).unwrap_or_default(),
            logical_size,
        })
    }
}

fn write_zeros(out: &mut impl Write, mut n: u64) -> std::io::Result<()> {
    const ZEROS: [u8; 4096] = [0; 4096];
    while n > 0 {
        let step = n.min(ZEROS.len() as u64) as usize;
        out.write_all(&ZEROS[..step])?;
        n -= step as u64;
    }
    Ok(())
}
