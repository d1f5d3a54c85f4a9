//! One mounted container: its TOC, data file and optional mapping.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use memmap2::Mmap;

use crate::codec::CompressionMethod;
use crate::crypto::BlockSignature;
use crate::error::{IoStoreError, Result};
use crate::mapped::MappedRegion;
use crate::toc::{CompressionBlockEntry, ContainerFlags, TocResource};
use crate::types::{ChunkId, ContainerId, KeyGuid, ReadOptions};

pub const TOC_EXTENSION: &str = "toc";
pub const DATA_EXTENSION: &str = "data";

/// `(toc, data)` file paths of the container rooted at `base`.
pub fn container_paths(base: &Path) -> (PathBuf, PathBuf) {
    (base.with_extension(TOC_EXTENSION), base.with_extension(DATA_EXTENSION))
}

/// Clamps a requested `(offset, size)` to a chunk of `length` bytes.
#[inline]
pub fn clamp_range(offset: u64, size: u64, length: u64) -> (u64, u64) {
    if offset <= length {
        (offset, size.min(length - offset))
    } else {
        (offset, 0)
    }
}

pub struct ContainerReader {
    id: ContainerId,
    order: i32,
    data_path: PathBuf,
    file: Arc<File>,
    file_size: u64,
    chunks: HashMap<ChunkId, (u64, u64)>,
    blocks: Vec<CompressionBlockEntry>,
    methods: Vec<CompressionMethod>,
    signatures: Vec<BlockSignature>,
    block_size: u64,
    flags: ContainerFlags,
    key_guid: KeyGuid,
    logical_size: u64,
    mapping: Mutex<Option<Arc<Mmap>>>,
}

impl ContainerReader {
    /// Opens `<base>.data` and `<base>.toc` and validates the TOC against
    /// the data file.
    pub fn open(base: &Path, id: ContainerId, order: i32) -> Result<Self> {
        let (toc_path, data_path) = container_paths(base);
        let file = File::open(&data_path)
            .map_err(|e| IoStoreError::FileOpenFailed(format!("{}: {}", data_path.display(), e)))?;
        let file_size = file
            .metadata()
            .map_err(|e| IoStoreError::FileOpenFailed(format!("{}: {}", data_path.display(), e)))?
            .len();

        let toc = TocResource::read_file(&toc_path)?;
        toc.validate_against(file_size)?;

        let chunks = toc.chunks.iter().map(|c| (c.id, (c.offset, c.length))).collect();
        log::info!(
            "Mounted container {} ({}) order={} chunks={} blocks={} flags={:#x}",
            id,
            data_path.display(),
            order,
            toc.chunks.len(),
            toc.blocks.len(),
            toc.flags.bits()
        );

        Ok(ContainerReader {
            id,
            order,
            data_path,
            file: Arc::new(file),
            file_size,
            chunks,
            blocks: toc.blocks,
            methods: toc.methods,
            signatures: toc.signatures,
            block_size: toc.block_size as u64,
            flags: toc.flags,
            key_guid: toc.key_guid,
            logical_size: toc.logical_size,
            mapping: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// `(offset, length)` of a chunk in the container's logical space.
    #[inline]
    pub fn resolve(&self, chunk_id: &ChunkId) -> Option<(u64, u64)> {
        self.chunks.get(chunk_id).copied()
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.chunks.keys()
    }

    pub fn block(&self, index: usize) -> Option<&CompressionBlockEntry> {
        self.blocks.get(index)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn method_of(&self, block: &CompressionBlockEntry) -> CompressionMethod {
        self.methods
            .get(block.method_index as usize)
            .copied()
            .unwrap_or(CompressionMethod::None)
    }

    pub fn signature(&self, index: usize) -> Option<&BlockSignature> {
        if self.flags.is_signed() {
            self.signatures.get(index)
        } else {
            None
        }
    }

    pub fn flags(&self) -> ContainerFlags {
        self.flags
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.is_encrypted()
    }

    pub fn is_signed(&self) -> bool {
        self.flags.is_signed()
    }

    pub fn key_guid(&self) -> KeyGuid {
        self.key_guid
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    fn mapping(&self) -> Result<Arc<Mmap>> {
        let mut slot = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = slot.as_ref() {
            return Ok(Arc::clone(map));
        }
        // SAFETY: container data files are immutable while mounted.
        let map = unsafe { Mmap::map(&*self.file) }
            .map_err(|e| IoStoreError::ReadError(format!("mapping {}: {}", self.data_path.display(), e)))?;
        let map = Arc::new(map);
        *slot = Some(Arc::clone(&map));
        Ok(map)
    }

    /// Maps a range of a stored (uncompressed, unencrypted) chunk.
    ///
    /// The blocks covering the range must be stored verbatim and laid out
    /// back to back in the data file, and the first of them must start on a
    /// multiple of `alignment`.
    pub fn map_chunk(&self, chunk_id: &ChunkId, options: &ReadOptions, alignment: u64) -> Result<MappedRegion> {
        if options.target.is_some() {
            return Err(IoStoreError::InvalidParameter(
                "mapped reads cannot fill a caller buffer".to_owned(),
            ));
        }
        let (chunk_offset, length) = self.resolve(chunk_id).ok_or(IoStoreError::NotFound)?;
        let (offset, size) = clamp_range(options.offset, options.size, length);
        if size == 0 {
            return Err(IoStoreError::InvalidParameter(format!("empty range of chunk {}", chunk_id)));
        }
        if self.is_encrypted() {
            return Err(IoStoreError::InvalidParameter(format!(
                "container {} is encrypted and cannot be mapped",
                self.id
            )));
        }

        let start = chunk_offset + offset;
        let end = start + size;
        let first = (start / self.block_size) as usize;
        let last = ((end - 1) / self.block_size) as usize;
        let blocks = self
            .blocks
            .get(first..=last)
            .ok_or_else(|| IoStoreError::CorruptToc(format!("chunk {} runs past the block table", chunk_id)))?;

        if blocks.iter().any(|b| !self.method_of(b).is_none()) {
            return Err(IoStoreError::InvalidParameter(format!("chunk {} is compressed", chunk_id)));
        }
        if blocks.windows(2).any(|w| w[0].offset + w[0].uncompressed_size as u64 != w[1].offset) {
            return Err(IoStoreError::InvalidParameter(format!(
                "chunk {} is not stored contiguously",
                chunk_id
            )));
        }
        if blocks[0].offset % alignment != 0 {
            return Err(IoStoreError::InvalidParameter(format!(
                "chunk {} starts at {} which is not aligned to {}",
                chunk_id, blocks[0].offset, alignment
            )));
        }

        let physical = blocks[0].offset + (start - first as u64 * self.block_size);
        let map = self.mapping()?;
        MappedRegion::new(map, physical as usize, size as usize).ok_or_else(|| {
            IoStoreError::CorruptToc(format!("chunk {} maps outside the data file", chunk_id))
        })
    }
}

impl std::fmt::Debug for ContainerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerReader")
            .field("id", &self.id)
            .field("order", &self.order)
            .field("data_path", &self.data_path)
            .field("chunks", &self.chunks.len())
            .field("blocks", &self.blocks.len())
            .field("flags", &self.flags)
            .finish()
    }
}
