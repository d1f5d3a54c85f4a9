//! In-flight block and request records owned by the service loop.

use std::sync::Arc;

use crate::cache::CacheKey;
use crate::codec::CompressionMethod;
use crate::container::ContainerReader;
use crate::crypto::{AesKey, BlockSignature};
use crate::error::IoStoreError;
use crate::types::{ChunkId, ContainerId, Priority, RequestId};

pub(crate) type RawBlockId = u64;
pub(crate) type CompressedBlockId = u64;

/// Deduplication key. Priority is part of it: the same block requested at
/// two priorities is tracked twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockKey {
    pub container: ContainerId,
    pub index: u64,
    pub priority: Priority,
}

/// One raw-block-sized physical read.
#[derive(Debug)]
pub(crate) struct RawBlock {
    pub key: BlockKey,
    pub reader: Arc<ContainerReader>,
    /// Offset in the data file.
    pub offset: u64,
    pub size: u64,
    /// Bytes claimed by the compressed blocks depending on this read.
    pub bytes_used: u64,
    pub dependents: Vec<CompressedBlockId>,
    /// Queue level; starts at `key.priority` and only rises.
    pub level: Priority,
    /// A cached copy was pinned when the read was queued.
    pub pinned: bool,
}

impl RawBlock {
    /// Partly used blocks may serve a later request and are worth caching.
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        self.bytes_used < self.size
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.key.container, self.key.index)
    }
}

/// Where decoded bytes of a compressed block go.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScatterEntry {
    pub request: RequestId,
    pub dst_offset: usize,
    pub src_offset: usize,
    pub size: usize,
}

/// Raw bytes of a compressed block once its reads have landed.
pub(crate) enum CompressedSource {
    /// Not read yet.
    Pending,
    /// Entirely inside one raw buffer, starting at `start`.
    Shared { buffer: Arc<crate::pool::PooledBuffer>, start: usize },
    /// Assembled from several raw buffers.
    Staged(Vec<u8>),
}

/// One compression block being assembled, decoded and scattered.
pub(crate) struct CompressedBlock {
    pub key: BlockKey,
    pub reader: Arc<ContainerReader>,
    pub index: usize,
    pub method: CompressionMethod,
    /// Physical span, padded to the AES block size.
    pub raw_offset: u64,
    pub raw_size: usize,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub raw_blocks: Vec<RawBlockId>,
    pub unfinished_raw: usize,
    pub signature: Option<BlockSignature>,
    pub aes_key: Option<AesKey>,
    pub source: CompressedSource,
    pub scatter: Vec<ScatterEntry>,
    pub error: Option<IoStoreError>,
}

impl CompressedBlock {
    /// Whether decoding costs more than a copy.
    pub fn needs_cpu(&self) -> bool {
        !self.method.is_none() || self.aes_key.is_some() || self.signature.is_some()
    }
}

/// A caller-visible read being assembled.
#[derive(Debug)]
pub(crate) struct LogicalRequest {
    pub chunk_id: ChunkId,
    pub offset: u64,
    pub size: usize,
    /// Caller target, or allocated on first scatter.
    pub buffer: Option<Vec<u8>>,
    pub blocks: Vec<CompressedBlockId>,
    pub unfinished: usize,
    pub error: Option<IoStoreError>,
}

/// A resolved request waiting to be decomposed by the service loop.
#[derive(Debug)]
pub(crate) struct ResolvedRequest {
    pub id: RequestId,
    pub chunk_id: ChunkId,
    pub reader: Arc<ContainerReader>,
    /// Chunk start in the container's logical space.
    pub chunk_offset: u64,
    /// Offset into the chunk.
    pub offset: u64,
    pub size: u64,
    pub priority: Priority,
    pub target: Option<Vec<u8>>,
}

/// Physical `[start, end)` overlap of two ranges.
#[inline]
pub(crate) fn overlap(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> Option<(u64, u64)> {
    let start = a_start.max(b_start);
    let end = (a_start + a_len).min(b_start + b_len);
    (start < end).then_some((start, end))
}

/// Part of compression block `index` serving logical bytes `[offset, end)`,
/// as `(src_offset, size)`. `None` when the block does not reach `offset`.
pub(crate) fn block_span(
    offset: u64,
    end: u64,
    index: u64,
    block_size: u64,
    uncompressed_size: usize,
) -> Option<(usize, usize)> {
    let src_offset = usize::try_from(offset.checked_sub(index.checked_mul(block_size)?)?).ok()?;
    if src_offset >= uncompressed_size {
        return None;
    }
    let remaining = usize::try_from(end.saturating_sub(offset)).ok()?;
    Some((src_offset, (uncompressed_size - src_offset).min(remaining)))
}
