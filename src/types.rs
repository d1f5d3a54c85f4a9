//! Identifiers and request descriptors shared across the engine.

use std::fmt;

/// Size in bytes of a [`ChunkId`].
pub const CHUNK_ID_SIZE: usize = 12;

/// Opaque chunk identifier, unique within a container and stable across mounts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkId([u8; CHUNK_ID_SIZE]);

impl ChunkId {
    pub const fn new(bytes: [u8; CHUNK_ID_SIZE]) -> Self {
        ChunkId(bytes)
    }

    /// Builds an id from a 64-bit value and a one-byte type tag.
    ///
    /// The value occupies bytes 0..8 (little-endian) and the tag byte 11.
    pub fn from_u64(value: u64, tag: u8) -> Self {
        let mut bytes = [0u8; CHUNK_ID_SIZE];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        bytes[CHUNK_ID_SIZE - 1] = tag;
        ChunkId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; CHUNK_ID_SIZE] = bytes.try_into().ok()?;
        Some(ChunkId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

/// Stable insertion index of a mounted container.
///
/// Part of the block-cache key, so two containers never share cache entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u32);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 128-bit identifier naming the key a container was encrypted with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyGuid(pub [u8; 16]);

impl KeyGuid {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for KeyGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                f.write_str("-")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyGuid({})", self)
    }
}

/// Number of distinct priority levels.
pub const PRIORITY_LEVELS: usize = 5;

/// Scheduling priority of a logical request and of the reads it spawns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    Min,
    Low,
    #[default]
    Medium,
    High,
    Max,
}

impl Priority {
    pub const ALL: [Priority; PRIORITY_LEVELS] = [
        Priority::Min,
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Max,
    ];

    /// Dense level index, `Min` = 0.
    #[inline]
    pub fn level(self) -> usize {
        self as usize
    }

    /// Hint for the OS I/O layer derived from the most urgent queued read.
    pub fn io_hint(self) -> IoPriorityHint {
        if self >= Priority::High {
            IoPriorityHint::Max
        } else if self >= Priority::Medium {
            IoPriorityHint::Normal
        } else {
            IoPriorityHint::Min
        }
    }
}

/// Minimum priority admitted at the OS I/O layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum IoPriorityHint {
    #[default]
    Min,
    Normal,
    Max,
}

/// Caller-visible handle of a resolved logical request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Range and destination of a logical read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Offset into the chunk.
    pub offset: u64,
    /// Requested byte count; clamped to the chunk length.
    pub size: u64,
    /// Caller-provided destination. `None` means allocate on first use.
    pub target: Option<Vec<u8>>,
}

impl ReadOptions {
    /// Whole chunk, engine-allocated buffer.
    pub fn new() -> Self {
        ReadOptions { offset: 0, size: u64::MAX, target: None }
    }

    pub fn range(offset: u64, size: u64) -> Self {
        ReadOptions { offset, size, target: None }
    }

    pub fn with_target(mut self, target: Vec<u8>) -> Self {
        self.target = Some(target);
        self
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical read as submitted by a caller.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub chunk_id: ChunkId,
    pub options: ReadOptions,
    pub priority: Priority,
}

impl IoRequest {
    pub fn new(chunk_id: ChunkId) -> Self {
        IoRequest { chunk_id, options: ReadOptions::new(), priority: Priority::default() }
    }

    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}
