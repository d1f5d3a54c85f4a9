//! Zero-copy views into memory-mapped container data.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use memmap2::Mmap;

/// Fallback mapping granularity when the platform cannot be queried.
pub const DEFAULT_MAPPING_ALIGNMENT: u64 = 64 * 1024;

/// Granularity that mapped block offsets must be aligned to.
#[cfg(unix)]
pub fn platform_mapping_alignment() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as u64
    } else {
        DEFAULT_MAPPING_ALIGNMENT
    }
}

/// Granularity that mapped block offsets must be aligned to.
#[cfg(not(unix))]
pub fn platform_mapping_alignment() -> u64 {
    DEFAULT_MAPPING_ALIGNMENT
}

/// A byte range of a mapped data file.
///
/// Holds the mapping alive; clones share it.
#[derive(Clone)]
pub struct MappedRegion {
    map: Arc<Mmap>,
    offset: usize,
    len: usize,
}

impl MappedRegion {
    /// `offset..offset + len` must lie within `map`.
    pub(crate) fn new(map: Arc<Mmap>, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        (end <= map.len()).then_some(MappedRegion { map, offset, len })
    }

    /// Offset of the region inside the data file.
    pub fn file_offset(&self) -> u64 {
        self.offset as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[self.offset..self.offset + self.len]
    }
}

impl Deref for MappedRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion").field("offset", &self.offset).field("len", &self.len).finish()
    }
}
