//! Fixed-size TOC header and little-endian byte helpers.

use crate::error::{IoStoreError, Result};
use crate::types::KeyGuid;

/// Magic bytes opening every TOC file.
pub const TOC_MAGIC: [u8; 8] = *b"-IOSTOC-";

/// Current (and only) TOC format version.
pub const TOC_VERSION: u32 = 1;

/// Size in bytes of the serialized header.
pub const TOC_HEADER_SIZE: usize = 80;

// ─────────────────────────────────────────────────────────────────────────────
// Byte-order helpers
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
pub fn read_le32(src: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([src[offset], src[offset + 1], src[offset + 2], src[offset + 3]])
}

#[inline]
pub fn write_le32(dst: &mut [u8], offset: usize, value: u32) {
    dst[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn read_le64(src: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
pub fn write_le64(dst: &mut [u8], offset: usize, value: u64) {
    dst[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ─────────────────────────────────────────────────────────────────────────────
// Container flags
// ─────────────────────────────────────────────────────────────────────────────

/// Container-wide storage flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContainerFlags(u32);

impl ContainerFlags {
    pub const NONE: ContainerFlags = ContainerFlags(0);
    pub const COMPRESSED: ContainerFlags = ContainerFlags(1);
    pub const ENCRYPTED: ContainerFlags = ContainerFlags(2);
    pub const SIGNED: ContainerFlags = ContainerFlags(4);

    const KNOWN: u32 = 1 | 2 | 4;

    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::KNOWN == 0).then_some(ContainerFlags(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ContainerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ContainerFlags) {
        self.0 |= other.0;
    }

    pub fn is_encrypted(self) -> bool {
        self.contains(Self::ENCRYPTED)
    }

    pub fn is_signed(self) -> bool {
        self.contains(Self::SIGNED)
    }

    pub fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }
}

impl std::ops::BitOr for ContainerFlags {
    type Output = ContainerFlags;

    fn bitor(self, rhs: ContainerFlags) -> ContainerFlags {
        ContainerFlags(self.0 | rhs.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded TOC header.
///
/// | offset | field |
/// |---|---|
/// | 0 | magic `-IOSTOC-` |
/// | 8 | version u32 |
/// | 12 | header size u32 |
/// | 16 | chunk entry count u32 |
/// | 20 | compression block count u32 |
/// | 24 | compression block size u32 |
/// | 28 | compression method name count u32 |
/// | 32 | container flags u32 |
/// | 36 | reserved u32 |
/// | 40 | logical size u64 |
/// | 48 | encryption key GUID, 16 bytes |
/// | 64 | XXH64 of the body |
/// | 72 | reserved, 8 bytes |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TocHeader {
    pub entry_count: u32,
    pub block_count: u32,
    pub block_size: u32,
    /// Explicit method names; index 0 ("None") is implicit and not counted.
    pub method_count: u32,
    pub flags: ContainerFlags,
    pub logical_size: u64,
    pub key_guid: KeyGuid,
    pub body_checksum: u64,
}

impl TocHeader {
    pub fn read(src: &[u8]) -> Result<Self> {
        if src.len() < TOC_HEADER_SIZE {
            return Err(IoStoreError::CorruptToc(format!(
                "header truncated: {} of {} bytes",
                src.len(),
                TOC_HEADER_SIZE
            )));
        }
        if src[..8] != TOC_MAGIC {
            return Err(IoStoreError::CorruptToc("bad magic".to_owned()));
        }
        let version = read_le32(src, 8);
        if version != TOC_VERSION {
            return Err(IoStoreError::CorruptToc(format!("unsupported version {}", version)));
        }
        let header_size = read_le32(src, 12);
        if header_size as usize != TOC_HEADER_SIZE {
            return Err(IoStoreError::CorruptToc(format!("unexpected header size {}", header_size)));
        }
        let flags_bits = read_le32(src, 32);
        let flags = ContainerFlags::from_bits(flags_bits)
            .ok_or_else(|| IoStoreError::CorruptToc(format!("unknown container flags {:#x}", flags_bits)))?;
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&src[48..64]);
        Ok(TocHeader {
            entry_count: read_le32(src, 16),
            block_count: read_le32(src, 20),
            block_size: read_le32(src, 24),
            method_count: read_le32(src, 28),
            flags,
            logical_size: read_le64(src, 40),
            key_guid: KeyGuid(guid),
            body_checksum: read_le64(src, 64),
        })
    }

    pub fn write(&self, dst: &mut [u8; TOC_HEADER_SIZE]) {
        dst.fill(0);
        dst[..8].copy_from_slice(&TOC_MAGIC);
        write_le32(dst, 8, TOC_VERSION);
        write_le32(dst, 12, TOC_HEADER_SIZE as u32);
        write_le32(dst, 16, self.entry_count);
        write_le32(dst, 20, self.block_count);
        write_le32(dst, 24, self.block_size);
        write_le32(dst, 28, self.method_count);
        write_le32(dst, 32, self.flags.bits());
        write_le64(dst, 40, self.logical_size);
        dst[48..64].copy_from_slice(&self.key_guid.0);
        write_le64(dst, 64, self.body_checksum);
    }
}
