//! Thin wrapper around the `xxhash-rust` crate providing the XXH64 API used
//! to checksum TOC bodies.

pub use xxhash_rust::xxh64::Xxh64 as Xxh64State;

/// Seed mixed into every TOC checksum.
pub const TOC_CHECKSUM_SEED: u64 = 0x494F_5354_4F43;

/// One-shot XXH64 hash.
#[inline]
pub fn xxh64_oneshot(data: &[u8], seed: u64) -> u64 {
    xxhash_rust::xxh64::xxh64(data, seed)
}

/// Checksum stored in a TOC header, computed over the body bytes.
#[inline]
pub fn toc_checksum(body: &[u8]) -> u64 {
    xxh64_oneshot(body, TOC_CHECKSUM_SEED)
}
