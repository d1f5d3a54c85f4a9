//! Container table of contents.
//!
//! A TOC is an 80-byte header followed by the chunk id table, the chunk
//! offset/length table, packed compression-block entries, the compression
//! method name table and, for signed containers, one SHA-256 per block.

pub mod block_entry;
pub mod header;
pub mod resource;

pub use block_entry::{CompressionBlockEntry, BLOCK_ENTRY_SIZE, MAX_BLOCK_SIZE};
pub use header::{ContainerFlags, TocHeader, TOC_HEADER_SIZE, TOC_MAGIC, TOC_VERSION};
pub use resource::{ChunkEntry, TocResource, METHOD_NAME_SIZE};
