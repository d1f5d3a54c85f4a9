//! Container files: reading mounted containers and writing new ones.

pub mod reader;
pub mod table;
pub mod writer;

pub use reader::{clamp_range, container_paths, ContainerReader, DATA_EXTENSION, TOC_EXTENSION};
pub use table::{ChunkLocation, ReaderTable};
pub use writer::{ContainerWriter, WriterSettings, DEFAULT_COMPRESSION_BLOCK_SIZE};
