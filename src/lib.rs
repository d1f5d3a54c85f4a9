// iostore: on-demand chunk storage over packed, compressed containers

//! Mount container files, resolve chunk reads by id, and collect the
//! decoded bytes once the background pipeline has read, verified,
//! decrypted and decompressed them.
//!
//! ```no_run
//! use iostore::{ChunkId, Engine, EngineConfig, IoRequest};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.mount("assets/base", 0)?;
//! engine.resolve(IoRequest::new(ChunkId::from_u64(7, 0)))?;
//! engine.flush_reads();
//! for done in engine.get_completed_requests() {
//!     println!("{} -> {:?}", done.chunk_id, done.data().map(<[u8]>::len));
//! }
//! # Ok::<(), iostore::IoStoreError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod container;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod keys;
pub mod mapped;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod toc;
pub mod types;
pub mod worker;
pub mod xxhash;

pub use codec::CompressionMethod;
pub use config::{EngineConfig, Scheduling};
pub use container::{ContainerWriter, WriterSettings};
pub use crypto::AesKey;
pub use engine::{CompletedRequest, Engine, SignatureError};
pub use error::{IoStoreError, Result};
pub use mapped::MappedRegion;
pub use stats::IoStatsSnapshot;
pub use types::{ChunkId, ContainerId, IoRequest, KeyGuid, Priority, ReadOptions, RequestId};

/// Crate version, as recorded in Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
