//! The public engine.
//!
//! [`Engine`] mounts containers and accepts logical reads from any thread.
//! Submission only appends to a short-lived pending list; everything
//! downstream is owned by the service loop, which runs either on a dedicated
//! thread (`Scheduling::Threaded`) or inside [`Engine::pump`]
//! (`Scheduling::Cooperative`).
//!
//! Completed reads are collected with [`Engine::get_completed_requests`].

pub(crate) mod blocks;
mod decode;
mod service;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::backend::{FileIoBackend, IoBackend, ThreadedFileBackend, Wakeup, DEFAULT_IO_THREADS};
use crate::cache::BlockCache;
use crate::config::{EngineConfig, Scheduling};
use crate::container::{clamp_range, ContainerReader, ReaderTable};
use crate::crypto::{AesKey, BlockSignature};
use crate::error::{IoStoreError, Result};
use crate::keys::KeyStore;
use crate::mapped::MappedRegion;
use crate::pool::{buffer_pool, scratch_pool};
use crate::stats::{IoStats, IoStatsSnapshot};
use crate::types::{ChunkId, ContainerId, IoRequest, KeyGuid, Priority, ReadOptions, RequestId};
use crate::worker::DecodePool;

use self::blocks::ResolvedRequest;
use self::service::{CoreParts, ServiceCore};

/// How long the service thread sleeps when nothing signals it.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ─────────────────────────────────────────────────────────────────────────────
// Results and events
// ─────────────────────────────────────────────────────────────────────────────

/// A finished logical read.
#[derive(Debug)]
pub struct CompletedRequest {
    pub id: RequestId,
    pub chunk_id: ChunkId,
    /// Offset into the chunk, after clamping.
    pub offset: u64,
    /// Bytes read, after clamping.
    pub size: u64,
    /// The output buffer: the caller's target if one was given, otherwise an
    /// engine allocation of exactly `size` bytes.
    pub result: Result<Vec<u8>>,
}

impl CompletedRequest {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The bytes read, without any target slack past `size`.
    pub fn data(&self) -> Option<&[u8]> {
        self.result.as_ref().ok().map(|buf| &buf[..self.size as usize])
    }
}

/// A compression block whose bytes did not match the recorded signature.
///
/// The read that hit it still completes with the bytes as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureError {
    pub container: ContainerId,
    pub data_path: PathBuf,
    pub block_index: usize,
    /// Hash recorded in the TOC.
    pub expected: BlockSignature,
    /// Hash of the bytes actually read.
    pub actual: BlockSignature,
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    bytes.iter().try_for_each(|b| write!(f, "{:02x}", b))
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signature mismatch in container {} ('{}') at block {}: expected ",
            self.container,
            self.data_path.display(),
            self.block_index
        )?;
        write_hex(f, &self.expected)?;
        f.write_str(", got ")?;
        write_hex(f, &self.actual)
    }
}

type SignatureCallback = Box<dyn Fn(&SignatureError) + Send + Sync>;

/// Slot for the caller's signature-error callback.
#[derive(Default)]
struct SignatureHandler {
    callback: Mutex<Option<SignatureCallback>>,
}

impl SignatureHandler {
    fn set(&self, callback: SignatureCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn notify(&self, error: &SignatureError) {
        if let Some(callback) = &*self.callback.lock().unwrap_or_else(PoisonError::into_inner) {
            callback(error);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

struct Shared {
    config: EngineConfig,
    readers: RwLock<ReaderTable>,
    keys: Arc<KeyStore>,
    stats: Arc<IoStats>,
    submissions: Mutex<Vec<ResolvedRequest>>,
    priority_updates: Mutex<Vec<(RequestId, Priority)>>,
    completed_tx: Sender<CompletedRequest>,
    completed_rx: Receiver<CompletedRequest>,
    core: Mutex<ServiceCore>,
    wakeup: Wakeup,
    /// Set by the service loop when nothing is left to drive.
    idle: (Mutex<bool>, Condvar),
    stop: AtomicBool,
    next_request: AtomicU64,
    signature_handler: SignatureHandler,
}

impl Shared {
    fn take_submissions(&self) -> Vec<ResolvedRequest> {
        std::mem::take(&mut *self.submissions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// One pass of the service loop. Returns whether anything moved.
    fn service_once(&self) -> bool {
        // Updates first: any request they name was submitted before them.
        let updates = std::mem::take(&mut *self.priority_updates.lock().unwrap_or_else(PoisonError::into_inner));
        let submissions = self.take_submissions();
        let (progressed, signature_errors) = {
            let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
            let progressed = core.step(submissions, updates);
            let signature_errors = core.take_signature_errors();

            // Decided under the idle lock so a concurrent `mark_busy` is never
            // lost. A pass with callbacks still to run is never idle.
            let (lock, cvar) = &self.idle;
            let mut idle = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *idle = signature_errors.is_empty()
                && core.is_idle()
                && self.submissions.lock().unwrap_or_else(PoisonError::into_inner).is_empty();
            if *idle {
                cvar.notify_all();
            }
            (progressed, signature_errors)
        };

        // No engine lock is held here, so the callback may call back in.
        for error in &signature_errors {
            self.signature_handler.notify(error);
        }
        progressed || !signature_errors.is_empty()
    }

    fn mark_busy(&self) {
        *self.idle.0.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

fn service_loop(shared: Arc<Shared>) {
    log::debug!("I/O service thread started");
    while !shared.stop.load(Ordering::Acquire) {
        if !shared.service_once() {
            shared.wakeup.wait_timeout(SERVICE_POLL_INTERVAL);
        }
    }
    log::debug!("I/O service thread stopped");
}

/// Virtualized chunk storage over mounted containers.
pub struct Engine {
    shared: Arc<Shared>,
    service: Option<JoinHandle<()>>,
}

impl Engine {
    /// Creates an engine reading through the file backend matching
    /// `config.scheduling`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backend: Box<dyn IoBackend> = match config.scheduling {
            Scheduling::Threaded { .. } => {
                let io_threads = config.max_concurrent_reads.min(DEFAULT_IO_THREADS);
                let backend = ThreadedFileBackend::new(io_threads, config.max_concurrent_reads)
                    .map_err(|e| IoStoreError::ReadError(format!("cannot start I/O threads: {}", e)))?;
                Box::new(backend)
            }
            Scheduling::Cooperative => Box::new(FileIoBackend::new()),
        };
        Self::with_backend(config, backend)
    }

    /// Creates an engine driving a caller-supplied backend.
    pub fn with_backend(config: EngineConfig, backend: Box<dyn IoBackend>) -> Result<Self> {
        config.validate()?;

        let workers = match config.scheduling {
            Scheduling::Threaded { decompression_workers } => Some(
                DecodePool::new(decompression_workers, config.decompression_contexts).ok_or_else(|| {
                    IoStoreError::InvalidParameter(format!(
                        "cannot start {} decompression workers",
                        decompression_workers
                    ))
                })?,
            ),
            Scheduling::Cooperative => None,
        };

        let wakeup = Wakeup::new();
        let buffers = buffer_pool(config.buffer_count(), config.read_buffer_size);
        let scratch = scratch_pool(config.decompression_contexts);
        {
            let w = wakeup.clone();
            buffers.set_release_hook(move || w.notify());
            let w = wakeup.clone();
            scratch.set_release_hook(move || w.notify());
        }
        let cache = match config.cache_block_count() {
            0 => BlockCache::disabled(),
            blocks => BlockCache::new(blocks, config.read_buffer_size),
        };

        let keys = Arc::new(KeyStore::new());
        {
            let w = wakeup.clone();
            keys.on_key_registered(move |_| w.notify());
        }

        let stats = Arc::new(IoStats::default());
        let (completed_tx, completed_rx) = unbounded();
        let core = ServiceCore::new(CoreParts {
            read_buffer_size: config.read_buffer_size as u64,
            backend,
            cache,
            buffers,
            scratch,
            workers,
            keys: Arc::clone(&keys),
            stats: Arc::clone(&stats),
            completed_tx: completed_tx.clone(),
            wakeup: wakeup.clone(),
        });

        log::debug!(
            "Engine: {} x {} KiB read buffers, {} cached blocks, {} decompression contexts, {:?}",
            config.buffer_count(),
            config.read_buffer_size / 1024,
            config.cache_block_count(),
            config.decompression_contexts,
            config.scheduling
        );

        let threaded = config.scheduling.is_threaded();
        let shared = Arc::new(Shared {
            config,
            readers: RwLock::new(ReaderTable::new()),
            keys,
            stats,
            submissions: Mutex::new(Vec::new()),
            priority_updates: Mutex::new(Vec::new()),
            completed_tx,
            completed_rx,
            core: Mutex::new(core),
            wakeup,
            idle: (Mutex::new(true), Condvar::new()),
            stop: AtomicBool::new(false),
            next_request: AtomicU64::new(1),
            signature_handler: SignatureHandler::default(),
        });

        let service = if threaded {
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("iostore-service".to_owned())
                .spawn(move || service_loop(thread_shared))
                .map_err(|e| IoStoreError::ReadError(format!("cannot start service thread: {}", e)))?;
            Some(handle)
        } else {
            None
        };

        Ok(Engine { shared, service })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Mounts the container rooted at `base` (`<base>.toc` + `<base>.data`).
    ///
    /// Higher `order` shadows lower; among equal orders the latest mount
    /// wins. A container that fails validation is not registered.
    pub fn mount(&self, base: impl AsRef<Path>, order: i32) -> Result<ContainerId> {
        let mut readers = self.shared.readers.write().unwrap_or_else(PoisonError::into_inner);
        let id = readers.next_id();
        let reader = ContainerReader::open(base.as_ref(), id, order)?;
        if reader.is_encrypted() && !self.shared.keys.contains(&reader.key_guid()) {
            log::info!(
                "Container {} is encrypted with key {}, which is not registered yet",
                id,
                reader.key_guid()
            );
        }
        readers.insert(Arc::new(reader));
        Ok(id)
    }

    /// Ids of every mounted container, highest priority first.
    pub fn mounted_containers(&self) -> Vec<ContainerId> {
        let readers = self.shared.readers.read().unwrap_or_else(PoisonError::into_inner);
        readers.iter_by_priority().map(|r| r.id()).collect()
    }

    /// Makes `key` available for containers encrypted under `guid`. Reads
    /// already waiting for it resume.
    pub fn register_encryption_key(&self, guid: KeyGuid, key: AesKey) {
        self.shared.keys.register(guid, key);
        self.shared.mark_busy();
    }

    /// Submits a logical read.
    ///
    /// Fails with `NotFound` when no mounted container holds the chunk, and
    /// with `InvalidParameter` when the target is shorter than the clamped
    /// range. A range that clamps to nothing completes immediately.
    pub fn resolve(&self, request: IoRequest) -> Result<RequestId> {
        let IoRequest { chunk_id, options, priority } = request;
        let location = {
            let readers = self.shared.readers.read().unwrap_or_else(PoisonError::into_inner);
            readers.resolve(&chunk_id).ok_or(IoStoreError::NotFound)?
        };
        let (offset, size) = clamp_range(options.offset, options.size, location.length);
        if let Some(target) = &options.target {
            if (target.len() as u64) < size {
                return Err(IoStoreError::InvalidParameter(format!(
                    "target holds {} bytes, read of chunk {} needs {}",
                    target.len(),
                    chunk_id,
                    size
                )));
            }
        }

        let id = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        if size == 0 {
            IoStats::bump(&self.shared.stats.requests_completed);
            let _ = self.shared.completed_tx.send(CompletedRequest {
                id,
                chunk_id,
                offset,
                size: 0,
                result: Ok(options.target.unwrap_or_default()),
            });
            return Ok(id);
        }

        let resolved = ResolvedRequest {
            id,
            chunk_id,
            reader: location.reader,
            chunk_offset: location.offset,
            offset,
            size,
            priority,
            target: options.target,
        };
        self.shared.submissions.lock().unwrap_or_else(PoisonError::into_inner).push(resolved);
        self.shared.mark_busy();
        self.shared.wakeup.notify();
        Ok(id)
    }

    /// Raises the priority of a submitted read. Its physical reads that have
    /// not started yet move ahead of everything queued below `priority`.
    /// Lowering a priority, or naming a finished read, has no effect.
    pub fn update_priority(&self, id: RequestId, priority: Priority) {
        self.shared
            .priority_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, priority));
        self.shared.mark_busy();
        self.shared.wakeup.notify();
    }

    /// Drains every read finished so far.
    pub fn get_completed_requests(&self) -> Vec<CompletedRequest> {
        self.shared.completed_rx.try_iter().collect()
    }

    /// Runs the service loop once on the calling thread. Required in
    /// cooperative mode before completions become visible; harmless in
    /// threaded mode. Returns whether anything moved.
    pub fn pump(&self) -> bool {
        self.shared.service_once()
    }

    /// Blocks until every submitted read has finished or is waiting for an
    /// encryption key.
    pub fn flush_reads(&self) {
        if self.service.is_none() {
            loop {
                let progressed = self.shared.service_once();
                if *self.shared.idle.0.lock().unwrap_or_else(PoisonError::into_inner) {
                    return;
                }
                if !progressed {
                    self.shared.wakeup.wait_timeout(FLUSH_POLL_INTERVAL);
                }
            }
        }

        self.shared.wakeup.notify();
        let (lock, cvar) = &self.shared.idle;
        let mut idle = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*idle {
            idle = cvar
                .wait_timeout(idle, FLUSH_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Reads parked until their container's key is registered.
    pub fn deferred_requests(&self) -> usize {
        self.shared.core.lock().unwrap_or_else(PoisonError::into_inner).parked_requests()
    }

    pub fn does_chunk_exist(&self, chunk_id: &ChunkId) -> bool {
        let readers = self.shared.readers.read().unwrap_or_else(PoisonError::into_inner);
        readers.resolve(chunk_id).is_some()
    }

    /// Logical length of the chunk in the container that wins resolution.
    pub fn get_size_for_chunk(&self, chunk_id: &ChunkId) -> Option<u64> {
        let readers = self.shared.readers.read().unwrap_or_else(PoisonError::into_inner);
        readers.resolve(chunk_id).map(|location| location.length)
    }

    /// Maps a stored, unencrypted chunk range directly from its data file.
    pub fn open_mapped(&self, chunk_id: &ChunkId, options: &ReadOptions) -> Result<MappedRegion> {
        let reader = {
            let readers = self.shared.readers.read().unwrap_or_else(PoisonError::into_inner);
            readers.resolve(chunk_id).ok_or(IoStoreError::NotFound)?.reader
        };
        reader.map_chunk(chunk_id, options, self.shared.config.memory_mapping_alignment)
    }

    /// Installs the callback run for every signature mismatch. Replaces any
    /// previous one. Runs on the service loop's thread, outside the engine's
    /// internal locks, so it may call back into the engine. It must not
    /// install a new callback.
    pub fn on_signature_error(&self, callback: impl Fn(&SignatureError) + Send + Sync + 'static) {
        self.shared.signature_handler.set(Box::new(callback));
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.service.take() {
            self.shared.stop.store(true, Ordering::Release);
            self.shared.wakeup.notify();
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("scheduling", &self.shared.config.scheduling)
            .field("containers", &self.mounted_containers().len())
            .finish()
    }
}
