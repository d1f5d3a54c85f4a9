//! The block orchestrator.
//!
//! `ServiceCore` owns every in-flight raw block, compressed block and
//! logical request. Only the service loop touches it: the threaded engine
//! from its service thread, the cooperative engine from `Engine::pump`.
//!
//! One `step` runs the whole pipeline once:
//!
//! 1. re-drive requests parked on a now-registered key,
//! 2. decompose new requests into compressed and raw blocks,
//! 3. raise the queue level of requests whose priority went up,
//! 4. let the backend start queued raw reads, in priority order,
//! 5. harvest finished reads and assemble compressed blocks,
//! 6. decode ready blocks, inline or on the worker pool,
//! 7. scatter decoded bytes and retire finished requests.
//!
//! Signature mismatches found along the way are queued, not reported: the
//! caller of `step` delivers them once it has let go of the core.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::backend::{CompletedRead, IoBackend, IoContext, Wakeup};
use crate::cache::BlockCache;
use crate::container::ContainerReader;
use crate::crypto::AesKey;
use crate::engine::blocks::{
    block_span, overlap, BlockKey, CompressedBlock, CompressedBlockId, CompressedSource, LogicalRequest, RawBlock,
    RawBlockId, ResolvedRequest, ScatterEntry,
};
use crate::engine::decode::{DecodeJob, DecodedBlock, SignatureMismatch};
use crate::engine::{CompletedRequest, SignatureError};
use crate::error::IoStoreError;
use crate::keys::KeyStore;
use crate::pool::{BufferPool, ScratchPool};
use crate::queue::PriorityQueue;
use crate::stats::IoStats;
use crate::types::{IoPriorityHint, KeyGuid, Priority, RequestId};
use crate::worker::DecodePool;

/// Collaborators handed to a new core.
pub(crate) struct CoreParts {
    pub read_buffer_size: u64,
    pub backend: Box<dyn IoBackend>,
    pub cache: BlockCache,
    pub buffers: BufferPool,
    pub scratch: ScratchPool,
    pub workers: Option<DecodePool>,
    pub keys: Arc<KeyStore>,
    pub stats: Arc<IoStats>,
    pub completed_tx: Sender<CompletedRequest>,
    pub wakeup: Wakeup,
}

pub(crate) struct ServiceCore {
    read_buffer_size: u64,
    backend: Box<dyn IoBackend>,
    queue: PriorityQueue<RawBlockId>,
    cache: BlockCache,
    buffers: BufferPool,
    scratch: ScratchPool,
    workers: Option<DecodePool>,

    raw_blocks: HashMap<RawBlockId, RawBlock>,
    raw_index: HashMap<BlockKey, RawBlockId>,
    compressed_blocks: HashMap<CompressedBlockId, CompressedBlock>,
    compressed_index: HashMap<BlockKey, CompressedBlockId>,
    requests: HashMap<RequestId, LogicalRequest>,
    ready: VecDeque<CompressedBlockId>,
    next_block_id: u64,
    completed_reads: Vec<CompletedRead>,
    priority_hint: IoPriorityHint,

    keys: Arc<KeyStore>,
    key_events: Receiver<KeyGuid>,
    parked: HashMap<KeyGuid, Vec<ResolvedRequest>>,
    warned_keys: HashSet<KeyGuid>,

    decoded_tx: Sender<DecodedBlock>,
    decoded_rx: Receiver<DecodedBlock>,
    completed_tx: Sender<CompletedRequest>,
    stats: Arc<IoStats>,
    signature_errors: Vec<SignatureError>,
    wakeup: Wakeup,
}

impl ServiceCore {
    pub fn new(parts: CoreParts) -> Self {
        let key_events = parts.keys.subscribe();
        let (decoded_tx, decoded_rx) = unbounded();
        ServiceCore {
            read_buffer_size: parts.read_buffer_size,
            backend: parts.backend,
            queue: PriorityQueue::new(),
            cache: parts.cache,
            buffers: parts.buffers,
            scratch: parts.scratch,
            workers: parts.workers,
            raw_blocks: HashMap::new(),
            raw_index: HashMap::new(),
            compressed_blocks: HashMap::new(),
            compressed_index: HashMap::new(),
            requests: HashMap::new(),
            ready: VecDeque::new(),
            next_block_id: 0,
            completed_reads: Vec::new(),
            priority_hint: IoPriorityHint::Min,
            keys: parts.keys,
            key_events,
            parked: HashMap::new(),
            warned_keys: HashSet::new(),
            decoded_tx,
            decoded_rx,
            completed_tx: parts.completed_tx,
            stats: parts.stats,
            signature_errors: Vec::new(),
            wakeup: parts.wakeup,
        }
    }

    /// Nothing is queued, reading, assembling or decoding. Requests parked
    /// on a missing key do not count until their key arrives.
    pub fn is_idle(&self) -> bool {
        self.raw_blocks.is_empty()
            && self.compressed_blocks.is_empty()
            && self.backend.in_flight() == 0
            && self.key_events.is_empty()
    }

    pub fn parked_requests(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    /// Signature mismatches found since the last call.
    pub fn take_signature_errors(&mut self) -> Vec<SignatureError> {
        std::mem::take(&mut self.signature_errors)
    }

    /// Runs the pipeline once. Returns whether anything moved.
    ///
    /// `updates` may name requests that are part of `submissions`.
    pub fn step(&mut self, submissions: Vec<ResolvedRequest>, updates: Vec<(RequestId, Priority)>) -> bool {
        let mut progressed = self.drain_key_events();
        for request in submissions {
            self.read_blocks(request);
            progressed = true;
        }
        for (id, priority) in updates {
            progressed |= self.raise_priority(id, priority);
        }

        self.update_priority_hint();
        loop {
            let mut cx = IoContext {
                queue: &mut self.queue,
                cache: &mut self.cache,
                buffers: &self.buffers,
                raw_blocks: &self.raw_blocks,
                completed: &mut self.completed_reads,
                stats: &self.stats,
                wakeup: &self.wakeup,
            };
            if !self.backend.start_requests(&mut cx) {
                break;
            }
            progressed = true;
        }
        self.update_priority_hint();

        let mut done = std::mem::take(&mut self.completed_reads);
        self.backend.completed_requests(&mut done);
        progressed |= !done.is_empty();
        for read in done.drain(..) {
            self.on_raw_block_complete(read);
        }
        self.completed_reads = done;

        progressed |= self.drain_decoded();
        progressed |= self.process_ready();
        progressed |= self.drain_decoded();
        progressed
    }

    // ─────────────────────────────────────────────────────────────────────
    // Decomposition
    // ─────────────────────────────────────────────────────────────────────

    fn drain_key_events(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(guid) = self.key_events.try_recv() {
            if let Some(requests) = self.parked.remove(&guid) {
                log::info!("Encryption key {} registered, resuming {} deferred reads", guid, requests.len());
                for request in requests {
                    self.read_blocks(request);
                }
                progressed = true;
            }
        }
        progressed
    }

    fn read_blocks(&mut self, request: ResolvedRequest) {
        let reader = Arc::clone(&request.reader);
        let aes_key = if reader.is_encrypted() {
            match self.keys.get(&reader.key_guid()) {
                Some(key) => Some(key),
                None => {
                    self.park(request);
                    return;
                }
            }
        } else {
            None
        };

        let block_size = reader.block_size();
        let start = request.chunk_offset + request.offset;
        let end = start + request.size;
        let id = request.id;
        let priority = request.priority;
        self.requests.insert(
            id,
            LogicalRequest {
                chunk_id: request.chunk_id,
                offset: request.offset,
                size: request.size as usize,
                buffer: request.target,
                blocks: Vec::new(),
                unfinished: 0,
                error: None,
            },
        );

        let mut offset = start;
        let mut dst_offset = 0usize;
        for index in start / block_size..=(end - 1) / block_size {
            let block_id = match self.compressed_block_for(&reader, index, priority, aes_key) {
                Ok(block_id) => block_id,
                Err(e) => {
                    self.set_request_error(id, e);
                    break;
                }
            };
            let block = match self.compressed_blocks.get_mut(&block_id) {
                Some(block) => block,
                None => break,
            };
            let Some((src_offset, size)) = block_span(offset, end, index, block_size, block.uncompressed_size) else {
                let e = IoStoreError::CorruptToc(format!(
                    "block {} of container {} does not cover offset {}",
                    index,
                    reader.id(),
                    offset
                ));
                self.set_request_error(id, e);
                break;
            };
            block.scatter.push(ScatterEntry { request: id, dst_offset, src_offset, size });
            if let Some(req) = self.requests.get_mut(&id) {
                req.blocks.push(block_id);
                req.unfinished += 1;
            }
            offset += size as u64;
            dst_offset += size;
        }

        log::trace!(
            "Request {:?} chunk {} [{}, +{}) priority {:?}",
            id,
            request.chunk_id,
            request.offset,
            request.size,
            priority
        );
        if self.requests.get(&id).map_or(false, |r| r.unfinished == 0) {
            self.complete_request(id);
        }
    }

    fn park(&mut self, request: ResolvedRequest) {
        let guid = request.reader.key_guid();
        if self.warned_keys.insert(guid) {
            log::warn!(
                "Deferring reads from container {}: encryption key {} is not registered",
                request.reader.id(),
                guid
            );
        }
        IoStats::bump(&self.stats.requests_deferred);
        self.parked.entry(guid).or_default().push(request);
    }

    fn next_id(&mut self) -> u64 {
        self.next_block_id += 1;
        self.next_block_id
    }

    fn compressed_block_for(
        &mut self,
        reader: &Arc<ContainerReader>,
        index: u64,
        priority: Priority,
        aes_key: Option<AesKey>,
    ) -> Result<CompressedBlockId, IoStoreError> {
        let key = BlockKey { container: reader.id(), index, priority };
        if let Some(&id) = self.compressed_index.get(&key) {
            return Ok(id);
        }

        let entry = *reader.block(index as usize).ok_or_else(|| {
            IoStoreError::CorruptToc(format!("container {} has no block {}", reader.id(), index))
        })?;
        if entry.compressed_size == 0 {
            return Err(IoStoreError::CorruptToc(format!(
                "block {} of container {} is empty",
                index,
                reader.id()
            )));
        }

        let id = self.next_id();
        let raw_offset = entry.offset;
        let raw_size = entry.raw_size();
        let rbs = self.read_buffer_size;
        let mut raw_blocks = Vec::new();
        for raw_index in raw_offset / rbs..=(raw_offset + raw_size - 1) / rbs {
            let raw_id = self.raw_block_for(reader, raw_index, priority);
            if let Some(raw) = self.raw_blocks.get_mut(&raw_id) {
                if let Some((s, e)) = overlap(raw.offset, raw.size, raw_offset, raw_size) {
                    raw.bytes_used += e - s;
                }
                raw.dependents.push(id);
            }
            raw_blocks.push(raw_id);
        }

        let block = CompressedBlock {
            key,
            reader: Arc::clone(reader),
            index: index as usize,
            method: reader.method_of(&entry),
            raw_offset,
            raw_size: raw_size as usize,
            compressed_size: entry.compressed_size as usize,
            uncompressed_size: entry.uncompressed_size as usize,
            unfinished_raw: raw_blocks.len(),
            raw_blocks,
            signature: reader.signature(index as usize).copied(),
            aes_key,
            source: CompressedSource::Pending,
            scatter: Vec::new(),
            error: None,
        };
        self.compressed_index.insert(key, id);
        self.compressed_blocks.insert(id, block);
        Ok(id)
    }

    fn raw_block_for(&mut self, reader: &Arc<ContainerReader>, index: u64, priority: Priority) -> RawBlockId {
        let key = BlockKey { container: reader.id(), index, priority };
        if let Some(&id) = self.raw_index.get(&key) {
            return id;
        }
        let id = self.next_id();
        let offset = index * self.read_buffer_size;
        let size = reader.file_size().min(offset + self.read_buffer_size) - offset;
        let mut raw = RawBlock {
            key,
            reader: Arc::clone(reader),
            offset,
            size,
            bytes_used: 0,
            dependents: Vec::new(),
            level: priority,
            pinned: false,
        };
        // Keep a cached copy from being evicted before this read is popped.
        raw.pinned = self.cache.pin(&raw.cache_key());
        self.raw_blocks.insert(id, raw);
        self.raw_index.insert(key, id);
        self.queue.push(priority, id);
        id
    }

    /// Lifts the still-queued reads of request `id` to `priority`. Lower
    /// priorities and finished requests are ignored.
    fn raise_priority(&mut self, id: RequestId, priority: Priority) -> bool {
        if let Some(parked) = self.parked.values_mut().flatten().find(|r| r.id == id) {
            parked.priority = parked.priority.max(priority);
            return false;
        }
        let Some(request) = self.requests.get(&id) else {
            return false;
        };

        let mut moved = 0;
        for block_id in &request.blocks {
            let Some(block) = self.compressed_blocks.get(block_id) else {
                continue;
            };
            for raw_id in &block.raw_blocks {
                let Some(raw) = self.raw_blocks.get_mut(raw_id) else {
                    continue;
                };
                if raw.level < priority && self.queue.requeue(raw_id, raw.level, priority) {
                    raw.level = priority;
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            log::trace!("Request {:?} raised to {:?}, {} reads requeued", id, priority, moved);
        }
        moved > 0
    }

    fn update_priority_hint(&mut self) {
        let hint = self.queue.highest_priority().map_or(IoPriorityHint::Min, Priority::io_hint);
        if hint != self.priority_hint {
            self.priority_hint = hint;
            self.backend.set_minimum_priority(hint);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Raw block completion
    // ─────────────────────────────────────────────────────────────────────

    fn on_raw_block_complete(&mut self, read: CompletedRead) {
        let Some(raw) = self.raw_blocks.remove(&read.block) else {
            return;
        };
        self.raw_index.remove(&raw.key);

        if !read.from_cache {
            match &read.result {
                Ok(()) => {
                    IoStats::bump(&self.stats.reads_completed);
                    IoStats::add(&self.stats.bytes_read, raw.size);
                }
                Err(_) => IoStats::bump(&self.stats.reads_failed),
            }
        }
        if read.result.is_ok() && !read.from_cache && raw.is_cacheable() && self.cache.is_enabled() {
            if self.cache.store(raw.cache_key(), &read.buffer[..raw.size as usize]) {
                IoStats::bump(&self.stats.cache_stores);
            }
        }

        let buffer = Arc::new(read.buffer);
        for block_id in &raw.dependents {
            let Some(block) = self.compressed_blocks.get_mut(block_id) else {
                continue;
            };
            match &read.result {
                Err(e) => {
                    if block.error.is_none() {
                        block.error = Some(e.clone());
                    }
                }
                Ok(()) if block.raw_blocks.len() == 1 => {
                    let start = (block.raw_offset - raw.offset) as usize;
                    block.source = CompressedSource::Shared { buffer: Arc::clone(&buffer), start };
                }
                Ok(()) => {
                    if !matches!(block.source, CompressedSource::Staged(_)) {
                        block.source = CompressedSource::Staged(vec![0u8; block.raw_size]);
                    }
                    if let (CompressedSource::Staged(staging), Some((s, e))) = (
                        &mut block.source,
                        overlap(raw.offset, raw.size, block.raw_offset, block.raw_size as u64),
                    ) {
                        let src = (s - raw.offset) as usize..(e - raw.offset) as usize;
                        let dst = (s - block.raw_offset) as usize;
                        staging[dst..dst + src.len()].copy_from_slice(&buffer[src]);
                    }
                }
            }
            block.unfinished_raw -= 1;
            if block.unfinished_raw == 0 {
                self.ready.push_back(*block_id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Decoding
    // ─────────────────────────────────────────────────────────────────────

    fn process_ready(&mut self) -> bool {
        let mut progressed = false;
        while let Some(&block_id) = self.ready.front() {
            let Some(block) = self.compressed_blocks.get_mut(&block_id) else {
                self.ready.pop_front();
                continue;
            };
            if let Some(e) = block.error.clone() {
                self.ready.pop_front();
                self.fail_block(block_id, e);
                progressed = true;
                continue;
            }
            // Back-pressure: wait for a scratch context to come back.
            let Some(scratch) = self.scratch.acquire() else {
                break;
            };
            self.ready.pop_front();
            progressed = true;

            let needs_cpu = block.needs_cpu();
            let job = DecodeJob {
                block: block_id,
                source: std::mem::replace(&mut block.source, CompressedSource::Pending),
                raw_size: block.raw_size,
                compressed_size: block.compressed_size,
                uncompressed_size: block.uncompressed_size,
                method: block.method,
                aes_key: block.aes_key,
                signature: block.signature,
                scratch,
            };

            if needs_cpu {
                if let Some(workers) = &self.workers {
                    self.dispatch_decode(workers, job);
                    continue;
                }
            }
            let decoded = job.run();
            IoStats::bump(&self.stats.blocks_decoded_inline);
            self.complete_decoded(decoded);
        }
        progressed
    }

    /// Decodes `job` on a worker, or here when every worker slot is taken.
    /// The result arrives through `decoded_rx` either way.
    fn dispatch_decode(&self, workers: &DecodePool, job: DecodeJob) {
        let tx = self.decoded_tx.clone();
        let wakeup = self.wakeup.clone();
        let submitted = workers.try_submit(Box::new(move || {
            let decoded = job.run();
            let _ = tx.send(decoded);
            wakeup.notify();
        }));
        match submitted {
            Ok(()) => IoStats::bump(&self.stats.blocks_decoded_async),
            Err(run_here) => {
                run_here();
                IoStats::bump(&self.stats.blocks_decoded_inline);
            }
        }
    }

    fn drain_decoded(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(decoded) = self.decoded_rx.try_recv() {
            self.complete_decoded(decoded);
            progressed = true;
        }
        progressed
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scatter and retirement
    // ─────────────────────────────────────────────────────────────────────

    fn take_block(&mut self, block_id: CompressedBlockId) -> Option<CompressedBlock> {
        let block = self.compressed_blocks.remove(&block_id)?;
        if self.compressed_index.get(&block.key) == Some(&block_id) {
            self.compressed_index.remove(&block.key);
        }
        Some(block)
    }

    fn complete_decoded(&mut self, decoded: DecodedBlock) {
        let Some(block) = self.take_block(decoded.block) else {
            return;
        };
        if let Some(mismatch) = decoded.mismatch {
            self.report_signature_error(&block, mismatch);
        }
        match decoded.bytes() {
            Ok(bytes) => {
                for entry in &block.scatter {
                    self.scatter(entry, bytes);
                }
            }
            Err(e) => {
                log::warn!(
                    "Failed to decode block {} of container {}: {}",
                    block.index,
                    block.reader.id(),
                    e
                );
                for entry in &block.scatter {
                    self.set_request_error(entry.request, e.clone());
                }
            }
        }
        drop(decoded);
        for entry in &block.scatter {
            self.retire(entry.request);
        }
    }

    fn fail_block(&mut self, block_id: CompressedBlockId, error: IoStoreError) {
        let Some(block) = self.take_block(block_id) else {
            return;
        };
        for entry in &block.scatter {
            self.set_request_error(entry.request, error.clone());
            self.retire(entry.request);
        }
    }

    fn scatter(&mut self, entry: &ScatterEntry, bytes: &[u8]) {
        let Some(request) = self.requests.get_mut(&entry.request) else {
            return;
        };
        if request.error.is_some() {
            return;
        }
        let src = entry.src_offset..entry.src_offset + entry.size;
        let dst = entry.dst_offset..entry.dst_offset + entry.size;
        let size = request.size;
        let buffer = request.buffer.get_or_insert_with(|| vec![0u8; size]);
        match (bytes.get(src), buffer.get_mut(dst)) {
            (Some(src), Some(dst)) => {
                dst.copy_from_slice(src);
                IoStats::add(&self.stats.bytes_scattered, entry.size as u64);
            }
            _ => {
                request.error = Some(IoStoreError::DecompressionFailed(format!(
                    "decoded block is {} bytes, scatter needs [{}, +{})",
                    bytes.len(),
                    entry.src_offset,
                    entry.size
                )));
            }
        }
    }

    fn set_request_error(&mut self, id: RequestId, error: IoStoreError) {
        if let Some(request) = self.requests.get_mut(&id) {
            if request.error.is_none() {
                request.error = Some(error);
            }
        }
    }

    fn retire(&mut self, id: RequestId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.unfinished = request.unfinished.saturating_sub(1);
        if request.unfinished == 0 {
            self.complete_request(id);
        }
    }

    fn complete_request(&mut self, id: RequestId) {
        let Some(request) = self.requests.remove(&id) else {
            return;
        };
        let result = match request.error {
            Some(e) => {
                IoStats::bump(&self.stats.requests_failed);
                Err(e)
            }
            None => {
                IoStats::bump(&self.stats.requests_completed);
                let size = request.size;
                Ok(request.buffer.unwrap_or_else(|| vec![0u8; size]))
            }
        };
        let _ = self.completed_tx.send(CompletedRequest {
            id,
            chunk_id: request.chunk_id,
            offset: request.offset,
            size: request.size as u64,
            result,
        });
    }

    fn report_signature_error(&mut self, block: &CompressedBlock, mismatch: SignatureMismatch) {
        IoStats::bump(&self.stats.signature_errors);
        log::warn!(
            "Signature error detected in container '{}' at block index {}",
            block.reader.data_path().display(),
            block.index
        );
        self.signature_errors.push(SignatureError {
            container: block.reader.id(),
            data_path: block.reader.data_path().to_path_buf(),
            block_index: block.index,
            expected: mismatch.expected,
            actual: mismatch.actual,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileIoBackend;
    use crate::codec::CompressionMethod;
    use crate::pool::{buffer_pool, scratch_pool};
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn service_core(workers: DecodePool) -> ServiceCore {
        let (completed_tx, _) = unbounded();
        ServiceCore::new(CoreParts {
            read_buffer_size: 4096,
            backend: Box::new(FileIoBackend::new()),
            cache: BlockCache::disabled(),
            buffers: buffer_pool(1, 4096),
            scratch: scratch_pool(2),
            workers: Some(workers),
            keys: Arc::new(KeyStore::new()),
            stats: Arc::new(IoStats::default()),
            completed_tx,
            wakeup: Wakeup::new(),
        })
    }

    fn stored_job(service: &ServiceCore, block: CompressedBlockId) -> DecodeJob {
        DecodeJob {
            block,
            source: CompressedSource::Staged(b"stored block\0\0\0\0".to_vec()),
            raw_size: 16,
            compressed_size: 12,
            uncompressed_size: 12,
            method: CompressionMethod::None,
            aes_key: None,
            signature: None,
            scratch: service.scratch.acquire().unwrap(),
        }
    }

    #[test]
    fn decode_falls_back_inline_when_workers_are_busy() {
        let service = service_core(DecodePool::new(1, 1).unwrap());
        let workers = service.workers.as_ref().unwrap();

        // Occupy both worker slots until `release` is dropped.
        let (release, hold) = bounded::<()>(0);
        for _ in 0..2 {
            let hold = hold.clone();
            assert!(workers
                .try_submit(Box::new(move || {
                    let _ = hold.recv();
                }))
                .is_ok());
        }

        service.dispatch_decode(workers, stored_job(&service, 1));
        let decoded = service.decoded_rx.try_recv().unwrap();
        assert_eq!(decoded.block, 1);
        assert_eq!(decoded.bytes().unwrap(), b"stored block");
        drop(decoded);
        let stats = service.stats.snapshot();
        assert_eq!(stats.blocks_decoded_inline, 1);
        assert_eq!(stats.blocks_decoded_async, 0);

        drop(release);
        workers.wait_idle();
        service.dispatch_decode(workers, stored_job(&service, 2));
        let decoded = service.decoded_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(decoded.block, 2);
        let stats = service.stats.snapshot();
        assert_eq!(stats.blocks_decoded_inline, 1);
        assert_eq!(stats.blocks_decoded_async, 1);
    }
}
