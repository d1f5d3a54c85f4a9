//! Helpers shared by the end-to-end suites.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use iostore::backend::{CompletedRead, FileIoBackend, IoBackend, IoContext};
use iostore::config::KB;
use iostore::types::IoPriorityHint;
use iostore::{
    ChunkId, CompletedRequest, ContainerWriter, Engine, EngineConfig, IoRequest, Priority, ReadOptions,
    RequestId, WriterSettings,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic bytes with enough repetition to compress.
pub fn sample_data(len: usize, seed: u8) -> Vec<u8> {
    let words: [&[u8]; 6] = [b"chunk ", b"block ", b"stream ", b"raw ", b"scatter ", b"gather "];
    let mut out = Vec::with_capacity(len);
    let mut i = seed as usize;
    while out.len() < len {
        out.extend_from_slice(words[i % words.len()]);
        out.push(b'0' + (i % 10) as u8);
        i = i.wrapping_mul(31).wrapping_add(seed as usize + 7);
    }
    out.truncate(len);
    out
}

pub fn chunk(n: u64) -> ChunkId {
    ChunkId::from_u64(n, 1)
}

/// Writes a container holding `chunks` under `dir/name`.
pub fn write_container(dir: &Path, name: &str, settings: WriterSettings, chunks: &[(ChunkId, Vec<u8>)]) -> PathBuf {
    let mut writer = ContainerWriter::new(settings).expect("writer settings");
    for (id, data) in chunks {
        writer.add_chunk(*id, data.clone()).expect("add chunk");
    }
    writer.write(&dir.join(name)).expect("write container")
}

/// Cooperative engine with 4 KiB raw blocks and room for 16 of them.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        read_buffer_size: 4 * KB,
        buffer_memory: 64 * KB,
        cache_memory: 0,
        decompression_contexts: 2,
        ..EngineConfig::cooperative()
    }
}

pub fn threaded_config(workers: usize) -> EngineConfig {
    EngineConfig {
        scheduling: iostore::Scheduling::Threaded { decompression_workers: workers },
        ..small_config()
    }
}

/// Collects completions until `expected` have arrived.
pub fn drain(engine: &Engine, expected: usize) -> Vec<CompletedRequest> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut done = Vec::with_capacity(expected);
    while done.len() < expected {
        engine.flush_reads();
        done.extend(engine.get_completed_requests());
        if done.len() < expected {
            assert!(Instant::now() < deadline, "only {} of {} requests completed", done.len(), expected);
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    done
}

/// Resolves one read, waits for it and returns its bytes.
pub fn read(engine: &Engine, id: ChunkId, options: ReadOptions) -> anyhow::Result<Vec<u8>> {
    let request = engine.resolve(IoRequest::new(id).with_options(options))?;
    let mut done = drain(engine, 1);
    let done = done.pop().ok_or_else(|| anyhow::anyhow!("no completion"))?;
    anyhow::ensure!(done.id == request, "completion for {:?}, expected {:?}", done.id, request);
    let size = done.size as usize;
    let mut bytes = done.result?;
    bytes.truncate(size);
    Ok(bytes)
}

pub fn read_all(engine: &Engine, id: ChunkId) -> anyhow::Result<Vec<u8>> {
    read(engine, id, ReadOptions::new())
}

pub fn by_id(done: Vec<CompletedRequest>) -> std::collections::HashMap<RequestId, CompletedRequest> {
    done.into_iter().map(|c| (c.id, c)).collect()
}

/// What a [`RecordingBackend`] saw.
#[derive(Debug, Default)]
pub struct Recording {
    pub reads: Vec<(Priority, u64)>,
    pub hints: Vec<IoPriorityHint>,
}

/// Synchronous backend that logs every read it starts.
pub struct RecordingBackend {
    inner: FileIoBackend,
    completed: Vec<CompletedRead>,
    log: Arc<Mutex<Recording>>,
}

impl RecordingBackend {
    pub fn new() -> (Self, Arc<Mutex<Recording>>) {
        let log = Arc::new(Mutex::new(Recording::default()));
        let backend = RecordingBackend { inner: FileIoBackend::new(), completed: Vec::new(), log: Arc::clone(&log) };
        (backend, log)
    }
}

impl IoBackend for RecordingBackend {
    fn start_requests(&mut self, cx: &mut IoContext<'_>) -> bool {
        let mut started = false;
        while let Some(read) = cx.next_read() {
            self.log.lock().unwrap().reads.push((read.priority(), read.offset()));
            self.completed.push(read.perform());
            started = true;
        }
        started
    }

    fn completed_requests(&mut self, out: &mut Vec<CompletedRead>) {
        out.append(&mut self.completed);
        self.inner.completed_requests(out);
    }

    fn set_minimum_priority(&mut self, hint: IoPriorityHint) {
        self.log.lock().unwrap().hints.push(hint);
        self.inner.set_minimum_priority(hint);
    }

    fn in_flight(&self) -> usize {
        self.completed.len()
    }
}
