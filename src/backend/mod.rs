//! I/O backends.
//!
//! A backend turns queued raw-block reads into filled buffers. The service
//! loop drives it on a single thread through three calls:
//!
//! - [`IoBackend::start_requests`] pulls reads from an [`IoContext`] and
//!   starts them; it returns whether anything was started.
//! - [`IoBackend::completed_requests`] hands back reads that finished.
//! - [`IoBackend::set_minimum_priority`] forwards the priority hint derived
//!   from the most urgent queued read.
//!
//! [`IoContext::next_read`] pops reads in priority order, serves cacheable
//! blocks from the block cache, and stops handing out work once the buffer
//! pool runs dry, which is the engine's only admission control.

pub mod file;
pub mod threaded;

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::BlockCache;
use crate::engine::blocks::{RawBlock, RawBlockId};
use crate::error::Result;
use crate::pool::{BufferPool, PooledBuffer};
use crate::queue::PriorityQueue;
use crate::stats::IoStats;
use crate::types::{ContainerId, IoPriorityHint, Priority};

pub use file::{read_exact_at, FileIoBackend};
pub use threaded::{ThreadedFileBackend, DEFAULT_IO_THREADS};

// ─────────────────────────────────────────────────────────────────────────────
// Wakeup
// ─────────────────────────────────────────────────────────────────────────────

/// Sticky wake-up signal for the service loop.
///
/// A notification sent while nobody waits is kept until the next wait.
#[derive(Clone, Default)]
pub struct Wakeup {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    /// Waits for a notification or the timeout. Returns whether notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut signaled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !*signaled {
            signaled = cvar
                .wait_timeout(signaled, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        std::mem::replace(&mut *signaled, false)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

/// A physical read handed to a backend.
#[derive(Debug)]
pub struct PendingRead {
    block: RawBlockId,
    container: ContainerId,
    file: Arc<File>,
    offset: u64,
    size: usize,
    priority: Priority,
    buffer: PooledBuffer,
}

impl PendingRead {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Destination for the read, exactly `size()` bytes.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.size]
    }

    /// Reads the block synchronously with positioned I/O.
    pub fn perform(mut self) -> CompletedRead {
        let file = Arc::clone(&self.file);
        let offset = self.offset;
        let result = read_exact_at(&file, self.buffer_mut(), offset);
        self.finish(result)
    }

    pub fn finish(self, result: Result<()>) -> CompletedRead {
        CompletedRead { block: self.block, buffer: self.buffer, result, from_cache: false }
    }
}

/// A finished raw-block read.
#[derive(Debug)]
pub struct CompletedRead {
    pub(crate) block: RawBlockId,
    pub(crate) buffer: PooledBuffer,
    pub(crate) result: Result<()>,
    pub(crate) from_cache: bool,
}

impl CompletedRead {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// The service loop's queued reads, lent to a backend for one
/// `start_requests` call.
pub struct IoContext<'a> {
    pub(crate) queue: &'a mut PriorityQueue<RawBlockId>,
    pub(crate) cache: &'a mut BlockCache,
    pub(crate) buffers: &'a BufferPool,
    pub(crate) raw_blocks: &'a HashMap<RawBlockId, RawBlock>,
    pub(crate) completed: &'a mut Vec<CompletedRead>,
    pub(crate) stats: &'a IoStats,
    pub(crate) wakeup: &'a Wakeup,
}

impl<'a> IoContext<'a> {
    /// Pops the most urgent read that needs the filesystem.
    ///
    /// Returns `None` when the queue is empty or no buffer is free. Blocks
    /// found in the cache are completed on the spot and skipped. The cache
    /// pin taken when a read was queued is released once it is popped.
    pub fn next_read(&mut self) -> Option<PendingRead> {
        loop {
            let (_, &id) = self.queue.peek()?;
            let mut buffer = self.buffers.acquire()?;
            let (priority, _) = self.queue.pop()?;
            let Some(block) = self.raw_blocks.get(&id) else {
                continue;
            };

            let key = block.cache_key();
            let mut hit = false;
            if block.is_cacheable() && self.cache.is_enabled() {
                hit = self.cache.read(&key, &mut buffer[..]).is_some();
                IoStats::bump(if hit { &self.stats.cache_hits } else { &self.stats.cache_misses });
            }
            if block.pinned {
                self.cache.unpin(&key);
            }
            if hit {
                log::trace!("Raw block {}:{} served from cache", block.key.container, block.key.index);
                self.completed.push(CompletedRead { block: id, buffer, result: Ok(()), from_cache: true });
                continue;
            }

            IoStats::bump(&self.stats.reads_started);
            return Some(PendingRead {
                block: id,
                container: block.key.container,
                file: Arc::clone(block.reader.file()),
                offset: block.offset,
                size: block.size as usize,
                priority,
                buffer,
            });
        }
    }

    /// Reads still queued.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Signal a backend fires when a read completes off-thread.
    pub fn wakeup(&self) -> Wakeup {
        self.wakeup.clone()
    }
}

/// Physical I/O service driven by the engine.
pub trait IoBackend: Send {
    /// Starts as many queued reads as the backend accepts.
    fn start_requests(&mut self, cx: &mut IoContext<'_>) -> bool;

    /// Appends every read that finished since the last call.
    fn completed_requests(&mut self, out: &mut Vec<CompletedRead>);

    fn set_minimum_priority(&mut self, _hint: IoPriorityHint) {}

    /// Reads started but not yet returned by `completed_requests`.
    fn in_flight(&self) -> usize;
}

impl<B: IoBackend + ?Sized> IoBackend for Box<B> {
    fn start_requests(&mut self, cx: &mut IoContext<'_>) -> bool {
        (**self).start_requests(cx)
    }

    fn completed_requests(&mut self, out: &mut Vec<CompletedRead>) {
        (**self).completed_requests(out)
    }

    fn set_minimum_priority(&mut self, hint: IoPriorityHint) {
        (**self).set_minimum_priority(hint)
    }

    fn in_flight(&self) -> usize {
        (**self).in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_is_sticky() {
        let wakeup = Wakeup::new();
        wakeup.notify();
        assert!(wakeup.wait_timeout(Duration::from_millis(1)));
        assert!(!wakeup.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wakeup_crosses_threads() {
        let wakeup = Wakeup::new();
        let remote = wakeup.clone();
        let handle = std::thread::spawn(move || remote.notify());
        handle.join().unwrap();
        assert!(wakeup.wait_timeout(Duration::from_secs(5)));
    }
}
