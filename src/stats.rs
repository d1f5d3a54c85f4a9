//! I/O counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated by the service loop, backends and workers.
#[derive(Debug, Default)]
pub struct IoStats {
    pub reads_started: AtomicU64,
    pub reads_completed: AtomicU64,
    pub reads_failed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_stores: AtomicU64,
    pub blocks_decoded_inline: AtomicU64,
    pub blocks_decoded_async: AtomicU64,
    pub bytes_scattered: AtomicU64,
    pub signature_errors: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_deferred: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub reads_started: u64,
    pub reads_completed: u64,
    pub reads_failed: u64,
    pub bytes_read: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stores: u64,
    pub blocks_decoded_inline: u64,
    pub blocks_decoded_async: u64,
    pub bytes_scattered: u64,
    pub signature_errors: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_deferred: u64,
}

impl IoStats {
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IoStatsSnapshot {
            reads_started: get(&self.reads_started),
            reads_completed: get(&self.reads_completed),
            reads_failed: get(&self.reads_failed),
            bytes_read: get(&self.bytes_read),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            cache_stores: get(&self.cache_stores),
            blocks_decoded_inline: get(&self.blocks_decoded_inline),
            blocks_decoded_async: get(&self.blocks_decoded_async),
            bytes_scattered: get(&self.bytes_scattered),
            signature_errors: get(&self.signature_errors),
            requests_completed: get(&self.requests_completed),
            requests_failed: get(&self.requests_failed),
            requests_deferred: get(&self.requests_deferred),
        }
    }
}

impl IoStatsSnapshot {
    /// Physical reads that hit the filesystem.
    pub fn physical_reads(&self) -> u64 {
        self.reads_started
    }

    pub fn blocks_decoded(&self) -> u64 {
        self.blocks_decoded_inline + self.blocks_decoded_async
    }
}
