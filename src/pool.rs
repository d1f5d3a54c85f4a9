//! Fixed-capacity object pools.
//!
//! - [`Pool`]: a pool of `T` created once with a fixed population. Objects
//!   are exchanged over a bounded channel, so acquisition and release are O(1)
//!   and may happen from any thread.
//! - [`Pooled`]: RAII guard handed out by [`Pool::acquire`]; dropping it
//!   returns the object to its pool and fires the pool's release hook.
//!
//! The engine keeps two pools: raw-block buffers ([`BufferPool`]) and
//! decompression scratch contexts ([`ScratchPool`]).

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender};

type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

struct PoolInner<T> {
    free_tx: Sender<T>,
    free_rx: Receiver<T>,
    capacity: usize,
    on_release: Mutex<Option<ReleaseHook>>,
}

/// A fixed set of reusable objects.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Pool<T> {
    /// Creates a pool holding `capacity` objects built by `make`.
    pub fn from_fn(capacity: usize, mut make: impl FnMut() -> T) -> Self {
        // bounded(0) is a rendezvous channel; keep at least one slot so an
        // empty pool still has a valid free list.
        let (free_tx, free_rx) = bounded(capacity.max(1));
        for _ in 0..capacity {
            // Cannot fail: the receiver is alive and the channel has room.
            let _ = free_tx.send(make());
        }
        Pool {
            inner: Arc::new(PoolInner { free_tx, free_rx, capacity, on_release: Mutex::new(None) }),
        }
    }

    /// Takes a free object, or `None` when every object is in use.
    pub fn acquire(&self) -> Option<Pooled<T>> {
        let item = self.inner.free_rx.try_recv().ok()?;
        Some(Pooled { item: Some(item), pool: Arc::clone(&self.inner) })
    }

    /// Number of objects currently free.
    pub fn available(&self) -> usize {
        self.inner.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Installs a callback run after every release. The engine uses it to wake
    /// the service loop when back-pressure lifts.
    pub fn set_release_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.inner.on_release.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(hook));
    }
}

/// An object on loan from a [`Pool`].
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `item` is only taken in `drop`.
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled object used after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled object used after release"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            let _ = self.pool.free_tx.send(item);
        }
        let hook = self
            .pool
            .on_release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// Engine pools
// ---------------------------------------------------------------------------

/// Raw-block buffers, each exactly one read buffer long.
pub type BufferPool = Pool<Vec<u8>>;
pub type PooledBuffer = Pooled<Vec<u8>>;

pub fn buffer_pool(count: usize, buffer_size: usize) -> BufferPool {
    Pool::from_fn(count, || vec![0u8; buffer_size])
}

/// Reusable working memory for one decode.
///
/// Both buffers grow on demand and keep their capacity across uses.
#[derive(Debug, Default)]
pub struct CompressionScratch {
    /// Decompressed output of the current block.
    pub decompressed: Vec<u8>,
    /// Decrypted copy of a block whose bytes live in a shared raw buffer.
    pub decrypted: Vec<u8>,
}

pub type ScratchPool = Pool<CompressionScratch>;
pub type PooledScratch = Pooled<CompressionScratch>;

pub fn scratch_pool(count: usize) -> ScratchPool {
    Pool::from_fn(count, CompressionScratch::default)
}
