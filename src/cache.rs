//! Raw block cache.
//!
//! A fixed number of raw-block-sized slots linked into an LRU list by index.
//! Slots hold the verbatim bytes of a physical read (still encrypted and
//! compressed), keyed by container and raw block index so that two
//! containers with aliasing block indices never share an entry.
//!
//! The cache is owned by the service loop and needs no internal locking.
//! Slots with a non-zero pin count survive eviction; the service loop pins
//! the cached copy of every raw block it queues and unpins it once the read
//! is popped, so a hit seen at queue time is still a hit at read time.

use std::collections::HashMap;

use crate::types::ContainerId;

const NIL: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub container: ContainerId,
    pub block: u64,
}

impl CacheKey {
    pub fn new(container: ContainerId, block: u64) -> Self {
        CacheKey { container, block }
    }
}

#[derive(Debug)]
struct CacheEntry {
    key: Option<CacheKey>,
    data: Vec<u8>,
    pins: u32,
    prev: usize,
    next: usize,
}

/// Fixed-capacity LRU cache of raw blocks.
#[derive(Debug)]
pub struct BlockCache {
    entries: Vec<CacheEntry>,
    index: HashMap<CacheKey, usize>,
    /// Most recently used slot.
    head: usize,
    /// Least recently used slot.
    tail: usize,
    block_size: usize,
}

impl BlockCache {
    /// Creates a cache of `capacity` slots of `block_size` bytes each.
    /// A zero capacity yields a disabled cache that never hits or stores.
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let entries = (0..capacity)
            .map(|i| CacheEntry {
                key: None,
                data: Vec::new(),
                pins: 0,
                prev: if i == 0 { NIL } else { i - 1 },
                next: if i + 1 == capacity { NIL } else { i + 1 },
            })
            .collect();
        BlockCache {
            entries,
            index: HashMap::with_capacity(capacity),
            head: if capacity == 0 { NIL } else { 0 },
            tail: if capacity == 0 { NIL } else { capacity - 1 },
            block_size,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of slots currently holding a block.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Copies the cached bytes for `key` into the front of `dst` and promotes
    /// the entry. Returns the number of bytes copied, or `None` on a miss.
    pub fn read(&mut self, key: &CacheKey, dst: &mut [u8]) -> Option<usize> {
        let slot = *self.index.get(key)?;
        let entry = &mut self.entries[slot];
        let len = entry.data.len();
        if dst.len() < len {
            return None;
        }
        dst[..len].copy_from_slice(&entry.data);
        self.promote(slot);
        Some(len)
    }

    /// Stores a copy of `data` under `key`, evicting the least recently used
    /// unpinned entry. Returns `false` when the cache is disabled, `data` is
    /// larger than a slot, or every slot is pinned.
    pub fn store(&mut self, key: CacheKey, data: &[u8]) -> bool {
        if !self.is_enabled() || data.len() > self.block_size {
            return false;
        }
        let slot = match self.index.get(&key) {
            Some(&slot) if self.entries[slot].pins == 0 => slot,
            Some(_) => return false,
            None => match self.victim() {
                Some(slot) => slot,
                None => return false,
            },
        };
        if let Some(old) = self.entries[slot].key.take() {
            self.index.remove(&old);
        }
        let entry = &mut self.entries[slot];
        entry.data.clear();
        entry.data.extend_from_slice(data);
        entry.key = Some(key);
        self.index.insert(key, slot);
        self.promote(slot);
        true
    }

    /// Protects an entry from eviction until a matching
    /// [`unpin`](Self::unpin). Pins nest. Returns `false` on a miss.
    pub fn pin(&mut self, key: &CacheKey) -> bool {
        match self.index.get(key) {
            Some(&slot) => {
                self.entries[slot].pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, key: &CacheKey) {
        if let Some(&slot) = self.index.get(key) {
            let entry = &mut self.entries[slot];
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.index.get(key).map_or(false, |&slot| self.entries[slot].pins > 0)
    }

    fn victim(&self) -> Option<usize> {
        let mut slot = self.tail;
        while slot != NIL {
            if self.entries[slot].pins == 0 {
                return Some(slot);
            }
            slot = self.entries[slot].prev;
        }
        None
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.entries[slot].prev, self.entries[slot].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.entries[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entries[next].prev = prev;
        }
        self.entries[slot].prev = NIL;
        self.entries[slot].next = NIL;
    }

    fn promote(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.entries[slot].next = self.head;
        if self.head != NIL {
            self.entries[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}
