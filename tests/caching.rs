// Integration tests for the service loop's building blocks: the raw block
// cache, the priority queue, the object pools and the key store.
//
// Coverage:
//   - BlockCache evicts least recently used first; reads promote
//   - pinned entries survive eviction; a fully pinned cache refuses stores
//   - identical block indices in different containers never alias
//   - PriorityQueue pops highest level first, FIFO within a level
//   - Pool hands out at most `capacity` objects and takes them back on drop
//   - KeyStore subscribers and callbacks observe late registrations

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use iostore::cache::{BlockCache, CacheKey};
use iostore::crypto::AesKey;
use iostore::keys::KeyStore;
use iostore::pool::{buffer_pool, scratch_pool, Pool};
use iostore::queue::PriorityQueue;
use iostore::{ContainerId, KeyGuid, Priority};

fn key(container: u32, block: u64) -> CacheKey {
    CacheKey::new(ContainerId(container), block)
}

fn cached(cache: &mut BlockCache, k: CacheKey) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 16];
    cache.read(&k, &mut buf).map(|n| buf[..n].to_vec())
}

// ─────────────────────────────────────────────────────────────────────────────
// BlockCache
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn cache_evicts_least_recently_used() {
    let mut cache = BlockCache::new(2, 16);
    assert!(cache.store(key(0, 1), b"one"));
    assert!(cache.store(key(0, 2), b"two"));
    // Touch 1 so that 2 becomes the eviction candidate.
    assert_eq!(cached(&mut cache, key(0, 1)).unwrap(), b"one");
    assert!(cache.store(key(0, 3), b"three"));

    assert!(cache.contains(&key(0, 1)));
    assert!(!cache.contains(&key(0, 2)));
    assert_eq!(cached(&mut cache, key(0, 3)).unwrap(), b"three");
    assert_eq!(cache.len(), 2);
}

#[test]
fn cache_store_replaces_existing_entry() {
    let mut cache = BlockCache::new(2, 16);
    cache.store(key(0, 1), b"old");
    cache.store(key(0, 1), b"new");
    assert_eq!(cache.len(), 1);
    assert_eq!(cached(&mut cache, key(0, 1)).unwrap(), b"new");
}

#[test]
fn pinned_entries_survive_eviction() {
    let mut cache = BlockCache::new(2, 16);
    cache.store(key(0, 1), b"keep");
    cache.store(key(0, 2), b"drop");
    assert!(cache.pin(&key(0, 1)));
    cached(&mut cache, key(0, 2));

    // 1 is least recently used but pinned, so 2 goes.
    assert!(cache.store(key(0, 3), b"new"));
    assert!(cache.contains(&key(0, 1)));
    assert!(!cache.contains(&key(0, 2)));

    assert!(cache.pin(&key(0, 3)));
    assert!(!cache.store(key(0, 4), b"full"));
    cache.unpin(&key(0, 1));
    assert!(cache.store(key(0, 4), b"fits"));
    assert!(!cache.contains(&key(0, 1)));
}

#[test]
fn cache_keys_include_container() {
    let mut cache = BlockCache::new(4, 16);
    cache.store(key(0, 7), b"container 0");
    cache.store(key(1, 7), b"container 1");
    assert_eq!(cached(&mut cache, key(0, 7)).unwrap(), b"container 0");
    assert_eq!(cached(&mut cache, key(1, 7)).unwrap(), b"container 1");
    assert!(cached(&mut cache, key(2, 7)).is_none());
}

#[test]
fn disabled_and_oversized() {
    let mut off = BlockCache::disabled();
    assert!(!off.is_enabled());
    assert!(!off.store(key(0, 0), b"x"));

    let mut cache = BlockCache::new(1, 4);
    assert!(!cache.store(key(0, 0), b"too long"));
    assert!(cache.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// PriorityQueue
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn queue_orders_by_level_then_arrival() {
    let mut queue = PriorityQueue::new();
    queue.push(Priority::Low, "low-1");
    queue.push(Priority::High, "high-1");
    queue.push(Priority::Low, "low-2");
    queue.push(Priority::Max, "max");
    queue.push(Priority::High, "high-2");

    assert_eq!(queue.len(), 5);
    assert_eq!(queue.len_at(Priority::Low), 2);
    assert_eq!(queue.highest_priority(), Some(Priority::Max));
    assert_eq!(queue.peek(), Some((Priority::Max, &"max")));

    let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|(_, v)| v)).collect();
    assert_eq!(order, vec!["max", "high-1", "high-2", "low-1", "low-2"]);
    assert!(queue.is_empty());
    assert_eq!(queue.highest_priority(), None);
}

// ─────────────────────────────────────────────────────────────────────────────
// Pools
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn buffer_pool_bounds_outstanding_buffers() {
    let pool = buffer_pool(2, 64);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(a.len(), 64);
    assert!(pool.acquire().is_none());
    drop(a);
    assert_eq!(pool.available(), 1);
    let c = pool.acquire().unwrap();
    drop((b, c));
    assert_eq!(pool.available(), pool.capacity());
}

#[test]
fn release_hook_counts_returns() {
    let pool: Pool<u32> = Pool::from_fn(3, || 0);
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    pool.set_release_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let items: Vec<_> = (0..3).filter_map(|_| pool.acquire()).collect();
    assert_eq!(items.len(), 3);
    drop(items);
    assert_eq!(released.load(Ordering::SeqCst), 3);
}

#[test]
fn scratch_pool_contexts_are_reused() {
    let pool = scratch_pool(1);
    {
        let mut scratch = pool.acquire().unwrap();
        scratch.decompressed.resize(1000, 1);
    }
    let scratch = pool.acquire().unwrap();
    assert!(scratch.decompressed.capacity() >= 1000);
}

// ─────────────────────────────────────────────────────────────────────────────
// KeyStore
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn key_store_notifies_late_registration() {
    let store = KeyStore::new();
    let events = store.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    store.on_key_registered(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let guid = KeyGuid([4; 16]);
    assert!(store.get(&guid).is_none());
    store.register(guid, AesKey([9; 32]));

    assert_eq!(events.try_recv().unwrap(), guid);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(&guid), Some(AesKey([9; 32])));
    assert!(store.contains(&guid));
    assert_eq!(store.len(), 1);
}
