use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::reclaim_pool::ReclaimPool;
use crate::buffer::{Buffer, SizeStrategy};
use crate::key::CacheKey;

struct Entry {
    buffer: Arc<Buffer>,
    size: u64,
    tick: u64,
}

/// Entries plus their recency order. `order` maps an access tick to the key
/// touched at that tick; the smallest tick is the least recently used entry.
struct LruState {
    entries: HashMap<CacheKey, Entry>,
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    size: u64,
}

impl LruState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            size: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &CacheKey) -> Option<Arc<Buffer>> {
        let tick = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(Arc::clone(&entry.buffer))
    }

    fn insert(&mut self, key: CacheKey, buffer: Arc<Buffer>, size: u64) -> Option<Entry> {
        let tick = self.tick();
        self.order.insert(tick, key.clone());
        self.size += size;
        let old = self.entries.insert(key, Entry { buffer, size, tick });
        if let Some(old) = &old {
            self.order.remove(&old.tick);
            self.size -= old.size;
        }
        old
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.size -= entry.size;
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<(CacheKey, Entry)> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.size -= entry.size;
        Some((key, entry))
    }
}

/// Counters and occupancy of the memory tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub entries: usize,
    pub size: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Byte-bounded LRU of decoded buffers.
///
/// Every buffer leaving the cache, whether pushed out by capacity, removed
/// explicitly or replaced by a `put` under the same key, goes through the
/// removal hook: mutable buffers are handed to the [`ReclaimPool`], immutable
/// ones are dropped on the spot.
pub struct MemoryCache {
    state: Mutex<LruState>,
    capacity: u64,
    sizer: SizeStrategy,
    reclaim: Arc<ReclaimPool>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: u64, sizer: SizeStrategy, reclaim: Arc<ReclaimPool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LruState::new()),
            capacity,
            sizer,
            reclaim,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Buffer>> {
        let found = self.state.lock().touch(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Inserts `buffer` and evicts least recently used entries until the
    /// resident size fits the capacity again. A buffer larger than the whole
    /// capacity ends up evicted itself, after everything older.
    pub fn put(&self, key: CacheKey, buffer: Arc<Buffer>) {
        let size = self.sizer.measure(&buffer);
        // A pooled buffer that becomes resident again is no longer a candidate.
        self.reclaim.withdraw(&buffer);

        let mut removed = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(old) = state.insert(key, Arc::clone(&buffer), size) {
                if !Arc::ptr_eq(&old.buffer, &buffer) {
                    removed.push(old.buffer);
                }
            }
            while state.size > self.capacity {
                let Some((evicted_key, entry)) = state.pop_oldest() else {
                    break;
                };
                trace!(key = %evicted_key, size = entry.size, "memory tier eviction");
                removed.push(entry.buffer);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        for buffer in removed {
            self.on_removed(buffer);
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let entry = self.state.lock().remove(key);
        match entry {
            Some(entry) => {
                self.on_removed(entry.buffer);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Evicts every entry through the removal hook.
    pub fn clear(&self) {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock();
            state.order.clear();
            state.size = 0;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            self.on_removed(entry.buffer);
        }
    }

    fn on_removed(&self, buffer: Arc<Buffer>) {
        if buffer.is_mutable() {
            self.reclaim.offer(buffer);
        }
        // Immutable buffers are destroyed as soon as the last holder lets go,
        // which is right here unless a display still shows them.
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            entries: state.entries.len(),
            size: state.size,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
