//! Host-side KV cache: an LRU over attention key/value blocks, consulted on
//! every host DMA transfer.

use std::collections::HashMap;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp {
    Load,
    Store,
}

/// Cache key: either the five attention coordinates or a pre-built name from
/// command metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KvKey {
    Coords {
        layer: i64,
        head: i64,
        sequence: i64,
        token: i64,
        batch: i64,
    },
    Named(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KvCounters {
    pub loads: u64,
    pub stores: u64,
    pub hits: u64,
    pub misses: u64,
    pub load_bytes: u64,
    pub store_bytes: u64,
    pub hit_bytes: u64,
    pub miss_bytes: u64,
    pub evicted_bytes: u64,
    pub peak_bytes: u64,
}

pub struct KvCache {
    capacity: u64,
    bytes: u64,
    entries: HashMap<KvKey, u64>,
    /// Recency order, least-recent first.
    order: VecDeque<KvKey>,
    counters: KvCounters,
}

impl KvCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            bytes: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
            counters: KvCounters::default(),
        }
    }

    pub fn counters(&self) -> KvCounters {
        self.counters
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &KvKey) -> bool {
        self.entries.contains_key(key)
    }

    fn touch(&mut self, key: &KvKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    fn evict_until_fits(&mut self, incoming: u64) {
        while self.bytes + incoming > self.capacity {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            if let Some(size) = self.entries.remove(&victim) {
                self.bytes -= size;
                self.counters.evicted_bytes += size;
            }
        }
    }

    /// One cache access. Returns true on hit.
    pub fn access(&mut self, key: KvKey, op: KvOp, bytes: u64) -> bool {
        match op {
            KvOp::Load => {
                self.counters.loads += 1;
                self.counters.load_bytes += bytes;
                if self.entries.contains_key(&key) {
                    self.counters.hits += 1;
                    self.counters.hit_bytes += bytes;
                    self.touch(&key);
                    return true;
                }
                self.counters.misses += 1;
                self.counters.miss_bytes += bytes;
                // A miss that could never fit is counted but not cached.
                if bytes <= self.capacity {
                    self.evict_until_fits(bytes);
                    self.entries.insert(key.clone(), bytes);
                    self.bytes += bytes;
                    self.order.push_back(key);
                    self.counters.peak_bytes = self.counters.peak_bytes.max(self.bytes);
                }
                false
            }
            KvOp::Store => {
                self.counters.stores += 1;
                self.counters.store_bytes += bytes;
                let hit = if let Some(size) = self.entries.get_mut(&key) {
                    // Refresh the resident entry's size in place.
                    self.bytes = self.bytes - *size + bytes;
                    *size = bytes;
                    self.counters.hits += 1;
                    self.counters.hit_bytes += bytes;
                    self.touch(&key);
                    true
                } else {
                    self.counters.misses += 1;
                    self.counters.miss_bytes += bytes;
                    if bytes <= self.capacity {
                        self.evict_until_fits(bytes);
                        self.entries.insert(key.clone(), bytes);
                        self.bytes += bytes;
                        self.order.push_back(key);
                    }
                    false
                };
                if self.bytes > self.capacity {
                    // A grown store can overshoot; trim back to capacity.
                    let grown = self.order.pop_back();
                    self.evict_until_fits(0);
                    if let Some(k) = grown {
                        self.order.push_back(k);
                    }
                }
                self.counters.peak_bytes = self.counters.peak_bytes.max(self.bytes.min(self.capacity));
                hit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(token: i64) -> KvKey {
        KvKey::Coords {
            layer: 0,
            head: 0,
            sequence: 0,
            token,
            batch: 0,
        }
    }

    #[test]
    fn load_miss_inserts_then_hits() {
        let mut kv = KvCache::new(1024);
        assert!(!kv.access(key(1), KvOp::Load, 256));
        assert!(kv.access(key(1), KvOp::Load, 256));
        let c = kv.counters();
        assert_eq!((c.loads, c.hits, c.misses), (2, 1, 1));
    }

    #[test]
    fn lru_evicts_the_coldest_entry_only_when_needed() {
        let mut kv = KvCache::new(1024);
        kv.access(key(1), KvOp::Load, 512);
        kv.access(key(2), KvOp::Load, 512);
        // Touch key 1 so key 2 is now the LRU.
        kv.access(key(1), KvOp::Load, 512);
        kv.access(key(3), KvOp::Load, 512);
        assert!(kv.contains(&key(1)));
        assert!(!kv.contains(&key(2)));
        assert_eq!(kv.counters().evicted_bytes, 512);
    }

    #[test]
    fn oversized_miss_is_not_inserted() {
        let mut kv = KvCache::new(1024);
        assert!(!kv.access(key(1), KvOp::Load, 4096));
        assert!(kv.is_empty());
        assert_eq!(kv.counters().misses, 1);
    }

    #[test]
    fn store_refreshes_size_and_counts_a_hit() {
        let mut kv = KvCache::new(1024);
        kv.access(key(1), KvOp::Store, 200);
        assert!(kv.access(key(1), KvOp::Store, 300));
        assert_eq!(kv.bytes(), 300);
        assert_eq!(kv.counters().stores, 2);
    }

    #[test]
    fn peak_bytes_tracks_the_high_water_mark() {
        let mut kv = KvCache::new(1024);
        kv.access(key(1), KvOp::Store, 600);
        kv.access(key(2), KvOp::Store, 400);
        kv.access(key(1), KvOp::Store, 100);
        assert_eq!(kv.counters().peak_bytes, 1000);
    }
}
