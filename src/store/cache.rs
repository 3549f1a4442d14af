//! Front cache for the content store
//!
//! A fixed 4-way set-associative cache. The bucket is chosen from the first
//! twelve bits of the address; each bucket keeps its slots ordered
//! most-recently-used first.

use crate::address::Address;

/// Number of buckets (12 bits of address prefix)
pub const CACHE_BUCKETS: usize = 4096;

/// Slots per bucket
pub const CACHE_WAYS: usize = 4;

/// What the cache remembers about an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached {
    /// Full payload of a stored block
    Present(Box<[u8]>),
    /// The backend recently reported the address as absent
    Missing,
}

#[derive(Debug)]
struct CacheEntry {
    addr: Address,
    value: Cached,
}

/// 4-way associative block cache
pub struct BlockCache {
    slots: Vec<Option<CacheEntry>>,
}

impl BlockCache {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(CACHE_BUCKETS * CACHE_WAYS);
        slots.resize_with(CACHE_BUCKETS * CACHE_WAYS, || None);
        Self { slots }
    }

    /// Look up an address, promoting it to most-recently-used on a hit
    pub fn lookup(&mut self, addr: &Address) -> Option<&Cached> {
        let bucket = self.bucket_mut(addr);
        let way = find(bucket, addr)?;
        bucket[..=way].rotate_right(1);
        bucket[0].as_ref().map(|entry| &entry.value)
    }

    /// Insert or replace an entry. A new entry evicts the least-recently-used
    /// slot of its bucket.
    pub fn insert(&mut self, addr: Address, value: Cached) {
        let bucket = self.bucket_mut(&addr);
        match find(bucket, &addr) {
            Some(way) => {
                bucket[..=way].rotate_right(1);
                if let Some(entry) = bucket[0].as_mut() {
                    entry.value = value;
                }
            }
            None => {
                bucket.rotate_right(1);
                bucket[0] = Some(CacheEntry { addr, value });
            }
        }
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_mut(&mut self, addr: &Address) -> &mut [Option<CacheEntry>] {
        let start = bucket_of(addr) * CACHE_WAYS;
        &mut self.slots[start..start + CACHE_WAYS]
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucket index for an address
pub fn bucket_of(addr: &Address) -> usize {
    let bytes = addr.as_bytes();
    bytes[0] as usize | ((bytes[1] & 0x0f) as usize) << 8
}

fn find(bucket: &[Option<CacheEntry>], addr: &Address) -> Option<usize> {
    bucket
        .iter()
        .position(|slot| matches!(slot, Some(entry) if entry.addr == *addr))
}
