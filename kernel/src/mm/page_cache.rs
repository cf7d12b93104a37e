//! L3: fixed-capacity page cache.
//!
//! Maps `(file_id, offset)` to a cached physical frame, with hash-bucket
//! lookup and an intrusive LRU chain for eviction. Capacity is fixed at
//! construction; once full, `insert` evicts the least-recently-used entry
//! before adding the new one.

use alloc::vec::Vec;

use crate::config::PAGE_CACHE_HASH_BUCKETS;
use crate::mm::{buddy::BuddyAllocator, PhysAddr};
use crate::sync::SpinLock;

struct CacheEntry {
    file_id: u64,
    offset: u64,
    frame: PhysAddr,
    /// Index into the LRU arena of the neighbor nodes, `usize::MAX` for
    /// "none". The LRU chain and the hash chain are independent links
    /// over the same arena of entries.
    lru_prev: usize,
    lru_next: usize,
    hash_next: usize,
}

const NONE: usize = usize::MAX;

struct Inner {
    entries: Vec<Option<CacheEntry>>,
    buckets: Vec<usize>,
    free_slots: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
}

fn hash(file_id: u64, offset: u64) -> usize {
    let h = file_id ^ (offset >> 12);
    let h = h.wrapping_mul(2_654_435_761);
    (h as usize) & (PAGE_CACHE_HASH_BUCKETS - 1)
}

impl Inner {
    fn unlink_lru(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entries[idx].as_ref().unwrap();
            (e.lru_prev, e.lru_next)
        };
        if prev != NONE {
            self.entries[prev].as_mut().unwrap().lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NONE {
            self.entries[next].as_mut().unwrap().lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
    }

    fn push_lru_front(&mut self, idx: usize) {
        let old_head = self.lru_head;
        {
            let e = self.entries[idx].as_mut().unwrap();
            e.lru_prev = NONE;
            e.lru_next = old_head;
        }
        if old_head != NONE {
            self.entries[old_head].as_mut().unwrap().lru_prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NONE {
            self.lru_tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.lru_head == idx {
            return;
        }
        self.unlink_lru(idx);
        self.push_lru_front(idx);
    }

    fn unlink_hash(&mut self, idx: usize) {
        let (file_id, offset) = {
            let e = self.entries[idx].as_ref().unwrap();
            (e.file_id, e.offset)
        };
        let bucket = hash(file_id, offset);
        let mut cur = self.buckets[bucket];
        if cur == idx {
            self.buckets[bucket] = self.entries[idx].as_ref().unwrap().hash_next;
            return;
        }
        while cur != NONE {
            let next = self.entries[cur].as_ref().unwrap().hash_next;
            if next == idx {
                let after = self.entries[idx].as_ref().unwrap().hash_next;
                self.entries[cur].as_mut().unwrap().hash_next = after;
                return;
            }
            cur = next;
        }
    }

    fn find(&self, file_id: u64, offset: u64) -> Option<usize> {
        let mut cur = self.buckets[hash(file_id, offset)];
        while cur != NONE {
            let e = self.entries[cur].as_ref().unwrap();
            if e.file_id == file_id && e.offset == offset {
                return Some(cur);
            }
            cur = e.hash_next;
        }
        None
    }
}

/// Fixed-capacity `(file_id, offset) -> frame` cache.
pub struct PageCache {
    inner: SpinLock<Inner>,
}

impl PageCache {
    pub fn new(max_pages: usize) -> Self {
        let mut buckets = Vec::with_capacity(PAGE_CACHE_HASH_BUCKETS);
        buckets.resize(PAGE_CACHE_HASH_BUCKETS, NONE);
        Self {
            inner: SpinLock::new(Inner {
                entries: Vec::new(),
                buckets,
                free_slots: Vec::new(),
                lru_head: NONE,
                lru_tail: NONE,
                capacity: max_pages,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Look up a cached frame, bumping it to the front of the LRU chain
    /// on a hit.
    pub fn lookup(&self, file_id: u64, offset: u64) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        let bucket = hash(file_id, offset);
        let mut cur = inner.buckets[bucket];
        while cur != NONE {
            let (matches, frame) = {
                let e = inner.entries[cur].as_ref().unwrap();
                (e.file_id == file_id && e.offset == offset, e.frame)
            };
            if matches {
                inner.touch(cur);
                inner.hits += 1;
                return Some(frame);
            }
            cur = inner.entries[cur].as_ref().unwrap().hash_next;
        }
        inner.misses += 1;
        None
    }

    /// Evict the least-recently-used entry, returning both the frame it
    /// cached and the frame backing its own bookkeeping entry, if any
    /// arena slot needed the buddy allocator to grow (it never does here,
    /// since entries are plain heap nodes -- kept for symmetry with
    /// `remove`'s contract).
    fn evict_lru(&self, inner: &mut Inner) -> Option<PhysAddr> {
        let victim = inner.lru_tail;
        if victim == NONE {
            return None;
        }
        inner.unlink_lru(victim);
        inner.unlink_hash(victim);
        let frame = inner.entries[victim].take().unwrap().frame;
        inner.free_slots.push(victim);
        Some(frame)
    }

    /// Insert `(file_id, offset) -> frame`, evicting the LRU entry first
    /// if the cache is at capacity. Returns the evicted frame, if the
    /// caller (typically the filesystem layer) needs to return it to the
    /// buddy allocator.
    pub fn insert(&self, buddy: &BuddyAllocator, file_id: u64, offset: u64, frame: PhysAddr) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();

        if let Some(idx) = inner.find(file_id, offset) {
            inner.touch(idx);
            return None;
        }

        let live = inner.entries.len() - inner.free_slots.len();
        let evicted = if live >= inner.capacity {
            let victim = self.evict_lru(&mut inner);
            if let Some(f) = victim {
                buddy.free(f, 0);
            }
            victim
        } else {
            None
        };

        let idx = match inner.free_slots.pop() {
            Some(i) => i,
            None => {
                inner.entries.push(None);
                inner.entries.len() - 1
            }
        };
        inner.entries[idx] = Some(CacheEntry {
            file_id,
            offset,
            frame,
            lru_prev: NONE,
            lru_next: NONE,
            hash_next: NONE,
        });

        let bucket = hash(file_id, offset);
        inner.entries[idx].as_mut().unwrap().hash_next = inner.buckets[bucket];
        inner.buckets[bucket] = idx;
        inner.push_lru_front(idx);

        evicted
    }

    /// Remove an entry without touching the frame it cached -- the
    /// caller already owns that frame's lifetime and is just dropping
    /// the cache's bookkeeping of it.
    pub fn remove(&self, file_id: u64, offset: u64) {
        let mut inner = self.inner.lock();
        let bucket = hash(file_id, offset);
        let mut cur = inner.buckets[bucket];
        while cur != NONE {
            let matches = {
                let e = inner.entries[cur].as_ref().unwrap();
                e.file_id == file_id && e.offset == offset
            };
            if matches {
                inner.unlink_lru(cur);
                inner.unlink_hash(cur);
                inner.entries[cur] = None;
                inner.free_slots.push(cur);
                return;
            }
            cur = inner.entries[cur].as_ref().unwrap().hash_next;
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries.len() - inner.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_buddy(frames: u64) -> (alloc::vec::Vec<u8>, BuddyAllocator) {
        let size = (frames * crate::config::FRAME_SIZE as u64) as usize;
        let mut buf = alloc::vec![0u8; size + crate::config::FRAME_SIZE];
        let raw = buf.as_mut_ptr() as u64;
        let aligned = (raw + crate::config::FRAME_SIZE as u64 - 1)
            & !(crate::config::FRAME_SIZE as u64 - 1);
        let allocator = BuddyAllocator::new();
        allocator.init(PhysAddr::new(aligned), frames * crate::config::FRAME_SIZE as u64);
        (buf, allocator)
    }

    #[test]
    fn lookup_hit_and_miss() {
        let (_buf, buddy) = seeded_buddy(8);
        let cache = PageCache::new(4);
        let frame = buddy.alloc(0, crate::mm::Zone::Unmovable);
        cache.insert(&buddy, 1, 0, frame);

        assert_eq!(cache.lookup(1, 0), Some(frame));
        assert_eq!(cache.lookup(1, 4096), None);
    }

    #[test]
    fn eviction_at_capacity_drops_lru() {
        let (_buf, buddy) = seeded_buddy(8);
        let cache = PageCache::new(2);
        let a = buddy.alloc(0, crate::mm::Zone::Unmovable);
        let b = buddy.alloc(0, crate::mm::Zone::Unmovable);
        let c = buddy.alloc(0, crate::mm::Zone::Unmovable);

        cache.insert(&buddy, 1, 0, a);
        cache.insert(&buddy, 1, 4096, b);
        // Touch `a` so `b` becomes the LRU victim.
        cache.lookup(1, 0);
        cache.insert(&buddy, 1, 8192, c);

        assert_eq!(cache.lookup(1, 0), Some(a));
        assert_eq!(cache.lookup(1, 4096), None);
        assert_eq!(cache.lookup(1, 8192), Some(c));
    }

    #[test]
    fn insert_of_existing_key_is_a_noop() {
        let (_buf, buddy) = seeded_buddy(8);
        let cache = PageCache::new(4);
        let frame = buddy.alloc(0, crate::mm::Zone::Unmovable);
        let other = buddy.alloc(0, crate::mm::Zone::Unmovable);

        assert!(cache.insert(&buddy, 1, 0, frame).is_none());
        assert_eq!(cache.len(), 1);

        // Re-inserting the same key must not create a second entry or
        // adopt the new frame.
        assert!(cache.insert(&buddy, 1, 0, other).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(1, 0), Some(frame));
    }

    #[test]
    fn remove_drops_entry_without_freeing_frame() {
        let (_buf, buddy) = seeded_buddy(8);
        let cache = PageCache::new(4);
        let frame = buddy.alloc(0, crate::mm::Zone::Unmovable);
        cache.insert(&buddy, 1, 0, frame);

        let before = buddy.free_pages();
        cache.remove(1, 0);
        assert_eq!(buddy.free_pages(), before);
        assert_eq!(cache.lookup(1, 0), None);
    }
}
