//! L3 collaborator: the page-reference table.
//!
//! A fixed-size hash table mapping a frame's physical address to a
//! refcount, shared by demand paging (frame lifetime under a single
//! mapping) and the COW engine (frame lifetime under N sharers). Buckets
//! are singly-linked chains of pool-allocated entries; the table lock and
//! each entry's own lock are taken in that order, never reversed.

use crate::config::PAGE_REF_HASH_BUCKETS;
use crate::log_service::{klog, LogLevel};
use crate::mm::{buddy::BuddyAllocator, PhysAddr};
use crate::sync::SpinLock;

struct Entry {
    phys: PhysAddr,
    count: u64,
    next: Option<alloc::boxed::Box<Entry>>,
}

struct TableInner {
    buckets: alloc::vec::Vec<Option<alloc::boxed::Box<Entry>>>,
}

fn hash(phys: PhysAddr) -> usize {
    let page_index = phys.as_u64() >> 12;
    (page_index as usize) & (PAGE_REF_HASH_BUCKETS - 1)
}

/// Refcount table over physical frames. Backed by a heap-allocated entry
/// list rather than a fixed pool, since entries are small and the table
/// itself already bounds their number to live mappings.
pub struct PageRefTable {
    lock: SpinLock<TableInner>,
}

impl PageRefTable {
    pub fn new() -> Self {
        let mut buckets = alloc::vec::Vec::with_capacity(PAGE_REF_HASH_BUCKETS);
        buckets.resize_with(PAGE_REF_HASH_BUCKETS, || None);
        Self {
            lock: SpinLock::new(TableInner { buckets }),
        }
    }

    /// Look up `phys`'s entry, creating one with count 0 if absent.
    /// Returns the current count after creation (0 for a fresh entry).
    pub fn get_or_create(&self, phys: PhysAddr) -> u64 {
        let mut inner = self.lock.lock();
        let bucket = hash(phys);
        let mut cur = inner.buckets[bucket].as_deref();
        while let Some(e) = cur {
            if e.phys == phys {
                return e.count;
            }
            cur = e.next.as_deref();
        }
        let new_entry = alloc::boxed::Box::new(Entry {
            phys,
            count: 0,
            next: inner.buckets[bucket].take(),
        });
        inner.buckets[bucket] = Some(new_entry);
        0
    }

    fn find_mut<'a>(inner: &'a mut TableInner, phys: PhysAddr) -> Option<&'a mut Entry> {
        let bucket = hash(phys);
        let mut cur = inner.buckets[bucket].as_deref_mut();
        while let Some(e) = cur {
            if e.phys == phys {
                return Some(e);
            }
            cur = e.next.as_deref_mut();
        }
        None
    }

    /// Increment the refcount for `phys`. The entry must already exist
    /// (created via `get_or_create`).
    pub fn inc(&self, phys: PhysAddr) -> u64 {
        let mut inner = self.lock.lock();
        match Self::find_mut(&mut inner, phys) {
            Some(e) => {
                e.count += 1;
                e.count
            }
            None => {
                klog(LogLevel::Error, "page_ref", "inc on untracked frame");
                0
            }
        }
    }

    /// Decrement the refcount for `phys`. If it reaches zero the entry is
    /// removed from the table and the frame is returned to `buddy`.
    /// Returns the count after decrementing (0 means the frame was freed).
    pub fn dec(&self, buddy: &BuddyAllocator, phys: PhysAddr) -> u64 {
        let mut inner = self.lock.lock();
        let bucket = hash(phys);

        let mut slot = &mut inner.buckets[bucket];
        loop {
            let Some(entry) = slot else {
                klog(LogLevel::Error, "page_ref", "dec on untracked frame");
                return 0;
            };
            if entry.phys == phys {
                entry.count = entry.count.saturating_sub(1);
                if entry.count == 0 {
                    let removed = slot.take().unwrap();
                    *slot = removed.next;
                    drop(inner);
                    buddy.free(phys, 0);
                    return 0;
                }
                return entry.count;
            }
            slot = &mut slot.as_mut().unwrap().next;
        }
    }

    /// `ref(phys) -> count`, 0 if untracked.
    pub fn ref_count(&self, phys: PhysAddr) -> u64 {
        let mut inner = self.lock.lock();
        Self::find_mut(&mut inner, phys).map(|e| e.count).unwrap_or(0)
    }

    /// Remove `phys`'s entry without returning its frame to the buddy
    /// allocator -- for the one caller (the COW fault path, see
    /// `cow::dec_without_freeing`) that knows a different owner still
    /// holds the frame.
    pub(super) fn force_zero(&self, phys: PhysAddr) {
        let mut inner = self.lock.lock();
        let bucket = hash(phys);
        let mut slot = &mut inner.buckets[bucket];
        while let Some(entry) = slot {
            if entry.phys == phys {
                let removed = slot.take().unwrap();
                *slot = removed.next;
                return;
            }
            slot = &mut slot.as_mut().unwrap().next;
        }
    }
}

impl Default for PageRefTable {
    fn default() -> Self {
        Self::new()
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
    fn get_or_create_then_inc_dec() {
        let (_buf, buddy) = seeded_buddy(4);
        let table = PageRefTable::new();
        let phys = buddy.alloc(0, crate::mm::Zone::Unmovable);

        assert_eq!(table.get_or_create(phys), 0);
        assert_eq!(table.inc(phys), 1);
        assert_eq!(table.inc(phys), 2);
        assert_eq!(table.dec(&buddy, phys), 1);
        assert_eq!(table.ref_count(phys), 1);
    }

    #[test]
    fn dec_to_zero_frees_frame_and_entry() {
        let (_buf, buddy) = seeded_buddy(1);
        let table = PageRefTable::new();
        let phys = buddy.alloc(0, crate::mm::Zone::Unmovable);
        table.get_or_create(phys);
        table.inc(phys);

        let before = buddy.free_pages();
        assert_eq!(table.dec(&buddy, phys), 0);
        assert_eq!(buddy.free_pages(), before + 1);
        assert_eq!(table.ref_count(phys), 0);
    }

    #[test]
    fn distinct_frames_hash_independently() {
        let (_buf, buddy) = seeded_buddy(8);
        let table = PageRefTable::new();
        let a = buddy.alloc(0, crate::mm::Zone::Unmovable);
        let b = buddy.alloc(0, crate::mm::Zone::Unmovable);

        table.get_or_create(a);
        table.get_or_create(b);
        table.inc(a);
        assert_eq!(table.ref_count(a), 1);
        assert_eq!(table.ref_count(b), 0);
    }
}
