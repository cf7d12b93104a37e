//! L2: object pool.
//!
//! A single-size allocator simpler than [`crate::mm::slab`]: no magazine,
//! no coloring, just a LIFO free list pre-seeded with `initial_count`
//! objects and grown in batches from the buddy allocator on exhaustion.

use alloc::vec::Vec;

use crate::config::FRAME_SIZE;
use crate::log_service::{klog, LogLevel};
use crate::mm::{buddy::BuddyAllocator, AllocFlags, PhysAddr};
use crate::sync::SpinLock;

struct PoolInner {
    object_size: usize,
    free_list: Vec<PhysAddr>,
    batch_size: usize,
    total_objects: u64,
}

/// A fixed-size object pool, e.g. for page-ref entries or region
/// descriptors: allocation-heavy, never resized down.
pub struct ObjectPool {
    lock: SpinLock<PoolInner>,
}

fn round_object_size(requested: usize) -> usize {
    let word = core::mem::size_of::<usize>();
    let raised = requested.max(word);
    (raised + 7) & !7
}

impl ObjectPool {
    /// Create a pool and immediately seed it with `initial_count` objects
    /// carved from `buddy`.
    pub fn new(buddy: &BuddyAllocator, object_size: usize, initial_count: usize) -> Self {
        let object_size = round_object_size(object_size);
        let batch_size = (FRAME_SIZE / object_size).max(1);
        let mut inner = PoolInner {
            object_size,
            free_list: Vec::new(),
            batch_size,
            total_objects: 0,
        };
        Self::grow(buddy, &mut inner, initial_count);
        Self {
            lock: SpinLock::new(inner),
        }
    }

    fn grow(buddy: &BuddyAllocator, inner: &mut PoolInner, at_least: usize) {
        let per_frame = (FRAME_SIZE / inner.object_size).max(1);
        let frames_needed = (at_least + per_frame - 1) / per_frame;
        for _ in 0..frames_needed.max(1) {
            let phys = buddy.alloc_flags(0, AllocFlags::RECLAIMABLE);
            if phys.is_null() {
                klog(LogLevel::Warn, "pool", "backing frame allocation failed");
                return;
            }
            for i in 0..per_frame {
                inner
                    .free_list
                    .push(phys.offset((i * inner.object_size) as u64));
            }
            inner.total_objects += per_frame as u64;
        }
    }

    /// Pop an object, growing the pool by one batch if the free list is
    /// empty.
    pub fn alloc(&self, buddy: &BuddyAllocator) -> PhysAddr {
        let mut inner = self.lock.lock();
        if inner.free_list.is_empty() {
            let batch = inner.batch_size;
            Self::grow(buddy, &mut inner, batch);
        }
        inner.free_list.pop().unwrap_or(PhysAddr::NULL)
    }

    pub fn free(&self, obj: PhysAddr) {
        if obj.is_null() {
            klog(LogLevel::Warn, "pool", "free of null object, ignored");
            return;
        }
        self.lock.lock().free_list.push(obj);
    }

    pub fn object_size(&self) -> usize {
        self.lock.lock().object_size
    }

    pub fn free_count(&self) -> usize {
        self.lock.lock().free_list.len()
    }

    pub fn total_objects(&self) -> u64 {
        self.lock.lock().total_objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_buddy(frames: u64) -> (alloc::vec::Vec<u8>, BuddyAllocator) {
        let size = (frames * FRAME_SIZE as u64) as usize;
        let mut buf = alloc::vec![0u8; size + FRAME_SIZE];
        let raw = buf.as_mut_ptr() as u64;
        let aligned = (raw + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        let allocator = BuddyAllocator::new();
        allocator.init(PhysAddr::new(aligned), frames * FRAME_SIZE as u64);
        (buf, allocator)
    }

    #[test]
    fn initial_seed_matches_request() {
        let (_buf, buddy) = seeded_buddy(4);
        let pool = ObjectPool::new(&buddy, 32, 50);
        assert!(pool.free_count() >= 50);
    }

    #[test]
    fn lifo_reuse() {
        let (_buf, buddy) = seeded_buddy(4);
        let pool = ObjectPool::new(&buddy, 32, 4);
        let a = pool.alloc(&buddy);
        pool.free(a);
        let b = pool.alloc(&buddy);
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_triggers_batch_growth() {
        let (_buf, buddy) = seeded_buddy(4);
        let pool = ObjectPool::new(&buddy, 256, 1);
        let before = pool.total_objects();
        for _ in 0..before + 1 {
            assert!(!pool.alloc(&buddy).is_null());
        }
        assert!(pool.total_objects() > before);
    }
}
