//! L2: slab cache.
//!
//! Fixed-size object allocation backed by the buddy allocator. Each cache
//! keeps a per-CPU magazine fast path (here: a single magazine, since the
//! core targets one logical CPU) in front of a lock-protected list of
//! slabs in three states: free (no live objects), partial, and full.

use alloc::vec::Vec;

use crate::config::{
    CACHE_LINE_SIZE, FRAME_SIZE, SLAB_COLOR_MAX_STEPS, SLAB_MAGAZINE_CAPACITY,
};
use crate::log_service::{klog, LogLevel};
use crate::mm::{buddy::BuddyAllocator, direct_map, AllocFlags, PhysAddr};
use crate::sync::SpinLock;

/// Header stored at the start of every slab frame, ahead of its objects.
#[repr(C)]
#[derive(Clone, Copy)]
struct SlabHeader {
    /// Number of objects currently allocated out of this slab.
    in_use: u32,
    /// Total objects this slab holds.
    capacity: u32,
    /// Head of the in-slab free list, as a byte offset from the slab base,
    /// or `u32::MAX` if none free.
    free_head: u32,
    _reserved: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<SlabHeader>();

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Free,
    Partial,
    Full,
}

struct SlabNode {
    addr: PhysAddr,
    state: SlabState,
}

struct Magazine {
    objects: [PhysAddr; SLAB_MAGAZINE_CAPACITY],
    len: usize,
}

impl Magazine {
    const fn empty() -> Self {
        Self {
            objects: [PhysAddr::NULL; SLAB_MAGAZINE_CAPACITY],
            len: 0,
        }
    }

    fn pop(&mut self) -> Option<PhysAddr> {
        if self.len == 0 {
            None
        } else {
            self.len -= 1;
            Some(self.objects[self.len])
        }
    }

    fn push(&mut self, obj: PhysAddr) -> bool {
        if self.len == SLAB_MAGAZINE_CAPACITY {
            return false;
        }
        self.objects[self.len] = obj;
        self.len += 1;
        true
    }
}

struct CacheInner {
    object_size: usize,
    objects_per_slab: usize,
    color_step: usize,
    slabs: Vec<SlabNode>,
    magazine: Magazine,
    allocated_count: u64,
    freed_count: u64,
}

impl CacheInner {
    fn slab_state_mut(&mut self, addr: PhysAddr) -> Option<&mut SlabNode> {
        self.slabs.iter_mut().find(|s| s.addr == addr)
    }

    fn remove_slab(&mut self, addr: PhysAddr) -> Option<SlabNode> {
        let idx = self.slabs.iter().position(|s| s.addr == addr)?;
        Some(self.slabs.remove(idx))
    }
}

/// A single fixed-size object cache.
pub struct SlabCache {
    name: &'static str,
    lock: SpinLock<CacheInner>,
}

fn round_object_size(requested: usize, align: usize) -> usize {
    let min_align = align.max(8);
    let rounded = (requested + min_align - 1) & !(min_align - 1);
    rounded.min(FRAME_SIZE)
}

impl SlabCache {
    pub fn new(name: &'static str, object_size: usize, align: usize) -> Self {
        let object_size = round_object_size(object_size.max(1), align);
        let objects_per_slab = ((FRAME_SIZE - HEADER_SIZE) / object_size).max(1);
        Self {
            name,
            lock: SpinLock::new(CacheInner {
                object_size,
                objects_per_slab,
                color_step: 0,
                slabs: Vec::new(),
                magazine: Magazine::empty(),
                allocated_count: 0,
                freed_count: 0,
            }),
        }
    }

    pub fn object_size(&self) -> usize {
        self.lock.lock().object_size
    }

    fn next_color(inner: &mut CacheInner) -> usize {
        let color = (inner.color_step % SLAB_COLOR_MAX_STEPS) * CACHE_LINE_SIZE;
        inner.color_step = (inner.color_step + 1) % SLAB_COLOR_MAX_STEPS;
        color
    }

    /// Carve a new slab from the buddy allocator (order 0, RECLAIMABLE
    /// zone: slab backing memory is reclaimable when the cache shrinks).
    fn grow(buddy: &BuddyAllocator, inner: &mut CacheInner) -> Option<PhysAddr> {
        let phys = buddy.alloc_flags(0, AllocFlags::RECLAIMABLE);
        if phys.is_null() {
            return None;
        }

        let color = Self::next_color(inner);
        let usable = FRAME_SIZE - HEADER_SIZE - color;
        let capacity = (usable / inner.object_size).max(1).min(inner.objects_per_slab);

        let header = SlabHeader {
            in_use: 0,
            capacity: capacity as u32,
            free_head: 0,
            _reserved: 0,
        };
        // SAFETY: freshly allocated frame, exclusively owned.
        unsafe { direct_map::write(phys, 0, header) };

        let base_offset = HEADER_SIZE + color;
        for i in 0..capacity {
            let slot_offset = base_offset + i * inner.object_size;
            let next = if i + 1 < capacity {
                (base_offset + (i + 1) * inner.object_size) as u32
            } else {
                u32::MAX
            };
            // SAFETY: slot lies within the frame just allocated.
            unsafe { direct_map::write::<u32>(phys, slot_offset, next) };
        }
        // SAFETY: header field within the allocated frame.
        unsafe {
            let mut h: SlabHeader = direct_map::read(phys, 0);
            h.free_head = base_offset as u32;
            direct_map::write(phys, 0, h);
        }

        inner.slabs.push(SlabNode {
            addr: phys,
            state: SlabState::Free,
        });
        Some(phys)
    }

    fn alloc_from_slab(phys: PhysAddr) -> Option<PhysAddr> {
        // SAFETY: caller holds the cache lock; slab is owned by this cache.
        let mut header: SlabHeader = unsafe { direct_map::read(phys, 0) };
        if header.free_head == u32::MAX {
            return None;
        }
        let slot_offset = header.free_head as usize;
        // SAFETY: `slot_offset` was written as a valid in-slab offset by `grow`.
        let next: u32 = unsafe { direct_map::read(phys, slot_offset) };
        header.free_head = next;
        header.in_use += 1;
        // SAFETY: header lies at the start of the owned slab frame.
        unsafe { direct_map::write(phys, 0, header) };
        Some(phys.offset(slot_offset as u64))
    }

    fn free_to_slab(phys: PhysAddr, slot_offset: usize) {
        // SAFETY: caller holds the cache lock; slab is owned by this cache.
        let mut header: SlabHeader = unsafe { direct_map::read(phys, 0) };
        // SAFETY: `slot_offset` was previously handed out by `alloc_from_slab`.
        unsafe { direct_map::write::<u32>(phys, slot_offset, header.free_head) };
        header.free_head = slot_offset as u32;
        header.in_use = header.in_use.saturating_sub(1);
        // SAFETY: header lies at the start of the owned slab frame.
        unsafe { direct_map::write(phys, 0, header) };
    }

    /// Allocate one object: magazine fast path, then partial slab, then
    /// free slab, then grow a new slab from the buddy allocator.
    pub fn alloc(&self, buddy: &BuddyAllocator) -> PhysAddr {
        let mut inner = self.lock.lock();

        if let Some(obj) = inner.magazine.pop() {
            inner.allocated_count += 1;
            return obj;
        }

        let slab_addr = inner
            .slabs
            .iter()
            .find(|s| s.state == SlabState::Partial)
            .map(|s| s.addr)
            .or_else(|| {
                inner
                    .slabs
                    .iter()
                    .find(|s| s.state == SlabState::Free)
                    .map(|s| s.addr)
            });

        let slab_addr = match slab_addr {
            Some(addr) => addr,
            None => match Self::grow(buddy, &mut inner) {
                Some(addr) => addr,
                None => {
                    klog(LogLevel::Warn, "slab", "cache growth failed, returning 0");
                    return PhysAddr::NULL;
                }
            },
        };

        let object = Self::alloc_from_slab(slab_addr).expect("slab selected as non-full");
        let header: SlabHeader = unsafe { direct_map::read(slab_addr, 0) };
        let node = inner.slab_state_mut(slab_addr).expect("slab present");
        node.state = if header.in_use as usize == header.capacity as usize {
            SlabState::Full
        } else {
            SlabState::Partial
        };

        inner.allocated_count += 1;
        object
    }

    fn slab_base_and_offset(&self, obj: PhysAddr) -> Option<(PhysAddr, usize)> {
        let frame_base = obj.frame_align_down();
        let offset = obj.as_u64() - frame_base.as_u64();
        Some((frame_base, offset as usize))
    }

    /// Free one object back to its owning slab, updating the slab's state
    /// and releasing an empty slab back to the buddy allocator.
    pub fn free(&self, buddy: &BuddyAllocator, obj: PhysAddr) {
        if obj.is_null() {
            klog(LogLevel::Warn, "slab", "free of null object, ignored");
            return;
        }

        let mut inner = self.lock.lock();
        if inner.magazine.push(obj) {
            inner.freed_count += 1;
            return;
        }

        let Some((slab_addr, offset)) = self.slab_base_and_offset(obj) else {
            klog(LogLevel::Error, "slab", "object does not map to a slab frame");
            return;
        };
        Self::free_to_slab(slab_addr, offset);

        let header: SlabHeader = unsafe { direct_map::read(slab_addr, 0) };
        if header.in_use == 0 {
            inner.remove_slab(slab_addr);
            buddy.free(slab_addr, 0);
        } else if let Some(node) = inner.slab_state_mut(slab_addr) {
            node.state = SlabState::Partial;
        }

        inner.freed_count += 1;
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.lock.lock();
        (inner.allocated_count, inner.freed_count)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn slab_count(&self) -> usize {
        self.lock.lock().slabs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_buddy(frames: u64) -> (Vec<u8>, BuddyAllocator) {
        let size = (frames * FRAME_SIZE as u64) as usize;
        let mut buf = alloc::vec![0u8; size + FRAME_SIZE];
        let raw = buf.as_mut_ptr() as u64;
        let aligned = (raw + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        let allocator = BuddyAllocator::new();
        allocator.init(PhysAddr::new(aligned), frames * FRAME_SIZE as u64);
        (buf, allocator)
    }

    #[test]
    fn alloc_free_reuses_slot() {
        let (_buf, buddy) = seeded_buddy(4);
        let cache = SlabCache::new("test-64", 64, 8);

        let a = cache.alloc(&buddy);
        assert!(!a.is_null());
        cache.free(&buddy, a);
        let b = cache.alloc(&buddy);
        assert_eq!(a, b, "magazine fast path should return the freed object");
    }

    #[test]
    fn exhausting_one_slab_grows_another() {
        let (_buf, buddy) = seeded_buddy(8);
        let cache = SlabCache::new("test-512", 512, 8);
        let per_slab = (FRAME_SIZE - HEADER_SIZE) / round_object_size(512, 8);

        let mut objs = Vec::new();
        for _ in 0..per_slab + 1 {
            let o = cache.alloc(&buddy);
            assert!(!o.is_null());
            objs.push(o);
        }
        assert_eq!(cache.slab_count(), 2);
    }

    #[test]
    fn emptied_slab_returns_to_buddy() {
        let (_buf, buddy) = seeded_buddy(4);
        let cache = SlabCache::new("test-128", 128, 8);
        let before = buddy.free_pages();

        let mut objs = Vec::new();
        for _ in 0..8 {
            objs.push(cache.alloc(&buddy));
        }
        // Bypass the magazine so the slab is actually emptied.
        for o in objs {
            cache.lock.lock().magazine.len = 0;
            cache.free(&buddy, o);
        }
        assert_eq!(buddy.free_pages(), before);
    }
}
