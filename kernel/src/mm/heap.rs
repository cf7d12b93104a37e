//! L2: general heap (`kmalloc`/`kfree`/`kcalloc`/`krealloc`).
//!
//! Every live allocation carries a small header immediately before its
//! payload: a magic word, the requested size, and either a slab-cache
//! index or the heap sentinel. `kfree` never needs to know which path an
//! allocation came from -- the header is the only routing mechanism, and
//! reading it is O(1).
//!
//! Requests under [`HEAP_SLAB_THRESHOLD`] route to the smallest slab size
//! class that fits; everything else is served by a first-fit block
//! allocator over an arena reserved from the buddy allocator.

use alloc::vec::Vec;
use core::mem::size_of;

use crate::config::{
    HEAP_ALLOC_MAGIC, HEAP_MIN_SPLIT_PAYLOAD, HEAP_SLAB_SIZE_CLASSES, HEAP_SLAB_THRESHOLD,
};
use crate::log_service::{klog, LogLevel};
use crate::mm::{buddy::BuddyAllocator, direct_map, slab::SlabCache, AllocFlags};
use crate::sync::SpinLock;

const SENTINEL_INDEX: u8 = 0xFF;
const KIND_SLAB: u8 = 0;
const KIND_HEAP: u8 = 1;

/// Order of the buddy allocation backing a single heap arena chunk
/// (2^6 * 4 KiB = 256 KiB).
const ARENA_ORDER: usize = 6;

#[repr(C)]
#[derive(Clone, Copy)]
struct AllocHeader {
    magic: u32,
    size: u32,
    kind: u8,
    slab_index: u8,
    _pad: [u8; 6],
}

const HEADER_SIZE: usize = size_of::<AllocHeader>();

struct HeapInner {
    /// `(offset, length)` of free ranges within the arena, sorted by
    /// offset. `length` includes room for a future header.
    free_blocks: Vec<(usize, usize)>,
    arena_base: usize,
    arena_len: usize,
}

impl HeapInner {
    fn merge_adjacent(&mut self) {
        self.free_blocks.sort_unstable_by_key(|&(off, _)| off);
        let mut i = 0;
        while i + 1 < self.free_blocks.len() {
            let (off, len) = self.free_blocks[i];
            let (next_off, next_len) = self.free_blocks[i + 1];
            if off + len == next_off {
                self.free_blocks[i] = (off, len + next_len);
                self.free_blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// The general heap: a bank of slab caches for small objects plus a
/// first-fit arena for everything else.
pub struct Heap {
    slab_caches: Vec<SlabCache>,
    inner: SpinLock<HeapInner>,
}

impl Heap {
    /// Reserve the first arena chunk and build one slab cache per entry
    /// in [`HEAP_SLAB_SIZE_CLASSES`].
    pub fn new(buddy: &BuddyAllocator) -> Self {
        // Each cache's slab object holds the header plus the class's usable
        // payload, so routing (`class_for`) can compare against the
        // requested size directly.
        let slab_caches = HEAP_SLAB_SIZE_CLASSES
            .iter()
            .map(|&class_size| SlabCache::new("heap-class", class_size + HEADER_SIZE, 8))
            .collect();

        let mut inner = HeapInner {
            free_blocks: Vec::new(),
            arena_base: 0,
            arena_len: 0,
        };
        Self::grow_arena(buddy, &mut inner);

        Self {
            slab_caches,
            inner: SpinLock::new(inner),
        }
    }

    fn grow_arena(buddy: &BuddyAllocator, inner: &mut HeapInner) -> bool {
        let phys = buddy.alloc_flags(ARENA_ORDER, AllocFlags::UNMOVABLE);
        if phys.is_null() {
            klog(LogLevel::Error, "heap", "arena growth failed, buddy exhausted");
            return false;
        }
        let chunk_len = (1usize << ARENA_ORDER) * crate::config::FRAME_SIZE;
        // SAFETY: freshly allocated frames, exclusively owned by this arena.
        let base = unsafe { direct_map::as_mut_ptr(phys, 0) } as usize;
        if inner.arena_len == 0 {
            inner.arena_base = base;
        }
        inner.arena_len += chunk_len;
        let offset = base - inner.arena_base;
        inner.free_blocks.push((offset, chunk_len));
        inner.merge_adjacent();
        true
    }

    fn class_for(&self, size: usize) -> Option<usize> {
        HEAP_SLAB_SIZE_CLASSES.iter().position(|&class| class >= size)
    }

    fn write_header(ptr: *mut u8, header: AllocHeader) {
        // SAFETY: `ptr` points at a region at least `HEADER_SIZE` bytes
        // long, exclusively owned by the caller.
        unsafe { core::ptr::write(ptr as *mut AllocHeader, header) };
    }

    fn read_header(ptr: *const u8) -> AllocHeader {
        // SAFETY: `ptr` was previously produced by this allocator's own
        // `write_header`, at a `HEADER_SIZE`-aligned offset.
        unsafe { core::ptr::read(ptr as *const AllocHeader) }
    }

    /// Allocate `size` bytes, routed through a slab cache or the first-fit
    /// arena. Returns null on failure or a zero-size request.
    pub fn kmalloc(&self, buddy: &BuddyAllocator, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }

        if size < HEAP_SLAB_THRESHOLD {
            if let Some(index) = self.class_for(size) {
                let phys = self.slab_caches[index].alloc(buddy);
                if phys.is_null() {
                    return core::ptr::null_mut();
                }
                // SAFETY: freshly allocated slab object, exclusively owned.
                let header_ptr = unsafe { direct_map::as_mut_ptr(phys, 0) };
                Self::write_header(
                    header_ptr,
                    AllocHeader {
                        magic: HEAP_ALLOC_MAGIC,
                        size: size as u32,
                        kind: KIND_SLAB,
                        slab_index: index as u8,
                        _pad: [0; 6],
                    },
                );
                // SAFETY: payload lies within the same slab object.
                return unsafe { header_ptr.add(HEADER_SIZE) };
            }
        }

        self.kmalloc_from_arena(buddy, size)
    }

    fn kmalloc_from_arena(&self, buddy: &BuddyAllocator, size: usize) -> *mut u8 {
        let needed = HEADER_SIZE + size;
        let mut inner = self.inner.lock();

        let mut chosen = inner
            .free_blocks
            .iter()
            .position(|&(_, len)| len >= needed);
        if chosen.is_none() {
            if !Self::grow_arena(buddy, &mut inner) {
                return core::ptr::null_mut();
            }
            chosen = inner.free_blocks.iter().position(|&(_, len)| len >= needed);
        }
        let Some(idx) = chosen else {
            return core::ptr::null_mut();
        };

        let (offset, len) = inner.free_blocks.remove(idx);
        let remainder = len - needed;
        if remainder >= HEADER_SIZE + HEAP_MIN_SPLIT_PAYLOAD {
            inner.free_blocks.push((offset + needed, remainder));
        }
        // Otherwise keep the whole block; the leftover slop is unusable.

        let header_ptr = (inner.arena_base + offset) as *mut u8;
        Self::write_header(
            header_ptr,
            AllocHeader {
                magic: HEAP_ALLOC_MAGIC,
                size: size as u32,
                kind: KIND_HEAP,
                slab_index: SENTINEL_INDEX,
                _pad: [0; 6],
            },
        );
        // SAFETY: payload lies within the block just removed from the free list.
        unsafe { header_ptr.add(HEADER_SIZE) }
    }

    /// Validate and free a pointer previously returned by `kmalloc` (or
    /// `kcalloc`/`krealloc`).
    pub fn kfree(&self, buddy: &BuddyAllocator, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: callers pass back a pointer this allocator produced, so
        // `ptr - HEADER_SIZE` is the header this allocation wrote.
        let header_ptr = unsafe { ptr.sub(HEADER_SIZE) };
        let header = Self::read_header(header_ptr);
        if header.magic != HEAP_ALLOC_MAGIC {
            klog(LogLevel::Error, "heap", "kfree: magic mismatch, corruption suspected");
            return;
        }

        match header.kind {
            KIND_SLAB => {
                // SAFETY: `header_ptr` is the base of a slab object this
                // allocator carved out.
                let phys = unsafe { direct_map::virt_to_phys(header_ptr) };
                self.slab_caches[header.slab_index as usize].free(buddy, phys);
            }
            KIND_HEAP => {
                let mut inner = self.inner.lock();
                let offset = header_ptr as usize - inner.arena_base;
                let block_len = HEADER_SIZE + header.size as usize;
                inner.free_blocks.push((offset, block_len));
                inner.merge_adjacent();
            }
            _ => {
                klog(LogLevel::Error, "heap", "kfree: unknown allocation kind");
            }
        }
    }

    /// Allocate `count * size` bytes, zero-filled, with overflow checking.
    pub fn kcalloc(&self, buddy: &BuddyAllocator, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            klog(LogLevel::Warn, "heap", "kcalloc: size overflow");
            return core::ptr::null_mut();
        };
        let ptr = self.kmalloc(buddy, total);
        if !ptr.is_null() {
            // SAFETY: `ptr` is a freshly allocated, exclusively owned
            // region of at least `total` bytes.
            unsafe { core::ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Resize an allocation in place when the existing block already fits,
    /// otherwise allocate fresh and copy. `ptr == null` behaves like
    /// `kmalloc`; `new_size == 0` behaves like `kfree` and returns null.
    pub fn krealloc(&self, buddy: &BuddyAllocator, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.kmalloc(buddy, new_size);
        }
        if new_size == 0 {
            self.kfree(buddy, ptr);
            return core::ptr::null_mut();
        }

        // SAFETY: `ptr` was returned by this allocator.
        let header_ptr = unsafe { ptr.sub(HEADER_SIZE) };
        let header = Self::read_header(header_ptr);
        if header.magic != HEAP_ALLOC_MAGIC {
            klog(LogLevel::Error, "heap", "krealloc: magic mismatch, corruption suspected");
            return core::ptr::null_mut();
        }

        let old_size = header.size as usize;
        let fits_in_place = match header.kind {
            KIND_SLAB => HEAP_SLAB_SIZE_CLASSES[header.slab_index as usize] >= new_size,
            _ => new_size <= old_size,
        };
        if fits_in_place {
            let mut updated = header;
            updated.size = new_size as u32;
            Self::write_header(header_ptr, updated);
            return ptr;
        }

        let new_ptr = self.kmalloc(buddy, new_size);
        if !new_ptr.is_null() {
            let copy_len = old_size.min(new_size);
            // SAFETY: both ranges are at least `copy_len` bytes and come
            // from this allocator's own exclusive allocations.
            unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
            self.kfree(buddy, ptr);
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysAddr;

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
    fn small_alloc_routes_to_slab() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        let ptr = heap.kmalloc(&buddy, 24);
        assert!(!ptr.is_null());
        heap.kfree(&buddy, ptr);
    }

    #[test]
    fn large_alloc_routes_to_arena_and_splits() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        let a = heap.kmalloc(&buddy, 8000);
        let b = heap.kmalloc(&buddy, 64);
        assert!(!a.is_null());
        assert!(!b.is_null());
        heap.kfree(&buddy, a);
        heap.kfree(&buddy, b);
    }

    #[test]
    fn freed_adjacent_heap_blocks_coalesce() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        let a = heap.kmalloc(&buddy, 5000);
        let b = heap.kmalloc(&buddy, 5000);
        let before_blocks = heap.inner.lock().free_blocks.len();
        heap.kfree(&buddy, a);
        heap.kfree(&buddy, b);
        assert!(heap.inner.lock().free_blocks.len() <= before_blocks + 1);
    }

    #[test]
    fn kcalloc_zeroes_memory() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        let ptr = heap.kcalloc(&buddy, 16, 8);
        assert!(!ptr.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(ptr, 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        heap.kfree(&buddy, ptr);
    }

    #[test]
    fn krealloc_grows_and_preserves_prefix() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        let ptr = heap.kmalloc(&buddy, 16);
        unsafe { core::ptr::write_bytes(ptr, 0xab, 16) };
        let grown = heap.krealloc(&buddy, ptr, 5000);
        assert!(!grown.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(grown, 16) };
        assert!(bytes.iter().all(|&b| b == 0xab));
        heap.kfree(&buddy, grown);
    }

    #[test]
    fn kmalloc_zero_size_returns_null() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        assert!(heap.kmalloc(&buddy, 0).is_null());
    }

    #[test]
    fn kfree_null_is_noop() {
        let (_buf, buddy) = seeded_buddy(64);
        let heap = Heap::new(&buddy);
        heap.kfree(&buddy, core::ptr::null_mut());
    }
}
