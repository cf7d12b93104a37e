//! L3: demand paging.
//!
//! Virtual regions are registered up front with no physical backing.
//! The first access to a page inside a registered region takes a page
//! fault, which this module resolves by allocating a frame and mapping
//! it in -- optionally zero-filled. Region descriptors live in a
//! per-address-space list; a distinct lock protects that list from the
//! per-region lock each region uses to serialize its own faults, so two
//! threads faulting in different regions of the same address space don't
//! contend.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::MAX_ADDRESS_SPACES;
use crate::error::{MemoryError, MemoryResult};
use crate::mm::{
    buddy::BuddyAllocator, page_table::PageMapper, pte_bits, AllocFlags, PhysAddr, VirtAddr,
};
use crate::sync::SpinLock;

struct RegionRecord {
    start: VirtAddr,
    len: u64,
    /// Extra PTE flags ORed onto the base PRESENT|WRITABLE|USER mapping
    /// (e.g. NO_EXECUTE).
    extra_flags: u64,
    zero_fill: bool,
    fault_lock: SpinLock<()>,
}

impl RegionRecord {
    fn contains(&self, addr: VirtAddr) -> bool {
        let a = addr.as_u64();
        a >= self.start.as_u64() && a < self.start.as_u64() + self.len
    }

    fn overlaps(&self, start: VirtAddr, len: u64) -> bool {
        let a0 = self.start.as_u64();
        let a1 = a0 + self.len;
        let b0 = start.as_u64();
        let b1 = b0 + len;
        a0 < b1 && b0 < a1
    }
}

struct AddressSpaceInner {
    regions: Vec<Box<RegionRecord>>,
}

struct AddressSpaceSlot {
    in_use: AtomicBool,
    root: SpinLock<PhysAddr>,
    regions: SpinLock<AddressSpaceInner>,
}

impl AddressSpaceSlot {
    const fn empty() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            root: SpinLock::new(PhysAddr::NULL),
            regions: SpinLock::new(AddressSpaceInner {
                regions: Vec::new(),
            }),
        }
    }
}

/// Handle to a registered address space, an index into the manager's
/// fixed slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceId(usize);

/// Registry of up to [`MAX_ADDRESS_SPACES`] address spaces, each scanned
/// linearly (spec-mandated: a hash table here would be overkill for a
/// count this small).
pub struct DemandPagingManager {
    slots: Vec<AddressSpaceSlot>,
}

impl DemandPagingManager {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_ADDRESS_SPACES);
        slots.resize_with(MAX_ADDRESS_SPACES, AddressSpaceSlot::empty);
        Self { slots }
    }

    /// Claim the first free slot for an address space rooted at `root`.
    pub fn register_address_space(&self, root: PhysAddr) -> Option<AddressSpaceId> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                *slot.root.lock() = root;
                slot.regions.lock().regions.clear();
                return Some(AddressSpaceId(i));
            }
        }
        None
    }

    pub fn unregister_address_space(&self, id: AddressSpaceId) {
        let slot = &self.slots[id.0];
        slot.regions.lock().regions.clear();
        slot.in_use.store(false, Ordering::Release);
    }

    /// Find the address space currently rooted at `root` (the live CR3
    /// value), for the page-fault dispatcher, which only has the
    /// faulting address and the active root to go on.
    pub fn find_by_root(&self, root: PhysAddr) -> Option<AddressSpaceId> {
        self.slots.iter().enumerate().find_map(|(i, slot)| {
            (slot.in_use.load(Ordering::Acquire) && *slot.root.lock() == root)
                .then_some(AddressSpaceId(i))
        })
    }

    /// The page-table root backing address space `id`.
    pub fn root_of(&self, id: AddressSpaceId) -> PhysAddr {
        *self.slots[id.0].root.lock()
    }

    /// Register a frame-aligned region for demand paging. Rejects
    /// overlap with any already-registered region in the same address
    /// space.
    pub fn register_region(
        &self,
        id: AddressSpaceId,
        start: VirtAddr,
        len: u64,
        extra_flags: u64,
        zero_fill: bool,
    ) -> MemoryResult<()> {
        let start = start.frame_align_down();
        let frame_size = crate::config::FRAME_SIZE as u64;
        let len = (len + frame_size - 1) & !(frame_size - 1);
        if len == 0 {
            return Err(MemoryError::InvalidArgument { name: "len" });
        }

        let slot = &self.slots[id.0];
        let mut inner = slot.regions.lock();
        if inner.regions.iter().any(|r| r.overlaps(start, len)) {
            return Err(MemoryError::PolicyRejected {
                reason: "region overlaps an existing registration",
            });
        }

        inner.regions.push(Box::new(RegionRecord {
            start,
            len,
            extra_flags,
            zero_fill,
            fault_lock: SpinLock::new(()),
        }));
        Ok(())
    }

    fn find_region<'a>(inner: &'a AddressSpaceInner, addr: VirtAddr) -> Option<&'a RegionRecord> {
        inner.regions.iter().find(|r| r.contains(addr)).map(|b| b.as_ref())
    }

    /// Resolve a fault at `addr` within address space `id`. Double-checked
    /// locking: translate once without any region lock (the common case
    /// where another thread already resolved the same fault), then again
    /// after taking the owning region's fault lock.
    pub fn handle_fault(
        &self,
        id: AddressSpaceId,
        buddy: &BuddyAllocator,
        addr: VirtAddr,
    ) -> MemoryResult<()> {
        let slot = &self.slots[id.0];
        let root = *slot.root.lock();
        let mapper = PageMapper::new(root);

        if !mapper.translate(addr).is_null() {
            return Ok(());
        }

        let region_ptr: *const RegionRecord = {
            let inner = slot.regions.lock();
            match Self::find_region(&inner, addr) {
                Some(r) => r as *const RegionRecord,
                None => {
                    return Err(MemoryError::PolicyRejected {
                        reason: "fault address is not in a registered region",
                    })
                }
            }
        };
        // SAFETY: `RegionRecord`s are heap-boxed and never removed or moved
        // while their address space is registered; `region_ptr` stays
        // valid for at least as long as `id` remains registered, which
        // outlives this call.
        let region = unsafe { &*region_ptr };
        let _fault_guard = region.fault_lock.lock();

        if !mapper.translate(addr).is_null() {
            return Ok(());
        }

        let mut flags = AllocFlags::MOVABLE;
        if region.zero_fill {
            flags |= AllocFlags::ZERO;
        }
        let frame = buddy.alloc_flags(0, flags);
        if frame.is_null() {
            return Err(MemoryError::OutOfMemory {
                requested: crate::config::FRAME_SIZE,
                available: 0,
            });
        }

        let page_flags = pte_bits::WRITABLE | pte_bits::USER | region.extra_flags;
        if !mapper.map(buddy, addr.frame_align_down(), frame, page_flags) {
            buddy.free(frame, 0);
            return Err(MemoryError::OutOfMemory {
                requested: crate::config::FRAME_SIZE,
                available: 0,
            });
        }
        Ok(())
    }

    /// Unregister a region, unmapping and freeing every frame it
    /// currently owns.
    pub fn unregister_region(&self, id: AddressSpaceId, buddy: &BuddyAllocator, start: VirtAddr) {
        let slot = &self.slots[id.0];
        let start = start.frame_align_down();
        let root = *slot.root.lock();
        let mapper = PageMapper::new(root);

        let mut inner = slot.regions.lock();
        let Some(idx) = inner.regions.iter().position(|r| r.start == start) else {
            return;
        };
        let region = inner.regions.remove(idx);

        let pages = region.len / crate::config::FRAME_SIZE as u64;
        for i in 0..pages {
            let page_addr = VirtAddr::new(region.start.as_u64() + i * crate::config::FRAME_SIZE as u64);
            if let Some(frame) = mapper.unmap(page_addr) {
                buddy.free(frame, 0);
            }
        }
    }
}

impl Default for DemandPagingManager {
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

    fn new_space(buddy: &BuddyAllocator, mgr: &DemandPagingManager) -> AddressSpaceId {
        let root = buddy.alloc_flags(0, AllocFlags::UNMOVABLE | AllocFlags::ZERO);
        mgr.register_address_space(root).unwrap()
    }

    #[test]
    fn e3_demand_page_fault_maps_zero_filled_frame() {
        let (_buf, buddy) = seeded_buddy(64);
        let mgr = DemandPagingManager::new();
        let id = new_space(&buddy, &mgr);

        mgr.register_region(id, VirtAddr::new(0x10_0000), 4096, 0, true)
            .unwrap();
        mgr.handle_fault(id, &buddy, VirtAddr::new(0x10_0010)).unwrap();

        let root = *mgr.slots[id.0].root.lock();
        let mapper = PageMapper::new(root);
        assert!(!mapper.translate(VirtAddr::new(0x10_0000)).is_null());
    }

    #[test]
    fn overlapping_region_rejected() {
        let (_buf, buddy) = seeded_buddy(4);
        let mgr = DemandPagingManager::new();
        let id = new_space(&buddy, &mgr);

        mgr.register_region(id, VirtAddr::new(0x1000), 4096 * 4, 0, false)
            .unwrap();
        let result = mgr.register_region(id, VirtAddr::new(0x2000), 4096, 0, false);
        assert!(result.is_err());
    }

    #[test]
    fn fault_outside_any_region_is_rejected() {
        let (_buf, buddy) = seeded_buddy(4);
        let mgr = DemandPagingManager::new();
        let id = new_space(&buddy, &mgr);

        let err = mgr.handle_fault(id, &buddy, VirtAddr::new(0x99_0000));
        assert!(err.is_err());
    }

    #[test]
    fn unregister_region_frees_faulted_frames() {
        let (_buf, buddy) = seeded_buddy(64);
        let mgr = DemandPagingManager::new();
        let id = new_space(&buddy, &mgr);

        mgr.register_region(id, VirtAddr::new(0x5000), 4096, 0, true)
            .unwrap();
        mgr.handle_fault(id, &buddy, VirtAddr::new(0x5000)).unwrap();
        let before = buddy.free_pages();

        mgr.unregister_region(id, &buddy, VirtAddr::new(0x5000));
        assert_eq!(buddy.free_pages(), before + 1);
    }
}
