//! The memory subsystem, assembled once at boot.
//!
//! Every L2/L3 collaborator shares the same [`buddy::BuddyAllocator`] and
//! the COW engine and demand paging share the same
//! [`page_ref::PageRefTable`] -- wiring that belongs in one place rather
//! than scattered across call sites. `init` builds that value from the
//! bootloader's memory map and publishes it through [`global`]; the
//! page-fault dispatcher and any driver needing `kmalloc` reach it from
//! there.

use crate::config::PAGE_CACHE_DEFAULT_CAPACITY;
use crate::error::{MemoryError, MemoryResult};
use crate::log_service::{klog, LogLevel};
use crate::mm::{
    buddy::BuddyAllocator, demand_paging::DemandPagingManager, heap::Heap, memmap,
    page_cache::PageCache, page_ref::PageRefTable,
};
use crate::sync::OnceLock;

/// The assembled memory subsystem. Fields are `pub(crate)` rather than
/// hidden behind accessors -- every collaborator here is itself
/// internally synchronized, so there is no invariant an accessor method
/// would protect that the field access doesn't already.
pub struct MemorySubsystem {
    pub buddy: BuddyAllocator,
    pub heap: Heap,
    pub page_ref: PageRefTable,
    pub demand_paging: DemandPagingManager,
    pub page_cache: PageCache,
}

impl MemorySubsystem {
    fn assemble(buddy: BuddyAllocator) -> Self {
        let heap = Heap::new(&buddy);
        Self {
            buddy,
            heap,
            page_ref: PageRefTable::new(),
            demand_paging: DemandPagingManager::new(),
            page_cache: PageCache::new(PAGE_CACHE_DEFAULT_CAPACITY),
        }
    }

    /// Seed the buddy allocator from the bootloader's memory map, build
    /// the rest of the subsystem on top, and publish it as the process-wide
    /// instance. Must run exactly once, before any `mm` collaborator or the
    /// page-fault dispatcher is reachable.
    pub fn init(regions: &bootloader_api::info::MemoryRegions) -> MemoryResult<()> {
        let region = memmap::largest_usable(regions).ok_or(MemoryError::OutOfMemory {
            requested: crate::config::FRAME_SIZE,
            available: 0,
        })?;

        klog(
            LogLevel::Info,
            "mm",
            "seeding buddy allocator from bootloader memory map",
        );

        let buddy = BuddyAllocator::new();
        buddy.seed_zone(crate::mm::Zone::DEFAULT, region.start, region.len);

        let subsystem = Self::assemble(buddy);
        GLOBAL
            .set(subsystem)
            .map_err(|_| MemoryError::PolicyRejected {
                reason: "memory subsystem already initialized",
            })
    }

    /// Build a subsystem backed by a heap buffer standing in for physical
    /// RAM, for host-target tests that want the full wiring (demand
    /// paging + COW sharing one page-ref table, one buddy allocator)
    /// without going through `init`'s bootloader dependency. Leaks the
    /// backing buffer, since the returned value is meant to live for the
    /// rest of the test.
    #[cfg(not(target_os = "none"))]
    pub fn new_for_test(frames: u64) -> Self {
        let size = (frames * crate::config::FRAME_SIZE as u64) as usize;
        let buf = alloc::vec![0u8; size + crate::config::FRAME_SIZE].leak();
        let raw = buf.as_mut_ptr() as u64;
        let aligned = (raw + crate::config::FRAME_SIZE as u64 - 1)
            & !(crate::config::FRAME_SIZE as u64 - 1);

        let buddy = BuddyAllocator::new();
        buddy.seed_zone(
            crate::mm::Zone::DEFAULT,
            crate::mm::PhysAddr::new(aligned),
            frames * crate::config::FRAME_SIZE as u64,
        );
        Self::assemble(buddy)
    }
}

static GLOBAL: OnceLock<MemorySubsystem> = OnceLock::new();

/// The process-wide memory subsystem, once [`MemorySubsystem::init`] has run.
pub fn global() -> Option<&'static MemorySubsystem> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_for_test_produces_a_working_buddy_allocator() {
        let memory = MemorySubsystem::new_for_test(16);
        assert_eq!(memory.buddy.total_pages(), 16);
        assert_eq!(memory.buddy.free_pages(), 16);
    }

    #[test]
    fn collaborators_share_one_buddy_allocator() {
        let memory = MemorySubsystem::new_for_test(16);
        let ptr = memory.heap.kmalloc(&memory.buddy, 32);
        assert!(!ptr.is_null());
        let before = memory.buddy.free_pages();
        memory.heap.kfree(&memory.buddy, ptr);
        assert_eq!(memory.buddy.free_pages(), before);
    }
}
