//! L3: copy-on-write.
//!
//! `mark` flips a present, writable leaf into a shared read-only mapping
//! (typically during fork-like address-space duplication); `handle_fault`
//! resolves the write fault that follows. It shares [`crate::mm::page_ref`]
//! with demand paging -- a COW-shared frame and a lazily-faulted-in frame
//! use the same refcount entry shape, just reached from different call
//! sites.

use crate::error::{MemoryError, MemoryResult};
use crate::log_service::{klog, LogLevel};
use crate::mm::{
    buddy::BuddyAllocator, direct_map, page_ref::PageRefTable, page_table::PageMapper, pte_bits,
    AllocFlags, VirtAddr,
};

/// Mark the leaf mapping `virt` as copy-on-write: clear WRITABLE, set
/// COW, and register (or bump) the frame's entry in `refs`. Idempotent --
/// calling this twice on the same already-COW page is a no-op past the
/// first `inc`, matching how a fork walks a parent's mappings once per
/// child without needing to know if a grandchild already shares them.
pub fn mark(mapper: &PageMapper, refs: &PageRefTable, virt: VirtAddr) -> MemoryResult<()> {
    let entry_ptr = mapper.pte_ptr(virt);
    if entry_ptr.is_null() {
        return Err(MemoryError::InvalidArgument { name: "virt" });
    }
    // SAFETY: non-null, produced by `pte_ptr` against a table the caller
    // owns for the duration of this call.
    let entry = unsafe { &mut *entry_ptr };
    let Some(frame) = entry.frame() else {
        return Err(MemoryError::Corruption {
            detail: "mark: leaf not present",
        });
    };

    if entry.flags() & pte_bits::COW == 0 {
        refs.get_or_create(frame);
        refs.inc(frame);
        let flags = (entry.flags() & !pte_bits::WRITABLE) | pte_bits::COW;
        entry.set(frame, flags);
        crate::arch::x86_64::mmu::flush_tlb_address(virt);
    }
    Ok(())
}

/// Resolve a write fault on a COW leaf.
///
/// If the frame's refcount is 1 (this mapping is the last owner), the
/// entry is decremented to 0 *without freeing the frame* -- the PTE still
/// owns it, it was just never shared after all. Otherwise a private copy
/// is made, the old frame's share is released, and the leaf is rewritten
/// to point at the copy, writable and no longer marked COW.
pub fn handle_fault(
    mapper: &PageMapper,
    refs: &PageRefTable,
    buddy: &BuddyAllocator,
    virt: VirtAddr,
) -> MemoryResult<()> {
    let entry_ptr = mapper.pte_ptr(virt);
    if entry_ptr.is_null() {
        return Err(MemoryError::PolicyRejected {
            reason: "no leaf mapping at fault address",
        });
    }
    // SAFETY: non-null, produced by `pte_ptr`.
    let entry = unsafe { &mut *entry_ptr };
    if entry.flags() & pte_bits::COW == 0 {
        return Err(MemoryError::PolicyRejected {
            reason: "leaf is not COW-marked",
        });
    }
    let Some(old_frame) = entry.frame() else {
        return Err(MemoryError::Corruption {
            detail: "handle_fault: leaf not present",
        });
    };

    let refcount = refs.ref_count(old_frame);
    if refcount <= 1 {
        // Last (or only) owner: reclaim exclusive write access in place.
        refs.dec_without_freeing(old_frame);
        let flags = (entry.flags() & !pte_bits::COW) | pte_bits::WRITABLE;
        entry.set(old_frame, flags);
    } else {
        let new_frame = buddy.alloc_flags(0, AllocFlags::UNMOVABLE);
        if new_frame.is_null() {
            return Err(MemoryError::OutOfMemory {
                requested: crate::config::FRAME_SIZE,
                available: 0,
            });
        }
        // SAFETY: `old_frame` is read-shared (we still hold a reference
        // via `refcount`), `new_frame` is exclusively ours.
        unsafe { direct_map::copy(old_frame, new_frame, crate::config::FRAME_SIZE) };
        refs.dec(buddy, old_frame);

        let flags = (entry.flags() & !pte_bits::COW) | pte_bits::WRITABLE;
        entry.set(new_frame, flags);
    }

    crate::arch::x86_64::mmu::flush_tlb_address(virt);
    Ok(())
}

impl PageRefTable {
    /// Decrement a refcount to zero without returning the frame to the
    /// buddy allocator -- used when the caller (the COW fault path) knows
    /// a different owner (the PTE itself) still holds the frame.
    pub fn dec_without_freeing(&self, phys: crate::mm::PhysAddr) {
        let had = self.ref_count(phys);
        if had == 0 {
            klog(LogLevel::Warn, "cow", "dec_without_freeing on untracked frame");
        }
        self.force_zero(phys);
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

    fn mapped(buddy: &BuddyAllocator, virt: VirtAddr) -> PageMapper {
        let root = buddy.alloc_flags(0, AllocFlags::UNMOVABLE | AllocFlags::ZERO);
        let mapper = PageMapper::new(root);
        let frame = buddy.alloc(0, crate::mm::Zone::Unmovable);
        mapper.map(buddy, virt, frame, pte_bits::WRITABLE | pte_bits::USER);
        mapper
    }

    #[test]
    fn e4_mark_clears_writable_sets_cow() {
        let (_buf, buddy) = seeded_buddy(64);
        let refs = PageRefTable::new();
        let virt = VirtAddr::new(0x4000);
        let mapper = mapped(&buddy, virt);

        mark(&mapper, &refs, virt).unwrap();
        // SAFETY: test-owned pointer.
        let flags = unsafe { (*mapper.pte_ptr(virt)).flags() };
        assert_eq!(flags & pte_bits::WRITABLE, 0);
        assert_ne!(flags & pte_bits::COW, 0);
    }

    #[test]
    fn e5_fault_with_single_owner_reuses_frame() {
        let (_buf, buddy) = seeded_buddy(64);
        let refs = PageRefTable::new();
        let virt = VirtAddr::new(0x6000);
        let mapper = mapped(&buddy, virt);
        let original = mapper.translate(virt);

        mark(&mapper, &refs, virt).unwrap();
        handle_fault(&mapper, &refs, &buddy, virt).unwrap();

        assert_eq!(mapper.translate(virt), original);
        // SAFETY: test-owned pointer.
        let flags = unsafe { (*mapper.pte_ptr(virt)).flags() };
        assert_ne!(flags & pte_bits::WRITABLE, 0);
        assert_eq!(flags & pte_bits::COW, 0);
    }

    #[test]
    fn e6_fault_with_shared_owners_copies_frame() {
        let (_buf, buddy) = seeded_buddy(64);
        let refs = PageRefTable::new();
        let virt = VirtAddr::new(0x7000);
        let mapper = mapped(&buddy, virt);
        let original = mapper.translate(virt);

        mark(&mapper, &refs, virt).unwrap();
        refs.inc(original); // simulate a second sharer (e.g. a fork child)

        handle_fault(&mapper, &refs, &buddy, virt).unwrap();

        let after = mapper.translate(virt);
        assert_ne!(after, original, "shared frame must be copied, not reused");
        assert_eq!(refs.ref_count(original), 1, "old frame keeps the other sharer's ref");
    }
}
