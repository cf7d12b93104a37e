//! L3: page-fault dispatch.
//!
//! The architecture trap handler hands this module a faulting address and
//! an error code; it never knows about regions, COW, or address spaces
//! itself. `dispatch` resolves the active address space from the live
//! page-table root, then tries copy-on-write (only plausible on a write
//! fault against a present page) before falling back to demand paging.
//! Either handler's `PolicyRejected` means "not mine", letting the other
//! have a turn; any other error is terminal and propagates to the caller,
//! which is expected to panic.

use crate::arch::x86_64::mmu::{self, PageFaultErrorCode};
use crate::error::{MemoryError, MemoryResult};
use crate::mm::{cow, page_table::PageMapper, subsystem, VirtAddr};

/// Resolve a hardware page fault. Returns `Ok(())` once some handler has
/// installed or repaired the mapping; the caller may safely retry the
/// faulting instruction.
pub fn dispatch(faulting_address: VirtAddr, error: PageFaultErrorCode) -> MemoryResult<()> {
    let memory = subsystem::global().ok_or(MemoryError::NotInitialized { subsystem: "mm" })?;

    let root = mmu::read_cr3();
    let id = memory
        .demand_paging
        .find_by_root(root)
        .ok_or(MemoryError::PolicyRejected {
            reason: "fault in an address space with no registered root",
        })?;
    let mapper = PageMapper::new(root);

    if error.write() && error.protection_violation() {
        match cow::handle_fault(&mapper, &memory.page_ref, &memory.buddy, faulting_address) {
            Ok(()) => return Ok(()),
            Err(MemoryError::PolicyRejected { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    memory
        .demand_paging
        .handle_fault(id, &memory.buddy, faulting_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{pte_bits, subsystem::MemorySubsystem, AllocFlags};

    fn error_code(write: bool, protection_violation: bool) -> PageFaultErrorCode {
        let mut raw = 0u32;
        if protection_violation {
            raw |= 0x1;
        }
        if write {
            raw |= 0x2;
        }
        PageFaultErrorCode::new(raw)
    }

    #[test]
    fn demand_page_fault_dispatches_without_cow() {
        let memory = MemorySubsystem::new_for_test(64);
        let root = memory.buddy.alloc_flags(0, AllocFlags::UNMOVABLE | AllocFlags::ZERO);
        let id = memory.demand_paging.register_address_space(root).unwrap();
        memory
            .demand_paging
            .register_region(id, VirtAddr::new(0x20_0000), 4096, 0, true)
            .unwrap();

        let mapper = PageMapper::new(root);
        assert!(mapper.translate(VirtAddr::new(0x20_0000)).is_null());
        memory
            .demand_paging
            .handle_fault(id, &memory.buddy, VirtAddr::new(0x20_0000))
            .unwrap();
        assert!(!mapper.translate(VirtAddr::new(0x20_0000)).is_null());
    }

    #[test]
    fn cow_fault_resolves_single_owner_in_place() {
        let memory = MemorySubsystem::new_for_test(64);
        let root = memory.buddy.alloc_flags(0, AllocFlags::UNMOVABLE | AllocFlags::ZERO);
        let virt = VirtAddr::new(0x30_0000);
        let mapper = PageMapper::new(root);
        let frame = memory.buddy.alloc(0, crate::mm::Zone::Unmovable);
        mapper.map(&memory.buddy, virt, frame, pte_bits::WRITABLE | pte_bits::USER);
        cow::mark(&mapper, &memory.page_ref, virt).unwrap();

        cow::handle_fault(&mapper, &memory.page_ref, &memory.buddy, virt).unwrap();
        // SAFETY: test-owned pointer.
        let flags = unsafe { (*mapper.pte_ptr(virt)).flags() };
        assert_ne!(flags & pte_bits::WRITABLE, 0);
        assert_eq!(flags & pte_bits::COW, 0);
        let _ = error_code(true, true);
    }
}
