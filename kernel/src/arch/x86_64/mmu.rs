//! x86_64 Memory Management Unit (MMU) support.
//!
//! CR3/CR2/invlpg access. These are privileged instructions and only
//! valid on the bare-metal target; the host test target (where `mm`'s
//! own property tests run against explicit `PhysAddr` roots, never CR3)
//! gets harmless stand-ins instead of faulting the test process.

use crate::mm::{PhysAddr, VirtAddr};

#[cfg(target_os = "none")]
pub fn init() {
    println!("[x86_64 MMU] Initializing paging...");
    let cr3 = read_cr3();
    println!("[x86_64 MMU] Current CR3: 0x{:x}", cr3.as_u64());
}

#[cfg(not(target_os = "none"))]
pub fn init() {}

/// Read CR3 (the active page-table root).
#[cfg(target_os = "none")]
pub fn read_cr3() -> PhysAddr {
    let cr3: u64;
    // SAFETY: reading CR3 is always valid in ring 0.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3);
    }
    PhysAddr::new(cr3 & 0x000F_FFFF_FFFF_F000)
}

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> PhysAddr {
    PhysAddr::NULL
}

/// Load CR3, switching the active page-table root and implicitly
/// flushing the TLB.
///
/// # Safety
/// `addr` must be a properly aligned, live PML4 table.
#[cfg(target_os = "none")]
pub unsafe fn write_cr3(addr: PhysAddr) {
    core::arch::asm!("mov cr3, {}", in(reg) addr.as_u64());
}

#[cfg(not(target_os = "none"))]
pub unsafe fn write_cr3(_addr: PhysAddr) {}

/// Invalidate the TLB entry for `virt`.
///
/// # Safety
/// Only ever unsafe in the sense that skipping it after a mapping change
/// can expose a stale translation; the instruction itself has no memory
/// safety requirements.
#[cfg(target_os = "none")]
pub fn invlpg(virt: VirtAddr) {
    // SAFETY: invlpg only invalidates cached translations, no side effects
    // beyond that.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64());
    }
}

#[cfg(not(target_os = "none"))]
pub fn invlpg(_virt: VirtAddr) {}

pub fn flush_tlb() {
    #[cfg(target_os = "none")]
    {
        let cr3 = read_cr3();
        // SAFETY: reloading the current root is always valid.
        unsafe { write_cr3(cr3) };
    }
}

pub fn flush_tlb_address(virt: VirtAddr) {
    invlpg(virt);
}

/// Read CR2 (the faulting address from the last page fault).
#[cfg(target_os = "none")]
pub fn read_cr2() -> VirtAddr {
    let cr2: u64;
    // SAFETY: reading CR2 is always valid in ring 0.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2);
    }
    VirtAddr::new(cr2)
}

#[cfg(not(target_os = "none"))]
pub fn read_cr2() -> VirtAddr {
    VirtAddr::new(0)
}

/// Page-fault error code, as pushed by the CPU onto the exception frame.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultErrorCode(u32);

impl PageFaultErrorCode {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn protection_violation(&self) -> bool {
        self.0 & 0x1 != 0
    }

    pub fn write(&self) -> bool {
        self.0 & 0x2 != 0
    }

    pub fn user_mode(&self) -> bool {
        self.0 & 0x4 != 0
    }

    pub fn reserved_write(&self) -> bool {
        self.0 & 0x8 != 0
    }

    pub fn instruction_fetch(&self) -> bool {
        self.0 & 0x10 != 0
    }
}

/// Dispatch a hardware page fault: try demand paging, then COW, and only
/// panic if neither handler claims the fault.
#[cfg(target_os = "none")]
pub fn handle_page_fault(error_code: u32, faulting_address: VirtAddr) {
    let error = PageFaultErrorCode::new(error_code);
    match crate::mm::page_fault::dispatch(faulting_address, error) {
        Ok(()) => {}
        Err(e) => {
            println!(
                "[x86_64 MMU] Unhandled page fault at 0x{:x}: {}",
                faulting_address.as_u64(),
                e
            );
            println!(
                "  protection_violation={} write={} user_mode={} reserved_write={} instruction_fetch={}",
                error.protection_violation(),
                error.write(),
                error.user_mode(),
                error.reserved_write(),
                error.instruction_fetch(),
            );
            panic!("unhandled page fault at 0x{:x}", faulting_address.as_u64());
        }
    }
}

#[cfg(not(target_os = "none"))]
pub fn handle_page_fault(_error_code: u32, _faulting_address: VirtAddr) {}
