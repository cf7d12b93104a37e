//! Memory management core.
//!
//! Four layered services over physical RAM: page-granular buddy allocation
//! (L1), a slab cache and object pool and general heap on top of it (L2),
//! and virtual-memory region management with demand paging, copy-on-write
//! sharing, and a fixed-size page cache (L3). See `SPEC_FULL.md` for the
//! full module map.
//!
//! Everything in this module is reachable either directly from the boot
//! path (`subsystem::MemorySubsystem::init`) or from the page-fault
//! dispatcher (`page_fault::dispatch`).

pub mod buddy;
pub mod cow;
pub mod demand_paging;
pub mod direct_map;
pub mod heap;
pub mod memmap;
pub mod page_cache;
pub mod page_fault;
pub mod page_ref;
pub mod page_table;
pub mod pool;
pub mod slab;
pub mod subsystem;

pub use subsystem::MemorySubsystem;

use crate::config::FRAME_SIZE;

/// A physical address. Frame-granular APIs always pass/return addresses
/// aligned to [`FRAME_SIZE`]; this type does not itself enforce alignment
/// so it can also describe a byte offset within a frame (PTE frame bases
/// are always aligned by construction of the allocator that produced
/// them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const NULL: PhysAddr = PhysAddr(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Round down to frame granularity.
    pub const fn frame_align_down(self) -> Self {
        Self(self.0 & !((FRAME_SIZE as u64) - 1))
    }

    /// Round up to frame granularity.
    pub const fn frame_align_up(self) -> Self {
        Self((self.0 + FRAME_SIZE as u64 - 1) & !((FRAME_SIZE as u64) - 1))
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// A virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn frame_align_down(self) -> Self {
        Self(self.0 & !((FRAME_SIZE as u64) - 1))
    }

    pub const fn frame_align_up(self) -> Self {
        Self((self.0 + FRAME_SIZE as u64 - 1) & !((FRAME_SIZE as u64) - 1))
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Zone policy tags. Every frame belongs to exactly one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Zone {
    /// Kernel-internal allocations that can never move or be reclaimed.
    Unmovable = 0,
    /// Frames the kernel may evict under pressure.
    Reclaimable = 1,
    /// User pages, relocatable in principle.
    Movable = 2,
}

impl Zone {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        self as usize
    }

    /// The zone allocations fall back to when no specific zone is
    /// requested or an invalid zone tag is supplied (see spec.md's
    /// "zone clamped to default" failure rule).
    pub const DEFAULT: Zone = Zone::Unmovable;
}

bitflags::bitflags! {
    /// Flags accepted by `alloc_flags`. `ZERO` requests the returned block
    /// be zero-filled; the rest select a zone with priority
    /// MOVABLE > RECLAIMABLE > UNMOVABLE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        const ZERO        = 1 << 0;
        const MOVABLE      = 1 << 1;
        const RECLAIMABLE  = 1 << 2;
        const UNMOVABLE    = 1 << 3;
    }
}

impl AllocFlags {
    /// Extract a zone from these flags, MOVABLE > RECLAIMABLE > UNMOVABLE,
    /// defaulting to [`Zone::DEFAULT`].
    pub fn zone(self) -> Zone {
        if self.contains(AllocFlags::MOVABLE) {
            Zone::Movable
        } else if self.contains(AllocFlags::RECLAIMABLE) {
            Zone::Reclaimable
        } else if self.contains(AllocFlags::UNMOVABLE) {
            Zone::Unmovable
        } else {
            Zone::DEFAULT
        }
    }
}

/// PTE flag bits the core consumes. Bits 12..51 (not modeled here) carry
/// the frame base; see `page_table::PteFlags`.
pub mod pte_bits {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const COW: u64 = 1 << 9;
    pub const NO_EXECUTE: u64 = 1 << 63;
}
