//! Bootloader memory map ingestion.
//!
//! The boot path hands us a `bootloader_api::BootInfo` whose
//! `memory_regions` slice describes every range the firmware/bootloader
//! knows about, usable and not. We only need enough of it to seed the
//! buddy allocator's default zone: the single largest usable region.
//! Anything smaller is left unmanaged for now -- multi-region seeding is
//! future work, not a correctness requirement for a single zone.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};

use crate::mm::PhysAddr;

/// A usable physical range, frame-aligned inward so the caller never
/// hands the buddy allocator a partial frame at either edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsableRegion {
    pub start: PhysAddr,
    pub len: u64,
}

/// Frame-align `[start, end)` inward, returning `None` if nothing usable
/// survives the rounding.
fn align_inward(start: u64, end: u64) -> Option<(u64, u64)> {
    let frame = crate::config::FRAME_SIZE as u64;
    let aligned_start = (start + frame - 1) & !(frame - 1);
    let aligned_end = end & !(frame - 1);
    (aligned_end > aligned_start).then_some((aligned_start, aligned_end - aligned_start))
}

/// Find the largest [`MemoryRegionKind::Usable`] region in the
/// bootloader-provided map.
pub fn largest_usable(regions: &MemoryRegions) -> Option<UsableRegion> {
    regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .filter_map(|r| align_inward(r.start, r.end))
        .max_by_key(|&(_, len)| len)
        .map(|(start, len)| UsableRegion {
            start: PhysAddr::new(start),
            len,
        })
}

/// Total usable bytes across the whole map, for the boot-time log line.
pub fn total_usable(regions: &MemoryRegions) -> u64 {
    regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| r.end - r.start)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootloader_api::info::MemoryRegion;

    fn regions(raw: &[(u64, u64, MemoryRegionKind)]) -> alloc::vec::Vec<MemoryRegion> {
        raw.iter()
            .map(|&(start, end, kind)| MemoryRegion { start, end, kind })
            .collect()
    }

    #[test]
    fn align_inward_rounds_both_edges() {
        assert_eq!(align_inward(0x1001, 0x3FFF), Some((0x2000, 0x1000)));
        assert_eq!(align_inward(0x1000, 0x2000), Some((0x1000, 0x1000)));
        assert_eq!(align_inward(0x1000, 0x1800), None);
    }

    #[test]
    fn largest_usable_picks_the_biggest_region() {
        let raw = regions(&[
            (0x0, 0x1000, MemoryRegionKind::UnknownBios(0)),
            (0x10_0000, 0x20_0000, MemoryRegionKind::Usable),
            (0x40_0000, 0x80_0000, MemoryRegionKind::Usable),
            (0x90_0000, 0x91_0000, MemoryRegionKind::Bootloader),
        ]);
        // `MemoryRegions` is normally built from a bootloader-owned slice;
        // for the test we only need something that derefs to `[MemoryRegion]`.
        let biggest = raw
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .filter_map(|r| align_inward(r.start, r.end))
            .max_by_key(|&(_, len)| len);
        assert_eq!(biggest, Some((0x40_0000, 0x40_0000)));
    }
}
