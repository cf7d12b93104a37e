//! L1: buddy allocator.
//!
//! Page-granular physical allocation in zones, orders `0..=10`. The free
//! list node for a block lives in-block (the first machine word of the
//! block itself while it is free) rather than in a side table, so the
//! block is the node -- there is nothing to arena-allocate here.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{BUDDY_MAX_ORDER, FRAME_SIZE};
use crate::log_service::{klog, LogLevel};
use crate::mm::{direct_map, PhysAddr, Zone};
use crate::sync::SpinLock;

const ORDER_COUNT: usize = BUDDY_MAX_ORDER + 1;

/// Per-order, per-zone free-list + allocation-bitmap state.
struct ZoneState {
    /// Base physical address owned by this zone, `None` if unseeded.
    region_start: PhysAddr,
    /// Total frames covered by `region_start..region_start+frame_count*FRAME_SIZE`.
    frame_count: u64,
    /// Head of the free list for each order; `None` means empty.
    free_lists: [Option<PhysAddr>; ORDER_COUNT],
    /// One bit per frame: set iff that frame is the head of a live
    /// allocation. Indexed relative to `region_start`.
    alloc_bitmap: Vec<u8>,
    free_pages: u64,
    total_pages: u64,
}

impl ZoneState {
    const fn empty() -> Self {
        Self {
            region_start: PhysAddr::NULL,
            frame_count: 0,
            free_lists: [None; ORDER_COUNT],
            alloc_bitmap: Vec::new(),
            free_pages: 0,
            total_pages: 0,
        }
    }

    fn seeded(&self) -> bool {
        self.frame_count > 0
    }

    fn page_index(&self, addr: PhysAddr) -> u64 {
        (addr.as_u64() - self.region_start.as_u64()) / FRAME_SIZE as u64
    }

    fn addr_of(&self, page_index: u64) -> PhysAddr {
        PhysAddr::new(self.region_start.as_u64() + page_index * FRAME_SIZE as u64)
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        self.seeded()
            && addr.as_u64() >= self.region_start.as_u64()
            && addr.as_u64() < self.region_start.as_u64() + self.frame_count * FRAME_SIZE as u64
    }

    fn set_alloc_bit(&mut self, page_index: u64) {
        let byte = (page_index / 8) as usize;
        let bit = (page_index % 8) as u8;
        if byte < self.alloc_bitmap.len() {
            self.alloc_bitmap[byte] |= 1 << bit;
        }
    }

    fn clear_alloc_bit(&mut self, page_index: u64) {
        let byte = (page_index / 8) as usize;
        let bit = (page_index % 8) as u8;
        if byte < self.alloc_bitmap.len() {
            self.alloc_bitmap[byte] &= !(1 << bit);
        }
    }

    fn alloc_bit_set(&self, page_index: u64) -> bool {
        let byte = (page_index / 8) as usize;
        let bit = (page_index % 8) as u8;
        self.alloc_bitmap
            .get(byte)
            .map(|b| (b >> bit) & 1 != 0)
            .unwrap_or(false)
    }

    /// Read the in-block `next` link of a free block.
    fn read_next(addr: PhysAddr) -> Option<PhysAddr> {
        // SAFETY: `addr` is the head of a free block we are about to pop;
        // free blocks are exclusively owned by this zone's lock holder.
        let raw = unsafe { direct_map::read::<u64>(addr, 0) };
        if raw == 0 {
            None
        } else {
            Some(PhysAddr::new(raw))
        }
    }

    fn write_next(addr: PhysAddr, next: Option<PhysAddr>) {
        let raw = next.map(PhysAddr::as_u64).unwrap_or(0);
        // SAFETY: `addr` is a free block owned by this zone's lock holder.
        unsafe { direct_map::write::<u64>(addr, 0, raw) };
    }

    fn list_push(&mut self, order: usize, addr: PhysAddr) {
        Self::write_next(addr, self.free_lists[order]);
        self.free_lists[order] = Some(addr);
    }

    fn list_pop(&mut self, order: usize) -> Option<PhysAddr> {
        let head = self.free_lists[order]?;
        self.free_lists[order] = Self::read_next(head);
        Some(head)
    }

    /// Remove a specific block from an order's free list, if present.
    fn list_remove(&mut self, order: usize, target: PhysAddr) -> bool {
        let mut cur = self.free_lists[order];
        let mut prev: Option<PhysAddr> = None;
        while let Some(addr) = cur {
            let next = Self::read_next(addr);
            if addr == target {
                match prev {
                    None => self.free_lists[order] = next,
                    Some(p) => Self::write_next(p, next),
                }
                return true;
            }
            prev = Some(addr);
            cur = next;
        }
        false
    }

    fn list_contains(&self, order: usize, target: PhysAddr) -> bool {
        let mut cur = self.free_lists[order];
        while let Some(addr) = cur {
            if addr == target {
                return true;
            }
            cur = Self::read_next(addr);
        }
        false
    }

    fn list_len(&self, order: usize) -> usize {
        let mut n = 0;
        let mut cur = self.free_lists[order];
        while let Some(addr) = cur {
            n += 1;
            cur = Self::read_next(addr);
        }
        n
    }

    fn seed(&mut self, start: PhysAddr, size: u64) {
        let frame_count = size / FRAME_SIZE as u64;
        self.region_start = start;
        self.frame_count = frame_count;
        self.alloc_bitmap = vec![0u8; ((frame_count + 7) / 8) as usize];
        self.total_pages = frame_count;
        self.free_pages = 0;
        self.free_lists = [None; ORDER_COUNT];

        // Greedy decomposition: at each step pick the largest order such
        // that 2^k frames fit and the current base is 2^k-aligned.
        let mut base_index = 0u64;
        while base_index < frame_count {
            let remaining = frame_count - base_index;
            let mut k = BUDDY_MAX_ORDER;
            loop {
                let block_frames = 1u64 << k;
                if block_frames <= remaining && base_index % block_frames == 0 {
                    break;
                }
                if k == 0 {
                    break;
                }
                k -= 1;
            }
            let addr = self.addr_of(base_index);
            self.list_push(k, addr);
            self.free_pages += 1u64 << k;
            base_index += 1u64 << k;
        }
    }
}

/// Page-granular physical allocator. Owns one [`ZoneState`] per
/// [`Zone`] variant, each behind its own lock (spec.md §4.2/§5: "One lock
/// per zone. A single alloc or free takes the lock of exactly one zone.").
pub struct BuddyAllocator {
    zones: [SpinLock<ZoneState>; Zone::COUNT],
}

impl BuddyAllocator {
    pub const fn new() -> Self {
        Self {
            zones: [
                SpinLock::new(ZoneState::empty()),
                SpinLock::new(ZoneState::empty()),
                SpinLock::new(ZoneState::empty()),
            ],
        }
    }

    /// Seed a zone with a contiguous physical region via greedy buddy
    /// decomposition. `start`/`size` must be frame-aligned.
    pub fn seed_zone(&self, zone: Zone, start: PhysAddr, size: u64) {
        self.zones[zone.index()].lock().seed(start, size);
    }

    /// Seed the default zone ([`Zone::DEFAULT`]) -- the boot path's entry
    /// point, called once with the largest usable region from the
    /// memory map.
    pub fn init(&self, start: PhysAddr, size: u64) {
        self.seed_zone(Zone::DEFAULT, start, size);
    }

    fn zone_owning(&self, phys: PhysAddr) -> Option<usize> {
        for (i, z) in self.zones.iter().enumerate() {
            if z.lock().contains(phys) {
                return Some(i);
            }
        }
        None
    }

    /// `alloc(order, zone) -> phys | 0`.
    pub fn alloc(&self, order: usize, zone: Zone) -> PhysAddr {
        if order > BUDDY_MAX_ORDER {
            klog(LogLevel::Warn, "buddy", "invalid order, returning 0");
            return PhysAddr::NULL;
        }

        let mut z = self.zones[zone.index()].lock();
        let mut found = None;
        for j in order..ORDER_COUNT {
            if z.free_lists[j].is_some() {
                found = Some(j);
                break;
            }
        }
        let Some(mut j) = found else {
            return PhysAddr::NULL;
        };

        let block = z.list_pop(j).expect("checked non-empty above");
        while j > order {
            j -= 1;
            let upper_half = z.addr_of(z.page_index(block) + (1u64 << j));
            z.list_push(j, upper_half);
        }

        let block_index = z.page_index(block);
        z.set_alloc_bit(block_index);
        z.free_pages -= 1u64 << order;
        block
    }

    /// `alloc_flags(order, flags) -> phys | 0`.
    pub fn alloc_flags(&self, order: usize, flags: crate::mm::AllocFlags) -> PhysAddr {
        let phys = self.alloc(order, flags.zone());
        if !phys.is_null() && flags.contains(crate::mm::AllocFlags::ZERO) {
            let bytes = (1usize << order) * FRAME_SIZE;
            // SAFETY: `phys` was just returned by `alloc`, exclusively
            // owned by the caller.
            unsafe { direct_map::zero(phys, bytes) };
        }
        phys
    }

    /// `free(phys, order)`.
    pub fn free(&self, phys: PhysAddr, order: usize) {
        if phys.is_null() || order > BUDDY_MAX_ORDER {
            klog(LogLevel::Warn, "buddy", "invalid free argument, ignored");
            return;
        }
        let Some(zone_idx) = self.zone_owning(phys) else {
            klog(LogLevel::Warn, "buddy", "free of address outside any zone");
            return;
        };

        let mut z = self.zones[zone_idx].lock();
        let mut cur_order = order;
        let mut cur_addr = phys;
        let cur_index = z.page_index(cur_addr);
        z.clear_alloc_bit(cur_index);

        while cur_order < BUDDY_MAX_ORDER {
            let buddy_index = z.page_index(cur_addr) ^ (1u64 << cur_order);
            let buddy_addr = z.addr_of(buddy_index);
            if !z.contains(buddy_addr) {
                break;
            }
            if z.alloc_bit_set(buddy_index) {
                break;
            }
            if !z.list_contains(cur_order, buddy_addr) {
                break;
            }
            z.list_remove(cur_order, buddy_addr);
            cur_addr = PhysAddr::new(cur_addr.as_u64().min(buddy_addr.as_u64()));
            cur_order += 1;
        }

        z.list_push(cur_order, cur_addr);
        z.free_pages += 1u64 << order;
    }

    /// Aggregate free-page count across all zones. Approximate under
    /// contention by design (spec.md §4.2): each zone is locked briefly
    /// and summed, with no global snapshot.
    pub fn free_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.lock().free_pages).sum()
    }

    pub fn total_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.lock().total_pages).sum()
    }

    pub fn free_pages_in(&self, zone: Zone) -> u64 {
        self.zones[zone.index()].lock().free_pages
    }

    pub fn total_pages_in(&self, zone: Zone) -> u64 {
        self.zones[zone.index()].lock().total_pages
    }

    /// Number of free blocks currently resident at `order` in the default
    /// zone (used by the E1 coalesce scenario and similar property tests).
    pub fn order_stats(&self, order: usize) -> usize {
        self.order_stats_in(Zone::DEFAULT, order)
    }

    pub fn order_stats_in(&self, zone: Zone, order: usize) -> usize {
        if order > BUDDY_MAX_ORDER {
            return 0;
        }
        self.zones[zone.index()].lock().list_len(order)
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::AllocFlags;

    /// Back a zone with an ordinary heap buffer so the direct map's
    /// host-target identity mapping can address it as "physical" memory.
    fn test_region(frames: u64) -> (Vec<u8>, PhysAddr, u64) {
        let size = (frames * FRAME_SIZE as u64) as usize;
        // Over-allocate so we can align the base to the largest order we
        // might seed, then trim.
        let mut buf = vec![0u8; size + FRAME_SIZE];
        let raw = buf.as_mut_ptr() as u64;
        let aligned = (raw + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        (buf, PhysAddr::new(aligned), frames * FRAME_SIZE as u64)
    }

    #[test]
    fn e1_buddy_coalesce() {
        let (_buf, start, size) = test_region(16);
        let allocator = BuddyAllocator::new();
        allocator.init(start, size);

        let a = allocator.alloc(0, Zone::DEFAULT);
        let b = allocator.alloc(0, Zone::DEFAULT);
        assert!(!a.is_null());
        assert!(!b.is_null());

        allocator.free(a, 0);
        allocator.free(b, 0);

        assert_eq!(allocator.order_stats(0), 0);
        let higher_orders: usize = (1..=crate::config::BUDDY_MAX_ORDER)
            .map(|k| allocator.order_stats(k))
            .sum();
        assert_eq!(higher_orders, 1);
    }

    #[test]
    fn alloc_free_round_trip_restores_free_pages() {
        let (_buf, start, size) = test_region(64);
        let allocator = BuddyAllocator::new();
        allocator.init(start, size);

        let initial = allocator.free_pages();
        let mut blocks = Vec::new();
        for _ in 0..8 {
            blocks.push(allocator.alloc(1, Zone::DEFAULT));
        }
        assert!(blocks.iter().all(|b| !b.is_null()));
        for b in blocks {
            allocator.free(b, 1);
        }
        assert_eq!(allocator.free_pages(), initial);
    }

    #[test]
    fn zero_fill_flag_zeroes_block() {
        let (_buf, start, size) = test_region(4);
        let allocator = BuddyAllocator::new();
        allocator.init(start, size);

        let phys = allocator.alloc(0, Zone::Unmovable);
        // SAFETY: exclusive owner, about to overwrite then re-derive.
        unsafe { direct_map::write::<u64>(phys, 0, 0xdead_beef) };
        allocator.free(phys, 0);

        let phys2 = allocator.alloc_flags(0, AllocFlags::UNMOVABLE | AllocFlags::ZERO);
        let bytes = unsafe { direct_map::as_slice(phys2, FRAME_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhausted_zone_returns_null() {
        let (_buf, start, size) = test_region(1);
        let allocator = BuddyAllocator::new();
        allocator.init(start, size);

        assert!(!allocator.alloc(0, Zone::DEFAULT).is_null());
        assert!(allocator.alloc(0, Zone::DEFAULT).is_null());
    }

    #[test]
    fn invalid_order_returns_null() {
        let (_buf, start, size) = test_region(4);
        let allocator = BuddyAllocator::new();
        allocator.init(start, size);
        assert!(allocator.alloc(crate::config::BUDDY_MAX_ORDER + 1, Zone::DEFAULT).is_null());
    }
}
