//! Direct-map window: a fixed virtual offset mirroring all physical RAM.
//!
//! The core treats a frame's physical base address as both its identity
//! and a writable region (zeroing, copying, reading/writing allocation
//! headers in place). On real hardware the only safe way to do that is
//! through a mapping that is already present -- this module is the single
//! chokepoint every frame-touching operation in `mm` goes through, so the
//! mapping strategy can change in one place.
//!
//! On the bare-metal target the window lives at [`crate::config::DIRECT_MAP_BASE`],
//! matching spec.md's `0xFFFF_8000_0000_0000`. On the host test target
//! there is no bootloader-provided physical-memory mapping to mirror:
//! tests back "physical" frames with ordinary heap allocations, so a
//! frame's address is already a valid host pointer and the window
//! degenerates to identity.

use super::PhysAddr;

#[cfg(target_os = "none")]
#[inline(always)]
unsafe fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    (crate::config::DIRECT_MAP_BASE + phys.as_u64()) as *mut u8
}

#[cfg(not(target_os = "none"))]
#[inline(always)]
unsafe fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    phys.as_u64() as *mut u8
}

/// Inverse of the internal `phys_to_virt`: recover the physical address a
/// direct-mapped pointer was derived from. Used by the heap allocator to
/// turn a `kfree`d pointer back into the `PhysAddr` its backing slab or
/// block was allocated at.
///
/// # Safety
/// `ptr` must have been produced by this module's own `phys_to_virt`
/// (directly or via `as_mut_ptr`/`as_slice`/`as_slice_mut`).
#[cfg(target_os = "none")]
pub unsafe fn virt_to_phys(ptr: *const u8) -> PhysAddr {
    PhysAddr::new((ptr as u64) - crate::config::DIRECT_MAP_BASE)
}

#[cfg(not(target_os = "none"))]
pub unsafe fn virt_to_phys(ptr: *const u8) -> PhysAddr {
    PhysAddr::new(ptr as u64)
}

/// Borrow a frame's contents through the direct map.
///
/// # Safety
/// `phys` must be a frame currently owned by the caller (no concurrent
/// writer), and `len` bytes starting at `phys` must lie within mapped RAM.
pub unsafe fn as_slice<'a>(phys: PhysAddr, len: usize) -> &'a [u8] {
    core::slice::from_raw_parts(phys_to_virt(phys), len)
}

/// Mutably borrow a frame's contents through the direct map.
///
/// # Safety
/// Same as [`as_slice`], plus exclusive access for the returned lifetime.
pub unsafe fn as_slice_mut<'a>(phys: PhysAddr, len: usize) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(phys_to_virt(phys), len)
}

/// Zero `len` bytes starting at `phys`.
///
/// # Safety
/// `phys` must be owned by the caller for the duration of the call.
pub unsafe fn zero(phys: PhysAddr, len: usize) {
    core::ptr::write_bytes(phys_to_virt(phys), 0, len);
}

/// Copy `len` bytes from `src` to `dst` (non-overlapping frames).
///
/// # Safety
/// Both frames must be owned by the caller and must not overlap.
pub unsafe fn copy(src: PhysAddr, dst: PhysAddr, len: usize) {
    core::ptr::copy_nonoverlapping(phys_to_virt(src), phys_to_virt(dst), len);
}

/// Read a `T` from the frame at `phys + offset`.
///
/// # Safety
/// The region must be owned by the caller, properly aligned for `T`, and
/// contain a valid `T` bit pattern.
pub unsafe fn read<T: Copy>(phys: PhysAddr, offset: usize) -> T {
    core::ptr::read(phys_to_virt(phys).add(offset) as *const T)
}

/// Write a `T` into the frame at `phys + offset`.
///
/// # Safety
/// The region must be owned by the caller and properly aligned for `T`.
pub unsafe fn write<T>(phys: PhysAddr, offset: usize, value: T) {
    core::ptr::write(phys_to_virt(phys).add(offset) as *mut T, value);
}

/// Raw mutable pointer to `phys + offset`, for callers that need to build
/// their own typed view (e.g. an intrusive list node).
///
/// # Safety
/// Same requirements as [`as_slice_mut`].
pub unsafe fn as_mut_ptr(phys: PhysAddr, offset: usize) -> *mut u8 {
    phys_to_virt(phys).add(offset)
}
