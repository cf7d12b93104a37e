//! RAII patterns for kernel resources.
//!
//! Wrappers that tie a resource's lifetime to a scope so cleanup can't be
//! forgotten on an early return or a panic unwind.

use core::ops::{Deref, DerefMut};

use spin::MutexGuard;

use crate::mm::buddy::BuddyAllocator;
use crate::mm::{PhysAddr, Zone};
use crate::println;

/// RAII wrapper for a single physical frame (or buddy block of `order`).
///
/// Returns the block to its allocator when dropped.
pub struct FrameGuard {
    phys: PhysAddr,
    order: usize,
    allocator: &'static BuddyAllocator,
}

impl FrameGuard {
    /// Allocate a block of `2^order` frames from `zone`, wrapped for
    /// automatic release. Returns `None` if the zone is exhausted.
    pub fn alloc(allocator: &'static BuddyAllocator, order: usize, zone: Zone) -> Option<Self> {
        let phys = allocator.alloc(order, zone);
        if phys.is_null() {
            return None;
        }
        Some(Self {
            phys,
            order,
            allocator,
        })
    }

    pub fn addr(&self) -> PhysAddr {
        self.phys
    }

    /// Release ownership of the frame without freeing it.
    pub fn leak(self) -> PhysAddr {
        let phys = self.phys;
        core::mem::forget(self);
        phys
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.allocator.free(self.phys, self.order);
        println!("[RAII] released frame at {:#x}", self.phys.as_u64());
    }
}

/// RAII wrapper for a batch of independently-ordered frames, released
/// together when the guard is dropped.
pub struct FramesGuard {
    frames: alloc::vec::Vec<(PhysAddr, usize)>,
    allocator: &'static BuddyAllocator,
}

impl FramesGuard {
    pub fn new(frames: alloc::vec::Vec<(PhysAddr, usize)>, allocator: &'static BuddyAllocator) -> Self {
        Self { frames, allocator }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Release ownership of the frames without freeing them.
    pub fn leak(mut self) -> alloc::vec::Vec<(PhysAddr, usize)> {
        let frames = core::mem::take(&mut self.frames);
        core::mem::forget(self);
        frames
    }
}

impl Drop for FramesGuard {
    fn drop(&mut self) {
        for &(phys, order) in &self.frames {
            self.allocator.free(phys, order);
        }
        println!("[RAII] released {} frames", self.frames.len());
    }
}

/// RAII lock guard that logs acquisition and release, useful for tracing
/// down lock-ordering bugs during development.
pub struct TrackedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    name: &'static str,
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    pub fn new(guard: MutexGuard<'a, T>, name: &'static str) -> Self {
        println!("[RAII] acquired lock: {}", name);
        Self { guard, name }
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        println!("[RAII] released lock: {}", self.name);
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Macro to create RAII scope guards.
#[macro_export]
macro_rules! defer {
    ($e:expr) => {
        let _guard = $crate::raii::ScopeGuard::new(|| $e);
    };
}

/// Generic scope guard that runs cleanup code on drop.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Cancel the cleanup.
    pub fn cancel(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::subsystem::MemorySubsystem;

    #[test]
    fn test_scope_guard() {
        let mut cleaned = false;
        {
            let _guard = ScopeGuard::new(|| {
                cleaned = true;
            });
        }
        assert!(cleaned);
    }

    #[test]
    fn test_scope_guard_cancel() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(|| {
                cleaned = true;
            });
            guard.cancel();
        }
        assert!(!cleaned);
    }

    #[test]
    fn frame_guard_releases_on_drop() {
        let memory = alloc::boxed::Box::leak(alloc::boxed::Box::new(MemorySubsystem::new_for_test(4)));
        let before = memory.buddy.free_pages();
        {
            let guard = FrameGuard::alloc(&memory.buddy, 0, Zone::DEFAULT).unwrap();
            assert!(!guard.addr().is_null());
            assert_eq!(memory.buddy.free_pages(), before - 1);
        }
        assert_eq!(memory.buddy.free_pages(), before);
    }

    #[test]
    fn frame_guard_leak_keeps_frame_allocated() {
        let memory = alloc::boxed::Box::leak(alloc::boxed::Box::new(MemorySubsystem::new_for_test(4)));
        let before = memory.buddy.free_pages();
        let guard = FrameGuard::alloc(&memory.buddy, 0, Zone::DEFAULT).unwrap();
        let phys = guard.leak();
        assert_eq!(memory.buddy.free_pages(), before - 1);
        memory.buddy.free(phys, 0);
        assert_eq!(memory.buddy.free_pages(), before);
    }
}
