//! Device drivers.
//!
//! The memory core only needs enough of a driver layer to prove the
//! page-fault path against a real interrupt source; everything else the
//! teacher wired up (network, GPU, storage, USB) has no counterpart here.

pub mod keyboard;

/// Initialize all drivers.
pub fn init() {
    crate::println!("[DRIVERS] Initializing device drivers...");
    keyboard::init();
    crate::println!("[DRIVERS] Device drivers initialized");
}
