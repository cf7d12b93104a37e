//! x86_64 timer implementation (PIT, IRQ0).

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_INTERVAL_MS: AtomicU32 = AtomicU32::new(1);

/// Get current timer ticks.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds elapsed since the timer was set up, derived from the tick
/// count and the interval `setup_timer` configured the PIT for.
pub fn get_timestamp_ms() -> u64 {
    get_ticks() * TICK_INTERVAL_MS.load(Ordering::Relaxed) as u64
}

/// Increment timer ticks. Called from the timer interrupt handler.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Configure the 8253/8254 PIT (channel 0) for periodic interrupts at
/// `interval_ms` milliseconds. The IDT wires the resulting IRQ0 to
/// `tick`.
pub fn setup_timer(interval_ms: u32) {
    const PIT_FREQUENCY: u32 = 1_193_182; // Hz
    let divisor = PIT_FREQUENCY / (1000 / interval_ms);
    TICK_INTERVAL_MS.store(interval_ms, Ordering::Relaxed);

    // SAFETY: ports 0x43/0x40 are the PIT command and channel-0 data ports;
    // this is the standard rate-generator configuration sequence.
    unsafe {
        use x86_64::instructions::port::Port;

        let mut cmd_port: Port<u8> = Port::new(0x43);
        let mut data_port: Port<u8> = Port::new(0x40);

        cmd_port.write(0x36); // channel 0, lobyte/hibyte, rate generator
        data_port.write((divisor & 0xFF) as u8);
        data_port.write((divisor >> 8) as u8);
    }

    println!("[TIMER] Configured PIT for {}ms intervals", interval_ms);
}
