//! Architecture-independent timer interface.

/// Get current timer tick count.
pub fn get_ticks() -> u64 {
    crate::arch::x86_64::timer::get_ticks()
}

/// Milliseconds since the timer was configured, used by the log service to
/// timestamp entries.
pub fn get_timestamp_ms() -> u64 {
    crate::arch::x86_64::timer::get_timestamp_ms()
}
