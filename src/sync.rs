//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections. All kernel state is reached through a
//! critical section so that task level and interrupt handlers never observe
//! it half-updated.
//!
//! On the target the implementation comes from `cortex-m`'s
//! `critical-section-single-core` feature (PRIMASK). Host builds use the
//! `std` implementation of `critical-section`.

pub use ::critical_section::{CriticalSection, Mutex};

/// Execute a closure within a critical section (interrupts masked).
///
/// Sections nest: the interrupt state in force on entry is restored on exit.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     let kernel = KERNEL.borrow_ref_mut(cs);
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    ::critical_section::with(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn test_nested_sections() {
        let cell = Mutex::new(Cell::new(0));
        let v = critical_section(|cs| {
            cell.borrow(cs).set(1);
            critical_section(|inner| cell.borrow(inner).get() + 1)
        });
        assert_eq!(v, 2);
    }
}
