//! # Kernel Configuration
//!
//! Compile-time capacities of the kernel tables and the static
//! application configuration (the Rust rendition of an OIL file).
//! All limits are fixed at compile time; nothing is allocated at run time.

use crate::alarm::{AlarmConfig, CounterConfig};
use crate::error::Error;
use crate::resource::ResourceConfig;
use crate::task::TaskConfig;

/// Maximum number of tasks the kernel can manage. This bounds the static TCB
/// array and, on the Cortex-M4 port, the number of task stacks. Each task
/// consumes `STACK_SIZE` bytes of RAM there.
pub const MAX_TASKS: usize = 8;

/// Maximum number of resources. Resource sets are stored as `u32` bitmasks,
/// so this must not exceed 32.
pub const MAX_RESOURCES: usize = 8;

/// Maximum resource nesting depth of a single task, counting re-entrant
/// locks of the same resource.
pub const MAX_LOCK_DEPTH: usize = 2 * MAX_RESOURCES;

/// Maximum number of alarms across all counters.
pub const MAX_ALARMS: usize = 8;

/// Maximum number of counters (one per tick source).
pub const MAX_COUNTERS: usize = 2;

/// Number of distinct priority levels. Valid priorities are
/// `0..NUM_PRIORITIES`; a larger number means a more important task.
/// The ready set keeps one bit per level in a `u32`.
pub const NUM_PRIORITIES: usize = 32;

/// SysTick frequency in Hz. One SysTick drives one tick of the system counter.
pub const TICK_HZ: u32 = 1000;

/// Per-task stack size in bytes. Must be large enough for the deepest call
/// chain plus the hardware exception frame (32 bytes) and the
/// software-saved context (32 bytes for R4–R11).
pub const STACK_SIZE: usize = 1024;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

const _: () = assert!(MAX_RESOURCES <= 32);
const _: () = assert!(NUM_PRIORITIES <= 32);

/// Application mode passed to `start`. Tasks and alarms auto-start only in
/// the modes their configuration names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppMode(pub u8);

impl AppMode {
    /// `OSDEFAULTAPPMODE`
    pub const DEFAULT: Self = Self(0);

    /// Number of distinct application modes.
    pub const COUNT: u8 = 8;

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 < Self::COUNT
    }

    /// The mode's bit in an [`AppModeSet`]; out-of-range modes have none.
    #[inline]
    pub(crate) const fn bit(self) -> u8 {
        if self.is_valid() {
            1 << self.0
        } else {
            0
        }
    }
}

/// A set of application modes, used for auto-start declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppModeSet(u8);

impl AppModeSet {
    pub const NONE: Self = Self(0);
    pub const DEFAULT: Self = Self(AppMode::DEFAULT.bit());

    pub const fn with(self, mode: AppMode) -> Self {
        assert!(mode.is_valid(), "application mode out of range");
        Self(self.0 | mode.bit())
    }

    #[inline]
    pub const fn contains(self, mode: AppMode) -> bool {
        self.0 & mode.bit() != 0
    }
}

/// Application-supplied callbacks invoked at defined lifecycle points.
///
/// Hooks run inside the kernel's critical section and have no access to
/// the kernel: a service called from a hook fails with `IllegalContext`.
/// They are meant for diagnostics and device bring-up.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Called once by `start`, before any task runs.
    pub startup: fn(),
    /// Called once when the kernel halts, with the shutdown status.
    pub shutdown: fn(Result<(), Error>),
    /// Called whenever a kernel service fails.
    pub error: fn(Error, crate::service::Service),
}

impl Hooks {
    /// Hooks that do nothing.
    pub const NONE: Self = Self {
        startup: || {},
        shutdown: |_| {},
        error: |_, _| {},
    };
}

impl core::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Hooks { .. }")
    }
}

/// The complete static configuration of an application.
#[derive(Debug, Clone, Copy)]
pub struct Config<'a> {
    /// One entry per task; the index is the `TaskId`.
    pub tasks: &'a [TaskConfig],
    /// One entry per resource; the index is the `ResourceId`.
    pub resources: &'a [ResourceConfig],
    /// One entry per counter; the index is the `CounterId`.
    pub counters: &'a [CounterConfig],
    /// One entry per alarm; the index is the `AlarmId`. Alarms expiring on
    /// the same tick fire in this order.
    pub alarms: &'a [AlarmConfig],
    pub hooks: Hooks,
}
