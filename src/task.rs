//! # Task Control Block
//!
//! Defines the task model. Each task is created from its static
//! [`TaskConfig`] at kernel initialization and lives for the lifetime of the
//! system, cycling through the four OSEK states.
//!
//! A task that owns at least one event is an *extended* task: it may call
//! `wait_event` and be the target of `set_event`. A task without events is a
//! *basic* task and never enters [`TaskState::Waiting`].

use core::fmt;

use heapless::Vec;

use crate::config::{AppModeSet, MAX_LOCK_DEPTH};
use crate::resource::{ResourceId, ResourceSet};

/// Bitmask of events. Each task owns the bits named in its configuration.
pub type EventMask = u32;

/// Task priority. Larger values are more important.
pub type Priority = u8;

/// Dense task identifier (index into the kernel's task table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u8);

impl TaskId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///                 activate                dispatch
///  ┌───────────┐ ─────────► ┌─────────┐ ─────────► ┌─────────┐
///  │ Suspended │            │  Ready  │            │ Running │
///  └───────────┘            └─────────┘ ◄───────── └─────────┘
///        ▲                       ▲        preempt     │    │
///        │                       │ set_event          │    │
///        │                  ┌─────────┐  wait_event   │    │
///        │                  │ Waiting │ ◄─────────────┘    │
///        │                  └─────────┘                    │
///        └─────────────────────────────────────────────────┘
///                          terminate
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not activated. Holds no resources and no events.
    Suspended,
    /// Eligible to run; present in the ready set.
    Ready,
    /// Currently owns the CPU. At most one task is in this state.
    Running,
    /// Blocked in `wait_event` until a matching event is set.
    Waiting,
}

/// Preemption policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Preempted as soon as a higher-priority task becomes ready.
    Full,
    /// Only gives up the CPU at rescheduling points (`schedule`,
    /// `wait_event`, `terminate_task`, `chain_task`).
    Non,
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Static configuration for a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Name used in log output.
    pub name: &'static str,

    /// Base priority (higher = more important). Must be below
    /// `NUM_PRIORITIES`.
    pub priority: Priority,

    pub schedule: Schedule,

    /// Events owned by this task. Non-zero makes it an extended task.
    pub events: EventMask,

    /// Resources this task may lock. Resource ceilings are derived from
    /// these sets.
    pub resources: ResourceSet,

    /// Application modes in which the task is activated by `start`.
    pub autostart: AppModeSet,

    /// Entry point, started from the top on every activation. Only the
    /// target port calls it.
    pub entry: extern "C" fn(),
}

impl TaskConfig {
    /// A fully preemptive basic task with no resources and no auto-start.
    pub const fn new(name: &'static str, priority: Priority, entry: extern "C" fn()) -> Self {
        Self {
            name,
            priority,
            schedule: Schedule::Full,
            events: 0,
            resources: ResourceSet::EMPTY,
            autostart: AppModeSet::NONE,
            entry,
        }
    }

    pub const fn with_events(mut self, events: EventMask) -> Self {
        self.events = events;
        self
    }

    pub const fn with_resources(mut self, resources: ResourceSet) -> Self {
        self.resources = resources;
        self
    }

    pub const fn with_autostart(mut self, modes: AppModeSet) -> Self {
        self.autostart = modes;
        self
    }

    pub const fn non_preemptive(mut self) -> Self {
        self.schedule = Schedule::Non;
        self
    }

    #[inline]
    pub const fn is_extended(&self) -> bool {
        self.events != 0
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB): the kernel's per-task state.
///
/// TCBs are stored in a fixed-capacity table inside the scheduler, indexed
/// by [`TaskId`]. The port keeps stacks and saved contexts separately.
#[derive(Debug, Clone)]
pub struct TaskControlBlock {
    pub id: TaskId,

    pub state: TaskState,

    pub config: TaskConfig,

    /// Effective priority: the base priority, raised to the ceiling of every
    /// resource currently held.
    pub current_priority: Priority,

    /// Events set and not yet cleared.
    pub pending: EventMask,

    /// Events waited on. Meaningful only in `Waiting`.
    pub waiting: EventMask,

    /// Resources held, in lock order (last = most recently locked). A
    /// re-entrant lock appears once per nesting level.
    pub held: Vec<ResourceId, MAX_LOCK_DEPTH>,

    /// Set on activation; cleared by the port once it has built a fresh
    /// stack frame for the task.
    pub fresh: bool,
}

impl TaskControlBlock {
    /// Create the TCB of a task in the `Suspended` state.
    pub fn new(id: TaskId, config: TaskConfig) -> Self {
        Self {
            id,
            state: TaskState::Suspended,
            config,
            current_priority: config.priority,
            pending: 0,
            waiting: 0,
            held: Vec::new(),
            fresh: false,
        }
    }

    #[inline]
    pub fn base_priority(&self) -> Priority {
        self.config.priority
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.config.is_extended()
    }

    #[inline]
    pub fn holds_resources(&self) -> bool {
        !self.held.is_empty()
    }

    /// Move a suspended task to `Ready` with a clean slate.
    pub fn activate(&mut self) {
        debug_assert_eq!(self.state, TaskState::Suspended);
        self.state = TaskState::Ready;
        self.current_priority = self.base_priority();
        self.pending = 0;
        self.waiting = 0;
        self.fresh = true;
    }

    /// Return the task to `Suspended`. Resources must already be released.
    pub fn suspend(&mut self) {
        debug_assert!(self.held.is_empty());
        self.state = TaskState::Suspended;
        self.current_priority = self.base_priority();
        self.pending = 0;
        self.waiting = 0;
    }

    /// Whether the pending events satisfy the current wait.
    #[inline]
    pub fn wait_satisfied(&self) -> bool {
        self.pending & self.waiting != 0
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn entry() {}

    #[test]
    fn test_tcb_initialization() {
        let config = TaskConfig::new("t", 5, entry).with_events(0x3);
        let tcb = TaskControlBlock::new(TaskId(2), config);

        assert_eq!(tcb.state, TaskState::Suspended);
        assert_eq!(tcb.base_priority(), 5);
        assert_eq!(tcb.current_priority, 5);
        assert!(tcb.is_extended());
        assert!(!tcb.holds_resources());
        assert!(!tcb.fresh);
    }

    #[test]
    fn test_activate_resets_state() {
        let mut tcb = TaskControlBlock::new(TaskId(0), TaskConfig::new("t", 3, entry));
        tcb.activate();
        assert_eq!(tcb.state, TaskState::Ready);
        assert!(tcb.fresh);
        assert_eq!(tcb.pending, 0);
    }

    #[test]
    fn test_suspend_clears_events() {
        let mut tcb =
            TaskControlBlock::new(TaskId(0), TaskConfig::new("t", 3, entry).with_events(1));
        tcb.activate();
        tcb.state = TaskState::Waiting;
        tcb.pending = 0x4;
        tcb.waiting = 0x1;
        tcb.current_priority = 9;

        tcb.suspend();
        assert_eq!(tcb.state, TaskState::Suspended);
        assert_eq!(tcb.pending, 0);
        assert_eq!(tcb.waiting, 0);
        assert_eq!(tcb.current_priority, 3);
    }

    #[test]
    fn test_wait_satisfied() {
        let mut tcb =
            TaskControlBlock::new(TaskId(0), TaskConfig::new("t", 1, entry).with_events(0x3));
        tcb.waiting = 0x2;
        tcb.pending = 0x1;
        assert!(!tcb.wait_satisfied());
        tcb.pending |= 0x2;
        assert!(tcb.wait_satisfied());
    }

    #[test]
    fn test_config_builders() {
        let config = TaskConfig::new("t", 4, entry)
            .non_preemptive()
            .with_autostart(AppModeSet::DEFAULT);
        assert_eq!(config.schedule, Schedule::Non);
        assert!(!config.is_extended());
        assert!(config.autostart.contains(crate::config::AppMode::DEFAULT));
    }
}
