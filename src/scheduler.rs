//! # Scheduler
//!
//! Task states, the ready set, and the dispatch decision.
//!
//! ## Scheduling Algorithm
//!
//! Strict fixed-priority preemptive scheduling on the *current* priority of
//! each task (the base priority, possibly raised by held resources):
//!
//! 1. Every operation that can change readiness ends in [`Scheduler::dispatch`]
//! 2. `dispatch` compares the highest ready priority with the running task's
//! 3. Only a strictly higher ready priority preempts; ties keep the CPU
//! 4. A preempted task returns to the *front* of its priority level, a newly
//!    activated or woken task joins the *back*
//!
//! There is no aging: a low-priority task starves for as long as
//! higher-priority work is ready.
//!
//! ## Ready Set
//!
//! One FIFO bucket per priority level plus a `u32` bitmap of non-empty
//! buckets. Insertion is O(1); finding the highest level is a single
//! `leading_zeros`.
//!
//! ```text
//!  bitmap: 0b0000_0000_0000_0000_0000_0001_0010_0100
//!                                        │  │   │
//!  buckets[8] ─► [T3]  ◄─────────────────┘  │   │
//!  buckets[5] ─► [T1, T4]  ◄────────────────┘   │
//!  buckets[2] ─► [T0]  ◄────────────────────────┘
//! ```
//!
//! dispatch() only *chooses*. Performing the context switch is the port's
//! job; it learns about a new choice through [`Scheduler::take_switch_request`].

use heapless::{Deque, Vec};

use crate::config::{MAX_TASKS, NUM_PRIORITIES};
use crate::error::Error;
use crate::task::{Priority, Schedule, TaskConfig, TaskControlBlock, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// The set of `Ready` tasks, ordered by current priority.
#[derive(Debug)]
pub struct ReadyQueue {
    /// Bit `p` is set iff `buckets[p]` is non-empty.
    bitmap: u32,
    buckets: [Deque<TaskId, MAX_TASKS>; NUM_PRIORITIES],
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            bitmap: 0,
            buckets: core::array::from_fn(|_| Deque::new()),
        }
    }

    /// Enqueue behind every task of the same priority.
    pub fn push_back(&mut self, task: TaskId, prio: Priority) {
        let p = prio as usize;
        // A task is queued at most once, so a bucket never overflows.
        let pushed = self.buckets[p].push_back(task);
        debug_assert!(pushed.is_ok());
        self.bitmap |= 1 << p;
    }

    /// Enqueue ahead of every task of the same priority.
    pub fn push_front(&mut self, task: TaskId, prio: Priority) {
        let p = prio as usize;
        let pushed = self.buckets[p].push_front(task);
        debug_assert!(pushed.is_ok());
        self.bitmap |= 1 << p;
    }

    pub fn highest_priority(&self) -> Option<Priority> {
        if self.bitmap == 0 {
            None
        } else {
            Some((31 - self.bitmap.leading_zeros()) as Priority)
        }
    }

    /// Remove and return the first task of the highest non-empty level.
    pub fn pop_highest(&mut self) -> Option<TaskId> {
        let p = self.highest_priority()? as usize;
        let task = self.buckets[p].pop_front();
        if self.buckets[p].is_empty() {
            self.bitmap &= !(1 << p);
        }
        task
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.iter().any(|(_, t)| t == task)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Iterate in dispatch order: highest priority first, FIFO within a
    /// level.
    pub fn iter(&self) -> impl Iterator<Item = (Priority, TaskId)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(p, bucket)| bucket.iter().map(move |&t| (p as Priority, t)))
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Task table, ready set and the running task.
///
/// ## Design Notes
///
/// - All TCBs are stored inline in a fixed-capacity table (no heap)
/// - `running` is `None` when every task is suspended or waiting; the port
///   then runs its idle loop
/// - The running task is never in the ready set
#[derive(Debug)]
pub struct Scheduler {
    tasks: Vec<TaskControlBlock, MAX_TASKS>,

    ready: ReadyQueue,

    running: Option<TaskId>,

    /// Set whenever `running` changes; consumed by the port.
    switch_pending: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            ready: ReadyQueue::new(),
            running: None,
            switch_pending: false,
        }
    }

    /// Register a task in the `Suspended` state.
    ///
    /// # Returns
    /// - `Ok(task_id)`: the index of the new TCB
    /// - `Err(InvalidId)`: the task table is full
    /// - `Err(InvalidValue)`: the priority is out of range
    pub fn add_task(&mut self, config: TaskConfig) -> Result<TaskId, Error> {
        if config.priority as usize >= NUM_PRIORITIES {
            return Err(Error::InvalidValue);
        }
        let id = TaskId(self.tasks.len() as u8);
        self.tasks
            .push(TaskControlBlock::new(id, config))
            .map_err(|_| Error::InvalidId)?;
        Ok(id)
    }

    pub fn task(&self, id: TaskId) -> Result<&TaskControlBlock, Error> {
        self.tasks.get(id.index()).ok_or(Error::InvalidId)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut TaskControlBlock, Error> {
        self.tasks.get_mut(id.index()).ok_or(Error::InvalidId)
    }

    pub fn tasks(&self) -> &[TaskControlBlock] {
        &self.tasks
    }

    #[inline]
    pub fn running(&self) -> Option<TaskId> {
        self.running
    }

    pub fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }

    /// `Suspended` → `Ready`. Activations are not queued: a task that is
    /// not suspended fails with `AlreadyActive`. Doesn't dispatch.
    pub fn activate(&mut self, id: TaskId) -> Result<(), Error> {
        let tcb = self.tasks.get_mut(id.index()).ok_or(Error::InvalidId)?;
        if tcb.state != TaskState::Suspended {
            return Err(Error::AlreadyActive);
        }
        tcb.activate();
        self.ready.push_back(id, tcb.current_priority);
        log::debug!("{} '{}' activated", id, tcb.config.name);
        Ok(())
    }

    /// `Waiting` → `Ready`. Doesn't dispatch.
    pub fn release_waiting(&mut self, id: TaskId) {
        let tcb = &mut self.tasks[id.index()];
        debug_assert_eq!(tcb.state, TaskState::Waiting);
        tcb.state = TaskState::Ready;
        tcb.waiting = 0;
        self.ready.push_back(id, tcb.current_priority);
        log::debug!("{} woken", id);
    }

    /// Running task → `Waiting`. Doesn't dispatch.
    pub fn block_running(&mut self) {
        if let Some(id) = self.running.take() {
            self.tasks[id.index()].state = TaskState::Waiting;
            self.switch_pending = true;
            log::debug!("{} waiting", id);
        }
    }

    /// Running task → `Suspended`. Held resources must already be released.
    /// Doesn't dispatch.
    pub fn suspend_running(&mut self) -> Option<TaskId> {
        let id = self.running.take()?;
        self.tasks[id.index()].suspend();
        self.switch_pending = true;
        log::debug!("{} terminated", id);
        Some(id)
    }

    /// The dispatch check run after every readiness change.
    ///
    /// A non-preemptive running task keeps the CPU; see
    /// [`Scheduler::reschedule`].
    pub fn dispatch(&mut self) {
        self.select(false);
    }

    /// Dispatch at a rescheduling point, where non-preemptive tasks may be
    /// preempted too.
    pub fn reschedule(&mut self) {
        self.select(true);
    }

    fn select(&mut self, at_reschedule_point: bool) {
        let Some(top) = self.ready.highest_priority() else {
            return;
        };

        if let Some(current) = self.running {
            let tcb = &mut self.tasks[current.index()];
            if !at_reschedule_point && tcb.config.schedule == Schedule::Non {
                log::trace!("{} is non-preemptive, keeps the CPU", current);
                return;
            }
            if top <= tcb.current_priority {
                return;
            }
            tcb.state = TaskState::Ready;
            self.ready.push_front(current, tcb.current_priority);
            log::debug!("{} preempted at prio {}", current, tcb.current_priority);
        }

        if let Some(next) = self.ready.pop_highest() {
            self.tasks[next.index()].state = TaskState::Running;
            self.running = Some(next);
            self.switch_pending = true;
            log::trace!("dispatch -> {} (prio {})", next, top);
        }
    }

    /// Whether the running task changed since the last call.
    pub fn take_switch_request(&mut self) -> bool {
        core::mem::take(&mut self.switch_pending)
    }

    /// Whether `id` was activated since its context was last built, clearing
    /// the flag.
    pub fn take_fresh_start(&mut self, id: TaskId) -> bool {
        self.tasks
            .get_mut(id.index())
            .map(|t| core::mem::take(&mut t.fresh))
            .unwrap_or(false)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
