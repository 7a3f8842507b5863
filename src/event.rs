//! # Event Manager
//!
//! Per-task pending/wait event masks and the blocking wait.
//!
//! Events are owned by extended tasks. Anyone may set a task's events; only
//! the task itself may clear them or wait on them. Waiting is single-mask and
//! non-queued: the task is released as soon as any waited bit is pending,
//! and the bits stay pending until the task clears them.

use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{EventMask, TaskId, TaskState};

fn extended_task(sched: &Scheduler, task: TaskId) -> Result<(), Error> {
    if sched.task(task)?.is_extended() {
        Ok(())
    } else {
        Err(Error::Access)
    }
}

/// OR `mask` into the pending events of `task`, releasing it if it waits on
/// any of those bits, then dispatch.
pub fn set_event(sched: &mut Scheduler, task: TaskId, mask: EventMask) -> Result<(), Error> {
    if post_event(sched, task, mask)? {
        sched.dispatch();
    }
    Ok(())
}

/// [`set_event`] without the dispatch check. Returns whether `task` was
/// released from `Waiting`.
pub fn post_event(sched: &mut Scheduler, task: TaskId, mask: EventMask) -> Result<bool, Error> {
    extended_task(sched, task)?;
    let tcb = sched.task_mut(task)?;
    if tcb.state == TaskState::Suspended {
        return Err(Error::State);
    }

    tcb.pending |= mask;
    log::trace!("{} events {:#x} -> {:#x}", task, mask, tcb.pending);

    if tcb.state == TaskState::Waiting && tcb.wait_satisfied() {
        sched.release_waiting(task);
        return Ok(true);
    }
    Ok(false)
}

/// Clear `mask` from the pending events of `task` (the caller).
pub fn clear_event(sched: &mut Scheduler, task: TaskId, mask: EventMask) -> Result<(), Error> {
    extended_task(sched, task)?;
    sched.task_mut(task)?.pending &= !mask;
    Ok(())
}

/// The pending events of `task`.
pub fn get_event(sched: &Scheduler, task: TaskId) -> Result<EventMask, Error> {
    extended_task(sched, task)?;
    let tcb = sched.task(task)?;
    if tcb.state == TaskState::Suspended {
        return Err(Error::State);
    }
    Ok(tcb.pending)
}

/// Wait until any bit of `mask` is pending for `task` (the running task).
///
/// Returns immediately, with no state change, if one already is. Otherwise
/// the task enters `Waiting` and another task is dispatched; the caller
/// resumes once a matching `set_event` releases it.
pub fn wait_event(sched: &mut Scheduler, task: TaskId, mask: EventMask) -> Result<(), Error> {
    extended_task(sched, task)?;
    if mask == 0 {
        return Err(Error::InvalidValue);
    }

    let tcb = sched.task_mut(task)?;
    if tcb.holds_resources() {
        return Err(Error::ResourcesHeld);
    }

    if tcb.pending & mask != 0 {
        return Ok(());
    }

    tcb.waiting = mask;
    sched.block_running();
    sched.dispatch();
    Ok(())
}
