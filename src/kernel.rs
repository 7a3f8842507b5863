//! # Kernel
//!
//! The kernel state object and its public services.
//!
//! [`Kernel`] owns every task, resource, counter and alarm. Callers refer to
//! them by ID only. Each service takes the [`Context`] it is called from,
//! checks it against the legality table in [`crate::service`], performs the
//! operation and finishes with the scheduler's dispatch check. A failing
//! service logs a warning and calls the application's error hook before
//! returning the error.
//!
//! `Kernel` is plain data with no globals and no interrupt masking. The
//! [`crate::os::Os`] wrapper provides both on the target.
//!
//! ## Lifecycle
//!
//! ```text
//!  Kernel::new(&CONFIG)   validate, build the tables     (Stopped)
//!        │
//!        ▼
//!  start(mode)            startup hook, auto-start,      (Running)
//!        │                first dispatch
//!        ▼
//!  shutdown(status)       shutdown hook                  (Halted)
//! ```
//!
//! Every service fails with `State` unless the kernel is `Running`.

use crate::alarm::{AlarmAction, AlarmBase, AlarmId, AlarmTable, CounterId, TickType};
use crate::config::{AppMode, Config, Hooks, MAX_TASKS};
use crate::error::Error;
use crate::event;
use crate::resource::{ResourceControlBlock, ResourceId, ResourceManager};
use crate::scheduler::Scheduler;
use crate::service::{Context, Service};
use crate::task::{EventMask, TaskControlBlock, TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Built, `start` not called yet.
    Stopped,
    Running,
    /// Shut down. Terminal.
    Halted,
}

#[derive(Debug)]
pub struct Kernel {
    sched: Scheduler,
    resources: ResourceManager,
    alarms: AlarmTable,
    hooks: Hooks,
    state: KernelState,
}

impl Kernel {
    /// Build the kernel tables from the static configuration.
    ///
    /// Any error here is fatal: the configuration names too many objects,
    /// an out-of-range priority or value, or an ID that does not exist.
    pub fn new(config: &Config<'_>) -> Result<Self, Error> {
        let mut sched = Scheduler::new();
        for task in config.tasks {
            sched.add_task(*task).map_err(|e| {
                log::error!("cannot add task '{}': {}", task.name, e);
                e
            })?;
        }
        let resources = ResourceManager::new(config.resources, config.tasks)?;
        let alarms = AlarmTable::new(config.counters, config.alarms, config.tasks)?;

        log::info!(
            "kernel configured: {} tasks, {} resources, {} alarms",
            config.tasks.len(),
            resources.len(),
            config.alarms.len()
        );

        Ok(Self {
            sched,
            resources,
            alarms,
            hooks: config.hooks,
            state: KernelState::Stopped,
        })
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Run the startup hook, auto-start the tasks and alarms configured for
    /// `mode` and dispatch the first task. A failure here shuts the kernel
    /// down.
    pub fn start(&mut self, mode: AppMode) -> Result<(), Error> {
        if self.state != KernelState::Stopped {
            return Err(Error::State);
        }
        if !mode.is_valid() {
            log::error!("unknown app mode {}", mode.0);
            return Err(Error::InvalidValue);
        }
        self.state = KernelState::Running;
        log::info!("starting in app mode {}", mode.0);

        (self.hooks.startup)();

        if let Err(e) = self.autostart(mode) {
            self.shutdown(Err(e));
            return Err(e);
        }
        self.sched.dispatch();
        Ok(())
    }

    fn autostart(&mut self, mode: AppMode) -> Result<(), Error> {
        let tasks = self
            .sched
            .tasks()
            .iter()
            .filter(|t| t.config.autostart.contains(mode))
            .map(|t| t.id)
            .collect::<heapless::Vec<TaskId, MAX_TASKS>>();
        for id in tasks {
            self.sched.activate(id)?;
        }
        self.alarms.autostart(mode)
    }

    /// Halt the kernel and run the shutdown hook. Only the first call has
    /// any effect.
    pub fn shutdown(&mut self, status: Result<(), Error>) {
        if self.state == KernelState::Halted {
            return;
        }
        self.state = KernelState::Halted;
        match status {
            Ok(()) => log::info!("shutdown"),
            Err(e) => log::error!("shutdown: {}", e),
        }
        (self.hooks.shutdown)(status);
    }

    // ---- service plumbing ----

    /// Check that `service` may run now and return the calling task, if
    /// `ctx` is task level.
    fn enter(&self, service: Service, ctx: Context) -> Result<Option<TaskId>, Error> {
        if self.state != KernelState::Running {
            return Err(Error::State);
        }
        if !service.allowed_in(ctx) {
            return Err(Error::IllegalContext);
        }
        match ctx {
            Context::Task => self.sched.running().map(Some).ok_or(Error::IllegalContext),
            Context::Isr => Ok(None),
        }
    }

    /// Run `f` as `service`, reporting a failure through the error hook.
    fn call<T>(
        &mut self,
        service: Service,
        ctx: Context,
        f: impl FnOnce(&mut Self, Option<TaskId>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let result = self.enter(service, ctx).and_then(|caller| f(self, caller));
        if let Err(e) = &result {
            self.report(service, *e);
        }
        result
    }

    fn report(&self, service: Service, error: Error) {
        log::warn!("{} failed: {}", service, error);
        (self.hooks.error)(error, service);
    }

    /// Release the running task's resources and suspend it. Doesn't
    /// dispatch.
    fn retire(&mut self, me: TaskId) -> Result<(), Error> {
        let released = self.resources.release_all(&mut self.sched, me);
        self.sched.suspend_running();
        if released.is_empty() {
            Ok(())
        } else {
            log::warn!("{} terminated holding {} resource(s)", me, released.len());
            Err(Error::ResourcesHeld)
        }
    }

    // ---- task management ----

    pub fn activate_task(&mut self, ctx: Context, task: TaskId) -> Result<(), Error> {
        self.call(Service::ActivateTask, ctx, |k, _| {
            k.sched.activate(task)?;
            k.sched.dispatch();
            Ok(())
        })
    }

    /// Terminate the calling task.
    ///
    /// Resources still held are released in reverse lock order and the
    /// task terminates anyway; `ResourcesHeld` is then returned as a
    /// diagnostic.
    pub fn terminate_task(&mut self, ctx: Context) -> Result<(), Error> {
        self.call(Service::TerminateTask, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            let result = k.retire(me);
            k.sched.reschedule();
            result
        })
    }

    /// Terminate the calling task and activate `task` in one step.
    ///
    /// Fails with `AlreadyActive`, leaving the caller running, if `task`
    /// is another task that is not suspended. Chaining to itself
    /// re-activates the caller.
    pub fn chain_task(&mut self, ctx: Context, task: TaskId) -> Result<(), Error> {
        self.call(Service::ChainTask, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            if task != me && k.sched.task(task)?.state != TaskState::Suspended {
                return Err(Error::AlreadyActive);
            }

            let result = k.retire(me);
            k.sched.activate(task)?;
            k.sched.reschedule();
            result
        })
    }

    /// Let a higher-priority ready task run. This is the rescheduling point
    /// for non-preemptive tasks.
    pub fn schedule(&mut self, ctx: Context) -> Result<(), Error> {
        self.call(Service::Schedule, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            if k.sched.task(me)?.holds_resources() {
                return Err(Error::ResourcesHeld);
            }
            k.sched.reschedule();
            Ok(())
        })
    }

    /// The running task, or `None` when the CPU is idle.
    pub fn get_task_id(&mut self, ctx: Context) -> Result<Option<TaskId>, Error> {
        self.call(Service::GetTaskId, ctx, |k, _| Ok(k.sched.running()))
    }

    pub fn get_task_state(&mut self, ctx: Context, task: TaskId) -> Result<TaskState, Error> {
        self.call(Service::GetTaskState, ctx, |k, _| {
            Ok(k.sched.task(task)?.state)
        })
    }

    // ---- events ----

    pub fn set_event(&mut self, ctx: Context, task: TaskId, mask: EventMask) -> Result<(), Error> {
        self.call(Service::SetEvent, ctx, |k, _| {
            event::set_event(&mut k.sched, task, mask)
        })
    }

    /// Clear `mask` from the calling task's pending events.
    pub fn clear_event(&mut self, ctx: Context, mask: EventMask) -> Result<(), Error> {
        self.call(Service::ClearEvent, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            event::clear_event(&mut k.sched, me, mask)
        })
    }

    pub fn get_event(&mut self, ctx: Context, task: TaskId) -> Result<EventMask, Error> {
        self.call(Service::GetEvent, ctx, |k, _| event::get_event(&k.sched, task))
    }

    /// Block the calling task until any bit of `mask` is pending.
    pub fn wait_event(&mut self, ctx: Context, mask: EventMask) -> Result<(), Error> {
        self.call(Service::WaitEvent, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            event::wait_event(&mut k.sched, me, mask)
        })
    }

    // ---- resources ----

    pub fn get_resource(&mut self, ctx: Context, res: ResourceId) -> Result<(), Error> {
        self.call(Service::GetResource, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            k.resources.lock(&mut k.sched, me, res)
        })
    }

    pub fn release_resource(&mut self, ctx: Context, res: ResourceId) -> Result<(), Error> {
        self.call(Service::ReleaseResource, ctx, |k, caller| {
            let me = caller.ok_or(Error::IllegalContext)?;
            k.resources.unlock(&mut k.sched, me, res)
        })
    }

    // ---- alarms and counters ----

    pub fn get_alarm_base(&mut self, ctx: Context, alarm: AlarmId) -> Result<AlarmBase, Error> {
        self.call(Service::GetAlarmBase, ctx, |k, _| {
            k.alarms.get_alarm_base(alarm)
        })
    }

    /// Ticks left until `alarm` expires.
    pub fn get_alarm(&mut self, ctx: Context, alarm: AlarmId) -> Result<TickType, Error> {
        self.call(Service::GetAlarm, ctx, |k, _| k.alarms.get_alarm(alarm))
    }

    pub fn set_rel_alarm(
        &mut self,
        ctx: Context,
        alarm: AlarmId,
        increment: TickType,
        cycle: TickType,
    ) -> Result<(), Error> {
        self.call(Service::SetRelAlarm, ctx, |k, _| {
            k.alarms.set_relative(alarm, increment, cycle)
        })
    }

    pub fn set_abs_alarm(
        &mut self,
        ctx: Context,
        alarm: AlarmId,
        start: TickType,
        cycle: TickType,
    ) -> Result<(), Error> {
        self.call(Service::SetAbsAlarm, ctx, |k, _| {
            k.alarms.set_absolute(alarm, start, cycle)
        })
    }

    pub fn cancel_alarm(&mut self, ctx: Context, alarm: AlarmId) -> Result<(), Error> {
        self.call(Service::CancelAlarm, ctx, |k, _| k.alarms.cancel(alarm))
    }

    /// Advance `counter` by one tick and run the actions of the alarms that
    /// expire. This is also the tick entry point of hardware counters.
    pub fn increment_counter(&mut self, ctx: Context, counter: CounterId) -> Result<(), Error> {
        self.call(Service::IncrementCounter, ctx, |k, _| k.advance(counter))
    }

    fn advance(&mut self, counter: CounterId) -> Result<(), Error> {
        let expired = self.alarms.tick(counter)?;
        for (alarm, action) in expired {
            let (service, result) = match action {
                AlarmAction::ActivateTask(task) => (Service::ActivateTask, self.sched.activate(task)),
                AlarmAction::SetEvent(task, mask) => (
                    Service::SetEvent,
                    event::post_event(&mut self.sched, task, mask).map(drop),
                ),
                AlarmAction::Callback(f) => {
                    f();
                    continue;
                }
            };
            if let Err(e) = result {
                log::warn!("{} action failed", alarm);
                self.report(service, e);
            }
        }
        self.sched.dispatch();
        Ok(())
    }

    pub fn get_counter_value(&mut self, ctx: Context, counter: CounterId) -> Result<TickType, Error> {
        self.call(Service::GetCounterValue, ctx, |k, _| {
            k.alarms.counter_value(counter)
        })
    }

    /// Ticks elapsed since `*previous`. Updates `*previous` to the current
    /// counter value.
    pub fn get_elapsed_value(
        &mut self,
        ctx: Context,
        counter: CounterId,
        previous: &mut TickType,
    ) -> Result<TickType, Error> {
        self.call(Service::GetElapsedValue, ctx, |k, _| {
            k.alarms.elapsed(counter, previous)
        })
    }

    pub fn shutdown_os(&mut self, ctx: Context, status: Result<(), Error>) -> Result<(), Error> {
        self.call(Service::ShutdownOs, ctx, |k, _| {
            k.shutdown(status);
            Ok(())
        })
    }

    // ---- port support and inspection ----

    #[inline]
    pub fn running(&self) -> Option<TaskId> {
        self.sched.running()
    }

    /// Whether the running task changed since the last call.
    pub fn take_switch_request(&mut self) -> bool {
        self.sched.take_switch_request()
    }

    /// Whether `task` needs a fresh context, clearing the flag.
    pub fn take_fresh_start(&mut self, task: TaskId) -> bool {
        self.sched.take_fresh_start(task)
    }

    pub fn task(&self, task: TaskId) -> Result<&TaskControlBlock, Error> {
        self.sched.task(task)
    }

    pub fn resource(&self, res: ResourceId) -> Result<&ResourceControlBlock, Error> {
        self.resources.get(res)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }
}
