//! # OS Instance
//!
//! [`Os`] is the globally shared kernel. It wraps a [`Kernel`] in a
//! critical-section mutex, so every service runs with interrupts masked,
//! and asks the [`Port`] for the caller's execution context.
//!
//! ```text
//!  task / ISR ──► Os::activate_task(t)
//!                   └─► critical section
//!                         ├─► ctx = P::context()
//!                         ├─► Kernel::activate_task(ctx, t)
//!                         └─► running task changed? ──► P::request_dispatch()
//! ```
//!
//! On Cortex-M4 `request_dispatch` pends PendSV, which switches stacks as
//! soon as the critical section ends.
//!
//! Hooks and alarm callbacks run while the kernel is borrowed. A service
//! called from one of them fails with `IllegalContext`.

use core::cell::RefCell;
use core::marker::PhantomData;

use crate::alarm::{AlarmBase, AlarmId, CounterId, TickType};
use crate::arch::Port;
use crate::config::{AppMode, Config};
use crate::error::Error;
use crate::kernel::Kernel;
use crate::resource::ResourceId;
use crate::service::Context;
use crate::sync::{self, Mutex};
use crate::task::{EventMask, TaskId, TaskState};

pub struct Os<P: Port> {
    kernel: Mutex<RefCell<Option<Kernel>>>,
    _port: PhantomData<fn() -> P>,
}

/// The task the port should run next.
#[derive(Debug, Clone, Copy)]
pub struct NextTask {
    pub id: TaskId,
    /// The task was activated since it last ran; its stack must be rebuilt.
    pub fresh: bool,
    pub entry: extern "C" fn(),
}

impl<P: Port> Os<P> {
    pub const fn new() -> Self {
        Self {
            kernel: Mutex::new(RefCell::new(None)),
            _port: PhantomData,
        }
    }

    /// Build the kernel from `config`.
    ///
    /// An invalid configuration is fatal: the shutdown hook runs with the
    /// error and the port halts.
    pub fn init(&self, config: &Config<'_>) {
        match Kernel::new(config) {
            Ok(kernel) => sync::critical_section(|cs| {
                self.kernel.borrow_ref_mut(cs).replace(kernel);
            }),
            Err(e) => {
                log::error!("invalid configuration: {}", e);
                (config.hooks.shutdown)(Err(e));
                P::halt()
            }
        }
    }

    /// Start the kernel in `mode`. The port launches the first task
    /// afterwards.
    pub fn start(&self, mode: AppMode) -> Result<(), Error> {
        self.with(|k, _| k.start(mode))
    }

    /// Run `f` on the kernel inside a critical section and forward a
    /// pending task switch to the port.
    fn with<R>(&self, f: impl FnOnce(&mut Kernel, Context) -> Result<R, Error>) -> Result<R, Error> {
        let ctx = P::context();
        sync::critical_section(|cs| {
            let mut kernel = self.kernel.borrow(cs).try_borrow_mut().map_err(|_| {
                log::warn!("kernel service called from a hook or alarm callback");
                Error::IllegalContext
            })?;
            let kernel = kernel.as_mut().ok_or(Error::State)?;
            let result = f(kernel, ctx);
            if kernel.take_switch_request() {
                P::request_dispatch();
            }
            result
        })
    }

    // ---- task management ----

    pub fn activate_task(&self, task: TaskId) -> Result<(), Error> {
        self.with(|k, ctx| k.activate_task(ctx, task))
    }

    pub fn terminate_task(&self) -> Result<(), Error> {
        self.with(|k, ctx| k.terminate_task(ctx))
    }

    pub fn chain_task(&self, task: TaskId) -> Result<(), Error> {
        self.with(|k, ctx| k.chain_task(ctx, task))
    }

    pub fn schedule(&self) -> Result<(), Error> {
        self.with(|k, ctx| k.schedule(ctx))
    }

    pub fn get_task_id(&self) -> Result<Option<TaskId>, Error> {
        self.with(|k, ctx| k.get_task_id(ctx))
    }

    pub fn get_task_state(&self, task: TaskId) -> Result<TaskState, Error> {
        self.with(|k, ctx| k.get_task_state(ctx, task))
    }

    // ---- events ----

    pub fn set_event(&self, task: TaskId, mask: EventMask) -> Result<(), Error> {
        self.with(|k, ctx| k.set_event(ctx, task, mask))
    }

    pub fn clear_event(&self, mask: EventMask) -> Result<(), Error> {
        self.with(|k, ctx| k.clear_event(ctx, mask))
    }

    pub fn get_event(&self, task: TaskId) -> Result<EventMask, Error> {
        self.with(|k, ctx| k.get_event(ctx, task))
    }

    pub fn wait_event(&self, mask: EventMask) -> Result<(), Error> {
        self.with(|k, ctx| k.wait_event(ctx, mask))
    }

    // ---- resources ----

    pub fn get_resource(&self, res: ResourceId) -> Result<(), Error> {
        self.with(|k, ctx| k.get_resource(ctx, res))
    }

    pub fn release_resource(&self, res: ResourceId) -> Result<(), Error> {
        self.with(|k, ctx| k.release_resource(ctx, res))
    }

    // ---- alarms and counters ----

    pub fn get_alarm_base(&self, alarm: AlarmId) -> Result<AlarmBase, Error> {
        self.with(|k, ctx| k.get_alarm_base(ctx, alarm))
    }

    pub fn get_alarm(&self, alarm: AlarmId) -> Result<TickType, Error> {
        self.with(|k, ctx| k.get_alarm(ctx, alarm))
    }

    pub fn set_rel_alarm(&self, alarm: AlarmId, increment: TickType, cycle: TickType) -> Result<(), Error> {
        self.with(|k, ctx| k.set_rel_alarm(ctx, alarm, increment, cycle))
    }

    pub fn set_abs_alarm(&self, alarm: AlarmId, start: TickType, cycle: TickType) -> Result<(), Error> {
        self.with(|k, ctx| k.set_abs_alarm(ctx, alarm, start, cycle))
    }

    pub fn cancel_alarm(&self, alarm: AlarmId) -> Result<(), Error> {
        self.with(|k, ctx| k.cancel_alarm(ctx, alarm))
    }

    pub fn increment_counter(&self, counter: CounterId) -> Result<(), Error> {
        self.with(|k, ctx| k.increment_counter(ctx, counter))
    }

    pub fn get_counter_value(&self, counter: CounterId) -> Result<TickType, Error> {
        self.with(|k, ctx| k.get_counter_value(ctx, counter))
    }

    pub fn get_elapsed_value(&self, counter: CounterId, previous: &mut TickType) -> Result<TickType, Error> {
        self.with(|k, ctx| k.get_elapsed_value(ctx, counter, previous))
    }

    /// Shut the kernel down and halt.
    ///
    /// The shutdown hook runs even if the call itself is refused, e.g.
    /// before `start` or from the idle loop.
    pub fn shutdown_os(&self, status: Result<(), Error>) -> ! {
        if self.with(|k, ctx| k.shutdown_os(ctx, status)).is_err() {
            sync::critical_section(|cs| {
                if let Ok(mut kernel) = self.kernel.borrow(cs).try_borrow_mut() {
                    if let Some(kernel) = kernel.as_mut() {
                        kernel.shutdown(status);
                    }
                }
            });
        }
        P::halt()
    }

    // ---- interrupt entry points ----

    /// Tick entry point for a hardware counter, called from its interrupt
    /// handler.
    pub fn tick(&self, counter: CounterId) -> Result<(), Error> {
        self.with(|k, _| k.increment_counter(Context::Isr, counter))
    }

    /// Run `f` as an interrupt handler with access to the services an ISR
    /// may call.
    pub fn from_isr<R>(&self, f: impl FnOnce(&mut IsrScope<'_>) -> R) -> Result<R, Error> {
        self.with(|kernel, _| Ok(f(&mut IsrScope { kernel })))
    }

    // ---- port support ----

    /// The running task, claiming its fresh-start flag. `None` when idle or
    /// before `init`.
    pub fn next_to_run(&self) -> Option<NextTask> {
        sync::critical_section(|cs| {
            let mut kernel = self.kernel.borrow(cs).try_borrow_mut().ok()?;
            let kernel = kernel.as_mut()?;
            let id = kernel.running()?;
            let fresh = kernel.take_fresh_start(id);
            let entry = kernel.task(id).ok()?.config.entry;
            Some(NextTask { id, fresh, entry })
        })
    }
}

impl<P: Port> Default for Os<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel access from an interrupt handler, handed out by [`Os::from_isr`].
pub struct IsrScope<'a> {
    kernel: &'a mut Kernel,
}

impl IsrScope<'_> {
    pub fn activate_task(&mut self, task: TaskId) -> Result<(), Error> {
        self.kernel.activate_task(Context::Isr, task)
    }

    pub fn set_event(&mut self, task: TaskId, mask: EventMask) -> Result<(), Error> {
        self.kernel.set_event(Context::Isr, task, mask)
    }

    pub fn get_task_state(&mut self, task: TaskId) -> Result<TaskState, Error> {
        self.kernel.get_task_state(Context::Isr, task)
    }
}
