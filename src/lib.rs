//! # oskern
//!
//! An OSEK/AUTOSAR-style fixed-priority real-time kernel for single-core
//! ARM Cortex-M4 microcontrollers.
//!
//! ## Overview
//!
//! The kernel runs a static set of tasks, declared once in a [`Config`], and
//! provides the OSEK services around them:
//!
//! - **Tasks** are activated, run to completion and terminate. A task runs
//!   until a higher-priority task becomes ready; non-preemptive tasks give
//!   up the CPU only at rescheduling points.
//! - **Resources** follow the priority ceiling protocol: locking a resource
//!   raises the holder to the highest priority of any task that may lock it,
//!   so a locked resource is never contended.
//! - **Events** let extended tasks block until another task or an interrupt
//!   signals them.
//! - **Counters and alarms** turn a tick source into one-shot or cyclic task
//!   activations, event posts or callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              Application Tasks and ISRs                │
//! ├────────────────────────────────────────────────────────┤
//! │        OS instance (os.rs) · critical sections         │
//! │   activate_task · wait_event · get_resource · tick …   │
//! ├────────────────────────────────────────────────────────┤
//! │    Kernel (kernel.rs) · context rules (service.rs)     │
//! ├────────────┬──────────────┬─────────────┬──────────────┤
//! │ Scheduler  │  Resources   │   Events    │   Alarms     │
//! │scheduler.rs│  resource.rs │  event.rs   │   alarm.rs   │
//! ├────────────┴──────────────┴─────────────┴──────────────┤
//! │            Task Model (task.rs) · Errors (error.rs)    │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch Port (arch/cortex_m4.rs): PendSV · SysTick ·    │
//! │   task stacks                                          │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2)               │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the port is plain data and builds on the host, where
//! the unit tests run.
//!
//! ## Example
//!
//! ```ignore
//! const TASKS: [TaskConfig; 2] = [
//!     TaskConfig::new("blink", 1, blink),
//!     TaskConfig::new("serial", 2, serial).with_resources(ResourceSet::EMPTY.with(UART)),
//! ];
//!
//! #[entry]
//! fn main() -> ! {
//!     let core = cortex_m::Peripherals::take().expect("core peripherals");
//!     cortex_m4::start(&CONFIG, AppMode::DEFAULT, core)
//! }
//!
//! extern "C" fn serial() {
//!     if OS.get_resource(UART).is_ok() {
//!         // ...
//!         let _ = OS.release_resource(UART);
//!     }
//!     let _ = OS.terminate_task();
//! }
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: all state is statically allocated
//! - **Fixed-capacity tables**: `heapless::Vec` sized by [`config`]
//! - **Per-task stack**: `[u8; STACK_SIZE]` per slot in the port
//! - **Critical sections**: `critical_section::with()` for shared state
//!
//! ## Logging
//!
//! The kernel logs through the `log` facade: dispatch decisions at `trace`,
//! state changes at `debug`, failed services at `warn`.

#![cfg_attr(not(test), no_std)]

pub mod alarm;
pub mod arch;
pub mod config;
pub mod error;
pub mod event;
pub mod kernel;
pub mod os;
pub mod resource;
pub mod scheduler;
pub mod service;
pub mod sync;
pub mod task;

pub use alarm::{AlarmAction, AlarmConfig, AlarmId, CounterConfig, CounterId, TickType};
pub use config::{AppMode, AppModeSet, Config, Hooks};
pub use error::Error;
pub use kernel::Kernel;
pub use os::Os;
pub use resource::{ResourceConfig, ResourceId, ResourceSet};
pub use service::{Context, Service};
pub use task::{EventMask, TaskConfig, TaskId, TaskState};
