//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! per-task stacks, context switching via PendSV, the SysTick tick and the
//! global [`OS`] instance.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV saves and restores R4–R11 by hand, which
//! completes the context. Tasks must not use the FPU: its registers are not
//! part of the saved context (build for `thumbv7em-none-eabi`).
//!
//! Every task owns a stack slot; one extra slot belongs to the idle loop,
//! which runs whenever the kernel has no running task. A task that was
//! activated since it last ran gets a fresh frame pointing at its entry
//! function, so terminated tasks never resume.
//!
//! ## Interrupt Priorities
//!
//! PendSV and SysTick both run at the lowest priority. PendSV therefore
//! never preempts another handler, and the switch requested by a kernel
//! service happens as soon as the service leaves its critical section.

use core::arch::{asm, naked_asm};
use core::ptr::addr_of_mut;

use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::alarm::CounterId;
use crate::arch::Port;
use crate::config::{AppMode, Config, MAX_TASKS, STACK_SIZE, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::os::{NextTask, Os};
use crate::service::Context;

pub struct CortexM4;

impl Port for CortexM4 {
    fn context() -> Context {
        match SCB::vect_active() {
            VectActive::ThreadMode => Context::Task,
            _ => Context::Isr,
        }
    }

    #[inline]
    fn request_dispatch() {
        SCB::set_pendsv();
    }

    fn halt() -> ! {
        cortex_m::interrupt::disable();
        loop {
            cortex_m::asm::wfi();
        }
    }
}

/// The kernel instance. Applications call its services from tasks and
/// interrupt handlers.
pub static OS: Os<CortexM4> = Os::new();

/// Counter advanced by SysTick. Configure it as the first counter.
pub const SYSTEM_COUNTER: CounterId = CounterId(0);

// ---------------------------------------------------------------------------
// Task stacks
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
#[repr(C, align(8))]
struct Stack([u8; STACK_SIZE]);

const IDLE: usize = MAX_TASKS;

static mut STACKS: [Stack; MAX_TASKS + 1] = [Stack([0; STACK_SIZE]); MAX_TASKS + 1];

/// Saved PSP of every slot, pointing at its software-saved R4–R11.
static mut SAVED_SP: [*mut u32; MAX_TASKS + 1] = [core::ptr::null_mut(); MAX_TASKS + 1];

/// Slot whose context is on the CPU.
static mut CURRENT: usize = IDLE;

/// Build an initial exception frame at the top of `slot`'s stack and
/// return the PSP to restore it from.
///
/// # Safety
/// `slot` must not be the context currently on the CPU.
unsafe fn init_frame(slot: usize, entry: extern "C" fn()) -> *mut u32 {
    let stack = &mut (*addr_of_mut!(STACKS))[slot];
    let stack_top = stack.0.as_mut_ptr() as usize + STACK_SIZE;
    // Align to 8 bytes (AAPCS requirement)
    let aligned_top = stack_top & !0x07;

    // 8 software-saved registers below the 8-word hardware frame
    let frame = (aligned_top - 16 * 4) as *mut u32;
    for i in 0..13 {
        // R4–R11, then R0–R3 and R12
        frame.add(i).write(0);
    }
    frame.add(13).write(task_exit as usize as u32); // LR
    frame.add(14).write(entry as usize as u32 & !1); // PC
    frame.add(15).write(0x0100_0000); // xPSR, Thumb bit
    frame
}

/// Return address of every task entry function: terminate the task.
extern "C" fn task_exit() -> ! {
    let _ = OS.terminate_task();
    // Only reached if the kernel refused the termination
    loop {
        cortex_m::asm::wfi();
    }
}

extern "C" fn idle() {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Initialize the kernel from `config`, start it in `mode` and hand the CPU
/// to the tasks. **Does not return.**
///
/// Interrupts stay masked until the idle context is running on the process
/// stack; the PendSV requested by the first dispatch then switches to the
/// first task.
pub fn start(config: &Config<'_>, mode: AppMode, mut core: cortex_m::Peripherals) -> ! {
    cortex_m::interrupt::disable();

    OS.init(config);
    configure_systick(&mut core.SYST);
    set_interrupt_priorities(&mut core.SCB);

    // The kernel has already run the shutdown hook
    if OS.start(mode).is_err() {
        CortexM4::halt();
    }

    unsafe {
        let idle_sp = init_frame(IDLE, idle);
        start_first_task(idle_sp)
    }
}

/// Switch Thread mode to the PSP and branch into the frame at `psp`.
///
/// # Safety
/// Must only be called once, from `start`, with a frame built by
/// `init_frame`.
unsafe fn start_first_task(psp: *const u32) -> ! {
    asm!(
        // Set PSP to the task's stack pointer (skip SW-saved R4-R11)
        "adds r0, #32",
        "msr psp, r0",

        // Switch to PSP for Thread mode (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Pop the hardware frame by hand, we're not returning from an exception
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR, discarded
        "pop {{r5}}",          // PC
        "pop {{r6}}",          // xPSR, discarded
        "orr r5, r5, #1",      // Thumb bit for bx

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the actual context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. `switch_context` stores that PSP and returns the next one
/// 3. Restore R4–R11 from the new stack
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// # Safety
/// Called by the NVIC only. Follows the Cortex-M4 exception entry/exit
/// convention.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch_context}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // Return to Thread mode on the PSP
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch_context = sym switch_context,
    );
}

/// Store `psp` for the outgoing slot and return the PSP of the context to
/// run next, building a fresh frame for a newly activated task.
unsafe extern "C" fn switch_context(psp: *mut u32) -> *mut u32 {
    let saved = &mut *addr_of_mut!(SAVED_SP);
    let current = &mut *addr_of_mut!(CURRENT);
    saved[*current] = psp;

    let next = match OS.next_to_run() {
        Some(NextTask { id, fresh, entry }) => {
            let slot = id.index();
            if fresh {
                saved[slot] = init_frame(slot, entry);
            }
            slot
        }
        None => IDLE,
    };

    *current = next;
    saved[next]
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: one tick of [`SYSTEM_COUNTER`].
#[unsafe(no_mangle)]
pub extern "C" fn SysTick() {
    // Failures already went through the error hook
    let _ = OS.tick(SYSTEM_COUNTER);
}
