//! # oskern Demo Firmware
//!
//! A serial console application for the STM32F407 (USART2 on PA2/PA3 at
//! 115200 baud, LED on PD12) built from five tasks sharing one UART:
//!
//! | Task | Priority | Activation | Behavior |
//! |------|----------|------------|----------|
//! | `TaskSerial` | 2 | alarm, 1000 ms | prints a counter and the uptime |
//! | `TaskBlink` | 1 | alarm, 500 ms | toggles the LED |
//! | `TaskProcess` | 4 | UART ISR | waits for `EVT_DATA_READY`, prints the received line |
//! | `Task100ms` | 3 | alarm, 100 ms | prints a counter |
//! | `Task1000ms` | 2 | alarm, 1000 ms | prints both counters |
//!
//! Every task that prints holds `RES_UART` while doing so. The ceiling
//! protocol raises it to priority 4, so lines never interleave.
//!
//! The UART receive interrupt echoes each character and collects a line.
//! On end of line it activates `TaskProcess` and posts `EVT_DATA_READY`.

#![no_std]
#![no_main]

use core::cell::RefCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::{entry, exception};
use panic_halt as _;

use oskern::alarm::{AlarmAutostart, AlarmStart};
use oskern::arch::cortex_m4::{self, OS, SYSTEM_COUNTER};
use oskern::config::TICK_HZ;
use oskern::sync::{critical_section, Mutex};
use oskern::{
    AlarmAction, AlarmConfig, AppMode, AppModeSet, Config, CounterConfig, Error, EventMask, Hooks,
    ResourceConfig, ResourceId, ResourceSet, Service, TaskConfig, TaskId, TaskState,
};

// ---------------------------------------------------------------------------
// Application configuration
// ---------------------------------------------------------------------------

const TASK_SERIAL: TaskId = TaskId(0);
const TASK_BLINK: TaskId = TaskId(1);
const TASK_PROCESS: TaskId = TaskId(2);
const TASK_100MS: TaskId = TaskId(3);
const TASK_1000MS: TaskId = TaskId(4);

const EVT_DATA_READY: EventMask = 0x01;

const RES_UART: ResourceId = ResourceId(0);

const UART_USERS: ResourceSet = ResourceSet::EMPTY.with(RES_UART);

const TASKS: [TaskConfig; 5] = [
    TaskConfig::new("TaskSerial", 2, task_serial).with_resources(UART_USERS),
    TaskConfig::new("TaskBlink", 1, task_blink),
    TaskConfig::new("TaskProcess", 4, task_process)
        .with_events(EVT_DATA_READY)
        .with_resources(UART_USERS),
    TaskConfig::new("Task100ms", 3, task_100ms).with_resources(UART_USERS),
    TaskConfig::new("Task1000ms", 2, task_1000ms).with_resources(UART_USERS),
];

const RESOURCES: [ResourceConfig; 1] = [ResourceConfig { name: "ResUart" }];

/// One tick per millisecond, wrapping after a minute.
const COUNTERS: [CounterConfig; 1] = [CounterConfig {
    name: "SystemCounter",
    max_allowed_value: 60 * TICK_HZ - 1,
    ticks_per_base: 1,
    min_cycle: 1,
}];

const fn cyclic(name: &'static str, task: TaskId, period_ms: u32) -> AlarmConfig {
    AlarmConfig {
        name,
        counter: SYSTEM_COUNTER,
        action: AlarmAction::ActivateTask(task),
        autostart: Some(AlarmAutostart {
            modes: AppModeSet::DEFAULT,
            start: AlarmStart::Relative(period_ms),
            cycle: period_ms,
        }),
    }
}

const ALARMS: [AlarmConfig; 4] = [
    cyclic("AlarmSerial", TASK_SERIAL, 1000),
    cyclic("AlarmBlink", TASK_BLINK, 500),
    cyclic("Alarm100ms", TASK_100MS, 100),
    cyclic("Alarm1000ms", TASK_1000MS, 1000),
];

const CONFIG: Config<'static> = Config {
    tasks: &TASKS,
    resources: &RESOURCES,
    counters: &COUNTERS,
    alarms: &ALARMS,
    hooks: Hooks {
        startup: startup_hook,
        shutdown: shutdown_hook,
        error: error_hook,
    },
};

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

type Line = heapless::String<128>;

static SERIAL_COUNT: AtomicU32 = AtomicU32::new(0);
static COUNT_100MS: AtomicU32 = AtomicU32::new(0);
static COUNT_1000MS: AtomicU32 = AtomicU32::new(0);

/// Characters received since the last end of line.
static RX_PARTIAL: Mutex<RefCell<Line>> = Mutex::new(RefCell::new(Line::new()));
/// The last complete line, handed to `TaskProcess`.
static RX_LINE: Mutex<RefCell<Line>> = Mutex::new(RefCell::new(Line::new()));

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

fn startup_hook() {
    board::init();

    let _ = writeln!(Uart);
    let _ = writeln!(Uart, "================================================");
    let _ = writeln!(Uart, " oskern on STM32F407");
    let _ = writeln!(Uart, " Serial Communication Test");
    let _ = writeln!(Uart, "================================================");
    let _ = writeln!(Uart);
}

fn error_hook(error: Error, service: Service) {
    let _ = writeln!(Uart, "ERROR: {:#04x} in {} ({})", error.status_code(), service, error);
    board::led_toggle();
}

fn shutdown_hook(status: Result<(), Error>) {
    let code = status.err().map_or(0, Error::status_code);
    let _ = writeln!(Uart, "\nSystem Shutdown. Error code: {:#04x}", code);
}

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Print the activation count once per second.
extern "C" fn task_serial() {
    if OS.get_resource(RES_UART).is_ok() {
        let n = SERIAL_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = writeln!(Uart, "[TaskSerial] Count: {} | Uptime: {} sec", n, n);
        let _ = OS.release_resource(RES_UART);
    }
    let _ = OS.terminate_task();
}

extern "C" fn task_blink() {
    board::led_toggle();
    let _ = OS.terminate_task();
}

/// Print the line the UART interrupt collected.
extern "C" fn task_process() {
    if OS.wait_event(EVT_DATA_READY).is_ok() {
        let events = OS.get_event(TASK_PROCESS).unwrap_or(0);
        if events & EVT_DATA_READY != 0 {
            let line = critical_section(|cs| RX_LINE.borrow_ref(cs).clone());
            if OS.get_resource(RES_UART).is_ok() {
                let _ = writeln!(Uart, "[TaskProcess] Received: {}", line);
                let _ = OS.release_resource(RES_UART);
            }
            let _ = OS.clear_event(EVT_DATA_READY);
        }
    }
    let _ = OS.terminate_task();
}

extern "C" fn task_100ms() {
    if OS.get_resource(RES_UART).is_ok() {
        let n = COUNT_100MS.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = writeln!(Uart, "[100ms Task] Counter: {}", n);
        let _ = OS.release_resource(RES_UART);
    }
    let _ = OS.terminate_task();
}

extern "C" fn task_1000ms() {
    if OS.get_resource(RES_UART).is_ok() {
        let n = COUNT_1000MS.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = writeln!(
            Uart,
            "[1000ms Task] Counter: {} | 100ms Counter: {}",
            n,
            COUNT_100MS.load(Ordering::Relaxed)
        );
        let _ = OS.release_resource(RES_UART);
    }
    let _ = OS.terminate_task();
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// All device interrupts land here: the runtime is built without a device
/// vector table.
#[exception]
unsafe fn DefaultHandler(irqn: i16) {
    if irqn == board::USART2_IRQ as i16 {
        uart_rx_isr();
    }
}

fn uart_rx_isr() {
    let Some(byte) = board::uart_read() else {
        return;
    };
    board::uart_write(byte);

    if byte == b'\r' || byte == b'\n' {
        critical_section(|cs| {
            let mut partial = RX_PARTIAL.borrow_ref_mut(cs);
            *RX_LINE.borrow_ref_mut(cs) = partial.clone();
            partial.clear();
        });
        board::uart_write(b'\r');
        board::uart_write(b'\n');

        // A task still busy with the previous line only gets the event
        let _ = OS.from_isr(|isr| {
            if isr.get_task_state(TASK_PROCESS) == Ok(TaskState::Suspended) {
                let _ = isr.activate_task(TASK_PROCESS);
            }
            let _ = isr.set_event(TASK_PROCESS, EVT_DATA_READY);
        });
    } else {
        critical_section(|cs| {
            // A full buffer drops the rest of the line
            let _ = RX_PARTIAL.borrow_ref_mut(cs).push(byte as char);
        });
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let core = cortex_m::Peripherals::take().expect("core peripherals already taken");
    cortex_m4::start(&CONFIG, AppMode::DEFAULT, core)
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Blocking writer on USART2, translating `\n` to `\r\n`.
struct Uart;

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                board::uart_write(b'\r');
            }
            board::uart_write(b);
        }
        Ok(())
    }
}

/// STM32F407 register access for the demo. Runs from the 16 MHz HSI.
mod board {
    use core::ptr::{read_volatile, write_volatile};

    use cortex_m::interrupt::InterruptNumber;
    use cortex_m::peripheral::NVIC;
    use oskern::config::SYSTEM_CLOCK_HZ;

    const RCC_AHB1ENR: *mut u32 = 0x4002_3830 as *mut u32;
    const RCC_APB1ENR: *mut u32 = 0x4002_3840 as *mut u32;
    const GPIOA_MODER: *mut u32 = 0x4002_0000 as *mut u32;
    const GPIOA_AFRL: *mut u32 = 0x4002_0020 as *mut u32;
    const GPIOD_MODER: *mut u32 = 0x4002_0C00 as *mut u32;
    const GPIOD_ODR: *mut u32 = 0x4002_0C14 as *mut u32;
    const USART2_SR: *mut u32 = 0x4000_4400 as *mut u32;
    const USART2_DR: *mut u32 = 0x4000_4404 as *mut u32;
    const USART2_BRR: *mut u32 = 0x4000_4408 as *mut u32;
    const USART2_CR1: *mut u32 = 0x4000_440C as *mut u32;

    const SR_RXNE: u32 = 1 << 5;
    const SR_TXE: u32 = 1 << 7;
    const BAUD: u32 = 115_200;

    pub const USART2_IRQ: u16 = 38;

    #[derive(Clone, Copy)]
    struct Usart2;

    unsafe impl InterruptNumber for Usart2 {
        fn number(self) -> u16 {
            USART2_IRQ
        }
    }

    unsafe fn modify(reg: *mut u32, f: impl FnOnce(u32) -> u32) {
        write_volatile(reg, f(read_volatile(reg)));
    }

    /// Clock the peripherals, route USART2 to PA2/PA3, make PD12 an output
    /// and enable the receive interrupt.
    pub fn init() {
        unsafe {
            modify(RCC_AHB1ENR, |v| v | 1 << 0 | 1 << 3); // GPIOA, GPIOD
            modify(RCC_APB1ENR, |v| v | 1 << 17); // USART2

            modify(GPIOA_MODER, |v| (v & !(0xF << 4)) | (0b1010 << 4));
            modify(GPIOA_AFRL, |v| (v & !(0xFF << 8)) | (0x77 << 8)); // AF7
            modify(GPIOD_MODER, |v| (v & !(0b11 << 24)) | (0b01 << 24));

            write_volatile(USART2_BRR, SYSTEM_CLOCK_HZ / BAUD);
            // UE | RXNEIE | TE | RE
            write_volatile(USART2_CR1, 1 << 13 | 1 << 5 | 1 << 3 | 1 << 2);

            NVIC::unmask(Usart2);
        }
    }

    pub fn uart_write(byte: u8) {
        unsafe {
            while read_volatile(USART2_SR) & SR_TXE == 0 {}
            write_volatile(USART2_DR, byte as u32);
        }
    }

    pub fn uart_read() -> Option<u8> {
        unsafe {
            if read_volatile(USART2_SR) & SR_RXNE != 0 {
                Some(read_volatile(USART2_DR) as u8)
            } else {
                None
            }
        }
    }

    pub fn led_toggle() {
        unsafe { modify(GPIOD_ODR, |v| v ^ 1 << 12) }
    }
}
