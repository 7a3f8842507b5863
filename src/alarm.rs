//! # Counters and Alarms
//!
//! A counter is a tick source counting `0..=max_allowed_value` and wrapping
//! back to zero. An alarm is attached to one counter and fires when the
//! counter reaches its expiry tick, then either re-arms itself `cycle` ticks
//! later or deactivates.
//!
//! ```text
//!  counter  ... 8   9   10  11 ... 19  20  21 ...
//!                       ▲               ▲
//!  alarm(inc=10, cycle=10) fires        fires        ...
//! ```
//!
//! This module only keeps time. [`AlarmTable::tick`] returns the actions of
//! the alarms that expired, in declaration order, and the kernel carries them
//! out through the scheduler and the event manager.

use core::fmt;

use heapless::Vec;

use crate::config::{AppModeSet, MAX_ALARMS, MAX_COUNTERS};
use crate::error::Error;
use crate::task::{EventMask, TaskConfig, TaskId};

/// Counter value.
pub type TickType = u32;

/// Dense counter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CounterId(pub u8);

/// Dense alarm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmId(pub u8);

impl CounterId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl AlarmId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alarm#{}", self.0)
    }
}

/// Static configuration for a counter.
#[derive(Debug, Clone, Copy)]
pub struct CounterConfig {
    pub name: &'static str,
    /// Largest counter value; the counter wraps to 0 after it. Must be
    /// below `TickType::MAX` so the modulus fits a `TickType`.
    pub max_allowed_value: TickType,
    /// Underlying source ticks per counter tick. Informational.
    pub ticks_per_base: TickType,
    /// Smallest permitted non-zero alarm cycle.
    pub min_cycle: TickType,
}

/// Counter characteristics as reported by `get_alarm_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmBase {
    pub max_allowed_value: TickType,
    pub ticks_per_base: TickType,
    pub min_cycle: TickType,
}

/// What an alarm does when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmAction {
    ActivateTask(TaskId),
    SetEvent(TaskId, EventMask),
    /// Called in interrupt context with interrupts masked. Kernel services
    /// called from here fail with `IllegalContext`.
    Callback(fn()),
}

/// How an auto-started alarm computes its first expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStart {
    Relative(TickType),
    Absolute(TickType),
}

#[derive(Debug, Clone, Copy)]
pub struct AlarmAutostart {
    pub modes: AppModeSet,
    pub start: AlarmStart,
    pub cycle: TickType,
}

/// Static configuration for an alarm.
#[derive(Debug, Clone, Copy)]
pub struct AlarmConfig {
    pub name: &'static str,
    pub counter: CounterId,
    pub action: AlarmAction,
    pub autostart: Option<AlarmAutostart>,
}

// ---------------------------------------------------------------------------
// Control blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Counter {
    pub config: CounterConfig,
    pub value: TickType,
}

impl Counter {
    fn new(config: CounterConfig) -> Self {
        Self { config, value: 0 }
    }

    /// Number of distinct counter values.
    #[inline]
    fn modulus(&self) -> u64 {
        self.config.max_allowed_value as u64 + 1
    }

    /// `a + b` modulo wraparound.
    #[inline]
    fn add(&self, a: TickType, b: TickType) -> TickType {
        ((a as u64 + b as u64) % self.modulus()) as TickType
    }

    /// `a - b` modulo wraparound.
    #[inline]
    fn sub(&self, a: TickType, b: TickType) -> TickType {
        ((a as u64 + self.modulus() - b as u64) % self.modulus()) as TickType
    }

    fn check_cycle(&self, cycle: TickType) -> Result<(), Error> {
        if cycle != 0 && (cycle < self.config.min_cycle || cycle > self.config.max_allowed_value)
        {
            return Err(Error::InvalidValue);
        }
        Ok(())
    }

    pub fn alarm_base(&self) -> AlarmBase {
        AlarmBase {
            max_allowed_value: self.config.max_allowed_value,
            ticks_per_base: self.config.ticks_per_base,
            min_cycle: self.config.min_cycle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alarm {
    pub config: AlarmConfig,
    pub armed: bool,
    /// Absolute counter value of the next expiry. Meaningful while armed.
    pub expiry: TickType,
    /// Re-arm interval; 0 for a one-shot alarm.
    pub cycle: TickType,
}

/// Counters plus the alarms attached to them.
#[derive(Debug)]
pub struct AlarmTable {
    counters: Vec<Counter, MAX_COUNTERS>,
    alarms: Vec<Alarm, MAX_ALARMS>,
}

/// Actions of the alarms that expired on one tick, in declaration order.
pub type Expired = Vec<(AlarmId, AlarmAction), MAX_ALARMS>;

impl AlarmTable {
    /// Build the tables, validating every cross reference.
    ///
    /// Fails with `InvalidId` if a table overflows or an alarm names an
    /// unknown counter or task, and with `InvalidValue` if a counter or an
    /// auto-start declaration is out of range.
    pub fn new(
        counters: &[CounterConfig],
        alarms: &[AlarmConfig],
        tasks: &[TaskConfig],
    ) -> Result<Self, Error> {
        let mut table = Self {
            counters: Vec::new(),
            alarms: Vec::new(),
        };

        for config in counters {
            if config.max_allowed_value == 0
                || config.max_allowed_value == TickType::MAX
                || config.min_cycle > config.max_allowed_value
            {
                log::error!("counter '{}' has an invalid range", config.name);
                return Err(Error::InvalidValue);
            }
            table
                .counters
                .push(Counter::new(*config))
                .map_err(|_| Error::InvalidId)?;
        }

        for config in alarms {
            let counter = table
                .counters
                .get(config.counter.index())
                .ok_or(Error::InvalidId)?;

            let target = match config.action {
                AlarmAction::ActivateTask(t) => Some(t),
                AlarmAction::SetEvent(t, _) => Some(t),
                AlarmAction::Callback(_) => None,
            };
            if let Some(t) = target {
                if t.index() >= tasks.len() {
                    log::error!("alarm '{}' targets unknown {}", config.name, t);
                    return Err(Error::InvalidId);
                }
            }

            if let Some(auto) = config.autostart {
                let start = match auto.start {
                    AlarmStart::Relative(t) | AlarmStart::Absolute(t) => t,
                };
                if start > counter.config.max_allowed_value {
                    return Err(Error::InvalidValue);
                }
                if let AlarmStart::Relative(0) = auto.start {
                    return Err(Error::InvalidValue);
                }
                counter.check_cycle(auto.cycle)?;
            }

            table
                .alarms
                .push(Alarm {
                    config: *config,
                    armed: false,
                    expiry: 0,
                    cycle: 0,
                })
                .map_err(|_| Error::InvalidId)?;
        }

        Ok(table)
    }

    pub fn counter(&self, id: CounterId) -> Result<&Counter, Error> {
        self.counters.get(id.index()).ok_or(Error::InvalidId)
    }

    pub fn alarm(&self, id: AlarmId) -> Result<&Alarm, Error> {
        self.alarms.get(id.index()).ok_or(Error::InvalidId)
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    /// The alarm and the counter it is attached to.
    fn split_mut(&mut self, id: AlarmId) -> Result<(&mut Alarm, &Counter), Error> {
        let alarm = self.alarms.get_mut(id.index()).ok_or(Error::InvalidId)?;
        let counter = &self.counters[alarm.config.counter.index()];
        Ok((alarm, counter))
    }

    pub fn get_alarm_base(&self, id: AlarmId) -> Result<AlarmBase, Error> {
        let alarm = self.alarm(id)?;
        Ok(self.counters[alarm.config.counter.index()].alarm_base())
    }

    /// Ticks left until the alarm expires, in `1..=modulus`.
    pub fn get_alarm(&self, id: AlarmId) -> Result<TickType, Error> {
        let alarm = self.alarm(id)?;
        if !alarm.armed {
            return Err(Error::NotActive);
        }
        let counter = &self.counters[alarm.config.counter.index()];
        // An expiry equal to `now` lies a full revolution ahead.
        let left = counter.sub(alarm.expiry, counter.value);
        Ok(if left == 0 {
            counter.config.max_allowed_value + 1
        } else {
            left
        })
    }

    /// Arm the alarm to expire `increment` ticks from now.
    pub fn set_relative(
        &mut self,
        id: AlarmId,
        increment: TickType,
        cycle: TickType,
    ) -> Result<(), Error> {
        let (alarm, counter) = self.split_mut(id)?;
        if alarm.armed {
            return Err(Error::AlreadyActive);
        }
        if increment == 0 || increment > counter.config.max_allowed_value {
            return Err(Error::InvalidValue);
        }
        counter.check_cycle(cycle)?;

        alarm.expiry = counter.add(counter.value, increment);
        alarm.cycle = cycle;
        alarm.armed = true;
        log::debug!(
            "{} '{}' armed at {} (cycle {})",
            id,
            alarm.config.name,
            alarm.expiry,
            cycle
        );
        Ok(())
    }

    /// Arm the alarm to expire when the counter next reaches `start`.
    pub fn set_absolute(
        &mut self,
        id: AlarmId,
        start: TickType,
        cycle: TickType,
    ) -> Result<(), Error> {
        let (alarm, counter) = self.split_mut(id)?;
        if alarm.armed {
            return Err(Error::AlreadyActive);
        }
        if start > counter.config.max_allowed_value {
            return Err(Error::InvalidValue);
        }
        counter.check_cycle(cycle)?;

        alarm.expiry = start;
        alarm.cycle = cycle;
        alarm.armed = true;
        log::debug!(
            "{} '{}' armed at {} (cycle {})",
            id,
            alarm.config.name,
            start,
            cycle
        );
        Ok(())
    }

    /// Disarm the alarm. Cancelling a disarmed alarm is not an error.
    pub fn cancel(&mut self, id: AlarmId) -> Result<(), Error> {
        let alarm = self.alarms.get_mut(id.index()).ok_or(Error::InvalidId)?;
        alarm.armed = false;
        Ok(())
    }

    /// Arm every alarm configured to auto-start in `modes`.
    pub fn autostart(&mut self, mode: crate::config::AppMode) -> Result<(), Error> {
        for i in 0..self.alarms.len() {
            let id = AlarmId(i as u8);
            let Some(auto) = self.alarms[i].config.autostart else {
                continue;
            };
            if !auto.modes.contains(mode) {
                continue;
            }
            match auto.start {
                AlarmStart::Relative(inc) => self.set_relative(id, inc, auto.cycle)?,
                AlarmStart::Absolute(start) => self.set_absolute(id, start, auto.cycle)?,
            }
        }
        Ok(())
    }

    /// Advance `id` by one tick and collect the actions of every alarm on it
    /// that expires at the new value. Cyclic alarms are re-armed, one-shot
    /// alarms disarmed.
    pub fn tick(&mut self, id: CounterId) -> Result<Expired, Error> {
        let counter = self.counters.get_mut(id.index()).ok_or(Error::InvalidId)?;
        counter.value = counter.add(counter.value, 1);
        let counter = &self.counters[id.index()];
        let now = counter.value;

        let mut expired = Expired::new();
        for (i, alarm) in self.alarms.iter_mut().enumerate() {
            if !alarm.armed || alarm.config.counter != id || alarm.expiry != now {
                continue;
            }
            if alarm.cycle == 0 {
                alarm.armed = false;
            } else {
                alarm.expiry = counter.add(now, alarm.cycle);
            }
            log::debug!("alarm '{}' fired at {}", alarm.config.name, now);
            // At most one entry per alarm, so this never overflows.
            let _ = expired.push((AlarmId(i as u8), alarm.config.action));
        }
        Ok(expired)
    }

    pub fn counter_value(&self, id: CounterId) -> Result<TickType, Error> {
        Ok(self.counter(id)?.value)
    }

    /// Ticks elapsed since `*previous`, which is updated to the current
    /// value.
    pub fn elapsed(&self, id: CounterId, previous: &mut TickType) -> Result<TickType, Error> {
        let counter = self.counter(id)?;
        if *previous > counter.config.max_allowed_value {
            return Err(Error::InvalidValue);
        }
        let elapsed = counter.sub(counter.value, *previous);
        *previous = counter.value;
        Ok(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppMode;

    extern "C" fn entry() {}

    const TASKS: [TaskConfig; 1] = [TaskConfig::new("t", 1, entry)];

    const COUNTERS: [CounterConfig; 2] = [
        CounterConfig {
            name: "sys",
            max_allowed_value: 999,
            ticks_per_base: 1,
            min_cycle: 1,
        },
        CounterConfig {
            name: "small",
            max_allowed_value: 7,
            ticks_per_base: 4,
            min_cycle: 2,
        },
    ];

    fn alarm(name: &'static str, counter: u8) -> AlarmConfig {
        AlarmConfig {
            name,
            counter: CounterId(counter),
            action: AlarmAction::ActivateTask(TaskId(0)),
            autostart: None,
        }
    }

    fn ticks(table: &mut AlarmTable, counter: CounterId, n: u32) -> std::vec::Vec<(u32, AlarmId)> {
        let mut fired = std::vec::Vec::new();
        for _ in 0..n {
            let expired = table.tick(counter).unwrap();
            let now = table.counter_value(counter).unwrap();
            fired.extend(expired.iter().map(|&(a, _)| (now, a)));
        }
        fired
    }

    #[test]
    fn test_cyclic_alarm_fires_every_cycle() {
        let alarms = [alarm("a", 0)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        table.set_relative(AlarmId(0), 10, 10).unwrap();

        let fired = ticks(&mut table, CounterId(0), 45);
        let at: std::vec::Vec<u32> = fired.iter().map(|&(t, _)| t).collect();
        assert_eq!(at, [10, 20, 30, 40]);

        table.cancel(AlarmId(0)).unwrap();
        assert!(ticks(&mut table, CounterId(0), 100).is_empty());
    }

    #[test]
    fn test_cancel_before_expiry_prevents_firing() {
        let alarms = [alarm("a", 0)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        table.set_relative(AlarmId(0), 10, 10).unwrap();
        ticks(&mut table, CounterId(0), 9);
        table.cancel(AlarmId(0)).unwrap();
        table.cancel(AlarmId(0)).unwrap();
        assert!(ticks(&mut table, CounterId(0), 50).is_empty());
    }

    #[test]
    fn test_one_shot_deactivates() {
        let alarms = [alarm("a", 0)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        table.set_relative(AlarmId(0), 3, 0).unwrap();
        assert_eq!(ticks(&mut table, CounterId(0), 10), [(3, AlarmId(0))]);
        assert!(!table.alarm(AlarmId(0)).unwrap().armed);
        assert_eq!(table.get_alarm(AlarmId(0)), Err(Error::NotActive));
    }

    #[test]
    fn test_already_active() {
        let alarms = [alarm("a", 0)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        table.set_relative(AlarmId(0), 5, 0).unwrap();
        assert_eq!(
            table.set_relative(AlarmId(0), 5, 0),
            Err(Error::AlreadyActive)
        );
        assert_eq!(
            table.set_absolute(AlarmId(0), 5, 0),
            Err(Error::AlreadyActive)
        );
    }

    #[test]
    fn test_argument_validation() {
        let alarms = [alarm("a", 1)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        let a = AlarmId(0);
        assert_eq!(table.set_relative(a, 0, 0), Err(Error::InvalidValue));
        assert_eq!(table.set_relative(a, 8, 0), Err(Error::InvalidValue));
        assert_eq!(table.set_relative(a, 1, 1), Err(Error::InvalidValue));
        assert_eq!(table.set_relative(a, 1, 8), Err(Error::InvalidValue));
        assert_eq!(table.set_absolute(a, 8, 0), Err(Error::InvalidValue));
        assert_eq!(table.set_relative(AlarmId(3), 1, 0), Err(Error::InvalidId));
        table.set_relative(a, 7, 2).unwrap();
    }

    #[test]
    fn test_wraparound() {
        let alarms = [alarm("a", 1)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        ticks(&mut table, CounterId(1), 6);
        table.set_relative(AlarmId(0), 3, 4).unwrap();
        // 6 + 3 wraps to 1, then every 4 ticks
        let fired = ticks(&mut table, CounterId(1), 12);
        let at: std::vec::Vec<u32> = fired.iter().map(|&(t, _)| t).collect();
        assert_eq!(at, [1, 5, 1]);
    }

    #[test]
    fn test_absolute_at_current_value_waits_full_revolution() {
        let alarms = [alarm("a", 1)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        ticks(&mut table, CounterId(1), 2);
        table.set_absolute(AlarmId(0), 2, 0).unwrap();
        assert_eq!(table.get_alarm(AlarmId(0)), Ok(8));
        assert!(ticks(&mut table, CounterId(1), 7).is_empty());
        assert_eq!(ticks(&mut table, CounterId(1), 1), [(2, AlarmId(0))]);
    }

    #[test]
    fn test_same_tick_fires_in_declaration_order() {
        let alarms = [alarm("a", 0), alarm("b", 0), alarm("other", 1), alarm("c", 0)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        table.set_relative(AlarmId(3), 5, 0).unwrap();
        table.set_relative(AlarmId(0), 5, 0).unwrap();
        table.set_absolute(AlarmId(1), 5, 0).unwrap();
        table.set_relative(AlarmId(2), 5, 0).unwrap();

        let fired = ticks(&mut table, CounterId(0), 5);
        assert_eq!(fired, [(5, AlarmId(0)), (5, AlarmId(1)), (5, AlarmId(3))]);
    }

    #[test]
    fn test_get_alarm_counts_down() {
        let alarms = [alarm("a", 0)];
        let mut table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        table.set_relative(AlarmId(0), 10, 0).unwrap();
        assert_eq!(table.get_alarm(AlarmId(0)), Ok(10));
        ticks(&mut table, CounterId(0), 4);
        assert_eq!(table.get_alarm(AlarmId(0)), Ok(6));
    }

    #[test]
    fn test_alarm_base() {
        let alarms = [alarm("a", 1)];
        let table = AlarmTable::new(&COUNTERS, &alarms, &TASKS).unwrap();
        assert_eq!(
            table.get_alarm_base(AlarmId(0)),
            Ok(AlarmBase {
                max_allowed_value: 7,
                ticks_per_base: 4,
                min_cycle: 2,
            })
        );
    }

    #[test]
    fn test_elapsed_value() {
        let table_alarms: [AlarmConfig; 0] = [];
        let mut table = AlarmTable::new(&COUNTERS, &table_alarms, &TASKS).unwrap();
        let mut prev = 0;
        ticks(&mut table, CounterId(1), 5);
        assert_eq!(table.elapsed(CounterId(1), &mut prev), Ok(5));
        assert_eq!(prev, 5);
        ticks(&mut table, CounterId(1), 6);
        // 5 -> 11 wraps to 3
        assert_eq!(table.elapsed(CounterId(1), &mut prev), Ok(6));
        assert_eq!(prev, 3);

        let mut bad = 8;
        assert_eq!(
            table.elapsed(CounterId(1), &mut bad),
            Err(Error::InvalidValue)
        );
    }

    #[test]
    fn test_config_validation() {
        let bad_counter = [alarm("a", 5)];
        assert_eq!(
            AlarmTable::new(&COUNTERS, &bad_counter, &TASKS).err(),
            Some(Error::InvalidId)
        );

        let mut bad_task = alarm("a", 0);
        bad_task.action = AlarmAction::SetEvent(TaskId(4), 1);
        assert_eq!(
            AlarmTable::new(&COUNTERS, &[bad_task], &TASKS).err(),
            Some(Error::InvalidId)
        );

        let mut bad_auto = alarm("a", 1);
        bad_auto.autostart = Some(AlarmAutostart {
            modes: AppModeSet::DEFAULT,
            start: AlarmStart::Relative(2),
            cycle: 1,
        });
        assert_eq!(
            AlarmTable::new(&COUNTERS, &[bad_auto], &TASKS).err(),
            Some(Error::InvalidValue)
        );
    }

    #[test]
    fn test_full_range_counter_rejected() {
        // A modulus of 2^32 would report a full revolution as 0 ticks left
        let counters = [CounterConfig {
            name: "wide",
            max_allowed_value: TickType::MAX,
            ticks_per_base: 1,
            min_cycle: 1,
        }];
        assert_eq!(
            AlarmTable::new(&counters, &[alarm("a", 0)], &TASKS).err(),
            Some(Error::InvalidValue)
        );

        let counters = [CounterConfig {
            max_allowed_value: TickType::MAX - 1,
            ..counters[0]
        }];
        let mut table = AlarmTable::new(&counters, &[alarm("a", 0)], &TASKS).unwrap();
        table.set_absolute(AlarmId(0), 0, 0).unwrap();
        assert_eq!(table.get_alarm(AlarmId(0)), Ok(TickType::MAX));
    }

    #[test]
    fn test_autostart_by_mode() {
        let mut a = alarm("a", 0);
        a.autostart = Some(AlarmAutostart {
            modes: AppModeSet::DEFAULT,
            start: AlarmStart::Relative(100),
            cycle: 100,
        });
        let mut b = alarm("b", 0);
        b.autostart = Some(AlarmAutostart {
            modes: AppModeSet::NONE.with(AppMode(1)),
            start: AlarmStart::Absolute(3),
            cycle: 0,
        });
        let mut table = AlarmTable::new(&COUNTERS, &[a, b], &TASKS).unwrap();
        table.autostart(AppMode::DEFAULT).unwrap();
        assert!(table.alarm(AlarmId(0)).unwrap().armed);
        assert!(!table.alarm(AlarmId(1)).unwrap().armed);
        assert_eq!(table.get_alarm(AlarmId(0)), Ok(100));
    }
}
