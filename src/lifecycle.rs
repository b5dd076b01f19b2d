//! Boot counters, active-duration accounting and reset classification.

use log::{info, warn};

use crate::storage::{Backing, NvStore, Persistence, PersistentValue, RetainedSlot, RetainedStore};

/// Why the chip came out of reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetReason {
    PowerOn,
    External,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    OtherWatchdog,
    DeepSleepWake,
    Brownout,
    Unknown,
}

impl ResetReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResetReason::PowerOn => "POWER_ON",
            ResetReason::External => "EXTERNAL_PIN",
            ResetReason::Software => "SOFTWARE",
            ResetReason::Panic => "EXCEPTION_PANIC",
            ResetReason::InterruptWatchdog => "INTERRUPT_WATCHDOG",
            ResetReason::TaskWatchdog => "TASK_WATCHDOG",
            ResetReason::OtherWatchdog => "OTHER_WATCHDOG",
            ResetReason::DeepSleepWake => "DEEP_SLEEP",
            ResetReason::Brownout => "BROWNOUT",
            ResetReason::Unknown => "UNKNOWN",
        }
    }
}

/// What woke the chip from sleep.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeCause {
    Undefined,
    Ext0,
    Ext1,
    Timer,
    Touchpad,
    Ulp,
    Gpio,
    Uart,
    Wifi,
    Unknown,
}

impl WakeCause {
    pub fn as_str(self) -> &'static str {
        match self {
            WakeCause::Undefined => "UNDEFINED",
            WakeCause::Ext0 => "EXT0",
            WakeCause::Ext1 => "EXT1",
            WakeCause::Timer => "TIMER",
            WakeCause::Touchpad => "TOUCHPAD",
            WakeCause::Ulp => "ULP",
            WakeCause::Gpio => "GPIO",
            WakeCause::Uart => "UART",
            WakeCause::Wifi => "WIFI",
            WakeCause::Unknown => "UNKNOWN",
        }
    }
}

/// Platform clocks and power transitions.
///
/// `deep_sleep`, `restart` and `shutdown` do not return on hardware; test
/// doubles record the call and return so assertions can run afterwards.
pub trait SystemControl {
    fn reset_reason(&self) -> ResetReason;
    fn wake_cause(&self) -> WakeCause;

    /// Milliseconds since boot, monotonic.
    fn uptime_ms(&self) -> u64;

    /// Wall-clock seconds since the Unix epoch; implausible until a time
    /// sync has happened.
    fn wall_clock_s(&self) -> i64;

    fn delay_ms(&mut self, ms: u32);

    fn deep_sleep(&mut self, duration_s: u32);
    fn restart(&mut self);
    fn shutdown(&mut self);
}

/// Retained-arena slot assignments for lifecycle state.
pub const SLOT_BOOT_COUNT: RetainedSlot = RetainedSlot(0);
pub const SLOT_ACTIVE_DURATION_MS: RetainedSlot = RetainedSlot(1);
pub const SLOT_LAST_SLEEP_S: RetainedSlot = RetainedSlot(2);
pub const SLOT_PANIC_SLEEP_S: RetainedSlot = RetainedSlot(3);
pub const SLOT_LAST_TIME_SYNC_S: RetainedSlot = RetainedSlot(4);

/// Number of arena cells the lifecycle state claims, starting at slot 0.
pub const RETAINED_SLOT_COUNT: usize = 5;

/// Panic-escalation counter value meaning "last exit was clean".
pub const PANIC_CLEAN: i32 = -1;

/// The device's notion of its own operating history, restored on every boot.
///
/// Created once per boot; counters are mutated only at orderly
/// shutdown/restart/sleep or on panic.
pub struct LifecycleState {
    boot_count: PersistentValue<i32>,
    active_duration_ms: PersistentValue<i64>,
    last_sleep_duration_s: PersistentValue<i32>,
    panic_sleep_duration_s: PersistentValue<i32>,
    last_time_sync_s: PersistentValue<i64>,
    boot_timestamp_ms: u64,
    reset_reason: ResetReason,
    wake_cause: WakeCause,
}

impl LifecycleState {
    /// Restore counters from the backing stores, classify the reset and
    /// count this boot.
    pub fn boot<NV, RT, SYS>(backing: &mut Backing<'_, NV, RT>, system: &SYS) -> Self
    where
        NV: NvStore,
        RT: RetainedStore,
        SYS: SystemControl,
    {
        let mut state = Self {
            boot_count: PersistentValue::new(Persistence::Retained(SLOT_BOOT_COUNT), 0),
            active_duration_ms: PersistentValue::new(
                Persistence::Retained(SLOT_ACTIVE_DURATION_MS),
                0,
            ),
            last_sleep_duration_s: PersistentValue::new(
                Persistence::Retained(SLOT_LAST_SLEEP_S),
                0,
            ),
            panic_sleep_duration_s: PersistentValue::new(
                Persistence::Retained(SLOT_PANIC_SLEEP_S),
                PANIC_CLEAN,
            ),
            last_time_sync_s: PersistentValue::new(
                Persistence::Retained(SLOT_LAST_TIME_SYNC_S),
                0,
            ),
            boot_timestamp_ms: system.uptime_ms(),
            reset_reason: system.reset_reason(),
            wake_cause: system.wake_cause(),
        };

        state.boot_count.load(backing);
        state.active_duration_ms.load(backing);
        state.last_sleep_duration_s.load(backing);
        state.panic_sleep_duration_s.load(backing);
        state.last_time_sync_s.load(backing);

        let count = state.boot_count.get().saturating_add(1);
        state.boot_count.set(backing, count);

        info!(
            "--- bootup #{count}, reset={} wake={} after {} s",
            state.reset_reason.as_str(),
            state.wake_cause.as_str(),
            state.last_sleep_duration_s.get(),
        );
        if state.panic_sleep_duration_s.get() > 0 {
            info!(
                "*** last exit was a panic, escalation at {} s",
                state.panic_sleep_duration_s.get()
            );
        }

        state
    }

    pub fn boot_count(&self) -> i32 {
        self.boot_count.get()
    }

    /// Active time of the previous wake cycle, written at its shutdown.
    pub fn active_duration_ms(&self) -> i64 {
        self.active_duration_ms.get()
    }

    pub fn last_sleep_duration_s(&self) -> i32 {
        self.last_sleep_duration_s.get()
    }

    pub fn panic_sleep_duration_s(&self) -> i32 {
        self.panic_sleep_duration_s.get()
    }

    /// Wall-clock second of the last accepted time sync, 0 when never.
    pub fn last_time_sync_s(&self) -> i64 {
        self.last_time_sync_s.get()
    }

    pub fn boot_timestamp_ms(&self) -> u64 {
        self.boot_timestamp_ms
    }

    pub fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    pub fn wake_cause(&self) -> WakeCause {
        self.wake_cause
    }

    /// Record an orderly exit: active time since boot and the upcoming sleep
    /// duration. A non-panic exit clears the escalation counter; that is how
    /// a deliberate sleep is told apart from a failure loop.
    pub fn record_shutdown<NV, RT>(
        &mut self,
        backing: &mut Backing<'_, NV, RT>,
        now_ms: u64,
        sleep_duration_s: u32,
        panic: bool,
    ) where
        NV: NvStore,
        RT: RetainedStore,
    {
        let active_ms = now_ms.saturating_sub(self.boot_timestamp_ms) as i64;
        self.active_duration_ms.set(backing, active_ms);
        let sleep_s = i32::try_from(sleep_duration_s).unwrap_or_else(|_| {
            warn!("sleep duration {sleep_duration_s} s out of range, clamping");
            i32::MAX
        });
        self.last_sleep_duration_s.set(backing, sleep_s);
        if !panic {
            self.panic_sleep_duration_s.set(backing, PANIC_CLEAN);
        }
    }

    /// Overwrite the escalation counter; used by the panic handler.
    pub fn store_panic_sleep_duration<NV, RT>(
        &mut self,
        backing: &mut Backing<'_, NV, RT>,
        duration_s: i32,
    ) where
        NV: NvStore,
        RT: RetainedStore,
    {
        self.panic_sleep_duration_s.set(backing, duration_s);
    }

    pub fn record_time_sync<NV, RT>(&mut self, backing: &mut Backing<'_, NV, RT>, wall_s: i64)
    where
        NV: NvStore,
        RT: RetainedStore,
    {
        self.last_time_sync_s.set(backing, wall_s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNv, MockSystem};
    use crate::storage::RetainedMemory;

    #[test]
    fn boot_count_is_monotonic_across_sleep_cycles() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<RETAINED_SLOT_COUNT>::new();
        let system = MockSystem::new();

        for expected in 1..=3 {
            let mut b = Backing {
                nv: &mut nv,
                retained: &mut retained,
            };
            let state = LifecycleState::boot(&mut b, &system);
            assert_eq!(state.boot_count(), expected);
        }
    }

    #[test]
    fn shutdown_records_active_time_and_sleep_duration() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<RETAINED_SLOT_COUNT>::new();
        let mut system = MockSystem::new();
        system.advance_ms(100);

        let mut b = Backing {
            nv: &mut nv,
            retained: &mut retained,
        };
        let mut state = LifecycleState::boot(&mut b, &system);
        state.record_shutdown(&mut b, system.uptime_ms() + 2_500, 300, false);

        let mut b = Backing {
            nv: &mut nv,
            retained: &mut retained,
        };
        let state = LifecycleState::boot(&mut b, &system);
        assert_eq!(state.active_duration_ms(), 2_500);
        assert_eq!(state.last_sleep_duration_s(), 300);
    }

    #[test]
    fn clean_shutdown_clears_the_panic_counter_but_panic_does_not() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<RETAINED_SLOT_COUNT>::new();
        let system = MockSystem::new();
        let mut b = Backing {
            nv: &mut nv,
            retained: &mut retained,
        };

        let mut state = LifecycleState::boot(&mut b, &system);
        state.store_panic_sleep_duration(&mut b, 120);

        state.record_shutdown(&mut b, 1_000, 60, true);
        assert_eq!(state.panic_sleep_duration_s(), 120);

        state.record_shutdown(&mut b, 2_000, 60, false);
        assert_eq!(state.panic_sleep_duration_s(), PANIC_CLEAN);
    }
}
