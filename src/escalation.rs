//! Escalating sleep/restart backoff for unrecoverable failures.

use log::error;

use crate::lifecycle::{LifecycleState, SystemControl};
use crate::storage::{Backing, NvStore, RetainedStore};

/// Backoff parameters for the default panic handler.
///
/// The monotonically escalating backoff with a hard ceiling bounds
/// worst-case retry storms against an unreachable server while still
/// retrying eventually.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EscalationPolicy {
    /// Sleep after the first panic following a clean exit.
    pub initial_s: u32,
    /// Multiplier applied to the previous panic sleep.
    pub factor: u32,
    /// Ceiling for the panic sleep duration.
    pub max_s: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            initial_s: 60,
            factor: 2,
            max_s: 24 * 60 * 60,
        }
    }
}

impl EscalationPolicy {
    /// Next sleep duration given the persisted counter (≤ 0 means clean).
    pub fn next_duration_s(&self, current_s: i32) -> u32 {
        if current_s <= 0 {
            self.initial_s
        } else {
            (current_s as u32).saturating_mul(self.factor).min(self.max_s)
        }
    }
}

/// Strategy invoked when calling code declares this wake cycle
/// unrecoverable. Callers may substitute their own; [`EscalatingSleep`] is
/// the default.
pub trait PanicHandler<NV, RT, SYS>
where
    NV: NvStore,
    RT: RetainedStore,
    SYS: SystemControl,
{
    fn on_panic(
        &mut self,
        lifecycle: &mut LifecycleState,
        backing: &mut Backing<'_, NV, RT>,
        system: &mut SYS,
    );
}

/// Default panic handler: persist the escalated duration, then deep-sleep
/// for it, marked panic-induced so the counter survives the exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct EscalatingSleep {
    pub policy: EscalationPolicy,
}

impl EscalatingSleep {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self { policy }
    }
}

impl<NV, RT, SYS> PanicHandler<NV, RT, SYS> for EscalatingSleep
where
    NV: NvStore,
    RT: RetainedStore,
    SYS: SystemControl,
{
    fn on_panic(
        &mut self,
        lifecycle: &mut LifecycleState,
        backing: &mut Backing<'_, NV, RT>,
        system: &mut SYS,
    ) {
        let duration_s = self
            .policy
            .next_duration_s(lifecycle.panic_sleep_duration_s());
        lifecycle.store_panic_sleep_duration(backing, duration_s as i32);
        error!("panic: sleeping {duration_s} s before retry");
        lifecycle.record_shutdown(backing, system.uptime_ms(), duration_s, true);
        system.deep_sleep(duration_s);
    }
}
