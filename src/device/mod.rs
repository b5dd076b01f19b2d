//! Root context owning the platform seams and every subsystem.

use alloc::boxed::Box;
use alloc::string::String;

use log::{error, info, warn};

use crate::api::ApiClient;
use crate::cache::ResourceCache;
use crate::config::ConfigRegistry;
use crate::credentials::{CredentialStore, Provisioning, ProvisioningError};
use crate::escalation::{EscalatingSleep, EscalationPolicy, PanicHandler};
use crate::lifecycle::{LifecycleState, SystemControl};
use crate::ota::{self, FirmwareSlot, OtaError, OtaOutcome};
use crate::storage::{Backing, NvStore, RetainedStore};
use crate::telemetry::{self, LogForwarder};


/// Buffered log events per wake cycle.
const LOG_BUFFER: usize = 32;

/// Poll step for [`Device::wait_until`].
const WAIT_POLL_MS: u32 = 10;

/// Wall clocks below this are leftovers from before the first time sync.
/// Roughly forty years past the epoch.
const TIME_PLAUSIBLE_EPOCH_S: i64 = 1_261_440_000;

/// Compile-time defaults; remote configuration overrides most of them at
/// runtime.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub base_url: String,
    pub project: String,
    pub device: String,
    pub nv_section: &'static str,
    pub provisioning_path: &'static str,
    pub config_path: &'static str,
    pub firmware_path: &'static str,
    pub sleep_duration_s: i32,
    pub battery_min_mv: i32,
    pub escalation: EscalationPolicy,
    pub log_min_interval_ms: u64,
}

impl DeviceConfig {
    pub fn new(base_url: &str, project: &str, device: &str) -> Self {
        Self {
            base_url: String::from(base_url),
            project: String::from(project),
            device: String::from(device),
            nv_section: "iot",
            provisioning_path: "provision",
            config_path: "file/{project}/{device}/config.json",
            firmware_path: "file/{project}/{device}/firmware.bin",
            sleep_duration_s: 300,
            battery_min_mv: 0,
            escalation: EscalationPolicy::default(),
            log_min_interval_ms: 0,
        }
    }
}

/// The device: owns the four platform seams and drives one wake cycle from
/// boot through sync to sleep.
///
/// Exactly one instance exists per boot. Every subsystem borrows the seams
/// through it, so no RefCell or global is needed anywhere.
pub struct Device<NV, RT, HT, SYS>
where
    NV: NvStore,
    RT: RetainedStore,
    SYS: SystemControl,
{
    pub(crate) nv: NV,
    pub(crate) retained: RT,
    pub(crate) http: HT,
    pub(crate) system: SYS,
    config: DeviceConfig,
    api: ApiClient,
    creds: CredentialStore,
    cache: ResourceCache,
    registry: ConfigRegistry,
    lifecycle: LifecycleState,
    logs: LogForwarder<LOG_BUFFER>,
    panic_handler: Option<Box<dyn PanicHandler<NV, RT, SYS>>>,
}

impl<NV, RT, HT, SYS> Device<NV, RT, HT, SYS>
where
    NV: NvStore,
    RT: RetainedStore,
    HT: crate::api::HttpTransport,
    SYS: SystemControl,
{
    /// Bring the device up: restore lifecycle counters and credentials,
    /// register the built-in configuration keys and arm the default panic
    /// handler.
    ///
    /// The escalation policy is read here, once; a configuration change to
    /// it takes effect on the next boot.
    pub fn boot(config: DeviceConfig, mut nv: NV, mut retained: RT, http: HT, system: SYS) -> Self {
        let mut backing = Backing {
            nv: &mut nv,
            retained: &mut retained,
        };
        let lifecycle = LifecycleState::boot(&mut backing, &system);

        let mut creds = CredentialStore::new(config.nv_section);
        creds.load(&mut nv);

        let mut registry = ConfigRegistry::new(config.nv_section);
        registry.register_i32("sleep_s", "sleepFor", config.sleep_duration_s);
        registry.register_i32(
            "panic_sleep_init_s",
            "panicSlpInit",
            config.escalation.initial_s as i32,
        );
        registry.register_i32(
            "panic_sleep_factor",
            "panicSlpFac",
            config.escalation.factor as i32,
        );
        registry.register_i32(
            "panic_sleep_max_s",
            "panicSlpMax",
            config.escalation.max_s as i32,
        );
        registry.register_i32("battery_min_mV", "batMinMv", config.battery_min_mv);
        registry.load(&mut nv);

        let policy = EscalationPolicy {
            initial_s: registry.get_i32("panic_sleep_init_s").unwrap_or(60).max(1) as u32,
            factor: registry.get_i32("panic_sleep_factor").unwrap_or(2).max(1) as u32,
            max_s: registry.get_i32("panic_sleep_max_s").unwrap_or(86_400).max(1) as u32,
        };
        let api = ApiClient::new(&config.base_url, &config.project, &config.device);
        Self {
            api,
            creds,
            cache: ResourceCache::new(config.nv_section),
            registry,
            lifecycle,
            logs: LogForwarder::new(config.log_min_interval_ms),
            panic_handler: Some(Box::new(EscalatingSleep::new(policy))),
            config,
            nv,
            retained,
            http,
            system,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleState {
        &self.lifecycle
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn credentials(&mut self) -> &mut CredentialStore {
        &mut self.creds
    }

    pub fn config_registry(&mut self) -> &mut ConfigRegistry {
        &mut self.registry
    }

    /// Effective sleep duration, remote configuration included.
    pub fn sleep_duration_s(&self) -> u32 {
        self.registry
            .get_i32("sleep_s")
            .unwrap_or(self.config.sleep_duration_s)
            .max(1) as u32
    }

    /// Swap the panic strategy; returns the previous one.
    pub fn set_panic_handler(
        &mut self,
        handler: Box<dyn PanicHandler<NV, RT, SYS>>,
    ) -> Option<Box<dyn PanicHandler<NV, RT, SYS>>> {
        self.panic_handler.replace(handler)
    }

    /// Exchange the provisioning token for a device token if needed.
    pub fn provision(&mut self) -> Result<Provisioning, ProvisioningError> {
        self.creds.run_provisioning(
            &self.api,
            &mut self.http,
            &mut self.nv,
            self.config.provisioning_path,
        )
    }

    /// Fetch and apply remote configuration; returns whether a new document
    /// was applied.
    pub fn sync_config(&mut self) -> bool {
        self.registry.update(
            &self.cache,
            &self.api,
            &mut self.creds,
            &mut self.http,
            &mut self.nv,
            self.config.config_path,
        )
    }

    /// Download a pending firmware image into `slot`. The caller restarts
    /// on [`OtaOutcome::Updated`].
    pub fn sync_firmware<S: FirmwareSlot>(&mut self, slot: &mut S) -> Result<OtaOutcome, OtaError> {
        ota::update_firmware(
            &self.cache,
            &self.api,
            &mut self.creds,
            &mut self.http,
            &mut self.nv,
            slot,
            self.config.firmware_path,
        )
    }

    /// Post one JSON document to a telemetry series.
    pub fn post_telemetry(&mut self, kind: &str, body: &str) -> bool {
        telemetry::post_telemetry(
            &self.api,
            &mut self.creds,
            &mut self.http,
            &mut self.nv,
            kind,
            body,
        )
    }

    /// Post the standard operating snapshot to the `system` series.
    pub fn post_system_telemetry(&mut self, extras: &[(&str, serde_json::Value)]) -> bool {
        let body = telemetry::system_telemetry_json(&self.lifecycle, &self.system, extras);
        self.post_telemetry("system", &body)
    }

    /// Buffer a log event for the next [`Device::drain_logs`].
    pub fn record_log(&mut self, level: log::Level, tag: &'static str, message: String) {
        self.logs.record(level, self.system.uptime_ms(), tag, message);
    }

    /// Forward buffered log events, rate limited and best effort.
    pub fn drain_logs(&mut self) -> bool {
        self.logs.drain(
            &self.api,
            &mut self.creds,
            &mut self.http,
            &mut self.nv,
            self.system.uptime_ms(),
        )
    }

    /// Whether the wall clock has ever been synchronized.
    pub fn is_time_plausible(&self) -> bool {
        self.system.wall_clock_s() > TIME_PLAUSIBLE_EPOCH_S
    }

    /// Remember a successful time sync for diagnostics.
    pub fn record_time_sync(&mut self) {
        if !self.is_time_plausible() {
            warn!("time sync recorded with implausible wall clock");
            return;
        }
        let wall_s = self.system.wall_clock_s();
        let mut backing = Backing {
            nv: &mut self.nv,
            retained: &mut self.retained,
        };
        self.lifecycle.record_time_sync(&mut backing, wall_s);
    }

    /// Poll `pred` until it holds or `timeout_ms` passes; used for network
    /// bring-up and time sync. Returns whether the condition was met.
    pub fn wait_until<F>(&mut self, pred: F, timeout_ms: u32, label: &str) -> bool
    where
        F: Fn(&SYS) -> bool,
    {
        let start_ms = self.system.uptime_ms();
        loop {
            if pred(&self.system) {
                return true;
            }
            if self.system.uptime_ms().saturating_sub(start_ms) >= u64::from(timeout_ms) {
                warn!("timed out after {timeout_ms} ms waiting for {label}");
                return false;
            }
            self.system.delay_ms(WAIT_POLL_MS);
        }
    }

    /// Shut down when the supply voltage is below the configured floor.
    /// Returns whether the cycle may continue.
    pub fn enforce_battery_floor(&mut self, battery_mv: i32) -> bool {
        let floor = self.registry.get_i32("battery_min_mV").unwrap_or(0);
        if floor <= 0 || battery_mv >= floor {
            return true;
        }
        error!("battery at {battery_mv} mV, floor is {floor} mV");
        self.shutdown();
        false
    }

    /// Orderly end of the wake cycle: enter deep sleep for the configured
    /// duration.
    pub fn deep_sleep(&mut self) {
        let duration_s = self.sleep_duration_s();
        info!("cycle done, sleeping {duration_s} s");
        self.finish_cycle(duration_s);
        self.system.deep_sleep(duration_s);
    }

    /// Orderly restart, e.g. to activate a freshly written firmware image.
    pub fn restart(&mut self) {
        info!("restarting");
        self.finish_cycle(0);
        self.system.restart();
    }

    /// Orderly power-off with the same bookkeeping as sleep and restart.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        self.finish_cycle(0);
        self.system.shutdown();
    }

    /// Declare this wake cycle unrecoverable and hand control to the panic
    /// strategy. With the default handler this escalates a persisted sleep
    /// duration and enters deep sleep.
    pub fn panic(&mut self, reason: &str) {
        error!("unrecoverable: {reason}");
        // give an attached console time to show the line
        self.system.delay_ms(50);
        if let Some(mut handler) = self.panic_handler.take() {
            let mut backing = Backing {
                nv: &mut self.nv,
                retained: &mut self.retained,
            };
            handler.on_panic(&mut self.lifecycle, &mut backing, &mut self.system);
            self.panic_handler = Some(handler);
        }
    }

    /// Tear down into the platform seams, for hosted restarts and tests.
    pub fn into_parts(self) -> (NV, RT, HT, SYS) {
        (self.nv, self.retained, self.http, self.system)
    }

    fn finish_cycle(&mut self, sleep_duration_s: u32) {
        let now_ms = self.system.uptime_ms();
        let mut backing = Backing {
            nv: &mut self.nv,
            retained: &mut self.retained,
        };
        self.lifecycle
            .record_shutdown(&mut backing, now_ms, sleep_duration_s, false);
        self.creds.persist(&mut self.nv);
    }
}

/// Escalating panic before the root context exists, e.g. when a platform
/// seam fails to construct.
pub fn panic_early<NV, RT, SYS>(
    nv: &mut NV,
    retained: &mut RT,
    system: &mut SYS,
    policy: EscalationPolicy,
    reason: &str,
) where
    NV: NvStore,
    RT: RetainedStore,
    SYS: SystemControl,
{
    error!("unrecoverable before bring-up: {reason}");
    let mut backing = Backing { nv, retained };
    let mut lifecycle = LifecycleState::boot(&mut backing, system);
    EscalatingSleep::new(policy).on_panic(&mut lifecycle, &mut backing, system);
}
