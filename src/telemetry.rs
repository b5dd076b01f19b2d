//! Telemetry posting, system health snapshots and log forwarding.

use alloc::format;
use alloc::string::String;

use heapless::Deque;
use log::{debug, warn};

use crate::api::{ApiClient, HeaderMap, HttpTransport};
use crate::credentials::CredentialStore;
use crate::lifecycle::{LifecycleState, SystemControl};
use crate::storage::NvStore;

/// Telemetry endpoint; `{kind}` names the measurement series.
pub const TELEMETRY_PATH: &str = "telemetry/{project}/{device}/{kind}";

/// Device log endpoint, plain text.
pub const LOG_PATH: &str = "log/{project}/{device}";

/// Post one JSON telemetry document to the `kind` series. Best effort;
/// returns whether the server accepted it.
pub fn post_telemetry<HT, NV>(
    api: &ApiClient,
    creds: &mut CredentialStore,
    http: &mut HT,
    nv: &mut NV,
    kind: &str,
    body: &str,
) -> bool
where
    HT: HttpTransport,
    NV: NvStore,
{
    let path = TELEMETRY_PATH.replace("{kind}", kind);
    let response = api.post(creds, http, nv, &path, body, &HeaderMap::new());
    if !response.is_success() {
        warn!("telemetry {kind}: rejected with status {}", response.status);
    }
    response.is_success()
}

/// JSON snapshot of the device's operating state for the `system` series.
pub fn system_telemetry_json<SYS: SystemControl>(
    lifecycle: &LifecycleState,
    system: &SYS,
    extras: &[(&str, serde_json::Value)],
) -> String {
    let mut doc = serde_json::Map::new();
    doc.insert("bootCount".into(), lifecycle.boot_count().into());
    doc.insert(
        "activeDurationMs".into(),
        lifecycle.active_duration_ms().into(),
    );
    doc.insert(
        "lastSleepDurationS".into(),
        lifecycle.last_sleep_duration_s().into(),
    );
    doc.insert("uptimeMs".into(), system.uptime_ms().into());
    doc.insert(
        "resetReason".into(),
        lifecycle.reset_reason().as_str().into(),
    );
    doc.insert("wakeCause".into(), lifecycle.wake_cause().as_str().into());
    doc.insert("time".into(), iso8601_utc(system.wall_clock_s()).into());
    for (key, value) in extras {
        doc.insert(String::from(*key), value.clone());
    }
    serde_json::to_string(&doc).unwrap_or_default()
}

/// Render a Unix timestamp as ISO 8601 UTC, proleptic Gregorian.
pub fn iso8601_utc(epoch_s: i64) -> String {
    let days = epoch_s.div_euclid(86_400);
    let secs = epoch_s.rem_euclid(86_400);
    let (hour, minute, second) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

/// One buffered log line awaiting forwarding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEvent {
    pub level: log::Level,
    pub uptime_ms: u64,
    pub tag: &'static str,
    pub message: String,
}

/// Bounded buffer of log events, drained to the server as plain text.
///
/// Recording never blocks and never allocates beyond the fixed capacity;
/// when full, the oldest event is dropped. Draining is rate limited so a
/// chatty cycle cannot flood the API.
pub struct LogForwarder<const CAP: usize> {
    events: Deque<LogEvent, CAP>,
    dropped: u32,
    min_interval_ms: u64,
    last_drain_ms: u64,
}

impl<const CAP: usize> LogForwarder<CAP> {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            events: Deque::new(),
            dropped: 0,
            min_interval_ms,
            last_drain_ms: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn record(&mut self, level: log::Level, uptime_ms: u64, tag: &'static str, message: String) {
        if self.events.is_full() {
            self.events.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        // Cannot fail after the pop above.
        let _ = self.events.push_back(LogEvent {
            level,
            uptime_ms,
            tag,
            message,
        });
    }

    /// Post buffered events as one plain-text document. Events stay queued
    /// on failure and are retried at the next drain.
    ///
    /// Returns whether the buffer was flushed.
    pub fn drain<HT, NV>(
        &mut self,
        api: &ApiClient,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        now_ms: u64,
    ) -> bool
    where
        HT: HttpTransport,
        NV: NvStore,
    {
        if self.events.is_empty() {
            return true;
        }
        if self.last_drain_ms != 0 && now_ms.saturating_sub(self.last_drain_ms) < self.min_interval_ms
        {
            debug!("log forwarder: rate limited, {} events held", self.events.len());
            return false;
        }
        self.last_drain_ms = now_ms;

        let mut body = String::new();
        if self.dropped > 0 {
            body.push_str(&format!("({} events dropped)\n", self.dropped));
        }
        for event in self.events.iter() {
            body.push_str(&format!(
                "{:>7} {:>5} {}: {}\n",
                event.uptime_ms, event.level, event.tag, event.message
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(String::from("Content-Type"), String::from("text/plain"));
        let response = api.post(creds, http, nv, LOG_PATH, &body, &headers);
        if response.is_success() {
            self.events.clear();
            self.dropped = 0;
            true
        } else {
            debug!(
                "log forwarder: upload failed with status {}, holding {} events",
                response.status,
                self.events.len()
            );
            false
        }
    }
}
