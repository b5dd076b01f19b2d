//! Scripted test doubles for the platform seams.
//!
//! These run on the host with no hardware behind them; integration tests
//! script responses up front and assert on what the device core did.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::api::{BodySink, HeaderMap, HttpRequest, HttpResponse, HttpTransport, Method, StreamResult};
use crate::lifecycle::{ResetReason, SystemControl, WakeCause};
use crate::ota::FirmwareSlot;
use crate::storage::{NvStore, StoreValue};

#[derive(Debug)]
pub struct MockNvError;

impl core::fmt::Display for MockNvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("simulated store failure")
    }
}

/// In-memory key-value store with the staged-put/commit transaction shape
/// of a real non-volatile backend.
#[derive(Debug, Default)]
pub struct MockNv {
    staged: BTreeMap<(String, String), StoreValue>,
    durable: BTreeMap<(String, String), StoreValue>,
    write_counts: BTreeMap<(String, String), usize>,
    pub commit_count: usize,
    pub fail_writes: bool,
    pub fail_reads: bool,
    pub fail_commits: bool,
    /// Fail `put` for exactly this (section, key) pair.
    pub fail_put: Option<(&'static str, &'static str)>,
}

impl MockNv {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `put` was called for this key.
    pub fn write_count(&self, section: &str, key: &str) -> usize {
        self.write_counts
            .get(&(String::from(section), String::from(key)))
            .copied()
            .unwrap_or(0)
    }

    /// Committed value only; staged puts are invisible here.
    pub fn committed(&self, section: &str, key: &str) -> Option<&StoreValue> {
        self.durable.get(&(String::from(section), String::from(key)))
    }
}

impl NvStore for MockNv {
    type Error = MockNvError;

    fn get(&mut self, section: &str, key: &str) -> Result<Option<StoreValue>, Self::Error> {
        if self.fail_reads {
            return Err(MockNvError);
        }
        let id = (String::from(section), String::from(key));
        Ok(self.staged.get(&id).or_else(|| self.durable.get(&id)).cloned())
    }

    fn put(&mut self, section: &str, key: &str, value: StoreValue) -> Result<(), Self::Error> {
        if self.fail_writes || self.fail_put.is_some_and(|(s, k)| s == section && k == key) {
            return Err(MockNvError);
        }
        let id = (String::from(section), String::from(key));
        *self.write_counts.entry(id.clone()).or_insert(0) += 1;
        self.staged.insert(id, value);
        Ok(())
    }

    fn commit(&mut self, section: &str) -> Result<(), Self::Error> {
        if self.fail_writes || self.fail_commits {
            return Err(MockNvError);
        }
        self.commit_count += 1;
        let staged = core::mem::take(&mut self.staged);
        for (id, value) in staged {
            if id.0 == section {
                self.durable.insert(id, value);
            } else {
                self.staged.insert(id, value);
            }
        }
        Ok(())
    }

    fn rollback(&mut self, section: &str) {
        self.staged.retain(|id, _| id.0 != section);
    }
}

enum Script {
    Response {
        status: i32,
        headers: HeaderMap,
        body: String,
        complete: bool,
    },
    TransportError,
}

/// One canned HTTP answer.
pub struct ScriptedResponse(Script);

impl ScriptedResponse {
    pub fn ok(body: &str) -> Self {
        Self::status(200).with_body(body)
    }

    pub fn status(status: i32) -> Self {
        Self(Script::Response {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
            complete: true,
        })
    }

    pub fn transport_error() -> Self {
        Self(Script::TransportError)
    }

    pub fn with_body(mut self, body: &str) -> Self {
        if let Script::Response { body: b, .. } = &mut self.0 {
            *b = String::from(body);
        }
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        if let Script::Response { headers, .. } = &mut self.0 {
            headers.insert(String::from(key), String::from(value));
        }
        self
    }

    /// Simulate a connection that closed before the full body arrived.
    pub fn incomplete(mut self) -> Self {
        if let Script::Response { complete, .. } = &mut self.0 {
            *complete = false;
        }
        self
    }
}

/// What the transport saw for one request.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Debug)]
pub struct MockHttpError(&'static str);

impl core::fmt::Display for MockHttpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0)
    }
}

/// Transport double that replays scripted responses in order and records
/// every request it is handed.
#[derive(Default)]
pub struct ScriptedHttp {
    script: VecDeque<ScriptedResponse>,
    pub requests: Vec<RecordedRequest>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, response: ScriptedResponse) {
        self.script.push_back(response);
    }

    fn record(&mut self, request: &HttpRequest<'_>) {
        self.requests.push(RecordedRequest {
            method: request.method,
            url: String::from(request.url),
            headers: request.headers.clone(),
            body: String::from_utf8_lossy(request.body).into_owned(),
        });
    }

    fn next(&mut self) -> Result<ScriptedResponse, MockHttpError> {
        self.script
            .pop_front()
            .ok_or(MockHttpError("no scripted response left"))
    }
}

fn filter_headers(headers: &HeaderMap, collect: &[&str]) -> HeaderMap {
    headers
        .iter()
        .filter(|(k, _)| collect.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl HttpTransport for ScriptedHttp {
    type Error = MockHttpError;

    fn send(
        &mut self,
        request: &HttpRequest<'_>,
        collect_headers: &[&str],
    ) -> Result<HttpResponse, Self::Error> {
        self.record(request);
        match self.next()?.0 {
            Script::Response {
                status,
                headers,
                body,
                ..
            } => Ok(HttpResponse {
                status,
                headers: filter_headers(&headers, collect_headers),
                body,
            }),
            Script::TransportError => Err(MockHttpError("simulated transport failure")),
        }
    }

    fn stream(
        &mut self,
        request: &HttpRequest<'_>,
        collect_headers: &[&str],
        sink: &mut dyn BodySink,
    ) -> Result<StreamResult, Self::Error> {
        self.record(request);
        match self.next()?.0 {
            Script::Response {
                status,
                headers,
                body,
                complete,
            } => {
                let bytes = body.as_bytes();
                let mut delivered = complete;
                // Two chunks so sinks see more than one write.
                let mid = bytes.len() / 2;
                for chunk in [&bytes[..mid], &bytes[mid..]] {
                    if !chunk.is_empty() && sink.write(chunk).is_err() {
                        delivered = false;
                        break;
                    }
                }
                Ok(StreamResult {
                    status,
                    headers: filter_headers(&headers, collect_headers),
                    complete: delivered,
                })
            }
            Script::TransportError => Err(MockHttpError("simulated transport failure")),
        }
    }
}

/// Clock and power-control double. Power transitions are recorded and
/// return, so the cycle under test keeps running.
#[derive(Debug)]
pub struct MockSystem {
    uptime_ms: u64,
    pub wall_clock: i64,
    pub reset_reason: ResetReason,
    pub wake_cause: WakeCause,
    pub sleeps: Vec<u32>,
    pub restarts: usize,
    pub shutdowns: usize,
}

impl Default for MockSystem {
    fn default() -> Self {
        Self {
            uptime_ms: 0,
            wall_clock: 0,
            reset_reason: ResetReason::PowerOn,
            wake_cause: WakeCause::Undefined,
            sleeps: Vec::new(),
            restarts: 0,
            shutdowns: 0,
        }
    }
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.uptime_ms += ms;
    }
}

impl SystemControl for MockSystem {
    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    fn wake_cause(&self) -> WakeCause {
        self.wake_cause
    }

    fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    fn wall_clock_s(&self) -> i64 {
        self.wall_clock
    }

    fn delay_ms(&mut self, ms: u32) {
        self.uptime_ms += u64::from(ms);
    }

    fn deep_sleep(&mut self, duration_s: u32) {
        self.sleeps.push(duration_s);
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
    }
}

#[derive(Debug)]
pub struct MockSlotError;

impl core::fmt::Display for MockSlotError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("simulated slot failure")
    }
}

/// Firmware slot double that accumulates the written image in memory.
#[derive(Debug, Default)]
pub struct MockSlot {
    pub begun: Option<Option<u64>>,
    pub data: Vec<u8>,
    pub finalized: bool,
    pub aborted: bool,
    pub fail_begin: bool,
    pub fail_write: bool,
    pub fail_finalize: bool,
}

impl MockSlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirmwareSlot for MockSlot {
    type Error = MockSlotError;

    fn begin(&mut self, size: Option<u64>) -> Result<(), Self::Error> {
        if self.fail_begin {
            return Err(MockSlotError);
        }
        self.begun = Some(size);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), Self::Error> {
        if self.fail_write {
            return Err(MockSlotError);
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Self::Error> {
        if self.fail_finalize {
            return Err(MockSlotError);
        }
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.data.clear();
    }
}
