//! Over-the-air firmware updates, streamed into a platform slot.

use alloc::format;
use alloc::string::String;

use log::{error, info, warn};

use crate::api::{ApiClient, BodySink, HttpTransport, Method, STATUS_NOT_MODIFIED};
use crate::cache::{ResourceCache, ResourceVersion};
use crate::credentials::CredentialStore;
use crate::storage::NvStore;

const FIRMWARE_RESOURCE: &str = "firmware";

/// Platform destination for a firmware image: an inactive flash partition,
/// verified and activated at finalize.
pub trait FirmwareSlot {
    type Error: core::fmt::Display;

    /// Open the slot for writing; `size` is the announced image size when
    /// the server sent one.
    fn begin(&mut self, size: Option<u64>) -> Result<(), Self::Error>;

    fn write(&mut self, chunk: &[u8]) -> Result<(), Self::Error>;

    /// Validate the written image and mark it for the next boot.
    fn finalize(&mut self) -> Result<(), Self::Error>;

    /// Discard a partial image. Must be safe to call at any point after
    /// `begin`.
    fn abort(&mut self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OtaOutcome {
    /// A new image was written and activated; restart to run it.
    Updated,
    /// The server has nothing newer than what is running.
    NotModified,
}

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error("firmware check failed with status {0}")]
    CheckFailed(i32),
    #[error("firmware slot rejected the update: {0}")]
    BeginFailed(String),
    #[error("firmware download failed with status {0}")]
    DownloadFailed(i32),
    #[error("firmware download ended before the image was complete")]
    Incomplete,
    #[error("firmware image failed validation: {0}")]
    ValidationFailed(String),
}

/// Adapts a [`FirmwareSlot`] to the streaming body interface. A write
/// failure aborts the transfer instead of buffering on.
struct SlotSink<'a, S: FirmwareSlot> {
    slot: &'a mut S,
    written: u64,
}

impl<S: FirmwareSlot> BodySink for SlotSink<'_, S> {
    fn write(&mut self, chunk: &[u8]) -> Result<(), ()> {
        match self.slot.write(chunk) {
            Ok(()) => {
                self.written += chunk.len() as u64;
                Ok(())
            }
            Err(err) => {
                error!("firmware slot write failed after {} bytes: {err}", self.written);
                Err(())
            }
        }
    }
}

/// Check for, download and activate a firmware update.
///
/// Two conditional HEADs against the stored version markers decide whether
/// to download: the cache gate, then a recheck immediately before streaming
/// that also yields the announced image size. The image is streamed straight
/// into `slot`; the version markers are stored only after the slot validated
/// and accepted the image, so a failed update is retried on the next cycle.
///
/// The caller restarts on [`OtaOutcome::Updated`]; this function never
/// transfers control itself.
pub fn update_firmware<HT, NV, S>(
    cache: &ResourceCache,
    api: &ApiClient,
    creds: &mut CredentialStore,
    http: &mut HT,
    nv: &mut NV,
    slot: &mut S,
    path: &str,
) -> Result<OtaOutcome, OtaError>
where
    HT: HttpTransport,
    NV: NvStore,
    S: FirmwareSlot,
{
    if !cache.check_for_update(api, creds, http, nv, FIRMWARE_RESOURCE, path) {
        info!("firmware: up to date");
        return Ok(OtaOutcome::NotModified);
    }

    let version = cache.version(nv, FIRMWARE_RESOURCE);
    let check = api.request(
        creds,
        http,
        nv,
        Method::Head,
        path,
        "",
        &version.conditional_headers(),
        &["Content-Length"],
    );
    if check.status == STATUS_NOT_MODIFIED {
        // the image changed back between gate and recheck
        info!("firmware: up to date");
        return Ok(OtaOutcome::NotModified);
    }
    if !check.is_success() {
        return Err(OtaError::CheckFailed(check.status));
    }

    let announced_size = check
        .headers
        .get("Content-Length")
        .and_then(|v| v.parse::<u64>().ok());
    info!(
        "firmware: update available, downloading ({} bytes announced)",
        announced_size.unwrap_or(0)
    );

    slot.begin(announced_size)
        .map_err(|err| OtaError::BeginFailed(format!("{err}")))?;

    let mut sink = SlotSink {
        slot: &mut *slot,
        written: 0,
    };
    let outcome = api.stream_get(
        creds,
        http,
        nv,
        path,
        &crate::api::HeaderMap::new(),
        &["ETag", "Last-Modified"],
        &mut sink,
    );
    let written = sink.written;

    if !(200..300).contains(&outcome.status) {
        slot.abort();
        return Err(OtaError::DownloadFailed(outcome.status));
    }
    if !outcome.complete {
        warn!("firmware: transfer ended after {written} bytes, discarding");
        slot.abort();
        return Err(OtaError::Incomplete);
    }
    if let Some(size) = announced_size {
        if written != size {
            warn!("firmware: got {written} of {size} announced bytes, discarding");
            slot.abort();
            return Err(OtaError::Incomplete);
        }
    }

    if let Err(err) = slot.finalize() {
        slot.abort();
        return Err(OtaError::ValidationFailed(format!("{err}")));
    }

    let new_version = ResourceVersion::from_headers(&outcome.headers);
    cache.store(nv, FIRMWARE_RESOURCE, &new_version);
    info!("firmware: {written} bytes written and validated, restart to apply");
    Ok(OtaOutcome::Updated)
}
