//! HTTP seam and the authenticated API client.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, error, info};

use crate::credentials::{CredentialStore, Redacted};
use crate::storage::NvStore;

/// Status code the client reports for failures below the HTTP layer
/// (DNS, connect, TLS).
pub const STATUS_TRANSPORT_ERROR: i32 = -1;

pub const STATUS_NOT_MODIFIED: i32 = 304;
pub const STATUS_FORBIDDEN: i32 = 403;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
        }
    }
}

/// Ordered, case-sensitive header map.
pub type HeaderMap = BTreeMap<String, String>;

pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Response from [`HttpTransport::send`]. `headers` holds only the keys the
/// caller asked to collect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpResponse {
    pub status: i32,
    pub headers: HeaderMap,
    pub body: String,
}

/// Incremental consumer for a streamed response body.
pub trait BodySink {
    /// Consume one chunk; `Err(())` aborts the transfer.
    fn write(&mut self, chunk: &[u8]) -> Result<(), ()>;
}

/// Result of [`HttpTransport::stream`]. `complete` is false when the
/// connection closed before the announced body length arrived.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamResult {
    pub status: i32,
    pub headers: HeaderMap,
    pub complete: bool,
}

/// Blocking HTTP(S) transport.
///
/// One transport value serves both the API and the firmware channel, so the
/// certificate and key material of the two can never diverge. Connection
/// reuse across sequential requests is the implementation's concern.
pub trait HttpTransport {
    type Error: core::fmt::Display;

    fn send(
        &mut self,
        request: &HttpRequest<'_>,
        collect_headers: &[&str],
    ) -> Result<HttpResponse, Self::Error>;

    /// Dispatch `request` and feed the response body to `sink` chunk by
    /// chunk instead of buffering it.
    fn stream(
        &mut self,
        request: &HttpRequest<'_>,
        collect_headers: &[&str],
        sink: &mut dyn BodySink,
    ) -> Result<StreamResult, Self::Error>;
}

/// Status, body and the collected response headers of one API round trip.
/// Callers decide success policy per endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiResponse {
    pub status: i32,
    pub body: String,
    pub headers: HeaderMap,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == STATUS_NOT_MODIFIED
    }

    fn empty(status: i32) -> Self {
        Self {
            status,
            body: String::new(),
            headers: HeaderMap::new(),
        }
    }
}

/// Outcome of a streamed download, with transport errors already folded
/// into the status code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamOutcome {
    pub status: i32,
    pub headers: HeaderMap,
    pub complete: bool,
}

/// URL templating, header composition and request dispatch against the
/// device API.
pub struct ApiClient {
    base_url: String,
    project: String,
    device: String,
    default_headers: HeaderMap,
}

impl ApiClient {
    pub fn new(base_url: &str, project: &str, device: &str) -> Self {
        let mut base_url = String::from(base_url);
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            project: String::from(project),
            device: String::from(device),
            default_headers: HeaderMap::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn set_device_name(&mut self, device: &str) {
        self.device = String::from(device);
    }

    /// Client-wide headers, e.g. a `Host` header for a reverse proxy. They
    /// override the built-in defaults and are overridden per call.
    pub fn set_default_headers(&mut self, headers: HeaderMap) {
        self.default_headers = headers;
    }

    /// Effective URL for an API path: strips a leading `/`, substitutes
    /// `{project}` and `{device}`, prepends the base URL.
    pub fn url_for_path(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        let mut url = String::from(&self.base_url);
        url.push_str(path);
        url.replace("{project}", &self.project)
            .replace("{device}", &self.device)
    }

    /// Header merge in increasing precedence: built-in defaults, client
    /// defaults, per-call overrides. Later sources win per key; entries with
    /// empty values are dropped after the merge, which is also how a call
    /// suppresses the Authorization default.
    fn merged_headers(&self, creds: &CredentialStore, extra: &HeaderMap) -> HeaderMap {
        let mut merged = HeaderMap::new();
        merged.insert(String::from("Accept"), String::from("application/json"));
        merged.insert(
            String::from("Content-Type"),
            String::from("application/json"),
        );
        merged.insert(String::from("Authorization"), creds.device_token());
        for (k, v) in &self.default_headers {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in extra {
            merged.insert(k.clone(), v.clone());
        }
        merged.retain(|_, v| !v.is_empty());
        merged
    }

    /// One authenticated API round trip.
    ///
    /// Transport errors become [`STATUS_TRANSPORT_ERROR`] with an empty
    /// body. 403 clears the device token to force re-provisioning. 304 is
    /// an empty body, not an error.
    pub fn request<HT, NV>(
        &self,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        method: Method,
        path: &str,
        body: &str,
        extra_headers: &HeaderMap,
        collect_headers: &[&str],
    ) -> ApiResponse
    where
        HT: HttpTransport,
        NV: NvStore,
    {
        let url = self.url_for_path(path);
        let headers = self.merged_headers(creds, extra_headers);
        for (k, v) in &headers {
            // the Authorization value is the device token
            if k.as_str() == "Authorization" {
                debug!("  header {k}: {}", Redacted(v));
            } else {
                debug!("  header {k}: {v}");
            }
        }
        let request = HttpRequest {
            method,
            url: &url,
            headers: &headers,
            body: body.as_bytes(),
        };

        let mut response = match http.send(&request, collect_headers) {
            Ok(response) => ApiResponse {
                status: response.status,
                body: response.body,
                headers: response.headers,
            },
            Err(err) => {
                error!("HTTP {} url={url} transport error: {err}", method.as_str());
                return ApiResponse::empty(STATUS_TRANSPORT_ERROR);
            }
        };

        self.evaluate_status(creds, nv, method, &url, body, response.status);
        if response.status == STATUS_NOT_MODIFIED {
            response.body = String::new();
        }
        response
    }

    /// Streamed GET with the same URL, header and status policy as
    /// [`ApiClient::request`]; the body goes to `sink` instead of memory.
    pub fn stream_get<HT, NV>(
        &self,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        path: &str,
        extra_headers: &HeaderMap,
        collect_headers: &[&str],
        sink: &mut dyn BodySink,
    ) -> StreamOutcome
    where
        HT: HttpTransport,
        NV: NvStore,
    {
        let url = self.url_for_path(path);
        let headers = self.merged_headers(creds, extra_headers);
        let request = HttpRequest {
            method: Method::Get,
            url: &url,
            headers: &headers,
            body: &[],
        };

        let result = match http.stream(&request, collect_headers, sink) {
            Ok(result) => result,
            Err(err) => {
                error!("HTTP GET url={url} transport error: {err}");
                return StreamOutcome {
                    status: STATUS_TRANSPORT_ERROR,
                    headers: HeaderMap::new(),
                    complete: false,
                };
            }
        };

        self.evaluate_status(creds, nv, Method::Get, &url, "", result.status);
        StreamOutcome {
            status: result.status,
            headers: result.headers,
            complete: result.complete,
        }
    }

    pub fn get<HT: HttpTransport, NV: NvStore>(
        &self,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        path: &str,
    ) -> ApiResponse {
        self.request(
            creds,
            http,
            nv,
            Method::Get,
            path,
            "",
            &HeaderMap::new(),
            &[],
        )
    }

    pub fn head<HT: HttpTransport, NV: NvStore>(
        &self,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        path: &str,
        extra_headers: &HeaderMap,
    ) -> i32 {
        self.request(
            creds,
            http,
            nv,
            Method::Head,
            path,
            "",
            extra_headers,
            &[],
        )
        .status
    }

    pub fn post<HT: HttpTransport, NV: NvStore>(
        &self,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        path: &str,
        body: &str,
        extra_headers: &HeaderMap,
    ) -> ApiResponse {
        self.request(
            creds,
            http,
            nv,
            Method::Post,
            path,
            body,
            extra_headers,
            &[],
        )
    }

    fn evaluate_status<NV: NvStore>(
        &self,
        creds: &mut CredentialStore,
        nv: &mut NV,
        method: Method,
        url: &str,
        request_body: &str,
        status: i32,
    ) {
        let method = method.as_str();
        if status == STATUS_FORBIDDEN {
            error!("HTTP {method} url={url} -> {status} FORBIDDEN, clearing device token to force provisioning");
            creds.clear_device_token(nv);
        } else if status == STATUS_NOT_MODIFIED {
            info!("HTTP {method} url={url} -> {status} not modified");
        } else if !(200..400).contains(&status) {
            error!("HTTP {method} url={url} -> {status} requestBody={request_body}");
        } else {
            info!("HTTP {method} url={url} -> {status}");
        }
    }
}

/// Collects a bounded response body in memory; test and telemetry helper.
#[derive(Debug, Default)]
pub struct VecSink {
    pub data: Vec<u8>,
}

impl BodySink for VecSink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), ()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }
}
