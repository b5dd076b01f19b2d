//! Provisioning-token and device-token lifecycle.

use alloc::format;
use alloc::string::String;

use log::info;
use serde::Serialize;

use crate::api::{ApiClient, HeaderMap, HttpTransport, Method};
use crate::storage::{NvStore, Persistence, PersistentValue};

const PROVISIONING_TOKEN_KEY: &str = "provToken";
const DEVICE_TOKEN_KEY: &str = "deviceToken";

/// Display wrapper that keeps secrets out of log lines.
pub struct Redacted<'a>(pub &'a str);

impl core::fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<unset>")
        } else {
            write!(f, "<redacted, {} chars>", self.0.len())
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provisioning {
    /// A device token is already present; nothing was sent.
    AlreadyProvisioned,
    /// A new device token was obtained and stored.
    Provisioned,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("provisioning request failed with status {0}")]
    Status(i32),
    #[error("empty provisioning response")]
    EmptyResponse,
    #[error("malformed provisioning response: {0}")]
    MalformedJson(serde_json::Error),
    #[error("provisioning response missing field {0}")]
    MissingField(&'static str),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionRequest<'a> {
    project: &'a str,
    device: &'a str,
    provisioning_token: &'a str,
}

/// Tokens the device authenticates with, persisted in an explicit
/// non-volatile section so both flush under one transaction.
///
/// The pre-shared provisioning token is exchanged once for a server-issued
/// device token of the shape `<scheme> <opaque-credential>`. Neither token
/// ever appears in logs.
pub struct CredentialStore {
    section: &'static str,
    provisioning_token: PersistentValue<String>,
    device_token: PersistentValue<String>,
}

impl CredentialStore {
    pub fn new(section: &'static str) -> Self {
        Self {
            section,
            provisioning_token: PersistentValue::new(
                Persistence::Explicit {
                    key: PROVISIONING_TOKEN_KEY,
                },
                String::new(),
            ),
            device_token: PersistentValue::new(
                Persistence::Explicit {
                    key: DEVICE_TOKEN_KEY,
                },
                String::new(),
            ),
        }
    }

    /// Restore both tokens from the backing section.
    pub fn load<NV: NvStore>(&mut self, nv: &mut NV) {
        self.provisioning_token.load_explicit(nv, self.section);
        self.device_token.load_explicit(nv, self.section);
        info!(
            "credentials restored: provisioning={} device={}",
            Redacted(&self.provisioning_token.get()),
            Redacted(&self.device_token.get()),
        );
    }

    /// Flush both tokens under one section transaction. Unchanged values
    /// cost no writes.
    pub fn persist<NV: NvStore>(&mut self, nv: &mut NV) {
        self.provisioning_token.flush_explicit(nv, self.section);
        self.device_token.flush_explicit(nv, self.section);
        if let Err(err) = nv.commit(self.section) {
            log::warn!("credential flush failed: {err}");
        }
    }

    pub fn provisioning_token(&self) -> String {
        self.provisioning_token.get()
    }

    pub fn device_token(&self) -> String {
        self.device_token.get()
    }

    pub fn is_provisioned(&self) -> bool {
        !self.device_token.get().is_empty()
    }

    pub fn set_provisioning_token<NV: NvStore>(&mut self, nv: &mut NV, token: &str) {
        if self.provisioning_token.set_local(String::from(token)) {
            self.persist(nv);
        }
    }

    /// Set the provisioning token only when none is stored yet; supports a
    /// compiled-in default that operator configuration may override.
    /// Returns whether the token was set.
    pub fn set_provisioning_token_if_unset<NV: NvStore>(
        &mut self,
        nv: &mut NV,
        token: &str,
    ) -> bool {
        if !self.provisioning_token.get().is_empty() {
            return false;
        }
        self.set_provisioning_token(nv, token);
        true
    }

    pub fn clear_provisioning_token<NV: NvStore>(&mut self, nv: &mut NV) {
        self.set_provisioning_token(nv, "");
    }

    pub fn set_device_token<NV: NvStore>(&mut self, nv: &mut NV, token: &str) {
        if self.device_token.set_local(String::from(token)) {
            self.persist(nv);
        }
    }

    /// Forget the device token so the next cycle re-provisions.
    pub fn clear_device_token<NV: NvStore>(&mut self, nv: &mut NV) {
        self.set_device_token(nv, "");
    }

    /// Exchange the provisioning token for a device token.
    ///
    /// Skipped when a device token is already present. The POST is
    /// unauthenticated (empty Authorization override). Every failure is
    /// recoverable; the caller decides whether to retry, proceed degraded or
    /// panic.
    pub fn run_provisioning<HT, NV>(
        &mut self,
        api: &ApiClient,
        http: &mut HT,
        nv: &mut NV,
        path: &str,
    ) -> Result<Provisioning, ProvisioningError>
    where
        HT: HttpTransport,
        NV: NvStore,
    {
        if self.is_provisioned() {
            info!("provisioning: already provisioned");
            return Ok(Provisioning::AlreadyProvisioned);
        }

        let provisioning_token = self.provisioning_token.get();
        let request = ProvisionRequest {
            project: api.project(),
            device: api.device(),
            provisioning_token: &provisioning_token,
        };
        let body = serde_json::to_string(&request).map_err(ProvisioningError::MalformedJson)?;

        let mut headers = HeaderMap::new();
        headers.insert(String::from("Authorization"), String::new());
        let response = api.request(self, http, nv, Method::Post, path, &body, &headers, &[]);

        if !(200..400).contains(&response.status) {
            return Err(ProvisioningError::Status(response.status));
        }
        if response.body.is_empty() {
            return Err(ProvisioningError::EmptyResponse);
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&response.body).map_err(ProvisioningError::MalformedJson)?;
        let token_type = parsed
            .get("tokenType")
            .and_then(|v| v.as_str())
            .ok_or(ProvisioningError::MissingField("tokenType"))?;
        let access_token = parsed
            .get("accessToken")
            .and_then(|v| v.as_str())
            .ok_or(ProvisioningError::MissingField("accessToken"))?;

        let device_token = format!("{token_type} {access_token}");
        self.set_device_token(nv, &device_token);
        info!("provisioning: new device token stored for api access");
        Ok(Provisioning::Provisioned)
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::mock::{MockNv, ScriptedHttp, ScriptedResponse};
    use crate::storage::StoreValue;

    fn api() -> ApiClient {
        ApiClient::new("https://api.example.com/", "p", "d")
    }

    #[test]
    fn if_unset_does_not_replace_an_existing_token() {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        creds.set_provisioning_token(&mut nv, "operator");

        assert!(!creds.set_provisioning_token_if_unset(&mut nv, "default"));
        assert_eq!(creds.provisioning_token(), "operator");

        creds.clear_provisioning_token(&mut nv);
        assert!(creds.set_provisioning_token_if_unset(&mut nv, "default"));
        assert_eq!(creds.provisioning_token(), "default");
    }

    #[test]
    fn tokens_survive_a_reload_from_the_store() {
        let mut nv = MockNv::new();
        {
            let mut creds = CredentialStore::new("iot");
            creds.set_device_token(&mut nv, "Bearer abc");
        }
        let mut creds = CredentialStore::new("iot");
        creds.load(&mut nv);
        assert_eq!(creds.device_token(), "Bearer abc");
    }

    #[test]
    fn provisioning_is_skipped_when_a_device_token_exists() {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        creds.set_device_token(&mut nv, "Bearer abc");
        let mut http = ScriptedHttp::new();

        let outcome = creds.run_provisioning(&api(), &mut http, &mut nv, "provision");
        assert!(matches!(outcome, Ok(Provisioning::AlreadyProvisioned)));
        assert!(http.requests.is_empty());
    }

    #[test]
    fn provisioning_composes_and_stores_the_device_token() {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        creds.set_provisioning_token(&mut nv, "1234");
        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::ok(
            r#"{"tokenType":"Bearer","accessToken":"abc"}"#,
        ));

        let outcome = creds.run_provisioning(&api(), &mut http, &mut nv, "provision");
        assert!(matches!(outcome, Ok(Provisioning::Provisioned)));
        assert_eq!(creds.device_token(), "Bearer abc");

        // Durable, so the next cycle skips provisioning.
        assert_eq!(
            nv.committed("iot", "deviceToken"),
            Some(&StoreValue::Str("Bearer abc".to_string()))
        );

        let sent = &http.requests[0];
        assert_eq!(
            sent.body,
            r#"{"project":"p","device":"d","provisioningToken":"1234"}"#
        );
        assert!(!sent.headers.contains_key("Authorization"));
    }

    #[test]
    fn provisioning_failures_are_reported_not_fatal() {
        let cases = [
            (ScriptedResponse::status(401), "status"),
            (ScriptedResponse::ok(""), "empty"),
            (ScriptedResponse::ok("not json"), "malformed"),
            (ScriptedResponse::ok(r#"{"tokenType":"Bearer"}"#), "missing"),
        ];
        for (response, label) in cases {
            let mut nv = MockNv::new();
            let mut creds = CredentialStore::new("iot");
            creds.set_provisioning_token(&mut nv, "1234");
            let mut http = ScriptedHttp::new();
            http.push(response);

            let outcome = creds.run_provisioning(&api(), &mut http, &mut nv, "provision");
            assert!(outcome.is_err(), "case {label} should fail");
            assert!(!creds.is_provisioned(), "case {label} must not store a token");
        }
    }

    #[test]
    fn redacted_display_never_shows_the_secret() {
        let shown = alloc::format!("{}", Redacted("hunter2"));
        assert!(!shown.contains("hunter2"));
        assert_eq!(alloc::format!("{}", Redacted("")), "<unset>");
    }
}
