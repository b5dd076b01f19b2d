//! Conditional-request version tracking per named remote resource.

use alloc::format;
use alloc::string::String;

use log::{error, info, warn};

use crate::api::{ApiClient, HeaderMap, HttpTransport};
use crate::credentials::CredentialStore;
use crate::storage::{NvStore, StoreValue};

/// Server-supplied version markers for one resource. The pair is only ever
/// read and written together.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceVersion {
    pub etag: String,
    pub last_modified: String,
}

impl ResourceVersion {
    pub fn is_empty(&self) -> bool {
        self.etag.is_empty() && self.last_modified.is_empty()
    }

    /// Extract the pair from collected response headers; keys the server
    /// did not send stay empty.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            etag: headers.get("ETag").cloned().unwrap_or_default(),
            last_modified: headers.get("Last-Modified").cloned().unwrap_or_default(),
        }
    }

    /// Conditional headers for a revalidation request. Empty markers are
    /// included here and dropped by the client's header merge.
    pub fn conditional_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(String::from("If-None-Match"), self.etag.clone());
        headers.insert(String::from("If-Modified-Since"), self.last_modified.clone());
        headers
    }
}

/// ETag/Last-Modified cache shared by configuration and firmware sync.
///
/// Markers live under `<resource>Etag` / `<resource>Date` in one
/// non-volatile section.
pub struct ResourceCache {
    section: &'static str,
}

impl ResourceCache {
    pub const fn new(section: &'static str) -> Self {
        Self { section }
    }

    fn etag_key(resource: &str) -> String {
        format!("{resource}Etag")
    }

    fn date_key(resource: &str) -> String {
        format!("{resource}Date")
    }

    /// Stored version pair for `resource`; empty strings when never synced.
    pub fn version<NV: NvStore>(&self, nv: &mut NV, resource: &str) -> ResourceVersion {
        let read = |nv: &mut NV, key: &str| match nv.get(self.section, key) {
            Ok(Some(StoreValue::Str(value))) => value,
            Ok(Some(other)) => {
                warn!(
                    "cache entry {}/{key} has kind {}, ignoring",
                    self.section,
                    other.kind().as_str()
                );
                String::new()
            }
            Ok(None) => String::new(),
            Err(err) => {
                warn!("cache read {}/{key} failed: {err}", self.section);
                String::new()
            }
        };
        ResourceVersion {
            etag: read(nv, &Self::etag_key(resource)),
            last_modified: read(nv, &Self::date_key(resource)),
        }
    }

    /// Persist a new version pair under a single transaction, from a single
    /// successful response. Never called for 304s.
    ///
    /// Returns whether the commit went through; the commit also covers any
    /// writes the caller staged into the same section beforehand.
    pub fn store<NV: NvStore>(&self, nv: &mut NV, resource: &str, version: &ResourceVersion) -> bool {
        let staged = nv
            .put(
                self.section,
                &Self::etag_key(resource),
                StoreValue::Str(version.etag.clone()),
            )
            .and_then(|()| {
                nv.put(
                    self.section,
                    &Self::date_key(resource),
                    StoreValue::Str(version.last_modified.clone()),
                )
            })
            .and_then(|()| nv.commit(self.section));
        match staged {
            Ok(()) => {
                info!(
                    "cache {resource}: etag={} date={}",
                    version.etag, version.last_modified
                );
                true
            }
            Err(err) => {
                warn!("cache write for {resource} failed: {err}");
                nv.rollback(self.section);
                false
            }
        }
    }

    /// Ask the server whether `resource` changed relative to the stored
    /// markers.
    ///
    /// True only for a 2xx answer: the server has something newer, or the
    /// cache was empty and first contact always reports an update. 304 and
    /// every error count as "no update" so nothing is flashed or
    /// reconfigured on an ambiguous signal.
    pub fn check_for_update<HT, NV>(
        &self,
        api: &ApiClient,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        resource: &str,
        path: &str,
    ) -> bool
    where
        HT: HttpTransport,
        NV: NvStore,
    {
        let version = self.version(nv, resource);
        let status = api.head(creds, http, nv, path, &version.conditional_headers());

        if (200..300).contains(&status) {
            return true;
        }
        if status != crate::api::STATUS_NOT_MODIFIED {
            error!("update check for {resource} failed with status {status}");
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::mock::{MockNv, ScriptedHttp, ScriptedResponse};

    fn api() -> ApiClient {
        ApiClient::new("https://api.example.com/", "p", "d")
    }

    #[test]
    fn first_contact_reports_update_for_any_2xx() {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        let cache = ResourceCache::new("iot");
        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::status(204));

        assert!(cache.check_for_update(
            &api(),
            &mut creds,
            &mut http,
            &mut nv,
            "config",
            "file/{project}/{device}/config.json",
        ));
        // Empty markers are dropped, so first contact is unconditional.
        let sent = &http.requests[0].headers;
        assert!(!sent.contains_key("If-None-Match"));
        assert!(!sent.contains_key("If-Modified-Since"));
    }

    #[test]
    fn stored_markers_ride_along_and_304_means_no_update() {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        let cache = ResourceCache::new("iot");
        cache.store(
            &mut nv,
            "config",
            &ResourceVersion {
                etag: "\"v1\"".to_string(),
                last_modified: "Tue, 01 Jul 2025 00:00:00 GMT".to_string(),
            },
        );

        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::status(304));
        assert!(!cache.check_for_update(
            &api(),
            &mut creds,
            &mut http,
            &mut nv,
            "config",
            "cfg",
        ));

        let sent = &http.requests[0].headers;
        assert_eq!(sent.get("If-None-Match").unwrap(), "\"v1\"");
        assert_eq!(
            sent.get("If-Modified-Since").unwrap(),
            "Tue, 01 Jul 2025 00:00:00 GMT"
        );
    }

    #[test]
    fn server_errors_are_conservative_no_update() {
        for status in [403, 404, 500] {
            let mut nv = MockNv::new();
            let mut creds = CredentialStore::new("iot");
            let cache = ResourceCache::new("iot");
            let mut http = ScriptedHttp::new();
            http.push(ScriptedResponse::status(status));

            assert!(!cache.check_for_update(
                &api(),
                &mut creds,
                &mut http,
                &mut nv,
                "firmware",
                "fw",
            ));
        }
    }

    #[test]
    fn version_pair_is_updated_together_and_round_trips() {
        let mut nv = MockNv::new();
        let cache = ResourceCache::new("iot");
        let version = ResourceVersion {
            etag: "\"v2\"".to_string(),
            last_modified: "Wed, 02 Jul 2025 00:00:00 GMT".to_string(),
        };
        assert!(cache.store(&mut nv, "firmware", &version));

        assert_eq!(cache.version(&mut nv, "firmware"), version);
        // The pair landed in one commit.
        assert_eq!(nv.commit_count, 1);
    }
}
