//! Remote configuration: typed registry plus conditional fetch-and-apply.

use alloc::collections::BTreeMap;
use alloc::string::String;

use log::{debug, error, info, warn};

use crate::api::{ApiClient, HttpTransport};
use crate::cache::{ResourceCache, ResourceVersion};
use crate::credentials::CredentialStore;
use crate::storage::{NvStore, StoreValue, ValueKind};

const CONFIG_RESOURCE: &str = "config";

struct ConfigEntry {
    /// Key inside the non-volatile section; kept short for stores with
    /// tight key-length limits.
    nv_key: &'static str,
    value: StoreValue,
}

/// Known configuration keys with their defaults and current values.
///
/// Keys are registered once at boot; a fetched document can only change
/// values for registered keys, never introduce new ones. That keeps a
/// malformed or hostile document from growing the non-volatile section.
pub struct ConfigRegistry {
    section: &'static str,
    entries: BTreeMap<&'static str, ConfigEntry>,
}

impl ConfigRegistry {
    pub fn new(section: &'static str) -> Self {
        Self {
            section,
            entries: BTreeMap::new(),
        }
    }

    fn register(&mut self, name: &'static str, nv_key: &'static str, default: StoreValue) {
        self.entries.insert(name, ConfigEntry {
            nv_key,
            value: default,
        });
    }

    pub fn register_i32(&mut self, name: &'static str, nv_key: &'static str, default: i32) {
        self.register(name, nv_key, StoreValue::I32(default));
    }

    pub fn register_i64(&mut self, name: &'static str, nv_key: &'static str, default: i64) {
        self.register(name, nv_key, StoreValue::I64(default));
    }

    pub fn register_bool(&mut self, name: &'static str, nv_key: &'static str, default: bool) {
        self.register(name, nv_key, StoreValue::Bool(default));
    }

    pub fn register_str(&mut self, name: &'static str, nv_key: &'static str, default: &str) {
        self.register(name, nv_key, StoreValue::Str(String::from(default)));
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.entries.get(name)?.value {
            StoreValue::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.entries.get(name)?.value {
            StoreValue::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.entries.get(name)?.value {
            StoreValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        match &self.entries.get(name)?.value {
            StoreValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Restore persisted values over the registered defaults.
    pub fn load<NV: NvStore>(&mut self, nv: &mut NV) {
        for (name, entry) in &mut self.entries {
            match nv.get(self.section, entry.nv_key) {
                Ok(Some(stored)) if stored.kind() == entry.value.kind() => {
                    entry.value = stored;
                }
                Ok(Some(stored)) => warn!(
                    "config {name}: stored kind {} does not match registered {}, using default",
                    stored.kind().as_str(),
                    entry.value.kind().as_str()
                ),
                Ok(None) => {}
                Err(err) => warn!("config {name}: read failed: {err}"),
            }
        }
    }

    /// Log the effective configuration at info.
    pub fn publish(&self) {
        for (name, entry) in &self.entries {
            info!("config {name} = {}", entry.value);
        }
    }

    /// Fetch and apply remote configuration when the server has a newer
    /// document.
    ///
    /// The document is fully parsed and coerced before anything is staged;
    /// a malformed document changes nothing. Changed values and the new
    /// version markers then land in one non-volatile transaction, so a
    /// partially applied document can never masquerade as current.
    ///
    /// Returns whether a new document was applied.
    pub fn update<HT, NV>(
        &mut self,
        cache: &ResourceCache,
        api: &ApiClient,
        creds: &mut CredentialStore,
        http: &mut HT,
        nv: &mut NV,
        path: &str,
    ) -> bool
    where
        HT: HttpTransport,
        NV: NvStore,
    {
        if !cache.check_for_update(api, creds, http, nv, CONFIG_RESOURCE, path) {
            debug!("config: up to date");
            return false;
        }

        let version = cache.version(nv, CONFIG_RESOURCE);
        let response = api.request(
            creds,
            http,
            nv,
            crate::api::Method::Get,
            path,
            "",
            &version.conditional_headers(),
            &["ETag", "Last-Modified"],
        );
        if response.is_not_modified() {
            return false;
        }
        if !response.is_success() {
            error!("config: fetch failed with status {}", response.status);
            return false;
        }

        let parsed: serde_json::Value = match serde_json::from_str(&response.body) {
            Ok(value) => value,
            Err(err) => {
                error!("config: malformed document: {err}");
                return false;
            }
        };
        let Some(object) = parsed.as_object() else {
            error!("config: document is not a JSON object");
            return false;
        };

        // Coerce everything up front; only then touch the store.
        let mut changes: BTreeMap<&'static str, StoreValue> = BTreeMap::new();
        for (key, value) in object {
            let Some((name, entry)) = self.entries.get_key_value(key.as_str()) else {
                debug!("config: ignoring unknown key {key}");
                continue;
            };
            let Some(coerced) = coerce(value, entry.value.kind()) else {
                warn!(
                    "config {key}: expected {}, got incompatible value, skipping",
                    entry.value.kind().as_str()
                );
                continue;
            };
            if coerced != entry.value {
                changes.insert(*name, coerced);
            }
        }

        for (name, value) in &changes {
            let nv_key = self.entries[name].nv_key;
            if let Err(err) = nv.put(self.section, nv_key, value.clone()) {
                error!("config {name}: staging failed: {err}");
                // a later commit on the section must not sweep these in
                nv.rollback(self.section);
                return false;
            }
        }

        // Same section, so markers and values commit together.
        let new_version = ResourceVersion::from_headers(&response.headers);
        if !cache.store(nv, CONFIG_RESOURCE, &new_version) {
            nv.rollback(self.section);
            return false;
        }

        for (name, value) in changes {
            info!("config {name}: updated to {value}");
        }
        // Re-read what actually landed so memory never runs ahead of flash.
        self.load(nv);
        true
    }
}

fn coerce(value: &serde_json::Value, kind: ValueKind) -> Option<StoreValue> {
    match kind {
        ValueKind::I32 => {
            let v = value.as_i64()?;
            i32::try_from(v).ok().map(StoreValue::I32)
        }
        ValueKind::I64 => value.as_i64().map(StoreValue::I64),
        ValueKind::Bool => value.as_bool().map(StoreValue::Bool),
        ValueKind::Str => value.as_str().map(|s| StoreValue::Str(String::from(s))),
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

    fn registry() -> ConfigRegistry {
        let mut registry = ConfigRegistry::new("iot");
        registry.register_i32("sleep_s", "sleepFor", 300);
        registry.register_bool("verbose", "verbose", false);
        registry.register_str("greeting", "greeting", "hello");
        registry
    }

    fn fetch_cycle(body: &str) -> (ConfigRegistry, MockNv, bool) {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        let cache = ResourceCache::new("iot");
        let mut registry = registry();
        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::status(200)); // HEAD gate
        http.push(
            ScriptedResponse::ok(body)
                .with_header("ETag", "\"v1\"")
                .with_header("Last-Modified", "Tue, 01 Jul 2025 00:00:00 GMT"),
        );

        let applied = registry.update(&cache, &api(), &mut creds, &mut http, &mut nv, "cfg");
        (registry, nv, applied)
    }

    #[test]
    fn new_document_updates_values_and_version_markers_together() {
        let (registry, nv, applied) =
            fetch_cycle(r#"{"sleep_s":600,"verbose":true,"greeting":"hi"}"#);
        assert!(applied);
        assert_eq!(registry.get_i32("sleep_s"), Some(600));
        assert_eq!(registry.get_bool("verbose"), Some(true));
        assert_eq!(registry.get_str("greeting"), Some("hi".to_string()));

        assert_eq!(
            nv.committed("iot", "sleepFor"),
            Some(&StoreValue::I32(600))
        );
        assert_eq!(
            nv.committed("iot", "configEtag"),
            Some(&StoreValue::Str("\"v1\"".to_string()))
        );
        // Values and markers must not land in separate transactions.
        assert_eq!(nv.commit_count, 1);
    }

    #[test]
    fn unchanged_values_cost_no_writes_but_markers_advance() {
        let (registry, nv, applied) = fetch_cycle(r#"{"sleep_s":300}"#);
        assert!(applied);
        assert_eq!(registry.get_i32("sleep_s"), Some(300));
        assert_eq!(nv.write_count("iot", "sleepFor"), 0);
        assert_eq!(
            nv.committed("iot", "configEtag"),
            Some(&StoreValue::Str("\"v1\"".to_string()))
        );
    }

    #[test]
    fn unknown_and_mismatched_keys_are_skipped() {
        let (registry, nv, applied) =
            fetch_cycle(r#"{"bogus":1,"sleep_s":"not a number","verbose":true}"#);
        assert!(applied);
        assert_eq!(registry.get_i32("sleep_s"), Some(300));
        assert_eq!(registry.get_bool("verbose"), Some(true));
        assert_eq!(nv.committed("iot", "bogus"), None);
        assert_eq!(nv.write_count("iot", "sleepFor"), 0);
    }

    #[test]
    fn malformed_document_changes_nothing() {
        let (registry, nv, applied) = fetch_cycle("{not json");
        assert!(!applied);
        assert_eq!(registry.get_i32("sleep_s"), Some(300));
        assert_eq!(nv.commit_count, 0);
        assert_eq!(nv.committed("iot", "configEtag"), None);
    }

    #[test]
    fn staging_failure_discards_the_whole_transaction() {
        let mut nv = MockNv::new();
        nv.fail_put = Some(("iot", "sleepFor"));
        let mut creds = CredentialStore::new("iot");
        let cache = ResourceCache::new("iot");
        let mut registry = registry();
        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::status(200));
        http.push(
            ScriptedResponse::ok(r#"{"greeting":"hi","sleep_s":600}"#)
                .with_header("ETag", "\"v1\""),
        );

        let applied = registry.update(&cache, &api(), &mut creds, &mut http, &mut nv, "cfg");
        assert!(!applied);
        assert_eq!(registry.get_i32("sleep_s"), Some(300));
        assert_eq!(registry.get_str("greeting"), Some("hello".to_string()));

        // A later unrelated commit on the section must not sweep in the
        // aborted document.
        nv.commit("iot").unwrap();
        assert_eq!(nv.committed("iot", "greeting"), None);
        assert_eq!(nv.committed("iot", "configEtag"), None);
    }

    #[test]
    fn failed_marker_commit_leaves_memory_matching_flash() {
        let mut nv = MockNv::new();
        nv.fail_commits = true;
        let mut creds = CredentialStore::new("iot");
        let cache = ResourceCache::new("iot");
        let mut registry = registry();
        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::status(200));
        http.push(ScriptedResponse::ok(r#"{"sleep_s":600}"#).with_header("ETag", "\"v1\""));

        let applied = registry.update(&cache, &api(), &mut creds, &mut http, &mut nv, "cfg");
        assert!(!applied);
        assert_eq!(registry.get_i32("sleep_s"), Some(300));

        nv.fail_commits = false;
        nv.commit("iot").unwrap();
        assert_eq!(nv.committed("iot", "sleepFor"), None);
        assert_eq!(nv.committed("iot", "configEtag"), None);
    }

    #[test]
    fn head_gate_304_skips_the_fetch_entirely() {
        let mut nv = MockNv::new();
        let mut creds = CredentialStore::new("iot");
        let cache = ResourceCache::new("iot");
        let mut registry = registry();
        let mut http = ScriptedHttp::new();
        http.push(ScriptedResponse::status(304));

        let applied = registry.update(&cache, &api(), &mut creds, &mut http, &mut nv, "cfg");
        assert!(!applied);
        assert_eq!(http.requests.len(), 1);
    }

    #[test]
    fn persisted_values_are_restored_over_defaults() {
        let mut nv = MockNv::new();
        let _ = nv.put("iot", "sleepFor", StoreValue::I32(900));
        let _ = nv.commit("iot");

        let mut registry = registry();
        registry.load(&mut nv);
        assert_eq!(registry.get_i32("sleep_s"), Some(900));
        assert_eq!(registry.get_bool("verbose"), Some(false));
    }
}
