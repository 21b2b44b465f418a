//! Session credentials (site accounts) as stored in the shared accounts file

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Identity of a credential across all sites: `(phone, platform)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub phone: String,
    pub platform: String,
}

/// One account entry of the credential store.
///
/// Unknown keys of the on-disk entry are kept in `extra` so a save never
/// drops data written by other tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub phone: String,
    pub platform: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default = "default_valid")]
    pub is_valid: bool,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub last_used: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_valid() -> bool {
    true
}

impl Credential {
    pub fn new(
        phone: impl Into<String>,
        platform: impl Into<String>,
        cookies: BTreeMap<String, String>,
    ) -> Self {
        Self {
            phone: phone.into(),
            platform: platform.into(),
            cookies,
            is_valid: true,
            fail_count: 0,
            last_used: None,
            extra: Map::new(),
        }
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey {
            phone: self.phone.clone(),
            platform: self.platform.clone(),
        }
    }

    /// `k1=v1; k2=v2` in key order, ready for a `Cookie` header
    pub fn session_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Some(Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
    }

    pub(crate) fn mark_failed(&mut self) {
        self.is_valid = false;
        self.fail_count = self.fail_count.saturating_add(1);
    }

    /// True when the JSON entry belongs to this credential's key
    pub(crate) fn matches_entry(&self, entry: &Value) -> bool {
        entry.get("phone").and_then(Value::as_str) == Some(self.phone.as_str())
            && entry.get("platform").and_then(Value::as_str) == Some(self.platform.as_str())
    }
}
