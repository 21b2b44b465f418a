//! Session credential pool for one site
//!
//! Issues one random valid credential at a time. Every mutation (last-used
//! stamp, invalidation, revalidation) is persisted through the shared
//! credential store while the pool lock is held, so acquire/release pairs
//! are atomic with respect to other callers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{Credential, CredentialKey};
use crate::infrastructure::credential_store::{CredentialStore, CredentialStoreError};

/// Site-specific liveness check of a session, used to bring invalidated
/// credentials back into rotation
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &Credential) -> bool;
}

pub struct CredentialPool {
    platform: String,
    credentials: Mutex<BTreeMap<CredentialKey, Credential>>,
    store: Arc<dyn CredentialStore>,
}

impl CredentialPool {
    pub async fn load(
        platform: impl Into<String>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, CredentialStoreError> {
        let platform = platform.into();
        let loaded = store.load_platform(&platform).await?;
        let credentials: BTreeMap<_, _> = loaded.into_iter().map(|c| (c.key(), c)).collect();

        let valid = credentials.values().filter(|c| c.is_valid).count();
        info!(platform = %platform, total = credentials.len(), valid, "🔑 Loaded credential pool");

        Ok(Self {
            platform,
            credentials: Mutex::new(credentials),
            store,
        })
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// A uniformly random valid credential, stamped with `last_used`;
    /// `None` when every credential has been invalidated
    pub async fn acquire(&self) -> Option<Credential> {
        let mut credentials = self.credentials.lock().await;
        let valid: Vec<CredentialKey> = credentials
            .values()
            .filter(|c| c.is_valid)
            .map(Credential::key)
            .collect();
        if valid.is_empty() {
            warn!(platform = %self.platform, "No valid credential left");
            return None;
        }

        let key = &valid[fastrand::usize(..valid.len())];
        let selected = credentials.get_mut(key)?;
        selected.touch();
        let selected = selected.clone();

        if let Err(e) = self.store.persist(std::slice::from_ref(&selected)).await {
            warn!(platform = %self.platform, phone = %selected.phone, "Failed to persist last_used: {}", e);
        }
        Some(selected)
    }

    /// Takes the credential out of rotation for good (until revalidated)
    pub async fn release_as_failed(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        let mut credentials = self.credentials.lock().await;
        let Some(entry) = credentials.get_mut(&credential.key()) else {
            warn!(platform = %self.platform, phone = %credential.phone, "Release of unknown credential ignored");
            return Ok(());
        };
        entry.mark_failed();
        let updated = entry.clone();

        warn!(
            platform = %self.platform,
            phone = %updated.phone,
            fail_count = updated.fail_count,
            "Credential marked invalid"
        );
        self.store.persist(std::slice::from_ref(&updated)).await
    }

    /// `k=v; k2=v2` with stable key ordering
    pub fn render_session_header(credential: &Credential) -> String {
        credential.session_header()
    }

    pub async fn available(&self) -> usize {
        self.credentials.lock().await.values().filter(|c| c.is_valid).count()
    }

    pub async fn snapshot(&self) -> Vec<Credential> {
        self.credentials.lock().await.values().cloned().collect()
    }

    /// Re-checks invalid credentials and puts the ones that pass back into
    /// rotation. `fail_count` is kept. Returns how many were restored.
    pub async fn revalidate(&self, verifier: &dyn CredentialVerifier) -> Result<usize, CredentialStoreError> {
        let candidates: Vec<Credential> = self
            .credentials
            .lock()
            .await
            .values()
            .filter(|c| !c.is_valid)
            .cloned()
            .collect();

        let mut passed = Vec::new();
        for candidate in candidates {
            if verifier.verify(&candidate).await {
                passed.push(candidate.key());
            }
        }

        let mut credentials = self.credentials.lock().await;
        let mut restored = Vec::new();
        for key in passed {
            if let Some(entry) = credentials.get_mut(&key).filter(|c| !c.is_valid) {
                entry.is_valid = true;
                restored.push(entry.clone());
            }
        }
        if !restored.is_empty() {
            self.store.persist(&restored).await?;
            info!(platform = %self.platform, restored = restored.len(), "Credentials revalidated");
        }
        Ok(restored.len())
    }
}
