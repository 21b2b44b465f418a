//! Shared multi-site credential file
//!
//! Layout: `{"accounts": [{phone, platform, cookies, is_valid, fail_count, last_used, ...}]}`.
//! Every save is a read/merge/write under an exclusive OS lock on the
//! `<file>.lock` sibling; entries are merged per `(phone, platform)` so
//! concurrent pools never overwrite each other, and the new file replaces
//! the old one through a rename. The lock file itself is never removed: the
//! lock dies with its holder, so there are no abandoned locks to take over.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::fs::TryLockError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::Credential;
use crate::infrastructure::config::CredentialStoreConfig;

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("credential store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential store is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),

    #[error("credential store has no `accounts` array")]
    MissingAccounts,

    #[error("timed out waiting for credential store lock {0}")]
    LockTimeout(PathBuf),
}

impl CredentialStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// All entries of one platform; entries of other platforms are ignored
    async fn load_platform(&self, platform: &str) -> Result<Vec<Credential>, CredentialStoreError>;

    /// Merge the given entries by `(phone, platform)`; everything else in the
    /// store is kept verbatim
    async fn persist(&self, credentials: &[Credential]) -> Result<(), CredentialStoreError>;
}

pub struct JsonCredentialStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
    in_process: Mutex<()>,
}

/// Holds the exclusive lock; closing the handle on drop releases it
struct FileLockGuard {
    _file: std::fs::File,
}

impl JsonCredentialStore {
    pub fn new(config: &CredentialStoreConfig) -> Self {
        let path = config.path.clone();
        let lock_path = Self::sibling(&path, "lock");
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            lock_retry: Duration::from_millis(config.lock_retry_ms.max(1)),
            in_process: Mutex::new(()),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self::new(&CredentialStoreConfig {
            path: path.into(),
            ..CredentialStoreConfig::default()
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!(".{suffix}"));
        path.with_file_name(name)
    }

    async fn read_document(&self) -> Result<Value, CredentialStoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let document: Value = serde_json::from_str(&content)?;
                if document.get("accounts").is_some_and(Value::is_array) {
                    Ok(document)
                } else {
                    Err(CredentialStoreError::MissingAccounts)
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(json!({ "accounts": [] })),
            Err(e) => Err(CredentialStoreError::io(&self.path, e)),
        }
    }

    async fn acquire_lock(&self) -> Result<FileLockGuard, CredentialStoreError> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CredentialStoreError::io(parent, e))?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .await
            .map_err(|e| CredentialStoreError::io(&self.lock_path, e))?
            .into_std()
            .await;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(FileLockGuard { _file: file }),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(CredentialStoreError::LockTimeout(self.lock_path.clone()));
                    }
                    tokio::time::sleep(self.lock_retry).await;
                }
                Err(TryLockError::Error(e)) => return Err(CredentialStoreError::io(&self.lock_path, e)),
            }
        }
    }

    async fn write_atomically(&self, document: &Value) -> Result<(), CredentialStoreError> {
        let content = serde_json::to_string_pretty(document)?;
        let temp_path = Self::sibling(&self.path, &format!("{}.tmp", uuid::Uuid::new_v4()));

        fs::write(&temp_path, content)
            .await
            .map_err(|e| CredentialStoreError::io(&temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CredentialStoreError::io(&self.path, e));
        }
        Ok(())
    }
}

/// Replaces the entry with the same key, or appends a new one
fn merge_entry(accounts: &mut Vec<Value>, credential: &Credential) -> Result<(), serde_json::Error> {
    let mut entry = serde_json::to_value(credential)?;
    match accounts.iter_mut().find(|existing| credential.matches_entry(existing)) {
        Some(existing) => {
            // Keep keys another writer added to this entry since we loaded it
            if let (Some(current), Some(updated)) = (existing.as_object(), entry.as_object_mut()) {
                for (key, value) in current {
                    if !updated.contains_key(key) {
                        updated.insert(key.clone(), value.clone());
                    }
                }
            }
            *existing = entry;
        }
        None => accounts.push(entry),
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn load_platform(&self, platform: &str) -> Result<Vec<Credential>, CredentialStoreError> {
        let document = self.read_document().await?;
        let accounts = document
            .get("accounts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut credentials = Vec::new();
        for entry in accounts {
            if entry.get("platform").and_then(Value::as_str) != Some(platform) {
                continue;
            }
            match serde_json::from_value::<Credential>(entry.clone()) {
                Ok(credential) => credentials.push(credential),
                Err(e) => warn!(platform, "Skipping malformed credential entry: {}", e),
            }
        }
        Ok(credentials)
    }

    async fn persist(&self, credentials: &[Credential]) -> Result<(), CredentialStoreError> {
        if credentials.is_empty() {
            return Ok(());
        }

        let _process_guard = self.in_process.lock().await;
        let _file_guard = self.acquire_lock().await?;

        let mut document = self.read_document().await?;
        let Some(accounts) = document.get_mut("accounts").and_then(Value::as_array_mut) else {
            return Err(CredentialStoreError::MissingAccounts);
        };
        for credential in credentials {
            merge_entry(accounts, credential)?;
        }

        self.write_atomically(&document).await?;
        debug!(count = credentials.len(), "Persisted credentials to {:?}", self.path);
        Ok(())
    }
}

/// Convenience for tests and tooling: the raw document as a JSON object
pub async fn read_raw_document(path: &Path) -> Result<Map<String, Value>, CredentialStoreError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| CredentialStoreError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}
