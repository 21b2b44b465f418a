//! Test utilities
//!
//! In-memory database and credential fixtures shared by the unit tests.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::domain::Credential;
use crate::infrastructure::{CredentialStore, CredentialStoreError, DatabaseConnection};

/// Fresh migrated in-memory database per test
pub struct TestDatabase {
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        let db = DatabaseConnection::new("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(Self { connection: db })
    }

    pub fn shared_pool(&self) -> Arc<sqlx::SqlitePool> {
        self.connection.shared_pool()
    }
}

/// Writes `accounts.json` into `dir` and returns its path
pub fn write_accounts_file(dir: &Path, document: Value) -> PathBuf {
    let path = dir.join("accounts.json");
    std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
    path
}

/// Valid credential whose session header renders as `sid=<phone>`
pub fn credential(phone: &str, platform: &str) -> Credential {
    Credential::new(
        phone,
        platform,
        BTreeMap::from([("sid".to_string(), phone.to_string())]),
    )
}

/// Credential store kept in memory, merging per key like the file store
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<Vec<Credential>>,
}

impl MemoryCredentialStore {
    pub fn with(credentials: Vec<Credential>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(credentials),
        })
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_platform(&self, platform: &str) -> Result<Vec<Credential>, CredentialStoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.platform == platform)
            .cloned()
            .collect())
    }

    async fn persist(&self, credentials: &[Credential]) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.lock().unwrap();
        for credential in credentials {
            match entries.iter_mut().find(|e| e.key() == credential.key()) {
                Some(existing) => *existing = credential.clone(),
                None => entries.push(credential.clone()),
            }
        }
        Ok(())
    }
}
