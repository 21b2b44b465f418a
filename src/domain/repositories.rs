//! Repository interfaces for harvested records and run checkpoints
//!
//! The orchestrator talks only to these traits; SQLite implementations live
//! in the infrastructure layer.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::checkpoint::HarvestCheckpoint;
use crate::domain::entities::{Fields, RecordKind, StoredRecord};

/// Outcome of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    Created,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{natural_id}' has no persisted parent listing ({parent_id:?})")]
    OrphanRecord {
        kind: RecordKind,
        natural_id: String,
        parent_id: Option<String>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait UpsertStore: Send + Sync {
    /// Create when absent, otherwise overwrite the supplied fields and stamp
    /// `updated_at`. Comment and Q&A rows need an already persisted parent.
    async fn upsert(
        &self,
        kind: RecordKind,
        natural_id: &str,
        fields: &Fields,
        parent_ref: Option<&str>,
    ) -> Result<Written, StoreError>;

    async fn get(&self, kind: RecordKind, natural_id: &str)
    -> Result<Option<StoredRecord>, StoreError>;

    async fn count(&self, kind: RecordKind) -> Result<u64, StoreError>;

    async fn children_of(
        &self,
        kind: RecordKind,
        listing_id: &str,
    ) -> Result<Vec<StoredRecord>, StoreError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, site: &str, collection_key: &str)
    -> Result<Option<HarvestCheckpoint>, StoreError>;

    async fn save(&self, checkpoint: &HarvestCheckpoint) -> Result<(), StoreError>;

    async fn clear(&self, site: &str, collection_key: &str) -> Result<(), StoreError>;
}
