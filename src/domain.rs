//! Domain module - harvested records, credentials, pagination and checkpoints
//!
//! Everything in here is free of network access; persistence is described
//! through the traits in [`repositories`].

pub mod checkpoint;
pub mod credential;
pub mod entities;
pub mod pagination;
pub mod report;
pub mod repositories;

pub use checkpoint::{HarvestCheckpoint, ResumePolicy};
pub use credential::{Credential, CredentialKey};
pub use entities::{
    CollectionKey, CommentFields, Fields, ListingFields, QaFields, RecordKind, StoredRecord,
};
pub use pagination::{PageRequest, PaginationCalculator, ResourceKind};
pub use report::CollectionReport;
pub use repositories::{CheckpointStore, StoreError, UpsertStore, Written};
