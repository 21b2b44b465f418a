//! Review Harvester - hotel review harvesting pipeline
//!
//! Walks listing pages, listing details, comment pages and Q&A pages of
//! rate-limited booking sites through a rotating pool of session credentials
//! and proxy leases, and commits the results idempotently to SQLite.

// Module declarations
pub mod domain;
pub mod application;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export the pieces most callers wire together
pub use application::{
    EnrichmentError, EnrichmentStage, HarvestError, HarvestOrchestrator, PageWalker,
    SiteAdapter, SiteCapabilities,
};
pub use domain::{
    CollectionKey, CollectionReport, CommentFields, Credential, Fields, ListingFields, QaFields,
    RecordKind, ResourceKind,
};
pub use infrastructure::{
    AppConfig, CredentialPool, EgressPool, HttpClient, JsonCredentialStore, RequestExecutor,
    RetryPolicy, SqliteCheckpointStore, SqliteUpsertStore,
};
