//! Derived summary text for a listing

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{CommentFields, ListingFields};

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment backend failed: {0}")]
    Backend(String),

    #[error("enrichment timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Summarises a listing from its accepted comments.
///
/// Failures are never fatal: the orchestrator stores an empty text instead.
#[async_trait]
pub trait EnrichmentStage: Send + Sync {
    async fn summarize(&self, listing: &ListingFields, comments: &[CommentFields]) -> Result<String, EnrichmentError>;
}

/// Stage used when no enrichment backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

#[async_trait]
impl EnrichmentStage for NoEnrichment {
    async fn summarize(&self, _listing: &ListingFields, _comments: &[CommentFields]) -> Result<String, EnrichmentError> {
        Ok(String::new())
    }
}
