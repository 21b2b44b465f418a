//! Per-site request shapes and payload parsers
//!
//! An adapter never performs I/O. It describes which request fetches a
//! resource page and how to read the answer; the orchestrator executes the
//! requests through the shared `RequestExecutor`.

use serde_json::Value;

use crate::domain::{CollectionKey, CommentFields, Fields, ListingFields, QaFields, ResourceKind};
use crate::infrastructure::RequestSpec;

/// Optional endpoints a site exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SiteCapabilities {
    pub detail: bool,
    pub qa: bool,
}

impl SiteCapabilities {
    pub const fn full() -> Self {
        Self { detail: true, qa: true }
    }
}

pub trait SiteAdapter: Send + Sync {
    /// Site tag stored with every row and checkpoint
    fn site(&self) -> &str;

    fn capabilities(&self) -> SiteCapabilities;

    /// Items per page the site serves for `kind`
    fn page_size(&self, kind: ResourceKind) -> u32;

    fn list_page_request(&self, collection: &CollectionKey, page: u32) -> RequestSpec;

    /// `None` when the site has no detail endpoint
    fn detail_request(&self, listing_id: &str) -> Option<RequestSpec>;

    fn comments_page_request(&self, listing_id: &str, page: u32) -> RequestSpec;

    /// `None` when the site has no Q&A endpoint
    fn qa_page_request(&self, listing_id: &str, page: u32) -> Option<RequestSpec>;

    /// A well-formed answer lacking this marker is a semantically empty response
    fn has_success_marker(&self, kind: ResourceKind, payload: &Value) -> bool;

    /// Total item count announced by a first page
    fn extract_total_count(&self, kind: ResourceKind, payload: &Value) -> u64;

    fn list_items(&self, payload: &Value) -> Vec<Value>;

    /// `None` rejects the entry
    fn parse_listing(&self, raw: &Value) -> Option<ListingFields>;

    fn parse_detail(&self, payload: &Value) -> Fields;

    fn comment_items(&self, payload: &Value) -> Vec<Value>;

    /// Rating aggregates carried by the first comment page
    fn comment_summary(&self, first_page: &Value) -> Fields;

    fn parse_comment(&self, raw: &Value) -> Option<CommentFields>;

    fn qa_items(&self, payload: &Value) -> Vec<Value>;

    /// One question may expand to several rows, one per answer
    fn parse_qa(&self, raw: &Value) -> Vec<QaFields>;
}
