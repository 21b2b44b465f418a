//! Application layer: site adapters, pagination and the collection pipeline

pub mod enrichment;
pub mod harvest_orchestrator;
pub mod page_walker;
pub mod site_adapter;

pub use enrichment::{EnrichmentError, EnrichmentStage, NoEnrichment};
pub use harvest_orchestrator::{FetchError, HarvestError, HarvestOrchestrator, ItemStage};
pub use page_walker::{Page, PageWalker};
pub use site_adapter::{SiteAdapter, SiteCapabilities};
