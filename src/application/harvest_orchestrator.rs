//! Collection runs: list pages, then per listing detail, comments, Q&A,
//! enrichment and persistence
//!
//! A collection is walked strictly one page and one listing at a time.
//! Every stage below the first list page degrades to "no data" on
//! failure; only an unavailable first list page aborts the run.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::application::enrichment::EnrichmentStage;
use crate::application::page_walker::PageWalker;
use crate::application::site_adapter::SiteAdapter;
use crate::domain::{
    CheckpointStore, CollectionKey, CollectionReport, CommentFields, Fields, HarvestCheckpoint, ListingFields,
    PaginationCalculator, QaFields, RecordKind, ResourceKind, ResumePolicy, StoreError, UpsertStore,
};
use crate::infrastructure::{
    AppConfig, CredentialPool, DatabaseConnection, EgressPool, ExecutorError, HarvestConfig, HttpClient,
    JsonCredentialStore, RequestExecutor, RequestSpec, RetryPolicy, SqliteCheckpointStore, SqliteUpsertStore,
    Transport, UserAgentRotator,
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("{site} has no {kind} endpoint")]
    Unsupported { site: String, kind: ResourceKind },
}

impl FetchError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Executor(ExecutorError::Cancelled))
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("first list page of {collection} unavailable: {source}")]
    ListUnavailable {
        collection: String,
        #[source]
        source: FetchError,
    },

    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[from] StoreError),
}

/// Per-listing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    ListFetched,
    DetailEnriched,
    CommentsCollected,
    QaCollected,
    Enriched,
    Persisted,
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ListFetched => "list_fetched",
            Self::DetailEnriched => "detail_enriched",
            Self::CommentsCollected => "comments_collected",
            Self::QaCollected => "qa_collected",
            Self::Enriched => "enriched",
            Self::Persisted => "persisted",
        })
    }
}

#[derive(Debug, Default)]
struct ItemOutcome {
    persisted: bool,
    comments_saved: u64,
    comments_total: u64,
    qa_saved: u64,
}

struct CollectedComments {
    accepted: Vec<CommentFields>,
    summary: Fields,
    total: u64,
}

pub struct HarvestOrchestrator {
    adapter: Arc<dyn SiteAdapter>,
    executor: Arc<RequestExecutor>,
    store: Arc<dyn UpsertStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    enrichment: Arc<dyn EnrichmentStage>,
    policy: RetryPolicy,
    config: HarvestConfig,
}

impl HarvestOrchestrator {
    pub fn new(
        adapter: Arc<dyn SiteAdapter>,
        executor: Arc<RequestExecutor>,
        store: Arc<dyn UpsertStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        enrichment: Arc<dyn EnrichmentStage>,
    ) -> Self {
        Self {
            adapter,
            executor,
            store,
            checkpoints,
            enrichment,
            policy: RetryPolicy::default(),
            config: HarvestConfig::default(),
        }
    }

    /// Wires the production stack for one site: HTTP transport, credential
    /// file, proxy supplier, SQLite store and checkpoints.
    pub async fn from_config(
        config: &AppConfig,
        adapter: Arc<dyn SiteAdapter>,
        enrichment: Arc<dyn EnrichmentStage>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let site = adapter.site().to_string();

        let transport: Arc<dyn Transport> = Arc::new(HttpClient::new(config.http.clone())?);
        let user_agents = UserAgentRotator::new(config.http.user_agents.clone());
        let credentials = Arc::new(
            CredentialPool::load(&site, Arc::new(JsonCredentialStore::new(&config.credentials))).await?,
        );
        let egress = Arc::new(EgressPool::from_config(&config.egress, transport.clone(), user_agents.clone()));
        let executor = Arc::new(RequestExecutor::new(
            transport,
            credentials,
            egress,
            user_agents,
            Duration::from_secs(config.http.timeout_seconds),
        ));

        let database = DatabaseConnection::from_config(&config.database).await?;
        database.migrate().await?;
        let store = Arc::new(SqliteUpsertStore::new(database.shared_pool(), site.as_str()));
        let checkpoints = Arc::new(SqliteCheckpointStore::new(database.shared_pool()));

        info!(site = %site, database = %config.database.url, "Harvest pipeline assembled");
        Ok(Self::new(adapter, executor, store, checkpoints, enrichment)
            .with_policy(config.retry.clone())
            .with_config(config.harvest.clone()))
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: HarvestConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn fetch_list_page(
        &self,
        collection: &CollectionKey,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let spec = self.adapter.list_page_request(collection, page);
        self.fetch(ResourceKind::List, &spec, cancel).await
    }

    pub async fn fetch_detail(&self, listing_id: &str, cancel: &CancellationToken) -> Result<Value, FetchError> {
        let spec = self
            .adapter
            .detail_request(listing_id)
            .ok_or_else(|| self.unsupported(ResourceKind::Detail))?;
        self.fetch(ResourceKind::Detail, &spec, cancel).await
    }

    pub async fn fetch_comments_page(
        &self,
        listing_id: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let spec = self.adapter.comments_page_request(listing_id, page);
        self.fetch(ResourceKind::Comments, &spec, cancel).await
    }

    pub async fn fetch_qa_page(&self, listing_id: &str, page: u32, cancel: &CancellationToken) -> Result<Value, FetchError> {
        let spec = self
            .adapter
            .qa_page_request(listing_id, page)
            .ok_or_else(|| self.unsupported(ResourceKind::Qa))?;
        self.fetch(ResourceKind::Qa, &spec, cancel).await
    }

    async fn fetch(&self, kind: ResourceKind, spec: &RequestSpec, cancel: &CancellationToken) -> Result<Value, FetchError> {
        let adapter = self.adapter.as_ref();
        let payload = self
            .executor
            .execute_cancellable(spec, &self.policy, |payload| adapter.has_success_marker(kind, payload), cancel)
            .await?;
        Ok(payload)
    }

    fn unsupported(&self, kind: ResourceKind) -> FetchError {
        FetchError::Unsupported {
            site: self.adapter.site().to_string(),
            kind,
        }
    }

    pub async fn run_collection(&self, collection: &CollectionKey) -> Result<CollectionReport, HarvestError> {
        self.run_collection_with_cancel(collection, &CancellationToken::new())
            .await
    }

    /// Cancellation is honoured between listings and between pages. A
    /// listing interrupted mid-way is discarded and stays unprocessed in
    /// the checkpoint.
    pub async fn run_collection_with_cancel(
        &self,
        collection: &CollectionKey,
        cancel: &CancellationToken,
    ) -> Result<CollectionReport, HarvestError> {
        let span = info_span!(
            "collection",
            site = %self.adapter.site(),
            collection = %collection,
            run_id = %Uuid::new_v4()
        );
        self.walk_collection(collection, cancel).instrument(span).await
    }

    /// Runs collections concurrently, at most `max_concurrent_collections`
    /// at a time, each one sequential internally. Results keep input order.
    pub async fn run_collections(
        &self,
        collections: &[CollectionKey],
        cancel: &CancellationToken,
    ) -> Vec<(CollectionKey, Result<CollectionReport, HarvestError>)> {
        let limit = self.config.max_concurrent_collections.max(1);
        let results: Vec<_> = stream::iter(collections)
            .map(|collection| async move {
                let result = self.run_collection_with_cancel(collection, cancel).await;
                (collection.clone(), result)
            })
            .buffered(limit)
            .collect()
            .await;

        let mut overall = CollectionReport::default();
        let mut aborted = 0usize;
        for (_, result) in &results {
            match result {
                Ok(report) => overall.merge(report),
                Err(_) => aborted += 1,
            }
        }
        info!(
            collections = results.len(),
            aborted,
            processed = overall.processed,
            succeeded = overall.succeeded,
            failed = overall.failed,
            comments_saved = overall.comments_saved,
            "All collections finished"
        );
        results
    }

    async fn walk_collection(
        &self,
        collection: &CollectionKey,
        cancel: &CancellationToken,
    ) -> Result<CollectionReport, HarvestError> {
        let adapter = self.adapter.as_ref();
        let site = adapter.site();

        let mut checkpoint = self
            .checkpoints
            .load(site, &collection.key)
            .await?
            .unwrap_or_else(|| HarvestCheckpoint::new(site, collection.key.clone()));
        let skip_processed = self.config.resume == ResumePolicy::SkipProcessed;
        let resume_after = if skip_processed {
            checkpoint.last_completed_page
        } else {
            0
        };
        if !checkpoint.is_fresh() {
            info!(
                last_completed_page = checkpoint.last_completed_page,
                processed = checkpoint.processed_ids.len(),
                policy = ?self.config.resume,
                "Resuming unfinished collection"
            );
        }

        let mut report = CollectionReport::default();
        let first = match self.fetch_list_page(collection, 1, cancel).await {
            Ok(first) => first,
            Err(e) if e.is_cancelled() => {
                info!("Collection cancelled before the first list page");
                report.cancelled = true;
                return Ok(report);
            }
            Err(source) => {
                error!("First list page unavailable, aborting collection: {}", source);
                return Err(HarvestError::ListUnavailable {
                    collection: collection.key.clone(),
                    source,
                });
            }
        };

        let total_listings = adapter.extract_total_count(ResourceKind::List, &first);
        let walker = PageWalker::new(ResourceKind::List, adapter.page_size(ResourceKind::List))
            .for_item(collection.key.as_str())
            .with_cancellation(cancel.clone())
            .resume_after(resume_after);
        let expected_pages = PaginationCalculator::new(walker.page_size()).total_pages(total_listings);
        info!(total_listings, expected_pages, "Collection started");

        let mut last_page_seen = resume_after.min(expected_pages);
        let mut interrupted = false;
        let mut pages = walker.walk_from_first(
            first,
            move |page| self.fetch_list_page(collection, page, cancel),
            move |payload: &Value| adapter.extract_total_count(ResourceKind::List, payload),
        );

        'pages: while let Some(page) = pages.next().await {
            for raw in adapter.list_items(&page.payload) {
                if cancel.is_cancelled() {
                    interrupted = true;
                    break 'pages;
                }

                let Some(listing) = adapter
                    .parse_listing(&raw)
                    .filter(|listing| !listing.natural_id.trim().is_empty())
                else {
                    warn!(page = page.index(), "Rejected unparseable listing entry");
                    report.processed += 1;
                    report.failed += 1;
                    log_progress(&report, total_listings);
                    continue;
                };

                if skip_processed && checkpoint.is_processed(&listing.natural_id) {
                    debug!(listing = %listing.natural_id, "Already processed, skipping");
                    report.skipped += 1;
                    continue;
                }

                let listing_id = listing.natural_id.clone();
                let Some(outcome) = self.harvest_item(listing, cancel).await else {
                    info!(listing = %listing_id, "Listing discarded on cancellation");
                    interrupted = true;
                    break 'pages;
                };

                report.processed += 1;
                if outcome.persisted {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                }
                report.comments_saved += outcome.comments_saved;
                report.comments_total += outcome.comments_total;
                report.qa_saved += outcome.qa_saved;

                checkpoint.mark_processed(listing_id);
                self.save_checkpoint(&checkpoint).await;
                log_progress(&report, total_listings);
            }

            checkpoint.complete_page(page.index());
            self.save_checkpoint(&checkpoint).await;
            last_page_seen = page.index();
        }
        drop(pages);

        let walked_all = last_page_seen >= expected_pages;
        report.cancelled = interrupted || (!walked_all && cancel.is_cancelled());

        if report.cancelled {
            info!(last_page_seen, expected_pages, "Collection cancelled, checkpoint kept");
        } else if walked_all {
            if let Err(e) = self.checkpoints.clear(site, &collection.key).await {
                warn!("Failed to clear checkpoint: {}", e);
            }
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                comments_saved = report.comments_saved,
                comments_total = report.comments_total,
                qa_saved = report.qa_saved,
                "Collection finished"
            );
        } else {
            warn!(last_page_seen, expected_pages, "List walk stopped early, checkpoint kept");
        }

        Ok(report)
    }

    /// `None` when cancellation interrupted the listing before persistence
    async fn harvest_item(&self, mut listing: ListingFields, cancel: &CancellationToken) -> Option<ItemOutcome> {
        let listing_id = listing.natural_id.clone();
        let capabilities = self.adapter.capabilities();
        trace_stage(&listing_id, ItemStage::ListFetched);

        if capabilities.detail {
            match self.fetch_detail(&listing_id, cancel).await {
                Ok(payload) => listing.merge(self.adapter.parse_detail(&payload)),
                Err(e) if e.is_cancelled() => return None,
                Err(e) => warn!(listing = %listing_id, "Detail unavailable, keeping list fields: {}", e),
            }
        }
        trace_stage(&listing_id, ItemStage::DetailEnriched);

        let comments = self.collect_comments(&listing_id, cancel).await;
        if cancel.is_cancelled() {
            return None;
        }
        listing.merge(comments.summary);
        trace_stage(&listing_id, ItemStage::CommentsCollected);

        let qa = if capabilities.qa {
            let qa = self.collect_qa(&listing_id, cancel).await;
            if cancel.is_cancelled() {
                return None;
            }
            qa
        } else {
            Vec::new()
        };
        trace_stage(&listing_id, ItemStage::QaCollected);

        if !comments.accepted.is_empty() {
            match self.enrichment.summarize(&listing, &comments.accepted).await {
                Ok(text) => listing.enrichment_text = text,
                Err(e) => {
                    warn!(listing = %listing_id, "Enrichment failed, storing empty text: {}", e);
                    listing.enrichment_text.clear();
                }
            }
        }
        trace_stage(&listing_id, ItemStage::Enriched);

        let mut outcome = ItemOutcome {
            comments_total: comments.total,
            ..ItemOutcome::default()
        };

        if let Err(e) = self
            .store
            .upsert(RecordKind::Listing, &listing_id, &listing.to_record(), None)
            .await
        {
            error!(listing = %listing_id, "Failed to persist listing: {}", e);
            return Some(outcome);
        }
        outcome.persisted = true;

        for comment in &comments.accepted {
            if self
                .persist_child(RecordKind::Comment, &comment.natural_id, &comment.to_record(), &listing_id)
                .await
            {
                outcome.comments_saved += 1;
            }
        }
        for row in &qa {
            if self
                .persist_child(RecordKind::Qa, &row.natural_id, &row.to_record(), &listing_id)
                .await
            {
                outcome.qa_saved += 1;
            }
        }
        trace_stage(&listing_id, ItemStage::Persisted);

        debug!(
            listing = %listing_id,
            comments_saved = outcome.comments_saved,
            comments_total = outcome.comments_total,
            qa_saved = outcome.qa_saved,
            "Listing persisted"
        );
        Some(outcome)
    }

    async fn collect_comments(&self, listing_id: &str, cancel: &CancellationToken) -> CollectedComments {
        let adapter = self.adapter.as_ref();
        let min_bytes = self.config.min_comment_bytes;
        let walker = PageWalker::new(ResourceKind::Comments, adapter.page_size(ResourceKind::Comments))
            .for_item(listing_id)
            .with_cancellation(cancel.clone());
        let mut pages = walker.walk(
            move |page| self.fetch_comments_page(listing_id, page, cancel),
            move |payload: &Value| adapter.extract_total_count(ResourceKind::Comments, payload),
        );

        let mut collected = CollectedComments {
            accepted: Vec::new(),
            summary: Fields::new(),
            total: 0,
        };
        let mut retrieved = 0u32;
        let mut expected = 0u32;
        let calculator = PaginationCalculator::new(walker.page_size());
        while let Some(page) = pages.next().await {
            if page.index() == 1 {
                collected.summary = adapter.comment_summary(&page.payload);
            }
            collected.total = page.total_items;
            expected = page.total_pages;
            retrieved += 1;

            let items = adapter.comment_items(&page.payload);
            let announced = calculator.items_on_page(page.total_items, page.index());
            if items.len() as u64 != announced {
                debug!(listing = %listing_id, page = page.index(), served = items.len(), announced, "Comment page size differs from total");
            }
            collected.accepted.extend(
                items
                    .iter()
                    .filter_map(|raw| adapter.parse_comment(raw))
                    .filter(|comment| comment.is_acceptable(min_bytes)),
            );
        }

        if retrieved < expected {
            warn!(listing = %listing_id, retrieved, expected, "Comment pages incomplete");
        }
        collected
    }

    async fn collect_qa(&self, listing_id: &str, cancel: &CancellationToken) -> Vec<QaFields> {
        let adapter = self.adapter.as_ref();
        let walker = PageWalker::new(ResourceKind::Qa, adapter.page_size(ResourceKind::Qa))
            .for_item(listing_id)
            .with_cancellation(cancel.clone());
        let mut pages = walker.walk(
            move |page| self.fetch_qa_page(listing_id, page, cancel),
            move |payload: &Value| adapter.extract_total_count(ResourceKind::Qa, payload),
        );

        let mut rows = Vec::new();
        while let Some(page) = pages.next().await {
            for raw in adapter.qa_items(&page.payload) {
                rows.extend(adapter.parse_qa(&raw).into_iter().filter(QaFields::is_acceptable));
            }
        }
        rows
    }

    async fn persist_child(&self, kind: RecordKind, natural_id: &str, fields: &Fields, listing_id: &str) -> bool {
        match self.store.upsert(kind, natural_id, fields, Some(listing_id)).await {
            Ok(_) => true,
            Err(e @ StoreError::OrphanRecord { .. }) => {
                warn!("Discarding {}", e);
                false
            }
            Err(e) => {
                error!(listing = %listing_id, %kind, natural_id, "Failed to persist row: {}", e);
                false
            }
        }
    }

    async fn save_checkpoint(&self, checkpoint: &HarvestCheckpoint) {
        if let Err(e) = self.checkpoints.save(checkpoint).await {
            warn!("Failed to save checkpoint: {}", e);
        }
    }
}

fn trace_stage(listing_id: &str, stage: ItemStage) {
    debug!(listing = %listing_id, %stage, "Stage reached");
}

#[allow(clippy::cast_precision_loss)]
fn log_progress(report: &CollectionReport, total_listings: u64) {
    let done = u64::from(report.processed + report.skipped);
    let percent = if total_listings == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total_listings as f64
    };
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        comments_saved = report.comments_saved,
        comments_total = report.comments_total,
        "Progress {}/{} ({:.1}%)",
        done,
        total_listings,
        percent
    );
}
