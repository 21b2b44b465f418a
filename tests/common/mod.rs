//! Shared fixtures for the integration tests: an in-memory fake review
//! site served through a fake `Transport`, its `SiteAdapter`, a recording
//! enrichment stage and an in-memory credential store.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use review_harvester::application::{
    EnrichmentError, EnrichmentStage, HarvestOrchestrator, SiteAdapter, SiteCapabilities,
};
use review_harvester::domain::{
    CollectionKey, CommentFields, Credential, Fields, ListingFields, QaFields, ResourceKind,
};
use review_harvester::infrastructure::{
    CredentialPool, CredentialStore, CredentialStoreError, DatabaseConnection, EgressPool, HarvestConfig,
    RequestContext, RequestExecutor, RequestSpec, RetryPolicy, SqliteCheckpointStore, SqliteUpsertStore, Transport,
    TransportError, UserAgentRotator,
};

pub const SITE: &str = "fakesite";
pub const BASE: &str = "https://reviews.fake.test";
pub const LIST_PAGE_SIZE: u32 = 2;
pub const COMMENT_PAGE_SIZE: u32 = 10;
pub const QA_PAGE_SIZE: u32 = 5;

#[derive(Debug, Clone)]
pub struct FakeComment {
    pub id: String,
    pub content: String,
    pub rating: f64,
}

#[derive(Debug, Clone)]
pub struct FakeQuestion {
    pub id: String,
    pub question: String,
    pub answers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FakeListing {
    pub id: String,
    pub name: String,
    pub address: String,
    pub comments: Vec<FakeComment>,
    pub questions: Vec<FakeQuestion>,
}

impl FakeListing {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("Hotel {id}"),
            address: format!("{id} Harbour Road"),
            comments: Vec::new(),
            questions: Vec::new(),
        }
    }

    /// `accepted` long rated comments followed by `rejected` ones that fail
    /// the length or rating filter
    pub fn with_comments(mut self, accepted: usize, rejected: usize) -> Self {
        for i in 0..accepted {
            self.comments.push(FakeComment {
                id: format!("{}-c{i:03}", self.id),
                content: format!("Review {i}: {}", "spacious room, friendly staff, quiet at night. ".repeat(3)),
                rating: 4.5,
            });
        }
        for i in 0..rejected {
            let (content, rating) = if i % 2 == 0 {
                ("too short".to_string(), 5.0)
            } else {
                ("long enough but unrated ".repeat(8), 0.0)
            };
            self.comments.push(FakeComment {
                id: format!("{}-r{i:03}", self.id),
                content,
                rating,
            });
        }
        self
    }

    pub fn with_question(mut self, id: &str, question: &str, answers: &[&str]) -> Self {
        self.questions.push(FakeQuestion {
            id: id.to_string(),
            question: question.to_string(),
            answers: answers.iter().map(ToString::to_string).collect(),
        });
        self
    }
}

/// How a scripted endpoint misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Well-formed answer without the success marker
    Empty,
    /// Connection-level failure
    Transport,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub context: RequestContext,
}

impl RecordedCall {
    pub fn page(&self) -> Option<u32> {
        self.query.get("page").and_then(|p| p.parse().ok())
    }
}

/// Serves a catalogue of listings per collection, paginated like a real site
#[derive(Default)]
pub struct FakeSiteTransport {
    collections: Mutex<BTreeMap<String, Vec<FakeListing>>>,
    faults: Mutex<BTreeMap<(String, Option<String>, u32), Fault>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeSiteTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_collection(&self, city: &str, listings: Vec<FakeListing>) {
        self.collections.lock().unwrap().insert(city.to_string(), listings);
    }

    /// Every attempt at `path` page `page` (optionally for one listing id) fails
    pub fn fail(&self, path: &str, listing_id: Option<&str>, page: u32, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .insert((path.to_string(), listing_id.map(ToString::to_string), page), fault);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    /// Distinct pages requested at `path`, in request order
    pub fn pages_requested(&self, path: &str) -> Vec<u32> {
        let mut seen = BTreeSet::new();
        self.calls_to(path)
            .iter()
            .filter_map(RecordedCall::page)
            .filter(|p| seen.insert(*p))
            .collect()
    }

    fn listing(&self, id: &str) -> Option<FakeListing> {
        self.collections
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|l| l.id == id)
            .cloned()
    }

    fn fault(&self, path: &str, listing_id: Option<&str>, page: u32) -> Option<Fault> {
        let faults = self.faults.lock().unwrap();
        faults
            .get(&(path.to_string(), listing_id.map(ToString::to_string), page))
            .or_else(|| faults.get(&(path.to_string(), None, page)))
            .copied()
    }

    fn slice<T: Clone>(items: &[T], page: u32, page_size: u32) -> Vec<T> {
        let start = (page.saturating_sub(1) * page_size) as usize;
        items.iter().skip(start).take(page_size as usize).cloned().collect()
    }

    fn respond(&self, path: &str, query: &BTreeMap<String, String>) -> Value {
        let page = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let id = query.get("id").map(String::as_str).unwrap_or_default();

        match path {
            "/list" => {
                let city = query.get("city").cloned().unwrap_or_default();
                let listings = self.collections.lock().unwrap().get(&city).cloned().unwrap_or_default();
                let items: Vec<Value> = Self::slice(&listings, page, LIST_PAGE_SIZE)
                    .iter()
                    .map(|l| json!({ "id": l.id, "name": l.name, "city": city }))
                    .collect();
                json!({ "ok": true, "total": listings.len(), "items": items })
            }
            "/detail" => match self.listing(id) {
                Some(l) => json!({ "ok": true, "detail": { "address": l.address, "star": 4 } }),
                None => json!({ "ok": false }),
            },
            "/comments" => {
                let comments = self.listing(id).map(|l| l.comments).unwrap_or_default();
                let items: Vec<Value> = Self::slice(&comments, page, COMMENT_PAGE_SIZE)
                    .iter()
                    .map(|c| json!({ "id": c.id, "content": c.content, "rating": c.rating }))
                    .collect();
                json!({
                    "ok": true,
                    "total": comments.len(),
                    "summary": { "score": 4.6, "good_count": comments.len() },
                    "comments": items,
                })
            }
            "/qa" => {
                let questions = self.listing(id).map(|l| l.questions).unwrap_or_default();
                let items: Vec<Value> = Self::slice(&questions, page, QA_PAGE_SIZE)
                    .iter()
                    .map(|q| json!({ "id": q.id, "question": q.question, "answers": q.answers }))
                    .collect();
                json!({ "ok": true, "total": questions.len(), "questions": items })
            }
            _ => json!({ "ok": false }),
        }
    }
}

#[async_trait]
impl Transport for FakeSiteTransport {
    async fn send(&self, spec: &RequestSpec, ctx: &RequestContext) -> Result<Value, TransportError> {
        let path = spec.url.strip_prefix(BASE).unwrap_or(&spec.url).to_string();
        let query: BTreeMap<String, String> = spec.query.iter().cloned().collect();
        self.calls.lock().unwrap().push(RecordedCall {
            path: path.clone(),
            query: query.clone(),
            context: ctx.clone(),
        });

        let page = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        match self.fault(&path, query.get("id").map(String::as_str), page) {
            Some(Fault::Empty) => Ok(json!({ "ok": false, "message": "login required" })),
            Some(Fault::Transport) => Err(TransportError::Connect("connection reset by peer".into())),
            None => Ok(self.respond(&path, &query)),
        }
    }
}

/// Adapter for the fake site
pub struct FakeSiteAdapter {
    pub capabilities: SiteCapabilities,
}

impl Default for FakeSiteAdapter {
    fn default() -> Self {
        Self {
            capabilities: SiteCapabilities::full(),
        }
    }
}

fn items(payload: &Value, field: &str) -> Vec<Value> {
    payload.get(field).and_then(Value::as_array).cloned().unwrap_or_default()
}

impl SiteAdapter for FakeSiteAdapter {
    fn site(&self) -> &str {
        SITE
    }

    fn capabilities(&self) -> SiteCapabilities {
        self.capabilities
    }

    fn page_size(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::List => LIST_PAGE_SIZE,
            ResourceKind::Comments => COMMENT_PAGE_SIZE,
            ResourceKind::Qa => QA_PAGE_SIZE,
            ResourceKind::Detail => 1,
        }
    }

    fn list_page_request(&self, collection: &CollectionKey, page: u32) -> RequestSpec {
        RequestSpec::get(format!("{BASE}/list"))
            .with_query("city", &collection.key)
            .with_query("page", page)
    }

    fn detail_request(&self, listing_id: &str) -> Option<RequestSpec> {
        self.capabilities
            .detail
            .then(|| RequestSpec::get(format!("{BASE}/detail")).with_query("id", listing_id))
    }

    fn comments_page_request(&self, listing_id: &str, page: u32) -> RequestSpec {
        RequestSpec::post_json(format!("{BASE}/comments"), json!({ "hotelId": listing_id, "pageIndex": page }))
            .with_query("id", listing_id)
            .with_query("page", page)
    }

    fn qa_page_request(&self, listing_id: &str, page: u32) -> Option<RequestSpec> {
        self.capabilities.qa.then(|| {
            RequestSpec::get(format!("{BASE}/qa"))
                .with_query("id", listing_id)
                .with_query("page", page)
        })
    }

    fn has_success_marker(&self, _kind: ResourceKind, payload: &Value) -> bool {
        payload.get("ok").and_then(Value::as_bool).unwrap_or(false)
    }

    fn extract_total_count(&self, _kind: ResourceKind, payload: &Value) -> u64 {
        payload.get("total").and_then(Value::as_u64).unwrap_or_default()
    }

    fn list_items(&self, payload: &Value) -> Vec<Value> {
        items(payload, "items")
    }

    fn parse_listing(&self, raw: &Value) -> Option<ListingFields> {
        let id = raw.get("id")?.as_str()?;
        let name = raw.get("name").and_then(Value::as_str).unwrap_or_default();
        let mut listing = ListingFields::new(id, name);
        if let Some(city) = raw.get("city") {
            listing.fields.insert("city".into(), city.clone());
        }
        Some(listing)
    }

    fn parse_detail(&self, payload: &Value) -> Fields {
        payload.get("detail").and_then(Value::as_object).cloned().unwrap_or_default()
    }

    fn comment_items(&self, payload: &Value) -> Vec<Value> {
        items(payload, "comments")
    }

    fn comment_summary(&self, first_page: &Value) -> Fields {
        first_page.get("summary").and_then(Value::as_object).cloned().unwrap_or_default()
    }

    fn parse_comment(&self, raw: &Value) -> Option<CommentFields> {
        Some(CommentFields::new(
            raw.get("id")?.as_str()?,
            raw.get("content").and_then(Value::as_str).unwrap_or_default(),
            raw.get("rating").and_then(Value::as_f64).unwrap_or_default(),
        ))
    }

    fn qa_items(&self, payload: &Value) -> Vec<Value> {
        items(payload, "questions")
    }

    fn parse_qa(&self, raw: &Value) -> Vec<QaFields> {
        let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
        let question = raw.get("question").and_then(Value::as_str).unwrap_or_default();
        items(raw, "answers")
            .iter()
            .enumerate()
            .map(|(i, answer)| {
                let mut row = QaFields::new(format!("{id}-{i}"), question);
                row.fields.insert("answer".into(), answer.clone());
                row
            })
            .collect()
    }
}

/// Records every call; optionally fails or fires a cancellation token
#[derive(Default)]
pub struct RecordingEnrichment {
    pub calls: Mutex<Vec<(String, usize)>>,
    pub fail: bool,
    pub cancel_on: Option<(String, CancellationToken)>,
}

impl RecordingEnrichment {
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnrichmentStage for RecordingEnrichment {
    async fn summarize(&self, listing: &ListingFields, comments: &[CommentFields]) -> Result<String, EnrichmentError> {
        self.calls
            .lock()
            .unwrap()
            .push((listing.natural_id.clone(), comments.len()));
        if let Some((id, token)) = &self.cancel_on {
            if *id == listing.natural_id {
                token.cancel();
            }
        }
        if self.fail {
            return Err(EnrichmentError::Backend("model overloaded".into()));
        }
        Ok(format!("{} guests praise the rooms", comments.len()))
    }
}

/// Credential store kept in memory
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

pub fn credential(phone: &str) -> Credential {
    Credential::new(phone, SITE, BTreeMap::from([("sid".to_string(), format!("token-{phone}"))]))
}

/// Retries without waiting
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        min_wait_ms: 0,
        max_wait_ms: 0,
        jitter_ms: 0,
        ..RetryPolicy::default()
    }
}

/// Everything an orchestrator run touches, wired over one in-memory database
pub struct Harness {
    pub transport: Arc<FakeSiteTransport>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub pool: Arc<CredentialPool>,
    pub executor: Arc<RequestExecutor>,
    pub store: Arc<SqliteUpsertStore>,
    pub checkpoints: Arc<SqliteCheckpointStore>,
    pub enrichment: Arc<RecordingEnrichment>,
    pub database: DatabaseConnection,
}

impl Harness {
    pub async fn new(transport: Arc<FakeSiteTransport>) -> Self {
        Self::with_parts(transport, EgressPool::disabled(), RecordingEnrichment::default()).await
    }

    pub async fn with_parts(transport: Arc<FakeSiteTransport>, egress: EgressPool, enrichment: RecordingEnrichment) -> Self {
        Self::with_database(transport, egress, enrichment, "sqlite::memory:").await
    }

    /// Harness over a pooled, file-backed database at `database_url`
    pub async fn with_database(
        transport: Arc<FakeSiteTransport>,
        egress: EgressPool,
        enrichment: RecordingEnrichment,
        database_url: &str,
    ) -> Self {
        let credentials = MemoryCredentialStore::with(vec![credential("13800000001"), credential("13800000002")]);
        let pool = Arc::new(
            CredentialPool::load(SITE, credentials.clone())
                .await
                .expect("memory store loads"),
        );
        let executor = Arc::new(RequestExecutor::new(
            transport.clone(),
            pool.clone(),
            Arc::new(egress),
            UserAgentRotator::new(vec!["FakeAgent/1.0 (Mobile)".to_string()]),
            Duration::from_secs(5),
        ));

        let database = DatabaseConnection::new(database_url)
            .await
            .expect("database opens");
        database.migrate().await.expect("schema");
        let store = Arc::new(SqliteUpsertStore::new(database.shared_pool(), SITE));
        let checkpoints = Arc::new(SqliteCheckpointStore::new(database.shared_pool()));

        Self {
            transport,
            credentials,
            pool,
            executor,
            store,
            checkpoints,
            enrichment: Arc::new(enrichment),
            database,
        }
    }

    pub fn orchestrator(&self, adapter: FakeSiteAdapter, config: HarvestConfig) -> HarvestOrchestrator {
        HarvestOrchestrator::new(
            Arc::new(adapter),
            self.executor.clone(),
            self.store.clone(),
            self.checkpoints.clone(),
            self.enrichment.clone(),
        )
        .with_policy(fast_policy(2))
        .with_config(config)
    }
}
