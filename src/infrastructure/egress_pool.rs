//! Proxy (egress) leasing with a single-slot cache
//!
//! A supplier endpoint hands out one `host:port` per call. A candidate is
//! only cached after a probe request through it returns the expected field;
//! the cached lease is reused until its TTL elapses or a holder reports it
//! broken. No lease means the caller connects directly.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::infrastructure::config::EgressConfig;
use crate::infrastructure::http_client::{RequestContext, RequestSpec, Transport};
use crate::infrastructure::user_agent::UserAgentRotator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressLease {
    pub address: String,
    /// Ready-to-use proxy URL, credentials included
    pub descriptor: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
}

impl EgressLease {
    pub fn is_fresh(&self) -> bool {
        self.acquired_at.elapsed() < self.ttl
    }
}

#[async_trait]
pub trait EgressSupplier: Send + Sync {
    /// One candidate address, or `None` when the supplier has nothing usable
    async fn fetch_address(&self) -> Option<String>;

    fn format_descriptor(&self, address: &str) -> String;

    /// Cheap reachability check through the candidate
    async fn probe(&self, descriptor: &str) -> bool;
}

/// Supplier backed by an HTTP extraction API and an HTTP probe target
pub struct HttpEgressSupplier {
    transport: Arc<dyn Transport>,
    config: EgressConfig,
    user_agents: UserAgentRotator,
}

impl HttpEgressSupplier {
    pub fn new(transport: Arc<dyn Transport>, config: EgressConfig, user_agents: UserAgentRotator) -> Self {
        Self {
            transport,
            config,
            user_agents,
        }
    }

    fn context(&self, timeout_seconds: u64) -> RequestContext {
        RequestContext::direct(self.user_agents.pick(), Duration::from_secs(timeout_seconds))
    }
}

#[async_trait]
impl EgressSupplier for HttpEgressSupplier {
    async fn fetch_address(&self) -> Option<String> {
        let spec = RequestSpec::get(&self.config.supplier_url).expecting_text();
        let ctx = self.context(self.config.supplier_timeout_seconds);

        match self.transport.send(&spec, &ctx).await {
            Ok(Value::String(body)) => {
                let address = body.lines().next().unwrap_or_default().trim().to_string();
                (!address.is_empty()).then_some(address)
            }
            Ok(other) => {
                warn!("Egress supplier returned an unexpected body: {}", other);
                None
            }
            Err(e) => {
                warn!("Failed to fetch egress address, falling back to direct: {}", e);
                None
            }
        }
    }

    fn format_descriptor(&self, address: &str) -> String {
        if self.config.auth_key.is_empty() {
            format!("http://{address}")
        } else {
            format!("http://{}:{}@{}", self.config.auth_key, self.config.password, address)
        }
    }

    async fn probe(&self, descriptor: &str) -> bool {
        let spec = RequestSpec::get(&self.config.probe_url);
        let ctx = self.context(self.config.probe_timeout_seconds).via(descriptor);

        match self.transport.send(&spec, &ctx).await {
            Ok(payload) => payload.get(&self.config.probe_field).is_some(),
            Err(e) => {
                debug!("Egress probe failed: {}", e);
                false
            }
        }
    }
}

pub struct EgressPool {
    supplier: Option<Arc<dyn EgressSupplier>>,
    ttl: Duration,
    slot: Mutex<Option<EgressLease>>,
}

impl EgressPool {
    pub fn new(supplier: Arc<dyn EgressSupplier>, ttl: Duration) -> Self {
        Self {
            supplier: Some(supplier),
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Pool that never leases; every request goes direct
    pub fn disabled() -> Self {
        Self {
            supplier: None,
            ttl: Duration::ZERO,
            slot: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EgressConfig, transport: Arc<dyn Transport>, user_agents: UserAgentRotator) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let supplier = HttpEgressSupplier::new(transport, config.clone(), user_agents);
        Self::new(Arc::new(supplier), Duration::from_secs(config.lease_ttl_seconds))
    }

    /// The cached lease while fresh; otherwise one supplier call and one probe.
    /// The slot lock is held throughout so concurrent callers share a refresh.
    pub async fn lease(&self) -> Option<EgressLease> {
        let supplier = self.supplier.as_ref()?;
        let mut slot = self.slot.lock().await;

        if let Some(lease) = slot.as_ref() {
            if lease.is_fresh() {
                return Some(lease.clone());
            }
            debug!(address = %lease.address, "Egress lease expired");
        }
        *slot = None;

        let address = supplier.fetch_address().await?;
        let descriptor = supplier.format_descriptor(&address);
        if !supplier.probe(&descriptor).await {
            warn!(address = %address, "Egress candidate failed probe, using direct connection");
            return None;
        }

        info!(address = %address, "🌐 Leased new egress address");
        let lease = EgressLease {
            address,
            descriptor,
            acquired_at: Instant::now(),
            ttl: self.ttl,
        };
        *slot = Some(lease.clone());
        Some(lease)
    }

    /// Drops the cached lease, whichever it is
    pub async fn invalidate(&self, lease: &EgressLease) {
        let mut slot = self.slot.lock().await;
        if let Some(current) = slot.take() {
            info!(address = %current.address, reported = %lease.address, "Egress lease invalidated");
        }
    }

    pub async fn current(&self) -> Option<EgressLease> {
        self.slot.lock().await.clone()
    }
}
