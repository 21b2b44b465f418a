//! Single outbound call with credential/egress/identity attachment and retries
//!
//! Each attempt builds a fresh [`RequestContext`]: a rotated User-Agent, a
//! credential from the pool and, when available, an egress lease. The
//! outcome is classified as success, transport failure or empty payload.
//! Only exhaustion on empty payloads burns the credential; transport
//! failures burn the egress lease instead.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::Credential;
use crate::infrastructure::credential_pool::CredentialPool;
use crate::infrastructure::egress_pool::EgressPool;
use crate::infrastructure::http_client::{RequestContext, RequestSpec, Transport, TransportError};
use crate::infrastructure::retry_policy::{AttemptError, FailureKind, RetryPolicy};
use crate::infrastructure::user_agent::UserAgentRotator;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no valid credential available for {platform}")]
    NoCredentialAvailable { platform: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AttemptError },

    #[error("request cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Exhausted { last, .. } => Some(last.kind()),
            _ => None,
        }
    }
}

pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialPool>,
    egress: Arc<EgressPool>,
    user_agents: UserAgentRotator,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialPool>,
        egress: Arc<EgressPool>,
        user_agents: UserAgentRotator,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            credentials,
            egress,
            user_agents,
            timeout,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    pub async fn execute<F>(&self, spec: &RequestSpec, policy: &RetryPolicy, is_success: F) -> Result<Value, ExecutorError>
    where
        F: Fn(&Value) -> bool + Send + Sync,
    {
        self.execute_cancellable(spec, policy, is_success, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute); cancellation is honoured before an
    /// attempt starts and while waiting out a backoff, never mid-attempt.
    pub async fn execute_cancellable<F>(
        &self,
        spec: &RequestSpec,
        policy: &RetryPolicy,
        is_success: F,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutorError>
    where
        F: Fn(&Value) -> bool + Send + Sync,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = policy.backoff();
        let mut last_failure: Option<(AttemptError, Credential)> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            let Some(credential) = self.credentials.acquire().await else {
                return Err(ExecutorError::NoCredentialAvailable {
                    platform: self.credentials.platform().to_string(),
                });
            };
            let lease = self.egress.lease().await;

            let ctx = RequestContext {
                attempt,
                user_agent: self.user_agents.pick().to_string(),
                session_header: Some(CredentialPool::render_session_header(&credential)),
                egress: lease.as_ref().map(|l| l.descriptor.clone()),
                timeout: spec.timeout.unwrap_or(self.timeout),
            };

            let outcome = match tokio::time::timeout(ctx.timeout, self.transport.send(spec, &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(format!("no response within {:?}", ctx.timeout))),
            };

            let failure = match outcome {
                Ok(payload) if is_success(&payload) => {
                    debug!(url = %spec.url, attempt, "Request succeeded");
                    return Ok(payload);
                }
                Ok(_) => AttemptError::empty("response lacks the success marker"),
                Err(e) => policy.classify(e),
            };

            warn!(
                url = %spec.url,
                attempt,
                max_attempts,
                kind = %failure.kind(),
                phone = %credential.phone,
                "Attempt failed: {}",
                failure
            );

            if let (FailureKind::Transport, Some(lease)) = (failure.kind(), lease.as_ref()) {
                self.egress.invalidate(lease).await;
            }
            last_failure = Some((failure, credential));

            if attempt < max_attempts {
                let delay = backoff.next_delay();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                }
            }
        }

        let Some((last, credential)) = last_failure else {
            return Err(ExecutorError::Cancelled);
        };

        if last.kind() == FailureKind::EmptyPayload && policy.invalidate_credential_on_empty {
            if let Err(e) = self.credentials.release_as_failed(&credential).await {
                error!(phone = %credential.phone, "Failed to persist credential invalidation: {}", e);
            }
        }

        Err(ExecutorError::Exhausted {
            attempts: max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::egress_pool::EgressSupplier;
    use crate::test_utils::{MemoryCredentialStore, credential};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Transport replaying a script; the last entry repeats forever
    struct ScriptedTransport {
        script: Mutex<Vec<Result<Value, TransportError>>>,
        calls: Mutex<Vec<(Instant, RequestContext)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Value, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Instant, RequestContext)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _spec: &RequestSpec, ctx: &RequestContext) -> Result<Value, TransportError> {
            self.calls.lock().unwrap().push((Instant::now(), ctx.clone()));
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    struct OneAddress;

    #[async_trait]
    impl EgressSupplier for OneAddress {
        async fn fetch_address(&self) -> Option<String> {
            Some("10.1.1.1:9000".into())
        }
        fn format_descriptor(&self, address: &str) -> String {
            format!("http://{address}")
        }
        async fn probe(&self, _descriptor: &str) -> bool {
            true
        }
    }

    fn success(payload: &Value) -> bool {
        payload["ok"] == true
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_wait_ms: 100,
            max_wait_ms: 400,
            jitter_ms: 50,
            ..RetryPolicy::default()
        }
    }

    async fn executor(
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryCredentialStore>,
        egress: EgressPool,
    ) -> RequestExecutor {
        let pool = CredentialPool::load("ctrip", store).await.unwrap();
        RequestExecutor::new(
            transport,
            Arc::new(pool),
            Arc::new(egress),
            UserAgentRotator::new(vec!["ua-1".into(), "ua-2".into()]),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_transport_failure_retries_exactly_max_attempts() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connect("reset".into()))]);
        let store = MemoryCredentialStore::with(vec![credential("1", "ctrip")]);
        let executor = executor(transport.clone(), store.clone(), EgressPool::disabled()).await;

        let result = executor.execute(&RequestSpec::get("https://x/list"), &policy(5), success).await;

        assert!(matches!(result, Err(ExecutorError::Exhausted { attempts: 5, .. })));
        let calls = transport.calls();
        assert_eq!(calls.len(), 5);

        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].0 - w[0].0).collect();
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]), "gaps {gaps:?}");
        assert!(gaps.iter().all(|g| *g >= Duration::from_millis(100) && *g <= Duration::from_millis(400)));

        // transport failures never burn the credential
        assert!(store.snapshot()[0].is_valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_exhaustion_invalidates_credential() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"ok": false}))]);
        let store = MemoryCredentialStore::with(vec![credential("1", "ctrip")]);
        let executor = executor(transport.clone(), store.clone(), EgressPool::disabled()).await;

        let result = executor.execute(&RequestSpec::get("https://x/detail"), &policy(3), success).await;

        let err = result.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::EmptyPayload));
        assert_eq!(transport.calls().len(), 3);
        let stored = store.snapshot();
        assert!(!stored[0].is_valid);
        assert_eq!(stored[0].fail_count, 1);
        assert_eq!(executor.credentials().available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_status_counts_as_empty_payload() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Status { status: 403 })]);
        let store = MemoryCredentialStore::with(vec![credential("1", "ctrip")]);
        let executor = executor(transport, store.clone(), EgressPool::disabled()).await;

        let err = executor
            .execute(&RequestSpec::get("https://x/qa"), &policy(2), success)
            .await
            .unwrap_err();

        assert_eq!(err.failure_kind(), Some(FailureKind::EmptyPayload));
        assert!(!store.snapshot()[0].is_valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("slow".into())),
            Ok(json!({"ok": false})),
            Ok(json!({"ok": true, "total": 3})),
        ]);
        let store = MemoryCredentialStore::with(vec![credential("1", "ctrip")]);
        let executor = executor(transport.clone(), store.clone(), EgressPool::disabled()).await;

        let payload = executor
            .execute(&RequestSpec::get("https://x/list"), &policy(5), success)
            .await
            .unwrap();

        assert_eq!(payload["total"], 3);
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().map(|c| c.1.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(calls.iter().all(|c| c.1.session_header.as_deref() == Some("sid=1")));
        assert!(store.snapshot()[0].is_valid);
    }

    #[tokio::test]
    async fn test_no_credential_fails_fast() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"ok": true}))]);
        let mut burned = credential("1", "ctrip");
        burned.is_valid = false;
        let executor = executor(transport.clone(), MemoryCredentialStore::with(vec![burned]), EgressPool::disabled()).await;

        let result = executor.execute(&RequestSpec::get("https://x/list"), &policy(5), success).await;

        assert!(matches!(result, Err(ExecutorError::NoCredentialAvailable { .. })));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_drops_egress_lease() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("proxy refused".into())),
            Ok(json!({"ok": true})),
        ]);
        let egress = EgressPool::new(Arc::new(OneAddress), Duration::from_secs(60));
        let store = MemoryCredentialStore::with(vec![credential("1", "ctrip")]);
        let executor = executor(transport.clone(), store, egress).await;

        executor
            .execute(&RequestSpec::get("https://x/list"), &policy(3), success)
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].1.egress.as_deref(), Some("http://10.1.1.1:9000"));
        assert_eq!(calls[1].1.egress.as_deref(), Some("http://10.1.1.1:9000"));
        assert!(executor.egress.current().await.is_some(), "lease re-established after invalidation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connect("reset".into()))]);
        let store = MemoryCredentialStore::with(vec![credential("1", "ctrip")]);
        let executor = executor(transport.clone(), store, EgressPool::disabled()).await;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let result = executor
            .execute_cancellable(&RequestSpec::get("https://x/list"), &policy(10), success, &cancel)
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert_eq!(transport.calls().len(), 1);
    }
}
