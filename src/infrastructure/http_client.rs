//! HTTP transport with rate limiting and per-attempt request context
//!
//! Sites describe calls as [`RequestSpec`] values; the executor builds one
//! [`RequestContext`] per attempt (identity, session, egress) and hands both
//! to a [`Transport`]. No session state is shared between attempts.

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client,
    header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::infrastructure::config::defaults;
use crate::infrastructure::user_agent::default_mobile_agents;

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Rotated per attempt
    pub user_agents: Vec<String>,
    pub timeout_seconds: u64,
    pub max_requests_per_second: u32,
    pub follow_redirects: bool,
    /// Sent with every request (e.g. `Accept-Language`)
    pub default_headers: BTreeMap<String, String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agents: default_mobile_agents(),
            timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            follow_redirects: true,
            default_headers: BTreeMap::from([
                ("Accept".to_string(), "application/json, text/plain, */*".to_string()),
                ("Accept-Language".to_string(), "zh-CN,zh;q=0.9".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// How the body is handed back: parsed JSON, or the raw text wrapped in a
/// JSON string (HTML pages)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Text,
}

/// Shape of one outbound call, as produced by a site adapter
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub format: ResponseFormat,
    /// Overrides the executor's per-call timeout
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            format: ResponseFormat::Json,
            timeout: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub const fn expecting_text(mut self) -> Self {
        self.format = ResponseFormat::Text;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Everything attached to a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub attempt: u32,
    pub user_agent: String,
    /// Rendered `Cookie` header of the attached credential
    pub session_header: Option<String>,
    /// Proxy descriptor; `None` means a direct connection
    pub egress: Option<String>,
    pub timeout: Duration,
}

impl RequestContext {
    pub fn direct(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            attempt: 1,
            user_agent: user_agent.into(),
            session_header: None,
            egress: None,
            timeout,
        }
    }

    #[must_use]
    pub fn via(mut self, egress: impl Into<String>) -> Self {
        self.egress = Some(egress.into());
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("malformed response body: {0}")]
    Decode(String),

    #[error("invalid egress descriptor: {0}")]
    Egress(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else if error.is_decode() || error.is_body() {
            Self::Decode(error.to_string())
        } else if let Some(status) = error.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else {
            Self::Request(error.to_string())
        }
    }
}

/// The only suspension point of an attempt
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, spec: &RequestSpec, ctx: &RequestContext) -> Result<Value, TransportError>;
}

/// reqwest-backed transport with a direct-rate limiter
pub struct HttpClient {
    direct: Client,
    // Single proxied client, rebuilt when the lease changes
    proxied: Mutex<Option<(String, Client)>>,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let direct = Self::build_client(&config, None)?;
        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second)
                .context("Rate limit must be greater than 0")?,
        );

        Ok(Self {
            direct,
            proxied: Mutex::new(None),
            rate_limiter: RateLimiter::direct(quota),
            config,
        })
    }

    fn build_client(config: &HttpClientConfig, proxy: Option<&str>) -> anyhow::Result<Client> {
        use anyhow::Context;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("Invalid header name: {name}"))?,
                HeaderValue::from_str(value)
                    .with_context(|| format!("Invalid header value for {name}"))?,
            );
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .gzip(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });
        if let Some(descriptor) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(descriptor).context("Invalid proxy descriptor")?);
        }
        builder.build().context("Failed to create HTTP client")
    }

    fn client_for(&self, egress: Option<&str>) -> Result<Client, TransportError> {
        let Some(descriptor) = egress else {
            return Ok(self.direct.clone());
        };

        let mut slot = match self.proxied.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached, client)) = slot.as_ref() {
            if cached == descriptor {
                return Ok(client.clone());
            }
        }
        let client = Self::build_client(&self.config, Some(descriptor))
            .map_err(|e| TransportError::Egress(e.to_string()))?;
        *slot = Some((descriptor.to_string(), client.clone()));
        Ok(client)
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(&self, spec: &RequestSpec, ctx: &RequestContext) -> Result<Value, TransportError> {
        self.rate_limiter.until_ready().await;

        let client = self.client_for(ctx.egress.as_deref())?;
        let mut request = match spec.method {
            HttpMethod::Get => client.get(&spec.url),
            HttpMethod::Post => client.post(&spec.url),
        };
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request
            .header(USER_AGENT, ctx.user_agent.as_str())
            .timeout(spec.timeout.unwrap_or(ctx.timeout));
        if let Some(session) = &ctx.session_header {
            request = request.header(COOKIE, session.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        tracing::debug!(url = %spec.url, attempt = ctx.attempt, proxied = ctx.egress.is_some(), "Sending request");
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        match spec.format {
            ResponseFormat::Json => {
                let text = response.text().await?;
                serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
            }
            ResponseFormat::Text => Ok(Value::String(response.text().await?)),
        }
    }
}
