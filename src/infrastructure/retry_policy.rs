//! Retry policy shared by every site
//!
//! Attempt failures fall into two kinds: transport failures (connection
//! errors, timeouts, malformed bodies) and empty payloads (a well-formed
//! response without the site's success marker). Both count toward
//! `max_attempts`; only exhausting on empty payloads burns the credential.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::infrastructure::config::defaults;
use crate::infrastructure::http_client::TransportError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    /// Growth factor per attempt (e.g. 2.0 doubles)
    pub backoff_multiplier: f64,
    /// Random extra delay in `0..=jitter_ms`
    pub jitter_ms: u64,
    pub invalidate_credential_on_empty: bool,
    /// HTTP statuses treated as a rejected session rather than a network fault
    pub empty_payload_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            min_wait_ms: defaults::RETRY_MIN_WAIT_MS,
            max_wait_ms: defaults::RETRY_MAX_WAIT_MS,
            backoff_multiplier: defaults::RETRY_BACKOFF_MULTIPLIER,
            jitter_ms: defaults::RETRY_JITTER_MS,
            invalidate_credential_on_empty: true,
            empty_payload_statuses: vec![401, 403],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    EmptyPayload,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("transport"),
            Self::EmptyPayload => f.write_str("empty_payload"),
        }
    }
}

/// Classified failure of a single attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("empty payload: {reason}")]
    EmptyPayload { reason: String },
}

impl AttemptError {
    pub fn empty(reason: impl Into<String>) -> Self {
        Self::EmptyPayload {
            reason: reason.into(),
        }
    }

    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::EmptyPayload { .. } => FailureKind::EmptyPayload,
        }
    }
}

impl RetryPolicy {
    pub const fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.max(self.min_wait_ms))
    }

    /// Statuses listed in `empty_payload_statuses` mean the site refused the
    /// session; everything else from the transport is a transport failure.
    pub fn classify(&self, error: TransportError) -> AttemptError {
        match error {
            TransportError::Status { status } if self.empty_payload_statuses.contains(&status) => {
                AttemptError::empty(format!("HTTP {status}"))
            }
            other => AttemptError::Transport(other),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            min_ms: self.min_wait_ms,
            max_ms: self.max_wait_ms.max(self.min_wait_ms),
            multiplier: if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
                self.backoff_multiplier
            } else {
                1.0
            },
            jitter_ms: self.jitter_ms,
            attempt: 0,
            previous_ms: 0,
        }
    }
}

/// Delay sequence between attempts: exponential with jitter, clamped to
/// `[min_wait, max_wait]` and never shorter than the previous delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_ms: u64,
    attempt: u32,
    previous_ms: u64,
}

impl Backoff {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exponent = i32::try_from(self.attempt - 1).unwrap_or(i32::MAX).min(64);
        let exponential = (self.min_ms as f64 * self.multiplier.powi(exponent)).min(self.max_ms as f64);

        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=self.jitter_ms)
        };
        let candidate = (exponential as u64)
            .saturating_add(jitter)
            .clamp(self.min_ms, self.max_ms);

        self.previous_ms = self.previous_ms.max(candidate);
        Duration::from_millis(self.previous_ms)
    }
}
