// ABOUTME: Bounded exponential backoff with jitter for transport and directory calls.
// ABOUTME: Only failures carrying a retryable StatusError are retried.

use crate::metrics;
use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// HTTP-like statuses worth another attempt
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Failure from an I/O collaborator, classified for retry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("connection error: {0}")]
    Connection(String),
}

impl StatusError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Connection(_) => true,
        }
    }
}

/// True when any error in the chain is a retryable [`StatusError`]
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StatusError>())
        .is_some_and(StatusError::is_retryable)
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// `[retry]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Tracks consecutive failures and the delay before the next attempt
#[derive(Debug)]
pub struct BackoffState {
    config: RetryConfig,
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    pub fn new(config: RetryConfig) -> Self {
        let current_delay = Duration::from_millis(config.initial_delay_ms);
        Self {
            config,
            consecutive_failures: 0,
            current_delay,
        }
    }

    /// Delay before the next attempt, or None once retries are exhausted
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.config.max_retries {
            return None;
        }

        let delay = self.current_delay;
        let max = Duration::from_millis(self.config.max_delay_ms);
        self.current_delay = delay.mul_f64(self.config.multiplier.max(1.0)).min(max);

        if self.config.jitter && !delay.is_zero() {
            // equal jitter: half fixed, half random
            let half = delay / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            return Some(half + Duration::from_millis(spread));
        }
        Some(delay)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = BackoffState::new(config.clone());
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => match backoff.record_failure() {
                Some(delay) => {
                    metrics::record_dispatch_retry(operation);
                    tracing::warn!(
                        operation,
                        attempt = backoff.consecutive_failures(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(operation, error = %err, "Retries exhausted");
                    return Err(err);
                }
            },
            Err(err) => return Err(err),
        }
    }
}
