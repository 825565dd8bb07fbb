// ABOUTME: HTTP classifier backend: POSTs {mode, payload} JSON and returns the response body.
// ABOUTME: Non-2xx statuses become StatusError so transient failures go through backoff.

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use opera_classifier::{Classifier, ClassifierFactory, ClassifierRegistry, ClassifierRequest};
use opera_core::retry::{retry_with_backoff, RetryConfig, StatusError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryConfig,
}

impl HttpClassifier {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration, retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            retry,
        })
    }

    /// Build from `[classifier]` settings: endpoint, api_key, timeout_secs, and
    /// max_retries overriding the shared `[retry]` policy
    pub fn from_settings(settings: &Value, mut retry: RetryConfig) -> Result<Self> {
        let endpoint = settings
            .get("endpoint")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("http classifier requires classifier.endpoint"))?;
        let api_key = settings
            .get("api_key")
            .and_then(Value::as_str)
            .map(str::to_string);
        let timeout = settings
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        if let Some(max_retries) = settings.get("max_retries").and_then(Value::as_u64) {
            retry.max_retries = max_retries as u32;
        }
        Self::new(endpoint, api_key, Duration::from_secs(timeout), retry)
    }

    pub fn factory(retry: RetryConfig) -> ClassifierFactory {
        Box::new(move |settings| {
            Ok(Arc::new(HttpClassifier::from_settings(settings, retry.clone())?) as Arc<dyn Classifier>)
        })
    }

    async fn post_once(&self, request: &ClassifierRequest) -> Result<String> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| StatusError::Connection(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StatusError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(StatusError::status(status.as_u16(), truncate(&body, 200)).into());
        }
        Ok(body)
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

impl Classifier for HttpClassifier {
    fn name(&self) -> &'static str {
        "http"
    }

    fn classify<'a>(&'a self, request: &'a ClassifierRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            tracing::debug!(mode = %request.mode(), endpoint = %self.endpoint, "Classifier request");
            retry_with_backoff(&self.retry, "classify", || self.post_once(request))
                .await
                .with_context(|| format!("{} classification", request.mode()))
        })
    }
}

/// Every backend the binary knows: `mock` and `http`, the latter retrying per `retry`
pub fn classifier_registry(retry: &RetryConfig) -> ClassifierRegistry {
    ClassifierRegistry::default().register("http", HttpClassifier::factory(retry.clone()))
}
