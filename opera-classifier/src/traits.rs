// ABOUTME: Core Classifier trait that all classifier backends implement.
// ABOUTME: Backends return the raw response body; parsing is the caller's job.

use crate::request::ClassifierRequest;
use anyhow::Result;
use futures::future::BoxFuture;

/// Core trait that all classifier backends implement.
///
/// The returned text is free-form: it may be fenced, wrapped in prose or not
/// JSON at all. Callers run it through [`crate::repair`] before trusting it.
pub trait Classifier: Send + Sync {
    /// Backend name for logging and metrics
    fn name(&self) -> &'static str;

    /// Run one classification request and return the raw response body
    fn classify<'a>(&'a self, request: &'a ClassifierRequest) -> BoxFuture<'a, Result<String>>;
}
