// ABOUTME: Mock classifier for testing - returns pre-configured responses per mode.
// ABOUTME: Records every request so tests can assert on what the pipeline asked.
//!
//! # Example
//!
//! ```no_run
//! use opera_classifier::backends::mock::MockClassifier;
//! use opera_classifier::{ClassifierMode, ClassifierRequest, Classifier};
//!
//! # async fn example() {
//! let mock = MockClassifier::new()
//!     .on(ClassifierMode::Intent, "build").respond(r#"{"intent": "build a site"}"#)
//!     .on(ClassifierMode::Intent, "crash").respond_error("classifier offline")
//!     .fallback(ClassifierMode::Context, "not json");
//!
//! let request = ClassifierRequest::Iteration {
//!     requirement: "anything".to_string(),
//!     version_id: None,
//!     resources: vec![],
//! };
//! let _ = mock.classify(&request).await;
//! assert_eq!(mock.calls().len(), 1);
//! # }
//! ```

use crate::registry::ClassifierFactory;
use crate::request::{ClassifierMode, ClassifierRequest};
use crate::traits::Classifier;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Mock classifier for testing
pub struct MockClassifier {
    expectations: Mutex<VecDeque<Expectation>>,
    fallbacks: Mutex<HashMap<ClassifierMode, String>>,
    calls: Mutex<Vec<ClassifierRequest>>,
}

struct Expectation {
    mode: ClassifierMode,
    pattern: String,
    response: std::result::Result<String, String>,
}

impl MockClassifier {
    /// Create a new mock with no expectations
    pub fn new() -> Self {
        Self {
            expectations: Mutex::new(VecDeque::new()),
            fallbacks: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Set up a one-shot expectation for `mode` requests whose text contains `pattern`
    pub fn on(self, mode: ClassifierMode, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            classifier: self,
            mode,
            pattern: pattern.to_string(),
        }
    }

    /// Reusable response for a mode when no one-shot expectation matches
    pub fn fallback(self, mode: ClassifierMode, response: &str) -> Self {
        self.fallbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mode, response.to_string());
        self
    }

    /// Every request received so far, in order
    pub fn calls(&self) -> Vec<ClassifierRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests received for one mode
    pub fn calls_for(&self, mode: ClassifierMode) -> Vec<ClassifierRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.mode() == mode)
            .collect()
    }

    fn respond(&self, request: &ClassifierRequest) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let mode = request.mode();
        let text = request.text();

        // FIFO preference: the front wins if it matches, otherwise the first match in the queue
        let matched = {
            let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
            exp.iter()
                .position(|e| e.mode == mode && text.contains(&e.pattern))
                .and_then(|i| exp.remove(i))
        };

        if let Some(expectation) = matched {
            return expectation.response.map_err(|message| anyhow!(message));
        }

        self.fallbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&mode)
            .cloned()
            .ok_or_else(|| anyhow!("Mock: no {} expectation for '{}'", mode, text))
    }

    /// Factory function for the registry.
    ///
    /// Settings may carry `{"responses": {"intent": "...", "context": "..."}}`
    /// which become per-mode fallbacks.
    pub fn factory() -> ClassifierFactory {
        Box::new(|settings| {
            let mut mock = MockClassifier::new();
            if let Some(responses) = settings.get("responses").and_then(|v| v.as_object()) {
                for (mode, response) in responses {
                    let mode: ClassifierMode =
                        serde_json::from_value(serde_json::Value::String(mode.clone()))
                            .map_err(|_| anyhow!("Unknown classifier mode in mock config: {}", mode))?;
                    if let Some(text) = response.as_str() {
                        mock = mock.fallback(mode, text);
                    }
                }
            }
            Ok(Arc::new(mock) as Arc<dyn Classifier>)
        })
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for MockClassifier {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn classify<'a>(&'a self, request: &'a ClassifierRequest) -> BoxFuture<'a, Result<String>> {
        let result = self.respond(request);
        Box::pin(futures::future::ready(result))
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    classifier: MockClassifier,
    mode: ClassifierMode,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a raw body
    pub fn respond(self, body: &str) -> MockClassifier {
        self.push(Ok(body.to_string()))
    }

    /// Respond with a serialized JSON value
    pub fn respond_json(self, body: serde_json::Value) -> MockClassifier {
        self.push(Ok(body.to_string()))
    }

    /// Fail the call
    pub fn respond_error(self, message: &str) -> MockClassifier {
        self.push(Err(message.to_string()))
    }

    fn push(self, response: std::result::Result<String, String>) -> MockClassifier {
        self.classifier
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                mode: self.mode,
                pattern: self.pattern,
                response,
            });
        self.classifier
    }
}
