// ABOUTME: Registry pattern for runtime classifier selection.
// ABOUTME: Backends register factories, the service creates one by name from config.

use crate::config::ClassifierConfig;
use crate::traits::Classifier;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory function that creates a classifier from JSON settings
pub type ClassifierFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn Classifier>> + Send + Sync>;

/// Registry for runtime classifier selection
pub struct ClassifierRegistry {
    factories: HashMap<String, ClassifierFactory>,
}

impl ClassifierRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory by name
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Classifier>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// Create a classifier by name with the given settings
    pub fn create(&self, name: &str, settings: &Value) -> Result<Arc<dyn Classifier>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("Unknown classifier backend: {}", name))?;
        factory(settings)
    }

    /// List available backend names, sorted
    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Create a classifier from the [classifier] config section
    pub fn create_from_config(&self, config: &ClassifierConfig) -> Result<Arc<dyn Classifier>> {
        self.create(config.classifier_type(), &config.to_json_value())
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        use crate::backends::mock::MockClassifier;

        Self::new().register("mock", MockClassifier::factory())
    }
}
