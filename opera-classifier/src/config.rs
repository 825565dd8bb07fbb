// ABOUTME: Classifier backend selection from the [classifier] TOML section.
// ABOUTME: The type picks a registry factory; remaining keys are handed to that factory.

use serde::{Deserialize, Serialize};

/// Backend configuration with type discriminator
#[derive(Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Backend type: "mock", "http", ...
    #[serde(rename = "type", default = "default_classifier_type")]
    pub classifier_type: String,

    /// Remaining fields passed to the backend factory
    #[serde(flatten)]
    pub settings: toml::Table,
}

fn default_classifier_type() -> String {
    "mock".to_string()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            classifier_type: default_classifier_type(),
            settings: toml::Table::new(),
        }
    }
}

impl ClassifierConfig {
    pub fn classifier_type(&self) -> &str {
        &self.classifier_type
    }

    /// Convert the settings table to JSON for the registry
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.settings).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Set a string setting, used for environment overrides
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.settings
            .insert(key.to_string(), toml::Value::String(value.into()));
    }
}

// Redact credentials that backends read from settings
impl std::fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted: toml::Table = self
            .settings
            .iter()
            .map(|(k, v)| {
                if k.contains("key") || k.contains("token") || k.contains("secret") {
                    (k.clone(), toml::Value::String("[REDACTED]".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        f.debug_struct("ClassifierConfig")
            .field("classifier_type", &self.classifier_type)
            .field("settings", &redacted)
            .finish()
    }
}
