// ABOUTME: Typed views of classifier responses for the intent, context and matcher modes.
// ABOUTME: Parsing goes through the repair layer; missing required fields are reported as errors.

use crate::repair;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Intent-mode (and iteration-mode) result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentResponse {
    pub intent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub is_code_request: bool,
    pub code_details: CodeDetails,
}

impl IntentResponse {
    pub fn parse(raw: &str) -> Result<Self> {
        let value = repair::parse_object(raw)?;
        serde_json::from_value(value).context("intent response has unexpected shape")
    }
}

/// Project-level details attached to a code request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_description: Option<String>,
    pub requirements: Vec<Value>,
    pub frameworks: Vec<String>,
    pub resources: Vec<ResourceSpec>,
    /// Single-file shorthand used when `resources` is empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub code_type: Option<String>,
}

/// One file the classifier says should be produced or changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub file_path: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub description: String,
    pub references: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Context-mode result. Both fields are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub conversation_flow: ConversationFlow,
    pub decision_points: Vec<DecisionPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_context: Option<Value>,
}

impl ContextResponse {
    pub fn parse(raw: &str) -> Result<Self> {
        let value = repair::parse_object(raw)?;
        serde_json::from_value(value).context("context response is missing required fields")
    }

    /// Indices of decision points that belong to the flow's own topic
    pub fn related_indices(&self) -> Vec<i64> {
        let topic_id = &self.conversation_flow.topic_id;
        let mut indices: Vec<i64> = self
            .decision_points
            .iter()
            .filter(|p| p.topic_id.as_deref() == Some(topic_id.as_str()))
            .filter_map(|p| p.dialogue_index.as_ref().and_then(IndexValue::as_index))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationFlow {
    pub topic_id: String,
    pub topic_type: String,
    pub current_topic: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue_index: Option<IndexValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classifiers emit dialogue indices both as numbers and as digit strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexValue {
    Number(i64),
    Text(String),
}

impl IndexValue {
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Pull a single selected identity out of matcher output.
///
/// Accepts `{"selected": ".."}` style objects or plain text mentioning one of
/// the candidates. Anything not in `candidates` is ignored.
pub fn parse_matcher_selection(raw: &str, candidates: &[String]) -> Option<String> {
    if let Ok(value) = repair::parse_object(raw) {
        for key in ["selected", "selected_staff_id", "staff_id"] {
            if let Some(id) = value.get(key).and_then(Value::as_str) {
                let id = id.trim();
                if let Some(found) = candidates.iter().find(|c| c.as_str() == id) {
                    return Some(found.clone());
                }
            }
        }
    }

    candidates
        .iter()
        .filter_map(|c| raw.find(c.as_str()).map(|pos| (pos, c)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, c)| c.clone())
}
