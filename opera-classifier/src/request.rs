// ABOUTME: Request types sent to classifier backends, one variant per classification mode.
// ABOUTME: Serialized as {"mode": ..., "payload": {...}} so remote backends can route on mode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four classifier modes the orchestration core calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierMode {
    Intent,
    Context,
    Iteration,
    Matcher,
}

impl ClassifierMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Context => "context",
            Self::Iteration => "iteration",
            Self::Matcher => "matcher",
        }
    }
}

impl std::fmt::Display for ClassifierMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dialogue as seen by the context classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub index: i64,
    pub text: String,
    pub stage_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// A resource handed to the iteration classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub file_path: String,
    pub resource_id: String,
}

/// A classification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "payload", rename_all = "snake_case")]
pub enum ClassifierRequest {
    /// Standard intent analysis for a single dialogue
    Intent {
        text: String,
        dialogue_type: String,
        is_narration: bool,
        is_whisper: bool,
        tags: Vec<String>,
        has_mentions: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_index: Option<u32>,
    },

    /// Relate a dialogue to the recent conversation window
    Context {
        current: ContextEntry,
        window: Vec<ContextEntry>,
    },

    /// Break an iteration requirement down against existing resources
    Iteration {
        requirement: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_id: Option<String>,
        resources: Vec<ResourceRef>,
    },

    /// Pick one handler identity out of several candidates
    Matcher {
        code_details: Value,
        candidates: Vec<String>,
    },
}

impl ClassifierRequest {
    pub fn mode(&self) -> ClassifierMode {
        match self {
            Self::Intent { .. } => ClassifierMode::Intent,
            Self::Context { .. } => ClassifierMode::Context,
            Self::Iteration { .. } => ClassifierMode::Iteration,
            Self::Matcher { .. } => ClassifierMode::Matcher,
        }
    }

    /// Primary text of the request, used by the mock backend for pattern matching
    pub fn text(&self) -> &str {
        match self {
            Self::Intent { text, .. } => text,
            Self::Context { current, .. } => &current.text,
            Self::Iteration { requirement, .. } => requirement,
            Self::Matcher { .. } => "",
        }
    }
}
