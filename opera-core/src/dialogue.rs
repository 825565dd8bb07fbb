// ABOUTME: Dialogue records: the in-memory form of one inbound chat event plus its analysis state.
// ABOUTME: Also derives priority and dialogue type from the raw event on ingestion.

use crate::tags;
use chrono::{DateTime, Utc};
use opera_classifier::CodeDetails;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Heat a freshly ingested record starts with
pub const INITIAL_HEAT: f64 = 1.0;

/// Confidence assigned when intent analysis degrades
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogueType {
    Normal,
    Whisper,
    Mention,
    Narration,
    System,
    CodeResource,
    Iteration,
    DirectCreation,
}

impl DialogueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Whisper => "WHISPER",
            Self::Mention => "MENTION",
            Self::Narration => "NARRATION",
            Self::System => "SYSTEM",
            Self::CodeResource => "CODE_RESOURCE",
            Self::Iteration => "ITERATION",
            Self::DirectCreation => "DIRECT_CREATION",
        }
    }
}

impl std::fmt::Display for DialogueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared by dialogues and tasks. Declaration order is ascending urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    /// Weight used by pool eviction scoring
    pub fn weight(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Urgent => 4,
            Self::Critical => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Result of the intent step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: String,
    pub confidence: f64,
    pub parameters: Map<String, Value>,
}

impl IntentAnalysis {
    /// Low-confidence result used whenever classification cannot be trusted
    pub fn degraded(record: &DialogueRecord, reason: &str) -> Self {
        let mut parameters = Map::new();
        parameters.insert("text".to_string(), Value::String(record.text.clone()));
        parameters.insert(
            "type".to_string(),
            Value::String(record.dialogue_type.as_str().to_string()),
        );
        parameters.insert("tags".to_string(), Value::String(record.tags.clone()));
        parameters.insert("reason".to_string(), Value::String(reason.to_string()));
        Self {
            intent: String::new(),
            confidence: FALLBACK_CONFIDENCE,
            parameters,
        }
    }

    pub fn is_code_request(&self) -> bool {
        self.parameters
            .get("is_code_request")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn code_details(&self) -> CodeDetails {
        self.parameters
            .get("code_details")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn reason(&self) -> Option<&str> {
        self.parameters.get("reason").and_then(Value::as_str)
    }
}

/// Everything one classification pass learned about a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueAnalysis {
    pub intent: IntentAnalysis,
    pub related_indices: BTreeSet<i64>,
    pub conversation_state: Map<String, Value>,
    pub analyzed_at: DateTime<Utc>,
}

impl DialogueAnalysis {
    /// Topic id and type recorded by the context step, if any
    pub fn topic(&self) -> Option<(String, String)> {
        let topic = self.conversation_state.get("topic")?;
        let id = topic.get("id")?.as_str()?.to_string();
        let topic_type = topic
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((id, topic_type))
    }
}

/// Event delivered by the transport; the only way into the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundEvent {
    pub index: i64,
    pub scope_id: String,
    pub sender_id: Option<String>,
    pub receiver_ids: Vec<String>,
    pub text: String,
    pub tags: String,
    pub is_narration: bool,
    pub is_private: bool,
    pub mentioned_ids: Vec<String>,
    pub stage_index: Option<u32>,
    /// Upstream may pin the type, skipping inference
    pub dialogue_type: Option<DialogueType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueRecord {
    pub index: i64,
    pub scope_id: String,
    pub sender_id: Option<String>,
    pub receiver_ids: Vec<String>,
    pub mentioned_ids: Vec<String>,
    pub text: String,
    pub tags: String,
    pub is_narration: bool,
    pub is_private: bool,
    pub stage_index: Option<u32>,
    pub dialogue_type: DialogueType,
    pub priority: Priority,
    pub heat: f64,
    pub status: DialogueStatus,
    pub created_at: DateTime<Utc>,
    pub analysis: Option<DialogueAnalysis>,
}

impl DialogueRecord {
    /// Minimal record, mostly for tests and synthetic events
    pub fn new(scope_id: &str, index: i64, text: &str) -> Self {
        Self {
            index,
            scope_id: scope_id.to_string(),
            sender_id: None,
            receiver_ids: Vec::new(),
            mentioned_ids: Vec::new(),
            text: text.to_string(),
            tags: String::new(),
            is_narration: false,
            is_private: false,
            stage_index: None,
            dialogue_type: DialogueType::Normal,
            priority: Priority::Normal,
            heat: INITIAL_HEAT,
            status: DialogueStatus::Pending,
            created_at: Utc::now(),
            analysis: None,
        }
    }

    /// Build a record from an inbound event, inferring priority and type
    pub fn from_event(event: InboundEvent) -> Self {
        let priority = determine_priority(&event);
        let dialogue_type = event
            .dialogue_type
            .unwrap_or_else(|| determine_type(&event));

        let mut receiver_ids = Vec::with_capacity(event.receiver_ids.len());
        for id in event.receiver_ids {
            if !receiver_ids.contains(&id) {
                receiver_ids.push(id);
            }
        }
        let mut mentioned_ids = Vec::with_capacity(event.mentioned_ids.len());
        for id in event.mentioned_ids {
            if !mentioned_ids.contains(&id) {
                mentioned_ids.push(id);
            }
        }

        Self {
            index: event.index,
            scope_id: event.scope_id,
            sender_id: event.sender_id,
            receiver_ids,
            mentioned_ids,
            text: event.text,
            tags: event.tags,
            is_narration: event.is_narration,
            is_private: event.is_private,
            stage_index: event.stage_index,
            dialogue_type,
            priority,
            heat: INITIAL_HEAT,
            status: DialogueStatus::Pending,
            created_at: Utc::now(),
            analysis: None,
        }
    }

    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = tags.to_string();
        self
    }

    pub fn with_type(mut self, dialogue_type: DialogueType) -> Self {
        self.dialogue_type = dialogue_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stage(mut self, stage_index: u32) -> Self {
        self.stage_index = Some(stage_index);
        self
    }

    pub fn with_sender(mut self, sender_id: &str) -> Self {
        self.sender_id = Some(sender_id.to_string());
        self
    }

    pub fn with_receivers(mut self, receivers: &[&str]) -> Self {
        self.receiver_ids = receivers.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Case-insensitive substring match against the raw tag string
    pub fn has_tag(&self, needle: &str) -> bool {
        tags::contains_tag(&self.tags, needle)
    }

    /// Append comma-separated tags, keeping whatever was there
    pub fn append_tags(&mut self, extra: &[String]) {
        if extra.is_empty() {
            return;
        }
        let joined = extra.join(",");
        if self.tags.trim().is_empty() {
            self.tags = joined;
        } else {
            self.tags = format!("{},{}", self.tags, joined);
        }
    }

    pub fn has_mentions(&self) -> bool {
        !self.mentioned_ids.is_empty()
    }

    /// Eviction score: priority dominates, heat breaks near-ties
    pub fn priority_score(&self) -> f64 {
        f64::from(self.priority.weight()) * 100.0 + self.heat * 10.0
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

const CODE_TAGS: &[&str] = &["code_resource", "code", "script", "function"];

fn has_code_tag(tags: &str) -> bool {
    CODE_TAGS.iter().any(|t| tags::contains_tag(tags, t))
}

/// Priority from tags and mentions
pub fn determine_priority(event: &InboundEvent) -> Priority {
    if tags::contains_tag(&event.tags, "task_callback") || tags::contains_tag(&event.tags, "urgent") {
        return Priority::Urgent;
    }
    if has_code_tag(&event.tags) || !event.mentioned_ids.is_empty() {
        return Priority::High;
    }
    Priority::Normal
}

/// Dialogue type from tags, content and flags
pub fn determine_type(event: &InboundEvent) -> DialogueType {
    let raw_tags = &event.tags;
    if tags::contains_tag(raw_tags, "system") || tags::contains_tag(raw_tags, "task_callback") {
        return DialogueType::System;
    }
    if tags::contains_tag(raw_tags, "direct_creation") {
        return DialogueType::DirectCreation;
    }
    if has_code_tag(raw_tags) {
        return DialogueType::CodeResource;
    }
    if tags::parse_version_id(raw_tags).is_some() {
        return DialogueType::Iteration;
    }
    if is_code_content(&event.text) {
        return DialogueType::CodeResource;
    }
    if event.is_narration {
        return DialogueType::Narration;
    }
    if event.is_private {
        return DialogueType::Whisper;
    }
    if !event.mentioned_ids.is_empty() {
        return DialogueType::Mention;
    }
    DialogueType::Normal
}

static CODE_LINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // keyword-led statements that also carry code punctuation
        r"^\s*(import|from|return|def|class|function|const|let|var|if|for|while|try|catch|async|await)\b.*[(){}:;=]",
        r"(def\s+\w+\s*\(|class\s+\w+\s*[:(])",
        r"(^\s*#\s*\w|//|/\*|\*/)",
        r"^\s{2,}\S",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

const RESOURCE_MARKERS: &[&str] = &["@file:", "@description:", "@tags:", "@version:"];

/// Heuristic: does this text look like source code rather than chat?
pub fn is_code_content(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    if RESOURCE_MARKERS.iter().any(|m| text.contains(m)) {
        return true;
    }

    let lines: Vec<&str> = text.lines().collect();
    let matching = lines
        .iter()
        .filter(|line| CODE_LINE_PATTERNS.iter().any(|re| re.is_match(line)))
        .count();
    matching as f64 / lines.len() as f64 > 0.3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str, tags: &str) -> InboundEvent {
        InboundEvent {
            index: 1,
            scope_id: "opera-1".to_string(),
            text: text.to_string(),
            tags: tags.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_priority_weights_ascend() {
        assert!(Priority::Critical > Priority::Urgent);
        assert_eq!(Priority::Low.weight(), 1);
        assert_eq!(Priority::Critical.weight(), 5);
    }

    #[test]
    fn test_task_callback_is_urgent_system() {
        let e = event("{}", "TASK_CALLBACK");
        assert_eq!(determine_priority(&e), Priority::Urgent);
        assert_eq!(determine_type(&e), DialogueType::System);
    }

    #[test]
    fn test_mentions_raise_priority_and_type() {
        let mut e = event("hey can you look at this", "");
        e.mentioned_ids = vec!["staff-2".to_string()];
        assert_eq!(determine_priority(&e), Priority::High);
        assert_eq!(determine_type(&e), DialogueType::Mention);
    }

    #[test]
    fn test_flags_map_to_types() {
        let mut e = event("the lights dim", "");
        e.is_narration = true;
        assert_eq!(determine_type(&e), DialogueType::Narration);

        let mut e = event("psst", "");
        e.is_private = true;
        assert_eq!(determine_type(&e), DialogueType::Whisper);

        assert_eq!(determine_type(&event("hello everyone", "")), DialogueType::Normal);
    }

    #[test]
    fn test_version_tags_mean_iteration() {
        let e = event(
            "make the header red",
            r#"{"SelectedTextsFromViewer": [{"VersionId": "v-1"}]}"#,
        );
        assert_eq!(determine_type(&e), DialogueType::Iteration);
    }

    #[test]
    fn test_direct_creation_tag() {
        let e = event("@file: a.py\n---\nprint(1)", "direct_creation");
        assert_eq!(determine_type(&e), DialogueType::DirectCreation);
    }

    #[test]
    fn test_explicit_type_wins() {
        let mut e = event("hello", "system");
        e.dialogue_type = Some(DialogueType::Narration);
        let record = DialogueRecord::from_event(e);
        assert_eq!(record.dialogue_type, DialogueType::Narration);
        assert_eq!(record.heat, INITIAL_HEAT);
        assert_eq!(record.status, DialogueStatus::Pending);
    }

    #[test]
    fn test_code_detection() {
        assert!(is_code_content("def main():\n    print('hi')\n"));
        assert!(is_code_content("@file: x.js\nconsole.log(1)"));
        assert!(!is_code_content("Can you do this for me please"));
        assert!(!is_code_content(""));
    }

    #[test]
    fn test_from_event_dedups_receivers() {
        let mut e = event("hi", "");
        e.receiver_ids = vec!["a".into(), "b".into(), "a".into()];
        let record = DialogueRecord::from_event(e);
        assert_eq!(record.receiver_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_append_tags() {
        let mut record = DialogueRecord::new("s", 1, "x");
        record.append_tags(&["code_request".to_string()]);
        assert_eq!(record.tags, "code_request");
        record.append_tags(&["framework_vue".to_string(), "code_type_html".to_string()]);
        assert_eq!(record.tags, "code_request,framework_vue,code_type_html");
    }

    #[test]
    fn test_priority_score() {
        let record = DialogueRecord::new("s", 1, "x").with_priority(Priority::High);
        assert!((record.priority_score() - 310.0).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_intent_carries_reason() {
        let record = DialogueRecord::new("s", 1, "x");
        let intent = IntentAnalysis::degraded(&record, "unparseable");
        assert_eq!(intent.confidence, FALLBACK_CONFIDENCE);
        assert!(intent.intent.is_empty());
        assert_eq!(intent.reason(), Some("unparseable"));
        assert!(!intent.is_code_request());
    }

    #[test]
    fn test_inbound_event_camel_case() {
        let e: InboundEvent = serde_json::from_str(
            r#"{"index": 7, "scopeId": "op", "receiverIds": ["r"], "text": "hi", "stageIndex": 2}"#,
        )
        .unwrap();
        assert_eq!(e.index, 7);
        assert_eq!(e.scope_id, "op");
        assert_eq!(e.stage_index, Some(2));
        assert!(e.tags.is_empty());
    }
}
