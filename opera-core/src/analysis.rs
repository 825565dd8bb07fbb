// ABOUTME: Two-step classification of pooled dialogues: intent first, then conversational context.
// ABOUTME: Classifier failures degrade to low-confidence results and never abort a batch.

use crate::dialogue::{DialogueAnalysis, DialogueRecord, DialogueType, IntentAnalysis};
use crate::metrics;
use crate::mime;
use crate::pool::DialoguePool;
use crate::tags;
use crate::topic::TopicTracker;
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use opera_classifier::{
    Classifier, ClassifierRequest, CodeDetails, ContextEntry, ContextResponse, IntentResponse,
    ResourceRef,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

const GENERAL_CHAT: &str = "general chat";
const CODE_CONFIDENCE: f64 = 1.0;
const CHAT_CONFIDENCE: f64 = 0.8;

fn default_context_window() -> usize {
    10
}

fn default_max_concurrency() -> usize {
    8
}

/// `[analysis]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Dialogues taken from each stage for the context step
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Classifications in flight per scope
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    pub scopes: Vec<String>,
    pub analyzed: usize,
    pub degraded: usize,
}

/// Everything learned about one record, applied to the pool in a single step
#[derive(Debug)]
struct Classified {
    index: i64,
    analysis: DialogueAnalysis,
    upgrade_to_code: bool,
    derived_tags: Vec<String>,
}

pub struct AnalysisPipeline {
    classifier: Arc<dyn Classifier>,
    topics: Option<Arc<TopicTracker>>,
    config: AnalysisConfig,
}

impl AnalysisPipeline {
    pub fn new(classifier: Arc<dyn Classifier>, config: AnalysisConfig) -> Self {
        Self {
            classifier,
            topics: None,
            config,
        }
    }

    /// Resolve viewer version ids through tracked topics
    pub fn with_topics(mut self, topics: Arc<TopicTracker>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Analyze every scope currently flagged for reanalysis
    pub async fn analyze(&self, pool: &Mutex<DialoguePool>) -> AnalysisReport {
        let scopes = pool.lock().await.dirty_scopes();
        let mut report = AnalysisReport::default();
        for scope in scopes {
            let (analyzed, degraded) = self.analyze_scope(pool, &scope).await;
            report.analyzed += analyzed;
            report.degraded += degraded;
            report.scopes.push(scope);
        }
        report
    }

    /// Classify the scope's unanalyzed records, then clear its dirty flag.
    /// Returns (analyzed, degraded).
    pub async fn analyze_scope(&self, pool: &Mutex<DialoguePool>, scope_id: &str) -> (usize, usize) {
        let (pending, batch) = {
            let pool = pool.lock().await;
            let batch: Vec<DialogueRecord> = pool.scope_records(scope_id).into_iter().cloned().collect();
            (pool.unanalyzed(scope_id), batch)
        };

        let mut outcomes = Vec::with_capacity(pending.len());
        for chunk in pending.chunks(self.config.max_concurrency.max(1)) {
            outcomes.extend(join_all(chunk.iter().map(|record| self.classify(record, &batch))).await);
        }
        let analyzed = outcomes.len();

        let mut pool = pool.lock().await;
        let mut degraded = 0;
        for classified in outcomes {
            if classified.analysis.intent.reason().is_some() {
                degraded += 1;
            }
            apply(&mut pool, scope_id, classified);
        }
        pool.mark_analyzed(scope_id, Utc::now());

        tracing::debug!(scope = %scope_id, analyzed, degraded, "Scope analyzed");
        (analyzed, degraded)
    }

    /// Each step degrades on its own failures, so a record always gets a result
    async fn classify(&self, record: &DialogueRecord, batch: &[DialogueRecord]) -> Classified {
        let (intent, upgrade_to_code, derived_tags) = self.intent_step(record).await;
        let (related_indices, conversation_state) = self.context_step(record, batch, &intent).await;
        Classified {
            index: record.index,
            analysis: DialogueAnalysis {
                intent,
                related_indices,
                conversation_state,
                analyzed_at: Utc::now(),
            },
            upgrade_to_code,
            derived_tags,
        }
    }

    async fn call(&self, request: &ClassifierRequest) -> Result<String> {
        let mode = request.mode();
        match self.classifier.classify(request).await {
            Ok(raw) => {
                metrics::record_classifier_call(mode.as_str(), "ok");
                Ok(raw)
            }
            Err(e) => {
                metrics::record_classifier_call(mode.as_str(), "error");
                Err(e)
            }
        }
    }

    fn iteration_resources(&self, record: &DialogueRecord, version_id: Option<&str>) -> Vec<ResourceRef> {
        let mut resources = tags::extract_iteration_resources(&record.tags);
        if resources.is_empty() {
            if let (Some(version_id), Some(topics)) = (version_id, &self.topics) {
                resources = topics
                    .resolve_version_resources(version_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|f| ResourceRef {
                        file_path: f.file_path,
                        resource_id: f.resource_id,
                    })
                    .collect();
            }
        }
        let mut seen = HashSet::new();
        resources.retain(|r| seen.insert(r.resource_id.clone()));
        resources
    }

    /// Intent result, whether to upgrade to CODE_RESOURCE, and tags to append
    async fn intent_step(&self, record: &DialogueRecord) -> (IntentAnalysis, bool, Vec<String>) {
        let mut extra = Map::new();
        let request = if record.dialogue_type == DialogueType::Iteration {
            let version_id = tags::parse_version_id(&record.tags);
            let resources = self.iteration_resources(record, version_id.as_deref());
            extra.insert("version_id".to_string(), json!(version_id));
            extra.insert("resources".to_string(), json!(resources));
            ClassifierRequest::Iteration {
                requirement: record.text.clone(),
                version_id,
                resources,
            }
        } else {
            ClassifierRequest::Intent {
                text: record.text.clone(),
                dialogue_type: record.dialogue_type.as_str().to_string(),
                is_narration: record.is_narration,
                is_whisper: record.is_private,
                tags: tags::split_tags(&record.tags),
                has_mentions: record.has_mentions(),
                scope_id: Some(record.scope_id.clone()),
                stage_index: record.stage_index,
            }
        };

        let raw = match self.call(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(index = record.index, error = %e, "Intent classification failed");
                return (
                    IntentAnalysis::degraded(record, &format!("classifier call failed: {e}")),
                    false,
                    Vec::new(),
                );
            }
        };

        let mut response = match IntentResponse::parse(&raw) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(index = record.index, error = %e, "Unparseable intent output");
                return (
                    IntentAnalysis::degraded(record, &format!("unparseable intent output: {e}")),
                    false,
                    Vec::new(),
                );
            }
        };

        let intent = response.intent.trim();
        if intent.is_empty() || intent.eq_ignore_ascii_case(GENERAL_CHAT) {
            let reason = response
                .reason
                .clone()
                .unwrap_or_else(|| "no actionable intent".to_string());
            return (IntentAnalysis::degraded(record, &reason), false, Vec::new());
        }

        let mut derived = Vec::new();
        if response.is_code_request {
            fill_mime_types(&mut response.code_details);
            derived = code_tags(&response.code_details);
        }

        let confidence = if response.is_code_request {
            CODE_CONFIDENCE
        } else {
            CHAT_CONFIDENCE
        };
        let mut parameters = match serde_json::to_value(&response) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        parameters.extend(extra);

        let analysis = IntentAnalysis {
            intent: response.intent.clone(),
            confidence,
            parameters,
        };
        (analysis, response.is_code_request, derived)
    }

    fn context_window(&self, record: &DialogueRecord, batch: &[DialogueRecord]) -> Vec<ContextEntry> {
        let Some(stage) = record.stage_index else {
            return Vec::new();
        };
        let window = self.config.context_window;
        let take_recent = |stage: u32| {
            let same: Vec<&DialogueRecord> = batch
                .iter()
                .filter(|d| d.stage_index == Some(stage) && d.index != record.index)
                .collect();
            let skip = same.len().saturating_sub(window);
            same.into_iter().skip(skip).map(to_entry).collect::<Vec<_>>()
        };

        let mut entries = take_recent(stage);
        if stage > 1 {
            entries.extend(take_recent(stage - 1));
        }
        entries
    }

    /// Related indices plus conversation state; empty on any failure
    async fn context_step(
        &self,
        record: &DialogueRecord,
        batch: &[DialogueRecord],
        intent: &IntentAnalysis,
    ) -> (BTreeSet<i64>, Map<String, Value>) {
        let request = ClassifierRequest::Context {
            current: to_entry(record),
            window: self.context_window(record, batch),
        };

        let parsed = match self.call(&request).await {
            Ok(raw) => ContextResponse::parse(&raw),
            Err(e) => Err(e),
        };
        let response = match parsed {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(index = record.index, error = %e, "Context step produced no usable result");
                return (BTreeSet::new(), Map::new());
            }
        };

        let related: BTreeSet<i64> = response
            .related_indices()
            .into_iter()
            .filter(|i| *i != record.index)
            .collect();

        let flow = &response.conversation_flow;
        let mut state = Map::new();
        state.insert("flow".to_string(), json!(flow));
        state.insert(
            "topic".to_string(),
            json!({
                "id": flow.topic_id,
                "type": flow.topic_type,
                "name": flow.current_topic,
            }),
        );
        state.insert("decision_points".to_string(), json!(response.decision_points));
        if let Some(code_context) = &response.code_context {
            state.insert("code_context".to_string(), code_context.clone());
        }
        if !intent.intent.is_empty() {
            state.insert("intent".to_string(), json!(intent.intent));
        }
        (related, state)
    }
}

fn to_entry(record: &DialogueRecord) -> ContextEntry {
    ContextEntry {
        index: record.index,
        text: record.text.clone(),
        stage_index: record.stage_index,
        sender_id: record.sender_id.clone(),
    }
}

fn fill_mime_types(details: &mut CodeDetails) {
    for resource in &mut details.resources {
        if resource.mime_type.is_none() {
            resource.mime_type = Some(mime::mime_for_path(&resource.file_path).to_string());
        }
    }
}

/// `code_request`, one `code_type_*` per distinct resource type, one `framework_*` per framework
fn code_tags(details: &CodeDetails) -> Vec<String> {
    let mut out = vec!["code_request".to_string()];
    let mut types: Vec<String> = Vec::new();
    for resource in &details.resources {
        let t = resource.resource_type.trim().to_lowercase();
        if !t.is_empty() && !types.contains(&t) {
            types.push(t);
        }
    }
    if types.is_empty() {
        if let Some(t) = details.code_type.as_deref().map(|t| t.trim().to_lowercase()) {
            if !t.is_empty() {
                types.push(t);
            }
        }
    }
    out.extend(types.into_iter().map(|t| format!("code_type_{t}")));
    out.extend(
        details
            .frameworks
            .iter()
            .map(|f| format!("framework_{}", f.trim().to_lowercase())),
    );
    out
}

fn apply(pool: &mut DialoguePool, scope_id: &str, classified: Classified) {
    let Classified {
        index,
        analysis,
        upgrade_to_code,
        derived_tags,
    } = classified;
    let related: Vec<i64> = analysis.related_indices.iter().copied().collect();

    let Some(record) = pool.get_mut(scope_id, index) else {
        tracing::debug!(scope = %scope_id, index, "Record evicted before analysis landed");
        return;
    };
    record.append_tags(&derived_tags);
    if upgrade_to_code {
        record.dialogue_type = DialogueType::CodeResource;
    }
    record.analysis = Some(analysis);

    for related_index in related {
        if let Some(heat) = pool.boost_heat(scope_id, related_index) {
            tracing::trace!(scope = %scope_id, index = related_index, heat, "Boosted related dialogue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use opera_classifier::backends::mock::MockClassifier;
    use opera_classifier::ClassifierMode;

    fn pool() -> Mutex<DialoguePool> {
        Mutex::new(DialoguePool::new(PoolConfig {
            heat_decay_rate: 0.0,
            ..Default::default()
        }))
    }

    fn context_json(topic: &str, points: &[(i64, &str)]) -> String {
        let points: Vec<Value> = points
            .iter()
            .map(|(i, t)| json!({"dialogue_index": i, "topic_id": t}))
            .collect();
        json!({
            "conversation_flow": {"topic_id": topic, "topic_type": "CODE_RESOURCE", "current_topic": "site"},
            "decision_points": points,
        })
        .to_string()
    }

    #[test]
    fn test_code_tags() {
        let details: CodeDetails = serde_json::from_value(json!({
            "frameworks": ["Vue", "Tailwind"],
            "resources": [
                {"file_path": "a.html", "type": "HTML"},
                {"file_path": "b.html", "type": "html"},
                {"file_path": "c.js", "type": "JavaScript"}
            ]
        }))
        .unwrap();
        assert_eq!(
            code_tags(&details),
            vec![
                "code_request",
                "code_type_html",
                "code_type_javascript",
                "framework_vue",
                "framework_tailwind"
            ]
        );
    }

    #[tokio::test]
    async fn test_code_request_upgrades_record() {
        let mock = MockClassifier::new()
            .on(ClassifierMode::Intent, "build")
            .respond_json(json!({
                "intent": "build a landing page",
                "is_code_request": true,
                "code_details": {"frameworks": ["Vue"], "resources": [{"file_path": "/src/index.html", "type": "html"}]}
            }))
            .fallback(ClassifierMode::Context, &context_json("t1", &[]));
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        pool.lock().await.add(DialogueRecord::new("op", 1, "build me a site"));

        let report = pipeline.analyze(&pool).await;
        assert_eq!(report.analyzed, 1);
        assert_eq!(report.degraded, 0);

        let pool = pool.lock().await;
        let record = pool.get_by_index("op", 1).unwrap();
        assert_eq!(record.dialogue_type, DialogueType::CodeResource);
        assert_eq!(record.tags, "code_request,code_type_html,framework_vue");
        let analysis = record.analysis.as_ref().unwrap();
        assert_eq!(analysis.intent.confidence, CODE_CONFIDENCE);
        assert_eq!(
            analysis.intent.code_details().resources[0].mime_type.as_deref(),
            Some("text/html")
        );
        assert_eq!(analysis.topic(), Some(("t1".to_string(), "CODE_RESOURCE".to_string())));
        assert!(pool.dirty_scopes().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_output_degrades() {
        let mock = MockClassifier::new()
            .fallback(ClassifierMode::Intent, "I think the user wants {{{ nonsense")
            .fallback(ClassifierMode::Context, "not json at all");
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        pool.lock().await.add(DialogueRecord::new("op", 1, "hello"));

        let report = pipeline.analyze(&pool).await;
        assert_eq!(report.degraded, 1);

        let pool = pool.lock().await;
        let analysis = pool.get_by_index("op", 1).unwrap().analysis.clone().unwrap();
        assert_eq!(analysis.intent.confidence, crate::dialogue::FALLBACK_CONFIDENCE);
        assert!(analysis.intent.reason().is_some());
        assert!(analysis.related_indices.is_empty());
        assert!(pool.dirty_scopes().is_empty());
    }

    #[tokio::test]
    async fn test_general_chat_degrades_with_reason() {
        let mock = MockClassifier::new()
            .fallback(ClassifierMode::Intent, r#"{"intent": "General Chat"}"#)
            .fallback(ClassifierMode::Context, &context_json("t", &[]));
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        pool.lock().await.add(DialogueRecord::new("op", 1, "hey"));
        pipeline.analyze(&pool).await;

        let pool = pool.lock().await;
        let intent = pool.get_by_index("op", 1).unwrap().analysis.clone().unwrap().intent;
        assert!(intent.intent.is_empty());
        assert_eq!(intent.reason(), Some("no actionable intent"));
    }

    #[tokio::test]
    async fn test_missing_decision_points_yields_empty_set() {
        let mock = MockClassifier::new()
            .fallback(ClassifierMode::Intent, r#"{"intent": "discuss"}"#)
            .fallback(
                ClassifierMode::Context,
                r#"{"conversation_flow": {"topic_id": "t", "topic_type": "x", "current_topic": "y"}}"#,
            );
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        pool.lock().await.add(DialogueRecord::new("op", 1, "let's talk"));
        pipeline.analyze(&pool).await;

        let pool = pool.lock().await;
        let analysis = pool.get_by_index("op", 1).unwrap().analysis.clone().unwrap();
        assert!(analysis.related_indices.is_empty());
        assert_eq!(analysis.intent.confidence, CHAT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_related_dialogues_boosted_by_topic() {
        let mock = MockClassifier::new()
            .fallback(ClassifierMode::Intent, r#"{"intent": "discuss"}"#)
            .fallback(ClassifierMode::Context, &context_json("t", &[]))
            .on(ClassifierMode::Context, "third")
            .respond(&context_json("t", &[(1, "t"), (2, "other"), (3, "t")]));
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        {
            let mut p = pool.lock().await;
            p.add(DialogueRecord::new("op", 1, "first").with_stage(1));
            p.add(DialogueRecord::new("op", 2, "second").with_stage(1));
        }
        pipeline.analyze(&pool).await;
        pool.lock().await.add(DialogueRecord::new("op", 3, "third").with_stage(1));
        pipeline.analyze(&pool).await;

        let pool = pool.lock().await;
        let third = pool.get_by_index("op", 3).unwrap().analysis.clone().unwrap();
        assert_eq!(third.related_indices.into_iter().collect::<Vec<_>>(), vec![1]);
        assert!((pool.get_by_index("op", 1).unwrap().heat - 1.3).abs() < 1e-9);
        assert!((pool.get_by_index("op", 2).unwrap().heat - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_context_window_uses_current_and_previous_stage() {
        let mock = Arc::new(
            MockClassifier::new()
                .fallback(ClassifierMode::Intent, r#"{"intent": "discuss"}"#)
                .fallback(ClassifierMode::Context, &context_json("t", &[])),
        );
        let pipeline = AnalysisPipeline::new(
            mock.clone(),
            AnalysisConfig {
                context_window: 2,
                max_concurrency: 4,
            },
        );
        let pool = pool();
        {
            let mut p = pool.lock().await;
            for i in 0..4 {
                p.add(DialogueRecord::new("op", i, "stage one").with_stage(1));
            }
            for i in 4..7 {
                p.add(DialogueRecord::new("op", i, "stage two").with_stage(2));
            }
            p.add(DialogueRecord::new("op", 7, "unstaged"));
        }
        pipeline.analyze(&pool).await;

        let windows: Vec<(i64, Vec<i64>)> = mock
            .calls_for(ClassifierMode::Context)
            .into_iter()
            .filter_map(|r| match r {
                ClassifierRequest::Context { current, window } => {
                    Some((current.index, window.iter().map(|e| e.index).collect()))
                }
                _ => None,
            })
            .collect();
        let for_index = |i: i64| windows.iter().find(|(c, _)| *c == i).map(|(_, w)| w.clone());

        assert_eq!(for_index(6), Some(vec![4, 5, 2, 3]));
        assert_eq!(for_index(0), Some(vec![2, 3]));
        assert_eq!(for_index(7), Some(vec![]));
    }

    #[tokio::test]
    async fn test_iteration_uses_tag_resources() {
        let mock = Arc::new(
            MockClassifier::new()
                .fallback(ClassifierMode::Iteration, r#"{"intent": "restyle header"}"#)
                .fallback(ClassifierMode::Context, &context_json("t", &[])),
        );
        let pipeline = AnalysisPipeline::new(mock.clone(), AnalysisConfig::default());
        let pool = pool();
        let record = DialogueRecord::new("op", 1, "make the header red")
            .with_type(DialogueType::Iteration)
            .with_tags(r#"{"ResourcesForViewing": {"VersionId": "v1", "Resources": [{"Url": "/index.html", "ResourceId": "r1"}]}}"#);
        pool.lock().await.add(record);
        pipeline.analyze(&pool).await;

        let calls = mock.calls_for(ClassifierMode::Iteration);
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            ClassifierRequest::Iteration {
                version_id,
                resources,
                ..
            } => {
                assert_eq!(version_id.as_deref(), Some("v1"));
                assert_eq!(resources[0].resource_id, "r1");
            }
            other => panic!("unexpected request {other:?}"),
        }
        let pool = pool.lock().await;
        let record = pool.get_by_index("op", 1).unwrap();
        assert_eq!(record.dialogue_type, DialogueType::Iteration);
        assert_eq!(
            record.analysis.as_ref().unwrap().intent.parameters["version_id"],
            "v1"
        );
    }

    #[tokio::test]
    async fn test_classifier_error_isolated_per_record() {
        let mock = MockClassifier::new()
            .on(ClassifierMode::Intent, "boom")
            .respond_error("backend offline")
            .fallback(ClassifierMode::Intent, r#"{"intent": "discuss"}"#)
            .fallback(ClassifierMode::Context, &context_json("t", &[]));
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        {
            let mut p = pool.lock().await;
            p.add(DialogueRecord::new("op", 1, "boom"));
            p.add(DialogueRecord::new("op", 2, "fine"));
        }
        let report = pipeline.analyze(&pool).await;
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.degraded, 1);

        let pool = pool.lock().await;
        let failed = pool.get_by_index("op", 1).unwrap().analysis.clone().unwrap();
        assert!(failed.intent.reason().unwrap_or_default().contains("backend offline"));
        let ok = pool.get_by_index("op", 2).unwrap().analysis.clone().unwrap();
        assert_eq!(ok.intent.intent, "discuss");
    }

    #[tokio::test]
    async fn test_context_failure_keeps_intent() {
        let mock = MockClassifier::new()
            .fallback(ClassifierMode::Intent, r#"{"intent": "discuss"}"#)
            .on(ClassifierMode::Context, "lonely")
            .respond_error("context offline")
            .fallback(ClassifierMode::Context, &context_json("t", &[]));
        let pipeline = AnalysisPipeline::new(Arc::new(mock), AnalysisConfig::default());
        let pool = pool();
        pool.lock().await.add(DialogueRecord::new("op", 1, "lonely"));

        let report = pipeline.analyze(&pool).await;
        assert_eq!(report.analyzed, 1);
        assert_eq!(report.degraded, 0);

        let pool = pool.lock().await;
        let analysis = pool.get_by_index("op", 1).unwrap().analysis.clone().unwrap();
        assert_eq!(analysis.intent.intent, "discuss");
        assert!(analysis.related_indices.is_empty());
        assert!(analysis.conversation_state.is_empty());
        assert!(pool.dirty_scopes().is_empty());
    }
}
