// ABOUTME: Turns classified dialogue records into typed tasks and picks the worker identity for each.
// ABOUTME: Dialogue type maps to a derivation function through an exhaustive match.

use crate::dialogue::{DialogueRecord, DialogueType, Priority};
use crate::metrics;
use crate::mime;
use crate::registry::{WorkerEntry, WorkerRegistry};
use crate::resource::parse_resource_block;
use crate::tags;
use crate::task::{Task, TaskType};
use opera_classifier::response::parse_matcher_selection;
use opera_classifier::{Classifier, ClassifierRequest, CodeDetails, ResourceSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, RwLock};

/// Target file when neither the header nor the classifier names one
pub const DEFAULT_FILE_PATH: &str = "src/code/main.py";
const DEFAULT_CODE_TYPE: &str = "python";
pub const CALLBACK_TAG: &str = "task_callback";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no handler for {task_type} task from dialogue {index} in scope {scope_id}")]
    NoHandler {
        scope_id: String,
        index: i64,
        task_type: TaskType,
    },
}

/// Everything routing needs that outlives a single call
pub struct RouterContext {
    registry: RwLock<WorkerRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
    rng: Mutex<StdRng>,
}

impl RouterContext {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
            classifier: None,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Classifier used in matcher mode to pick between several candidates
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Deterministic fallback picks, for tests
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn register_worker(&self, entry: WorkerEntry) {
        tracing::info!(worker_id = %entry.worker_id, scopes = ?entry.scope_ids, "Worker registered");
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(entry);
    }

    /// Worker that answers to `staff_id` in the scope
    pub fn worker_for_staff(&self, scope_id: &str, staff_id: &str) -> Option<WorkerEntry> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .worker_for_staff(scope_id, staff_id)
            .cloned()
    }

    fn pick_random(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let i = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0..candidates.len());
        candidates.get(i).cloned()
    }
}

/// Inputs shared by every derivation function
struct Derivation<'a> {
    record: &'a DialogueRecord,
    related: &'a [DialogueRecord],
}

type DeriveFn = for<'a, 'b> fn(&'a Derivation<'b>) -> Vec<Task>;

fn derivation_for(dialogue_type: DialogueType) -> DeriveFn {
    match dialogue_type {
        DialogueType::DirectCreation => derive_direct_creation,
        DialogueType::CodeResource => derive_code_resource,
        DialogueType::Iteration => derive_iteration,
        DialogueType::System => derive_system,
        DialogueType::Whisper | DialogueType::Mention => derive_chat_response,
        DialogueType::Narration => derive_analysis,
        DialogueType::Normal => derive_conversation,
    }
}

pub struct Router {
    ctx: Arc<RouterContext>,
}

impl Router {
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    /// Derive the tasks for one record.
    ///
    /// Resource tasks are only returned once a handler is known for each; if any
    /// resource task has no handler, nothing is returned.
    pub async fn derive_tasks(
        &self,
        record: &DialogueRecord,
        related: &[DialogueRecord],
    ) -> Result<Vec<Task>, RoutingError> {
        let derivation = Derivation { record, related };

        if record.has_tag(CALLBACK_TAG) {
            return Ok(vec![finish(record, derive_callback(&derivation), false)]);
        }

        let mut tasks = Vec::new();
        for task in derivation_for(record.dialogue_type)(&derivation) {
            let mut task = finish(record, task, true);
            if task.task_type.is_resource() {
                let hint = matcher_hint(&task);
                match self.select_handler(record, &hint).await {
                    Some(handler) => task.response_staff_id = Some(handler),
                    None => {
                        tracing::warn!(
                            scope = %record.scope_id,
                            index = record.index,
                            task_type = %task.task_type,
                            "No handler for resource task"
                        );
                        return Err(RoutingError::NoHandler {
                            scope_id: record.scope_id.clone(),
                            index: record.index,
                            task_type: task.task_type,
                        });
                    }
                }
            } else {
                task.response_staff_id = record.receiver_ids.first().cloned();
            }
            tasks.push(task);
        }

        for task in &tasks {
            tracing::debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                handler = ?task.response_staff_id,
                "Task derived"
            );
        }
        Ok(tasks)
    }

    /// Pick the worker identity that should handle work from `record`
    pub async fn select_handler(&self, record: &DialogueRecord, code_details: &Value) -> Option<String> {
        let scope = record.scope_id.as_str();
        let (entries, candidates) = {
            let registry = self.ctx.registry.read().unwrap_or_else(|e| e.into_inner());
            let entries: Vec<WorkerEntry> = registry.for_scope(scope).into_iter().cloned().collect();
            (entries, registry.candidates(scope))
        };

        if let [only] = entries.as_slice() {
            if let Some(first) = only.staff_ids(scope).first() {
                return Some(first.clone());
            }
        }
        match candidates.len() {
            0 => self.receiver_fallback(record),
            1 => candidates.into_iter().next(),
            _ => Some(self.match_candidate(code_details, candidates).await),
        }
    }

    async fn match_candidate(&self, code_details: &Value, candidates: Vec<String>) -> String {
        let first = candidates.first().cloned().unwrap_or_default();
        let Some(classifier) = &self.ctx.classifier else {
            tracing::warn!(?candidates, "No matcher configured, using first candidate");
            return first;
        };

        let request = ClassifierRequest::Matcher {
            code_details: code_details.clone(),
            candidates: candidates.clone(),
        };
        let raw = match classifier.classify(&request).await {
            Ok(raw) => {
                metrics::record_classifier_call("matcher", "ok");
                raw
            }
            Err(e) => {
                metrics::record_classifier_call("matcher", "error");
                tracing::warn!(error = %e, "Matcher call failed, using first candidate");
                return first;
            }
        };
        match parse_matcher_selection(&raw, &candidates) {
            Some(selected) => selected,
            None => {
                tracing::warn!(output = %raw, "Matcher named no candidate, using first candidate");
                first
            }
        }
    }

    fn receiver_fallback(&self, record: &DialogueRecord) -> Option<String> {
        let remaining: Vec<String> = record
            .receiver_ids
            .iter()
            .filter(|r| Some(r.as_str()) != record.sender_id.as_deref())
            .cloned()
            .collect();
        match remaining.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            _ => self.ctx.pick_random(&remaining),
        }
    }
}

/// Stamp provenance on a derived task
fn finish(record: &DialogueRecord, task: Task, with_topic: bool) -> Task {
    let mut task = task.with_scope(record.scope_id.clone());
    task.source_dialogue_index = Some(record.index);
    task.source_staff_id = record.sender_id.clone();
    if with_topic {
        if let Some((id, topic_type)) = record.analysis.as_ref().and_then(|a| a.topic()) {
            if !id.is_empty() {
                task = task.with_topic(id, topic_type);
            }
        }
    }
    task
}

/// What the matcher sees about a resource task
fn matcher_hint(task: &Task) -> Value {
    json!({
        "file_path": task.parameters.get("file_path"),
        "file_type": task.parameters.get("file_type"),
        "code_details": task.parameters.get("code_details"),
    })
}

fn intent_value(record: &DialogueRecord) -> Value {
    record
        .analysis
        .as_ref()
        .and_then(|a| serde_json::to_value(&a.intent).ok())
        .unwrap_or(Value::Null)
}

fn base_params(record: &DialogueRecord) -> Map<String, Value> {
    let (related, state) = record
        .analysis
        .as_ref()
        .map(|a| (json!(a.related_indices), Value::Object(a.conversation_state.clone())))
        .unwrap_or((json!([]), json!({})));

    let mut params = Map::new();
    params.insert("text".into(), json!(record.text));
    params.insert("tags".into(), json!(record.tags));
    params.insert("mentioned_staff_ids".into(), json!(record.mentioned_ids));
    params.insert("dialogue_type".into(), json!(record.dialogue_type));
    params.insert("intent".into(), intent_value(record));
    params.insert(
        "context".into(),
        json!({
            "stage_index": record.stage_index,
            "related_dialogue_indices": related,
            "conversation_state": state,
        }),
    );
    params.insert("opera_id".into(), json!(record.scope_id));
    params
}

fn simple(d: &Derivation<'_>, task_type: TaskType, description: &str) -> Vec<Task> {
    vec![Task::new(task_type, description)
        .with_priority(d.record.priority)
        .with_parameters(base_params(d.record))]
}

fn derive_system(d: &Derivation<'_>) -> Vec<Task> {
    simple(d, TaskType::System, "Handle system message")
}

fn derive_chat_response(d: &Derivation<'_>) -> Vec<Task> {
    simple(d, TaskType::ChatResponse, "Respond to dialogue")
}

fn derive_analysis(d: &Derivation<'_>) -> Vec<Task> {
    simple(d, TaskType::Analysis, "Analyze narration")
}

fn derive_conversation(d: &Derivation<'_>) -> Vec<Task> {
    simple(d, TaskType::Conversation, "Continue conversation")
}

/// URGENT system task, promoted to CALLBACK when the body names a task type
fn derive_callback(d: &Derivation<'_>) -> Task {
    let mut params = base_params(d.record);
    let mut task_type = TaskType::System;
    let mut description = "Handle task callback".to_string();

    if let Ok(Value::Object(body)) = serde_json::from_str::<Value>(d.record.text.trim()) {
        let named = body
            .get("type")
            .and_then(Value::as_str)
            .and_then(TaskType::from_name);
        if named.is_some() {
            task_type = TaskType::Callback;
        }
        if let Some(Value::Object(extra)) = body.get("parameters") {
            params.extend(extra.clone());
        }
        if let Some(text) = body.get("description").and_then(Value::as_str) {
            description = text.to_string();
        }
    }

    let mut task = Task::new(task_type, description)
        .with_priority(Priority::Urgent)
        .with_parameters(params);
    task.response_staff_id = d.record.receiver_ids.first().cloned();
    task
}

fn creation_task(record: &DialogueRecord, fallback_path: Option<String>, priority: Priority) -> Task {
    let block = parse_resource_block(&record.text);
    let file_path = block
        .file_path()
        .map(str::to_string)
        .or(fallback_path)
        .unwrap_or_else(|| DEFAULT_FILE_PATH.to_string());
    let description = block
        .description()
        .unwrap_or_else(|| format!("Create {file_path}"));

    let mut params = base_params(record);
    params.insert("resource_type".into(), json!("code"));
    params.insert("file_path".into(), json!(file_path));
    params.insert("mime_type".into(), json!(mime::mime_for_path(&file_path)));
    params.insert("description".into(), json!(description));
    params.insert("tags".into(), json!(block.tags()));
    params.insert("code_content".into(), json!(block.code));

    Task::new(TaskType::ResourceCreation, format!("Create resource {file_path}"))
        .with_priority(priority)
        .with_parameters(params)
}

fn derive_direct_creation(d: &Derivation<'_>) -> Vec<Task> {
    vec![creation_task(d.record, None, Priority::High)]
}

fn derive_code_resource(d: &Derivation<'_>) -> Vec<Task> {
    let intent = d.record.analysis.as_ref().map(|a| &a.intent);
    match intent {
        Some(intent) if intent.is_code_request() => derive_generation(d, intent.code_details()),
        _ => {
            let declared = intent
                .map(|i| i.code_details())
                .and_then(|c| c.resources.into_iter().next())
                .map(|r| r.file_path)
                .filter(|p| !p.is_empty());
            vec![creation_task(d.record, declared, d.record.priority)]
        }
    }
}

fn default_resource(details: &CodeDetails) -> ResourceSpec {
    let file_path = details
        .file_path
        .clone()
        .unwrap_or_else(|| DEFAULT_FILE_PATH.to_string());
    ResourceSpec {
        mime_type: Some(mime::mime_for_path(&file_path).to_string()),
        resource_type: details
            .code_type
            .clone()
            .unwrap_or_else(|| DEFAULT_CODE_TYPE.to_string()),
        description: details.project_description.clone().unwrap_or_default(),
        file_path,
        ..Default::default()
    }
}

fn dialogue_context(d: &Derivation<'_>) -> Value {
    let record = d.record;
    let analysis = record.analysis.as_ref();
    let related: Vec<Value> = d
        .related
        .iter()
        .map(|r| {
            json!({
                "index": r.index,
                "text": r.text,
                "type": r.dialogue_type,
                "tags": r.tags,
                "intent": r.analysis.as_ref().map(|a| a.intent.intent.clone()),
            })
        })
        .collect();
    json!({
        "text": record.text,
        "type": record.dialogue_type,
        "tags": record.tags,
        "intent": intent_value(record),
        "stage_index": record.stage_index,
        "related_dialogue_indices": analysis.map(|a| json!(a.related_indices)).unwrap_or(json!([])),
        "conversation_state": analysis.map(|a| Value::Object(a.conversation_state.clone())).unwrap_or(json!({})),
        "topic": analysis.and_then(|a| a.conversation_state.get("topic").cloned()),
        "related_dialogues": related,
    })
}

fn derive_generation(d: &Derivation<'_>, details: CodeDetails) -> Vec<Task> {
    let resources = if details.resources.is_empty() {
        vec![default_resource(&details)]
    } else {
        details.resources.clone()
    };
    let context = dialogue_context(d);
    let parent = tags::parse_version_id(&d.record.tags);
    let summary = json!({
        "project_type": details.project_type,
        "project_description": details.project_description,
        "requirements": details.requirements,
        "frameworks": details.frameworks,
        "resources": resources,
    });

    resources
        .iter()
        .map(|resource| {
            let mime_type = resource
                .mime_type
                .clone()
                .unwrap_or_else(|| mime::mime_for_path(&resource.file_path).to_string());
            let mut params = Map::new();
            params.insert("file_path".into(), json!(resource.file_path));
            params.insert("file_type".into(), json!(resource.resource_type));
            params.insert("mime_type".into(), json!(mime_type));
            params.insert("description".into(), json!(resource.description));
            params.insert("references".into(), json!(resource.references));
            if let Some(action) = &resource.action {
                params.insert("action".into(), json!(action));
            }
            params.insert("code_details".into(), summary.clone());
            params.insert("dialogue_context".into(), context.clone());
            params.insert("opera_id".into(), json!(d.record.scope_id));
            if let Some(parent) = &parent {
                params.insert("parentTopicId".into(), json!(parent));
            }

            Task::new(
                TaskType::ResourceGeneration,
                format!("Generate {}", resource.file_path),
            )
            .with_priority(d.record.priority)
            .with_parameters(params)
        })
        .collect()
}

fn derive_iteration(d: &Derivation<'_>) -> Vec<Task> {
    let record = d.record;
    let mut params = base_params(record);
    params.insert("requirement".into(), json!(record.text));
    if let Some(version_id) = tags::parse_version_id(&record.tags) {
        params.insert("parentTopicId".into(), json!(version_id));
    }
    let resources = record
        .analysis
        .as_ref()
        .and_then(|a| a.intent.parameters.get("resources").cloned())
        .unwrap_or_else(|| json!(tags::extract_iteration_resources(&record.tags)));
    params.insert("resources".into(), resources);

    vec![Task::new(TaskType::ResourceIteration, "Iterate on existing resources")
        .with_priority(record.priority)
        .with_parameters(params)]
}
