// ABOUTME: Topic tracker: groups tasks by topic, keeps a version lineage of resource files
// ABOUTME: and fires one completion notification once every registered task has completed.

use crate::mime;
use crate::task::{Task, TaskStatus, TaskStatusListener};
use crate::metrics;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_path: String,
    pub resource_id: String,
}

/// Snapshot of which resource files a topic touched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub parent_version: Option<String>,
    pub modified_files: Vec<FileEntry>,
    pub current_files: Vec<FileEntry>,
    pub deleted_files: Vec<FileEntry>,
    pub description: String,
}

impl VersionMeta {
    fn upsert(files: &mut Vec<FileEntry>, entry: FileEntry) {
        match files.iter_mut().find(|f| f.file_path == entry.file_path) {
            Some(existing) => *existing = entry,
            None => files.push(entry),
        }
    }

    fn record_write(&mut self, entry: FileEntry) {
        Self::upsert(&mut self.current_files, entry.clone());
        Self::upsert(&mut self.modified_files, entry);
    }

    fn record_delete(&mut self, file_path: &str, resource_id: &str) {
        let removed = self
            .current_files
            .iter()
            .position(|f| f.file_path == file_path)
            .map(|pos| self.current_files.remove(pos));
        self.modified_files.retain(|f| f.file_path != file_path);
        let entry = removed.unwrap_or_else(|| FileEntry {
            file_path: file_path.to_string(),
            resource_id: resource_id.to_string(),
        });
        Self::upsert(&mut self.deleted_files, entry);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone)]
struct PendingResource {
    file_path: String,
    action: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub topic_id: String,
    pub topic_type: String,
    pub scope_id: Option<String>,
    pub task_ids: HashSet<Uuid>,
    pub completed_task_ids: HashSet<Uuid>,
    pub status: TopicStatus,
    pub current_version: VersionMeta,
    pending_resources: HashMap<Uuid, PendingResource>,
}

impl TopicInfo {
    pub fn is_done(&self) -> bool {
        !self.task_ids.is_empty() && self.task_ids == self.completed_task_ids
    }
}

/// Payload handed to completion listeners
#[derive(Debug, Clone, PartialEq)]
pub struct TopicCompletion {
    pub topic_id: String,
    pub topic_type: String,
    pub scope_id: Option<String>,
    pub version: VersionMeta,
}

impl TopicCompletion {
    /// Resources announced to viewers: modified files when any, otherwise everything
    fn announced(&self) -> (&[FileEntry], bool) {
        if self.version.modified_files.is_empty() {
            (&self.version.current_files, true)
        } else {
            (&self.version.modified_files, false)
        }
    }

    /// Index of the page a viewer should open first
    pub fn navigate_index(&self) -> Option<usize> {
        let (files, _) = self.announced();
        files
            .iter()
            .position(|f| mime::is_html(&f.file_path) && f.file_path.ends_with("index.html"))
            .or_else(|| files.iter().position(|f| mime::is_html(&f.file_path)))
    }

    /// The aggregated resource-change message body
    pub fn descriptor(&self) -> Value {
        let (files, replace_all) = self.announced();
        let resources: Vec<Value> = files
            .iter()
            .map(|f| {
                json!({
                    "Url": f.file_path,
                    "ResourceId": f.resource_id,
                    "ResourceCacheable": true,
                })
            })
            .collect();

        let mut viewing = Map::new();
        viewing.insert("VersionId".to_string(), json!(self.topic_id));
        viewing.insert("Resources".to_string(), Value::Array(resources));
        viewing.insert(
            "CurrentVersion".to_string(),
            json!({
                "parent_version": self.version.parent_version,
                "modified_files": self.version.modified_files,
                "current_files": self.version.current_files,
                "deleted_files": self.version.deleted_files,
                "description": self.version.description,
            }),
        );
        if let Some(index) = self.navigate_index() {
            viewing.insert("NavigateIndex".to_string(), json!(index));
        }

        let mut root = Map::new();
        root.insert("ResourcesForViewing".to_string(), Value::Object(viewing));
        if replace_all {
            root.insert("RemovingAllResources".to_string(), Value::Bool(true));
        }
        if !self.version.deleted_files.is_empty() {
            let paths: Vec<&str> = self
                .version
                .deleted_files
                .iter()
                .map(|f| f.file_path.as_str())
                .collect();
            root.insert("RemovingResources".to_string(), json!(paths));
        }
        Value::Object(root)
    }
}

#[async_trait]
pub trait TopicCompletionListener: Send + Sync {
    async fn on_topic_completed(&self, completion: &TopicCompletion) -> Result<()>;
}

#[derive(Default)]
pub struct TopicTracker {
    topics: Mutex<HashMap<String, TopicInfo>>,
    listeners: RwLock<Vec<Arc<dyn TopicCompletionListener>>>,
}

impl TopicTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_completion(&self, listener: Arc<dyn TopicCompletionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Register a task under its topic; tasks without a topic are ignored
    pub fn add_task(&self, task: &Task) {
        let Some(topic_id) = task.topic_id.as_deref() else {
            return;
        };
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());

        if !topics.contains_key(topic_id) {
            let parent = task.param_str("parentTopicId").map(str::to_string);
            let inherited = parent
                .as_deref()
                .and_then(|p| topics.get(p))
                .map(|t| t.current_version.current_files.clone())
                .unwrap_or_default();
            let scope_id = task
                .scope_id
                .clone()
                .or_else(|| task.param_str("opera_id").map(str::to_string));

            tracing::debug!(topic_id, parent = ?parent, "Tracking new topic");
            topics.insert(
                topic_id.to_string(),
                TopicInfo {
                    topic_id: topic_id.to_string(),
                    topic_type: task.topic_type.clone().unwrap_or_default(),
                    scope_id,
                    task_ids: HashSet::new(),
                    completed_task_ids: HashSet::new(),
                    status: TopicStatus::Active,
                    current_version: VersionMeta {
                        parent_version: parent,
                        current_files: inherited,
                        description: task.description.clone(),
                        ..Default::default()
                    },
                    pending_resources: HashMap::new(),
                },
            );
        }

        let Some(topic) = topics.get_mut(topic_id) else {
            return;
        };
        if topic.status == TopicStatus::Completed {
            tracing::info!(
                topic_id,
                task_id = %task.id,
                "Task registered on an already completed topic; completion will not fire again"
            );
        }
        topic.task_ids.insert(task.id);

        if task.task_type.is_resource() {
            if let Some(file_path) = task.param_str("file_path") {
                topic.pending_resources.insert(
                    task.id,
                    PendingResource {
                        file_path: file_path.to_string(),
                        action: task.param_str("action").map(str::to_string),
                    },
                );
            }
        }
    }

    /// Record a status change and notify listeners if it completed the topic
    pub async fn handle_status(&self, task: &Task, status: TaskStatus) {
        let completion = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            let Some(topic) = topics
                .values_mut()
                .find(|t| t.task_ids.contains(&task.id))
            else {
                return;
            };
            if status != TaskStatus::Completed {
                return;
            }

            topic.completed_task_ids.insert(task.id);
            apply_lineage(topic, task);

            if topic.status != TopicStatus::Active || !topic.is_done() {
                return;
            }
            // Fired-once guard: flip before notifying so nothing can re-enter
            topic.status = TopicStatus::Completed;
            TopicCompletion {
                topic_id: topic.topic_id.clone(),
                topic_type: topic.topic_type.clone(),
                scope_id: topic.scope_id.clone(),
                version: topic.current_version.clone(),
            }
        };

        tracing::info!(
            topic_id = %completion.topic_id,
            scope = ?completion.scope_id,
            "Topic completed"
        );
        metrics::record_topic_completed(&completion.topic_type);

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            if let Err(e) = listener.on_topic_completed(&completion).await {
                tracing::warn!(topic_id = %completion.topic_id, error = %e, "Topic completion listener failed");
            }
        }
    }

    pub fn topic(&self, topic_id: &str) -> Option<TopicInfo> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic_id)
            .cloned()
    }

    /// Current files of a tracked topic, used to resolve viewer version ids
    pub fn resolve_version_resources(&self, version_id: &str) -> Option<Vec<FileEntry>> {
        self.topic(version_id)
            .map(|t| t.current_version.current_files)
    }
}

fn apply_lineage(topic: &mut TopicInfo, task: &Task) {
    let Some(pending) = topic.pending_resources.remove(&task.id) else {
        return;
    };
    let result = task.result.as_ref();
    let resource_id = result
        .and_then(|r| r.get("resource_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let action = pending.action.or_else(|| {
        result
            .and_then(|r| r.get("action"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    if action.as_deref().is_some_and(|a| a.eq_ignore_ascii_case("delete")) {
        topic
            .current_version
            .record_delete(&pending.file_path, resource_id.as_deref().unwrap_or_default());
        return;
    }
    match resource_id {
        Some(resource_id) => topic.current_version.record_write(FileEntry {
            file_path: pending.file_path,
            resource_id,
        }),
        None => tracing::debug!(
            task_id = %task.id,
            file_path = %pending.file_path,
            "Resource task completed without a resource_id"
        ),
    }
}

#[async_trait]
impl TaskStatusListener for TopicTracker {
    async fn on_status_changed(&self, task: &Task, _old: TaskStatus, new: TaskStatus) -> Result<()> {
        self.handle_status(task, new).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        fired: AtomicUsize,
        last: Mutex<Option<TopicCompletion>>,
    }

    #[async_trait]
    impl TopicCompletionListener for Counter {
        async fn on_topic_completed(&self, completion: &TopicCompletion) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(completion.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl TopicCompletionListener for Broken {
        async fn on_topic_completed(&self, _completion: &TopicCompletion) -> Result<()> {
            bail!("boom")
        }
    }

    fn resource_task(topic: &str, file_path: &str) -> Task {
        Task::new(TaskType::ResourceGeneration, "gen")
            .with_topic(topic, "CODE_RESOURCE")
            .with_scope("opera-1")
            .with_param("file_path", file_path)
    }

    fn completed(mut task: Task, resource_id: &str) -> Task {
        task.result = Some(json!({ "resource_id": resource_id }));
        task.status = TaskStatus::Completed;
        task
    }

    #[tokio::test]
    async fn test_fires_once_after_last_task() {
        let tracker = TopicTracker::new();
        let counter = Arc::new(Counter::default());
        tracker.on_completion(counter.clone());

        let tasks: Vec<Task> = (0..3)
            .map(|i| resource_task("t1", &format!("f{}.py", i)))
            .collect();
        for t in &tasks {
            tracker.add_task(t);
        }

        tracker.handle_status(&tasks[0], TaskStatus::Completed).await;
        tracker.handle_status(&tasks[1], TaskStatus::Completed).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);

        tracker.handle_status(&tasks[2], TaskStatus::Completed).await;
        tracker.handle_status(&tasks[2], TaskStatus::Completed).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 1);

        let last = counter.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.scope_id.as_deref(), Some("opera-1"));
        assert_eq!(last.topic_type, "CODE_RESOURCE");
    }

    #[tokio::test]
    async fn test_failed_task_blocks_completion() {
        let tracker = TopicTracker::new();
        let counter = Arc::new(Counter::default());
        tracker.on_completion(counter.clone());
        let a = resource_task("t", "a.py");
        let b = resource_task("t", "b.py");
        tracker.add_task(&a);
        tracker.add_task(&b);

        tracker.handle_status(&a, TaskStatus::Completed).await;
        tracker.handle_status(&b, TaskStatus::Failed).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_late_task_does_not_refire() {
        let tracker = TopicTracker::new();
        let counter = Arc::new(Counter::default());
        tracker.on_completion(counter.clone());

        let a = resource_task("t", "a.py");
        tracker.add_task(&a);
        tracker.handle_status(&a, TaskStatus::Completed).await;

        let late = resource_task("t", "b.py");
        tracker.add_task(&late);
        tracker.handle_status(&late, TaskStatus::Completed).await;

        assert_eq!(counter.fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.topic("t").map(|t| t.task_ids.len()), Some(2));
    }

    #[tokio::test]
    async fn test_untracked_and_topicless_tasks_ignored() {
        let tracker = TopicTracker::new();
        let counter = Arc::new(Counter::default());
        tracker.on_completion(counter.clone());

        let loose = Task::new(TaskType::Conversation, "chat");
        tracker.add_task(&loose);
        tracker.handle_status(&loose, TaskStatus::Completed).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);
        assert!(tracker.topic("").is_none());
    }

    #[tokio::test]
    async fn test_listener_failure_isolated() {
        let tracker = TopicTracker::new();
        let counter = Arc::new(Counter::default());
        tracker.on_completion(Arc::new(Broken));
        tracker.on_completion(counter.clone());

        let a = resource_task("t", "a.py");
        tracker.add_task(&a);
        tracker.handle_status(&a, TaskStatus::Completed).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.topic("t").map(|t| t.status), Some(TopicStatus::Completed));
    }

    #[tokio::test]
    async fn test_lineage_records_modified_files() {
        let tracker = TopicTracker::new();
        let a = resource_task("t", "/src/html/index.html");
        let b = resource_task("t", "/src/js/app.js");
        tracker.add_task(&a);
        tracker.add_task(&b);

        tracker.handle_status(&completed(a, "r-1"), TaskStatus::Completed).await;
        tracker.handle_status(&completed(b, "r-2"), TaskStatus::Completed).await;

        let files = tracker.resolve_version_resources("t").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].resource_id, "r-1");
        assert!(tracker.resolve_version_resources("unknown").is_none());
    }

    #[tokio::test]
    async fn test_iteration_inherits_parent_files_and_deletes() {
        let tracker = TopicTracker::new();
        let base_a = resource_task("base", "a.html");
        let base_b = resource_task("base", "b.css");
        tracker.add_task(&base_a);
        tracker.add_task(&base_b);
        tracker.handle_status(&completed(base_a, "r-a"), TaskStatus::Completed).await;
        tracker.handle_status(&completed(base_b, "r-b"), TaskStatus::Completed).await;

        let removal = Task::new(TaskType::ResourceIteration, "drop css")
            .with_topic("next", "CODE_RESOURCE")
            .with_param("parentTopicId", "base")
            .with_param("file_path", "b.css")
            .with_param("action", "delete");
        tracker.add_task(&removal);
        tracker.handle_status(&completed(removal, "r-b"), TaskStatus::Completed).await;

        let version = tracker.topic("next").unwrap().current_version;
        assert_eq!(version.parent_version.as_deref(), Some("base"));
        assert_eq!(version.current_files.len(), 1);
        assert_eq!(version.current_files[0].file_path, "a.html");
        assert_eq!(version.deleted_files[0].file_path, "b.css");
    }

    fn completion(modified: &[&str], current: &[&str]) -> TopicCompletion {
        let entries = |paths: &[&str]| {
            paths
                .iter()
                .enumerate()
                .map(|(i, p)| FileEntry {
                    file_path: p.to_string(),
                    resource_id: format!("r{}", i),
                })
                .collect::<Vec<_>>()
        };
        TopicCompletion {
            topic_id: "t".to_string(),
            topic_type: "CODE_RESOURCE".to_string(),
            scope_id: Some("op".to_string()),
            version: VersionMeta {
                modified_files: entries(modified),
                current_files: entries(current),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_descriptor_prefers_modified_files() {
        let c = completion(&["/src/app.js", "/src/html/index.html"], &["a", "b", "c"]);
        let d = c.descriptor();
        let viewing = &d["ResourcesForViewing"];
        assert_eq!(viewing["VersionId"], "t");
        assert_eq!(viewing["Resources"].as_array().map(Vec::len), Some(2));
        assert_eq!(viewing["Resources"][0]["ResourceCacheable"], true);
        assert_eq!(viewing["NavigateIndex"], 1);
        assert!(d.get("RemovingAllResources").is_none());
    }

    #[test]
    fn test_descriptor_replaces_all_without_modifications() {
        let c = completion(&[], &["style.css", "about.html", "index.html"]);
        assert_eq!(c.navigate_index(), Some(2));
        let d = c.descriptor();
        assert_eq!(d["RemovingAllResources"], true);
        assert_eq!(d["ResourcesForViewing"]["Resources"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_navigate_falls_back_to_first_html() {
        assert_eq!(completion(&["a.css", "x.htm", "y.html"], &[]).navigate_index(), Some(1));
        let none = completion(&["a.css"], &[]);
        assert_eq!(none.navigate_index(), None);
        assert!(none.descriptor()["ResourcesForViewing"].get("NavigateIndex").is_none());
    }
}
