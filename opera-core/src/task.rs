// ABOUTME: Tasks and the task queue: status lifecycle, counters and ordered subscriber fan-out.
// ABOUTME: Subscriber failures are logged and never roll back a committed transition.

use crate::dialogue::Priority;
use crate::metrics;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Conversation,
    ChatResponse,
    Analysis,
    System,
    Callback,
    ResourceCreation,
    ResourceGeneration,
    ResourceIteration,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        Self::Conversation,
        Self::ChatResponse,
        Self::Analysis,
        Self::System,
        Self::Callback,
        Self::ResourceCreation,
        Self::ResourceGeneration,
        Self::ResourceIteration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "CONVERSATION",
            Self::ChatResponse => "CHAT_RESPONSE",
            Self::Analysis => "ANALYSIS",
            Self::System => "SYSTEM",
            Self::Callback => "CALLBACK",
            Self::ResourceCreation => "RESOURCE_CREATION",
            Self::ResourceGeneration => "RESOURCE_GENERATION",
            Self::ResourceIteration => "RESOURCE_ITERATION",
        }
    }

    /// Case-insensitive lookup by wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Tasks that produce or change a resource file
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Self::ResourceCreation | Self::ResourceGeneration | Self::ResourceIteration
        )
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub description: String,
    pub parameters: Map<String, Value>,
    pub source_dialogue_index: Option<i64>,
    pub source_staff_id: Option<String>,
    pub response_staff_id: Option<String>,
    pub scope_id: Option<String>,
    pub topic_id: Option<String>,
    pub topic_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl Task {
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            description: description.into(),
            parameters: Map::new(),
            source_dialogue_index: None,
            source_staff_id: None,
            response_staff_id: None,
            scope_id: None,
            topic_id: None,
            topic_type: None,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_topic(mut self, topic_id: impl Into<String>, topic_type: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self.topic_type = Some(topic_type.into());
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Notified after every committed status transition
#[async_trait]
pub trait TaskStatusListener: Send + Sync {
    async fn on_status_changed(&self, task: &Task, old: TaskStatus, new: TaskStatus) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<Task>,
    positions: HashMap<Uuid, usize>,
    counts: HashMap<TaskStatus, usize>,
}

impl QueueState {
    fn get_mut(&mut self, id: &Uuid) -> Option<&mut Task> {
        let pos = *self.positions.get(id)?;
        self.tasks.get_mut(pos)
    }
}

/// In-process task queue. Tasks are never removed.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    listeners: RwLock<Vec<Arc<dyn TaskStatusListener>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listeners run in registration order
    pub fn subscribe(&self, listener: Arc<dyn TaskStatusListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn add(&self, task: Task) -> Uuid {
        let id = task.id;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state.counts.entry(task.status).or_insert(0) += 1;
        let pos = state.tasks.len();
        state.positions.insert(id, pos);
        metrics::record_task_created(task.task_type.as_str());
        tracing::debug!(task_id = %id, task_type = %task.task_type, "Task enqueued");
        state.tasks.push(task);
        id
    }

    /// Swap a task's status and notify listeners.
    ///
    /// Re-applying the current status is a no-op and notifies no one.
    pub async fn update_status(&self, id: &Uuid, status: TaskStatus) -> Result<Task> {
        let (snapshot, old) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let task = state
                .get_mut(id)
                .ok_or_else(|| anyhow!("Task not found: {}", id))?;
            let old = task.status;
            if old == status {
                return Ok(task.clone());
            }
            task.status = status;
            if status.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
            let snapshot = task.clone();
            if let Some(count) = state.counts.get_mut(&old) {
                *count = count.saturating_sub(1);
            }
            *state.counts.entry(status).or_insert(0) += 1;
            (snapshot, old)
        };

        metrics::record_task_transition(status.as_str());
        tracing::debug!(task_id = %id, from = %old, to = %status, "Task status changed");

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            if let Err(e) = listener.on_status_changed(&snapshot, old, status).await {
                tracing::warn!(task_id = %id, error = %e, "Task status listener failed");
            }
        }
        Ok(snapshot)
    }

    /// Record a worker's result without touching status
    pub fn set_result(&self, id: &Uuid, result: Value) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let task = state
            .get_mut(id)
            .ok_or_else(|| anyhow!("Task not found: {}", id))?;
        task.result = Some(result);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.positions.get(id).map(|&pos| state.tasks[pos].clone())
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .clone()
    }

    /// Highest-priority pending task, oldest first within a priority
    pub fn next_pending(&self) -> Option<Task> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(_, t)| t.clone())
    }

    pub fn status_count(&self, status: TaskStatus) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counts
            .get(&status)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskStatusListener for Recorder {
        async fn on_status_changed(&self, _task: &Task, old: TaskStatus, new: TaskStatus) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}->{}", self.name, old, new));
            if self.fail {
                bail!("listener {} exploded", self.name);
            }
            Ok(())
        }
    }

    #[test]
    fn test_task_type_names() {
        assert_eq!(TaskType::from_name("resource_iteration"), Some(TaskType::ResourceIteration));
        assert_eq!(TaskType::from_name("CALLBACK"), Some(TaskType::Callback));
        assert_eq!(TaskType::from_name("nope"), None);
        let json = serde_json::to_value(Task::new(TaskType::ChatResponse, "x")).unwrap();
        assert_eq!(json["type"], "CHAT_RESPONSE");
    }

    #[tokio::test]
    async fn test_listeners_run_in_order_despite_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = TaskQueue::new();
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            queue.subscribe(Arc::new(Recorder {
                name,
                log: log.clone(),
                fail,
            }));
        }

        let id = queue.add(Task::new(TaskType::Conversation, "hello"));
        let updated = queue.update_status(&id, TaskStatus::Completed).await.unwrap();

        assert_eq!(updated.status, TaskStatus::Completed);
        assert!(updated.completed_at.is_some());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:PENDING->COMPLETED",
                "b:PENDING->COMPLETED",
                "c:PENDING->COMPLETED"
            ]
        );
        assert_eq!(queue.get(&id).map(|t| t.status), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_counters_follow_transitions() {
        let queue = TaskQueue::new();
        let a = queue.add(Task::new(TaskType::Analysis, "a"));
        queue.add(Task::new(TaskType::Analysis, "b"));
        assert_eq!(queue.status_count(TaskStatus::Pending), 2);

        queue.update_status(&a, TaskStatus::Processing).await.unwrap();
        queue.update_status(&a, TaskStatus::Failed).await.unwrap();
        assert_eq!(queue.status_count(TaskStatus::Pending), 1);
        assert_eq!(queue.status_count(TaskStatus::Processing), 0);
        assert_eq!(queue.status_count(TaskStatus::Failed), 1);
    }

    #[tokio::test]
    async fn test_same_status_is_silent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = TaskQueue::new();
        queue.subscribe(Arc::new(Recorder {
            name: "x",
            log: log.clone(),
            fail: false,
        }));
        let id = queue.add(Task::new(TaskType::System, "s"));
        queue.update_status(&id, TaskStatus::Pending).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let queue = TaskQueue::new();
        let err = queue
            .update_status(&Uuid::new_v4(), TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Task not found"));
        assert!(queue.set_result(&Uuid::new_v4(), Value::Null).is_err());
    }

    #[tokio::test]
    async fn test_next_pending_by_priority_then_age() {
        let queue = TaskQueue::new();
        queue.add(Task::new(TaskType::Conversation, "low").with_priority(Priority::Low));
        let first_high = queue.add(Task::new(TaskType::Conversation, "high-1").with_priority(Priority::High));
        let second_high = queue.add(Task::new(TaskType::Conversation, "high-2").with_priority(Priority::High));

        assert_eq!(queue.next_pending().map(|t| t.id), Some(first_high));
        queue.update_status(&first_high, TaskStatus::Processing).await.unwrap();
        assert_eq!(queue.next_pending().map(|t| t.id), Some(second_high));
    }

    #[test]
    fn test_set_result() {
        let queue = TaskQueue::new();
        let id = queue.add(Task::new(TaskType::ResourceCreation, "r"));
        queue
            .set_result(&id, serde_json::json!({"resource_id": "res-1"}))
            .unwrap();
        let task = queue.get(&id).unwrap();
        assert_eq!(task.result.unwrap()["resource_id"], "res-1");
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
