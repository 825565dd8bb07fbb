// ABOUTME: Hands resource tasks to registered worker bots through the transport.
// ABOUTME: Also merges each assignment into the worker's persisted TaskStates list.

use crate::dialogue::Priority;
use crate::registry::tags_object;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::router::RouterContext;
use crate::task::{Task, TaskStatus, TaskType};
use crate::traits::{Directory, OutboundMessage, Transport};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;

pub const ASSIGNMENT_TAG: &str = "TASK_ASSIGNMENT";
const TASK_STATES_KEY: &str = "TaskStates";

fn default_persist_task_state() -> bool {
    true
}

/// `[dispatch]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Identity assignments and completion notices are sent from
    #[serde(default)]
    pub manager_staff_id: Option<String>,
    /// Bot whose default tags hold the ChildBots worker registry
    #[serde(default)]
    pub manager_bot_id: Option<String>,
    #[serde(default = "default_persist_task_state")]
    pub persist_task_state: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            manager_staff_id: None,
            manager_bot_id: None,
            persist_task_state: default_persist_task_state(),
        }
    }
}

/// Snapshot of a task as stored in a worker's default tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentTaskState {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub description: String,
    pub parameters: Map<String, Value>,
    pub source_dialogue_index: Option<i64>,
    pub response_staff_id: Option<String>,
    pub source_staff_id: Option<String>,
    pub progress: u8,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

impl From<&Task> for PersistentTaskState {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            created_at: task.created_at,
            priority: task.priority,
            task_type: task.task_type,
            status: task.status,
            description: task.description.clone(),
            parameters: task.parameters.clone(),
            source_dialogue_index: task.source_dialogue_index,
            response_staff_id: task.response_staff_id.clone(),
            source_staff_id: task.source_staff_id.clone(),
            progress: if task.status == TaskStatus::Completed { 100 } else { 0 },
            result: task.result.clone(),
            error_message: None,
        }
    }
}

/// `TASK_ASSIGNMENT;TASK_ID:<id>[;RESOURCE_ITERATION]`
pub fn assignment_tag(task: &Task) -> String {
    let mut tag = format!("{ASSIGNMENT_TAG};TASK_ID:{}", task.id);
    if task.task_type == TaskType::ResourceIteration {
        tag.push(';');
        tag.push_str(TaskType::ResourceIteration.as_str());
    }
    tag
}

/// Task id carried by an assignment tag
pub fn parse_assignment_tag(tags: &str) -> Option<Uuid> {
    let mut parts = tags.split(';').map(str::trim);
    if parts.next()? != ASSIGNMENT_TAG {
        return None;
    }
    parts
        .find_map(|p| p.strip_prefix("TASK_ID:"))
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

/// Insert or replace the task's entry in a default-tags blob
fn merge_task_state(current: Option<&str>, state: &PersistentTaskState) -> Result<String> {
    let mut root = tags_object(current);

    let entry = serde_json::to_value(state).context("serializing task state")?;
    let states = root
        .entry(TASK_STATES_KEY)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !states.is_array() {
        *states = Value::Array(Vec::new());
    }
    if let Value::Array(items) = states {
        let id = state.id.to_string();
        match items
            .iter_mut()
            .find(|item| item.get("id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(existing) => *existing = entry,
            None => items.push(entry),
        }
    }
    serde_json::to_string(&Value::Object(root)).context("serializing default tags")
}

pub struct TaskDispatcher {
    ctx: Arc<RouterContext>,
    transport: Arc<dyn Transport>,
    directory: Option<Arc<dyn Directory>>,
    config: DispatchConfig,
    retry: RetryConfig,
    /// Serializes this process's own read-merge-write cycles
    persist_lock: Arc<tokio::sync::Mutex<()>>,
    persisting: Mutex<JoinSet<()>>,
}

impl TaskDispatcher {
    pub fn new(
        ctx: Arc<RouterContext>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            ctx,
            transport,
            directory: None,
            config,
            retry,
            persist_lock: Arc::new(tokio::sync::Mutex::new(())),
            persisting: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Send `task` to the registered worker behind its handler identity.
    ///
    /// Returns false when the handler is not a registered worker, in which case
    /// nothing is sent. Fails only when the assignment message cannot be
    /// delivered; the task-state merge runs in the background and is best effort.
    pub async fn dispatch(&self, task: &Task) -> Result<bool> {
        let (Some(scope_id), Some(staff_id)) = (task.scope_id.as_deref(), task.response_staff_id.as_deref())
        else {
            return Ok(false);
        };
        let Some(worker) = self.ctx.worker_for_staff(scope_id, staff_id) else {
            tracing::debug!(task_id = %task.id, staff_id, "Handler is not a registered worker");
            return Ok(false);
        };

        let mut state = PersistentTaskState::from(task);
        // the assignment originates from the manager, not the dialogue's author
        if self.config.manager_staff_id.is_some() {
            state.source_staff_id = self.config.manager_staff_id.clone();
        }
        let message = OutboundMessage {
            scope_id: scope_id.to_string(),
            sender_id: self.config.manager_staff_id.clone(),
            text: serde_json::to_string(&state).context("serializing task assignment")?,
            tags: assignment_tag(task),
            is_whisper: true,
            mentioned_ids: vec![staff_id.to_string()],
        };

        retry_with_backoff(&self.retry, "send_assignment", || {
            self.transport.send(message.clone())
        })
        .await
        .with_context(|| format!("sending assignment for task {}", task.id))?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            worker_id = %worker.worker_id,
            staff_id,
            "Task dispatched"
        );

        if self.config.persist_task_state {
            self.spawn_persist(worker.worker_id, state);
        }
        Ok(true)
    }

    fn spawn_persist(&self, bot_id: String, state: PersistentTaskState) {
        let Some(directory) = self.directory.clone() else {
            return;
        };
        let retry = self.retry.clone();
        let lock = self.persist_lock.clone();
        let mut persisting = self.persisting.lock().unwrap_or_else(|e| e.into_inner());
        // Drop finished writers so a long run doesn't accumulate them
        while persisting.try_join_next().is_some() {}
        persisting.spawn(async move {
            let _guard = lock.lock().await;
            if let Err(e) = persist_task_state(directory.as_ref(), &retry, &bot_id, &state).await {
                tracing::warn!(task_id = %state.id, worker_id = %bot_id, error = %format!("{e:#}"), "Task state not persisted");
            }
        });
    }

    /// Wait for every background task-state write started so far
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.persisting.lock().unwrap_or_else(|e| e.into_inner()));
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Task state writer aborted");
            }
        }
    }
}

/// Read the worker's default tags, merge the task state in, write them back.
///
/// One dispatcher runs these one at a time, but nothing locks the read and
/// the write across processes: two managers updating the same worker can
/// overwrite each other's entry, and the last write wins.
pub async fn persist_task_state(
    directory: &dyn Directory,
    retry: &RetryConfig,
    bot_id: &str,
    state: &PersistentTaskState,
) -> Result<()> {
    let current = retry_with_backoff(retry, "read_default_tags", || directory.default_tags(bot_id))
        .await
        .with_context(|| format!("reading default tags for {bot_id}"))?;
    let merged = merge_task_state(current.as_deref(), state)?;
    retry_with_backoff(retry, "write_default_tags", || {
        directory.set_default_tags(bot_id, &merged)
    })
    .await
    .with_context(|| format!("writing default tags for {bot_id}"))?;

    tracing::debug!(bot_id, task_id = %state.id, "Task state persisted");
    Ok(())
}
