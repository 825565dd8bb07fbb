// ABOUTME: Manager wiring: ingest events into the pool, classify, derive and dispatch tasks.
// ABOUTME: Worker callbacks complete tasks, and completed topics are announced through the transport.

use crate::analysis::AnalysisPipeline;
use crate::config::Config;
use crate::dialogue::{DialogueRecord, DialogueStatus, DialogueType, InboundEvent};
use crate::dispatcher::TaskDispatcher;
use crate::metrics;
use crate::pool::{self, DialoguePool};
use crate::registry::{self, WorkerEntry, WorkerRegistry, REGISTRATION_TAG};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::router::{Router, RouterContext, CALLBACK_TAG};
use crate::task::{Task, TaskQueue, TaskStatus};
use crate::topic::{TopicCompletion, TopicCompletionListener, TopicTracker};
use crate::traits::{Directory, OutboundMessage, Transport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use opera_classifier::Classifier;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What one `ingest` call did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// False when the event was a redelivery of a pooled dialogue
    pub accepted: bool,
    pub tasks: Vec<Uuid>,
    pub dispatched: usize,
    /// Dialogue indices that produced resource work nobody can handle
    pub unrouted: Vec<i64>,
}

/// Announces completed topics to the scope they came from
struct CompletionNotifier {
    transport: Arc<dyn Transport>,
    sender_id: Option<String>,
    retry: RetryConfig,
}

#[async_trait]
impl TopicCompletionListener for CompletionNotifier {
    async fn on_topic_completed(&self, completion: &TopicCompletion) -> Result<()> {
        let Some(scope_id) = completion.scope_id.clone() else {
            anyhow::bail!("topic {} has no scope to notify", completion.topic_id);
        };
        let message = OutboundMessage {
            scope_id,
            sender_id: self.sender_id.clone(),
            text: format!("Topic {} resources are ready", completion.topic_id),
            tags: completion.descriptor().to_string(),
            is_whisper: false,
            mentioned_ids: Vec::new(),
        };
        retry_with_backoff(&self.retry, "send_topic_completion", || {
            self.transport.send(message.clone())
        })
        .await
        .with_context(|| format!("announcing topic {}", completion.topic_id))
    }
}

pub struct Manager {
    pool: Arc<Mutex<DialoguePool>>,
    pipeline: AnalysisPipeline,
    router: Router,
    queue: Arc<TaskQueue>,
    topics: Arc<TopicTracker>,
    dispatcher: TaskDispatcher,
    directory: Option<Arc<dyn Directory>>,
    manager_bot_id: Option<String>,
    retry: RetryConfig,
    maintenance_interval: Duration,
}

impl Manager {
    pub fn new(
        config: &Config,
        classifier: Arc<dyn Classifier>,
        transport: Arc<dyn Transport>,
        directory: Option<Arc<dyn Directory>>,
    ) -> Self {
        let topics = Arc::new(TopicTracker::new());
        topics.on_completion(Arc::new(CompletionNotifier {
            transport: transport.clone(),
            sender_id: config.dispatch.manager_staff_id.clone(),
            retry: config.retry.clone(),
        }));

        let queue = Arc::new(TaskQueue::new());
        queue.subscribe(topics.clone());

        let ctx = Arc::new(
            RouterContext::new(WorkerRegistry::new(config.workers.clone()))
                .with_classifier(classifier.clone()),
        );
        let pipeline =
            AnalysisPipeline::new(classifier, config.analysis.clone()).with_topics(topics.clone());
        let mut dispatcher = TaskDispatcher::new(
            ctx.clone(),
            transport,
            config.dispatch.clone(),
            config.retry.clone(),
        );
        if let Some(directory) = directory.clone() {
            dispatcher = dispatcher.with_directory(directory);
        }

        Self {
            pool: Arc::new(Mutex::new(DialoguePool::new(config.pool.clone()))),
            pipeline,
            router: Router::new(ctx),
            queue,
            topics,
            dispatcher,
            directory,
            manager_bot_id: config.dispatch.manager_bot_id.clone(),
            retry: config.retry.clone(),
            maintenance_interval: Duration::from_secs(config.pool.maintenance_interval_secs),
        }
    }

    pub fn pool(&self) -> &Arc<Mutex<DialoguePool>> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn topics(&self) -> &Arc<TopicTracker> {
        &self.topics
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Periodic pool maintenance at the configured interval
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        pool::spawn_maintenance(self.pool.clone(), self.maintenance_interval)
    }

    /// Wait for background task-state writes to finish
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// Load the workers a previous instance registered from the manager bot's ChildBots tags
    pub async fn restore_workers(&self) -> Result<usize> {
        let (Some(directory), Some(bot_id)) = (&self.directory, self.manager_bot_id.as_deref()) else {
            return Ok(0);
        };
        let current = retry_with_backoff(&self.retry, "read_default_tags", || directory.default_tags(bot_id))
            .await
            .with_context(|| format!("reading worker registry from {bot_id}"))?;
        let workers = registry::child_bots_from_tags(current.as_deref());
        let restored = workers.len();
        for entry in workers {
            self.router.context().register_worker(entry);
        }
        tracing::info!(bot_id, restored, "Worker registry restored");
        Ok(restored)
    }

    /// Make a worker routable now and record it in the manager bot's ChildBots tags.
    ///
    /// The in-memory registration stands even if the tags cannot be written.
    pub async fn register_worker(&self, entry: WorkerEntry) -> Result<()> {
        if entry.worker_id.trim().is_empty() {
            anyhow::bail!("worker registration needs a non-empty worker_id");
        }
        self.router.context().register_worker(entry.clone());

        let (Some(directory), Some(bot_id)) = (&self.directory, self.manager_bot_id.as_deref()) else {
            tracing::debug!(worker_id = %entry.worker_id, "No manager bot configured, registration kept in memory");
            return Ok(());
        };
        let current = retry_with_backoff(&self.retry, "read_default_tags", || directory.default_tags(bot_id))
            .await
            .with_context(|| format!("reading worker registry from {bot_id}"))?;
        let merged = registry::merge_child_bot(current.as_deref(), &entry)?;
        retry_with_backoff(&self.retry, "write_default_tags", || {
            directory.set_default_tags(bot_id, &merged)
        })
        .await
        .with_context(|| format!("writing worker registry to {bot_id}"))?;
        tracing::debug!(bot_id, worker_id = %entry.worker_id, "Worker registry persisted");
        Ok(())
    }

    /// Handle one inbound event end to end
    pub async fn ingest(&self, event: InboundEvent) -> Result<IngestReport> {
        if event.tags.to_lowercase().contains(REGISTRATION_TAG) {
            let entry: WorkerEntry = serde_json::from_str(&event.text)
                .with_context(|| format!("worker registration {} in scope {}", event.index, event.scope_id))?;
            self.register_worker(entry).await?;
            return Ok(IngestReport {
                accepted: true,
                ..Default::default()
            });
        }

        let record = DialogueRecord::from_event(event);
        metrics::record_dialogue_ingested(record.dialogue_type.as_str());
        tracing::info!(
            scope = %record.scope_id,
            index = record.index,
            dialogue_type = %record.dialogue_type,
            priority = ?record.priority,
            "Dialogue ingested"
        );

        let mut report = IngestReport::default();

        if record.dialogue_type == DialogueType::DirectCreation && !record.has_tag(CALLBACK_TAG) {
            report.accepted = true;
            match self.router.derive_tasks(&record, &[]).await {
                Ok(tasks) => self.enqueue(tasks, &mut report).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Direct creation dropped");
                    report.unrouted.push(record.index);
                }
            }
            return Ok(report);
        }

        let scope_id = record.scope_id.clone();
        {
            let mut pool = self.pool.lock().await;
            report.accepted = pool.add(record);
            metrics::set_pool_size(pool.len());
        }
        if !report.accepted {
            return Ok(report);
        }

        self.pipeline.analyze(&self.pool).await;
        self.process_pending(&scope_id, &mut report).await?;
        Ok(report)
    }

    /// Derive and hand out tasks for analyzed records still waiting in the scope
    async fn process_pending(&self, scope_id: &str, report: &mut IngestReport) -> Result<()> {
        let (pending, scope_records) = {
            let mut pool = self.pool.lock().await;
            let pending: Vec<DialogueRecord> = pool
                .scope_records(scope_id)
                .into_iter()
                .filter(|r| r.status == DialogueStatus::Pending && r.analysis.is_some())
                .cloned()
                .collect();
            for record in &pending {
                pool.update_status(scope_id, record.index, DialogueStatus::Processing);
            }
            let all: Vec<DialogueRecord> = pool.scope_records(scope_id).into_iter().cloned().collect();
            (pending, all)
        };

        for record in pending {
            let related: Vec<DialogueRecord> = match &record.analysis {
                Some(analysis) => scope_records
                    .iter()
                    .filter(|r| analysis.related_indices.contains(&r.index))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };

            let outcome = match self.router.derive_tasks(&record, &related).await {
                Ok(tasks) => {
                    let callbacks = if record.has_tag(CALLBACK_TAG) {
                        tasks.clone()
                    } else {
                        Vec::new()
                    };
                    self.enqueue(tasks, report).await;
                    for callback in callbacks {
                        self.complete_callback(&callback).await?;
                    }
                    DialogueStatus::Completed
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dialogue left without a handler");
                    report.unrouted.push(record.index);
                    DialogueStatus::Failed
                }
            };
            self.pool
                .lock()
                .await
                .update_status(scope_id, record.index, outcome);
        }
        Ok(())
    }

    /// Register with topics, enqueue, and dispatch resource work
    async fn enqueue(&self, tasks: Vec<Task>, report: &mut IngestReport) {
        for task in tasks {
            self.topics.add_task(&task);
            let id = self.queue.add(task.clone());
            report.tasks.push(id);

            if !task.task_type.is_resource() {
                continue;
            }
            match self.dispatcher.dispatch(&task).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "Dispatch failed");
                    if let Err(e) = self.queue.update_status(&id, TaskStatus::Failed).await {
                        tracing::warn!(task_id = %id, error = %e, "Could not mark task failed");
                    }
                }
            }
        }
    }

    /// Complete the task a worker reported on, then the callback task itself
    async fn complete_callback(&self, callback: &Task) -> Result<()> {
        if let Some(target) = callback.param_str("callback_task_id") {
            match Uuid::parse_str(target.trim()) {
                Ok(target_id) if self.queue.get(&target_id).is_some() => {
                    let status = match callback.param_str("status") {
                        Some(s) if s.eq_ignore_ascii_case("failed") => TaskStatus::Failed,
                        _ => TaskStatus::Completed,
                    };
                    let result = callback.parameters.get("result").cloned();
                    self.finish_task(&target_id, status, result).await?;
                }
                Ok(target_id) => {
                    tracing::warn!(task_id = %target_id, "Callback for unknown task");
                }
                Err(e) => {
                    tracing::warn!(callback_task_id = target, error = %e, "Callback names an invalid task id");
                }
            }
        }
        self.queue
            .update_status(&callback.id, TaskStatus::Completed)
            .await?;
        Ok(())
    }

    /// Record a worker's result and move the task to a terminal status
    pub async fn finish_task(&self, id: &Uuid, status: TaskStatus, result: Option<Value>) -> Result<Task> {
        if let Some(result) = result {
            self.queue.set_result(id, result)?;
        }
        let task = self.queue.update_status(id, status).await?;
        tracing::info!(task_id = %id, status = %status, topic = ?task.topic_id, "Task finished");
        Ok(task)
    }
}
