// ABOUTME: Metric names and recording helpers for the orchestration core.
// ABOUTME: The binary installs the Prometheus recorder; without one these are no-ops.

use metrics::{counter, gauge};

pub const DIALOGUES_INGESTED: &str = "opera_dialogues_ingested_total";
pub const DIALOGUES_EVICTED: &str = "opera_dialogues_evicted_total";
pub const POOL_SIZE: &str = "opera_pool_size";
pub const CLASSIFIER_CALLS: &str = "opera_classifier_calls_total";
pub const TASKS_CREATED: &str = "opera_tasks_created_total";
pub const TASK_TRANSITIONS: &str = "opera_task_status_transitions_total";
pub const DISPATCH_RETRIES: &str = "opera_dispatch_retries_total";
pub const TOPICS_COMPLETED: &str = "opera_topics_completed_total";

pub fn record_dialogue_ingested(dialogue_type: &str) {
    counter!(DIALOGUES_INGESTED, "type" => dialogue_type.to_string()).increment(1);
}

/// `reason` is one of `expired`, `cold`, `overflow`
pub fn record_evictions(reason: &'static str, count: usize) {
    if count > 0 {
        counter!(DIALOGUES_EVICTED, "reason" => reason).increment(count as u64);
    }
}

pub fn set_pool_size(size: usize) {
    gauge!(POOL_SIZE).set(size as f64);
}

pub fn record_classifier_call(mode: &str, outcome: &'static str) {
    counter!(CLASSIFIER_CALLS, "mode" => mode.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_task_created(task_type: &str) {
    counter!(TASKS_CREATED, "type" => task_type.to_string()).increment(1);
}

pub fn record_task_transition(to: &str) {
    counter!(TASK_TRANSITIONS, "to" => to.to_string()).increment(1);
}

pub fn record_dispatch_retry(operation: &str) {
    counter!(DISPATCH_RETRIES, "operation" => operation.to_string()).increment(1);
}

pub fn record_topic_completed(topic_type: &str) {
    counter!(TOPICS_COMPLETED, "topic_type" => topic_type.to_string()).increment(1);
}
