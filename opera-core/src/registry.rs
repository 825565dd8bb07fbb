// ABOUTME: Worker registry: which worker bots serve which conversation scopes, and as whom.
// ABOUTME: Seeded from [[workers]] config, extended at runtime and mirrored into the manager bot's ChildBots tags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Default-tags key on the manager bot holding the registered workers
pub const CHILD_BOTS_KEY: &str = "ChildBots";
/// Inbound tag marking a worker announcing itself; the body is a [`WorkerEntry`] as JSON
pub const REGISTRATION_TAG: &str = "worker_registration";

/// One `[[workers]]` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub worker_id: String,
    #[serde(default)]
    pub scope_ids: Vec<String>,
    /// Addressable identities per scope; the first one is the default
    #[serde(default)]
    pub staff_ids_by_scope: HashMap<String, Vec<String>>,
    /// Opaque routing hint
    #[serde(default)]
    pub config: Value,
}

impl WorkerEntry {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            ..Default::default()
        }
    }

    /// Serve `scope_id` under the given identities
    pub fn with_scope(mut self, scope_id: &str, staff_ids: &[&str]) -> Self {
        if !self.scope_ids.iter().any(|s| s == scope_id) {
            self.scope_ids.push(scope_id.to_string());
        }
        self.staff_ids_by_scope.insert(
            scope_id.to_string(),
            staff_ids.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn serves(&self, scope_id: &str) -> bool {
        self.scope_ids.iter().any(|s| s == scope_id)
    }

    pub fn staff_ids(&self, scope_id: &str) -> &[String] {
        self.staff_ids_by_scope
            .get(scope_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    entries: Vec<WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new(entries: Vec<WorkerEntry>) -> Self {
        Self { entries }
    }

    pub fn register(&mut self, entry: WorkerEntry) {
        match self.entries.iter_mut().find(|e| e.worker_id == entry.worker_id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WorkerEntry] {
        &self.entries
    }

    pub fn for_scope(&self, scope_id: &str) -> Vec<&WorkerEntry> {
        self.entries.iter().filter(|e| e.serves(scope_id)).collect()
    }

    /// Every identity any worker uses in the scope, deduplicated in registry order
    pub fn candidates(&self, scope_id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in self.for_scope(scope_id) {
            for staff in entry.staff_ids(scope_id) {
                if !out.contains(staff) {
                    out.push(staff.clone());
                }
            }
        }
        out
    }

    /// Reverse lookup from an addressable identity to its worker
    pub fn worker_for_staff(&self, scope_id: &str, staff_id: &str) -> Option<&WorkerEntry> {
        self.for_scope(scope_id)
            .into_iter()
            .find(|e| e.staff_ids(scope_id).iter().any(|s| s == staff_id))
    }
}

/// A default-tags blob as a JSON object; anything else starts an empty one
pub(crate) fn tags_object(current: Option<&str>) -> Map<String, Value> {
    match current.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("Default tags are not a JSON object, starting fresh");
                Map::new()
            }
        },
        None => Map::new(),
    }
}

fn child_worker_id(item: &Value) -> Option<&str> {
    match item {
        Value::String(id) => Some(id),
        Value::Object(map) => map.get("worker_id").and_then(Value::as_str),
        _ => None,
    }
}

/// Workers recorded in a manager bot's default tags.
///
/// Bare string entries are worker ids without scopes; entries that don't
/// deserialize are skipped.
pub fn child_bots_from_tags(current: Option<&str>) -> Vec<WorkerEntry> {
    let root = tags_object(current);
    let Some(Value::Array(items)) = root.get(CHILD_BOTS_KEY) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(WorkerEntry::new(id)),
            other => match serde_json::from_value::<WorkerEntry>(other.clone()) {
                Ok(entry) if !entry.worker_id.trim().is_empty() => Some(entry),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable ChildBots entry");
                    None
                }
            },
        })
        .collect()
}

/// Insert or replace `entry` in the ChildBots list, keeping every other key
pub fn merge_child_bot(current: Option<&str>, entry: &WorkerEntry) -> Result<String> {
    let mut root = tags_object(current);
    let value = serde_json::to_value(entry).context("serializing worker entry")?;
    let children = root
        .entry(CHILD_BOTS_KEY)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !children.is_array() {
        *children = Value::Array(Vec::new());
    }
    if let Value::Array(items) = children {
        match items
            .iter_mut()
            .find(|item| child_worker_id(item) == Some(entry.worker_id.as_str()))
        {
            Some(existing) => *existing = value,
            None => items.push(value),
        }
    }
    serde_json::to_string(&Value::Object(root)).context("serializing default tags")
}
