// ABOUTME: Bounded dialogue pool with heat decay, expiry and priority-based eviction.
// ABOUTME: Tracks per-scope "needs reanalysis" flags consumed by the analysis pipeline.

use crate::dialogue::{DialogueAnalysis, DialogueRecord, DialogueStatus};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

fn default_max_size() -> usize {
    100
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_heat_decay_rate() -> f64 {
    0.1
}

fn default_min_heat() -> f64 {
    0.5
}

fn default_heat_boost() -> f64 {
    0.3
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

/// `[pool]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Subtracted from every record's heat once per maintenance cycle
    #[serde(default = "default_heat_decay_rate")]
    pub heat_decay_rate: f64,
    #[serde(default = "default_min_heat")]
    pub min_heat: f64,
    /// Added to a record's heat each time another dialogue references it
    #[serde(default = "default_heat_boost")]
    pub heat_boost: f64,
    /// Upper clamp for boosted heat; unbounded when unset
    #[serde(default)]
    pub heat_ceiling: Option<f64>,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_age_secs: default_max_age_secs(),
            heat_decay_rate: default_heat_decay_rate(),
            min_heat: default_min_heat(),
            heat_boost: default_heat_boost(),
            heat_ceiling: None,
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeState {
    pub needs_reanalysis: bool,
    pub last_analyzed: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    record: DialogueRecord,
}

/// Records removed by one maintenance cycle, by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub cold: usize,
    pub overflow: usize,
}

impl MaintenanceReport {
    pub fn total(&self) -> usize {
        self.expired + self.cold + self.overflow
    }
}

/// Not internally synchronized: wrap in a mutex when shared
#[derive(Debug)]
pub struct DialoguePool {
    config: PoolConfig,
    entries: Vec<Entry>,
    next_seq: u64,
    status_counts: HashMap<DialogueStatus, usize>,
    scopes: HashMap<String, ScopeState>,
}

impl DialoguePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            next_seq: 0,
            status_counts: HashMap::new(),
            scopes: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Insert a record and run maintenance.
    ///
    /// Redelivered events (same scope and index) are ignored; returns whether
    /// the record was inserted.
    pub fn add(&mut self, record: DialogueRecord) -> bool {
        if self.position(&record.scope_id, record.index).is_some() {
            tracing::debug!(
                scope = %record.scope_id,
                index = record.index,
                "Duplicate dialogue ignored"
            );
            return false;
        }

        *self.status_counts.entry(record.status).or_insert(0) += 1;
        self.mark_dirty(&record.scope_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { seq, record });

        self.maintain();
        true
    }

    pub fn maintain(&mut self) -> MaintenanceReport {
        self.maintain_at(Utc::now())
    }

    /// One maintenance cycle evaluated at `now`
    pub fn maintain_at(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let max_age = chrono::Duration::seconds(self.config.max_age_secs as i64);

        report.expired = self.evict_where(|r| r.age(now) > max_age);

        let decay = self.config.heat_decay_rate;
        for entry in &mut self.entries {
            entry.record.heat -= decay;
        }

        let min_heat = self.config.min_heat;
        report.cold = self.evict_where(|r| r.heat < min_heat);

        if self.entries.len() > self.config.max_size {
            report.overflow = self.entries.len() - self.config.max_size;
            // Highest score first; among equal scores the most recent insertion wins
            self.entries.sort_by(|a, b| {
                b.record
                    .priority_score()
                    .total_cmp(&a.record.priority_score())
                    .then(b.seq.cmp(&a.seq))
            });
            let dropped = self.entries.split_off(self.config.max_size);
            for entry in dropped {
                self.forget(&entry.record);
            }
            self.entries.sort_by_key(|e| e.seq);
        }

        metrics::record_evictions("expired", report.expired);
        metrics::record_evictions("cold", report.cold);
        metrics::record_evictions("overflow", report.overflow);
        metrics::set_pool_size(self.entries.len());

        if report.total() > 0 {
            tracing::debug!(
                expired = report.expired,
                cold = report.cold,
                overflow = report.overflow,
                remaining = self.entries.len(),
                "Pool maintenance evicted dialogues"
            );
        }
        report
    }

    fn evict_where(&mut self, predicate: impl Fn(&DialogueRecord) -> bool) -> usize {
        let (evicted, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| predicate(&e.record));
        self.entries = kept;
        for entry in &evicted {
            self.forget(&entry.record);
        }
        evicted.len()
    }

    fn forget(&mut self, record: &DialogueRecord) {
        if let Some(count) = self.status_counts.get_mut(&record.status) {
            *count = count.saturating_sub(1);
        }
        self.mark_dirty(&record.scope_id);
    }

    fn mark_dirty(&mut self, scope_id: &str) {
        self.scopes
            .entry(scope_id.to_string())
            .or_default()
            .needs_reanalysis = true;
    }

    fn position(&self, scope_id: &str, index: i64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.record.scope_id == scope_id && e.record.index == index)
    }

    /// Move a record to a new status; false when the record is not pooled
    pub fn update_status(&mut self, scope_id: &str, index: i64, status: DialogueStatus) -> bool {
        let Some(pos) = self.position(scope_id, index) else {
            return false;
        };
        let old = std::mem::replace(&mut self.entries[pos].record.status, status);
        if let Some(count) = self.status_counts.get_mut(&old) {
            *count = count.saturating_sub(1);
        }
        *self.status_counts.entry(status).or_insert(0) += 1;
        true
    }

    pub fn get_by_index(&self, scope_id: &str, index: i64) -> Option<&DialogueRecord> {
        self.position(scope_id, index).map(|pos| &self.entries[pos].record)
    }

    pub fn get_mut(&mut self, scope_id: &str, index: i64) -> Option<&mut DialogueRecord> {
        let pos = self.position(scope_id, index)?;
        Some(&mut self.entries[pos].record)
    }

    /// Overwrite a record's analysis; re-classification never merges
    pub fn set_analysis(&mut self, scope_id: &str, index: i64, analysis: DialogueAnalysis) -> bool {
        match self.get_mut(scope_id, index) {
            Some(record) => {
                record.analysis = Some(analysis);
                true
            }
            None => false,
        }
    }

    /// Raise a referenced record's heat by the configured boost
    pub fn boost_heat(&mut self, scope_id: &str, index: i64) -> Option<f64> {
        let boost = self.config.heat_boost;
        let ceiling = self.config.heat_ceiling;
        let record = self.get_mut(scope_id, index)?;
        record.heat += boost;
        if let Some(ceiling) = ceiling {
            record.heat = record.heat.min(ceiling);
        }
        Some(record.heat)
    }

    pub fn records(&self) -> impl Iterator<Item = &DialogueRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Records of one scope, in insertion order
    pub fn scope_records(&self, scope_id: &str) -> Vec<&DialogueRecord> {
        self.records().filter(|r| r.scope_id == scope_id).collect()
    }

    /// Snapshot of a scope's records still lacking analysis
    pub fn unanalyzed(&self, scope_id: &str) -> Vec<DialogueRecord> {
        self.records()
            .filter(|r| r.scope_id == scope_id && r.analysis.is_none())
            .cloned()
            .collect()
    }

    /// Scopes flagged for reanalysis, sorted
    pub fn dirty_scopes(&self) -> Vec<String> {
        let mut dirty: Vec<String> = self
            .scopes
            .iter()
            .filter(|(_, s)| s.needs_reanalysis)
            .map(|(id, _)| id.clone())
            .collect();
        dirty.sort();
        dirty
    }

    pub fn scope_state(&self, scope_id: &str) -> Option<&ScopeState> {
        self.scopes.get(scope_id)
    }

    pub fn mark_analyzed(&mut self, scope_id: &str, at: DateTime<Utc>) {
        let state = self.scopes.entry(scope_id.to_string()).or_default();
        state.needs_reanalysis = false;
        state.last_analyzed = Some(at);
    }

    pub fn status_count(&self, status: DialogueStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run maintenance on a fixed tick until the handle is aborted
pub fn spawn_maintenance(pool: Arc<Mutex<DialoguePool>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            let report = pool.lock().await.maintain();
            tracing::trace!(evicted = report.total(), "Periodic pool maintenance");
        }
    })
}
