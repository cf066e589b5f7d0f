//! Component C — an append-only event log with rolling aggregates, an
//! improvement journal, and (extended by the control plane) pending actions
//! and protections. Everything lives in one JSON blob, recomputed from the
//! raw event list on every load so the file stays robust to hand-editing.

use crate::error::Result;
use crate::model::{ActionKind, PendingAction, Protection};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub const EVENT_LOG_CAP: usize = 1000;
pub const EVENT_LOG_TRIM_TO: usize = 500;
pub const JOURNAL_CAP: usize = 200;
pub const JOURNAL_TRIM_TO: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Read,
    Write,
    Miss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub action: EventAction,
    pub tool: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default, rename = "typeName")]
    pub type_name: Option<String>,
    #[serde(default, rename = "entryIds")]
    pub entry_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementRecord {
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<ImprovementActionCount>,
    #[serde(rename = "autoExecuted")]
    pub auto_executed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementActionCount {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usefulness {
    #[serde(default)]
    pub helpful: HashMap<String, u32>,
    #[serde(default)]
    pub unhelpful: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwarenessFile {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub improvements: Vec<ImprovementRecord>,
    #[serde(default)]
    pub usefulness: Usefulness,
    #[serde(default, rename = "pendingActions")]
    pub pending_actions: Vec<PendingAction>,
    #[serde(default)]
    pub protections: Vec<Protection>,
    #[serde(default, rename = "schemaCache")]
    pub schema_cache: Option<Value>,
}

/// Aggregates recomputed from the raw event list on each call; never
/// persisted incrementally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "totalReads")]
    pub total_reads: usize,
    #[serde(rename = "totalWrites")]
    pub total_writes: usize,
    #[serde(rename = "totalMisses")]
    pub total_misses: usize,
    #[serde(rename = "missesByQuery")]
    pub misses_by_query: HashMap<String, usize>,
    #[serde(rename = "readsByType")]
    pub reads_by_type: HashMap<String, usize>,
    #[serde(rename = "writesByType")]
    pub writes_by_type: HashMap<String, usize>,
    #[serde(rename = "lastActivity")]
    pub last_activity: Option<DateTime<Utc>>,
}

pub struct Observer {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Observer {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn load_raw(&self) -> Result<AwarenessFile> {
        Ok(persist::load_json(&self.path)?.unwrap_or_default())
    }

    pub fn save_raw(&self, raw: &AwarenessFile) -> Result<()> {
        persist::save_json(&self.path, raw)
    }

    /// Appends one event, rotating the log if it now exceeds the cap.
    pub fn record(
        &self,
        action: EventAction,
        tool: &str,
        query: Option<&str>,
        type_name: Option<&str>,
        entry_ids: &[String],
    ) -> Result<()> {
        let _guard = self.lock.lock()?;
        let mut raw = self.load_raw()?;
        raw.events.push(Event {
            action,
            tool: tool.to_string(),
            query: query.map(str::to_string),
            type_name: type_name.map(str::to_string),
            entry_ids: entry_ids.to_vec(),
            timestamp: Utc::now(),
        });
        rotate_events(&mut raw.events);
        self.save_raw(&raw)
    }

    pub fn summary(&self) -> Result<Summary> {
        Ok(summarize(&self.load_raw()?.events))
    }

    /// Queries missed at least `threshold` times, paired with their miss
    /// count, sorted by query for determinism.
    pub fn missed_queries_at_least(&self, threshold: usize) -> Result<Vec<(String, usize)>> {
        let summary = self.summary()?;
        let mut misses: Vec<(String, usize)> = summary
            .misses_by_query
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .collect();
        misses.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(misses)
    }

    pub fn append_improvement(&self, record: ImprovementRecord) -> Result<()> {
        let _guard = self.lock.lock()?;
        let mut raw = self.load_raw()?;
        raw.improvements.push(record);
        if raw.improvements.len() > JOURNAL_CAP {
            let excess = raw.improvements.len() - JOURNAL_TRIM_TO;
            raw.improvements.drain(0..excess);
        }
        self.save_raw(&raw)
    }

    pub fn improvements_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ImprovementRecord>> {
        Ok(self
            .load_raw()?
            .improvements
            .into_iter()
            .filter(|r| r.timestamp >= cutoff)
            .collect())
    }

    pub fn record_usefulness(&self, entry_id: &str, helpful: bool) -> Result<()> {
        let _guard = self.lock.lock()?;
        let mut raw = self.load_raw()?;
        let table = if helpful {
            &mut raw.usefulness.helpful
        } else {
            &mut raw.usefulness.unhelpful
        };
        *table.entry(entry_id.to_string()).or_insert(0) += 1;
        self.save_raw(&raw)
    }

    /// Runs an arbitrary read-modify-write over the raw blob under the
    /// observer's lock, used by the control plane so pending actions and
    /// protections share the observer's load-modify-save discipline.
    pub fn with_raw<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut AwarenessFile) -> Result<T>,
    {
        let _guard = self.lock.lock()?;
        let mut raw = self.load_raw()?;
        let result = f(&mut raw)?;
        self.save_raw(&raw)?;
        Ok(result)
    }
}

fn rotate_events(events: &mut Vec<Event>) {
    if events.len() > EVENT_LOG_CAP {
        let excess = events.len() - EVENT_LOG_TRIM_TO;
        events.drain(0..excess);
    }
}

fn summarize(events: &[Event]) -> Summary {
    let mut summary = Summary::default();
    for event in events {
        summary.last_activity = Some(
            summary
                .last_activity
                .map_or(event.timestamp, |last| last.max(event.timestamp)),
        );
        match event.action {
            EventAction::Read => {
                summary.total_reads += 1;
                if let Some(type_name) = &event.type_name {
                    *summary.reads_by_type.entry(type_name.clone()).or_insert(0) += 1;
                }
            }
            EventAction::Write => {
                summary.total_writes += 1;
                if let Some(type_name) = &event.type_name {
                    *summary.writes_by_type.entry(type_name.clone()).or_insert(0) += 1;
                }
            }
            EventAction::Miss => {
                summary.total_misses += 1;
                if let Some(query) = &event.query {
                    *summary.misses_by_query.entry(query.clone()).or_insert(0) += 1;
                }
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer() -> (tempfile::TempDir, Observer) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("awareness.json");
        (dir, Observer::new(path))
    }

    #[test]
    fn rotation_keeps_last_500_past_1000_events() {
        let (_dir, observer) = observer();
        for _ in 0..1001 {
            observer
                .record(EventAction::Read, "list_contexts", None, None, &[])
                .unwrap();
        }
        let raw = observer.load_raw().unwrap();
        assert_eq!(raw.events.len(), EVENT_LOG_TRIM_TO);
    }

    #[test]
    fn miss_without_query_counts_toward_total_only() {
        let (_dir, observer) = observer();
        observer
            .record(EventAction::Miss, "recall_context", None, None, &[])
            .unwrap();
        let summary = observer.summary().unwrap();
        assert_eq!(summary.total_misses, 1);
        assert!(summary.misses_by_query.is_empty());
    }

    #[test]
    fn three_misses_for_same_query_surface_in_missed_queries() {
        let (_dir, observer) = observer();
        for _ in 0..3 {
            observer
                .record(
                    EventAction::Miss,
                    "recall_context",
                    Some("deployment"),
                    None,
                    &[],
                )
                .unwrap();
        }
        let missed = observer.missed_queries_at_least(3).unwrap();
        assert_eq!(missed, vec![("deployment".to_string(), 3)]);
    }
}
