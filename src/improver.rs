//! Component F — the tick function: observe, decide, route, act.

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::control::{ControlPlane, RouteOutcome};
use crate::error::Result;
use crate::model::{ActionKind, Entry, ImproverAction};
use crate::observer::{EventAction, ImprovementActionCount, ImprovementRecord, Observer};
use crate::schema::Catalog;
use crate::selfmodel::{self, SelfModel};
use crate::store::Store;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{error, info};

const STALE_DAYS: i64 = 180;
const MERGE_SIMILARITY_THRESHOLD: f64 = 0.8;
const CONTRADICTION_AGE_GAP_DAYS: i64 = 180;
const PROMOTE_KEYWORD_OVERLAP: usize = 2;
const SUGGEST_SCHEMA_UNTYPED_THRESHOLD: usize = 5;
const GAP_STUB_MISS_THRESHOLD: usize = 3;

#[derive(Debug, Default)]
pub struct TickReport {
    pub auto_executed: Vec<(ActionKind, usize)>,
    pub enqueued: usize,
    pub skipped_protected: usize,
    pub self_model: Option<SelfModel>,
}

pub struct Improver<'a> {
    pub store: &'a Store,
    pub catalog: Option<&'a Catalog>,
    pub observer: &'a Observer,
    pub analyzer: Option<&'a Analyzer>,
    pub config: &'a Config,
}

impl<'a> Improver<'a> {
    pub async fn tick(&self) -> TickReport {
        let deadline = Instant::now() + Duration::from_millis(self.config.tick_wall_cap_ms);
        let mut report = TickReport::default();

        // Phase 1 — observe.
        let active = match self.store.list_active() {
            Ok(entries) => entries,
            Err(err) => {
                error!("tick phase 1 failed to list entries: {err}");
                return report;
            }
        };
        let model = selfmodel::build(&active, self.catalog, Some(self.observer));
        report.self_model = Some(model.clone());

        // Phase 2 — decide.
        let candidates = match self.decide(&active, deadline).await {
            Ok(c) => c,
            Err(err) => {
                error!("tick phase 2 failed: {err}");
                Vec::new()
            }
        };

        // Phase 3 — route.
        let control = ControlPlane::new(self.observer, self.config);
        let mut executed_counts: HashMap<ActionKind, usize> = HashMap::new();
        for candidate in candidates {
            if self.is_candidate_protected(&control, &active, &candidate) {
                report.skipped_protected += 1;
                continue;
            }
            match control.route(candidate) {
                Ok(RouteOutcome::AutoExecuted(action)) => {
                    let kind = action.kind;
                    if let Err(err) = self.execute(&action) {
                        error!("failed to auto-execute {:?}: {err}", kind);
                        continue;
                    }
                    *executed_counts.entry(kind).or_insert(0) += 1;
                }
                Ok(RouteOutcome::Enqueued(_)) => report.enqueued += 1,
                Ok(RouteOutcome::Skipped) => {}
                Err(err) => error!("routing failed: {err}"),
            }
        }
        let _ = control.expire_due();

        // Phase 4 — record.
        report.auto_executed = executed_counts.into_iter().collect();
        if !report.auto_executed.is_empty() {
            let record = ImprovementRecord {
                timestamp: chrono::Utc::now(),
                actions: report
                    .auto_executed
                    .iter()
                    .map(|(kind, count)| ImprovementActionCount {
                        kind: *kind,
                        count: *count,
                    })
                    .collect(),
                auto_executed: true,
            };
            if let Err(err) = self.observer.append_improvement(record) {
                error!("failed to journal improvement record: {err}");
            }
        }
        info!(
            "tick complete: {} auto-executed kinds, {} enqueued, {} skipped (protected)",
            report.auto_executed.len(),
            report.enqueued,
            report.skipped_protected
        );
        report
    }

    fn is_candidate_protected(
        &self,
        control: &ControlPlane,
        active: &[Entry],
        candidate: &ImproverAction,
    ) -> bool {
        candidate.target_ids.iter().any(|id| {
            active
                .iter()
                .find(|e| &e.id == id)
                .map(|e| control.is_protected(e, candidate.kind).unwrap_or(false))
                .unwrap_or(false)
        })
    }

    async fn decide(&self, active: &[Entry], deadline: Instant) -> Result<Vec<ImproverAction>> {
        let mut candidates = Vec::new();

        if let Some(action) = auto_tag_candidate(active) {
            candidates.push(action);
        }
        candidates.extend(merge_duplicate_candidates(active));
        if let Some(catalog) = self.catalog {
            candidates.extend(promote_to_type_candidates(active, catalog));
        }
        if let Some(action) = archive_stale_candidate(active, self.observer)? {
            candidates.push(action);
        }
        candidates.extend(gap_stub_candidates(active, self.observer)?);

        if Instant::now() < deadline {
            if let Some(analyzer) = self.analyzer {
                candidates.extend(resolve_contradiction_candidates(active, analyzer).await);
                if let Some(action) = suggest_schema_candidate(active, analyzer).await {
                    candidates.push(action);
                }
            }
        } else {
            info!("tick budget exceeded before analyzer-dependent phases; skipping");
        }
        Ok(candidates)
    }

    /// Executes one action's semantics. Shared by the tick's auto-execute
    /// path and the control plane's approval path.
    pub fn execute(&self, action: &ImproverAction) -> Result<()> {
        match action.kind {
            ActionKind::AutoTag => self.execute_auto_tag(action),
            ActionKind::MergeDuplicates => self.execute_merge(action),
            ActionKind::PromoteToType => self.execute_promote(action),
            ActionKind::ArchiveStale => self.execute_archive_stale(action),
            ActionKind::CreateGapStubs => self.execute_gap_stubs(action),
            ActionKind::ResolveContradictions => self.execute_resolve_contradiction(action),
            ActionKind::SuggestSchema => self.execute_suggest_schema(action),
        }
    }

    fn execute_auto_tag(&self, action: &ImproverAction) -> Result<()> {
        for id in &action.target_ids {
            if let Some(entry) = self.store.get(id)? {
                let mut tags = entry.tags.clone();
                for tag in extract_keywords(&entry.content, 3) {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                let updated = self.store.update(id, None, Some(tags))?;
                self.observer.record(
                    EventAction::Write,
                    "auto_tag",
                    None,
                    updated.type_name.as_deref(),
                    std::slice::from_ref(&updated.id),
                )?;
            }
        }
        Ok(())
    }

    fn execute_merge(&self, action: &ImproverAction) -> Result<()> {
        let survivor_id = action
            .payload
            .get("survivorId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::error::RuntimeError::InvalidArgument("missing survivorId".into()))?;
        let loser_id = action
            .payload
            .get("loserId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::error::RuntimeError::InvalidArgument("missing loserId".into()))?;
        let survivor = self
            .store
            .get(survivor_id)?
            .ok_or_else(|| crate::error::RuntimeError::NotFound(survivor_id.to_string()))?;
        let loser = self
            .store
            .get(loser_id)?
            .ok_or_else(|| crate::error::RuntimeError::NotFound(loser_id.to_string()))?;

        let content = if survivor.content.trim() == loser.content.trim() {
            survivor.content.clone()
        } else {
            format!("{}\n\n{}", survivor.content, loser.content)
        };
        let mut tags = survivor.tags.clone();
        for tag in &loser.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        self.store.apply_merge(survivor_id, content, tags, loser_id)?;
        self.observer.record(
            EventAction::Write,
            "merge_duplicates",
            None,
            survivor.type_name.as_deref(),
            &[survivor_id.to_string(), loser_id.to_string()],
        )?;
        Ok(())
    }

    fn execute_promote(&self, action: &ImproverAction) -> Result<()> {
        let type_name = action
            .payload
            .get("typeName")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::error::RuntimeError::InvalidArgument("missing typeName".into()))?;
        for id in &action.target_ids {
            self.store.set_type(id, Some(type_name.to_string()))?;
            self.observer.record(
                EventAction::Write,
                "promote_to_type",
                None,
                Some(type_name),
                std::slice::from_ref(id),
            )?;
        }
        Ok(())
    }

    fn execute_archive_stale(&self, action: &ImproverAction) -> Result<()> {
        for id in &action.target_ids {
            self.store.set_archived(id, true)?;
            self.observer.record(
                EventAction::Write,
                "archive_stale",
                None,
                None,
                std::slice::from_ref(id),
            )?;
        }
        Ok(())
    }

    fn execute_gap_stubs(&self, action: &ImproverAction) -> Result<()> {
        let queries = action
            .payload
            .get("queries")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for entry in queries {
            let query = entry.get("query").and_then(|v| v.as_str());
            let count = entry.get("count").and_then(|v| v.as_u64());
            if let (Some(query), Some(count)) = (query, count) {
                let stub = self.store.save(
                    format!(
                        "[GAP] Agents have searched for \"{query}\" {count} times but no context exists."
                    ),
                    vec!["gap".to_string(), "needs-input".to_string()],
                    "self-improvement".to_string(),
                )?;
                self.observer.record(
                    EventAction::Write,
                    "create_gap_stubs",
                    None,
                    None,
                    std::slice::from_ref(&stub.id),
                )?;
            }
        }
        Ok(())
    }

    fn execute_resolve_contradiction(&self, action: &ImproverAction) -> Result<()> {
        let loser_id = action
            .payload
            .get("archiveId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::error::RuntimeError::InvalidArgument("missing archiveId".into()))?;
        self.store.set_archived(loser_id, true)?;
        self.observer.record(
            EventAction::Write,
            "resolve_contradictions",
            None,
            None,
            &[loser_id.to_string()],
        )?;
        Ok(())
    }

    fn execute_suggest_schema(&self, action: &ImproverAction) -> Result<()> {
        self.observer.with_raw(|raw| {
            raw.schema_cache = Some(json!({
                "lastAnalysis": chrono::Utc::now(),
                "suggestions": action.payload.clone(),
            }));
            Ok(())
        })
    }
}

fn auto_tag_candidate(active: &[Entry]) -> Option<ImproverAction> {
    let targets: Vec<String> = active
        .iter()
        .filter(|e| e.tags.is_empty())
        .map(|e| e.id.clone())
        .collect();
    if targets.len() < 3 {
        return None;
    }
    Some(ImproverAction {
        kind: ActionKind::AutoTag,
        target_ids: targets,
        payload: json!({}),
    })
}

fn merge_duplicate_candidates(active: &[Entry]) -> Vec<ImproverAction> {
    let mut by_type: HashMap<&str, Vec<&Entry>> = HashMap::new();
    for entry in active {
        if let Some(t) = &entry.type_name {
            by_type.entry(t.as_str()).or_default().push(entry);
        }
    }
    let mut candidates = Vec::new();
    for bucket in by_type.values() {
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                let similarity = jaccard_similarity(&bucket[i].content, &bucket[j].content);
                if similarity > MERGE_SIMILARITY_THRESHOLD {
                    let (survivor, loser) = if bucket[i].updated_at >= bucket[j].updated_at {
                        (bucket[i], bucket[j])
                    } else {
                        (bucket[j], bucket[i])
                    };
                    candidates.push(ImproverAction {
                        kind: ActionKind::MergeDuplicates,
                        target_ids: vec![survivor.id.clone(), loser.id.clone()],
                        payload: json!({
                            "survivorId": survivor.id,
                            "loserId": loser.id,
                            "typeName": survivor.type_name,
                        }),
                    });
                }
            }
        }
    }
    candidates
}

fn promote_to_type_candidates(active: &[Entry], catalog: &Catalog) -> Vec<ImproverAction> {
    let mut candidates = Vec::new();
    for entry in active.iter().filter(|e| e.type_name.is_none()) {
        let content_words = word_set(&entry.content);
        for schema_type in &catalog.types {
            let description_words = word_set(&schema_type.description);
            let overlap = content_words.intersection(&description_words).count();
            if overlap >= PROMOTE_KEYWORD_OVERLAP {
                candidates.push(ImproverAction {
                    kind: ActionKind::PromoteToType,
                    target_ids: vec![entry.id.clone()],
                    payload: json!({"typeName": schema_type.name}),
                });
                break;
            }
        }
    }
    candidates
}

fn archive_stale_candidate(active: &[Entry], observer: &Observer) -> Result<Option<ImproverAction>> {
    let ever_read = observer.load_raw()?.events.into_iter().fold(
        HashSet::new(),
        |mut acc, event| {
            if event.action == EventAction::Read {
                acc.extend(event.entry_ids);
            }
            acc
        },
    );
    let targets: Vec<String> = active
        .iter()
        .filter(|e| e.days_since_update() > STALE_DAYS && !ever_read.contains(&e.id))
        .map(|e| e.id.clone())
        .collect();
    if targets.is_empty() {
        return Ok(None);
    }
    Ok(Some(ImproverAction {
        kind: ActionKind::ArchiveStale,
        target_ids: targets,
        payload: json!({}),
    }))
}

fn gap_stub_candidates(active: &[Entry], observer: &Observer) -> Result<Vec<ImproverAction>> {
    let missed = observer.missed_queries_at_least(GAP_STUB_MISS_THRESHOLD)?;
    let fresh: Vec<(String, usize)> = missed
        .into_iter()
        .filter(|(q, _)| {
            !active.iter().any(|e| {
                e.source == "self-improvement" && e.content.contains(&format!("\"{q}\""))
            })
        })
        .collect();
    if fresh.is_empty() {
        return Ok(Vec::new());
    }
    let queries: Vec<Value> = fresh
        .into_iter()
        .map(|(query, count)| json!({"query": query, "count": count}))
        .collect();
    Ok(vec![ImproverAction {
        kind: ActionKind::CreateGapStubs,
        target_ids: vec![],
        payload: json!({"queries": queries}),
    }])
}

async fn resolve_contradiction_candidates(
    active: &[Entry],
    analyzer: &Analyzer,
) -> Vec<ImproverAction> {
    let contradictions = analyzer.detect_contradictions(active).await;
    contradictions
        .into_iter()
        .filter_map(|c| {
            let a = active.iter().find(|e| e.id == c.entry_ids[0])?;
            let b = active.iter().find(|e| e.id == c.entry_ids[1])?;
            let gap_days = (a.updated_at - b.updated_at).num_days().abs();
            if gap_days <= CONTRADICTION_AGE_GAP_DAYS {
                return None;
            }
            let (winner, loser) = if a.updated_at >= b.updated_at { (a, b) } else { (b, a) };
            Some(ImproverAction {
                kind: ActionKind::ResolveContradictions,
                target_ids: vec![winner.id.clone(), loser.id.clone()],
                payload: json!({
                    "winnerId": winner.id,
                    "archiveId": loser.id,
                    "explanation": c.explanation,
                }),
            })
        })
        .collect()
}

async fn suggest_schema_candidate(active: &[Entry], analyzer: &Analyzer) -> Option<ImproverAction> {
    let untyped: Vec<Entry> = active
        .iter()
        .filter(|e| e.type_name.is_none())
        .cloned()
        .collect();
    if untyped.len() < SUGGEST_SCHEMA_UNTYPED_THRESHOLD {
        return None;
    }
    let suggestions = analyzer.suggest_schema(&untyped).await;
    if suggestions.is_empty() {
        return None;
    }
    let payload = json!(suggestions
        .iter()
        .map(|s| json!({
            "typeName": s.type_name,
            "description": s.description,
            "fields": s.fields.iter().map(|f| json!({
                "name": f.name,
                "type": f.field_type,
                "description": f.description,
            })).collect::<Vec<_>>(),
        }))
        .collect::<Vec<_>>());
    Some(ImproverAction {
        kind: ActionKind::SuggestSchema,
        target_ids: vec![],
        payload,
    })
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union.max(1) as f64
}

fn word_set(text: &str) -> HashSet<String> {
    static WORD_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = WORD_PATTERN.get_or_init(|| Regex::new(r"[a-z0-9]+").unwrap());
    pattern
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() >= 4)
        .collect()
}

/// Up-to-3 keyword tags from content by a simple noun-like token heuristic:
/// the longest distinct words, stripped of punctuation.
fn extract_keywords(content: &str, max: usize) -> Vec<String> {
    let mut words: Vec<String> = word_set(content).into_iter().collect();
    words.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    words.truncate(max);
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (tempfile::TempDir, Store, Observer, Config) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.json")).unwrap();
        let observer = Observer::new(dir.path().join("awareness.json"));
        (dir, store, observer, Config::default())
    }

    #[tokio::test]
    async fn archive_stale_with_auto_approve_high_archives_the_entry() {
        let (_dir, store, observer, mut config) = harness();
        config.auto_approve_high = true;
        let entry = store.save("old note".into(), vec![], "test".into()).unwrap();
        // backdate by mutating the persisted store directly through the store API:
        // simulate via the merge/update path is not expressible, so we accept the
        // entry is fresh and instead verify the candidate-building function directly.
        let mut aged = entry.clone();
        aged.updated_at = chrono::Utc::now() - chrono::Duration::days(200);
        let candidate = archive_stale_candidate(&[aged.clone()], &observer).unwrap();
        assert!(candidate.is_some());
        let action = candidate.unwrap();
        assert_eq!(action.target_ids, vec![aged.id.clone()]);

        let improver = Improver {
            store: &store,
            catalog: None,
            observer: &observer,
            analyzer: None,
            config: &config,
        };
        improver.execute(&action).unwrap();
        let archived = store.get(&entry.id).unwrap().unwrap();
        assert!(archived.archived);
    }

    #[test]
    fn gap_stub_dedup_skips_queries_with_an_existing_stub() {
        let (_dir, store, observer, _config) = harness();
        for _ in 0..3 {
            observer
                .record(EventAction::Miss, "recall_context", Some("deployment"), None, &[])
                .unwrap();
        }
        store
            .save(
                "[GAP] Agents have searched for \"deployment\" 3 times but no context exists.".into(),
                vec!["gap".into()],
                "self-improvement".into(),
            )
            .unwrap();
        let active = store.list_active().unwrap();
        let candidates = gap_stub_candidates(&active, &observer).unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn tick_is_idempotent_with_no_external_change() {
        let (_dir, store, observer, config) = harness();
        let analyzer = Analyzer::new("http://localhost:11434".into(), "llama3".into(), false);
        let improver = Improver {
            store: &store,
            catalog: None,
            observer: &observer,
            analyzer: Some(&analyzer),
            config: &config,
        };
        let first = improver.tick().await;
        let second = improver.tick().await;
        assert_eq!(first.auto_executed.len(), second.auto_executed.len());
    }
}
