//! Component D — a deterministic description of store health, coverage,
//! freshness, gaps, and contradictions, computed on demand from the store,
//! the optional catalog, and the optional observer.

use crate::model::Entry;
use crate::observer::Observer;
use crate::schema::Catalog;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const RECENT_WINDOW_DAYS: i64 = 7;
const STALE_THRESHOLD_DAYS: i64 = 90;
const MISS_GAP_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "activeCount")]
    pub active_count: usize,
    #[serde(rename = "byType")]
    pub by_type: HashMap<String, usize>,
    #[serde(rename = "groupCount")]
    pub group_count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coverage {
    #[serde(rename = "coveredTypes")]
    pub covered_types: Vec<String>,
    #[serde(rename = "uncoveredTypes")]
    pub uncovered_types: Vec<String>,
    #[serde(rename = "untypedCount")]
    pub untyped_count: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Freshness {
    #[serde(rename = "recentlyUpdated")]
    pub recently_updated: usize,
    #[serde(rename = "staleCount")]
    pub stale_count: usize,
    #[serde(rename = "stalestEntries")]
    pub stalest_entries: Vec<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub description: String,
    pub severity: Severity,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    #[serde(rename = "entryIds")]
    pub entry_ids: [String; 2],
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Health {
    Sparse,
    Healthy,
    NeedsAttention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfModel {
    pub identity: Identity,
    pub coverage: Coverage,
    pub freshness: Freshness,
    pub gaps: Vec<Gap>,
    pub contradictions: Vec<Contradiction>,
    pub health: Health,
    #[serde(rename = "pendingActionsCount")]
    pub pending_actions_count: usize,
    #[serde(rename = "recentImprovementsCount")]
    pub recent_improvements_count: usize,
}

/// Deterministic opposition list for the contradiction heuristic. Crude by
/// design: it can false-positive on entries that discuss an opposition
/// rather than assert one, and never triggers auto-resolution by itself.
const OPPOSITIONS: &[(&str, &str)] = &[
    ("prefer", "avoid"),
    ("use", "don't use"),
    ("always", "never"),
    ("composition", "inheritance"),
    ("class", "functional"),
    ("stateful", "stateless"),
    ("monolith", "microservice"),
];

pub fn build(store_entries: &[Entry], catalog: Option<&Catalog>, observer: Option<&Observer>) -> SelfModel {
    let active: Vec<&Entry> = store_entries.iter().filter(|e| !e.archived).collect();

    let identity = build_identity(&active, 0);
    let coverage = build_coverage(&active, catalog);
    let freshness = build_freshness(&active);
    let missed_queries: Vec<String> = observer
        .and_then(|o| o.missed_queries_at_least(MISS_GAP_THRESHOLD).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|(query, _)| query)
        .collect();
    let gaps = build_gaps(catalog, &active, &freshness, &missed_queries);
    let contradictions = find_contradictions(&active);

    let coverage_score = coverage.score;
    let freshness_score = freshness.score;
    let health = if active.len() < 5 {
        Health::Sparse
    } else if (coverage_score + freshness_score) / 2.0 >= 0.7 {
        Health::Healthy
    } else {
        Health::NeedsAttention
    };

    let (pending_actions_count, recent_improvements_count) = observer
        .map(|o| {
            let raw = o.load_raw().unwrap_or_default();
            let pending = raw
                .pending_actions
                .iter()
                .filter(|p| p.status == crate::model::PendingStatus::Pending)
                .count();
            let recent = o
                .improvements_since(Utc::now() - Duration::days(7))
                .unwrap_or_default()
                .len();
            (pending, recent)
        })
        .unwrap_or((0, 0));

    SelfModel {
        identity,
        coverage,
        freshness,
        gaps,
        contradictions,
        health,
        pending_actions_count,
        recent_improvements_count,
    }
}

/// Full builder used by callers that also know the group count (groups
/// live in the store, not passed to `build` directly).
pub fn build_with_groups(
    store_entries: &[Entry],
    group_count_value: usize,
    catalog: Option<&Catalog>,
    observer: Option<&Observer>,
) -> SelfModel {
    let mut model = build(store_entries, catalog, observer);
    model.identity.group_count = group_count_value;
    model
}

fn build_identity(active: &[&Entry], group_count_value: usize) -> Identity {
    let mut by_type: HashMap<String, usize> = HashMap::new();
    for entry in active {
        if let Some(t) = &entry.type_name {
            *by_type.entry(t.clone()).or_insert(0) += 1;
        }
    }
    let oldest = active.iter().map(|e| e.created_at).min();
    let newest = active.iter().map(|e| e.created_at).max();
    Identity {
        active_count: active.len(),
        by_type,
        group_count: group_count_value,
        oldest,
        newest,
    }
}

fn build_coverage(active: &[&Entry], catalog: Option<&Catalog>) -> Coverage {
    let Some(catalog) = catalog else {
        return Coverage {
            covered_types: vec![],
            uncovered_types: vec![],
            untyped_count: active.iter().filter(|e| e.type_name.is_none()).count(),
            score: 1.0,
        };
    };
    if catalog.types.is_empty() {
        return Coverage {
            covered_types: vec![],
            uncovered_types: vec![],
            untyped_count: active.len(),
            score: 1.0,
        };
    }
    let mut covered = Vec::new();
    let mut uncovered = Vec::new();
    for t in &catalog.types {
        let has_entry = active
            .iter()
            .any(|e| e.type_name.as_deref() == Some(t.name.as_str()));
        if has_entry {
            covered.push(t.name.clone());
        } else {
            uncovered.push(t.name.clone());
        }
    }
    let untyped_count = active.iter().filter(|e| e.type_name.is_none()).count();
    let score = covered.len() as f64 / catalog.types.len() as f64;
    Coverage {
        covered_types: covered,
        uncovered_types: uncovered,
        untyped_count,
        score,
    }
}

fn build_freshness(active: &[&Entry]) -> Freshness {
    if active.is_empty() {
        return Freshness {
            recently_updated: 0,
            stale_count: 0,
            stalest_entries: vec![],
            score: 1.0,
        };
    }
    let recently_updated = active
        .iter()
        .filter(|e| e.days_since_update() <= RECENT_WINDOW_DAYS)
        .count();
    let mut stale: Vec<&&Entry> = active
        .iter()
        .filter(|e| e.days_since_update() > STALE_THRESHOLD_DAYS)
        .collect();
    stale.sort_by_key(|e| e.updated_at);
    let stalest_entries = stale.iter().take(5).map(|e| e.id.clone()).collect();
    Freshness {
        recently_updated,
        stale_count: stale.len(),
        stalest_entries,
        score: recently_updated as f64 / active.len() as f64,
    }
}

fn build_gaps(
    catalog: Option<&Catalog>,
    active: &[&Entry],
    freshness: &Freshness,
    missed_queries: &[String],
) -> Vec<Gap> {
    let mut gaps = Vec::new();

    if let Some(catalog) = catalog {
        for t in &catalog.types {
            let has_entry = active
                .iter()
                .any(|e| e.type_name.as_deref() == Some(t.name.as_str()));
            if !has_entry {
                gaps.push(Gap {
                    description: format!("No active entries of type \"{}\"", t.name),
                    severity: Severity::Warning,
                    suggestion: format!("Save a context entry with type \"{}\"", t.name),
                });
            }
        }
    }

    for query in missed_queries {
        gaps.push(Gap {
            description: format!("Agents have repeatedly searched for \"{query}\" with no results"),
            severity: Severity::Warning,
            suggestion: format!("Add context that answers \"{query}\""),
        });
    }

    if freshness.stale_count > 0 {
        gaps.push(Gap {
            description: format!(
                "{} entries have not been updated in over {STALE_THRESHOLD_DAYS} days",
                freshness.stale_count
            ),
            severity: Severity::Info,
            suggestion: "Review and refresh or archive the stalest entries".to_string(),
        });
    }

    gaps
}

fn find_contradictions(active: &[&Entry]) -> Vec<Contradiction> {
    let mut by_type: HashMap<&str, Vec<&Entry>> = HashMap::new();
    for entry in active {
        if let Some(t) = &entry.type_name {
            by_type.entry(t.as_str()).or_default().push(entry);
        }
    }

    let mut found = Vec::new();
    for bucket in by_type.values() {
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                if let Some(explanation) = opposition_explanation(&bucket[i].content, &bucket[j].content) {
                    found.push(Contradiction {
                        entry_ids: [bucket[i].id.clone(), bucket[j].id.clone()],
                        explanation,
                    });
                }
            }
        }
    }
    found
}

pub fn opposition_explanation(a: &str, b: &str) -> Option<String> {
    let (a_lower, b_lower) = (a.to_lowercase(), b.to_lowercase());
    for (left, right) in OPPOSITIONS {
        let a_has_left = a_lower.contains(left);
        let b_has_right = b_lower.contains(right);
        let a_has_right = a_lower.contains(right);
        let b_has_left = b_lower.contains(left);
        if (a_has_left && b_has_right) || (a_has_right && b_has_left) {
            return Some(format!(
                "one entry mentions \"{left}\" while the other mentions \"{right}\""
            ));
        }
    }
    None
}

/// The fixed human-readable rendering returned by `introspect`.
pub fn render(model: &SelfModel) -> String {
    let mut out = String::new();
    out.push_str("context store self-model\n");
    out.push_str(&format!(
        "identity: {} active entries, {} groups\n",
        model.identity.active_count, model.identity.group_count
    ));
    out.push_str(&format!(
        "coverage: {:.0}% ({} covered, {} uncovered, {} untyped)\n",
        model.coverage.score * 100.0,
        model.coverage.covered_types.len(),
        model.coverage.uncovered_types.len(),
        model.coverage.untyped_count
    ));
    out.push_str(&format!(
        "freshness: {} recently updated, {} stale\n",
        model.freshness.recently_updated, model.freshness.stale_count
    ));
    out.push_str(&format!("health: {:?}\n", model.health));

    if model.gaps.is_empty() {
        out.push_str("gaps: none\n");
    } else {
        out.push_str("gaps:\n");
        for gap in &model.gaps {
            let marker = match gap.severity {
                Severity::Warning => "\u{26A0}",
                Severity::Info => "\u{2139}",
            };
            out.push_str(&format!("  {marker} {} — {}\n", gap.description, gap.suggestion));
        }
    }

    if model.contradictions.is_empty() {
        out.push_str("contradictions: none\n");
    } else {
        out.push_str("contradictions:\n");
        for c in &model.contradictions {
            out.push_str(&format!(
                "  {} vs {}: {}\n",
                c.entry_ids[0], c.entry_ids[1], c.explanation
            ));
        }
    }

    out.push_str(&format!(
        "pending actions: {}, recent improvements: {}\n",
        model.pending_actions_count, model.recent_improvements_count
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_is_sparse_with_no_gaps_or_contradictions() {
        let model = build(&[], None, None);
        assert_eq!(model.health, Health::Sparse);
        assert!(model.gaps.is_empty());
        assert!(model.contradictions.is_empty());
        let text = render(&model);
        assert!(text.contains("context store"));
        assert!(text.contains("Sparse") || text.to_lowercase().contains("sparse"));
    }

    #[test]
    fn deterministic_opposition_is_found_for_composition_vs_inheritance() {
        let mut a = Entry::new(
            "Prefer composition over inheritance".into(),
            vec![],
            "t".into(),
        );
        a.type_name = Some("preference".into());
        let mut b = Entry::new("Use inheritance for this pattern".into(), vec![], "t".into());
        b.type_name = Some("preference".into());
        let entries = vec![a, b];
        let model = build(&entries, None, None);
        assert_eq!(model.contradictions.len(), 1);
    }

    #[test]
    fn no_types_with_catalog_gives_full_coverage_score() {
        let catalog = Catalog {
            version: 1,
            types: vec![],
        };
        let model = build(&[], Some(&catalog), None);
        assert_eq!(model.coverage.score, 1.0);
    }
}
