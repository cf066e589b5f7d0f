//! Component E — optional LM-powered analysis with a deterministic
//! fallback for every method. The analyzer never surfaces transport or
//! parse errors to callers; every failure silently degrades.

use crate::model::Entry;
use crate::selfmodel::{self, Contradiction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::warn;

const CONTRADICTION_BUCKET_CAP: usize = 50;
const SCHEMA_SUGGESTION_CAP: usize = 30;
const RANKING_CAP: usize = 20;
const LM_TIMEOUT: Duration = Duration::from_secs(10);

const AVAILABILITY_UNKNOWN: u8 = 0;
const AVAILABILITY_YES: u8 = 1;
const AVAILABILITY_NO: u8 = 2;

pub struct Analyzer {
    client: reqwest::Client,
    host: String,
    model: String,
    enabled: bool,
    availability: AtomicU8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaSuggestion {
    #[serde(rename = "typeName")]
    pub type_name: String,
    pub description: String,
    pub fields: Vec<SuggestedField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestedField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct RankedEntry {
    pub entry: Entry,
    pub score: f64,
}

impl Analyzer {
    pub fn new(host: String, model: String, enabled: bool) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(LM_TIMEOUT)
                .build()
                .unwrap_or_default(),
            host,
            model,
            enabled,
            availability: AtomicU8::new(AVAILABILITY_UNKNOWN),
        }
    }

    /// Whether the analyzer was configured to use a language model at all,
    /// independent of whether that endpoint has actually responded yet.
    pub fn is_lm_enabled(&self) -> bool {
        self.enabled
    }

    /// Probes `/api/tags` once per process lifetime and caches whether the
    /// configured model is present.
    async fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.availability.load(Ordering::Relaxed) {
            AVAILABILITY_YES => return true,
            AVAILABILITY_NO => return false,
            _ => {}
        }
        let available = self.probe().await;
        self.availability.store(
            if available { AVAILABILITY_YES } else { AVAILABILITY_NO },
            Ordering::Relaxed,
        );
        available
    }

    async fn probe(&self) -> bool {
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<TagModel>,
        }
        #[derive(Deserialize)]
        struct TagModel {
            name: String,
        }

        let url = format!("{}/api/tags", self.host.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(resp) => match resp.json::<TagsResponse>().await {
                Ok(tags) => tags.models.iter().any(|m| m.name == self.model),
                Err(err) => {
                    warn!("LM tags response was not parseable: {err}");
                    false
                }
            },
            Err(err) => {
                warn!("LM endpoint unreachable: {err}");
                false
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Option<Value> {
        let url = format!("{}/api/generate", self.host.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(err) => {
                warn!("LM request failed: {err}");
                return None;
            }
        };
        let envelope: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return None,
        };
        let response = envelope.get("response").and_then(Value::as_str)?;
        first_json_object(response)
    }

    // ---- 1. contradiction detection ---------------------------------------

    pub async fn detect_contradictions(&self, entries: &[Entry]) -> Vec<Contradiction> {
        let mut by_type: HashMap<&str, Vec<&Entry>> = HashMap::new();
        for entry in entries.iter().filter(|e| !e.archived) {
            if let Some(t) = &entry.type_name {
                by_type.entry(t.as_str()).or_default().push(entry);
            }
        }

        if !self.is_available().await {
            return deterministic_contradictions(&by_type);
        }

        let mut found = Vec::new();
        for bucket in by_type.values() {
            let mut recent: Vec<&&Entry> = bucket.iter().collect();
            recent.sort_by_key(|e| std::cmp::Reverse(e.updated_at));
            recent.truncate(CONTRADICTION_BUCKET_CAP);
            for i in 0..recent.len() {
                for j in (i + 1)..recent.len() {
                    let prompt = format!(
                        "Do these two notes contradict each other? Reply with JSON \
                         {{\"contradiction\": bool, \"explanation\": string}}.\nA: {}\nB: {}",
                        recent[i].content, recent[j].content
                    );
                    match self.generate(&prompt).await {
                        Some(value) => {
                            let is_contradiction =
                                value.get("contradiction").and_then(Value::as_bool).unwrap_or(false);
                            if is_contradiction {
                                let explanation = value
                                    .get("explanation")
                                    .and_then(Value::as_str)
                                    .unwrap_or("the language model flagged a tension")
                                    .to_string();
                                found.push(Contradiction {
                                    entry_ids: [recent[i].id.clone(), recent[j].id.clone()],
                                    explanation,
                                });
                            }
                        }
                        None => continue,
                    }
                }
            }
        }
        found
    }

    // ---- 2. schema suggestion ----------------------------------------------

    pub async fn suggest_schema(&self, untyped: &[Entry]) -> Vec<SchemaSuggestion> {
        if untyped.len() < 3 {
            return Vec::new();
        }
        let sample: Vec<&Entry> = untyped.iter().take(SCHEMA_SUGGESTION_CAP).collect();

        if !self.is_available().await {
            return deterministic_schema_suggestions(&sample);
        }

        let joined = sample
            .iter()
            .map(|e| format!("- {}", e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Suggest at most 3 schema types for these untyped notes. Reply with a JSON array of \
             {{\"typeName\": string, \"description\": string, \"fields\": \
             [{{\"name\": string, \"type\": string, \"description\": string}}]}}.\n{joined}"
        );
        match self.generate(&prompt).await {
            Some(Value::Array(items)) => items
                .into_iter()
                .take(3)
                .filter_map(parse_schema_suggestion)
                .collect(),
            _ => deterministic_schema_suggestions(&sample),
        }
    }

    // ---- 3. summarization ----------------------------------------------------

    pub async fn summarize(&self, entries: &[Entry], focus: Option<&str>) -> String {
        if !self.is_available().await {
            return deterministic_summary(entries);
        }
        let joined = entries
            .iter()
            .map(|e| format!("- {}", e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = match focus {
            Some(focus) => format!("Summarize these notes, focusing on {focus}:\n{joined}"),
            None => format!("Summarize these notes:\n{joined}"),
        };
        match self.generate_text(&prompt).await {
            Some(text) => text,
            None => deterministic_summary(entries),
        }
    }

    async fn generate_text(&self, prompt: &str) -> Option<String> {
        let url = format!("{}/api/generate", self.host.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let resp = self.client.post(&url).json(&body).send().await.ok()?;
        let value: Value = resp.json().await.ok()?;
        value
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    // ---- 4. relevance ranking -------------------------------------------------

    pub async fn rank_by_relevance(&self, entries: &[Entry], query: &str) -> Vec<RankedEntry> {
        let sample: Vec<&Entry> = entries.iter().take(RANKING_CAP).collect();
        if !self.is_available().await {
            return deterministic_ranking(&sample, query);
        }

        let joined = sample
            .iter()
            .map(|e| format!("{}: {}", e.id, e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Rank these notes by relevance to the query \"{query}\". Reply with a JSON array of \
             entry IDs, most relevant first.\n{joined}"
        );
        match self.generate(&prompt).await {
            Some(Value::Array(ids)) => {
                let ranked_ids: Vec<String> = ids
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                rank_from_ids(&sample, &ranked_ids)
            }
            _ => deterministic_ranking(&sample, query),
        }
    }
}

fn deterministic_contradictions(by_type: &HashMap<&str, Vec<&Entry>>) -> Vec<Contradiction> {
    let mut found = Vec::new();
    for bucket in by_type.values() {
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                if let Some(explanation) =
                    selfmodel::opposition_explanation(&bucket[i].content, &bucket[j].content)
                {
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

fn deterministic_schema_suggestions(entries: &[&Entry]) -> Vec<SchemaSuggestion> {
    let mut groups: HashMap<String, Vec<&&Entry>> = HashMap::new();
    for entry in entries {
        if let Some(first_tag) = entry.tags.first() {
            groups.entry(first_tag.clone()).or_default().push(entry);
        }
    }
    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 3)
        .map(|(tag, _)| SchemaSuggestion {
            type_name: tag.clone(),
            description: format!("entries commonly tagged \"{tag}\""),
            fields: vec![SuggestedField {
                name: "note".to_string(),
                field_type: "string".to_string(),
                description: "free-form content".to_string(),
            }],
        })
        .collect()
}

fn deterministic_summary(entries: &[Entry]) -> String {
    if entries.is_empty() {
        return "No entries to summarize.".to_string();
    }
    let mut by_type: HashMap<&str, usize> = HashMap::new();
    for e in entries {
        *by_type.entry(e.type_name.as_deref().unwrap_or("untyped")).or_insert(0) += 1;
    }
    let newest = entries.iter().max_by_key(|e| e.updated_at);
    let breakdown = by_type
        .iter()
        .map(|(t, n)| format!("{n} of type {t}"))
        .collect::<Vec<_>>()
        .join(", ");
    match newest {
        Some(newest) => format!(
            "{} entries ({breakdown}); newest updated {}",
            entries.len(),
            newest.updated_at
        ),
        None => format!("{} entries ({breakdown})", entries.len()),
    }
}

fn deterministic_ranking(entries: &[&Entry], query: &str) -> Vec<RankedEntry> {
    let terms: Vec<String> = query.split_whitespace().map(|t| t.to_lowercase()).collect();
    let mut ranked: Vec<RankedEntry> = entries
        .iter()
        .map(|e| {
            let haystack = format!(
                "{} {} {}",
                e.content.to_lowercase(),
                e.tags.join(" ").to_lowercase(),
                e.type_name.clone().unwrap_or_default().to_lowercase()
            );
            let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
            let score = if terms.is_empty() {
                0.0
            } else {
                hits as f64 / terms.len() as f64
            };
            RankedEntry {
                entry: (*e).clone(),
                score,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    ranked
}

fn rank_from_ids(entries: &[&Entry], ranked_ids: &[String]) -> Vec<RankedEntry> {
    let total = ranked_ids.len().max(1) as f64;
    let mut ranked: Vec<RankedEntry> = entries
        .iter()
        .map(|e| {
            let position = ranked_ids.iter().position(|id| id == &e.id);
            let score = match position {
                Some(pos) => (total - pos as f64) / total,
                None => 0.0,
            };
            RankedEntry {
                entry: (*e).clone(),
                score,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    ranked
}

fn parse_schema_suggestion(value: Value) -> Option<SchemaSuggestion> {
    let type_name = value.get("typeName")?.as_str()?.to_string();
    let description = value
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let fields = value
        .get("fields")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|f| {
                    Some(SuggestedField {
                        name: f.get("name")?.as_str()?.to_string(),
                        field_type: f.get("type").and_then(Value::as_str).unwrap_or("string").to_string(),
                        description: f
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(SchemaSuggestion {
        type_name,
        description,
        fields,
    })
}

/// Parses the first well-formed JSON object found in `text`, tolerating a
/// language model that wraps its answer in prose or markdown fences.
fn first_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer_disabled() -> Analyzer {
        Analyzer::new("http://localhost:11434".into(), "llama3".into(), false)
    }

    #[tokio::test]
    async fn disabled_analyzer_falls_back_to_deterministic_summary() {
        let analyzer = analyzer_disabled();
        let entries = vec![Entry::new("hello".into(), vec![], "t".into())];
        let summary = analyzer.summarize(&entries, None).await;
        assert!(summary.contains('1'));
    }

    #[tokio::test]
    async fn fewer_than_three_untyped_entries_yields_no_suggestions() {
        let analyzer = analyzer_disabled();
        let entries = vec![Entry::new("a".into(), vec![], "t".into())];
        assert!(analyzer.suggest_schema(&entries).await.is_empty());
    }

    #[test]
    fn first_json_object_tolerates_surrounding_prose() {
        let text = "sure, here you go: {\"a\": 1, \"b\": {\"c\": 2}} thanks!";
        let value = first_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }
}
