use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A primitive value held in an entry's structured data, or a string
/// sequence (the only non-scalar kind a schema field may declare).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    StringList(Vec<String>),
    Number(f64),
    Boolean(bool),
}

impl FieldValue {
    pub fn as_display(&self) -> String {
        match self {
            FieldValue::String(s) => s.clone(),
            FieldValue::StringList(items) => items.join(", "),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Boolean(b) => b.to_string(),
        }
    }
}

pub type StructuredData = BTreeMap<String, FieldValue>;

/// A single piece of content stored on the user's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: String,
    #[serde(default, rename = "bubbleId")]
    pub group_id: Option<String>,
    #[serde(default, rename = "typeName")]
    pub type_name: Option<String>,
    #[serde(default, rename = "structuredData")]
    pub structured_data: Option<StructuredData>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl Entry {
    pub fn new(content: String, tags: Vec<String>, source: String) -> Self {
        let now = Utc::now();
        Self {
            id: crate::ids::content_id(&[&content, &source]),
            content,
            tags,
            source,
            group_id: None,
            type_name: None,
            structured_data: None,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    pub fn touch(&mut self) {
        let next = Utc::now();
        self.updated_at = if next > self.updated_at {
            next
        } else {
            self.updated_at
        };
    }

    pub fn days_since_update(&self) -> i64 {
        (Utc::now() - self.updated_at).num_days()
    }

    pub fn matches_substring(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.content.to_lowercase().contains(&needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }

    pub fn matches_terms(&self, terms: &[String]) -> bool {
        let haystack = format!(
            "{} {} {}",
            self.content.to_lowercase(),
            self.tags.join(" ").to_lowercase(),
            self.source.to_lowercase()
        );
        terms
            .iter()
            .all(|term| haystack.contains(&term.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_has_equal_created_and_updated_timestamps() {
        let entry = Entry::new("hello".into(), vec![], "test".into());
        assert_eq!(entry.created_at, entry.updated_at);
        assert!(!entry.archived);
    }

    #[test]
    fn touch_never_moves_updated_at_backwards() {
        let mut entry = Entry::new("hello".into(), vec![], "test".into());
        let original = entry.updated_at;
        entry.updated_at = Utc::now() + chrono::Duration::days(1);
        let bumped = entry.updated_at;
        entry.touch();
        assert!(entry.updated_at >= bumped);
        assert!(entry.updated_at >= original);
    }
}
