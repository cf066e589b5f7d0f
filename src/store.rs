//! Component A — the typed context store. A single JSON file with a
//! version header and two top-level lists, guarded by one in-process
//! mutex, rewritten atomically on every change. Grounded on the teacher's
//! `persist::app::managed_vec` load-modify-save discipline, generalized
//! from a SQL row store to a flat entry/group store.

use crate::error::{Result, RuntimeError};
use crate::model::{Entry, FieldValue, Group, GroupDeleteMode, StructuredData};
use crate::persist;
use crate::schema::{self, Catalog};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

/// `structuredData`-field equality filter used by `query_by_type`.
pub type FieldFilter = StructuredData;

pub struct Store {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl Store {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = persist::load_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &StoreFile) -> Result<()> {
        persist::save_json(&self.path, state)
    }

    // ---- entries --------------------------------------------------------

    pub fn save(&self, content: String, tags: Vec<String>, source: String) -> Result<Entry> {
        let entry = Entry::new(content, tags, source);
        let mut state = self.state.lock()?;
        state.entries.push(entry.clone());
        self.persist(&state)?;
        Ok(entry)
    }

    /// Validates `data` against `catalog`'s `type_name` and persists the
    /// entry regardless of validation outcome, returning the errors
    /// alongside. Renders `content` deterministically from `data`.
    pub fn save_typed(
        &self,
        catalog: &Catalog,
        type_name: &str,
        data: StructuredData,
        tags: Vec<String>,
        source: String,
    ) -> Result<(Entry, Vec<String>)> {
        let (_, errors) = schema::validate(catalog, type_name, &data);
        let content = schema::render_content(type_name, &data);
        let mut entry = Entry::new(content, tags, source);
        entry.type_name = Some(type_name.to_string());
        entry.structured_data = Some(data);

        let mut state = self.state.lock()?;
        state.entries.push(entry.clone());
        self.persist(&state)?;
        Ok((entry, errors))
    }

    pub fn get(&self, id: &str) -> Result<Option<Entry>> {
        let state = self.state.lock()?;
        Ok(state.entries.iter().find(|e| e.id == id).cloned())
    }

    pub fn update(
        &self,
        id: &str,
        content: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Entry> {
        let mut state = self.state.lock()?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no entry with id {id}")))?;
        if let Some(content) = content {
            entry.content = content;
        }
        if let Some(tags) = tags {
            entry.tags = tags;
        }
        entry.touch();
        let updated = entry.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    pub fn set_group(&self, id: &str, group_id: Option<String>) -> Result<Entry> {
        let mut state = self.state.lock()?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no entry with id {id}")))?;
        entry.group_id = group_id;
        entry.touch();
        let updated = entry.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    pub fn set_type(&self, id: &str, type_name: Option<String>) -> Result<Entry> {
        let mut state = self.state.lock()?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no entry with id {id}")))?;
        entry.type_name = type_name;
        entry.touch();
        let updated = entry.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    pub fn set_archived(&self, id: &str, archived: bool) -> Result<Entry> {
        let mut state = self.state.lock()?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no entry with id {id}")))?;
        entry.archived = archived;
        entry.touch();
        let updated = entry.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    /// Used by the improver for merges: overwrites content/tags/archived in
    /// one locked pass so merges are not split across two load-modify-saves.
    pub fn apply_merge(
        &self,
        survivor_id: &str,
        survivor_content: String,
        survivor_tags: Vec<String>,
        loser_id: &str,
    ) -> Result<Entry> {
        let mut state = self.state.lock()?;
        {
            let survivor = state
                .entries
                .iter_mut()
                .find(|e| e.id == survivor_id)
                .ok_or_else(|| RuntimeError::NotFound(format!("no entry with id {survivor_id}")))?;
            survivor.content = survivor_content;
            survivor.tags = survivor_tags;
            survivor.touch();
        }
        {
            let loser = state
                .entries
                .iter_mut()
                .find(|e| e.id == loser_id)
                .ok_or_else(|| RuntimeError::NotFound(format!("no entry with id {loser_id}")))?;
            loser.archived = true;
            loser.touch();
        }
        let survivor = state
            .entries
            .iter()
            .find(|e| e.id == survivor_id)
            .unwrap()
            .clone();
        self.persist(&state)?;
        Ok(survivor)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if state.entries.len() == before {
            return Err(RuntimeError::NotFound(format!("no entry with id {id}")));
        }
        self.persist(&state)
    }

    pub fn list_active(&self) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state.entries.iter().filter(|e| !e.archived).cloned().collect())
    }

    pub fn list_archived(&self) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state.entries.iter().filter(|e| e.archived).cloned().collect())
    }

    pub fn list_all(&self) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state.entries.clone())
    }

    pub fn by_tag(&self, tag: &str) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.archived && e.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }

    pub fn recall(&self, query: &str) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.archived && e.matches_substring(query))
            .cloned()
            .collect())
    }

    /// Multi-term conjunctive search over content, tags, and source.
    pub fn search(&self, query: &str) -> Result<Vec<Entry>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.archived && e.matches_terms(&terms))
            .cloned()
            .collect())
    }

    pub fn query_by_type(&self, type_name: &str, filter: &FieldFilter) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.archived && e.type_name.as_deref() == Some(type_name))
            .filter(|e| field_filter_matches(e, filter))
            .cloned()
            .collect())
    }

    pub fn by_group(&self, group_id: &str) -> Result<Vec<Entry>> {
        let state = self.state.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.archived && e.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect())
    }

    // ---- groups -----------------------------------------------------------

    pub fn create_group(&self, name: String, description: Option<String>) -> Result<Group> {
        let group = Group::new(name, description);
        let mut state = self.state.lock()?;
        state.groups.push(group.clone());
        self.persist(&state)?;
        Ok(group)
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let state = self.state.lock()?;
        Ok(state.groups.clone())
    }

    pub fn update_group(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Group> {
        let mut state = self.state.lock()?;
        let group = state
            .groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no group with id {id}")))?;
        if let Some(name) = name {
            group.name = name;
        }
        if description.is_some() {
            group.description = description;
        }
        group.updated_at = chrono::Utc::now();
        let updated = group.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    pub fn delete_group(&self, id: &str, mode: GroupDeleteMode) -> Result<()> {
        let mut state = self.state.lock()?;
        let existed = state.groups.iter().any(|g| g.id == id);
        if !existed {
            return Err(RuntimeError::NotFound(format!("no group with id {id}")));
        }
        state.groups.retain(|g| g.id != id);
        match mode {
            GroupDeleteMode::Orphan => {
                for entry in state.entries.iter_mut() {
                    if entry.group_id.as_deref() == Some(id) {
                        entry.group_id = None;
                        entry.touch();
                    }
                }
            }
            GroupDeleteMode::Cascade => {
                state.entries.retain(|e| e.group_id.as_deref() != Some(id));
            }
        }
        self.persist(&state)
    }

}

fn field_filter_matches(entry: &Entry, filter: &FieldFilter) -> bool {
    if filter.is_empty() {
        return true;
    }
    let Some(data) = &entry.structured_data else {
        return false;
    };
    filter.iter().all(|(k, expected)| {
        data.get(k)
            .map(|actual| fields_equal(actual, expected))
            .unwrap_or(false)
    })
}

fn fields_equal(a: &FieldValue, b: &FieldValue) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        (dir, Store::open(path).unwrap())
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("nope.json")).unwrap();
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn save_then_get_round_trips_field_wise() {
        let (_dir, store) = store();
        let saved = store
            .save("hello".into(), vec!["a".into()], "test".into())
            .unwrap();
        let fetched = store.get(&saved.id).unwrap().unwrap();
        assert_eq!(saved.content, fetched.content);
        assert_eq!(saved.tags, fetched.tags);
    }

    #[test]
    fn archived_entries_are_excluded_from_recall_search_and_list() {
        let (_dir, store) = store();
        let entry = store
            .save("find me".into(), vec![], "test".into())
            .unwrap();
        store.set_archived(&entry.id, true).unwrap();
        assert!(store.list_active().unwrap().is_empty());
        assert!(store.recall("find").unwrap().is_empty());
        assert!(store.search("find me").unwrap().is_empty());
        // still reachable by direct id and the archive list.
        assert!(store.get(&entry.id).unwrap().is_some());
        assert_eq!(store.list_archived().unwrap().len(), 1);
    }

    #[test]
    fn query_by_type_requires_every_filter_field_to_match() {
        let (_dir, store) = store();
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(
            "what".to_string(),
            crate::schema::FieldSpec {
                kind: crate::schema::FieldKind::String,
                required: true,
                description: None,
                values: None,
                default: None,
            },
        );
        let catalog = Catalog {
            version: 1,
            types: vec![crate::schema::SchemaType {
                name: "decision".to_string(),
                description: String::new(),
                fields,
            }],
        };
        let mut data = StructuredData::new();
        data.insert("what".to_string(), FieldValue::String("Redis".to_string()));
        let (entry, errors) = store
            .save_typed(&catalog, "decision", data, vec![], "test".into())
            .unwrap();
        assert!(errors.is_empty());

        let mut filter = FieldFilter::new();
        filter.insert("what".to_string(), FieldValue::String("Redis".to_string()));
        let found = store.query_by_type("decision", &filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, entry.id);

        filter.insert(
            "missing".to_string(),
            FieldValue::String("x".to_string()),
        );
        assert!(store.query_by_type("decision", &filter).unwrap().is_empty());
    }

    #[test]
    fn cascade_delete_removes_group_members() {
        let (_dir, store) = store();
        let group = store.create_group("g".into(), None).unwrap();
        let entry = store.save("c".into(), vec![], "t".into()).unwrap();
        store.set_group(&entry.id, Some(group.id.clone())).unwrap();
        store.delete_group(&group.id, GroupDeleteMode::Cascade).unwrap();
        assert!(store.list_active().unwrap().is_empty());
    }
}
