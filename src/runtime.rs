//! The facade both transport adapters drive: one store, one observer, an
//! optional catalog, and an always-present (possibly disabled) analyzer,
//! wired together the way the improver and control plane expect. Recording
//! observer events on every store access lives here rather than in
//! `Store`, keeping the store itself free of the observer's concerns.

use crate::analyzer::{Analyzer, RankedEntry, SchemaSuggestion};
use crate::config::Config;
use crate::control::ControlPlane;
use crate::error::Result;
use crate::improver::{Improver, TickReport};
use crate::model::{Entry, Group, GroupDeleteMode, ImproverAction, PendingAction, StructuredData};
use crate::observer::{EventAction, ImprovementRecord, Observer};
use crate::schema::{self, Catalog};
use crate::selfmodel::{self, Contradiction, SelfModel};
use crate::store::{FieldFilter, Store};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

const SHALLOW_CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedModel {
    computed_at: Instant,
    model: SelfModel,
}

pub struct Runtime {
    pub store: Store,
    pub observer: Observer,
    pub catalog: RwLock<Option<Catalog>>,
    pub analyzer: Analyzer,
    pub config: Config,
    shallow_cache: Mutex<Option<CachedModel>>,
    deep_cache: Mutex<Option<CachedModel>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        let store = Store::open(config.store_path.clone())?;
        let observer = Observer::new(config.awareness_path.clone());
        let catalog = schema::load_catalog(&config.schema_path)?;
        let analyzer = Analyzer::new(
            config.lm_host.clone(),
            config.lm_model.clone(),
            config.lm_enabled,
        );
        Ok(Self {
            store,
            observer,
            catalog: RwLock::new(catalog),
            analyzer,
            config,
            shallow_cache: Mutex::new(None),
            deep_cache: Mutex::new(None),
        })
    }

    fn catalog_snapshot(&self) -> Option<Catalog> {
        self.catalog.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn invalidate_cache(&self) {
        *self.shallow_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.deep_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // ---- entries ------------------------------------------------------

    pub fn save_context(
        &self,
        content: String,
        tags: Vec<String>,
        source: String,
        group_id: Option<String>,
    ) -> Result<Entry> {
        let mut entry = self.store.save(content, tags, source)?;
        if group_id.is_some() {
            entry = self.store.set_group(&entry.id, group_id)?;
        }
        self.observer.record(
            EventAction::Write,
            "save_context",
            None,
            entry.type_name.as_deref(),
            std::slice::from_ref(&entry.id),
        )?;
        self.invalidate_cache();
        Ok(entry)
    }

    pub fn save_typed_context(
        &self,
        type_name: &str,
        data: StructuredData,
        tags: Vec<String>,
        source: String,
    ) -> Result<(Entry, Vec<String>)> {
        let (entry, errors) = match self.catalog_snapshot() {
            Some(catalog) => self.store.save_typed(&catalog, type_name, data, tags, source)?,
            None => {
                let content = schema::render_content(type_name, &data);
                let mut entry = self.store.save(content, tags, source)?;
                entry = self.store.set_type(&entry.id, Some(type_name.to_string()))?;
                (
                    entry,
                    vec!["No schema is configured; entry saved without validation.".to_string()],
                )
            }
        };
        self.observer.record(
            EventAction::Write,
            "save_typed_context",
            None,
            Some(type_name),
            std::slice::from_ref(&entry.id),
        )?;
        self.invalidate_cache();
        Ok((entry, errors))
    }

    pub fn get_context(&self, id: &str) -> Result<Option<Entry>> {
        self.store.get(id)
    }

    pub fn update_context(
        &self,
        id: &str,
        content: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Entry> {
        let entry = self.store.update(id, content, tags)?;
        self.observer.record(
            EventAction::Write,
            "update_context",
            None,
            entry.type_name.as_deref(),
            std::slice::from_ref(&entry.id),
        )?;
        self.invalidate_cache();
        Ok(entry)
    }

    pub fn delete_context(&self, id: &str) -> Result<()> {
        self.store.delete(id)?;
        self.observer.record(
            EventAction::Write,
            "delete_context",
            None,
            None,
            &[id.to_string()],
        )?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn list_contexts(&self, tag: Option<&str>) -> Result<Vec<Entry>> {
        let results = match tag {
            Some(tag) => self.store.by_tag(tag)?,
            None => self.store.list_active()?,
        };
        self.observer.record(
            EventAction::Read,
            "list_contexts",
            None,
            None,
            &ids_of(&results),
        )?;
        Ok(results)
    }

    pub fn recall_context(&self, query: &str) -> Result<Vec<Entry>> {
        let results = self.store.recall(query)?;
        self.record_query_outcome("recall_context", query, &results)?;
        Ok(results)
    }

    pub fn search_context(&self, query: &str) -> Result<Vec<Entry>> {
        let results = self.store.search(query)?;
        self.record_query_outcome("search_context", query, &results)?;
        Ok(results)
    }

    pub async fn query_by_type(
        &self,
        type_name: &str,
        filter: &FieldFilter,
        ranked: bool,
    ) -> Result<Vec<Entry>> {
        let mut results = self.store.query_by_type(type_name, filter)?;
        if ranked && !results.is_empty() {
            let ranked_entries: Vec<RankedEntry> =
                self.analyzer.rank_by_relevance(&results, type_name).await;
            results = ranked_entries.into_iter().map(|r| r.entry).collect();
        }
        if results.is_empty() {
            self.observer.record(
                EventAction::Miss,
                "query_by_type",
                Some(type_name),
                Some(type_name),
                &[],
            )?;
        } else {
            self.observer.record(
                EventAction::Read,
                "query_by_type",
                None,
                Some(type_name),
                &ids_of(&results),
            )?;
        }
        Ok(results)
    }

    fn record_query_outcome(&self, tool: &str, query: &str, results: &[Entry]) -> Result<()> {
        if results.is_empty() {
            self.observer.record(EventAction::Miss, tool, Some(query), None, &[])
        } else {
            self.observer
                .record(EventAction::Read, tool, Some(query), None, &ids_of(results))
        }
    }

    // ---- groups ---------------------------------------------------------

    pub fn create_group(&self, name: String, description: Option<String>) -> Result<Group> {
        let group = self.store.create_group(name, description)?;
        self.observer.record(
            EventAction::Write,
            "create_group",
            None,
            None,
            std::slice::from_ref(&group.id),
        )?;
        Ok(group)
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let groups = self.store.list_groups()?;
        self.observer.record(
            EventAction::Read,
            "list_groups",
            None,
            None,
            &group_ids(&groups),
        )?;
        Ok(groups)
    }

    pub fn update_group(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Group> {
        let group = self.store.update_group(id, name, description)?;
        self.observer.record(
            EventAction::Write,
            "update_group",
            None,
            None,
            std::slice::from_ref(&group.id),
        )?;
        Ok(group)
    }

    pub fn delete_group(&self, id: &str, mode: GroupDeleteMode) -> Result<()> {
        self.store.delete_group(id, mode)?;
        self.observer.record(
            EventAction::Write,
            "delete_group",
            None,
            None,
            &[id.to_string()],
        )?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn contexts_in_group(&self, group_id: &str) -> Result<Vec<Entry>> {
        let results = self.store.by_group(group_id)?;
        self.observer.record(
            EventAction::Read,
            "contexts_in_group",
            None,
            None,
            &ids_of(&results),
        )?;
        Ok(results)
    }

    // ---- schema -----------------------------------------------------------

    pub fn describe_schema(&self) -> String {
        schema::describe(self.catalog_snapshot().as_ref())
    }

    pub fn get_catalog(&self) -> Option<Catalog> {
        self.catalog_snapshot()
    }

    pub fn put_catalog(&self, catalog: Catalog) -> Result<()> {
        schema::save_catalog(&self.config.schema_path, &catalog)?;
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Some(catalog);
        self.invalidate_cache();
        Ok(())
    }

    // ---- self-model -------------------------------------------------------

    pub async fn introspect(&self, deep: bool) -> Result<SelfModel> {
        let cache = if deep { &self.deep_cache } else { &self.shallow_cache };
        let ttl = if deep {
            Duration::from_millis(self.config.deep_cache_ttl_ms)
        } else {
            SHALLOW_CACHE_TTL
        };
        if let Some(cached) = cache.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if cached.computed_at.elapsed() < ttl {
                return Ok(cached.model.clone());
            }
        }

        let active = self.store.list_active()?;
        let group_count = self.store.list_groups()?.len();
        let catalog = self.catalog_snapshot();
        let mut model = selfmodel::build_with_groups(
            &active,
            group_count,
            catalog.as_ref(),
            Some(&self.observer),
        );
        if deep {
            model.contradictions = self.analyzer.detect_contradictions(&active).await;
        }

        *cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedModel {
            computed_at: Instant::now(),
            model: model.clone(),
        });
        Ok(model)
    }

    pub async fn get_gaps(&self) -> Result<Vec<selfmodel::Gap>> {
        Ok(self.introspect(false).await?.gaps)
    }

    pub fn report_usefulness(&self, entry_id: &str, helpful: bool) -> Result<()> {
        self.observer.record_usefulness(entry_id, helpful)
    }

    pub async fn analyze_contradictions(&self) -> Result<Vec<Contradiction>> {
        let active = self.store.list_active()?;
        Ok(self.analyzer.detect_contradictions(&active).await)
    }

    pub async fn suggest_schema(&self) -> Result<Vec<SchemaSuggestion>> {
        let untyped: Vec<Entry> = self
            .store
            .list_active()?
            .into_iter()
            .filter(|e| e.type_name.is_none())
            .collect();
        Ok(self.analyzer.suggest_schema(&untyped).await)
    }

    pub async fn summarize_context(&self, focus: Option<&str>) -> Result<String> {
        let active = self.store.list_active()?;
        Ok(self.analyzer.summarize(&active, focus).await)
    }

    pub fn get_improvements(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ImprovementRecord>> {
        match since {
            Some(cutoff) => self.observer.improvements_since(cutoff),
            None => Ok(self.observer.load_raw()?.improvements),
        }
    }

    // ---- control plane ------------------------------------------------

    pub fn review_pending_actions(&self) -> Result<Vec<PendingAction>> {
        ControlPlane::new(&self.observer, &self.config).list_pending()
    }

    pub fn approve_action(&self, id: &str) -> Result<Option<ImproverAction>> {
        let plane = ControlPlane::new(&self.observer, &self.config);
        let Some(action) = plane.approve(id)? else {
            return Ok(None);
        };
        let catalog = self.catalog_snapshot();
        let improver = Improver {
            store: &self.store,
            catalog: catalog.as_ref(),
            observer: &self.observer,
            analyzer: Some(&self.analyzer),
            config: &self.config,
        };
        improver.execute(&action)?;
        self.invalidate_cache();
        Ok(Some(action))
    }

    pub fn dismiss_action(&self, id: &str, reason: Option<String>) -> Result<bool> {
        ControlPlane::new(&self.observer, &self.config).dismiss(id, reason)
    }

    // ---- improvement tick ---------------------------------------------

    pub async fn tick(&self) -> TickReport {
        let catalog = self.catalog_snapshot();
        let improver = Improver {
            store: &self.store,
            catalog: catalog.as_ref(),
            observer: &self.observer,
            analyzer: Some(&self.analyzer),
            config: &self.config,
        };
        let report = improver.tick().await;
        self.invalidate_cache();
        info!(
            "background tick: {} kinds auto-executed, {} enqueued",
            report.auto_executed.len(),
            report.enqueued
        );
        report
    }
}

fn ids_of(entries: &[Entry]) -> Vec<String> {
    entries.iter().map(|e| e.id.clone()).collect()
}

fn group_ids(groups: &[Group]) -> Vec<String> {
    groups.iter().map(|g| g.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> (tempfile::TempDir, Runtime) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store_path = dir.path().join("store.json");
        config.awareness_path = dir.path().join("awareness.json");
        config.schema_path = dir.path().join("schema.json");
        config.lm_enabled = false;
        (dir, Runtime::new(config).unwrap())
    }

    #[test]
    fn save_then_recall_round_trips() {
        let (_dir, rt) = runtime();
        let saved = rt
            .save_context("remember this".into(), vec![], "test".into(), None)
            .unwrap();
        let found = rt.recall_context("remember").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, saved.id);
    }

    #[tokio::test]
    async fn cold_start_introspect_is_sparse() {
        let (_dir, rt) = runtime();
        let model = rt.introspect(false).await.unwrap();
        assert_eq!(model.health, selfmodel::Health::Sparse);
    }

    #[tokio::test]
    async fn approving_an_unknown_pending_action_is_a_no_op() {
        let (_dir, rt) = runtime();
        assert!(rt.approve_action("does-not-exist").unwrap().is_none());
    }
}
