//! Component G — risk classification, the pending-action queue, and the
//! protection list that the improver consults before proposing anything.

use crate::config::Config;
use crate::error::Result;
use crate::ids::content_id;
use crate::model::{ActionKind, Entry, ImproverAction, PendingAction, PendingStatus, Protection, RiskLevel};
use crate::observer::Observer;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub struct ControlPlane<'a> {
    observer: &'a Observer,
    config: &'a Config,
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    AutoExecuted(ImproverAction),
    Enqueued(PendingAction),
    Skipped,
}

impl<'a> ControlPlane<'a> {
    pub fn new(observer: &'a Observer, config: &'a Config) -> Self {
        Self { observer, config }
    }

    pub fn auto_approves(&self, risk: RiskLevel) -> bool {
        match risk {
            RiskLevel::Low => self.config.auto_approve_low,
            RiskLevel::Medium => self.config.auto_approve_medium,
            RiskLevel::High => self.config.auto_approve_high,
        }
    }

    /// Classifies `action`, checking first whether an equivalent pending
    /// action already exists (de-duplication by kind + overlapping targets).
    pub fn route(&self, action: ImproverAction) -> Result<RouteOutcome> {
        let risk = action.kind.risk();
        let already_pending = self.has_overlapping_pending(&action)?;
        if already_pending {
            return Ok(RouteOutcome::Skipped);
        }

        if self.auto_approves(risk) {
            return Ok(RouteOutcome::AutoExecuted(action));
        }

        let pending = self.enqueue(action, risk)?;
        Ok(RouteOutcome::Enqueued(pending))
    }

    fn has_overlapping_pending(&self, action: &ImproverAction) -> Result<bool> {
        let raw = self.observer.load_raw()?;
        Ok(raw.pending_actions.iter().any(|p| {
            p.status == PendingStatus::Pending
                && p.action.kind == action.kind
                && p.action
                    .target_ids
                    .iter()
                    .any(|id| action.target_ids.contains(id))
        }))
    }

    fn enqueue(&self, action: ImproverAction, risk: RiskLevel) -> Result<PendingAction> {
        let (description, reasoning, preview) = describe_action(&action);
        let now = Utc::now();
        let pending = PendingAction {
            id: content_id(&[action.kind.as_str(), &action.target_ids.join(",")]),
            created_at: now,
            expires_at: now + Duration::milliseconds(self.config.pending_ttl_ms as i64),
            action,
            risk,
            description,
            reasoning,
            preview,
            status: PendingStatus::Pending,
            dismissal_reason: None,
        };
        let stored = pending.clone();
        self.observer.with_raw(|raw| {
            raw.pending_actions.push(pending);
            Ok(())
        })?;
        Ok(stored)
    }

    pub fn list_pending(&self) -> Result<Vec<PendingAction>> {
        Ok(self
            .observer
            .load_raw()?
            .pending_actions
            .into_iter()
            .filter(|p| p.status == PendingStatus::Pending)
            .collect())
    }

    /// Walks the pending list and expires anything past its TTL. Never
    /// auto-approves.
    pub fn expire_due(&self) -> Result<usize> {
        let now = Utc::now();
        self.observer.with_raw(|raw| {
            let mut expired = 0;
            for action in raw.pending_actions.iter_mut() {
                if action.status == PendingStatus::Pending && action.expires_at < now {
                    action.status = PendingStatus::Expired;
                    expired += 1;
                }
            }
            Ok(expired)
        })
    }

    /// Marks `id` approved if it is still pending; returns the action so the
    /// caller (the improver's execution logic) can run it. A non-pending or
    /// missing ID returns `Ok(None)` — a structured no-op, not an error.
    pub fn approve(&self, id: &str) -> Result<Option<ImproverAction>> {
        self.observer.with_raw(|raw| {
            let Some(action) = raw.pending_actions.iter_mut().find(|p| p.id == id) else {
                return Ok(None);
            };
            if action.status != PendingStatus::Pending {
                return Ok(None);
            }
            action.status = PendingStatus::Approved;
            Ok(Some(action.action.clone()))
        })
    }

    pub fn dismiss(&self, id: &str, reason: Option<String>) -> Result<bool> {
        let dismissed_action = self.observer.with_raw(|raw| {
            let Some(action) = raw.pending_actions.iter_mut().find(|p| p.id == id) else {
                return Ok(None);
            };
            if action.status != PendingStatus::Pending {
                return Ok(None);
            }
            action.status = PendingStatus::Dismissed;
            action.dismissal_reason = reason.clone();
            Ok(Some(action.clone()))
        })?;

        let Some(dismissed) = dismissed_action else {
            return Ok(false);
        };
        self.learn_from_dismissal(&dismissed)?;
        Ok(true)
    }

    /// Entry-scoped protections are added immediately. A broader
    /// pattern/scope protection is added once the same user has dismissed
    /// three actions of the same kind sharing a scope (e.g. the same
    /// `typeName`) within recent history.
    fn learn_from_dismissal(&self, dismissed: &PendingAction) -> Result<()> {
        self.observer.with_raw(|raw| {
            for entry_id in &dismissed.action.target_ids {
                raw.protections.push(Protection {
                    entry_id: Some(entry_id.clone()),
                    pattern: None,
                    scope: None,
                    blocks: vec![dismissed.action.kind],
                    reason: dismissed
                        .dismissal_reason
                        .clone()
                        .unwrap_or_else(|| "dismissed by user".to_string()),
                    created_at: Utc::now(),
                });
            }

            if let Some(scope_key) = dismissed
                .action
                .payload
                .get("typeName")
                .and_then(Value::as_str)
            {
                let recent_same_kind_and_scope = raw
                    .pending_actions
                    .iter()
                    .filter(|p| {
                        p.status == PendingStatus::Dismissed
                            && p.action.kind == dismissed.action.kind
                            && p.action.payload.get("typeName").and_then(Value::as_str)
                                == Some(scope_key)
                    })
                    .count();
                if recent_same_kind_and_scope >= 3 {
                    let mut scope = BTreeMap::new();
                    scope.insert("typeName".to_string(), scope_key.to_string());
                    let already_has_pattern = raw.protections.iter().any(|p| {
                        p.scope.as_ref() == Some(&scope) && p.blocks.contains(&dismissed.action.kind)
                    });
                    if !already_has_pattern {
                        raw.protections.push(Protection {
                            entry_id: None,
                            pattern: Some(scope_key.to_string()),
                            scope: Some(scope),
                            blocks: vec![dismissed.action.kind],
                            reason: format!(
                                "user dismissed 3+ {} actions for typeName={}",
                                dismissed.action.kind.as_str(),
                                scope_key
                            ),
                            created_at: Utc::now(),
                        });
                    }
                }
            }
            Ok(())
        })
    }

    /// True if any entry-scoped protection names `entry` and `kind`, or any
    /// scope-scoped protection's scope matches the entry's attributes and
    /// blocks `kind`.
    pub fn is_protected(&self, entry: &Entry, kind: ActionKind) -> Result<bool> {
        let raw = self.observer.load_raw()?;
        Ok(raw.protections.iter().any(|p| {
            if !p.blocks.contains(&kind) {
                return false;
            }
            if p.entry_id.as_deref() == Some(entry.id.as_str()) {
                return true;
            }
            if let Some(scope) = &p.scope {
                return scope.iter().all(|(key, value)| match key.as_str() {
                    "typeName" => entry.type_name.as_deref() == Some(value.as_str()),
                    _ => false,
                });
            }
            false
        }))
    }
}

fn describe_action(action: &ImproverAction) -> (String, String, Value) {
    let count = action.target_ids.len();
    match action.kind {
        ActionKind::AutoTag => (
            format!("Tag {count} untagged entries"),
            "Entries with no tags reduce recall precision; keyword tags improve search."
                .to_string(),
            json!({"entryIds": action.target_ids}),
        ),
        ActionKind::MergeDuplicates => (
            "Merge a pair of near-duplicate entries".to_string(),
            "Two same-type entries have high word-overlap similarity and likely say the same thing."
                .to_string(),
            action.payload.clone(),
        ),
        ActionKind::PromoteToType => (
            format!("Promote {count} entries to a declared type"),
            "These entries' content matches a declared type's description closely enough to tag them."
                .to_string(),
            action.payload.clone(),
        ),
        ActionKind::ArchiveStale => (
            format!("Archive {count} stale, never-read entries"),
            "These entries have not been updated in 180+ days and were never returned by a read."
                .to_string(),
            json!({"entryIds": action.target_ids}),
        ),
        ActionKind::CreateGapStubs => (
            format!("Create {count} gap stub entries"),
            "These queries were missed repeatedly with no matching context.".to_string(),
            action.payload.clone(),
        ),
        ActionKind::ResolveContradictions => (
            "Archive the older side of a contradiction".to_string(),
            "Two same-type entries are in semantic tension and differ in age by 180+ days."
                .to_string(),
            action.payload.clone(),
        ),
        ActionKind::SuggestSchema => (
            "Suggest new schema types from untyped entries".to_string(),
            "Five or more untyped entries share enough structure to warrant a declared type."
                .to_string(),
            action.payload.clone(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImproverAction;

    fn harness() -> (tempfile::TempDir, Observer, Config) {
        let dir = tempfile::tempdir().unwrap();
        let observer = Observer::new(dir.path().join("awareness.json"));
        (dir, observer, Config::default())
    }

    #[test]
    fn low_risk_auto_executes_by_default() {
        let (_dir, observer, config) = harness();
        let plane = ControlPlane::new(&observer, &config);
        let action = ImproverAction {
            kind: ActionKind::AutoTag,
            target_ids: vec!["a".into()],
            payload: json!({}),
        };
        match plane.route(action).unwrap() {
            RouteOutcome::AutoExecuted(_) => {}
            other => panic!("expected auto-execution, got {other:?}"),
        }
    }

    #[test]
    fn high_risk_is_enqueued_by_default() {
        let (_dir, observer, config) = harness();
        let plane = ControlPlane::new(&observer, &config);
        let action = ImproverAction {
            kind: ActionKind::ArchiveStale,
            target_ids: vec!["a".into()],
            payload: json!({}),
        };
        match plane.route(action).unwrap() {
            RouteOutcome::Enqueued(pending) => assert_eq!(pending.risk, RiskLevel::High),
            other => panic!("expected enqueue, got {other:?}"),
        }
    }

    #[test]
    fn approving_a_non_pending_action_is_a_no_op() {
        let (_dir, observer, config) = harness();
        let plane = ControlPlane::new(&observer, &config);
        let action = ImproverAction {
            kind: ActionKind::ArchiveStale,
            target_ids: vec!["a".into()],
            payload: json!({}),
        };
        let pending = match plane.route(action).unwrap() {
            RouteOutcome::Enqueued(p) => p,
            _ => unreachable!(),
        };
        assert!(plane.dismiss(&pending.id, None).unwrap());
        assert!(plane.approve(&pending.id).unwrap().is_none());
    }

    #[test]
    fn three_dismissals_of_same_kind_and_type_learn_a_scope_protection() {
        let (_dir, observer, config) = harness();
        let plane = ControlPlane::new(&observer, &config);
        for i in 0..3 {
            let action = ImproverAction {
                kind: ActionKind::MergeDuplicates,
                target_ids: vec![format!("e{i}")],
                payload: json!({"typeName": "preference"}),
            };
            let pending = match plane.route(action).unwrap() {
                RouteOutcome::Enqueued(p) => p,
                _ => unreachable!(),
            };
            plane.dismiss(&pending.id, Some("not useful".into())).unwrap();
        }
        let raw = observer.load_raw().unwrap();
        assert!(raw.protections.iter().any(|p| p.pattern.as_deref() == Some("preference")));
    }
}
