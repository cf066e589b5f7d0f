use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The seven kinds of action the improvement loop can propose or execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AutoTag,
    MergeDuplicates,
    PromoteToType,
    ArchiveStale,
    CreateGapStubs,
    ResolveContradictions,
    SuggestSchema,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::AutoTag => "auto_tag",
            ActionKind::MergeDuplicates => "merge_duplicates",
            ActionKind::PromoteToType => "promote_to_type",
            ActionKind::ArchiveStale => "archive_stale",
            ActionKind::CreateGapStubs => "create_gap_stubs",
            ActionKind::ResolveContradictions => "resolve_contradictions",
            ActionKind::SuggestSchema => "suggest_schema",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl ActionKind {
    /// Fixed risk classification table from the control plane contract.
    pub fn risk(&self) -> RiskLevel {
        match self {
            ActionKind::AutoTag | ActionKind::CreateGapStubs | ActionKind::SuggestSchema => {
                RiskLevel::Low
            }
            ActionKind::MergeDuplicates | ActionKind::PromoteToType => RiskLevel::Medium,
            ActionKind::ArchiveStale | ActionKind::ResolveContradictions => RiskLevel::High,
        }
    }
}

/// A concrete improvement action the improver proposed, carrying enough
/// payload for both auto-execution and later, identical, approval-driven
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproverAction {
    pub kind: ActionKind,
    /// IDs of entries this action targets (primary key for protection checks).
    pub target_ids: Vec<String>,
    /// Kind-specific extra payload (e.g. the gap query string, the suggested
    /// type name, the survivor/loser pairing).
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Approved,
    Dismissed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub action: ImproverAction,
    pub risk: RiskLevel,
    pub description: String,
    pub reasoning: String,
    pub preview: Value,
    pub status: PendingStatus,
    #[serde(default, rename = "dismissalReason")]
    pub dismissal_reason: Option<String>,
}

/// A standing rule blocking re-proposal of an action kind against an entry
/// or a pattern/scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protection {
    #[serde(default, rename = "entryId")]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub scope: Option<BTreeMap<String, String>>,
    pub blocks: Vec<ActionKind>,
    pub reason: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}
