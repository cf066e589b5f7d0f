use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named collection that entries may optionally belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn new(name: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::ids::content_id(&[&name]),
            name,
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What happens to an entry's group back-reference when its group is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDeleteMode {
    Orphan,
    Cascade,
}
