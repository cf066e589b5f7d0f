mod action;
mod entry;
mod group;

pub use action::{ActionKind, ImproverAction, PendingAction, PendingStatus, Protection, RiskLevel};
pub use entry::{Entry, FieldValue, StructuredData};
pub use group::{Group, GroupDeleteMode};
