//! Data models for tally-core

mod document;
mod pending;
mod record;
mod versions;

pub use document::{Document, RateSettings};
pub use pending::{ChangeAction, PendingChange, RecordPayload, SyncStatus};
pub use record::{
    now_ms, Expense, Project, ProjectStatus, RecordId, RecordKind, Replicated, StockItem,
    WorkEntry,
};
pub use versions::{CategoryVersion, SyncVersions};
