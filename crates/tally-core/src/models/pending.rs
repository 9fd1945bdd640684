//! Pending-change model
//!
//! A `PendingChange` is the durable record of a local mutation that the
//! remote store has not acknowledged yet. It is written to its own table
//! before the optimistic Document save, so a crash between the two cannot
//! lose the intent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{now_ms, Expense, Project, RecordId, RecordKind, Replicated, StockItem, WorkEntry};

/// What a pending change does to its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    /// Stable name used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Ledger lifecycle state of a pending change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl SyncStatus {
    /// Stable name used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The record carried by a create/update change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum RecordPayload {
    Expense(Expense),
    Project(Project),
    Stock(StockItem),
    Work(WorkEntry),
}

impl RecordPayload {
    /// Category this payload belongs to
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Expense(_) => RecordKind::Expenses,
            Self::Project(_) => RecordKind::Projects,
            Self::Stock(_) => RecordKind::Stock,
            Self::Work(_) => RecordKind::WorkWeeks,
        }
    }

    /// Id of the carried record
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::Expense(r) => r.record_id(),
            Self::Project(r) => r.record_id(),
            Self::Stock(r) => r.record_id(),
            Self::Work(r) => r.record_id(),
        }
    }

    /// Last-modified timestamp of the carried record
    #[must_use]
    pub fn last_modified(&self) -> i64 {
        match self {
            Self::Expense(r) => r.last_modified(),
            Self::Project(r) => r.last_modified(),
            Self::Stock(r) => r.last_modified(),
            Self::Work(r) => r.last_modified(),
        }
    }
}

/// A locally applied mutation not yet acknowledged by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Unique ledger entry id
    pub change_id: String,
    /// Id of the mutated record
    pub record_id: RecordId,
    pub kind: RecordKind,
    pub action: ChangeAction,
    /// Present for create/update; `None` for delete
    pub payload: Option<RecordPayload>,
    /// When the mutation was made (Unix ms); replay order within a device
    pub timestamp: i64,
    pub origin_device: String,
    pub status: SyncStatus,
    /// Failed push attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingChange {
    /// Pending change for a freshly created record
    #[must_use]
    pub fn create(payload: RecordPayload, origin_device: impl Into<String>) -> Self {
        Self::with_payload(ChangeAction::Create, payload, origin_device)
    }

    /// Pending change for an in-place record update
    #[must_use]
    pub fn update(payload: RecordPayload, origin_device: impl Into<String>) -> Self {
        Self::with_payload(ChangeAction::Update, payload, origin_device)
    }

    /// Pending change for a record deletion, stamped with the current time
    #[must_use]
    pub fn delete(kind: RecordKind, record_id: RecordId, origin_device: impl Into<String>) -> Self {
        Self {
            change_id: Uuid::now_v7().to_string(),
            record_id,
            kind,
            action: ChangeAction::Delete,
            payload: None,
            timestamp: now_ms(),
            origin_device: origin_device.into(),
            status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    fn with_payload(
        action: ChangeAction,
        payload: RecordPayload,
        origin_device: impl Into<String>,
    ) -> Self {
        Self {
            change_id: Uuid::now_v7().to_string(),
            record_id: payload.record_id(),
            kind: payload.kind(),
            action,
            timestamp: payload.last_modified(),
            payload: Some(payload),
            origin_device: origin_device.into(),
            status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}
