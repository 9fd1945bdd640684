//! Record models
//!
//! Every record kind carries a globally unique id, a last-modified
//! timestamp and the identity of the device that produced the latest
//! revision. The merge engine only ever looks at those three through the
//! [`Replicated`] trait; domain fields are opaque to it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The entity categories the Document is partitioned into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Expenses,
    Projects,
    Stock,
    WorkWeeks,
}

impl RecordKind {
    /// Stable name used in storage and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Expenses => "expenses",
            Self::Projects => "projects",
            Self::Stock => "stock",
            Self::WorkWeeks => "work_weeks",
        }
    }

    /// All categories, in merge order
    #[must_use]
    pub const fn all() -> [Self; 4] {
        [Self::Expenses, Self::Projects, Self::Stock, Self::WorkWeeks]
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expenses" => Ok(Self::Expenses),
            "projects" => Ok(Self::Projects),
            "stock" => Ok(Self::Stock),
            "work_weeks" => Ok(Self::WorkWeeks),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// The merge-relevant surface of every record kind
pub trait Replicated {
    /// Globally unique record id
    fn record_id(&self) -> RecordId;

    /// Last modification timestamp (Unix ms)
    fn last_modified(&self) -> i64;

    /// Device that produced the latest revision
    fn origin_device(&self) -> &str;
}

macro_rules! impl_replicated {
    ($ty:ty) => {
        impl Replicated for $ty {
            fn record_id(&self) -> RecordId {
                self.id
            }

            fn last_modified(&self) -> i64 {
                self.last_modified
            }

            fn origin_device(&self) -> &str {
                &self.origin_device
            }
        }
    };
}

/// An expense entry, grouped by owner inside the Document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: RecordId,
    /// Owner name; doubles as the collection key inside the Document
    pub owner: String,
    pub description: String,
    pub amount_cents: i64,
    pub incurred_on: NaiveDate,
    /// Last update timestamp (Unix ms)
    pub last_modified: i64,
    pub origin_device: String,
}

impl Expense {
    /// Create a new expense stamped with the current time
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        description: impl Into<String>,
        amount_cents: i64,
        incurred_on: NaiveDate,
        origin_device: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            owner: owner.into(),
            description: description.into(),
            amount_cents,
            incurred_on,
            last_modified: now_ms(),
            origin_device: origin_device.into(),
        }
    }
}

impl_replicated!(Expense);

/// Lifecycle state of a project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    OnHold,
    Done,
}

/// A client project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: RecordId,
    pub name: String,
    pub client: String,
    pub status: ProjectStatus,
    pub budget_cents: i64,
    /// Last update timestamp (Unix ms)
    pub last_modified: i64,
    pub origin_device: String,
}

impl Project {
    /// Create a new active project stamped with the current time
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        client: impl Into<String>,
        budget_cents: i64,
        origin_device: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            client: client.into(),
            status: ProjectStatus::Active,
            budget_cents,
            last_modified: now_ms(),
            origin_device: origin_device.into(),
        }
    }
}

impl_replicated!(Project);

/// An inventory line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: RecordId,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    /// Last update timestamp (Unix ms)
    pub last_modified: i64,
    pub origin_device: String,
}

impl StockItem {
    /// Create a new stock item stamped with the current time
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        quantity: i64,
        unit_price_cents: i64,
        origin_device: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            quantity,
            unit_price_cents,
            last_modified: now_ms(),
            origin_device: origin_device.into(),
        }
    }
}

impl_replicated!(StockItem);

/// Days worked by one employee in one week, grouped by week-start date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEntry {
    pub id: RecordId,
    pub employee: String,
    /// Week-start date (`YYYY-MM-DD`); doubles as the collection key
    pub week_start: NaiveDate,
    pub days_worked: f64,
    /// Last update timestamp (Unix ms)
    pub last_modified: i64,
    pub origin_device: String,
}

impl WorkEntry {
    /// Create a new work entry stamped with the current time
    #[must_use]
    pub fn new(
        employee: impl Into<String>,
        week_start: NaiveDate,
        days_worked: f64,
        origin_device: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            employee: employee.into(),
            week_start,
            days_worked,
            last_modified: now_ms(),
            origin_device: origin_device.into(),
        }
    }
}

impl_replicated!(WorkEntry);

/// Current time as Unix milliseconds
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_record_id_unique() {
        let id1 = RecordId::new();
        let id2 = RecordId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_record_id_parse_roundtrip() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_record_kind_roundtrip() {
        for kind in RecordKind::all() {
            let parsed: RecordKind = kind.as_str().parse().unwrap();
            assert_eq!(kind, parsed);
        }
        assert!("invoices".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_expense_new_stamps_metadata() {
        let expense = Expense::new("alice", "Fuel", 4500, date("2026-03-02"), "device-a");
        assert_eq!(expense.owner, "alice");
        assert_eq!(expense.amount_cents, 4500);
        assert!(expense.last_modified > 0);
        assert_eq!(expense.origin_device, "device-a");
    }

    #[test]
    fn test_replicated_surface() {
        let item = StockItem::new("Cement bag", 40, 1299, "device-b");
        assert_eq!(item.record_id(), item.id);
        assert_eq!(item.last_modified(), item.last_modified);
        assert_eq!(item.origin_device(), "device-b");
    }
}
