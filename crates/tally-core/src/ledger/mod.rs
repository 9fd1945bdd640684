//! Pending-Change Ledger
//!
//! An ordered, persisted queue of not-yet-acknowledged local mutations,
//! stored in its own table so it survives independently of the Document
//! snapshot. Entries leave the ledger only once the remote store has
//! acknowledged them; failed entries stay retryable.

use rusqlite::params;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{ChangeAction, PendingChange, RecordPayload, SyncStatus};

/// SQLite-backed ledger of pending changes
pub struct PendingLedger {
    db: Database,
}

impl PendingLedger {
    /// Create a ledger over an opened database
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a change immediately, before the optimistic Document save.
    /// Returns the ledger entry id.
    pub fn append(&self, change: &PendingChange) -> Result<String> {
        let payload = change
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_changes
                     (change_id, record_id, kind, action, payload,
                      timestamp, origin_device, status, attempts, last_error)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    change.change_id,
                    change.record_id.to_string(),
                    change.kind.as_str(),
                    change.action.as_str(),
                    payload,
                    change.timestamp,
                    change.origin_device,
                    change.status.as_str(),
                    change.attempts,
                    change.last_error,
                ],
            )?;
            Ok(())
        })?;
        Ok(change.change_id.clone())
    }

    /// All unacknowledged entries, oldest first
    pub fn pending(&self) -> Result<Vec<PendingChange>> {
        self.pending_since(0)
    }

    /// Unacknowledged entries at or after `ts`, ordered by timestamp
    /// ascending (stable tie-break on entry id). Ordering matters: later
    /// changes to the same record must replay after earlier ones.
    pub fn pending_since(&self, ts: i64) -> Result<Vec<PendingChange>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT change_id, record_id, kind, action, payload,
                        timestamp, origin_device, status, attempts, last_error
                 FROM pending_changes
                 WHERE status != 'completed' AND timestamp >= ?
                 ORDER BY timestamp ASC, change_id ASC",
            )?;
            let rows = stmt
                .query_map(params![ts], |row| {
                    Ok(RawEntry {
                        change_id: row.get(0)?,
                        record_id: row.get(1)?,
                        kind: row.get(2)?,
                        action: row.get(3)?,
                        payload: row.get(4)?,
                        timestamp: row.get(5)?,
                        origin_device: row.get(6)?,
                        status: row.get(7)?,
                        attempts: row.get(8)?,
                        last_error: row.get(9)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        // A malformed row must not stall the rest of the ledger
        Ok(rows
            .into_iter()
            .filter_map(|raw| match raw.into_change() {
                Ok(change) => Some(change),
                Err(err) => {
                    tracing::warn!("skipping malformed ledger entry: {err}");
                    None
                }
            })
            .collect())
    }

    /// Remove an entry the remote store has acknowledged
    pub fn mark_completed(&self, change_id: &str) -> Result<()> {
        let rows = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM pending_changes WHERE change_id = ?",
                params![change_id],
            )?)
        })?;
        if rows == 0 {
            return Err(Error::NotFound(change_id.to_string()));
        }
        Ok(())
    }

    /// Record a failed push attempt; the entry stays retryable
    pub fn mark_failed(&self, change_id: &str, reason: &str) -> Result<()> {
        let rows = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE pending_changes
                 SET status = 'failed', attempts = attempts + 1, last_error = ?
                 WHERE change_id = ?",
                params![reason, change_id],
            )?)
        })?;
        if rows == 0 {
            return Err(Error::NotFound(change_id.to_string()));
        }
        Ok(())
    }

    /// Number of unacknowledged entries
    pub fn len(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM pending_changes WHERE status != 'completed'",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Whether the ledger has no unacknowledged entries
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

struct RawEntry {
    change_id: String,
    record_id: String,
    kind: String,
    action: String,
    payload: Option<String>,
    timestamp: i64,
    origin_device: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
}

impl RawEntry {
    fn into_change(self) -> Result<PendingChange> {
        let record_id = self
            .record_id
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad record id: {}", self.record_id)))?;
        let kind = self
            .kind
            .parse()
            .map_err(Error::InvalidInput)?;
        let action = match self.action.as_str() {
            "create" => ChangeAction::Create,
            "update" => ChangeAction::Update,
            "delete" => ChangeAction::Delete,
            other => return Err(Error::InvalidInput(format!("bad action: {other}"))),
        };
        let status = match self.status.as_str() {
            "pending" => SyncStatus::Pending,
            "completed" => SyncStatus::Completed,
            "failed" => SyncStatus::Failed,
            other => return Err(Error::InvalidInput(format!("bad status: {other}"))),
        };
        let payload: Option<RecordPayload> = self
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(PendingChange {
            change_id: self.change_id,
            record_id,
            kind,
            action,
            payload,
            timestamp: self.timestamp,
            origin_device: self.origin_device,
            status,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Collapse multiple entries for the same `(kind, record id)` pair into
/// the single most recent one before transmission; only the final state
/// matters to the remote store. A delete consolidates over any prior
/// create/update for the same record.
#[must_use]
pub fn consolidate(mut changes: Vec<PendingChange>) -> Vec<PendingChange> {
    use std::collections::BTreeMap;

    changes.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.change_id.cmp(&b.change_id))
    });

    let mut latest: BTreeMap<(crate::models::RecordKind, String), PendingChange> = BTreeMap::new();
    for change in changes {
        latest.insert((change.kind, change.record_id.to_string()), change);
    }

    let mut result: Vec<PendingChange> = latest.into_values().collect();
    result.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.change_id.cmp(&b.change_id))
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Expense, RecordKind, StockItem};
    use pretty_assertions::assert_eq;

    fn setup() -> PendingLedger {
        PendingLedger::new(Database::open_in_memory().unwrap())
    }

    fn stock_change(name: &str) -> PendingChange {
        PendingChange::create(
            RecordPayload::Stock(StockItem::new(name, 1, 100, "dev-a")),
            "dev-a",
        )
    }

    #[test]
    fn test_append_and_pending_roundtrip() {
        let ledger = setup();
        let change = stock_change("Paint");
        ledger.append(&change).unwrap();

        let pending = ledger.pending().unwrap();
        assert_eq!(pending, vec![change]);
    }

    #[test]
    fn test_pending_orders_by_timestamp() {
        let ledger = setup();
        let mut early = stock_change("Early");
        early.timestamp = 100;
        let mut late = stock_change("Late");
        late.timestamp = 200;

        ledger.append(&late).unwrap();
        ledger.append(&early).unwrap();

        let pending = ledger.pending().unwrap();
        assert_eq!(pending[0].timestamp, 100);
        assert_eq!(pending[1].timestamp, 200);
    }

    #[test]
    fn test_pending_since_filters_older_entries() {
        let ledger = setup();
        let mut early = stock_change("Early");
        early.timestamp = 100;
        let mut late = stock_change("Late");
        late.timestamp = 200;
        ledger.append(&early).unwrap();
        ledger.append(&late).unwrap();

        let pending = ledger.pending_since(150).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].timestamp, 200);
    }

    #[test]
    fn test_mark_completed_removes_entry() {
        let ledger = setup();
        let change = stock_change("Paint");
        ledger.append(&change).unwrap();

        ledger.mark_completed(&change.change_id).unwrap();
        assert!(ledger.is_empty().unwrap());

        // A second ack for the same entry is an error, not silent
        assert!(ledger.mark_completed(&change.change_id).is_err());
    }

    #[test]
    fn test_mark_failed_keeps_entry_retryable() {
        let ledger = setup();
        let change = stock_change("Paint");
        ledger.append(&change).unwrap();

        ledger.mark_failed(&change.change_id, "remote timeout").unwrap();

        let pending = ledger.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, SyncStatus::Failed);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("remote timeout"));
    }

    #[test]
    fn test_consolidate_keeps_most_recent_per_record() {
        let item = StockItem::new("Paint", 1, 100, "dev-a");
        let mut created = PendingChange::create(RecordPayload::Stock(item.clone()), "dev-a");
        created.timestamp = 100;

        let mut updated_item = item.clone();
        updated_item.quantity = 5;
        updated_item.last_modified = 200;
        let mut updated = PendingChange::update(RecordPayload::Stock(updated_item), "dev-a");
        updated.timestamp = 200;

        let other = stock_change("Brush");

        let batch = consolidate(vec![created, updated.clone(), other.clone()]);
        assert_eq!(batch.len(), 2);
        assert!(batch.contains(&updated));
        assert!(batch.contains(&other));
    }

    #[test]
    fn test_consolidate_delete_swallows_prior_entries() {
        let item = StockItem::new("Paint", 1, 100, "dev-a");
        let id = item.id;
        let mut created = PendingChange::create(RecordPayload::Stock(item), "dev-a");
        created.timestamp = 100;
        let mut deleted = PendingChange::delete(RecordKind::Stock, id, "dev-a");
        deleted.timestamp = 300;

        let batch = consolidate(vec![created, deleted.clone()]);
        assert_eq!(batch, vec![deleted]);
    }

    #[test]
    fn test_malformed_ledger_row_is_skipped() {
        let ledger = setup();
        let good = stock_change("Paint");
        ledger.append(&good).unwrap();

        ledger
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO pending_changes
                         (change_id, record_id, kind, action, payload,
                          timestamp, origin_device, status, attempts, last_error)
                     VALUES ('bad', 'not-a-uuid', 'expenses', 'create', NULL,
                             1, 'dev-x', 'pending', 0, NULL)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let pending = ledger.pending().unwrap();
        assert_eq!(pending, vec![good]);
    }

    #[test]
    fn test_expense_payload_roundtrip() {
        let ledger = setup();
        let change = PendingChange::create(
            RecordPayload::Expense(Expense::new(
                "alice",
                "Fuel",
                4500,
                "2026-03-02".parse().unwrap(),
                "dev-a",
            )),
            "dev-a",
        );
        ledger.append(&change).unwrap();

        let pending = ledger.pending().unwrap();
        assert_eq!(pending[0].payload, change.payload);
    }
}
