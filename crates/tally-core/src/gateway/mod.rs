//! Remote store access
//!
//! The sync engine talks to the remote store only through the traits in
//! this module, so passes and the realtime listener can be exercised
//! against in-process fakes. The HTTP adapter lives in [`http`].

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    ChangeAction, Document, PendingChange, RecordId, RecordKind, RecordPayload, SyncStatus,
    SyncVersions,
};

/// What a pull pass received from the remote store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePull {
    /// The remote Document view, absent when the remote has no data yet
    pub document: Option<Document>,
    /// Server clock at the time of the pull (Unix ms)
    pub server_timestamp: i64,
    /// Per-category versions as of this pull
    #[serde(default)]
    pub versions: SyncVersions,
}

/// One rejected change from a push batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRejection {
    pub change_id: String,
    pub reason: String,
}

/// Remote acknowledgement of a push batch. Partial acceptance is normal;
/// rejected entries stay in the ledger for the next pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushReport {
    /// Ids of the changes the remote durably accepted
    #[serde(default)]
    pub accepted: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<PushRejection>,
}

/// A single change announced by the realtime feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    pub kind: RecordKind,
    pub action: ChangeAction,
    pub record_id: RecordId,
    /// Present for create/update events
    pub payload: Option<RecordPayload>,
    /// Device that made the change; used for echo suppression
    pub origin_device: String,
    /// When the change was made (Unix ms)
    pub timestamp: i64,
}

impl From<FeedEvent> for PendingChange {
    /// Re-express a feed event as a change so it flows through the same
    /// application path as ledger entries
    fn from(event: FeedEvent) -> Self {
        Self {
            change_id: format!("feed-{}-{}", event.record_id, event.timestamp),
            record_id: event.record_id,
            kind: event.kind,
            action: event.action,
            payload: event.payload,
            timestamp: event.timestamp,
            origin_device: event.origin_device,
            status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Pull/push access to the remote store
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Fetch the remote Document view. `versions` lets the remote answer
    /// with a delta; a remote that ignores it returns the full view.
    async fn pull(&self, versions: &SyncVersions) -> Result<RemotePull>;

    /// Transmit the reconciled Document together with the consolidated
    /// change batch; returns the per-change acknowledgement. Must be
    /// safely retryable (upsert-by-id, not append-only).
    async fn push(&self, document: &Document, changes: &[PendingChange]) -> Result<PushReport>;
}

/// A live subscription to server-originated change events
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next batch of events; `Ok(None)` means the feed closed and the
    /// listener should resubscribe
    async fn next_events(&mut self) -> Result<Option<Vec<FeedEvent>>>;
}

/// Something that can open change-feed subscriptions
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>>;
}
