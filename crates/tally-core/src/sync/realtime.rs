//! Realtime Change Listener
//!
//! Holds one subscription to the remote change feed and forwards its
//! events to the orchestrator, which applies them through the same
//! merge path as a sync pass. Echo suppression happens on the worker
//! against the device identity. A dropped subscription is reopened with
//! capped exponential backoff; any events missed while reconnecting are
//! healed by the next full pull, so the listener is an optimization,
//! not a correctness requirement.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::gateway::ChangeFeedSource;

use super::SyncOrchestrator;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Background task pumping feed events into the orchestrator
pub struct RealtimeListener {
    handle: JoinHandle<()>,
}

impl RealtimeListener {
    /// Spawn the listener. It runs until aborted or until the
    /// orchestrator's worker is gone.
    #[must_use]
    pub fn spawn(source: Arc<dyn ChangeFeedSource>, orchestrator: SyncOrchestrator) -> Self {
        let handle = tokio::spawn(listen_loop(source, orchestrator));
        Self { handle }
    }

    /// Stop the listener task
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn listen_loop(source: Arc<dyn ChangeFeedSource>, orchestrator: SyncOrchestrator) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match source.subscribe().await {
            Ok(mut feed) => {
                tracing::debug!("change feed subscribed");
                loop {
                    match feed.next_events().await {
                        Ok(Some(events)) => {
                            // Only a delivered batch proves the feed is
                            // healthy; subscribe alone may be local-only
                            backoff = INITIAL_BACKOFF;
                            orchestrator.submit_remote_events(events);
                        }
                        Ok(None) => {
                            tracing::debug!("change feed closed, resubscribing");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!("change feed errored, resubscribing: {err}");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!("change feed subscribe failed: {err}");
            }
        }

        // Every resubscribe cycle is throttled, whichever way the last
        // one ended, so a down server never turns this into a hot loop
        tracing::debug!("change feed retrying in {backoff:?}");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::Result;
    use crate::gateway::{
        ChangeFeed, FeedEvent, PushReport, RemoteGateway, RemotePull,
    };
    use crate::ledger::PendingLedger;
    use crate::models::{
        now_ms, ChangeAction, PendingChange, RecordKind, RecordPayload, StockItem, SyncVersions,
    };
    use crate::store::{ChangeOrigin, DocumentStore};
    use crate::sync::SyncTunables;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct NullGateway;

    #[async_trait]
    impl RemoteGateway for NullGateway {
        async fn pull(&self, _versions: &SyncVersions) -> Result<RemotePull> {
            Ok(RemotePull {
                document: None,
                server_timestamp: now_ms(),
                versions: SyncVersions::default(),
            })
        }

        async fn push(
            &self,
            _document: &crate::models::Document,
            changes: &[PendingChange],
        ) -> Result<PushReport> {
            Ok(PushReport {
                accepted: changes.iter().map(|c| c.change_id.clone()).collect(),
                rejected: vec![],
            })
        }
    }

    struct ChannelFeed {
        rx: mpsc::UnboundedReceiver<Vec<FeedEvent>>,
    }

    #[async_trait]
    impl ChangeFeed for ChannelFeed {
        async fn next_events(&mut self) -> Result<Option<Vec<FeedEvent>>> {
            Ok(self.rx.recv().await)
        }
    }

    struct ChannelSource {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<FeedEvent>>>>,
    }

    #[async_trait]
    impl ChangeFeedSource for ChannelSource {
        async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>> {
            let rx = self
                .rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| crate::error::Error::Remote("feed exhausted".to_string()))?;
            Ok(Box::new(ChannelFeed { rx }))
        }
    }

    struct ErroringSource {
        subscribes: Arc<AtomicUsize>,
    }

    struct ErroringFeed;

    #[async_trait]
    impl ChangeFeed for ErroringFeed {
        async fn next_events(&mut self) -> Result<Option<Vec<FeedEvent>>> {
            Err(crate::error::Error::Remote("HTTP 500".to_string()))
        }
    }

    #[async_trait]
    impl ChangeFeedSource for ErroringSource {
        async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>> {
            self.subscribes.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(ErroringFeed))
        }
    }

    #[tokio::test]
    async fn test_feed_errors_back_off_instead_of_hot_looping() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store = DocumentStore::new(db.clone(), dir.path().join("doc.json"));
        let ledger = PendingLedger::new(db);
        let orchestrator = SyncOrchestrator::start(
            store,
            ledger,
            Arc::new(NullGateway),
            SyncTunables::default(),
        )
        .unwrap();

        let subscribes = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(ErroringSource {
            subscribes: Arc::clone(&subscribes),
        });
        let _listener = RealtimeListener::spawn(source, orchestrator);

        // On a current-thread runtime this sleep only completes if the
        // listener yields between failed cycles instead of spinning
        tokio::time::sleep(Duration::from_millis(200)).await;

        let attempts = subscribes.load(Ordering::Relaxed);
        assert!(
            (1..=2).contains(&attempts),
            "expected the erroring feed to be throttled, saw {attempts} resubscribes"
        );
    }

    #[tokio::test]
    async fn test_feed_events_reach_the_document() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store = DocumentStore::new(db.clone(), dir.path().join("doc.json"));
        let ledger = PendingLedger::new(db);
        let orchestrator = SyncOrchestrator::start(
            store,
            ledger,
            Arc::new(NullGateway),
            SyncTunables::default().with_debounce_window(Duration::from_millis(10)),
        )
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(ChannelSource {
            rx: Mutex::new(Some(rx)),
        });
        let _listener = RealtimeListener::spawn(source, orchestrator.clone());

        let mut events = orchestrator.subscribe();
        let item = StockItem::new("Paint", 3, 100, "dev-other");
        tx.send(vec![FeedEvent {
            kind: RecordKind::Stock,
            action: ChangeAction::Create,
            record_id: item.id,
            payload: Some(RecordPayload::Stock(item.clone())),
            origin_device: "dev-other".to_string(),
            timestamp: item.last_modified,
        }])
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.origin, ChangeOrigin::Realtime);
        assert!(event.document.contains(item.id));
    }
}
