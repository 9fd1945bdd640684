//! Durable Local Store
//!
//! Crash-durable persistence for the Document with two tiers: the
//! structured SQLite snapshot row is the primary, a flat JSON file the
//! fallback. A save degrades to the fallback on any structured-tier
//! error and only errors out when both tiers fail, so a mutation is
//! never silently accepted and never silently lost.

#![allow(clippy::cast_possible_wrap)] // SQLite stores the version counter as i64

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{params, OptionalExtension};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{now_ms, Document, SyncVersions};

const META_DEVICE_ID: &str = "device_id";
const META_SYNC_VERSIONS: &str = "sync_versions";
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// What caused a Document change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A mutation applied on this device
    Local,
    /// A reconciled Document produced by a sync pass
    Sync,
    /// A server-originated change delivered by the realtime feed
    Realtime,
}

/// Notification emitted on every successful save.
///
/// The only channel by which presentation code learns that state
/// changed; the core never reads UI state back from it.
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    pub document: Document,
    pub origin: ChangeOrigin,
}

/// Two-tier durable store for the Document
pub struct DocumentStore {
    db: Database,
    fallback_path: PathBuf,
    /// Set while the structured tier is known bad; cleared by the next
    /// save that succeeds on it
    degraded: AtomicBool,
    events: broadcast::Sender<DocumentEvent>,
}

impl DocumentStore {
    /// Create a store over an opened database and a fallback file path
    #[must_use]
    pub fn new(db: Database, fallback_path: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            fallback_path: fallback_path.into(),
            degraded: AtomicBool::new(false),
            events,
        }
    }

    /// Subscribe to Document change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    /// Whether the store is currently degraded to the fallback tier
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Persist the Document atomically and emit a change notification.
    ///
    /// Bumps the monotonic version counter and `updated_at`, then tries
    /// the structured tier first; on failure the save degrades to the
    /// flat fallback. Returns the stamped Document actually written.
    pub fn save(&self, document: &Document, origin: ChangeOrigin) -> Result<Document> {
        let mut stamped = document.clone();
        stamped.version = document.version + 1;
        stamped.updated_at = now_ms();

        match self.save_sqlite(&stamped) {
            Ok(()) => {
                self.degraded.store(false, Ordering::Relaxed);
            }
            Err(primary_err) => {
                tracing::warn!("structured store save failed, using fallback: {primary_err}");
                if let Err(fallback_err) = self.save_fallback(&stamped) {
                    return Err(Error::Storage(format!(
                        "both storage tiers failed: {primary_err}; {fallback_err}"
                    )));
                }
                self.degraded.store(true, Ordering::Relaxed);
            }
        }

        // No receivers is fine; the CLI subscribes lazily
        let _ = self.events.send(DocumentEvent {
            document: stamped.clone(),
            origin,
        });
        Ok(stamped)
    }

    /// Load the most recent Document and whether one existed before.
    ///
    /// Reads the preferred tier first and falls back on any read failure.
    #[must_use]
    pub fn load(&self) -> (Document, bool) {
        let (first, second): (Tier, Tier) = if self.is_degraded() {
            (Tier::Fallback, Tier::Sqlite)
        } else {
            (Tier::Sqlite, Tier::Fallback)
        };

        for tier in [first, second] {
            match self.load_tier(tier) {
                Ok(Some(document)) => return (document, true),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("{tier:?} tier load failed: {err}");
                }
            }
        }
        (Document::new(), false)
    }

    /// Wipe both tiers. Destructive resets only; the sync engine never
    /// calls this.
    pub fn clear(&self) -> Result<()> {
        self.db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM snapshot", [])?))?;
        if self.fallback_path.exists() {
            std::fs::remove_file(&self.fallback_path)?;
        }
        self.degraded.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// The persisted device identity, generated on first use.
    ///
    /// Used as `origin_device` on every outgoing change so a device can
    /// recognize its own change echoed back through the realtime feed.
    pub fn device_identity(&self) -> Result<String> {
        if let Ok(Some(id)) = self.get_meta(META_DEVICE_ID) {
            return Ok(id);
        }

        let id_file = self.fallback_path.with_extension("device");
        if let Ok(id) = std::fs::read_to_string(&id_file) {
            let id = id.trim().to_string();
            if !id.is_empty() {
                // Heal the structured tier opportunistically
                let _ = self.set_meta(META_DEVICE_ID, &id);
                return Ok(id);
            }
        }

        let id = Uuid::now_v7().to_string();
        if let Err(primary_err) = self.set_meta(META_DEVICE_ID, &id) {
            tracing::warn!("persisting device identity to db failed: {primary_err}");
            write_atomic(&id_file, id.as_bytes()).map_err(|fallback_err| {
                Error::Storage(format!(
                    "could not persist device identity: {primary_err}; {fallback_err}"
                ))
            })?;
        }
        Ok(id)
    }

    /// Load per-category sync watermarks; empty when never synced
    #[must_use]
    pub fn load_sync_versions(&self) -> SyncVersions {
        match self.get_meta(META_SYNC_VERSIONS) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!("discarding malformed sync watermarks: {err}");
                SyncVersions::default()
            }),
            Ok(None) => SyncVersions::default(),
            Err(err) => {
                tracing::warn!("loading sync watermarks failed: {err}");
                SyncVersions::default()
            }
        }
    }

    /// Persist per-category sync watermarks
    pub fn save_sync_versions(&self, versions: &SyncVersions) -> Result<()> {
        self.set_meta(META_SYNC_VERSIONS, &serde_json::to_string(versions)?)
    }

    fn save_sqlite(&self, document: &Document) -> Result<()> {
        let body = serde_json::to_string(document)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshot (id, body, version, updated_at) VALUES (1, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     body = excluded.body,
                     version = excluded.version,
                     updated_at = excluded.updated_at",
                params![body, document.version as i64, document.updated_at],
            )?;
            Ok(())
        })
    }

    fn save_fallback(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.fallback_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(document)?;
        write_atomic(&self.fallback_path, &body)
    }

    fn load_tier(&self, tier: Tier) -> Result<Option<Document>> {
        match tier {
            Tier::Sqlite => {
                let body: Option<String> = self.db.with_conn(|conn| {
                    Ok(conn
                        .query_row("SELECT body FROM snapshot WHERE id = 1", [], |row| {
                            row.get(0)
                        })
                        .optional()?)
                })?;
                body.map(|raw| Ok(serde_json::from_str(&raw)?)).transpose()
            }
            Tier::Fallback => {
                if !self.fallback_path.exists() {
                    return Ok(None);
                }
                let raw = std::fs::read_to_string(&self.fallback_path)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
        }
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM sync_meta WHERE key = ?", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
                params![key, value],
            )?;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Sqlite,
    Fallback,
}

/// Write via a temp file + rename so a reader never observes a torn file
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
