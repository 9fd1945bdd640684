//! tally-core - Core library for Tally
//!
//! This crate contains the shared models, the durable local store, the
//! pending-change ledger, the merge engine, and the sync orchestration
//! used by all Tally front ends. The design is offline-first: every
//! mutation lands locally first and reaches the remote store through
//! a background sync pass.

pub mod db;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod merge;
pub mod models;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use models::{Document, PendingChange, RateSettings, RecordId, RecordKind, RecordPayload};
pub use store::{ChangeOrigin, DocumentEvent, DocumentStore};
pub use sync::{PassOutcome, PassSummary, SyncOrchestrator, SyncTrigger, SyncTunables};
