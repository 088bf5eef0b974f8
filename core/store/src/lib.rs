//! Persistent state of the docmirror engine.
//!
//! Collection registrations, item snapshots, the append-only sync attempt
//! history and the local edit queue all live in one SQLite database so they
//! survive process restarts.

pub mod model;
pub mod store;

pub use model::{
    AttemptStatus, CachedSchema, CollectionKind, CollectionRegistration, CollectionStatus,
    ConflictDetail, ItemSnapshot, NewRegistration, OpenAttempt, PendingEdit, RuntimeState,
    SyncAttemptRecord, SyncCounts, SyncTrigger,
};
pub use store::{HistoryQuery, MirrorStore};
