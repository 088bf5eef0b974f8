//! SQLite-backed store for registrations, snapshots, history and edits.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docmirror_common::{CollectionId, Error, ItemId, Result};
use docmirror_remote::ItemPatch;

use crate::model::{
    AttemptStatus, CachedSchema, CollectionRegistration, CollectionStatus, ConflictDetail,
    ItemSnapshot, NewRegistration, OpenAttempt, PendingEdit, RuntimeState, SyncAttemptRecord,
    SyncCounts, SyncTrigger,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    kind TEXT NOT NULL,
    sync_interval_secs INTEGER NOT NULL,
    enabled INTEGER NOT NULL,
    status TEXT NOT NULL,
    last_successful TEXT,
    last_attempted TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    schema_json TEXT,
    schema_fetched_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    item_id TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL REFERENCES collections(id),
    properties TEXT NOT NULL,
    content TEXT,
    remote_last_edited TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    conflict INTEGER NOT NULL DEFAULT 0,
    conflict_detail TEXT,
    synced_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_collection ON snapshots(collection_id);

CREATE TABLE IF NOT EXISTS attempts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    collection_id TEXT NOT NULL REFERENCES collections(id),
    trigger TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT,
    counts TEXT,
    error_summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_attempts_collection ON attempts(collection_id, seq);

CREATE TABLE IF NOT EXISTS pending_edits (
    id TEXT PRIMARY KEY,
    item_id TEXT NOT NULL UNIQUE,
    collection_id TEXT NOT NULL,
    patch TEXT NOT NULL,
    base_remote_edited TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const REGISTRATION_COLUMNS: &str = "id, label, kind, sync_interval_secs, enabled, status, \
     last_successful, last_attempted, consecutive_failures, last_error, schema_json, \
     schema_fetched_at, created_at";

const SNAPSHOT_COLUMNS: &str = "item_id, collection_id, properties, content, remote_last_edited, \
     content_hash, archived, conflict, conflict_detail, synced_at";

const ATTEMPT_COLUMNS: &str =
    "id, collection_id, trigger, started_at, finished_at, status, counts, error_summary";

const EDIT_COLUMNS: &str = "id, item_id, collection_id, patch, base_remote_edited, created_at";

/// Error summary given to attempts cut short by a process exit.
pub const INTERRUPTED: &str = "interrupted: process exited before the run finished";

/// Page of history to read, newest first.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    /// Restrict to one collection.
    pub collection: Option<CollectionId>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            collection: None,
            offset: 0,
            limit: 50,
        }
    }
}

/// Persistent mirror state.
///
/// All access goes through one connection behind a mutex; every method is a
/// short synchronous transaction.
pub struct MirrorStore {
    conn: Mutex<Connection>,
}

impl MirrorStore {
    /// Create or open a mirror database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!("Mirror store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ----- registrations -------------------------------------------------

    /// Register a collection, or update label/kind/interval of an existing one.
    ///
    /// Runtime state and the enabled flag of an existing registration are kept.
    pub fn upsert_registration(
        &self,
        registration: &NewRegistration,
        now: DateTime<Utc>,
    ) -> Result<CollectionRegistration> {
        debug!("Upserting registration: {}", registration.id);
        {
            let conn = self.conn();
            conn.execute(
                r#"
                INSERT INTO collections
                (id, label, kind, sync_interval_secs, enabled, status, consecutive_failures, created_at)
                VALUES (?1, ?2, ?3, ?4, 1, 'idle', 0, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    label = excluded.label,
                    kind = excluded.kind,
                    sync_interval_secs = excluded.sync_interval_secs
                "#,
                params![
                    registration.id.as_str(),
                    registration.label,
                    registration.kind.as_str(),
                    registration.sync_interval.as_secs() as i64,
                    fmt_ts(now),
                ],
            )
            .map_err(db_err)?;
        }

        self.get_registration(&registration.id)?
            .ok_or_else(|| Error::Storage(format!("Registration {} vanished", registration.id)))
    }

    /// Get a registration by id.
    pub fn get_registration(&self, id: &CollectionId) -> Result<Option<CollectionRegistration>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM collections WHERE id = ?1", REGISTRATION_COLUMNS),
            [id.as_str()],
            registration_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// List all registrations, ordered by id.
    pub fn list_registrations(&self) -> Result<Vec<CollectionRegistration>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM collections ORDER BY id",
                REGISTRATION_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], registration_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Set the enabled flag.
    pub fn set_enabled(&self, id: &CollectionId, enabled: bool) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE collections SET enabled = ?2 WHERE id = ?1",
                params![id.as_str(), enabled as i32],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Collection {}", id)));
        }
        Ok(())
    }

    /// Persist the runtime fields of a registration.
    pub fn save_runtime(&self, id: &CollectionId, runtime: &RuntimeState) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                r#"
                UPDATE collections SET
                    status = ?2,
                    last_successful = ?3,
                    last_attempted = ?4,
                    consecutive_failures = ?5,
                    last_error = ?6
                WHERE id = ?1
                "#,
                params![
                    id.as_str(),
                    runtime.status.as_str(),
                    runtime.last_successful.map(fmt_ts),
                    runtime.last_attempted.map(fmt_ts),
                    runtime.consecutive_failures as i64,
                    runtime.last_error,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Collection {}", id)));
        }
        Ok(())
    }

    /// Cache a freshly fetched schema.
    pub fn save_schema(&self, id: &CollectionId, schema: &CachedSchema) -> Result<()> {
        let json = to_json(&schema.schema)?;
        self.conn()
            .execute(
                "UPDATE collections SET schema_json = ?2, schema_fetched_at = ?3 WHERE id = ?1",
                params![id.as_str(), json, fmt_ts(schema.fetched_at)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ----- snapshots -----------------------------------------------------

    /// Get the snapshot of an item.
    pub fn get_snapshot(&self, item: &ItemId) -> Result<Option<ItemSnapshot>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM snapshots WHERE item_id = ?1", SNAPSHOT_COLUMNS),
            [item.as_str()],
            snapshot_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Insert or replace a snapshot.
    pub fn put_snapshot(&self, snapshot: &ItemSnapshot) -> Result<()> {
        let properties = to_json(&snapshot.properties)?;
        let detail = snapshot
            .conflict_detail
            .as_ref()
            .map(to_json)
            .transpose()?;

        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO snapshots ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    SNAPSHOT_COLUMNS
                ),
                params![
                    snapshot.item_id.as_str(),
                    snapshot.collection_id.as_str(),
                    properties,
                    snapshot.content,
                    fmt_ts(snapshot.remote_last_edited),
                    snapshot.content_hash,
                    snapshot.archived as i32,
                    snapshot.conflict as i32,
                    detail,
                    fmt_ts(snapshot.synced_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// List snapshots of a collection.
    pub fn list_snapshots(
        &self,
        collection: &CollectionId,
        include_archived: bool,
    ) -> Result<Vec<ItemSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM snapshots WHERE collection_id = ?1 AND (?2 OR archived = 0) \
                 ORDER BY item_id",
                SNAPSHOT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![collection.as_str(), include_archived], snapshot_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Archive live snapshots of a collection that are not in `seen`.
    ///
    /// Returns the number of snapshots archived.
    pub fn archive_missing(
        &self,
        collection: &CollectionId,
        seen: &HashSet<ItemId>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let missing: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT item_id FROM snapshots WHERE collection_id = ?1 AND archived = 0")
                .map_err(db_err)?;
            let ids = stmt
                .query_map([collection.as_str()], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            let seen: HashSet<&str> = seen.iter().map(ItemId::as_str).collect();
            ids.into_iter()
                .filter(|id| !seen.contains(id.as_str()))
                .collect()
        };

        for id in &missing {
            tx.execute(
                "UPDATE snapshots SET archived = 1, synced_at = ?2 WHERE item_id = ?1",
                params![id, fmt_ts(now)],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;

        if !missing.is_empty() {
            debug!("Archived {} snapshots of {}", missing.len(), collection);
        }
        Ok(missing.len())
    }

    /// All snapshots currently flagged as conflicted.
    pub fn conflicted_snapshots(&self) -> Result<Vec<ItemSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM snapshots WHERE conflict = 1 ORDER BY collection_id, item_id",
                SNAPSHOT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], snapshot_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Replace the conflict detail of a snapshot that is still conflicted.
    ///
    /// Returns `false` without writing when the conflict was resolved in the
    /// meantime.
    pub fn update_conflict_detail(&self, item: &ItemId, detail: &ConflictDetail) -> Result<bool> {
        let detail = to_json(detail)?;
        let updated = self
            .conn()
            .execute(
                "UPDATE snapshots SET conflict_detail = ?2 WHERE item_id = ?1 AND conflict = 1",
                params![item.as_str(), detail],
            )
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    // ----- attempts ------------------------------------------------------

    /// Record the start of a sync attempt.
    pub fn begin_attempt(
        &self,
        collection: &CollectionId,
        trigger: SyncTrigger,
        started_at: DateTime<Utc>,
    ) -> Result<OpenAttempt> {
        let attempt = OpenAttempt {
            id: Uuid::new_v4().to_string(),
            collection_id: collection.clone(),
            trigger,
            started_at,
        };
        self.conn()
            .execute(
                "INSERT INTO attempts (id, collection_id, trigger, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    attempt.id,
                    collection.as_str(),
                    trigger.as_str(),
                    fmt_ts(started_at)
                ],
            )
            .map_err(db_err)?;
        Ok(attempt)
    }

    /// Record the outcome of a sync attempt.
    pub fn finish_attempt(&self, record: &SyncAttemptRecord) -> Result<()> {
        let counts = to_json(&record.counts)?;
        let changed = self
            .conn()
            .execute(
                r#"
                UPDATE attempts SET finished_at = ?2, status = ?3, counts = ?4, error_summary = ?5
                WHERE id = ?1 AND finished_at IS NULL
                "#,
                params![
                    record.id,
                    fmt_ts(record.finished_at),
                    record.status.as_str(),
                    counts,
                    record.error_summary,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::Storage(format!(
                "Attempt {} is unknown or already finished",
                record.id
            )));
        }
        Ok(())
    }

    /// Get a finished attempt by id.
    pub fn get_attempt(&self, id: &str) -> Result<Option<SyncAttemptRecord>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {} FROM attempts WHERE id = ?1 AND finished_at IS NOT NULL",
                ATTEMPT_COLUMNS
            ),
            [id],
            attempt_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Read finished attempts, newest first.
    pub fn list_attempts(&self, query: &HistoryQuery) -> Result<Vec<SyncAttemptRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM attempts \
                 WHERE finished_at IS NOT NULL AND (?1 IS NULL OR collection_id = ?1) \
                 ORDER BY seq DESC LIMIT ?2 OFFSET ?3",
                ATTEMPT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    query.collection.as_ref().map(|c| c.as_str()),
                    query.limit as i64,
                    query.offset as i64
                ],
                attempt_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Close attempts and collections left running by a previous process.
    ///
    /// Returns the number of attempts finalized.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize> {
        let counts = to_json(&SyncCounts::default())?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;

        let attempts = tx
            .execute(
                r#"
                UPDATE attempts SET finished_at = ?1, status = 'failed', counts = ?2, error_summary = ?3
                WHERE finished_at IS NULL
                "#,
                params![fmt_ts(now), counts, INTERRUPTED],
            )
            .map_err(db_err)?;
        let collections = tx
            .execute(
                r#"
                UPDATE collections SET status = 'failed', last_error = ?1,
                    consecutive_failures = consecutive_failures + 1
                WHERE status = 'running'
                "#,
                params![INTERRUPTED],
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        if attempts > 0 || collections > 0 {
            warn!(
                "Recovered {} interrupted attempts and {} running collections",
                attempts, collections
            );
        }
        Ok(attempts)
    }

    // ----- pending edits -------------------------------------------------

    /// Queue a local edit for an item.
    ///
    /// A second edit to the same item is merged into the pending one, which
    /// keeps its original id and base version. Read, merge and write happen
    /// under one lock.
    pub fn queue_edit(
        &self,
        item: &ItemId,
        collection: &CollectionId,
        patch: &ItemPatch,
        base_remote_edited: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PendingEdit> {
        let conn = self.conn();
        let edit = match edit_for_item(&conn, item)? {
            Some(mut existing) => {
                for (name, value) in &patch.properties {
                    existing.patch.properties.insert(name.clone(), value.clone());
                }
                if patch.content.is_some() {
                    existing.patch.content = patch.content.clone();
                }
                existing
            }
            None => PendingEdit {
                id: Uuid::new_v4().to_string(),
                item_id: item.clone(),
                collection_id: collection.clone(),
                patch: patch.clone(),
                base_remote_edited,
                created_at: now,
            },
        };
        write_edit(&conn, &edit)?;
        Ok(edit)
    }

    /// Insert or replace a pending edit as-is.
    pub fn save_edit(&self, edit: &PendingEdit) -> Result<()> {
        write_edit(&self.conn(), edit)
    }

    /// Pending edit for an item, if any.
    pub fn pending_edit_for_item(&self, item: &ItemId) -> Result<Option<PendingEdit>> {
        edit_for_item(&self.conn(), item)
    }

    /// Settle an edit after its patch was written to the remote.
    ///
    /// The row is dropped only if it still holds exactly the pushed patch.
    /// If more changes were merged in meanwhile, the row stays and is
    /// rebased on `pushed_remote_edited` so the next pass pushes the rest.
    /// Returns whether the row was dropped.
    pub fn complete_edit(
        &self,
        pushed: &PendingEdit,
        pushed_remote_edited: DateTime<Utc>,
    ) -> Result<bool> {
        let patch = to_json(&pushed.patch)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let removed = tx
            .execute(
                "DELETE FROM pending_edits WHERE id = ?1 AND patch = ?2",
                params![pushed.id, patch],
            )
            .map_err(db_err)?;
        if removed == 0 {
            tx.execute(
                "UPDATE pending_edits SET base_remote_edited = ?2 WHERE id = ?1",
                params![pushed.id, fmt_ts(pushed_remote_edited)],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;

        if removed == 0 {
            debug!("Edit {} changed while it was pushed, kept for next pass", pushed.id);
        }
        Ok(removed > 0)
    }

    /// Pending edits of a collection, oldest first.
    pub fn pending_edits(&self, collection: &CollectionId) -> Result<Vec<PendingEdit>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pending_edits WHERE collection_id = ?1 ORDER BY created_at",
                EDIT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([collection.as_str()], edit_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Drop a pending edit.
    pub fn remove_edit(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM pending_edits WHERE id = ?1", [id])
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn edit_for_item(conn: &Connection, item: &ItemId) -> Result<Option<PendingEdit>> {
    conn.query_row(
        &format!("SELECT {} FROM pending_edits WHERE item_id = ?1", EDIT_COLUMNS),
        [item.as_str()],
        edit_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn write_edit(conn: &Connection, edit: &PendingEdit) -> Result<()> {
    let patch = to_json(&edit.patch)?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO pending_edits ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            EDIT_COLUMNS
        ),
        params![
            edit.id,
            edit.item_id.as_str(),
            edit.collection_id.as_str(),
            patch,
            fmt_ts(edit.base_remote_edited),
            fmt_ts(edit.created_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, e)),
    }
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn id_at<T>(row: &Row<'_>, idx: usize, make: fn(String) -> Result<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    make(raw).map_err(|e| conversion_err(idx, e))
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionRegistration> {
    let schema = match row.get::<_, Option<String>>(10)? {
        Some(raw) => Some(CachedSchema {
            schema: serde_json::from_str(&raw).map_err(|e| conversion_err(10, e))?,
            fetched_at: ts_at(row, 11)?,
        }),
        None => None,
    };

    Ok(CollectionRegistration {
        id: id_at(row, 0, CollectionId::new)?,
        label: row.get(1)?,
        kind: parsed_at(row, 2)?,
        sync_interval: Duration::from_secs(row.get::<_, i64>(3)?.max(0) as u64),
        enabled: row.get::<_, i32>(4)? != 0,
        runtime: RuntimeState {
            status: parsed_at::<CollectionStatus>(row, 5)?,
            last_successful: opt_ts_at(row, 6)?,
            last_attempted: opt_ts_at(row, 7)?,
            consecutive_failures: row.get::<_, i64>(8)?.max(0) as u32,
            last_error: row.get(9)?,
        },
        schema,
        created_at: ts_at(row, 12)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ItemSnapshot> {
    let conflict_detail = match row.get::<_, Option<String>>(8)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| conversion_err(8, e))?),
        None => None,
    };

    Ok(ItemSnapshot {
        item_id: id_at(row, 0, ItemId::new)?,
        collection_id: id_at(row, 1, CollectionId::new)?,
        properties: json_at(row, 2)?,
        content: row.get(3)?,
        remote_last_edited: ts_at(row, 4)?,
        content_hash: row.get(5)?,
        archived: row.get::<_, i32>(6)? != 0,
        conflict: row.get::<_, i32>(7)? != 0,
        conflict_detail,
        synced_at: ts_at(row, 9)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<SyncAttemptRecord> {
    Ok(SyncAttemptRecord {
        id: row.get(0)?,
        collection_id: id_at(row, 1, CollectionId::new)?,
        trigger: parsed_at::<SyncTrigger>(row, 2)?,
        started_at: ts_at(row, 3)?,
        finished_at: ts_at(row, 4)?,
        status: parsed_at::<AttemptStatus>(row, 5)?,
        counts: json_at(row, 6)?,
        error_summary: row.get(7)?,
    })
}

fn edit_from_row(row: &Row<'_>) -> rusqlite::Result<PendingEdit> {
    Ok(PendingEdit {
        id: row.get(0)?,
        item_id: id_at(row, 1, ItemId::new)?,
        collection_id: id_at(row, 2, CollectionId::new)?,
        patch: json_at(row, 3)?,
        base_remote_edited: ts_at(row, 4)?,
        created_at: ts_at(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionKind, ConflictDetail};
    use docmirror_remote::RemoteItem;
    use serde_json::json;

    fn registration(id: &str) -> NewRegistration {
        NewRegistration {
            id: CollectionId::new(id).unwrap(),
            label: format!("Collection {}", id),
            kind: CollectionKind::TaskList,
            sync_interval: Duration::from_secs(300),
        }
    }

    fn snapshot(collection: &str, item: &str) -> ItemSnapshot {
        let remote = RemoteItem {
            id: ItemId::new(item).unwrap(),
            collection_id: CollectionId::new(collection).unwrap(),
            properties: json!({"title": item, "status": "open"})
                .as_object()
                .cloned()
                .unwrap(),
            content: Some("body".to_string()),
            last_edited: Utc::now(),
            archived: false,
        };
        ItemSnapshot::from_remote(&remote, Utc::now())
    }

    #[test]
    fn test_registration_round_trip() {
        let store = MirrorStore::in_memory().unwrap();
        let created = store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();

        assert!(created.enabled);
        assert_eq!(created.runtime.status, CollectionStatus::Idle);
        assert_eq!(created.sync_interval, Duration::from_secs(300));
        assert_eq!(created.kind, CollectionKind::TaskList);
    }

    #[test]
    fn test_upsert_keeps_runtime_and_enabled_flag() {
        let store = MirrorStore::in_memory().unwrap();
        let id = CollectionId::new("tasks").unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();
        store.set_enabled(&id, false).unwrap();

        let runtime = RuntimeState {
            status: CollectionStatus::Failed,
            consecutive_failures: 2,
            last_error: Some("boom".to_string()),
            ..Default::default()
        };
        store.save_runtime(&id, &runtime).unwrap();

        let mut update = registration("tasks");
        update.label = "Renamed".to_string();
        let updated = store.upsert_registration(&update, Utc::now()).unwrap();

        assert_eq!(updated.label, "Renamed");
        assert!(!updated.enabled);
        assert_eq!(updated.runtime, runtime);
    }

    #[test]
    fn test_set_enabled_unknown_collection() {
        let store = MirrorStore::in_memory().unwrap();
        let err = store
            .set_enabled(&CollectionId::new("nope").unwrap(), true)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_snapshot_round_trip_with_conflict_detail() {
        let store = MirrorStore::in_memory().unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();

        let mut snap = snapshot("tasks", "item-1");
        snap.conflict = true;
        snap.conflict_detail = Some(ConflictDetail {
            pending_edit_id: Some("edit-1".to_string()),
            local_edited_at: Some(Utc::now()),
            remote_last_edited: Utc::now(),
            remote_properties: json!({"title": "remote"}).as_object().cloned().unwrap(),
            remote_content: None,
            detected_at: Utc::now(),
        });
        store.put_snapshot(&snap).unwrap();

        let loaded = store.get_snapshot(&snap.item_id).unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(store.conflicted_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn test_archive_missing_only_touches_unseen_items() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();
        for id in ["a", "b", "c"] {
            store.put_snapshot(&snapshot("tasks", id)).unwrap();
        }

        let seen: HashSet<ItemId> = [ItemId::new("a").unwrap()].into_iter().collect();
        let archived = store.archive_missing(&collection, &seen, Utc::now()).unwrap();

        assert_eq!(archived, 2);
        assert_eq!(store.list_snapshots(&collection, false).unwrap().len(), 1);
        assert_eq!(store.list_snapshots(&collection, true).unwrap().len(), 3);

        // Already archived snapshots are not counted again.
        assert_eq!(store.archive_missing(&collection, &seen, Utc::now()).unwrap(), 0);
    }

    #[test]
    fn test_history_is_newest_first_and_paginated() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let open = store
                .begin_attempt(&collection, SyncTrigger::Scheduled, Utc::now())
                .unwrap();
            let record =
                open.finish(AttemptStatus::Success, SyncCounts::default(), None, Utc::now());
            store.finish_attempt(&record).unwrap();
            ids.push(record.id);
        }

        let page = store
            .list_attempts(&HistoryQuery {
                collection: Some(collection.clone()),
                offset: 1,
                limit: 2,
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);
    }

    #[test]
    fn test_open_attempts_are_hidden_from_history() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();

        let open = store
            .begin_attempt(&collection, SyncTrigger::Forced, Utc::now())
            .unwrap();
        assert!(store.list_attempts(&HistoryQuery::default()).unwrap().is_empty());
        assert!(store.get_attempt(&open.id).unwrap().is_none());
    }

    #[test]
    fn test_finish_attempt_twice_fails() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();

        let open = store
            .begin_attempt(&collection, SyncTrigger::Manual, Utc::now())
            .unwrap();
        let record = open.finish(AttemptStatus::Partial, SyncCounts::default(), None, Utc::now());
        store.finish_attempt(&record).unwrap();
        assert!(store.finish_attempt(&record).is_err());
    }

    #[test]
    fn test_recover_interrupted_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        let collection = CollectionId::new("tasks").unwrap();

        {
            let store = MirrorStore::open(&path).unwrap();
            store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();
            store
                .save_runtime(
                    &collection,
                    &RuntimeState {
                        status: CollectionStatus::Running,
                        ..Default::default()
                    },
                )
                .unwrap();
            store
                .begin_attempt(&collection, SyncTrigger::Scheduled, Utc::now())
                .unwrap();
        }

        let store = MirrorStore::open(&path).unwrap();
        assert_eq!(store.recover_interrupted(Utc::now()).unwrap(), 1);

        let history = store.list_attempts(&HistoryQuery::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttemptStatus::Failed);
        assert_eq!(history[0].error_summary.as_deref(), Some(INTERRUPTED));

        let registration = store.get_registration(&collection).unwrap().unwrap();
        assert_eq!(registration.runtime.status, CollectionStatus::Failed);
        assert_eq!(registration.runtime.consecutive_failures, 1);
    }

    #[test]
    fn test_second_edit_merges_into_pending_one() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        let item = ItemId::new("item-1").unwrap();
        let base = Utc::now();

        let first = store
            .queue_edit(
                &item,
                &collection,
                &ItemPatch::default().with_property("title", json!("one")),
                base,
                Utc::now(),
            )
            .unwrap();
        let second = store
            .queue_edit(
                &item,
                &collection,
                &ItemPatch::default().with_property("status", json!("done")),
                Utc::now(),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.base_remote_edited, base);
        assert_eq!(second.patch.properties.len(), 2);
        assert_eq!(store.pending_edits(&collection).unwrap().len(), 1);

        store.remove_edit(&second.id).unwrap();
        assert!(store.pending_edit_for_item(&item).unwrap().is_none());
    }

    #[test]
    fn test_complete_edit_keeps_changes_merged_during_push() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        let item = ItemId::new("item-1").unwrap();
        let base = Utc::now();

        let pushed = store
            .queue_edit(
                &item,
                &collection,
                &ItemPatch::default().with_property("title", json!("one")),
                base,
                Utc::now(),
            )
            .unwrap();
        store
            .queue_edit(
                &item,
                &collection,
                &ItemPatch::default().with_property("status", json!("done")),
                base,
                Utc::now(),
            )
            .unwrap();

        let written_at = base + chrono::Duration::seconds(5);
        assert!(!store.complete_edit(&pushed, written_at).unwrap());

        let kept = store.pending_edit_for_item(&item).unwrap().unwrap();
        assert_eq!(kept.id, pushed.id);
        assert_eq!(kept.base_remote_edited, written_at);
        assert_eq!(kept.patch.properties.len(), 2);
        assert_eq!(kept.patch.properties["status"], json!("done"));
    }

    #[test]
    fn test_complete_edit_drops_unchanged_edit() {
        let store = MirrorStore::in_memory().unwrap();
        let collection = CollectionId::new("tasks").unwrap();
        let item = ItemId::new("item-1").unwrap();

        let pushed = store
            .queue_edit(
                &item,
                &collection,
                &ItemPatch::default().with_property("title", json!("one")),
                Utc::now(),
                Utc::now(),
            )
            .unwrap();

        assert!(store.complete_edit(&pushed, Utc::now()).unwrap());
        assert!(store.pending_edit_for_item(&item).unwrap().is_none());
    }

    #[test]
    fn test_conflict_detail_update_skips_resolved_snapshot() {
        let store = MirrorStore::in_memory().unwrap();
        store.upsert_registration(&registration("tasks"), Utc::now()).unwrap();

        let mut snap = snapshot("tasks", "item-1");
        snap.conflict = true;
        store.put_snapshot(&snap).unwrap();

        let detail = ConflictDetail {
            pending_edit_id: None,
            local_edited_at: None,
            remote_last_edited: Utc::now(),
            remote_properties: json!({"title": "remote"}).as_object().cloned().unwrap(),
            remote_content: None,
            detected_at: Utc::now(),
        };
        assert!(store.update_conflict_detail(&snap.item_id, &detail).unwrap());
        let loaded = store.get_snapshot(&snap.item_id).unwrap().unwrap();
        assert_eq!(loaded.conflict_detail, Some(detail.clone()));

        // Resolution writes the snapshot back without the flag.
        snap.conflict = false;
        snap.conflict_detail = None;
        store.put_snapshot(&snap).unwrap();

        assert!(!store.update_conflict_detail(&snap.item_id, &detail).unwrap());
        let loaded = store.get_snapshot(&snap.item_id).unwrap().unwrap();
        assert!(!loaded.conflict);
        assert!(loaded.conflict_detail.is_none());
        assert!(store.conflicted_snapshots().unwrap().is_empty());
    }
}
