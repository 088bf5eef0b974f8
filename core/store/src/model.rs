//! Persisted data model.

use blake2::{Blake2s256, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use docmirror_common::{CollectionId, Error, ItemId, Result};
use docmirror_remote::{CollectionSchema, ItemPatch, RemoteItem};

/// Known schema shapes of remote collections.
///
/// Resolved once at registration; decides which properties an item must
/// carry to be mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    TaskList,
    Calendar,
    Ledger,
    Generic,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::TaskList => "task_list",
            CollectionKind::Calendar => "calendar",
            CollectionKind::Ledger => "ledger",
            CollectionKind::Generic => "generic",
        }
    }

    /// Properties every item of this kind must have.
    pub fn required_properties(&self) -> &'static [&'static str] {
        match self {
            CollectionKind::TaskList => &["title", "status"],
            CollectionKind::Calendar => &["title", "date"],
            CollectionKind::Ledger => &["amount", "date"],
            CollectionKind::Generic => &[],
        }
    }

    /// Check that a remote item has the shape this kind expects.
    ///
    /// Archived items are not checked.
    ///
    /// # Errors
    /// - `Error::Malformed` naming the first missing or mistyped property
    pub fn check_item(&self, item: &RemoteItem) -> Result<()> {
        if item.archived {
            return Ok(());
        }
        for name in self.required_properties() {
            match item.properties.get(*name) {
                None | Some(Value::Null) => {
                    return Err(Error::Malformed(format!(
                        "{} item {} is missing property '{}'",
                        self, item.id, name
                    )));
                }
                Some(_) => {}
            }
        }
        if *self == CollectionKind::Ledger {
            let amount = item.properties.get("amount");
            if !amount.map(Value::is_number).unwrap_or(false) {
                return Err(Error::Malformed(format!(
                    "ledger item {} has a non-numeric amount",
                    item.id
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task_list" | "tasks" => Ok(CollectionKind::TaskList),
            "calendar" => Ok(CollectionKind::Calendar),
            "ledger" => Ok(CollectionKind::Ledger),
            "generic" => Ok(CollectionKind::Generic),
            other => Err(Error::InvalidInput(format!("Unknown collection kind '{}'", other))),
        }
    }
}

/// Live state of a registered collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Idle,
    Running,
    Failed,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Idle => "idle",
            CollectionStatus::Running => "running",
            CollectionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(CollectionStatus::Idle),
            "running" => Ok(CollectionStatus::Running),
            "failed" => Ok(CollectionStatus::Failed),
            other => Err(Error::Serialization(format!("Unknown status '{}'", other))),
        }
    }
}

/// Scheduler-owned runtime fields of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub status: CollectionStatus,
    pub last_successful: Option<DateTime<Utc>>,
    pub last_attempted: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Human-readable summary of the last failure.
    pub last_error: Option<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            status: CollectionStatus::Idle,
            last_successful: None,
            last_attempted: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Schema snapshot with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSchema {
    pub schema: CollectionSchema,
    pub fetched_at: DateTime<Utc>,
}

/// Request to register interest in a remote collection.
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub id: CollectionId,
    pub label: String,
    pub kind: CollectionKind,
    pub sync_interval: Duration,
}

/// A registered remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRegistration {
    pub id: CollectionId,
    pub label: String,
    pub kind: CollectionKind,
    pub sync_interval: Duration,
    pub enabled: bool,
    pub runtime: RuntimeState,
    pub schema: Option<CachedSchema>,
    pub created_at: DateTime<Utc>,
}

impl CollectionRegistration {
    /// Whether the sync interval has elapsed since the last attempt.
    ///
    /// A collection that was never attempted is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.runtime.last_attempted {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().map(|e| e >= self.sync_interval).unwrap_or(false)
            }
        }
    }
}

/// Both sides of a concurrent edit, kept until someone resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetail {
    /// Pending local edit that raced the remote edit.
    pub pending_edit_id: Option<String>,
    /// When the local edit was queued.
    pub local_edited_at: Option<DateTime<Utc>>,
    /// Remote "last edited" timestamp of the competing version.
    pub remote_last_edited: DateTime<Utc>,
    /// Competing remote version.
    pub remote_properties: Map<String, Value>,
    pub remote_content: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Local copy of one remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: ItemId,
    pub collection_id: CollectionId,
    pub properties: Map<String, Value>,
    pub content: Option<String>,
    pub remote_last_edited: DateTime<Utc>,
    pub content_hash: String,
    pub archived: bool,
    pub conflict: bool,
    pub conflict_detail: Option<ConflictDetail>,
    pub synced_at: DateTime<Utc>,
}

impl ItemSnapshot {
    /// Build a fresh snapshot of a fully fetched remote item.
    pub fn from_remote(item: &RemoteItem, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item.id.clone(),
            collection_id: item.collection_id.clone(),
            properties: item.properties.clone(),
            content: item.content.clone(),
            remote_last_edited: item.last_edited,
            content_hash: content_hash(&item.properties, item.content.as_deref()),
            archived: item.archived,
            conflict: false,
            conflict_detail: None,
            synced_at: now,
        }
    }

    /// Overwrite content with a newer remote version.
    pub fn apply_remote(&mut self, item: &RemoteItem, now: DateTime<Utc>) {
        self.properties = item.properties.clone();
        self.content = item.content.clone();
        self.remote_last_edited = item.last_edited;
        self.content_hash = content_hash(&item.properties, item.content.as_deref());
        self.archived = item.archived;
        self.synced_at = now;
    }
}

/// Hash of a property set and content body, used to spot no-op fetches.
pub fn content_hash(properties: &Map<String, Value>, content: Option<&str>) -> String {
    let mut hasher = Blake2s256::new();
    // serde_json::Map is ordered, so this is canonical.
    hasher.update(Value::Object(properties.clone()).to_string().as_bytes());
    hasher.update([0u8]);
    if let Some(body) = content {
        hasher.update([1u8]);
        hasher.update(body.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// What caused a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Picked by a scheduler tick.
    Scheduled,
    /// Requested for one collection.
    Forced,
    /// Requested pass over all due collections.
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Forced => "forced",
            SyncTrigger::Manual => "manual",
        }
    }
}

impl FromStr for SyncTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(SyncTrigger::Scheduled),
            "forced" => Ok(SyncTrigger::Forced),
            "manual" => Ok(SyncTrigger::Manual),
            other => Err(Error::Serialization(format!("Unknown trigger '{}'", other))),
        }
    }
}

/// Outcome of a finished sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Partial,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Partial => "partial",
            AttemptStatus::Failed => "failed",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(AttemptStatus::Success),
            "partial" => Ok(AttemptStatus::Partial),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(Error::Serialization(format!("Unknown attempt status '{}'", other))),
        }
    }
}

/// Per-attempt item counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCounts {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicted: usize,
    pub errored: usize,
    pub archived: usize,
    pub pushed: usize,
    /// Calls refused by the circuit breaker, not by the remote.
    pub circuit_rejected: usize,
}

/// A sync attempt that has started but not finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAttempt {
    pub id: String,
    pub collection_id: CollectionId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
}

impl OpenAttempt {
    /// Close this attempt with an outcome.
    pub fn finish(
        &self,
        status: AttemptStatus,
        counts: SyncCounts,
        error_summary: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> SyncAttemptRecord {
        SyncAttemptRecord {
            id: self.id.clone(),
            collection_id: self.collection_id.clone(),
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at,
            status,
            counts,
            error_summary,
        }
    }
}

/// One entry of the append-only sync history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAttemptRecord {
    pub id: String,
    pub collection_id: CollectionId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub counts: SyncCounts,
    pub error_summary: Option<String>,
}

/// A local edit waiting to be pushed to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
    pub id: String,
    pub item_id: ItemId,
    pub collection_id: CollectionId,
    pub patch: ItemPatch,
    /// Remote "last edited" of the version the edit was made against.
    pub base_remote_edited: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
