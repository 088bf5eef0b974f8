//! Engine facade used by the CLI and other collaborators.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use docmirror_common::{Clock, CollectionId, Error, ItemId, Result, SystemClock};
use docmirror_remote::{ItemPatch, RemoteClient};
use docmirror_store::model::content_hash;
use docmirror_store::{
    CollectionKind, CollectionRegistration, CollectionStatus, HistoryQuery, ItemSnapshot,
    MirrorStore, NewRegistration, PendingEdit, SyncAttemptRecord,
};

use crate::circuit::{CircuitBreakers, CircuitState, CircuitStatus};
use crate::config::MirrorConfig;
use crate::events::{EventBus, SyncEvent};
use crate::reconcile::Reconciler;
use crate::retry::RetryExecutor;
use crate::scheduler::SyncScheduler;

/// How to settle a conflicted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Adopt the remote version and drop the pending local edit.
    KeepRemote,
    /// Adopt the remote version as base and push the local edit on top.
    KeepLocal,
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "remote" | "keep_remote" => Ok(Resolution::KeepRemote),
            "local" | "keep_local" => Ok(Resolution::KeepLocal),
            other => Err(Error::InvalidInput(format!(
                "Unknown resolution '{}' (expected remote or local)",
                other
            ))),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepRemote => f.write_str("remote"),
            Resolution::KeepLocal => f.write_str("local"),
        }
    }
}

/// Status of one collection as shown to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStatusView {
    pub id: CollectionId,
    pub label: String,
    pub kind: CollectionKind,
    pub enabled: bool,
    pub status: CollectionStatus,
    pub last_successful: Option<DateTime<Utc>>,
    pub last_attempted: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Excluded from automatic scheduling after too many failures.
    pub suspended: bool,
    pub circuit: CircuitStatus,
}

/// A conflicted item together with the local edit that raced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub snapshot: ItemSnapshot,
    pub pending_edit: Option<PendingEdit>,
}

/// Main engine for mirroring remote collections.
pub struct MirrorEngine {
    config: MirrorConfig,
    store: Arc<MirrorStore>,
    clock: Arc<dyn Clock>,
    breakers: Arc<CircuitBreakers>,
    reconciler: Arc<Reconciler>,
    events: EventBus,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl MirrorEngine {
    /// Create an engine on the system clock.
    ///
    /// # Errors
    /// - Configuration values out of range
    pub fn new(
        config: MirrorConfig,
        store: Arc<MirrorStore>,
        remote: Arc<dyn RemoteClient>,
    ) -> Result<Self> {
        Self::with_clock(config, store, remote, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock.
    pub fn with_clock(
        config: MirrorConfig,
        store: Arc<MirrorStore>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakers::new(config.circuit.clone(), clock.clone()));
        let retry = Arc::new(RetryExecutor::new(config.retry.clone(), breakers.clone()));
        let reconciler = Arc::new(Reconciler::new(
            remote.clone(),
            store.clone(),
            retry,
            clock.clone(),
            config.reconcile_settings(),
        ));
        debug!("Mirror engine created on {} remote", remote.name());

        Ok(Self {
            config,
            store,
            clock,
            breakers,
            reconciler,
            events: EventBus::default(),
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    // ----- registration ---------------------------------------------------

    fn check_interval(&self, registration: &NewRegistration) -> Result<()> {
        let min = self.config.scheduler.min_sync_interval();
        if registration.sync_interval < min {
            return Err(Error::InvalidInput(format!(
                "Sync interval {:?} is below the minimum of {:?}",
                registration.sync_interval, min
            )));
        }
        Ok(())
    }

    /// Register interest in a remote collection.
    ///
    /// # Errors
    /// - Interval below the configured minimum
    /// - Collection already registered
    pub async fn register(&self, registration: NewRegistration) -> Result<CollectionRegistration> {
        self.check_interval(&registration)?;
        if self.store.get_registration(&registration.id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "Collection {} is already registered",
                registration.id
            )));
        }

        let created = self
            .store
            .upsert_registration(&registration, self.clock.now())?;
        info!(
            "Registered {} ({}, every {:?})",
            created.id, created.kind, created.sync_interval
        );
        self.notify_scheduler(&created.id, false).await?;
        Ok(created)
    }

    /// Change label, kind or interval of a registration.
    pub async fn update_registration(
        &self,
        registration: NewRegistration,
    ) -> Result<CollectionRegistration> {
        self.check_interval(&registration)?;
        self.require_registration(&registration.id)?;

        let updated = self
            .store
            .upsert_registration(&registration, self.clock.now())?;
        info!("Updated registration {}", updated.id);
        self.notify_scheduler(&updated.id, false).await?;
        Ok(updated)
    }

    /// Re-enable a collection and clear its failure streak.
    pub async fn enable(&self, collection: &CollectionId) -> Result<()> {
        self.store.set_enabled(collection, true)?;
        info!("Enabled {}", collection);
        self.notify_scheduler(collection, true).await
    }

    /// Exclude a collection from all syncing.
    pub async fn disable(&self, collection: &CollectionId) -> Result<()> {
        self.store.set_enabled(collection, false)?;
        info!("Disabled {}", collection);
        self.notify_scheduler(collection, false).await
    }

    fn require_registration(&self, collection: &CollectionId) -> Result<CollectionRegistration> {
        self.store
            .get_registration(collection)?
            .ok_or_else(|| Error::NotFound(format!("Collection {}", collection)))
    }

    /// Hand a registration change to the scheduler, or apply it directly
    /// when no scheduler runs.
    async fn notify_scheduler(
        &self,
        collection: &CollectionId,
        reset_failures: bool,
    ) -> Result<()> {
        if let Some(scheduler) = self.running_scheduler() {
            return scheduler.reload(collection, reset_failures).await;
        }
        if reset_failures {
            let mut registration = self.require_registration(collection)?;
            registration.runtime.consecutive_failures = 0;
            registration.runtime.last_error = None;
            if registration.runtime.status == CollectionStatus::Failed {
                registration.runtime.status = CollectionStatus::Idle;
            }
            self.store.save_runtime(collection, &registration.runtime)?;
        }
        Ok(())
    }

    // ----- queries --------------------------------------------------------

    fn status_view(&self, registration: CollectionRegistration) -> CollectionStatusView {
        let suspended = registration.runtime.consecutive_failures
            >= self.config.scheduler.max_consecutive_failures;
        CollectionStatusView {
            circuit: self.breakers.status(registration.id.as_str()),
            id: registration.id,
            label: registration.label,
            kind: registration.kind,
            enabled: registration.enabled,
            status: registration.runtime.status,
            last_successful: registration.runtime.last_successful,
            last_attempted: registration.runtime.last_attempted,
            consecutive_failures: registration.runtime.consecutive_failures,
            last_error: registration.runtime.last_error,
            suspended,
        }
    }

    /// Status of one collection.
    pub fn status(&self, collection: &CollectionId) -> Result<CollectionStatusView> {
        let registration = self.require_registration(collection)?;
        Ok(self.status_view(registration))
    }

    /// Status of every registered collection.
    pub fn statuses(&self) -> Result<Vec<CollectionStatusView>> {
        Ok(self
            .store
            .list_registrations()?
            .into_iter()
            .map(|r| self.status_view(r))
            .collect())
    }

    /// Finished sync attempts, newest first.
    pub fn history(&self, query: &HistoryQuery) -> Result<Vec<SyncAttemptRecord>> {
        self.store.list_attempts(query)
    }

    pub fn attempt(&self, id: &str) -> Result<Option<SyncAttemptRecord>> {
        self.store.get_attempt(id)
    }

    /// Mirrored copy of an item.
    pub fn item(&self, item: &ItemId) -> Result<Option<ItemSnapshot>> {
        self.store.get_snapshot(item)
    }

    /// Mirrored items of a collection.
    pub fn items(
        &self,
        collection: &CollectionId,
        include_archived: bool,
    ) -> Result<Vec<ItemSnapshot>> {
        self.store.list_snapshots(collection, include_archived)
    }

    /// Breaker counters of a collection.
    pub fn circuit(&self, collection: &CollectionId) -> CircuitState {
        self.breakers.snapshot(collection.as_str())
    }

    // ----- local edits and conflicts -------------------------------------

    /// Queue a local edit to be pushed on the next pass.
    ///
    /// # Errors
    /// - `NotFound` if the item is not mirrored
    /// - `InvalidInput` for an empty patch or an archived item
    pub fn queue_local_edit(&self, item: &ItemId, patch: ItemPatch) -> Result<PendingEdit> {
        if patch.is_empty() {
            return Err(Error::InvalidInput("Edit changes nothing".to_string()));
        }
        let snapshot = self
            .store
            .get_snapshot(item)?
            .ok_or_else(|| Error::NotFound(format!("Item {}", item)))?;
        if snapshot.archived {
            return Err(Error::InvalidInput(format!("Item {} is archived", item)));
        }

        let edit = self.store.queue_edit(
            item,
            &snapshot.collection_id,
            &patch,
            snapshot.remote_last_edited,
            self.clock.now(),
        )?;
        debug!("Queued edit {} for {}", edit.id, item);
        Ok(edit)
    }

    /// Items waiting for manual conflict resolution.
    pub fn conflicts(&self) -> Result<Vec<ConflictEntry>> {
        self.store
            .conflicted_snapshots()?
            .into_iter()
            .map(|snapshot| {
                let pending_edit = self.store.pending_edit_for_item(&snapshot.item_id)?;
                Ok(ConflictEntry {
                    snapshot,
                    pending_edit,
                })
            })
            .collect()
    }

    /// Acknowledge a conflict and settle it.
    ///
    /// Both resolutions adopt the remote version into the snapshot; they
    /// differ in what happens to the pending local edit.
    pub fn resolve_conflict(&self, item: &ItemId, resolution: Resolution) -> Result<ItemSnapshot> {
        let mut snapshot = self
            .store
            .get_snapshot(item)?
            .ok_or_else(|| Error::NotFound(format!("Item {}", item)))?;
        if !snapshot.conflict {
            return Err(Error::InvalidInput(format!("Item {} is not in conflict", item)));
        }

        if let Some(detail) = snapshot.conflict_detail.take() {
            snapshot.content_hash =
                content_hash(&detail.remote_properties, detail.remote_content.as_deref());
            snapshot.properties = detail.remote_properties;
            snapshot.content = detail.remote_content;
            snapshot.remote_last_edited = detail.remote_last_edited;
        }
        snapshot.conflict = false;
        snapshot.synced_at = self.clock.now();

        if let Some(mut edit) = self.store.pending_edit_for_item(item)? {
            match resolution {
                Resolution::KeepRemote => self.store.remove_edit(&edit.id)?,
                Resolution::KeepLocal => {
                    edit.base_remote_edited = snapshot.remote_last_edited;
                    self.store.save_edit(&edit)?;
                }
            }
        }
        self.store.put_snapshot(&snapshot)?;

        info!("Resolved conflict on {} keeping {}", item, resolution);
        Ok(snapshot)
    }

    // ----- scheduling -----------------------------------------------------

    fn running_scheduler(&self) -> Option<SyncScheduler> {
        self.scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|s| s.is_running())
            .cloned()
    }

    /// Start the scheduler loop, or return the one already running.
    ///
    /// Attempts and collections left unfinished by a previous process are
    /// closed as failed first. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<SyncScheduler> {
        let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref().filter(|s| s.is_running()) {
            return Ok(existing.clone());
        }

        let recovered = self.store.recover_interrupted(self.clock.now())?;
        if recovered > 0 {
            warn!("Closed {} interrupted sync attempts", recovered);
        }

        let (scheduler, handle) = SyncScheduler::new(
            self.config.scheduler.clone(),
            self.store.clone(),
            self.reconciler.clone(),
            self.events.clone(),
            self.clock.clone(),
        );
        tokio::spawn(handle.run());
        *slot = Some(scheduler.clone());
        Ok(scheduler)
    }

    /// Force one collection through the scheduler.
    pub async fn force_sync(&self, collection: &CollectionId) -> Result<SyncAttemptRecord> {
        self.start()?.force_sync(collection).await
    }

    /// Run every due collection through the scheduler.
    pub async fn run_due(&self) -> Result<Vec<SyncAttemptRecord>> {
        self.start()?.run_due().await
    }

    /// Stop the scheduler, waiting for in-flight runs.
    pub async fn shutdown(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
    }

    /// Subscribe to run notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
