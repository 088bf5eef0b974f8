//! Fetch-and-compare of one collection against its local snapshots.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use docmirror_common::{Clock, Cursor, Error, ItemId, Result};
use docmirror_remote::{RemoteClient, RemoteItem};
use docmirror_store::model::content_hash;
use docmirror_store::{
    AttemptStatus, CachedSchema, CollectionRegistration, ConflictDetail, ItemSnapshot,
    MirrorStore, SyncAttemptRecord, SyncCounts, SyncTrigger,
};

use crate::circuit::CircuitStatus;
use crate::retry::RetryExecutor;

/// Knobs of a reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub page_size: usize,
    /// Safety limit on listing pages per pass.
    pub max_pages: usize,
    /// Age after which the cached schema is refetched.
    pub schema_refresh: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 100,
            schema_refresh: Duration::from_secs(3600),
        }
    }
}

/// Result of one pass, before it is stamped into a record.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub status: AttemptStatus,
    pub counts: SyncCounts,
    pub error_summary: Option<String>,
}

impl ReconcileReport {
    fn failed(counts: SyncCounts, summary: String) -> Self {
        Self {
            status: AttemptStatus::Failed,
            counts,
            error_summary: Some(summary),
        }
    }
}

/// How a single listed item was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Created,
    Updated,
    Unchanged,
    Conflicted,
    Archived,
}

/// Item-level failures of a pass.
#[derive(Default)]
struct ItemErrors {
    processed: usize,
    errored: usize,
    first: Option<String>,
}

impl ItemErrors {
    fn ok(&mut self) {
        self.processed += 1;
    }

    fn record(&mut self, item: &ItemId, err: &Error, counts: &mut SyncCounts) {
        self.processed += 1;
        self.errored += 1;
        counts.errored += 1;
        if err.is_circuit_open() {
            counts.circuit_rejected += 1;
        }
        warn!("Item {} failed: {}", item, err);
        if self.first.is_none() {
            self.first = Some(format!("{}: {}", item, err));
        }
    }
}

/// Reconciles remote collections into the mirror store.
pub struct Reconciler {
    remote: Arc<dyn RemoteClient>,
    store: Arc<MirrorStore>,
    retry: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<MirrorStore>,
        retry: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            remote,
            store,
            retry,
            clock,
            settings,
        }
    }

    /// Run one pass over a collection and record it in the history.
    ///
    /// The attempt row is opened before the pass and always finalized, also
    /// when the pass panics.
    ///
    /// # Errors
    /// - The history row could not be written
    pub async fn reconcile(
        &self,
        registration: &CollectionRegistration,
        trigger: SyncTrigger,
    ) -> Result<SyncAttemptRecord> {
        let open = self
            .store
            .begin_attempt(&registration.id, trigger, self.clock.now())?;
        info!(
            "Syncing {} ({}, trigger {})",
            registration.id,
            registration.kind,
            trigger.as_str()
        );

        let report = match AssertUnwindSafe(self.pass(registration)).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Sync of {} panicked: {}", registration.id, message);
                ReconcileReport::failed(SyncCounts::default(), format!("panicked: {}", message))
            }
        };

        let record = open.finish(
            report.status,
            report.counts,
            report.error_summary,
            self.clock.now(),
        );
        self.store.finish_attempt(&record)?;

        info!(
            "Sync of {} finished {}: {} fetched, {} created, {} updated, {} conflicted, {} errored",
            registration.id,
            record.status.as_str(),
            record.counts.fetched,
            record.counts.created,
            record.counts.updated,
            record.counts.conflicted,
            record.counts.errored
        );
        Ok(record)
    }

    /// The pass itself, without history bookkeeping.
    pub async fn pass(&self, registration: &CollectionRegistration) -> ReconcileReport {
        let mut counts = SyncCounts::default();
        let target = registration.id.as_str();

        let (listed, complete) = match self.list_all(registration, &mut counts).await {
            Ok(listing) => listing,
            Err(summary) => return ReconcileReport::failed(counts, summary),
        };
        counts.fetched = listed.len();

        self.refresh_schema(registration).await;

        let mut errors = ItemErrors::default();
        let mut seen = HashSet::with_capacity(listed.len());
        for item in &listed {
            seen.insert(item.id.clone());
            match self.reconcile_item(registration, item).await {
                Ok(outcome) => {
                    errors.ok();
                    match outcome {
                        ItemOutcome::Created => counts.created += 1,
                        ItemOutcome::Updated => counts.updated += 1,
                        ItemOutcome::Unchanged => counts.unchanged += 1,
                        ItemOutcome::Conflicted => counts.conflicted += 1,
                        ItemOutcome::Archived => counts.archived += 1,
                    }
                }
                Err(err) => errors.record(&item.id, &err, &mut counts),
            }
        }

        if complete {
            match self
                .store
                .archive_missing(&registration.id, &seen, self.clock.now())
            {
                Ok(archived) => counts.archived += archived,
                Err(err) => {
                    return ReconcileReport::failed(
                        counts,
                        format!("archiving missing items failed: {}", err),
                    )
                }
            }
        } else {
            debug!("Partial listing of {}, archive check skipped", target);
        }

        if let Err(err) = self
            .push_edits(registration, &listed, &mut counts, &mut errors)
            .await
        {
            return ReconcileReport::failed(counts, format!("pushing local edits failed: {}", err));
        }

        if errors.errored == 0 {
            ReconcileReport {
                status: AttemptStatus::Success,
                counts,
                error_summary: None,
            }
        } else {
            let summary = format!(
                "{} of {} items failed; first error: {}",
                errors.errored,
                errors.processed,
                errors.first.unwrap_or_default()
            );
            let status = if errors.errored == errors.processed {
                AttemptStatus::Failed
            } else {
                AttemptStatus::Partial
            };
            ReconcileReport {
                status,
                counts,
                error_summary: Some(summary),
            }
        }
    }

    /// Refetch the schema when it is missing or stale.
    ///
    /// One attempt, outside the retry budget and the breaker's books, and only
    /// while the breaker is closed. Failures are ignored.
    async fn refresh_schema(&self, registration: &CollectionRegistration) {
        let now = self.clock.now();
        let fresh = registration.schema.as_ref().is_some_and(|cached| {
            now.signed_duration_since(cached.fetched_at)
                .to_std()
                .map(|age| age < self.settings.schema_refresh)
                .unwrap_or(true)
        });
        if fresh {
            return;
        }

        let id = &registration.id;
        let status = self.retry.breakers().status(id.as_str());
        if status != CircuitStatus::Closed {
            debug!("Schema refresh of {} skipped: circuit {}", id, status);
            return;
        }

        let call_timeout = self.retry.config().call_timeout();
        let result = match tokio::time::timeout(call_timeout, self.remote.fetch_schema(id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(call_timeout)),
        };
        match result {
            Ok(schema) => {
                let cached = CachedSchema {
                    schema,
                    fetched_at: now,
                };
                if let Err(err) = self.store.save_schema(id, &cached) {
                    warn!("Failed to cache schema of {}: {}", id, err);
                } else {
                    debug!("Refreshed schema of {}", id);
                }
            }
            Err(err) => debug!("Schema refresh of {} skipped: {}", id, err),
        }
    }

    /// Page through the collection.
    ///
    /// Returns the listed items and whether the cursor was exhausted, or an
    /// error summary when a page could not be fetched.
    async fn list_all(
        &self,
        registration: &CollectionRegistration,
        counts: &mut SyncCounts,
    ) -> std::result::Result<(Vec<RemoteItem>, bool), String> {
        let remote = &self.remote;
        let id = &registration.id;
        let page_size = self.settings.page_size;
        let mut items = Vec::new();
        let mut cursor: Option<Cursor> = None;

        for page_number in 0..self.settings.max_pages {
            let current = cursor.as_ref();
            let outcome = self
                .retry
                .execute(id.as_str(), move || remote.fetch_page(id, current, page_size))
                .await;

            let summary = outcome.failure_summary();
            if outcome.circuit_rejected {
                counts.circuit_rejected += 1;
            }
            match outcome.result {
                Ok(page) => {
                    debug!(
                        "Page {} of {}: {} items",
                        page_number + 1,
                        id,
                        page.items.len()
                    );
                    items.extend(page.items);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => return Ok((items, true)),
                    }
                }
                Err(err) => {
                    warn!("Listing {} failed: {}", id, err);
                    return Err(format!(
                        "listing failed: {}",
                        summary.unwrap_or_else(|| err.to_string())
                    ));
                }
            }
        }

        warn!(
            "Listing {} stopped at the {} page limit",
            id, self.settings.max_pages
        );
        Ok((items, false))
    }

    async fn fetch_full(&self, item: &RemoteItem) -> Result<RemoteItem> {
        let remote = &self.remote;
        let id = &item.id;
        self.retry
            .execute(item.collection_id.as_str(), move || remote.fetch_item(id))
            .await
            .into_result()
    }

    /// Classify and apply one listed item.
    async fn reconcile_item(
        &self,
        registration: &CollectionRegistration,
        item: &RemoteItem,
    ) -> Result<ItemOutcome> {
        registration.kind.check_item(item)?;
        let existing = self.store.get_snapshot(&item.id)?;

        if item.archived {
            return match existing {
                Some(mut snapshot) if !snapshot.archived => {
                    snapshot.archived = true;
                    snapshot.synced_at = self.clock.now();
                    self.store.put_snapshot(&snapshot)?;
                    Ok(ItemOutcome::Archived)
                }
                _ => Ok(ItemOutcome::Unchanged),
            };
        }

        let mut snapshot = match existing {
            None => {
                let full = self.fetch_full(item).await?;
                registration.kind.check_item(&full)?;
                self.store
                    .put_snapshot(&ItemSnapshot::from_remote(&full, self.clock.now()))?;
                return Ok(ItemOutcome::Created);
            }
            Some(snapshot) => snapshot,
        };

        if snapshot.conflict {
            return self.refresh_conflict(snapshot, item).await;
        }

        if item.last_edited <= snapshot.remote_last_edited {
            if snapshot.archived {
                snapshot.archived = false;
                snapshot.synced_at = self.clock.now();
                self.store.put_snapshot(&snapshot)?;
                return Ok(ItemOutcome::Updated);
            }
            return Ok(ItemOutcome::Unchanged);
        }

        if let Some(edit) = self.store.pending_edit_for_item(&item.id)? {
            if item.last_edited > edit.base_remote_edited {
                let full = self.fetch_full(item).await?;
                info!(
                    "Conflict on {}: remote edited at {} while local edit {} is pending",
                    item.id, full.last_edited, edit.id
                );
                snapshot.conflict = true;
                snapshot.conflict_detail = Some(ConflictDetail {
                    pending_edit_id: Some(edit.id),
                    local_edited_at: Some(edit.created_at),
                    remote_last_edited: full.last_edited,
                    remote_properties: full.properties,
                    remote_content: full.content,
                    detected_at: self.clock.now(),
                });
                self.store.put_snapshot(&snapshot)?;
                return Ok(ItemOutcome::Conflicted);
            }
        }

        let full = self.fetch_full(item).await?;
        registration.kind.check_item(&full)?;
        let now = self.clock.now();
        let hash = content_hash(&full.properties, full.content.as_deref());
        if hash == snapshot.content_hash && !snapshot.archived {
            snapshot.remote_last_edited = full.last_edited;
            snapshot.synced_at = now;
            self.store.put_snapshot(&snapshot)?;
            Ok(ItemOutcome::Unchanged)
        } else {
            snapshot.apply_remote(&full, now);
            self.store.put_snapshot(&snapshot)?;
            Ok(ItemOutcome::Updated)
        }
    }

    /// Keep the remote side of an unresolved conflict current.
    async fn refresh_conflict(
        &self,
        mut snapshot: ItemSnapshot,
        item: &RemoteItem,
    ) -> Result<ItemOutcome> {
        let known = snapshot
            .conflict_detail
            .as_ref()
            .map(|detail| detail.remote_last_edited)
            .unwrap_or(snapshot.remote_last_edited);

        if item.last_edited > known {
            let full = self.fetch_full(item).await?;
            let now = self.clock.now();
            let detail = snapshot.conflict_detail.get_or_insert_with(|| ConflictDetail {
                pending_edit_id: None,
                local_edited_at: None,
                remote_last_edited: full.last_edited,
                remote_properties: Default::default(),
                remote_content: None,
                detected_at: now,
            });
            detail.remote_last_edited = full.last_edited;
            detail.remote_properties = full.properties;
            detail.remote_content = full.content;
            if self.store.update_conflict_detail(&item.id, detail)? {
                debug!("Refreshed remote side of conflict on {}", item.id);
            } else {
                debug!("Conflict on {} was resolved during refresh", item.id);
            }
        }
        Ok(ItemOutcome::Conflicted)
    }

    /// Push queued local edits of non-conflicted items.
    ///
    /// An edit is written only when this pass listed its item at or before
    /// the edit's base; anything else waits for a pass that confirms the
    /// remote side is unchanged.
    async fn push_edits(
        &self,
        registration: &CollectionRegistration,
        listed: &[RemoteItem],
        counts: &mut SyncCounts,
        errors: &mut ItemErrors,
    ) -> Result<()> {
        let remote = &self.remote;
        let listed: HashMap<&ItemId, DateTime<Utc>> = listed
            .iter()
            .map(|item| (&item.id, item.last_edited))
            .collect();

        for edit in self.store.pending_edits(&registration.id)? {
            match listed.get(&edit.item_id) {
                Some(last_edited) if *last_edited <= edit.base_remote_edited => {}
                Some(last_edited) => {
                    debug!(
                        "Holding edit {} of {}: remote edited at {} after base {}",
                        edit.id, edit.item_id, last_edited, edit.base_remote_edited
                    );
                    continue;
                }
                None => {
                    debug!(
                        "Holding edit {} of {}: item not listed this pass",
                        edit.id, edit.item_id
                    );
                    continue;
                }
            }

            let snapshot = self.store.get_snapshot(&edit.item_id)?;
            if snapshot.as_ref().is_some_and(|s| s.conflict) {
                debug!("Holding edit {} of conflicted item {}", edit.id, edit.item_id);
                continue;
            }

            let item_id = &edit.item_id;
            let patch = &edit.patch;
            let outcome = self
                .retry
                .execute(registration.id.as_str(), move || {
                    remote.write_item(item_id, patch)
                })
                .await;

            match outcome.result {
                Ok(written) => {
                    let now = self.clock.now();
                    let updated = match snapshot {
                        Some(mut existing) => {
                            existing.apply_remote(&written, now);
                            existing
                        }
                        None => ItemSnapshot::from_remote(&written, now),
                    };
                    self.store.put_snapshot(&updated)?;
                    self.store.complete_edit(&edit, written.last_edited)?;
                    counts.pushed += 1;
                    errors.ok();
                    debug!("Pushed edit {} of {}", edit.id, edit.item_id);
                }
                Err(err) => errors.record(&edit.item_id, &err, counts),
            }
        }
        Ok(())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakers, CircuitConfig};
    use crate::retry::RetryConfig;
    use docmirror_common::{CollectionId, SystemClock};
    use docmirror_remote::{CollectionSchema, InjectedFailure, ItemPatch, MemoryRemote};
    use docmirror_store::{CollectionKind, NewRegistration};
    use serde_json::{json, Map, Value};

    struct Fixture {
        remote: Arc<MemoryRemote>,
        store: Arc<MirrorStore>,
        reconciler: Reconciler,
        collection: CollectionId,
    }

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn fixture(kind: CollectionKind) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MirrorStore::in_memory().unwrap());
        let collection = CollectionId::new("tasks").unwrap();
        remote.create_collection(&collection, CollectionSchema::default());
        store
            .upsert_registration(
                &NewRegistration {
                    id: collection.clone(),
                    label: "Tasks".to_string(),
                    kind,
                    sync_interval: Duration::from_secs(60),
                },
                clock.now(),
            )
            .unwrap();

        let breakers = Arc::new(CircuitBreakers::new(CircuitConfig::default(), clock.clone()));
        let retry = Arc::new(RetryExecutor::new(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            breakers,
        ));
        let reconciler = Reconciler::new(
            remote.clone(),
            store.clone(),
            retry,
            clock,
            ReconcileSettings {
                page_size: 2,
                ..Default::default()
            },
        );
        Fixture {
            remote,
            store,
            reconciler,
            collection,
        }
    }

    impl Fixture {
        fn registration(&self) -> CollectionRegistration {
            self.store.get_registration(&self.collection).unwrap().unwrap()
        }

        fn put(&self, id: &str, title: &str) -> ItemId {
            let item = ItemId::new(id).unwrap();
            self.remote.put_item(
                &self.collection,
                &item,
                props(json!({"title": title, "status": "open"})),
                Some("body"),
            );
            item
        }

        async fn pass(&self) -> ReconcileReport {
            self.reconciler.pass(&self.registration()).await
        }
    }

    #[tokio::test]
    async fn test_empty_collection_succeeds() {
        let f = fixture(CollectionKind::TaskList);
        let report = f.pass().await;
        assert_eq!(report.status, AttemptStatus::Success);
        assert_eq!(report.counts, SyncCounts::default());
    }

    #[tokio::test]
    async fn test_multi_page_listing_creates_all() {
        let f = fixture(CollectionKind::TaskList);
        for i in 0..5 {
            f.put(&format!("item-{}", i), "task");
        }

        let report = f.pass().await;

        assert_eq!(report.status, AttemptStatus::Success);
        assert_eq!(report.counts.fetched, 5);
        assert_eq!(report.counts.created, 5);
        assert_eq!(f.remote.listing_calls(&f.collection), 3);
        let snapshot = f.store.get_snapshot(&ItemId::new("item-0").unwrap()).unwrap().unwrap();
        assert_eq!(snapshot.content.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn test_schema_is_cached() {
        let f = fixture(CollectionKind::TaskList);
        f.pass().await;
        assert!(f.registration().schema.is_some());
    }

    #[tokio::test]
    async fn test_malformed_item_is_item_error() {
        let f = fixture(CollectionKind::TaskList);
        f.put("good", "task");
        f.remote.put_item(
            &f.collection,
            &ItemId::new("bad").unwrap(),
            props(json!({"title": "no status"})),
            None,
        );

        let report = f.pass().await;

        assert_eq!(report.status, AttemptStatus::Partial);
        assert_eq!(report.counts.created, 1);
        assert_eq!(report.counts.errored, 1);
        assert!(report.error_summary.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_every_item_failing_fails_the_run() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("only", "task");
        f.remote.fail_item(&item, InjectedFailure::NotFound, 1);

        let report = f.pass().await;

        assert_eq!(report.status, AttemptStatus::Failed);
        assert_eq!(report.counts.errored, 1);
    }

    #[tokio::test]
    async fn test_same_content_newer_timestamp_is_unchanged() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("a", "task");
        f.pass().await;

        // Re-put identical content: timestamp advances, hash does not.
        f.put("a", "task");
        let report = f.pass().await;

        assert_eq!(report.counts.unchanged, 1);
        assert_eq!(report.counts.updated, 0);
        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        assert_eq!(snapshot.remote_last_edited, f.remote.item(&item).unwrap().last_edited);
    }

    #[tokio::test]
    async fn test_remote_archive_marks_snapshot() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("a", "task");
        f.pass().await;

        f.remote.archive_item(&item).unwrap();
        let report = f.pass().await;

        assert_eq!(report.counts.archived, 1);
        assert!(f.store.get_snapshot(&item).unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn test_missing_items_archived_on_full_pass_and_restored() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("a", "task");
        f.put("b", "task");
        f.pass().await;

        f.remote.delete_item(&item);
        let report = f.pass().await;
        assert_eq!(report.counts.archived, 1);
        assert!(f.store.get_snapshot(&item).unwrap().unwrap().archived);

        f.put("a", "task again");
        let report = f.pass().await;
        assert_eq!(report.counts.updated, 1);
        assert!(!f.store.get_snapshot(&item).unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn test_page_limit_skips_archive_check() {
        let mut f = fixture(CollectionKind::TaskList);
        for i in 0..4 {
            f.put(&format!("item-{}", i), "task");
        }
        f.pass().await;

        f.remote.delete_item(&ItemId::new("item-3").unwrap());
        f.reconciler.settings.max_pages = 1;
        let report = f.pass().await;

        assert_eq!(report.counts.fetched, 2);
        assert_eq!(report.counts.archived, 0);
    }

    #[tokio::test]
    async fn test_pending_edit_is_pushed() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("a", "task");
        f.pass().await;

        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        f.store
            .queue_edit(
                &item,
                &f.collection,
                &ItemPatch::default().with_property("status", json!("done")),
                snapshot.remote_last_edited,
                snapshot.synced_at,
            )
            .unwrap();

        let report = f.pass().await;

        assert_eq!(report.counts.pushed, 1);
        assert_eq!(f.remote.write_calls(), 1);
        assert!(f.store.pending_edits(&f.collection).unwrap().is_empty());
        let remote = f.remote.item(&item).unwrap();
        assert_eq!(remote.properties["status"], json!("done"));
        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        assert_eq!(snapshot.properties["status"], json!("done"));

        // The pushed version is already mirrored.
        let report = f.pass().await;
        assert_eq!(report.counts.unchanged, 1);
        assert_eq!(report.counts.updated, 0);
    }

    #[tokio::test]
    async fn test_edit_held_when_item_beyond_page_limit() {
        let mut f = fixture(CollectionKind::TaskList);
        for i in 0..3 {
            f.put(&format!("item-{}", i), "task");
        }
        f.pass().await;

        let item = ItemId::new("item-2").unwrap();
        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        f.store
            .queue_edit(
                &item,
                &f.collection,
                &ItemPatch::default().with_property("title", json!("local")),
                snapshot.remote_last_edited,
                snapshot.synced_at,
            )
            .unwrap();
        f.put("item-2", "remote");

        f.reconciler.settings.max_pages = 1;
        let report = f.pass().await;

        assert_eq!(report.counts.fetched, 2);
        assert_eq!(report.counts.pushed, 0);
        assert_eq!(f.remote.write_calls(), 0);
        assert_eq!(f.remote.item(&item).unwrap().properties["title"], json!("remote"));
        assert!(f.store.pending_edit_for_item(&item).unwrap().is_some());

        // A full listing sees the remote change and records the conflict.
        f.reconciler.settings.max_pages = 100;
        let report = f.pass().await;
        assert_eq!(report.counts.conflicted, 1);
        assert_eq!(f.remote.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_edit_held_when_newer_remote_cannot_be_fetched() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("a", "original");
        f.pass().await;

        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        f.store
            .queue_edit(
                &item,
                &f.collection,
                &ItemPatch::default().with_property("title", json!("local")),
                snapshot.remote_last_edited,
                snapshot.synced_at,
            )
            .unwrap();
        f.put("a", "remote");
        f.remote.fail_item(&item, InjectedFailure::NotFound, 1);

        let report = f.pass().await;

        assert_eq!(report.counts.errored, 1);
        assert_eq!(report.counts.pushed, 0);
        assert_eq!(f.remote.write_calls(), 0);
        assert_eq!(f.remote.item(&item).unwrap().properties["title"], json!("remote"));
        assert!(f.store.pending_edit_for_item(&item).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflicted_snapshot_tracks_latest_remote() {
        let f = fixture(CollectionKind::TaskList);
        let item = f.put("a", "original");
        f.pass().await;

        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        f.store
            .queue_edit(
                &item,
                &f.collection,
                &ItemPatch::default().with_property("title", json!("local")),
                snapshot.remote_last_edited,
                snapshot.synced_at,
            )
            .unwrap();
        f.put("a", "remote one");
        assert_eq!(f.pass().await.counts.conflicted, 1);

        f.put("a", "remote two");
        let report = f.pass().await;

        assert_eq!(report.counts.conflicted, 1);
        assert_eq!(report.counts.pushed, 0);
        let snapshot = f.store.get_snapshot(&item).unwrap().unwrap();
        assert_eq!(snapshot.properties["title"], json!("original"));
        let detail = snapshot.conflict_detail.unwrap();
        assert_eq!(detail.remote_properties["title"], json!("remote two"));
        assert_eq!(f.remote.write_calls(), 0);
    }

    #[test]
    fn test_panic_message_extraction() {
        let panic = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "kaboom");
    }
}
