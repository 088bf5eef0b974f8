//! Sync scheduling: periodic ticks, forced runs and the worker cap.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use docmirror_common::{Clock, CollectionId, Error, Result};
use docmirror_store::{
    AttemptStatus, CollectionRegistration, CollectionStatus, MirrorStore, SyncAttemptRecord,
    SyncTrigger,
};

use crate::events::{EventBus, SyncEvent};
use crate::reconcile::{panic_message, Reconciler};

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between two due checks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Runs allowed in flight at once.
    pub max_concurrent_syncs: usize,
    /// Failed runs in a row after which a collection is left to manual action.
    pub max_consecutive_failures: u32,
    /// Smallest sync interval a registration may ask for, in seconds.
    pub min_sync_interval_secs: u64,
    /// Safety limit on listing pages per pass.
    pub max_pages: usize,
    /// Age after which a cached schema is refetched, in seconds.
    pub schema_refresh_secs: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_sync_interval_secs)
    }

    pub fn schema_refresh(&self) -> Duration {
        Duration::from_secs(self.schema_refresh_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 30_000,
            max_concurrent_syncs: 3,
            max_consecutive_failures: 5,
            min_sync_interval_secs: 60,
            max_pages: 100,
            schema_refresh_secs: 3600,
        }
    }
}

type RunReply = oneshot::Sender<Result<SyncAttemptRecord>>;

/// Requests handled by the scheduler loop.
#[derive(Debug)]
enum SchedulerRequest {
    /// Run one collection now, or join its in-flight run.
    Force {
        collection: CollectionId,
        reply: RunReply,
    },
    /// Run every due collection now.
    RunDue {
        reply: oneshot::Sender<Result<Vec<SyncAttemptRecord>>>,
    },
    /// Registration changed in the store.
    Reload {
        collection: CollectionId,
        reset_failures: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Request side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<MirrorStore>,
        reconciler: Arc<Reconciler>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let handle = SyncSchedulerHandle {
            slots: Arc::new(Semaphore::new(config.max_concurrent_syncs.max(1))),
            config,
            store,
            reconciler,
            events,
            clock,
            request_rx,
            table: HashMap::new(),
            queue: VecDeque::new(),
            running: HashSet::new(),
            waiters: HashMap::new(),
            runs: JoinSet::new(),
            accepting: true,
        };
        (Self { request_tx }, handle)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SchedulerRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.request_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;
        response
            .await
            .map_err(|_| Error::Scheduler("Scheduler dropped the request".to_string()))?
    }

    /// Run one collection now, bypassing its due time.
    ///
    /// If the collection is already running, the caller gets the record of
    /// that run instead of starting a second one.
    pub async fn force_sync(&self, collection: &CollectionId) -> Result<SyncAttemptRecord> {
        let collection = collection.clone();
        self.request(|reply| SchedulerRequest::Force { collection, reply })
            .await
    }

    /// Run every due collection now and wait for the records.
    pub async fn run_due(&self) -> Result<Vec<SyncAttemptRecord>> {
        self.request(|reply| SchedulerRequest::RunDue { reply }).await
    }

    /// Pick up a registration change from the store.
    pub async fn reload(&self, collection: &CollectionId, reset_failures: bool) -> Result<()> {
        let collection = collection.clone();
        self.request(|reply| SchedulerRequest::Reload {
            collection,
            reset_failures,
            reply,
        })
        .await
    }

    /// Stop accepting work and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .request_tx
            .send(SchedulerRequest::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.request_tx.is_closed()
    }
}

/// The scheduler loop.
///
/// Owns the runtime table of every registered collection; all runtime
/// changes go through [`SyncSchedulerHandle::apply_outcome`].
pub struct SyncSchedulerHandle {
    config: SchedulerConfig,
    store: Arc<MirrorStore>,
    reconciler: Arc<Reconciler>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    request_rx: mpsc::Receiver<SchedulerRequest>,
    slots: Arc<Semaphore>,
    table: HashMap<CollectionId, CollectionRegistration>,
    queue: VecDeque<(CollectionId, SyncTrigger)>,
    running: HashSet<CollectionId>,
    waiters: HashMap<CollectionId, Vec<RunReply>>,
    runs: JoinSet<(CollectionId, Result<SyncAttemptRecord>)>,
    accepting: bool,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self) {
        if let Err(e) = self.load_table() {
            error!("Failed to load registrations: {}", e);
        }

        let period = self.config.tick_interval().max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Sync scheduler started ({} collections, {} slots)",
            self.table.len(),
            self.config.max_concurrent_syncs
        );

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SchedulerRequest::Shutdown { reply }) => {
                        info!("Received shutdown request");
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => break,
                },

                _ = ticker.tick() => {
                    let due = self.enqueue_due(SyncTrigger::Scheduled);
                    if !due.is_empty() {
                        debug!("Tick queued {} due collections", due.len());
                    }
                }

                Some(joined) = self.runs.join_next(), if !self.runs.is_empty() => {
                    match joined {
                        Ok((collection, result)) => self.apply_outcome(&collection, result),
                        Err(e) => error!("Sync task ended abnormally: {}", e),
                    }
                }
            }
            self.dispatch();
        }

        self.drain().await;
        info!("Sync scheduler stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn load_table(&mut self) -> Result<()> {
        for registration in self.store.list_registrations()? {
            self.table.insert(registration.id.clone(), registration);
        }
        Ok(())
    }

    fn handle_request(&mut self, request: SchedulerRequest) {
        match request {
            SchedulerRequest::Force { collection, reply } => self.force(collection, reply),
            SchedulerRequest::RunDue { reply } => {
                let due = self.enqueue_due(SyncTrigger::Manual);
                let receivers: Vec<_> = due
                    .into_iter()
                    .map(|collection| {
                        let (tx, rx) = oneshot::channel();
                        self.waiters.entry(collection).or_default().push(tx);
                        rx
                    })
                    .collect();
                tokio::spawn(async move {
                    let mut records = Vec::with_capacity(receivers.len());
                    for rx in receivers {
                        match rx.await {
                            Ok(Ok(record)) => records.push(record),
                            Ok(Err(e)) => warn!("Manual run failed: {}", e),
                            Err(_) => warn!("Manual run was dropped"),
                        }
                    }
                    let _ = reply.send(Ok(records));
                });
            }
            SchedulerRequest::Reload {
                collection,
                reset_failures,
                reply,
            } => {
                let _ = reply.send(self.reload(&collection, reset_failures));
            }
            SchedulerRequest::Shutdown { .. } => {}
        }
    }

    fn force(&mut self, collection: CollectionId, reply: RunReply) {
        let Some(registration) = self.table.get(&collection) else {
            let _ = reply.send(Err(Error::NotFound(format!("Collection {}", collection))));
            return;
        };
        if !registration.enabled {
            let _ = reply.send(Err(Error::InvalidInput(format!(
                "Collection {} is disabled",
                collection
            ))));
            return;
        }

        if self.running.contains(&collection) {
            debug!("Forced sync of {} joins the run in flight", collection);
        } else if !self.is_queued(&collection) {
            self.queue.push_back((collection.clone(), SyncTrigger::Forced));
        }
        self.waiters.entry(collection).or_default().push(reply);
    }

    fn reload(&mut self, collection: &CollectionId, reset_failures: bool) -> Result<()> {
        let mut fresh = self
            .store
            .get_registration(collection)?
            .ok_or_else(|| Error::NotFound(format!("Collection {}", collection)))?;

        if let Some(known) = self.table.get(collection) {
            fresh.runtime = known.runtime.clone();
        }
        if reset_failures {
            fresh.runtime.consecutive_failures = 0;
            fresh.runtime.last_error = None;
            if fresh.runtime.status == CollectionStatus::Failed {
                fresh.runtime.status = CollectionStatus::Idle;
            }
            self.store.save_runtime(collection, &fresh.runtime)?;
        }
        if !fresh.enabled {
            self.queue.retain(|(queued, _)| queued != collection);
            for waiter in self.waiters.remove(collection).unwrap_or_default() {
                let _ = waiter.send(Err(Error::InvalidInput(format!(
                    "Collection {} is disabled",
                    collection
                ))));
            }
        }
        debug!("Reloaded registration {}", collection);
        self.table.insert(collection.clone(), fresh);
        Ok(())
    }

    fn is_queued(&self, collection: &CollectionId) -> bool {
        self.queue.iter().any(|(queued, _)| queued == collection)
    }

    fn is_suspended(&self, registration: &CollectionRegistration) -> bool {
        registration.runtime.consecutive_failures >= self.config.max_consecutive_failures
    }

    /// Queue every eligible collection that is due, most overdue first.
    fn enqueue_due(&mut self, trigger: SyncTrigger) -> Vec<CollectionId> {
        if !self.accepting {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut due: Vec<&CollectionRegistration> = self
            .table
            .values()
            .filter(|r| r.enabled)
            .filter(|r| !self.is_suspended(r))
            .filter(|r| !self.running.contains(&r.id) && !self.is_queued(&r.id))
            .filter(|r| r.is_due(now))
            .collect();
        due.sort_by_key(|r| {
            r.runtime
                .last_attempted
                .map(|at| at + chrono::Duration::seconds(r.sync_interval.as_secs() as i64))
        });

        let due: Vec<CollectionId> = due.into_iter().map(|r| r.id.clone()).collect();
        for collection in &due {
            self.queue.push_back((collection.clone(), trigger));
        }
        due
    }

    /// Start queued runs while worker slots are free.
    fn dispatch(&mut self) {
        // Queued collections are never running: force and enqueue_due skip those.
        while !self.queue.is_empty() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let Some((collection, trigger)) = self.queue.pop_front() else {
                break;
            };
            let Some(registration) = self.table.get_mut(&collection) else {
                continue;
            };

            registration.runtime.status = CollectionStatus::Running;
            registration.runtime.last_attempted = Some(self.clock.now());
            if let Err(e) = self.store.save_runtime(&collection, &registration.runtime) {
                warn!("Failed to persist running state of {}: {}", collection, e);
            }
            // The reconciler caches schemas straight into the store.
            match self.store.get_registration(&collection) {
                Ok(Some(stored)) => registration.schema = stored.schema,
                Ok(None) => {}
                Err(e) => debug!("Using table schema of {}: {}", collection, e),
            }
            let registration = registration.clone();
            self.running.insert(collection.clone());
            debug!("Dispatching {} ({})", collection, trigger.as_str());

            let reconciler = self.reconciler.clone();
            self.runs.spawn(async move {
                let _permit = permit;
                let result = AssertUnwindSafe(reconciler.reconcile(&registration, trigger))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(Error::Scheduler(format!(
                            "sync run panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                (registration.id, result)
            });
        }
    }

    /// Fold the result of a run into the runtime table.
    fn apply_outcome(&mut self, collection: &CollectionId, result: Result<SyncAttemptRecord>) {
        self.running.remove(collection);
        let waiters = self.waiters.remove(collection).unwrap_or_default();

        if let Some(registration) = self.table.get_mut(collection) {
            let runtime = &mut registration.runtime;
            let previous_failures = runtime.consecutive_failures;
            let failure = match &result {
                Ok(record) if record.status != AttemptStatus::Failed => None,
                Ok(record) => Some(
                    record
                        .error_summary
                        .clone()
                        .unwrap_or_else(|| "sync failed".to_string()),
                ),
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    runtime.status = CollectionStatus::Idle;
                    runtime.consecutive_failures = 0;
                    runtime.last_successful =
                        result.as_ref().ok().map(|record| record.finished_at);
                    runtime.last_error = result
                        .as_ref()
                        .ok()
                        .and_then(|record| record.error_summary.clone());
                    if previous_failures > 0 {
                        info!(
                            "{} recovered after {} failed runs",
                            collection, previous_failures
                        );
                        self.events.emit(SyncEvent::Recovered {
                            collection: collection.clone(),
                            previous_failures,
                        });
                    }
                }
                Some(error) => {
                    runtime.status = CollectionStatus::Failed;
                    runtime.consecutive_failures += 1;
                    runtime.last_error = Some(error.clone());
                    warn!(
                        "Sync of {} failed ({} in a row): {}",
                        collection, runtime.consecutive_failures, error
                    );
                    if runtime.consecutive_failures >= self.config.max_consecutive_failures {
                        warn!("{} suspended from automatic scheduling", collection);
                    }
                    if previous_failures == 0 {
                        self.events.emit(SyncEvent::Failed {
                            collection: collection.clone(),
                            error,
                            consecutive_failures: runtime.consecutive_failures,
                        });
                    }
                }
            }

            if let Err(e) = self.store.save_runtime(collection, runtime) {
                error!("Failed to persist runtime of {}: {}", collection, e);
            }
        }

        if let Ok(record) = &result {
            self.events.emit(SyncEvent::Completed(record.clone()));
        }

        for waiter in waiters {
            let reply = match &result {
                Ok(record) => Ok(record.clone()),
                Err(e) => Err(Error::Scheduler(e.to_string())),
            };
            let _ = waiter.send(reply);
        }
    }

    /// Refuse queued work and let in-flight runs finish.
    async fn drain(&mut self) {
        self.accepting = false;
        for (collection, _) in self.queue.drain(..) {
            for waiter in self.waiters.remove(&collection).unwrap_or_default() {
                let _ = waiter.send(Err(Error::Scheduler("Scheduler shutting down".to_string())));
            }
        }

        while let Some(joined) = self.runs.join_next().await {
            match joined {
                Ok((collection, result)) => self.apply_outcome(&collection, result),
                Err(e) => error!("Sync task ended abnormally: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakers, CircuitConfig};
    use crate::reconcile::ReconcileSettings;
    use crate::retry::{RetryConfig, RetryExecutor};
    use docmirror_common::SystemClock;
    use docmirror_remote::{CollectionSchema, MemoryRemote};
    use docmirror_store::{CollectionKind, NewRegistration};

    fn scheduler(
        remote: Arc<MemoryRemote>,
        store: Arc<MirrorStore>,
        config: SchedulerConfig,
    ) -> (SyncScheduler, SyncSchedulerHandle) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let breakers = Arc::new(CircuitBreakers::new(CircuitConfig::default(), clock.clone()));
        let retry = Arc::new(RetryExecutor::new(
            RetryConfig::new(1).with_initial_delay(Duration::from_millis(1)),
            breakers,
        ));
        let reconciler = Arc::new(Reconciler::new(
            remote,
            store.clone(),
            retry,
            clock.clone(),
            ReconcileSettings::default(),
        ));
        SyncScheduler::new(config, store, reconciler, EventBus::default(), clock)
    }

    fn register(store: &MirrorStore, remote: &MemoryRemote, id: &str) -> CollectionId {
        let collection = CollectionId::new(id).unwrap();
        remote.create_collection(&collection, CollectionSchema::default());
        store
            .upsert_registration(
                &NewRegistration {
                    id: collection.clone(),
                    label: id.to_string(),
                    kind: CollectionKind::Generic,
                    sync_interval: Duration::from_secs(60),
                },
                chrono::Utc::now(),
            )
            .unwrap();
        collection
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_syncs, 3);
        assert_eq!(config.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.min_sync_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_force_sync_round_trip() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MirrorStore::in_memory().unwrap());
        let collection = register(&store, &remote, "tasks");

        let (scheduler, handle) = scheduler(remote, store.clone(), SchedulerConfig::default());
        let task = tokio::spawn(handle.run());

        let record = scheduler.force_sync(&collection).await.unwrap();
        assert_eq!(record.trigger, SyncTrigger::Forced);
        assert_eq!(record.status, AttemptStatus::Success);

        let registration = store.get_registration(&collection).unwrap().unwrap();
        assert_eq!(registration.runtime.status, CollectionStatus::Idle);
        assert!(registration.runtime.last_successful.is_some());

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_force_unknown_collection_is_not_found() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MirrorStore::in_memory().unwrap());
        let (scheduler, handle) = scheduler(remote, store, SchedulerConfig::default());
        let task = tokio::spawn(handle.run());

        let err = scheduler
            .force_sync(&CollectionId::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ticks_dispatch_due_collections() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MirrorStore::in_memory().unwrap());
        let collection = register(&store, &remote, "tasks");

        let config = SchedulerConfig {
            tick_interval_ms: 20,
            ..Default::default()
        };
        let (scheduler, handle) = scheduler(remote.clone(), store.clone(), config);
        let task = tokio::spawn(handle.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        // Interval is 60s, so exactly one scheduled run happened.
        assert_eq!(remote.listing_calls(&collection), 1);
        let history = store
            .list_attempts(&docmirror_store::HistoryQuery::default())
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trigger, SyncTrigger::Scheduled);
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MirrorStore::in_memory().unwrap());
        let collection = register(&store, &remote, "tasks");
        let (scheduler, handle) = scheduler(remote, store, SchedulerConfig::default());
        let task = tokio::spawn(handle.run());

        scheduler.shutdown().await;
        task.await.unwrap();

        let err = scheduler.force_sync(&collection).await.unwrap_err();
        assert!(matches!(err, Error::Scheduler(_)));
    }
}
