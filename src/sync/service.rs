use crate::error::{OfflineError, Result};
use crate::storage::{LocalStore, MutationQueueItem};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::api::RemoteApi;
use super::auth::SessionManager;
use super::backoff::RetryPolicy;
use super::conflict_resolution::ConflictStore;
use super::connectivity::ConnectivityMonitor;
use super::event_handler::{EventHub, OfflineEvent};
use super::queue::MutationQueue;

/// Checksum of the record state the client last saw, for server-side
/// conflict detection
pub const EXPECTED_CHECKSUM_HEADER: &str = "x-expected-checksum";

#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectivityChanged(bool),
    SyncRequested,
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Only items whose retry time has come
    Scheduled,
    /// Every pending item regardless of its retry time
    Forced,
    /// Like `Scheduled`, but the first due item is sent even while offline
    /// to find out whether the link is back
    LinkCheck,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub paused: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending: usize,
    pub total_synced: usize,
    pub total_conflicts: usize,
    pub total_dropped: usize,
}

/// What happened to one queue item during a drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Acknowledged { id: i64 },
    RetryScheduled { id: i64, retry_count: u32, delay: Duration },
    Conflict { id: i64, conflict_id: i64 },
    Dropped { id: i64, dead_letter_id: i64 },
    /// Not yet due
    Deferred { id: i64 },
    /// Left untouched because the drain stopped early
    Skipped { id: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub outcomes: Vec<ItemOutcome>,
    /// Another drain was already running; nothing was attempted
    pub busy: bool,
}

impl DrainReport {
    fn busy() -> Self {
        Self {
            outcomes: Vec::new(),
            busy: true,
        }
    }

    /// Acknowledged item ids in the order they were accepted
    pub fn acknowledged(&self) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ItemOutcome::Acknowledged { id } => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn retried(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::RetryScheduled { .. }))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Conflict { .. }))
    }

    pub fn dropped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Dropped { .. }))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Deferred { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped { .. }))
    }

    fn count(&self, predicate: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(o)).count()
    }
}

/// Replays the mutation queue against the remote authority
pub struct SyncManager {
    api: Arc<RemoteApi>,
    queue: Arc<MutationQueue>,
    conflicts: Arc<ConflictStore>,
    store: Arc<LocalStore>,
    connectivity: Arc<ConnectivityMonitor>,
    session: Arc<SessionManager>,
    events: EventHub,
    policy: RetryPolicy,
    settle_delay: Duration,
    retry_tick: Duration,
    status: Arc<RwLock<SyncStatus>>,
    /// Drains and settle timers spawned by the background loop
    tasks: Mutex<JoinSet<()>>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<RemoteApi>,
        queue: Arc<MutationQueue>,
        conflicts: Arc<ConflictStore>,
        store: Arc<LocalStore>,
        connectivity: Arc<ConnectivityMonitor>,
        session: Arc<SessionManager>,
        events: EventHub,
        policy: RetryPolicy,
        settle_delay: Duration,
        retry_tick: Duration,
    ) -> Self {
        Self {
            api,
            queue,
            conflicts,
            store,
            connectivity,
            session,
            events,
            policy,
            settle_delay,
            retry_tick,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Run the background loop until `shutdown` flips to true
    pub async fn start(
        self: Arc<Self>,
        mut event_rx: mpsc::UnboundedReceiver<SyncEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Starting sync manager");

        if self.connectivity.is_online() && !self.queue.is_empty().await? {
            info!("Found queued mutations at startup");
            self.clone().spawn_drain(DrainMode::Scheduled, "startup");
        }

        let mut online_rx = self.connectivity.subscribe();
        let mut retry_interval = interval(self.retry_tick);
        retry_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry_interval.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    self.events.publish(OfflineEvent::ConnectivityChanged(online));
                    if online {
                        let manager = self.clone();
                        self.track(async move {
                            // Let the link settle before replaying
                            sleep(manager.settle_delay).await;
                            if manager.connectivity.is_online() && !manager.is_paused().await {
                                manager.run_drain(DrainMode::Scheduled, "connectivity restored").await;
                            }
                        });
                    }
                }

                Some(event) = event_rx.recv() => match event {
                    SyncEvent::ConnectivityChanged(online) => {
                        self.connectivity.set_online(online);
                    }
                    SyncEvent::SyncRequested => {
                        info!("Manual sync requested");
                        self.clone().spawn_drain(DrainMode::Forced, "manual");
                    }
                    SyncEvent::Pause => self.pause().await,
                    SyncEvent::Resume => {
                        self.resume().await;
                        self.clone().spawn_drain(DrainMode::Scheduled, "resume");
                    }
                },

                _ = retry_interval.tick() => {
                    if !self.is_paused().await {
                        match self.queue.is_empty().await {
                            Ok(false) if self.connectivity.is_online() => {
                                self.clone().spawn_drain(DrainMode::Scheduled, "retry tick");
                            }
                            Ok(false) => self.clone().spawn_drain(DrainMode::LinkCheck, "offline retry tick"),
                            Ok(true) => {}
                            Err(e) => error!("Failed to inspect queue: {}", e),
                        }
                    }
                }
            }
        }

        info!("Sync manager stopped");
        Ok(())
    }

    fn spawn_drain(self: Arc<Self>, mode: DrainMode, reason: &'static str) {
        let manager = self.clone();
        self.track(async move {
            manager.run_drain(mode, reason).await;
        });
    }

    fn track<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Pause and wait for every drain the background loop started. Stop the
    /// loop first so nothing new gets spawned.
    pub async fn shutdown(&self) {
        self.pause().await;

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if !tasks.is_empty() {
            debug!("Waiting for {} sync tasks", tasks.len());
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Sync task failed: {}", e);
            }
        }

        // Drains called directly by the host are not tracked
        while self.status.read().await.is_syncing {
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn run_drain(&self, mode: DrainMode, reason: &str) {
        debug!("Drain triggered by {}", reason);
        if let Err(e) = self.drain(mode).await {
            error!("Sync failed ({}): {}", reason, e);
        }
    }

    /// Attempt every pending item regardless of backoff
    pub async fn force_sync(&self) -> Result<DrainReport> {
        self.drain(DrainMode::Forced).await
    }

    /// Replay the queue in FIFO order. At most one drain runs at a time; a
    /// concurrent call returns a report marked `busy`.
    pub async fn drain(&self, mode: DrainMode) -> Result<DrainReport> {
        {
            let mut status = self.status.write().await;
            if status.is_syncing {
                debug!("Sync already in progress");
                return Ok(DrainReport::busy());
            }
            status.is_syncing = true;
        }

        let result = self.drain_items(mode).await;
        let pending = self.queue.len().await;

        {
            let mut status = self.status.write().await;
            status.is_syncing = false;
            status.last_sync = Some(Utc::now());
            if let Ok(pending) = pending {
                status.pending = pending;
            }
            if let Ok(report) = &result {
                status.total_synced += report.acknowledged().len();
                status.total_conflicts += report.conflicts();
                status.total_dropped += report.dropped();
            }
        }

        let report = result?;
        if !report.outcomes.is_empty() {
            info!(
                "Sync finished: {} acknowledged, {} retrying, {} conflicts, {} dropped, {} deferred, {} skipped",
                report.acknowledged().len(),
                report.retried(),
                report.conflicts(),
                report.dropped(),
                report.deferred(),
                report.skipped()
            );
        }

        if !report.acknowledged().is_empty() {
            if let Err(e) = self.store.clean_expired_data().await {
                warn!("Expired cache cleanup failed: {}", e);
            }
        }

        Ok(report)
    }

    async fn drain_items(&self, mode: DrainMode) -> Result<DrainReport> {
        let items = self.queue.pending().await?;
        let user_id = self.session.user_id().await;
        let mut report = DrainReport::default();

        // Forced and link-check drains send their first attempt even while offline
        let mut probing = mode != DrainMode::Scheduled;

        for (index, item) in items.iter().enumerate() {
            if self.is_paused().await || (!probing && !self.connectivity.is_online()) {
                info!("Sync interrupted with {} items remaining", items.len() - index);
                report
                    .outcomes
                    .extend(items[index..].iter().map(|i| ItemOutcome::Skipped { id: i.id }));
                break;
            }

            if mode != DrainMode::Forced && item.next_retry_at > Utc::now().timestamp_millis() {
                report.outcomes.push(ItemOutcome::Deferred { id: item.id });
                continue;
            }

            probing = false;

            let outcome = self.replay(item, user_id).await?;
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    async fn replay(&self, item: &MutationQueueItem, user_id: Option<i64>) -> Result<ItemOutcome> {
        debug!(
            "Replaying #{} {} {} (attempt {})",
            item.id,
            item.method,
            item.endpoint,
            item.retry_count + 1
        );

        let method = match Method::from_bytes(item.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return self
                    .drop_item(item, item.retry_count, format!("invalid method {}", item.method))
                    .await
            }
        };
        let url = match self.api.resolve(&item.endpoint) {
            Ok(url) => url,
            Err(e) => return self.drop_item(item, item.retry_count, e.to_string()).await,
        };

        let mut headers = HeaderMap::new();
        if let Some(checksum) = &item.original_checksum {
            if let Ok(value) = HeaderValue::from_str(checksum) {
                headers.insert(EXPECTED_CHECKSUM_HEADER, value);
            }
        }

        let response = self
            .api
            .send(method, &url, item.data.as_deref(), headers, user_id, None)
            .await;

        match response {
            Ok(response) => {
                self.connectivity.set_online(true);

                if response.status.is_success() {
                    self.queue.acknowledge(item.id).await?;
                    self.events
                        .publish(OfflineEvent::MutationAcknowledged { id: item.id });
                    Ok(ItemOutcome::Acknowledged { id: item.id })
                } else if response.status == StatusCode::CONFLICT {
                    let conflict_id = self.conflicts.record(item, &response.json_or_text()).await?;
                    self.queue.acknowledge(item.id).await?;
                    self.events.publish(OfflineEvent::ConflictDetected {
                        conflict_id,
                        entity: item.entity.clone(),
                        entity_id: item.entity_id.clone(),
                    });
                    Ok(ItemOutcome::Conflict {
                        id: item.id,
                        conflict_id,
                    })
                } else {
                    match OfflineError::from_status(response.status, &item.endpoint, &response.body) {
                        // Client errors are final
                        error @ OfflineError::Validation { .. } => {
                            self.drop_item(item, item.retry_count + 1, error.to_string()).await
                        }
                        error => self.fail(item, error.to_string()).await,
                    }
                }
            }
            Err(e) => {
                if e.is_connectivity() {
                    self.connectivity.set_online(false);
                }
                self.fail(item, e.to_string()).await
            }
        }
    }

    async fn fail(&self, item: &MutationQueueItem, error: String) -> Result<ItemOutcome> {
        let failures = item.retry_count + 1;

        if self.policy.is_exhausted(failures) {
            return self.drop_item(item, failures, error).await;
        }

        let delay = self.policy.delay_for(failures);
        let next_retry_at = Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        self.queue
            .schedule_retry(item.id, failures, next_retry_at, &error)
            .await?;

        debug!("#{} failed ({}), retrying in {:?}", item.id, error, delay);
        Ok(ItemOutcome::RetryScheduled {
            id: item.id,
            retry_count: failures,
            delay,
        })
    }

    async fn drop_item(
        &self,
        item: &MutationQueueItem,
        failures: u32,
        error: String,
    ) -> Result<ItemOutcome> {
        let mut archived = item.clone();
        archived.retry_count = failures;
        archived.last_error = Some(error);

        let dead_letter_id = self.queue.drop_item(&archived).await?;
        warn!(
            "Dropped #{} {} {} after {} attempts: {}",
            item.id,
            item.method,
            item.endpoint,
            failures,
            archived.last_error.as_deref().unwrap_or_default()
        );
        self.events.publish(OfflineEvent::MutationDropped {
            id: item.id,
            dead_letter_id,
        });

        Ok(ItemOutcome::Dropped {
            id: item.id,
            dead_letter_id,
        })
    }

    pub async fn pause(&self) {
        info!("Sync paused");
        self.status.write().await.paused = true;
    }

    pub async fn resume(&self) {
        info!("Sync resumed");
        self.status.write().await.paused = false;
    }

    pub async fn is_paused(&self) -> bool {
        self.status.read().await.paused
    }

    pub async fn get_status(&self) -> SyncStatus {
        let mut status = self.status.read().await.clone();
        if let Ok(pending) = self.queue.len().await {
            status.pending = pending;
        }
        status
    }
}
