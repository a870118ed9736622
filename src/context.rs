use crate::config::OfflineConfig;
use crate::error::Result;
use crate::storage::{Database, LocalStore};
use crate::sync::{
    ConflictStore, ConnectivityMonitor, EventHub, KeyManager, MutationQueue, RemoteApi,
    RequestInterceptor, RetryPolicy, Role, SessionManager, SyncEvent, SyncManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything the offline layer needs, wired together once per process
pub struct OfflineContext {
    pub config: OfflineConfig,
    pub db: Arc<Database>,
    pub keys: Arc<KeyManager>,
    pub store: Arc<LocalStore>,
    pub queue: Arc<MutationQueue>,
    pub conflicts: Arc<ConflictStore>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub session: Arc<SessionManager>,
    pub events: EventHub,
    pub api: Arc<RemoteApi>,
    pub sync: Arc<SyncManager>,
    pub interceptor: Arc<RequestInterceptor>,
    sync_tx: mpsc::UnboundedSender<SyncEvent>,
    sync_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineContext {
    /// Open the cache database at `db_path` (or the default data dir) and
    /// build the layer on top of it. Nothing runs in the background until
    /// `start` is called.
    pub async fn init(config: OfflineConfig, db_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::new(db_path).await?);
        let keys = Arc::new(KeyManager::new(db.clone(), config.environment));
        Self::with_parts(config, db, keys).await
    }

    /// Build on an existing database and key manager
    pub async fn with_parts(
        config: OfflineConfig,
        db: Arc<Database>,
        keys: Arc<KeyManager>,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::new(
            db.clone(),
            keys.clone(),
            config.offline_roles.clone(),
            config.retention(),
        ));
        let queue = Arc::new(MutationQueue::new(db.clone()));
        let conflicts = Arc::new(ConflictStore::new(db.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::default());
        let session = Arc::new(SessionManager::new());
        let events = EventHub::default();
        let api = Arc::new(RemoteApi::new(&config)?);

        let sync = Arc::new(SyncManager::new(
            api.clone(),
            queue.clone(),
            conflicts.clone(),
            store.clone(),
            connectivity.clone(),
            session.clone(),
            events.clone(),
            RetryPolicy::from_config(&config),
            config.reconnect_settle(),
            config.retry_tick(),
        ));

        let interceptor = Arc::new(RequestInterceptor::new(
            api.clone(),
            store.clone(),
            queue.clone(),
            connectivity.clone(),
            session.clone(),
            events.clone(),
        ));

        if let Err(e) = store.clean_expired_data().await {
            warn!("Expired cache cleanup failed: {}", e);
        }

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        info!("Offline layer initialized");

        Ok(Self {
            config,
            db,
            keys,
            store,
            queue,
            conflicts,
            connectivity,
            session,
            events,
            api,
            sync,
            interceptor,
            sync_tx,
            sync_rx: Mutex::new(Some(sync_rx)),
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the background sync loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let Some(event_rx) = self.sync_rx.lock().await.take() else {
            warn!("Sync loop already started");
            return;
        };

        let sync = self.sync.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            if let Err(e) = sync.start(event_rx, shutdown).await {
                error!("Sync loop failed: {}", e);
            }
        });
        *self.worker.lock().await = Some(handle);
    }

    pub fn send(&self, event: SyncEvent) {
        if self.sync_tx.send(event).is_err() {
            warn!("Sync loop is not running");
        }
    }

    pub async fn login(&self, user_id: i64, role: Role) {
        self.session.login(user_id, role).await;
    }

    /// End the session and forget the in-memory key
    pub async fn logout(&self) {
        self.session.logout().await;
        self.keys.clear_key().await;
    }

    /// Stop background work and release the database
    pub async fn teardown(&self) {
        info!("Tearing down offline layer");
        self.interceptor.disable();
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Sync loop panicked: {}", e);
            }
        }
        self.sync.shutdown().await;

        self.keys.clear_key().await;
        self.db.close().await;
    }
}
