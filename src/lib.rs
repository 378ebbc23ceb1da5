//! POS offline-first sync.
//!
//! The client half keeps a durable queue of mutations made while the
//! terminal is offline and replays them against the backend when
//! connectivity returns. The `server` module is the checkout backend those
//! actions replay into: serial allocation, stock recompute and the
//! customer ledger, all inside one transaction per request.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod models;
pub mod queue;
pub mod server;
pub mod storage;
pub mod sync;

use api::{ApiClient, HttpExecutor};
use config::{ClientConfig, ServerConfig, CONNECTIVITY_POLL_INTERVAL};
use connectivity::{ConnectivityMonitor, NetworkStatus};
use db::DbState;
use queue::{ActionQueue, KvActionRepository};
use storage::{KeyValueStore, KeyringStore, SqliteKvStore};
use sync::{SyncEngine, SyncLoopHandle};

// ---------------------------------------------------------------------------
// Client wiring
// ---------------------------------------------------------------------------

/// A running client: the sync engine plus the background tasks feeding it.
pub struct ClientRuntime {
    pub db: Arc<DbState>,
    pub engine: Arc<SyncEngine>,
    probe_cancel: CancellationToken,
    probe: JoinHandle<()>,
    sync_loop: SyncLoopHandle,
}

impl ClientRuntime {
    /// Open `{data_dir}/pos-client.db` and start syncing. Must be called
    /// from inside a tokio runtime.
    pub fn start(config: &ClientConfig, data_dir: &Path) -> Result<Self, String> {
        let db = Arc::new(db::init(data_dir)?);
        let client = ApiClient::new(config).map_err(|e| e.to_string())?;
        Self::start_with(db, Arc::new(client), config)
    }

    /// Start with the backend credentials saved in the OS keyring.
    pub fn start_configured(data_dir: &Path) -> Result<Self, String> {
        Self::start_from_store(&KeyringStore::new(), data_dir)
    }

    /// Start with credentials read from `store`. Fails with a "not
    /// configured" error until onboarding has saved a URL and API key.
    pub fn start_from_store(store: &dyn KeyValueStore, data_dir: &Path) -> Result<Self, String> {
        let config = ClientConfig::from_credentials(store)?;
        Self::start(&config, data_dir)
    }

    /// Start against an already opened database and any executor.
    pub fn start_with(
        db: Arc<DbState>,
        executor: Arc<dyn HttpExecutor>,
        config: &ClientConfig,
    ) -> Result<Self, String> {
        let repo = Arc::new(KvActionRepository::new(SqliteKvStore::new(db.clone())));
        let queue = ActionQueue::load(repo)?;

        // Offline until the first probe says otherwise.
        let connectivity = ConnectivityMonitor::new(NetworkStatus::offline());
        let probe_cancel = CancellationToken::new();
        let probe = connectivity.spawn_probe(
            executor.clone(),
            CONNECTIVITY_POLL_INTERVAL,
            probe_cancel.clone(),
        );

        let engine = Arc::new(
            SyncEngine::new(queue, executor, connectivity, db.clone())
                .with_max_retries(config.max_retries),
        );
        let sync_loop = engine.start(config.sync_interval);

        info!(
            pending = engine.pending_actions().len(),
            failed = engine.failed_actions().len(),
            "POS sync client started"
        );
        Ok(Self {
            db,
            engine,
            probe_cancel,
            probe,
            sync_loop,
        })
    }

    /// Stop the probe and the sync loop, waiting for an in-flight drain.
    pub async fn shutdown(self) {
        self.probe_cancel.cancel();
        if let Err(e) = self.probe.await {
            warn!(error = %e, "Connectivity probe ended abnormally");
        }
        self.sync_loop.stop().await;
        info!("POS sync client stopped");
    }
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

/// Run the checkout backend until Ctrl-C.
pub async fn run_server() -> anyhow::Result<()> {
    let _log_guard = diagnostics::init_logging("pos-server").map_err(anyhow::Error::msg)?;
    info!("Starting POS checkout server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env()?;
    let db = server::db::ServerDb::open(&config.database_path).map_err(anyhow::Error::msg)?;
    let db = Arc::new(db);
    let state = server::routes::AppState::new(db, config.tax_rate);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        database = %config.database_path.display(),
        tax_rate = config.tax_rate,
        "Checkout server listening"
    );

    axum::serve(listener, server::routes::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Checkout server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
