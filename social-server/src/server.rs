//! Server state and HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::db::{Db, SharedDb};
use crate::presence::PresenceNotifier;
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::tasks::TaskQueue;

/// Shared state accessible by all connection handlers and HTTP routes.
pub struct SharedState {
    pub config: ServerConfig,
    pub db: SharedDb,
    pub sessions: SessionStore,
    pub registry: Arc<Registry>,
    pub broadcaster: Arc<Broadcaster>,
    pub presence: PresenceNotifier,
    pub tasks: TaskQueue,
    pub started_at: Instant,
}

impl SharedState {
    /// Wire up fresh, isolated components around `db`.
    pub fn new(config: ServerConfig, db: Db) -> Arc<Self> {
        let db = db.shared();
        let registry = Arc::new(Registry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), db.clone()));
        let presence = PresenceNotifier::new(broadcaster.clone(), db.clone());
        Arc::new(Self {
            sessions: SessionStore::new(Duration::from_secs(config.session_ttl_secs)),
            config,
            db,
            registry,
            broadcaster,
            presence,
            tasks: TaskQueue::new(),
            started_at: Instant::now(),
        })
    }

    /// Run a closure with the database.
    /// Logs errors but does not propagate them; callers decide what a
    /// missing result means.
    pub fn with_db<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Db) -> rusqlite::Result<R>,
    {
        let mut db = self.db.lock();
        match f(&mut *db) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!("Database error: {e}");
                None
            }
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Build SharedState, opening the database.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let db = match &self.config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                Db::open(path).with_context(|| format!("Failed to open database {path}"))?
            }
            None => {
                tracing::info!("No database path given, using in-memory storage");
                Db::open_memory().context("Failed to open in-memory database")?
            }
        };
        Ok(SharedState::new(self.config.clone(), db))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("HTTP/WebSocket listener on {}", self.config.listen_addr);
        let state = self.build_state()?;
        serve(listener, state).await
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        let state = self.build_state()?;
        let handle = tokio::spawn(serve(listener, Arc::clone(&state)));
        Ok((addr, state, handle))
    }
}

async fn serve(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    spawn_session_sweeper(Arc::clone(&state));
    let router = crate::web::router(state);
    axum::serve(listener, router).await.context("HTTP server error")
}

/// Periodically purge expired sessions.
fn spawn_session_sweeper(state: Arc<SharedState>) {
    let period = Duration::from_secs(state.config.session_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // skip first tick
        loop {
            interval.tick().await;
            let removed = state.sessions.sweep();
            if removed > 0 {
                tracing::info!(removed, remaining = state.sessions.len(), "Expired sessions swept");
            }
        }
    });
}
