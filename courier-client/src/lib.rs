//! # courier-client
//!
//! Async MTProto client runtime: the session and connection layer under a
//! typed API.
//!
//! ## Features
//! - One primary session plus lazily created per-datacenter media sessions
//! - Automatic `*_MIGRATE_X` handling for the primary and `FILE_MIGRATE_X` for media
//! - Reconnect and re-handshake on dropped links or rejected auth keys
//! - Abridged, Intermediate, Padded Intermediate, Full and Obfuscated2 transports,
//!   direct or through a SOCKS5 proxy
//! - Upload and download permits bounding concurrent transfers
//! - Update handlers on a bounded pool of worker threads
//! - Watchdog that probes a silent update stream
//! - Credentials in a file, in memory (session strings) or SQLite
//!
//! Request and response bodies are opaque serialized TL objects.
//!
//! ## Example
//! ```rust,no_run
//! use courier_client::{Client, Config};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Config::default().with_account("alice"))?;
//! client.start().await?;
//! client.add_handler(|ev: &courier_client::UpdateEvent| -> Result<(), courier_client::HandlerError> {
//!     println!("update from DC{}: {} bytes", ev.dc_id, ev.payload.len());
//!     Ok(())
//! });
//! # let request = Vec::new();
//! let _config = client.invoke(&request).await?;
//! client.close().await;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod errors;
pub mod governor;
pub mod handshake;
pub mod manager;
pub mod session;
pub mod socks5;
pub mod storage;
pub mod transport;
pub mod watchdog;

pub use cache::Cache;
pub use config::{Config, ConfigError};
pub use dispatch::{Handler, HandlerError, UpdateEvent};
pub use endpoint::{DcTable, Endpoint};
pub use errors::{CacheError, HandshakeError, InvocationError, MigrateKind, RpcError, TransportError};
pub use governor::{Governor, TransferPermit};
pub use handshake::{DhHandshake, Handshaker, Negotiated};
pub use manager::SessionManager;
pub use session::{Session, SessionState};
pub use socks5::{ProxyLogin, Socks5Config};
pub use storage::{Credentials, FileStorage, MemoryStorage, Storage, StorageConfig, StorageError};
#[cfg(feature = "sqlite-storage")]
pub use storage::SqliteStorage;
pub use transport::{Connector, ObfuscatedFraming, TcpConnector, TransportKind};

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use courier_mtproto::MessageSequencer;
use courier_tl::Serializable;
use courier_tl::mtproto::GetState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dispatch::Handlers;
use governor::WorkerPool;
use session::SessionContext;
use watchdog::{Probe, UpdateClock};

// ─── ClientInner ─────────────────────────────────────────────────────────────

struct ClientInner {
    config:         Config,
    storage:        Arc<dyn Storage>,
    manager:        Arc<SessionManager>,
    governor:       Governor,
    pool:           Arc<WorkerPool>,
    handlers:       Handlers,
    clock:          Arc<UpdateClock>,
    message_cache:  Mutex<Cache<(i64, i32), Vec<u8>>>,
    business_cache: Mutex<Cache<String, Vec<u8>>>,
    updates_rx:     Mutex<Option<mpsc::UnboundedReceiver<UpdateEvent>>>,
    tasks:          Mutex<Vec<JoinHandle<()>>>,
    cancel:         CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.governor.close();
    }
}

/// Probes a silent update stream with `updates.getState` on the primary session.
struct StateProbe(Arc<SessionManager>);

#[async_trait]
impl Probe for StateProbe {
    async fn probe(&self) -> Result<(), InvocationError> {
        self.0.invoke(&GetState {}.to_bytes()).await.map(drop)
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// The client. Cheap to clone; internally Arc-wrapped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client that connects over TCP (or the configured proxy) and
    /// negotiates keys with the real DH exchange.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let connector = Arc::new(TcpConnector::new(config.proxy.clone()));
        Self::with_transport(config, connector, Arc::new(DhHandshake))
    }

    /// Build a client with a custom stream source and key exchange.
    pub fn with_transport(
        config:     Config,
        connector:  Arc<dyn Connector>,
        handshaker: Arc<dyn Handshaker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let storage = config.storage.open(&config.account)?;

        let ctx = Arc::new(SessionContext {
            connector,
            handshaker,
            sequencer:       Arc::new(MessageSequencer::new()),
            storage:         Arc::clone(&storage),
            account:         config.account.clone(),
            transport:       config.transport.clone(),
            request_timeout: config.request_timeout,
            ping_interval:   config.ping_interval,
        });
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(ctx, config.dc_table(), updates_tx));

        let inner = ClientInner {
            storage,
            manager,
            governor:       Governor::new(config.max_concurrent_transmissions),
            pool:           Arc::new(WorkerPool::new(config.workers, config.workers * 4)?),
            handlers:       Arc::new(RwLock::new(Vec::new())),
            clock:          Arc::new(UpdateClock::new()),
            message_cache:  Mutex::new(Cache::new(config.message_cache_capacity)?),
            business_cache: Mutex::new(Cache::new(config.business_cache_capacity)?),
            updates_rx:     Mutex::new(Some(updates_rx)),
            tasks:          Mutex::new(Vec::new()),
            cancel:         CancellationToken::new(),
            config,
        };
        tracing::info!(
            "[courier] client for {:?} ready: {} workers, {} transfers, storage {}",
            inner.config.account,
            inner.config.workers,
            inner.config.max_concurrent_transmissions,
            inner.storage.name(),
        );
        Ok(Self { inner: Arc::new(inner) })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Connect the primary session to the stored home DC (or
    /// [`Config::home_dc`]) and start dispatching updates.
    pub async fn start(&self) -> Result<(), InvocationError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(InvocationError::SessionClosed);
        }

        let dc_id = match inner.storage.home_dc(&inner.config.account) {
            Ok(Some(dc)) => dc,
            Ok(None) => inner.config.home_dc,
            Err(e) => {
                tracing::warn!("[courier] could not read home DC ({}): {e}", inner.storage.name());
                inner.config.home_dc
            }
        };
        inner.manager.start(dc_id).await?;

        let rx = inner.updates_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rx) = rx {
            let dispatcher = dispatch::spawn_dispatcher(
                rx,
                Arc::clone(&inner.clock),
                Arc::clone(&inner.pool),
                Arc::clone(&inner.handlers),
                inner.cancel.child_token(),
            );
            let watchdog = watchdog::spawn_watchdog(
                Arc::clone(&inner.clock),
                inner.config.watchdog_interval,
                inner.cancel.child_token(),
                Arc::new(StateProbe(Arc::clone(&inner.manager))),
            );
            inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend([dispatcher, watchdog]);
        }
        tracing::info!("[courier] started on DC{dc_id}");
        Ok(())
    }

    /// Shut everything down: background tasks, transfer permits, sessions and
    /// handler threads. In-flight requests fail with `SessionClosed`.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.governor.close();

        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        inner.manager.close_all().await;
        inner.pool.shutdown().await;
        tracing::debug!("[courier] client closed");
    }

    // ── RPC ─────────────────────────────────────────────────────────────────

    /// Invoke a serialized request on the primary session.
    pub async fn invoke(&self, request: &[u8]) -> Result<Vec<u8>, InvocationError> {
        self.inner.manager.invoke(request).await
    }

    /// Invoke a serialized request on the media session for `endpoint`.
    pub async fn invoke_media(&self, endpoint: &Endpoint, request: &[u8]) -> Result<Vec<u8>, InvocationError> {
        self.inner.manager.invoke_media(endpoint, request).await
    }

    /// The media session for datacenter `dc_id`, opened on first use.
    pub async fn media_session(&self, dc_id: i32) -> Result<Arc<Session>, InvocationError> {
        self.inner.manager.media_session_for_dc(dc_id).await
    }

    /// The current primary session.
    pub fn primary_session(&self) -> Result<Arc<Session>, InvocationError> {
        self.inner.manager.primary()
    }

    pub fn session_manager(&self) -> &SessionManager { &self.inner.manager }

    // ── Transfers ───────────────────────────────────────────────────────────

    /// Wait for an upload slot; hold the permit for the whole transfer.
    pub async fn acquire_upload(&self) -> Result<TransferPermit, InvocationError> {
        self.inner.governor.acquire_upload().await
    }

    /// Wait for a download slot; hold the permit for the whole transfer.
    pub async fn acquire_download(&self) -> Result<TransferPermit, InvocationError> {
        self.inner.governor.acquire_download().await
    }

    // ── Updates ─────────────────────────────────────────────────────────────

    /// Register a handler. Handlers run on the worker threads, in
    /// registration order for each update.
    pub fn add_handler(&self, handler: impl Handler) {
        self.inner.handlers.write().unwrap_or_else(|e| e.into_inner()).push(Arc::new(handler));
    }

    /// When the last update was dispatched (construction time if none yet).
    pub fn last_update(&self) -> Instant {
        self.inner.clock.last_update()
    }

    // ── Caches ──────────────────────────────────────────────────────────────

    pub fn cache_message(&self, chat_id: i64, message_id: i32, message: Vec<u8>) {
        self.inner.message_cache.lock().unwrap_or_else(|e| e.into_inner()).put((chat_id, message_id), message);
    }

    pub fn cached_message(&self, chat_id: i64, message_id: i32) -> Option<Vec<u8>> {
        self.inner.message_cache.lock().unwrap_or_else(|e| e.into_inner()).get(&(chat_id, message_id)).cloned()
    }

    pub fn forget_message(&self, chat_id: i64, message_id: i32) -> Option<Vec<u8>> {
        self.inner.message_cache.lock().unwrap_or_else(|e| e.into_inner()).remove(&(chat_id, message_id))
    }

    pub fn cache_business_connection(&self, connection_id: impl Into<String>, connection: Vec<u8>) {
        self.inner
            .business_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(connection_id.into(), connection);
    }

    pub fn business_connection(&self, connection_id: &str) -> Option<Vec<u8>> {
        self.inner
            .business_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&connection_id.to_string())
            .cloned()
    }

    // ── Misc ────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &Config { &self.inner.config }

    pub fn storage(&self) -> &Arc<dyn Storage> { &self.inner.storage }
}
