//! Session Manager: the primary session plus one media session per endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;

use crate::dispatch::UpdateEvent;
use crate::endpoint::{DcTable, Endpoint};
use crate::errors::{InvocationError, MigrateKind};
use crate::session::{Session, SessionContext};

type MediaCell = Arc<OnceCell<Arc<Session>>>;

/// Owns every session of a client and follows migration errors.
pub struct SessionManager {
    ctx:     Arc<SessionContext>,
    table:   DcTable,
    updates: mpsc::UnboundedSender<UpdateEvent>,
    primary: RwLock<Option<Arc<Session>>>,
    // serializes primary swaps
    switch:  tokio::sync::Mutex<()>,
    media:   Mutex<HashMap<Endpoint, MediaCell>>,
    closed:  CancellationToken,
}

impl SessionManager {
    /// `updates` receives what the primary session pushes.
    pub fn new(ctx: Arc<SessionContext>, table: DcTable, updates: mpsc::UnboundedSender<UpdateEvent>) -> Self {
        Self {
            ctx,
            table,
            updates,
            primary: RwLock::new(None),
            switch:  tokio::sync::Mutex::new(()),
            media:   Mutex::new(HashMap::new()),
            closed:  CancellationToken::new(),
        }
    }

    fn resolve(&self, dc_id: i32, media: bool) -> Result<Endpoint, InvocationError> {
        self.table.resolve(dc_id, media).ok_or(InvocationError::UnknownDatacenter { dc_id })
    }

    fn check_open(&self) -> Result<(), InvocationError> {
        if self.closed.is_cancelled() { Err(InvocationError::SessionClosed) } else { Ok(()) }
    }

    async fn spawn_started(&self, endpoint: Endpoint, primary: bool) -> Result<Arc<Session>, InvocationError> {
        let updates = primary.then(|| self.updates.clone());
        let session = Session::spawn(endpoint, Arc::clone(&self.ctx), updates);
        if let Err(e) = session.start().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    fn swap_primary(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.primary.write().unwrap_or_else(|e| e.into_inner()).replace(session)
    }

    /// Connect the primary session to `dc_id`.
    pub async fn start(&self, dc_id: i32) -> Result<Arc<Session>, InvocationError> {
        self.check_open()?;
        let endpoint = self.resolve(dc_id, false)?;
        let _guard = self.switch.lock().await;
        let session = self.spawn_started(endpoint, true).await?;
        if let Some(old) = self.swap_primary(Arc::clone(&session)) {
            old.close().await;
        }
        Ok(session)
    }

    /// The current primary session.
    pub fn primary(&self) -> Result<Arc<Session>, InvocationError> {
        self.check_open()?;
        self.primary.read().unwrap_or_else(|e| e.into_inner()).clone().ok_or(InvocationError::NotStarted)
    }

    /// Invoke on the primary session, following one `*_MIGRATE_X`.
    pub async fn invoke(&self, body: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let session = self.primary()?;
        match session.invoke(body).await {
            Err(InvocationError::Migrate { dc_id, kind, .. }) if kind != MigrateKind::File => {
                let target = self.migrate(&session, dc_id).await?;
                target.invoke(body).await
            }
            // another caller swapped the primary under us
            Err(InvocationError::SessionClosed) if !self.closed.is_cancelled() => {
                let current = self.primary()?;
                if Arc::ptr_eq(&current, &session) {
                    return Err(InvocationError::SessionClosed);
                }
                current.invoke(body).await
            }
            other => other,
        }
    }

    async fn migrate(&self, stale: &Arc<Session>, dc_id: i32) -> Result<Arc<Session>, InvocationError> {
        let _guard = self.switch.lock().await;
        let current = self.primary()?;
        if !Arc::ptr_eq(&current, stale) {
            return Ok(current);
        }

        let endpoint = self.resolve(dc_id, false)?;
        tracing::info!("[courier] migrating primary session {} → {endpoint}", stale.endpoint());
        let fresh = self.spawn_started(endpoint, true).await?;
        self.swap_primary(Arc::clone(&fresh));
        if let Err(e) = self.ctx.storage.set_home_dc(&self.ctx.account, dc_id) {
            tracing::warn!("[courier] could not record home DC{dc_id}: {e}");
        }
        stale.close().await;
        Ok(fresh)
    }

    /// The media session for `endpoint`, created on first use.
    ///
    /// Concurrent first callers share one connection and one handshake. A
    /// failed creation leaves nothing behind; the next call tries again.
    pub async fn media_session(&self, endpoint: &Endpoint) -> Result<Arc<Session>, InvocationError> {
        self.check_open()?;
        let cell = {
            let mut map = self.media.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(endpoint.clone()).or_default())
        };
        let session = cell
            .get_or_try_init(|| async {
                tracing::debug!("[courier] opening media session for {endpoint}");
                self.spawn_started(endpoint.clone(), false).await
            })
            .await?;
        Ok(Arc::clone(session))
    }

    /// The media session for datacenter `dc_id`.
    pub async fn media_session_for_dc(&self, dc_id: i32) -> Result<Arc<Session>, InvocationError> {
        let endpoint = self.resolve(dc_id, true)?;
        self.media_session(&endpoint).await
    }

    /// Invoke on the media session for `endpoint`, following one `FILE_MIGRATE_X`.
    pub async fn invoke_media(&self, endpoint: &Endpoint, body: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let session = self.media_session(endpoint).await?;
        match session.invoke(body).await {
            Err(InvocationError::Migrate { dc_id, kind: MigrateKind::File, .. }) => {
                tracing::info!("[courier] file lives on DC{dc_id}, leaving {endpoint}");
                self.drop_media(endpoint, &session).await;
                let target = self.media_session_for_dc(dc_id).await?;
                target.invoke(body).await
            }
            other => other,
        }
    }

    async fn drop_media(&self, endpoint: &Endpoint, stale: &Arc<Session>) {
        {
            let mut map = self.media.lock().unwrap_or_else(|e| e.into_inner());
            let same = map.get(endpoint).and_then(|c| c.get()).is_some_and(|s| Arc::ptr_eq(s, stale));
            if same {
                map.remove(endpoint);
            }
        }
        stale.close().await;
    }

    /// Number of media sessions currently open.
    pub fn media_sessions(&self) -> usize {
        self.media.lock().unwrap_or_else(|e| e.into_inner()).values().filter(|c| c.initialized()).count()
    }

    /// Close the primary and every media session. Later calls fail with `SessionClosed`.
    pub async fn close_all(&self) {
        self.closed.cancel();
        let primary = self.primary.write().unwrap_or_else(|e| e.into_inner()).take();
        let media: Vec<MediaCell> = self.media.lock().unwrap_or_else(|e| e.into_inner()).drain().map(|(_, c)| c).collect();

        if let Some(p) = primary {
            p.close().await;
        }
        for cell in media {
            if let Some(s) = cell.get() {
                s.close().await;
            }
        }
    }
}
