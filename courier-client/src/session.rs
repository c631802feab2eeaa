//! Session: one auth key, one connection, many in-flight requests.
//!
//! Each session runs a single I/O task that owns the socket and the
//! encrypted state. Callers talk to it over an mpsc queue and get their
//! answers on oneshot channels, correlated by message id.
//!
//! ```text
//! Unauthenticated ─► Authenticating ─► Ready ◄─► Reauthenticating
//!        └──────────────┴────────────────┴──────────────┴──► Closed
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_mtproto::EncryptedSession;
use courier_mtproto::MessageSequencer;
use courier_mtproto::envelope::{self, Inbound, RpcOutcome};
use courier_tl::Serializable;
use courier_tl::mtproto::{MsgsAck, PingDelayDisconnect};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::UpdateEvent;
use crate::endpoint::Endpoint;
use crate::errors::{InvocationError, RpcError, TransportError};
use crate::handshake::{Handshaker, Negotiated, negotiate_bounded};
use crate::storage::{Credentials, Storage};
use crate::transport::{Connection, Connector, TransportKind};

const COMMAND_QUEUE: usize = 256;
const ACK_BATCH: usize = 8;
// the server drops the connection this long after the last ping
const PING_GRACE: Duration = Duration::from_secs(15);
// consecutive dead links tolerated before the session stops reconnecting on its own
const MAX_RECONNECTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(8);

// ─── Public types ─────────────────────────────────────────────────────────────

/// Lifecycle of a [`Session`], published on a watch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Spawned; nothing sent yet.
    Unauthenticated,
    /// Connecting and loading or negotiating the auth key.
    Authenticating,
    /// Connected with a usable key.
    Ready,
    /// The link failed or the key went stale; reconnecting.
    Reauthenticating,
    /// Closed for good.
    Closed,
}

/// What every session of a client shares.
pub struct SessionContext {
    pub connector:       Arc<dyn Connector>,
    pub handshaker:      Arc<dyn Handshaker>,
    pub sequencer:       Arc<MessageSequencer>,
    pub storage:         Arc<dyn Storage>,
    pub account:         String,
    pub transport:       TransportKind,
    pub request_timeout: Duration,
    pub ping_interval:   Duration,
}

type Reply = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

enum Command {
    Start(oneshot::Sender<Result<(), InvocationError>>),
    Invoke { body: Vec<u8>, reply: Reply },
}

/// Handle to a running session.
///
/// Dropping the last handle cancels the I/O task.
pub struct Session {
    endpoint:        Endpoint,
    tx:              mpsc::Sender<Command>,
    state:           watch::Receiver<SessionState>,
    cancel:          CancellationToken,
    task:            Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl Session {
    /// Spawn the I/O task. Nothing is sent until [`start`] or the first [`invoke`].
    ///
    /// `updates` receives every `Updates` object the server pushes.
    ///
    /// [`start`]: Session::start
    /// [`invoke`]: Session::invoke
    pub fn spawn(
        endpoint: Endpoint,
        ctx:      Arc<SessionContext>,
        updates:  Option<mpsc::UnboundedSender<UpdateEvent>>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(SessionState::Unauthenticated);
        let cancel = CancellationToken::new();
        let request_timeout = ctx.request_timeout;

        let actor = Actor {
            endpoint: endpoint.clone(),
            ctx,
            updates,
            state: state_tx,
            conn: None,
            enc: None,
            storage_checked: false,
            failures: 0,
            pending: HashMap::new(),
            acks: Vec::new(),
        };
        let task = tokio::spawn(actor.run(rx, cancel.clone()));
        tracing::debug!("[courier] session for {endpoint} spawned");

        Arc::new(Self { endpoint, tx, state: state_rx, cancel, task: Mutex::new(Some(task)), request_timeout })
    }

    /// Connect and authenticate now instead of on the first request.
    pub async fn start(&self) -> Result<(), InvocationError> {
        if self.is_closed() {
            return Err(InvocationError::SessionClosed);
        }
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Start(reply)).await.map_err(|_| InvocationError::SessionClosed)?;
        rx.await.map_err(|_| InvocationError::SessionClosed)?
    }

    /// Send one serialized request and wait for its answer.
    pub async fn invoke(&self, body: &[u8]) -> Result<Vec<u8>, InvocationError> {
        if self.is_closed() {
            return Err(InvocationError::SessionClosed);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Invoke { body: body.to_vec(), reply })
            .await
            .map_err(|_| InvocationError::SessionClosed)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InvocationError::SessionClosed),
            Err(_) => Err(InvocationError::Timeout(self.request_timeout)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn endpoint(&self) -> &Endpoint { &self.endpoint }

    pub fn is_closed(&self) -> bool { self.cancel.is_cancelled() }

    /// Stop the I/O task and fail everything in flight with `SessionClosed`.
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("[courier] session task for {} ended abnormally: {e}", self.endpoint);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── I/O task ─────────────────────────────────────────────────────────────────

struct Pending {
    body:         Vec<u8>,
    reply:        Reply,
    /// Already re-sent after a reconnect or re-handshake.
    resent:       bool,
    salt_retried: bool,
    time_retried: bool,
}

impl Pending {
    fn new(body: Vec<u8>, reply: Reply) -> Self {
        Self { body, reply, resent: false, salt_retried: false, time_retried: false }
    }

    fn fail(self, err: InvocationError) {
        let _ = self.reply.send(Err(err));
    }
}

enum Event {
    Command(Command),
    Frame(Result<Vec<u8>, TransportError>),
    Tick,
}

struct Actor {
    endpoint:        Endpoint,
    ctx:             Arc<SessionContext>,
    updates:         Option<mpsc::UnboundedSender<UpdateEvent>>,
    state:           watch::Sender<SessionState>,
    conn:            Option<Connection>,
    enc:             Option<EncryptedSession>,
    storage_checked: bool,
    /// Links lost since the last frame that decrypted.
    failures:        u32,
    pending:         HashMap<i64, Pending>,
    acks:            Vec<i64>,
}

/// Wait before the `failures`-th reconnect in a row: none for the first,
/// then doubling up to [`MAX_RECONNECT_DELAY`].
fn reconnect_delay(failures: u32) -> Duration {
    if failures <= 1 {
        return Duration::ZERO;
    }
    RECONNECT_DELAY.saturating_mul(1 << (failures - 2).min(5)).min(MAX_RECONNECT_DELAY)
}

async fn recv_from(conn: Option<&mut Connection>) -> Result<Vec<u8>, TransportError> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let period = self.ctx.ping_interval;
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => break,
                },
                frame = recv_from(self.conn.as_mut()) => Event::Frame(frame),
                _ = tick.tick() => Event::Tick,
            };

            // a slow connect or handshake must not delay close()
            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = self.handle(event) => true,
            };
            if !finished {
                break;
            }
        }

        self.shutdown(&mut rx).await;
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Command(Command::Start(reply)) => {
                let result = self.ensure_ready().await;
                let _ = reply.send(result);
            }
            Event::Command(Command::Invoke { body, reply }) => {
                let p = Pending::new(body, reply);
                if let Err(e) = self.ensure_ready().await {
                    p.fail(e);
                    return;
                }
                if let Err(e) = self.transmit(p).await {
                    self.recover(e).await;
                }
            }
            Event::Frame(Ok(frame)) => self.on_frame(frame).await,
            Event::Frame(Err(e)) => self.recover(e).await,
            Event::Tick => self.on_tick().await,
        }
    }

    // ── link management ──────────────────────────────────────────────────────

    fn set_state(&self, new: SessionState) {
        let old = self.state.send_replace(new);
        if old != new {
            tracing::debug!("[courier] {}: {old:?} → {new:?}", self.endpoint);
        }
    }

    fn transport_error(&self, source: TransportError) -> InvocationError {
        InvocationError::Transport { endpoint: self.endpoint.to_string(), source }
    }

    async fn open(&self) -> Result<Connection, InvocationError> {
        let connector = &*self.ctx.connector;
        match Connection::open(connector, &self.endpoint, &self.ctx.transport).await {
            Ok(conn) => Ok(conn),
            Err(first) => {
                tracing::warn!("[courier] connect to {} failed ({first}), retrying once", self.endpoint);
                Connection::open(connector, &self.endpoint, &self.ctx.transport)
                    .await
                    .map_err(|e| self.transport_error(e))
            }
        }
    }

    fn load_stored(&mut self) -> Result<Option<EncryptedSession>, InvocationError> {
        self.storage_checked = true;
        match self.ctx.storage.load(&self.ctx.account, &self.endpoint) {
            Ok(Some(c)) => {
                tracing::info!("[courier] resuming {} with stored key {:?}", self.endpoint, c.auth_key);
                self.ctx.sequencer.set_time_offset(c.time_offset);
                Ok(Some(EncryptedSession::new(c.auth_key, c.salt, Arc::clone(&self.ctx.sequencer))?))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!("[courier] could not read stored credentials ({}): {e}", self.ctx.storage.name());
                Ok(None)
            }
        }
    }

    fn persist(&self, n: &Negotiated) {
        let creds = Credentials {
            account:     self.ctx.account.clone(),
            endpoint:    self.endpoint.clone(),
            auth_key:    n.auth_key.clone(),
            salt:        n.first_salt,
            time_offset: n.time_offset,
        };
        if let Err(e) = self.ctx.storage.save(&creds) {
            tracing::warn!("[courier] could not save credentials for {} ({}): {e}", self.endpoint, self.ctx.storage.name());
        }
    }

    /// Make sure a connection with a usable key exists.
    async fn ensure_ready(&mut self) -> Result<(), InvocationError> {
        if self.conn.is_some() && self.enc.is_some() {
            return Ok(());
        }
        if *self.state.borrow() == SessionState::Unauthenticated {
            self.set_state(SessionState::Authenticating);
        }

        let mut conn = self.open().await?;
        if self.enc.is_none() && !self.storage_checked {
            self.enc = self.load_stored()?;
        }

        match self.enc.as_mut() {
            Some(enc) => enc.reset()?,
            None => {
                let n = negotiate_bounded(&*self.ctx.handshaker, &mut conn, &self.endpoint, &self.ctx.sequencer)
                    .await
                    .map_err(|source| InvocationError::Handshake { endpoint: self.endpoint.to_string(), source })?;
                self.ctx.sequencer.set_time_offset(n.time_offset);
                self.persist(&n);
                self.enc = Some(EncryptedSession::new(n.auth_key, n.first_salt, Arc::clone(&self.ctx.sequencer))?);
            }
        }

        self.conn = Some(conn);
        self.set_state(SessionState::Ready);
        Ok(())
    }

    async fn drop_link(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Reconnect after a transport failure and re-send what was in flight.
    ///
    /// After [`MAX_RECONNECTS`] dead links in a row the session stays down in
    /// `Reauthenticating`; the next request tries again.
    async fn recover(&mut self, err: TransportError) {
        self.failures += 1;
        tracing::warn!("[courier] link to {} failed ({} in a row): {err}", self.endpoint, self.failures);
        let stale = err.is_stale_key();
        if stale {
            tracing::warn!("[courier] {} no longer knows our auth key", self.endpoint);
        }
        let cause = self.transport_error(err);

        if self.failures > MAX_RECONNECTS {
            tracing::warn!("[courier] giving up on {} until the next request", self.endpoint);
            self.drop_link().await;
            if stale {
                self.enc = None;
            }
            self.set_state(SessionState::Reauthenticating);
            for (_, p) in self.pending.drain() {
                p.fail(cause.clone());
            }
            return;
        }
        let delay = reconnect_delay(self.failures);
        self.reconnect(stale, Vec::new(), cause, delay).await;
    }

    /// Drop the link (and the key if `drop_key`), wait `delay`, bring the
    /// link back, then send `retry` plus every in-flight request that has
    /// not been re-sent yet. Requests already re-sent once fail with `cause`.
    async fn reconnect(&mut self, drop_key: bool, retry: Vec<Pending>, cause: InvocationError, delay: Duration) {
        self.drop_link().await;
        if drop_key {
            self.enc = None;
        }
        self.set_state(SessionState::Reauthenticating);

        let mut outgoing = retry;
        for (_, mut p) in self.pending.drain() {
            if p.reply.is_closed() {
                continue;
            }
            if p.resent {
                p.fail(cause.clone());
            } else {
                p.resent = true;
                outgoing.push(p);
            }
        }

        if !delay.is_zero() {
            tracing::debug!("[courier] reconnecting to {} in {delay:?}", self.endpoint);
            tokio::time::sleep(delay).await;
        }
        if let Err(e) = self.ensure_ready().await {
            tracing::warn!("[courier] could not restore {}: {e}", self.endpoint);
            for p in outgoing {
                p.fail(e.clone());
            }
            return;
        }

        if let Err(e) = self.send_all(outgoing).await {
            // second failure in a row surfaces; the next request reconnects
            tracing::warn!("[courier] {} failed again after reconnecting: {e}", self.endpoint);
            self.drop_link().await;
            self.set_state(SessionState::Reauthenticating);
            let err = self.transport_error(e);
            for (_, p) in self.pending.drain() {
                p.fail(err.clone());
            }
        }
    }

    // ── outbound ─────────────────────────────────────────────────────────────

    fn park(&mut self, p: Pending) {
        let id = self.ctx.sequencer.next().0;
        self.pending.insert(id, p);
    }

    /// Encrypt and send `p`, registering it under its new message id.
    async fn transmit(&mut self, p: Pending) -> Result<(), TransportError> {
        let (Some(conn), Some(enc)) = (self.conn.as_mut(), self.enc.as_mut()) else {
            self.park(p);
            return Err(TransportError::Eof);
        };
        let packed = match enc.pack(&p.body, true) {
            Ok(packed) => packed,
            Err(_) => {
                p.fail(InvocationError::Random);
                return Ok(());
            }
        };
        tracing::trace!("[courier] → {} msg {} ({} bytes)", self.endpoint, packed.msg_id, p.body.len());
        let sent = conn.send(&packed.bytes).await;
        self.pending.insert(packed.msg_id.0, p);
        sent
    }

    async fn send_all(&mut self, items: Vec<Pending>) -> Result<(), TransportError> {
        let mut items = items.into_iter();
        while let Some(p) = items.next() {
            if let Err(e) = self.transmit(p).await {
                for rest in items {
                    self.park(rest);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send_service(&mut self, body: &[u8], content_related: bool) -> Result<(), TransportError> {
        let (Some(conn), Some(enc)) = (self.conn.as_mut(), self.enc.as_mut()) else {
            return Ok(());
        };
        match enc.pack(body, content_related) {
            Ok(packed) => conn.send(&packed.bytes).await,
            Err(e) => {
                tracing::warn!("[courier] could not pack service message: {e}");
                Ok(())
            }
        }
    }

    async fn flush_acks(&mut self) -> Result<(), TransportError> {
        if self.acks.is_empty() || self.conn.is_none() {
            return Ok(());
        }
        let body = MsgsAck { msg_ids: std::mem::take(&mut self.acks) }.to_bytes();
        self.send_service(&body, false).await
    }

    async fn on_tick(&mut self) {
        self.pending.retain(|_, p| !p.reply.is_closed());
        if self.conn.is_none() {
            return;
        }
        let ping = PingDelayDisconnect {
            ping_id:          self.ctx.sequencer.next().0,
            disconnect_delay: (self.ctx.ping_interval + PING_GRACE).as_secs() as i32,
        };
        let mut result = self.flush_acks().await;
        if result.is_ok() {
            result = self.send_service(&ping.to_bytes(), true).await;
        }
        if let Err(e) = result {
            self.recover(e).await;
        }
    }

    // ── inbound ──────────────────────────────────────────────────────────────

    async fn on_frame(&mut self, mut frame: Vec<u8>) {
        let Some(enc) = self.enc.as_mut() else { return };
        let msg = match enc.unpack(&mut frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("[courier] dropping link to {}: undecryptable frame ({e})", self.endpoint);
                let err = InvocationError::Crypto { endpoint: self.endpoint.to_string(), reason: e.to_string() };
                self.drop_link().await;
                self.set_state(SessionState::Reauthenticating);
                for (_, p) in self.pending.drain() {
                    p.fail(err.clone());
                }
                return;
            }
        };
        enc.set_salt(msg.header.salt);
        self.failures = 0;

        let env = match envelope::decode(msg.header.msg_id, msg.header.seq_no, &msg.body) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("[courier] undecodable message from {}: {e}", self.endpoint);
                return;
            }
        };
        self.acks.extend(env.to_ack);

        let mut resend = Vec::new();
        let mut stale: Option<(RpcError, i64)> = None;
        let endpoint = self.endpoint.to_string();
        for item in env.items {
            match item {
                Inbound::RpcResult { req_msg_id, outcome } => {
                    let Some(mut p) = self.pending.remove(&req_msg_id) else {
                        tracing::debug!("[courier] result for unknown msg {req_msg_id:#x}");
                        continue;
                    };
                    match outcome {
                        RpcOutcome::Ok(body) => {
                            let _ = p.reply.send(Ok(body));
                        }
                        RpcOutcome::Error { code, message } => {
                            let err = RpcError::from_telegram(code, &message);
                            if err.is_auth_key_invalid() && !p.resent {
                                p.resent = true;
                                resend.push(p);
                                if stale.is_none() {
                                    stale = Some((err, req_msg_id));
                                }
                            } else {
                                p.fail(InvocationError::from_rpc(err, &endpoint, req_msg_id));
                            }
                        }
                    }
                }
                Inbound::BadServerSalt(b) => {
                    tracing::debug!("[courier] {}: bad server salt, rotating", self.endpoint);
                    if let Some(enc) = self.enc.as_mut() {
                        enc.set_salt(b.new_server_salt);
                    }
                    if let Some(mut p) = self.pending.remove(&b.bad_msg_id) {
                        if p.salt_retried {
                            p.fail(InvocationError::BadMessage { msg_id: b.bad_msg_id, code: b.error_code });
                        } else {
                            p.salt_retried = true;
                            resend.push(p);
                        }
                    }
                }
                Inbound::BadMsgNotification(n) => {
                    let Some(mut p) = self.pending.remove(&n.bad_msg_id) else { continue };
                    let fixed = match n.error_code {
                        // msg_id too low / too high: our clock is off
                        16 | 17 => {
                            self.ctx.sequencer.correct_from_server_id(msg.header.msg_id);
                            true
                        }
                        // seq_no out of step: start a fresh server session
                        32 | 33 => self.enc.as_mut().is_some_and(|enc| enc.reset().is_ok()),
                        _ => false,
                    };
                    if fixed && !p.time_retried {
                        p.time_retried = true;
                        resend.push(p);
                    } else {
                        p.fail(InvocationError::BadMessage { msg_id: n.bad_msg_id, code: n.error_code });
                    }
                }
                Inbound::NewSessionCreated(n) => {
                    if let Some(enc) = self.enc.as_mut() {
                        enc.set_salt(n.server_salt);
                    }
                }
                Inbound::Updates { body, .. } => {
                    if let Some(tx) = &self.updates {
                        if tx.send(UpdateEvent { dc_id: self.endpoint.dc_id, payload: body }).is_err() {
                            tracing::debug!("[courier] update receiver gone");
                        }
                    }
                }
                Inbound::Pong(_) | Inbound::Ack(_) | Inbound::Other { .. } => {}
            }
        }

        if let Some((err, msg_id)) = stale {
            tracing::warn!("[courier] {} rejected our auth key ({err}), renegotiating", self.endpoint);
            let cause = InvocationError::from_rpc(err, &endpoint, msg_id);
            self.reconnect(true, resend, cause, Duration::ZERO).await;
            return;
        }
        if !resend.is_empty() {
            if let Err(e) = self.send_all(resend).await {
                self.recover(e).await;
                return;
            }
        }
        if self.acks.len() >= ACK_BATCH {
            if let Err(e) = self.flush_acks().await {
                self.recover(e).await;
            }
        }
    }

    async fn shutdown(mut self, rx: &mut mpsc::Receiver<Command>) {
        self.set_state(SessionState::Closed);
        rx.close();
        self.drop_link().await;
        for (_, p) in self.pending.drain() {
            p.fail(InvocationError::SessionClosed);
        }
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Start(reply) => {
                    let _ = reply.send(Err(InvocationError::SessionClosed));
                }
                Command::Invoke { reply, .. } => {
                    let _ = reply.send(Err(InvocationError::SessionClosed));
                }
            }
        }
        tracing::debug!("[courier] session for {} closed", self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the actor holds these across awaits inside a spawned task
    #[test]
    fn link_state_is_send_and_sync() {
        fn shareable<T: Send + Sync>() {}
        shareable::<Connection>();
        shareable::<EncryptedSession>();
        shareable::<Actor>();
    }

    #[test]
    fn reconnect_delay_doubles_up_to_the_cap() {
        assert_eq!(reconnect_delay(1), Duration::ZERO);
        assert_eq!(reconnect_delay(2), Duration::from_millis(500));
        assert_eq!(reconnect_delay(3), Duration::from_secs(1));
        assert_eq!(reconnect_delay(5), Duration::from_secs(4));
        assert_eq!(reconnect_delay(6), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(40), MAX_RECONNECT_DELAY);
    }
}
