//! In-process datacenters for the integration tests.
//!
//! Every `connect` gets a duplex pipe whose far end is served by a task
//! that speaks abridged framing, decrypts with a fixed per-DC key and
//! answers according to a [`Behavior`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_client::transport::{BoxStream, Connection};
use courier_client::{Connector, Endpoint, HandshakeError, Handshaker, Negotiated, TransportError};
use courier_crypto::{AuthKey, Side};
use courier_mtproto::encrypted::{Header, open, seal};
use courier_mtproto::MessageSequencer;
use courier_mtproto::transport::{Abridged, FrameError, Framing};
use courier_tl::mtproto::{BadServerSalt, GZIP_PACKED_ID, MsgsAck, PingDelayDisconnect, RPC_RESULT_ID, RpcError};
use courier_tl::{Identifiable, Serializable};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const FIRST_SALT: i64 = 0x0102_0304_0506_0708;

/// The key every fake DC `dc_id` uses.
pub fn key_for(dc_id: i32) -> AuthKey {
    AuthKey::from_bytes([dc_id as u8; 256])
}

/// A 4-byte-aligned request body tagged with `tag`.
pub fn request(tag: u32) -> Vec<u8> {
    let mut body = tag.to_le_bytes().to_vec();
    body.extend(0xdead_beef_u32.to_le_bytes());
    body
}

// ─── Handshaker ──────────────────────────────────────────────────────────────

/// Skips the DH exchange and hands out [`key_for`] keys.
#[derive(Default)]
pub struct FakeHandshaker {
    done: Mutex<Vec<Endpoint>>,
}

impl FakeHandshaker {
    pub fn count(&self) -> usize {
        self.done.lock().unwrap().len()
    }

    pub fn count_for(&self, dc_id: i32, media: bool) -> usize {
        self.done.lock().unwrap().iter().filter(|e| e.dc_id == dc_id && e.media == media).count()
    }
}

#[async_trait]
impl Handshaker for FakeHandshaker {
    async fn negotiate(
        &self,
        _conn:      &mut Connection,
        endpoint:   &Endpoint,
        _sequencer: &MessageSequencer,
    ) -> Result<Negotiated, HandshakeError> {
        self.done.lock().unwrap().push(endpoint.clone());
        Ok(Negotiated { auth_key: key_for(endpoint.dc_id), first_salt: FIRST_SALT, time_offset: 0 })
    }
}

// ─── Behavior ────────────────────────────────────────────────────────────────

/// One decrypted client request as the fake DC saw it.
#[derive(Clone, Debug)]
pub struct Request {
    pub endpoint:   Endpoint,
    /// Zero-based index of the connection to this endpoint.
    pub conn:       usize,
    pub salt:       i64,
    pub session_id: i64,
    pub msg_id:     i64,
    pub body:       Vec<u8>,
}

/// What the fake DC sends back for a request.
#[derive(Clone, Debug)]
pub enum Action {
    Result(Vec<u8>),
    Error(i32, &'static str),
    BadSalt(i64),
    Update(Vec<u8>),
    /// Transport status frame, then hang up.
    Status(i32),
    /// Close the connection without answering.
    HangUp,
    Silent,
}

pub type Behavior = Arc<dyn Fn(&Request) -> Vec<Action> + Send + Sync>;

/// Answers every request with its own body.
pub fn echo() -> Behavior {
    Arc::new(|req: &Request| vec![Action::Result(req.body.clone())])
}

// ─── Connector ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Seen {
    connections: HashMap<(i32, bool), usize>,
    requests:    Vec<Request>,
}

/// Opens duplex pipes to fake DCs.
pub struct FakeNetwork {
    behavior:  Behavior,
    seen:      Arc<Mutex<Seen>>,
    server_id: Arc<AtomicI64>,
    refused:   AtomicUsize,
    flapping:  Arc<AtomicBool>,
}

impl FakeNetwork {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            seen: Arc::default(),
            server_id: Arc::new(AtomicI64::new((1_700_000_000_i64 << 32) | 1)),
            refused: AtomicUsize::new(0),
            flapping: Arc::default(),
        })
    }

    /// While set, every DC hangs up right after reading the preamble.
    pub fn set_flapping(&self, on: bool) {
        self.flapping.store(on, Ordering::SeqCst);
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse(&self, n: usize) {
        self.refused.store(n, Ordering::SeqCst);
    }

    pub fn connections(&self, dc_id: i32, media: bool) -> usize {
        self.seen.lock().unwrap().connections.get(&(dc_id, media)).copied().unwrap_or(0)
    }

    /// Every application request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.seen.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl Connector for FakeNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxStream, TransportError> {
        let refused = self.refused.load(Ordering::SeqCst);
        if refused > 0 {
            self.refused.store(refused - 1, Ordering::SeqCst);
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }

        let conn = {
            let mut seen = self.seen.lock().unwrap();
            let n = seen.connections.entry((endpoint.dc_id, endpoint.media)).or_default();
            *n += 1;
            *n - 1
        };
        let (client, server) = tokio::io::duplex(1 << 16);
        let dc = FakeDc {
            endpoint:  endpoint.clone(),
            conn,
            key:       key_for(endpoint.dc_id),
            behavior:  Arc::clone(&self.behavior),
            seen:      Arc::clone(&self.seen),
            server_id: Arc::clone(&self.server_id),
            flapping:  Arc::clone(&self.flapping),
        };
        tokio::spawn(dc.serve(server));
        Ok(Box::new(client))
    }
}

// ─── Server side ─────────────────────────────────────────────────────────────

struct FakeDc {
    endpoint:  Endpoint,
    conn:      usize,
    key:       AuthKey,
    behavior:  Behavior,
    seen:      Arc<Mutex<Seen>>,
    server_id: Arc<AtomicI64>,
    flapping:  Arc<AtomicBool>,
}

const SERVICE_IDS: &[u32] = &[MsgsAck::CONSTRUCTOR_ID, PingDelayDisconnect::CONSTRUCTOR_ID, GZIP_PACKED_ID];

impl FakeDc {
    async fn serve(self, mut stream: DuplexStream) {
        let mut init = [0u8; 1];
        if stream.read_exact(&mut init).await.is_err() || init[0] != 0xef {
            return;
        }
        if self.flapping.load(Ordering::SeqCst) {
            return;
        }
        let mut framing = Abridged;
        let mut buf = Vec::new();

        loop {
            let payload = match framing.unpack(&buf) {
                Ok(u) => {
                    buf.drain(..u.consumed);
                    u.payload
                }
                Err(FrameError::Incomplete { .. }) => {
                    match stream.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => continue,
                    }
                }
                Err(_) => return,
            };

            let mut frame = payload;
            let Ok(msg) = open(&self.key, Side::Client, &mut frame) else { return };
            if msg.body.len() < 4 {
                continue;
            }
            let id = u32::from_le_bytes([msg.body[0], msg.body[1], msg.body[2], msg.body[3]]);
            if SERVICE_IDS.contains(&id) {
                continue;
            }

            let req = Request {
                endpoint:   self.endpoint.clone(),
                conn:       self.conn,
                salt:       msg.header.salt,
                session_id: msg.header.session_id,
                msg_id:     msg.header.msg_id,
                body:       msg.body,
            };
            self.seen.lock().unwrap().requests.push(req.clone());

            for action in (self.behavior)(&req) {
                let body = match action {
                    Action::Result(result) => rpc_result(req.msg_id, &result),
                    Action::Error(code, message) => {
                        rpc_result(req.msg_id, &RpcError { error_code: code, error_message: message.into() }.to_bytes())
                    }
                    Action::BadSalt(new_server_salt) => BadServerSalt {
                        bad_msg_id: req.msg_id,
                        bad_msg_seqno: 1,
                        error_code: 48,
                        new_server_salt,
                    }
                    .to_bytes(),
                    Action::Update(update) => update,
                    Action::Status(code) => {
                        let mut out = Vec::new();
                        framing.pack(&code.to_le_bytes(), &mut out);
                        let _ = stream.write_all(&out).await;
                        return;
                    }
                    Action::HangUp => return,
                    Action::Silent => continue,
                };
                if self.reply(&mut stream, &mut framing, &req, &body).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn reply(
        &self,
        stream:  &mut DuplexStream,
        framing: &mut Abridged,
        req:     &Request,
        body:    &[u8],
    ) -> std::io::Result<()> {
        let header = Header {
            salt:       req.salt,
            session_id: req.session_id,
            msg_id:     self.server_id.fetch_add(4, Ordering::SeqCst),
            seq_no:     1,
        };
        let sealed = seal(&self.key, Side::Server, header, body).map_err(|e| std::io::Error::other(e.to_string()))?;
        let mut out = Vec::new();
        framing.pack(&sealed, &mut out);
        stream.write_all(&out).await?;
        stream.flush().await
    }
}

fn rpc_result(req_msg_id: i64, result: &[u8]) -> Vec<u8> {
    let mut v = RPC_RESULT_ID.to_bytes();
    v.extend(req_msg_id.to_le_bytes());
    v.extend_from_slice(result);
    v
}
