//! Error types for courier-client.
//!
//! Every error here is `Clone`: the session actor fans one failure out to
//! all requests waiting on the same connection.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use courier_mtproto::authentication;
use courier_mtproto::message::PlaintextError;
use courier_mtproto::transport::FrameError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

/// Which request family a `*_MIGRATE_X` error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateKind {
    /// `PHONE_MIGRATE_X`
    Phone,
    /// `NETWORK_MIGRATE_X`
    Network,
    /// `USER_MIGRATE_X`
    User,
    /// `FILE_MIGRATE_X`: only the media request moves.
    File,
    /// `STATS_MIGRATE_X`
    Stats,
}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: message[..idx].to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Seconds to wait, if this is a `FLOOD_WAIT_X`.
    pub fn flood_wait(&self) -> Option<u32> {
        if self.code == 420 && self.name == "FLOOD_WAIT" { self.value } else { None }
    }

    /// Target datacenter, if this is a `*_MIGRATE_X`.
    pub fn migrate_dc(&self) -> Option<(i32, MigrateKind)> {
        if self.code != 303 {
            return None;
        }
        let kind = match self.name.as_str() {
            "PHONE_MIGRATE"   => MigrateKind::Phone,
            "NETWORK_MIGRATE" => MigrateKind::Network,
            "USER_MIGRATE"    => MigrateKind::User,
            "FILE_MIGRATE"    => MigrateKind::File,
            "STATS_MIGRATE"   => MigrateKind::Stats,
            _ => return None,
        };
        self.value.map(|dc| (dc as i32, kind))
    }

    /// The server no longer accepts this auth key.
    ///
    /// `AUTH_KEY_UNREGISTERED` is not included: the key is fine, it just has
    /// no login on it yet.
    pub fn is_auth_key_invalid(&self) -> bool {
        self.code == 401 && self.name == "AUTH_KEY_INVALID"
    }
}

// ─── TransportError ───────────────────────────────────────────────────────────

/// Failure of a Transport Connection. Always recoverable by reconnecting.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    #[error("connection closed by peer")]
    Eof,

    /// Transport-level status instead of a frame (`-404`, `-429`, ...).
    #[error("server transport error {code}")]
    Server { code: i32 },

    #[error("malformed frame: {0}")]
    BadFrame(FrameError),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("connect timed out")]
    Timeout,
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof { Self::Eof } else { Self::Io(Arc::new(e)) }
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Status { code, .. } => Self::Server { code },
            other => Self::BadFrame(other),
        }
    }
}

impl TransportError {
    /// `-404`: the server does not know our auth key.
    pub fn is_stale_key(&self) -> bool {
        matches!(self, Self::Server { code: -404 })
    }
}

// ─── HandshakeError ───────────────────────────────────────────────────────────

/// Failure while negotiating an auth key. Not retried automatically.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("key exchange rejected: {0}")]
    Exchange(#[from] authentication::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("bad plaintext reply: {0}")]
    Plaintext(#[from] PlaintextError),

    #[error("undecodable reply: {0}")]
    Decode(#[from] courier_tl::deserialize::Error),

    #[error("handshake timed out")]
    Timeout,
}

// ─── CacheError ───────────────────────────────────────────────────────────────

/// Invalid cache configuration.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache capacity must be at least 1")]
    ZeroCapacity,
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from anything that talks to a datacenter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("transport failure on {endpoint}: {source}")]
    Transport { endpoint: String, source: TransportError },

    #[error("handshake with {endpoint} failed: {source}")]
    Handshake { endpoint: String, source: HandshakeError },

    #[error("{error} from {endpoint} for msg {msg_id:#x}")]
    Rpc { endpoint: String, msg_id: i64, error: RpcError },

    /// The account or file lives on another datacenter.
    #[error("{endpoint} asked to migrate msg {msg_id:#x} to DC{dc_id} ({kind:?})")]
    Migrate { endpoint: String, msg_id: i64, dc_id: i32, kind: MigrateKind },

    /// The server asked us to back off. Never slept on internally.
    #[error("flood wait of {seconds}s from {endpoint} for msg {msg_id:#x}")]
    FloodWait { endpoint: String, msg_id: i64, seconds: u32 },

    /// `bad_msg_notification` the session could not recover from.
    #[error("server refused message {msg_id:#x} with code {code}")]
    BadMessage { msg_id: i64, code: i32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("session closed")]
    SessionClosed,

    #[error("client not started")]
    NotStarted,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("undecodable response: {0}")]
    Decode(String),

    /// An inbound frame failed to decrypt or did not belong to the session.
    #[error("frame from {endpoint} rejected: {reason}")]
    Crypto { endpoint: String, reason: String },

    #[error("no address known for DC{dc_id}")]
    UnknownDatacenter { dc_id: i32 },

    #[error("system random source failed")]
    Random,
}

impl InvocationError {
    /// Classify an `rpc_error` that `endpoint` returned for `msg_id` into the
    /// variant callers act on.
    pub fn from_rpc(error: RpcError, endpoint: &str, msg_id: i64) -> Self {
        let endpoint = endpoint.to_string();
        if let Some((dc_id, kind)) = error.migrate_dc() {
            Self::Migrate { endpoint, msg_id, dc_id, kind }
        } else if let Some(seconds) = error.flood_wait() {
            Self::FloodWait { endpoint, msg_id, seconds }
        } else {
            Self::Rpc { endpoint, msg_id, error }
        }
    }

    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc { error, .. } => error.is(pattern),
            _                       => false,
        }
    }

    /// If this is a flood wait, how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        match self {
            Self::FloodWait { seconds, .. } => Some(*seconds),
            _                               => None,
        }
    }
}

impl From<getrandom::Error> for InvocationError {
    fn from(_: getrandom::Error) -> Self { Self::Random }
}
