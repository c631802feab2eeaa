//! Message identifiers and the plaintext envelope used before a key exists.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A 64-bit MTProto message identifier.
///
/// Upper 32 bits are server-corrected unix seconds, lower 32 bits the
/// sub-second part. The two low bits are zero for client messages.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Wall-clock source for [`MessageSequencer`].
pub trait Clock: Send + Sync {
    /// Time elapsed since the unix epoch.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

// ─── MessageSequencer ────────────────────────────────────────────────────────

#[derive(Default)]
struct SequencerState {
    last: i64,
    time_offset: i32,
}

/// Process-wide source of strictly increasing [`MessageId`]s.
///
/// Shared by every session of a client. If the clock does not move forward
/// past the last issued id (rapid calls, or the wall clock stepping back),
/// the next id is `last + 4`.
pub struct MessageSequencer {
    clock: Box<dyn Clock>,
    state: Mutex<SequencerState>,
}

impl MessageSequencer {
    /// Sequencer reading the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Sequencer reading a custom clock.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self { clock: Box::new(clock), state: Mutex::new(SequencerState::default()) }
    }

    /// Issue the next identifier.
    pub fn next(&self) -> MessageId {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let secs = (now.as_secs() as i64).wrapping_add(i64::from(state.time_offset));
        let candidate = (secs << 32) | (i64::from(now.subsec_nanos()) << 2);
        let id = if candidate > state.last { candidate } else { state.last + 4 };
        state.last = id;
        MessageId(id)
    }

    /// Seconds to add to local time to get server time.
    pub fn set_time_offset(&self, offset: i32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.time_offset != offset {
            log::info!("[courier-mtproto] server time offset now {offset}s");
        }
        state.time_offset = offset;
    }

    /// Current server time offset in seconds.
    pub fn time_offset(&self) -> i32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).time_offset
    }

    /// Derive the offset from a server-issued message id (`bad_msg_notification` 16/17).
    pub fn correct_from_server_id(&self, server_msg_id: i64) {
        let server_secs = server_msg_id >> 32;
        let local_secs = self.clock.now().as_secs() as i64;
        self.set_time_offset((server_secs - local_secs) as i32);
    }
}

impl Default for MessageSequencer {
    fn default() -> Self { Self::new() }
}

// ─── Plaintext envelope ──────────────────────────────────────────────────────

/// Errors from [`parse_plaintext`].
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum PlaintextError {
    /// Shorter than the 20-byte header.
    TooShort { len: usize },
    /// `auth_key_id` was not zero.
    NotPlaintext { auth_key_id: i64 },
    /// Declared length disagrees with the frame.
    BadLength { declared: usize, available: usize },
}

impl std::fmt::Display for PlaintextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "plaintext frame of {len} bytes is too short"),
            Self::NotPlaintext { auth_key_id } => write!(f, "expected plaintext, got auth_key_id {auth_key_id}"),
            Self::BadLength { declared, available } => {
                write!(f, "plaintext declares {declared} bytes, frame has {available}")
            }
        }
    }
}

impl std::error::Error for PlaintextError {}

/// Wrap `body` in the unencrypted envelope:
///
/// ```text
/// auth_key_id:long  (0)
/// message_id:long
/// message_data_length:int
/// message_data:bytes
/// ```
pub fn to_plaintext_bytes(msg_id: MessageId, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + body.len());
    buf.extend(0i64.to_le_bytes());
    buf.extend(msg_id.0.to_le_bytes());
    buf.extend((body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Strip the unencrypted envelope, returning the server msg id and body.
pub fn parse_plaintext(frame: &[u8]) -> Result<(i64, &[u8]), PlaintextError> {
    if frame.len() < 20 {
        return Err(PlaintextError::TooShort { len: frame.len() });
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&frame[..8]);
    let auth_key_id = i64::from_le_bytes(word);
    if auth_key_id != 0 {
        return Err(PlaintextError::NotPlaintext { auth_key_id });
    }
    word.copy_from_slice(&frame[8..16]);
    let msg_id = i64::from_le_bytes(word);
    let declared = u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]) as usize;
    let available = frame.len() - 20;
    if declared > available {
        return Err(PlaintextError::BadLength { declared, available });
    }
    Ok((msg_id, &frame[20..20 + declared]))
}
