//! Encrypted MTProto 2.0 session state.
//!
//! Once an auth key exists, every message travels as
//!
//! ```text
//! salt:long session_id:long msg_id:long seq_no:int len:int body padding
//! ```
//!
//! encrypted with [`courier_crypto::encrypt_data_v2`]. [`seal`] and [`open`]
//! work for either side of the connection; [`EncryptedSession`] is the
//! client's view with its counters.

use std::sync::Arc;

use courier_crypto::{AuthKey, Side, decrypt_data_v2, encrypt_data_v2};

use crate::message::{MessageId, MessageSequencer};

/// Errors that can occur when opening a received frame.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum DecryptError {
    /// The crypto layer rejected the packet.
    Crypto(courier_crypto::DecryptError),
    /// The plaintext is too short for its header.
    FrameTooShort,
    /// Declared body length or padding is out of range.
    BadLength { declared: usize, available: usize },
    /// The frame belongs to another session.
    SessionMismatch { expected: i64, got: i64 },
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort => write!(f, "inner plaintext too short"),
            Self::BadLength { declared, available } => {
                write!(f, "body length {declared} invalid for {available} available bytes")
            }
            Self::SessionMismatch { expected, got } => {
                write!(f, "session_id mismatch: expected {expected:#x}, got {got:#x}")
            }
        }
    }
}
impl std::error::Error for DecryptError {}

/// Header fields of one encrypted message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    /// Server salt.
    pub salt: i64,
    /// Session the message belongs to.
    pub session_id: i64,
    /// Message id.
    pub msg_id: i64,
    /// Sequence number (odd when content-related).
    pub seq_no: i32,
}

/// A decrypted message.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    /// Header as sent.
    pub header: Header,
    /// TL-serialized body.
    pub body: Vec<u8>,
}

/// Encrypt one message as `side`.
pub fn seal(auth_key: &AuthKey, side: Side, header: Header, body: &[u8]) -> Result<Vec<u8>, getrandom::Error> {
    let mut plain = Vec::with_capacity(32 + body.len());
    plain.extend(header.salt.to_le_bytes());
    plain.extend(header.session_id.to_le_bytes());
    plain.extend(header.msg_id.to_le_bytes());
    plain.extend(header.seq_no.to_le_bytes());
    plain.extend((body.len() as u32).to_le_bytes());
    plain.extend_from_slice(body);
    encrypt_data_v2(&plain, auth_key, side)
}

/// Decrypt one message written by `side`.
pub fn open(auth_key: &AuthKey, side: Side, frame: &mut [u8]) -> Result<DecryptedMessage, DecryptError> {
    let plain = decrypt_data_v2(frame, auth_key, side).map_err(DecryptError::Crypto)?;
    if plain.len() < 32 {
        return Err(DecryptError::FrameTooShort);
    }

    let long = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&plain[at..at + 8]);
        i64::from_le_bytes(b)
    };
    let header = Header {
        salt: long(0),
        session_id: long(8),
        msg_id: long(16),
        seq_no: i32::from_le_bytes([plain[24], plain[25], plain[26], plain[27]]),
    };
    let declared = u32::from_le_bytes([plain[28], plain[29], plain[30], plain[31]]) as usize;
    let available = plain.len() - 32;
    // 12..=1024 bytes of padding follow the body
    if declared % 4 != 0 || declared + 12 > available || available - declared > 1024 {
        return Err(DecryptError::BadLength { declared, available });
    }

    Ok(DecryptedMessage { header, body: plain[32..32 + declared].to_vec() })
}

/// An encrypted message ready for the transport.
#[derive(Clone, Debug)]
pub struct Packed {
    /// Id allocated for the message.
    pub msg_id: MessageId,
    /// Sequence number used.
    pub seq_no: i32,
    /// Salt the message was sealed with.
    pub salt: i64,
    /// `key_id || msg_key || ciphertext`.
    pub bytes: Vec<u8>,
}

/// Client-side encrypted session.
///
/// Message ids come from the shared [`MessageSequencer`], so ids stay
/// monotonic across every session of the process.
pub struct EncryptedSession {
    auth_key: AuthKey,
    session_id: i64,
    sequence: i32,
    salt: i64,
    sequencer: Arc<MessageSequencer>,
}

fn random_i64() -> Result<i64, getrandom::Error> {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

impl EncryptedSession {
    /// Start a session with a random session id.
    pub fn new(auth_key: AuthKey, salt: i64, sequencer: Arc<MessageSequencer>) -> Result<Self, getrandom::Error> {
        Ok(Self::with_session_id(auth_key, salt, sequencer, random_i64()?))
    }

    /// Start a session with a fixed session id.
    pub fn with_session_id(auth_key: AuthKey, salt: i64, sequencer: Arc<MessageSequencer>, session_id: i64) -> Self {
        Self { auth_key, session_id, sequence: 0, salt, sequencer }
    }

    /// Begin a fresh server-side session on the same key (after a reconnect).
    pub fn reset(&mut self) -> Result<(), getrandom::Error> {
        self.session_id = random_i64()?;
        self.sequence = 0;
        Ok(())
    }

    fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Encrypt `body` under the current salt.
    pub fn pack(&mut self, body: &[u8], content_related: bool) -> Result<Packed, getrandom::Error> {
        let msg_id = self.sequencer.next();
        let seq_no = self.next_seq_no(content_related);
        let header = Header { salt: self.salt, session_id: self.session_id, msg_id: msg_id.0, seq_no };
        let bytes = seal(&self.auth_key, Side::Client, header, body)?;
        Ok(Packed { msg_id, seq_no, salt: self.salt, bytes })
    }

    /// Decrypt a server frame and check it belongs to this session.
    pub fn unpack(&self, frame: &mut [u8]) -> Result<DecryptedMessage, DecryptError> {
        let msg = open(&self.auth_key, Side::Server, frame)?;
        if msg.header.session_id != self.session_id {
            return Err(DecryptError::SessionMismatch { expected: self.session_id, got: msg.header.session_id });
        }
        Ok(msg)
    }

    /// Swap in a new server salt.
    pub fn set_salt(&mut self, salt: i64) {
        if salt != self.salt {
            log::debug!("[courier-mtproto] salt rotated");
        }
        self.salt = salt;
    }

    /// Current salt.
    pub fn salt(&self) -> i64 { self.salt }

    /// Current session id.
    pub fn session_id(&self) -> i64 { self.session_id }

    /// The key this session encrypts with.
    pub fn auth_key(&self) -> &AuthKey { &self.auth_key }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> EncryptedSession {
        EncryptedSession::with_session_id(AuthKey::from_bytes([0x42; 256]), 77, Arc::new(MessageSequencer::new()), 1234)
    }

    #[test]
    fn server_opens_client_packet() {
        let mut s = session();
        let packed = s.pack(&[1, 2, 3, 4], true).unwrap();
        let mut bytes = packed.bytes.clone();
        let msg = open(s.auth_key(), Side::Client, &mut bytes).unwrap();
        assert_eq!(msg.header, Header { salt: 77, session_id: 1234, msg_id: packed.msg_id.0, seq_no: 1 });
        assert_eq!(msg.body, [1, 2, 3, 4]);
    }

    #[test]
    fn seq_numbers_follow_content_relation() {
        let mut s = session();
        assert_eq!(s.pack(b"aaaa", true).unwrap().seq_no, 1);
        assert_eq!(s.pack(b"bbbb", false).unwrap().seq_no, 2);
        assert_eq!(s.pack(b"cccc", true).unwrap().seq_no, 3);
    }

    #[test]
    fn client_rejects_other_session() {
        let s = session();
        let header = Header { salt: 1, session_id: 999, msg_id: 5, seq_no: 1 };
        let mut frame = seal(s.auth_key(), Side::Server, header, &[0; 8]).unwrap();
        assert_eq!(
            s.unpack(&mut frame).unwrap_err(),
            DecryptError::SessionMismatch { expected: 1234, got: 999 }
        );
    }

    #[test]
    fn salt_swap_applies_to_next_packet() {
        let mut s = session();
        s.set_salt(-9);
        assert_eq!(s.pack(b"xxxx", true).unwrap().salt, -9);
    }
}
