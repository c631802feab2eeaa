//! Decoding of decrypted inbound messages.
//!
//! The server wraps answers and notices in a handful of service
//! constructors (`rpc_result`, `msg_container`, `gzip_packed`, salt and
//! session notices, acks, pongs). [`decode`] flattens one decrypted message
//! into the [`Inbound`] events the session loop acts on, and records which
//! message ids must be acknowledged.

use std::io::Read;

use courier_tl::deserialize::Error as TlError;
use courier_tl::mtproto::{
    BadMsgNotification, BadServerSalt, GZIP_PACKED_ID, MSG_CONTAINER_ID, MsgsAck, NewSessionCreated, Pong,
    RPC_RESULT_ID, RpcError, UPDATES_IDS,
};
use courier_tl::{Cursor, Deserializable, Identifiable};

// Containers never nest in practice; gzip inside a container is one more level.
const MAX_DEPTH: usize = 4;

/// Errors from [`decode`].
#[derive(Debug)]
pub enum EnvelopeError {
    /// A service constructor was truncated or malformed.
    Tl(TlError),
    /// `gzip_packed` data did not inflate.
    Inflate(std::io::Error),
    /// Containers or gzip layers nested too deeply.
    TooDeep,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tl(e) => write!(f, "malformed envelope: {e}"),
            Self::Inflate(e) => write!(f, "gzip_packed inflate failed: {e}"),
            Self::TooDeep => write!(f, "envelope nesting too deep"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<TlError> for EnvelopeError {
    fn from(e: TlError) -> Self { Self::Tl(e) }
}

/// The answer carried by `rpc_result`.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcOutcome {
    /// Serialized result object.
    Ok(Vec<u8>),
    /// `rpc_error` in place of a result.
    Error {
        /// HTTP-like status code.
        code:    i32,
        /// Raw error name, e.g. `FLOOD_WAIT_30`.
        message: String,
    },
}

/// One event extracted from an inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Answer to the request with id `req_msg_id`.
    RpcResult {
        /// Id of the request being answered.
        req_msg_id: i64,
        /// Result or error.
        outcome:    RpcOutcome,
    },
    /// The salt used for `bad_msg_id` was wrong; retry with `new_server_salt`.
    BadServerSalt(BadServerSalt),
    /// The server refused `bad_msg_id` (time or sequence problems).
    BadMsgNotification(BadMsgNotification),
    /// The server started a new session; carries the current salt.
    NewSessionCreated(NewSessionCreated),
    /// Answer to a ping.
    Pong(Pong),
    /// Server acknowledged our messages.
    Ack(Vec<i64>),
    /// An `Updates` object to hand to the dispatcher.
    Updates {
        /// Server message id carrying the object.
        msg_id: i64,
        /// The serialized `Updates`.
        body:   Vec<u8>,
    },
    /// Anything else; acknowledged and otherwise ignored.
    Other {
        /// Server message id.
        msg_id:      i64,
        /// Leading constructor id of the body.
        constructor: u32,
    },
}

/// Result of [`decode`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    /// Events in arrival order.
    pub items: Vec<Inbound>,
    /// Content-related message ids that must be acknowledged.
    pub to_ack: Vec<i64>,
}

/// Flatten a decrypted message into events.
pub fn decode(msg_id: i64, seq_no: i32, body: &[u8]) -> Result<Envelope, EnvelopeError> {
    let mut env = Envelope::default();
    decode_into(&mut env, msg_id, seq_no, body, 0)?;
    Ok(env)
}

fn decode_into(env: &mut Envelope, msg_id: i64, seq_no: i32, body: &[u8], depth: usize) -> Result<(), EnvelopeError> {
    if depth > MAX_DEPTH {
        return Err(EnvelopeError::TooDeep);
    }
    let mut cur = Cursor::from_slice(body);
    let id = cur.peek_u32()?;

    if id != MSG_CONTAINER_ID && seq_no & 1 == 1 {
        env.to_ack.push(msg_id);
    }

    match id {
        MSG_CONTAINER_ID => {
            u32::deserialize(&mut cur)?;
            let count = i32::deserialize(&mut cur)?.max(0);
            for _ in 0..count {
                let inner_id = i64::deserialize(&mut cur)?;
                let inner_seq = i32::deserialize(&mut cur)?;
                let len = i32::deserialize(&mut cur)?.max(0) as usize;
                let inner = cur.read_slice(len)?;
                decode_into(env, inner_id, inner_seq, inner, depth + 1)?;
            }
        }
        GZIP_PACKED_ID => {
            u32::deserialize(&mut cur)?;
            let packed = Vec::<u8>::deserialize(&mut cur)?;
            let unpacked = inflate(&packed)?;
            // the packed object shares this message's id; don't ack twice
            let inner_seq = if env.to_ack.last() == Some(&msg_id) { 0 } else { seq_no };
            decode_into(env, msg_id, inner_seq, &unpacked, depth + 1)?;
        }
        RPC_RESULT_ID => {
            u32::deserialize(&mut cur)?;
            let req_msg_id = i64::deserialize(&mut cur)?;
            let outcome = rpc_outcome(cur.read_rest(), depth)?;
            env.items.push(Inbound::RpcResult { req_msg_id, outcome });
        }
        BadServerSalt::CONSTRUCTOR_ID => {
            env.items.push(Inbound::BadServerSalt(BadServerSalt::deserialize(&mut cur)?));
        }
        BadMsgNotification::CONSTRUCTOR_ID => {
            env.items.push(Inbound::BadMsgNotification(BadMsgNotification::deserialize(&mut cur)?));
        }
        NewSessionCreated::CONSTRUCTOR_ID => {
            env.items.push(Inbound::NewSessionCreated(NewSessionCreated::deserialize(&mut cur)?));
        }
        Pong::CONSTRUCTOR_ID => {
            env.items.push(Inbound::Pong(Pong::deserialize(&mut cur)?));
        }
        MsgsAck::CONSTRUCTOR_ID => {
            env.items.push(Inbound::Ack(MsgsAck::deserialize(&mut cur)?.msg_ids));
        }
        id if UPDATES_IDS.contains(&id) => {
            env.items.push(Inbound::Updates { msg_id, body: body.to_vec() });
        }
        constructor => {
            log::trace!("[courier-mtproto] ignoring constructor {constructor:#010x}");
            env.items.push(Inbound::Other { msg_id, constructor });
        }
    }
    Ok(())
}

fn rpc_outcome(result: &[u8], depth: usize) -> Result<RpcOutcome, EnvelopeError> {
    if depth > MAX_DEPTH {
        return Err(EnvelopeError::TooDeep);
    }
    let mut cur = Cursor::from_slice(result);
    match cur.peek_u32()? {
        RpcError::CONSTRUCTOR_ID => {
            let e = RpcError::deserialize(&mut cur)?;
            Ok(RpcOutcome::Error { code: e.error_code, message: e.error_message })
        }
        GZIP_PACKED_ID => {
            u32::deserialize(&mut cur)?;
            let packed = Vec::<u8>::deserialize(&mut cur)?;
            rpc_outcome(&inflate(&packed)?, depth + 1)
        }
        _ => Ok(RpcOutcome::Ok(result.to_vec())),
    }
}

/// Inflate a `gzip_packed` payload (gzip, or bare zlib from older servers).
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data).read_to_end(&mut out).map_err(EnvelopeError::Inflate)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use courier_tl::Serializable;

    use super::*;

    fn rpc_result(req: i64, result: &[u8]) -> Vec<u8> {
        let mut v = RPC_RESULT_ID.to_bytes();
        v.extend(req.to_le_bytes());
        v.extend_from_slice(result);
        v
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        let mut v = GZIP_PACKED_ID.to_bytes();
        enc.finish().unwrap().serialize(&mut v);
        v
    }

    #[test]
    fn rpc_error_is_surfaced_with_code() {
        let err = RpcError { error_code: 303, error_message: "PHONE_MIGRATE_4".into() }.to_bytes();
        let env = decode(101, 1, &rpc_result(40, &err)).unwrap();
        assert_eq!(
            env.items,
            vec![Inbound::RpcResult {
                req_msg_id: 40,
                outcome: RpcOutcome::Error { code: 303, message: "PHONE_MIGRATE_4".into() }
            }]
        );
        assert_eq!(env.to_ack, vec![101]);
    }

    #[test]
    fn container_is_flattened_in_order() {
        let salt = BadServerSalt { bad_msg_id: 8, bad_msg_seqno: 3, error_code: 48, new_server_salt: 555 };
        let items: Vec<(i64, i32, Vec<u8>)> = vec![
            (201, 1, rpc_result(8, &[1, 0, 0, 0])),
            (202, 0, salt.to_bytes()),
            (203, 1, 0x74ae4240u32.to_bytes()),
        ];
        let mut body = MSG_CONTAINER_ID.to_bytes();
        body.extend((items.len() as i32).to_le_bytes());
        for (id, seq, inner) in &items {
            body.extend(id.to_le_bytes());
            body.extend(seq.to_le_bytes());
            body.extend((inner.len() as i32).to_le_bytes());
            body.extend_from_slice(inner);
        }

        let env = decode(200, 2, &body).unwrap();
        assert_eq!(env.items.len(), 3);
        assert!(matches!(env.items[0], Inbound::RpcResult { req_msg_id: 8, .. }));
        assert_eq!(env.items[1], Inbound::BadServerSalt(salt));
        assert!(matches!(env.items[2], Inbound::Updates { msg_id: 203, .. }));
        assert_eq!(env.to_ack, vec![201, 203]);
    }

    #[test]
    fn gzip_result_is_inflated() {
        let payload = vec![7u8; 64];
        let env = decode(300, 1, &rpc_result(12, &gzip(&payload))).unwrap();
        assert_eq!(env.items, vec![Inbound::RpcResult { req_msg_id: 12, outcome: RpcOutcome::Ok(payload) }]);
    }

    #[test]
    fn gzip_wrapped_updates_acked_once() {
        let updates = 0x78d4dec1u32.to_bytes();
        let env = decode(400, 1, &gzip(&updates)).unwrap();
        assert!(matches!(env.items[0], Inbound::Updates { msg_id: 400, .. }));
        assert_eq!(env.to_ack, vec![400]);
    }

    #[test]
    fn truncated_container_is_an_error() {
        let mut body = MSG_CONTAINER_ID.to_bytes();
        body.extend(1i32.to_le_bytes());
        body.extend(5i64.to_le_bytes());
        assert!(matches!(decode(1, 2, &body), Err(EnvelopeError::Tl(TlError::UnexpectedEof))));
    }
}
