//! MTProto service constructors.
//!
//! Only the handful of types the protocol layer has to understand itself:
//! the auth key exchange, the envelope types and the keep-alive ping.
//! Everything else is an opaque [`crate::Blob`].

use crate::deserialize::{Buffer, Error, Result};
use crate::{Deserializable, Identifiable, RemoteCall, Serializable};

macro_rules! tl_struct {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $field:ident : $ty:ty ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        #[allow(missing_docs)]
        pub struct $name { $( pub $field: $ty ),* }

        impl Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                Self::CONSTRUCTOR_ID.serialize(buf);
                $( self.$field.serialize(buf); )*
            }
        }

        impl $name {
            /// Read the fields, assuming the constructor ID was consumed.
            pub fn deserialize_bare(_buf: Buffer) -> Result<Self> {
                Ok(Self { $( $field: <$ty>::deserialize(_buf)? ),* })
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let id = u32::deserialize(buf)?;
                if id != Self::CONSTRUCTOR_ID {
                    return Err(Error::UnexpectedConstructor { id });
                }
                Self::deserialize_bare(buf)
            }
        }
    };
}

// ─── Auth key exchange ───────────────────────────────────────────────────────

tl_struct! {
    /// `req_pq_multi`
    ReqPqMulti = 0xbe7e8ef1 { nonce: [u8; 16] }
}

tl_struct! {
    /// `resPQ`
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

tl_struct! {
    /// `p_q_inner_data_dc`
    PQInnerDataDc = 0xa9f55f95 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
    }
}

tl_struct! {
    /// `req_DH_params`
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    }
}

tl_struct! {
    /// `server_DH_params_fail`
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

tl_struct! {
    /// `server_DH_params_ok`
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

tl_struct! {
    /// `server_DH_inner_data`
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

tl_struct! {
    /// `client_DH_inner_data`
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

tl_struct! {
    /// `set_client_DH_params`
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    }
}

tl_struct! {
    /// `dh_gen_ok`
    DhGenOk = 0x3bcbf734 { nonce: [u8; 16], server_nonce: [u8; 16], new_nonce_hash1: [u8; 16] }
}

tl_struct! {
    /// `dh_gen_retry`
    DhGenRetry = 0x46dc1fb9 { nonce: [u8; 16], server_nonce: [u8; 16], new_nonce_hash2: [u8; 16] }
}

tl_struct! {
    /// `dh_gen_fail`
    DhGenFail = 0xa69dae02 { nonce: [u8; 16], server_nonce: [u8; 16], new_nonce_hash3: [u8; 16] }
}

/// Boxed `Server_DH_Params`.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerDhParams {
    /// `server_DH_params_fail`
    Fail(ServerDhParamsFail),
    /// `server_DH_params_ok`
    Ok(ServerDhParamsOk),
}

impl Deserializable for ServerDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            ServerDhParamsFail::CONSTRUCTOR_ID => Ok(Self::Fail(ServerDhParamsFail::deserialize_bare(buf)?)),
            ServerDhParamsOk::CONSTRUCTOR_ID   => Ok(Self::Ok(ServerDhParamsOk::deserialize_bare(buf)?)),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

impl Serializable for ServerDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        match self {
            Self::Fail(x) => x.serialize(buf),
            Self::Ok(x)   => x.serialize(buf),
        }
    }
}

/// Boxed `Set_client_DH_params_answer`.
#[derive(Clone, Debug, PartialEq)]
pub enum SetClientDhParamsAnswer {
    /// `dh_gen_ok`
    DhGenOk(DhGenOk),
    /// `dh_gen_retry`
    DhGenRetry(DhGenRetry),
    /// `dh_gen_fail`
    DhGenFail(DhGenFail),
}

impl Deserializable for SetClientDhParamsAnswer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            DhGenOk::CONSTRUCTOR_ID    => Ok(Self::DhGenOk(DhGenOk::deserialize_bare(buf)?)),
            DhGenRetry::CONSTRUCTOR_ID => Ok(Self::DhGenRetry(DhGenRetry::deserialize_bare(buf)?)),
            DhGenFail::CONSTRUCTOR_ID  => Ok(Self::DhGenFail(DhGenFail::deserialize_bare(buf)?)),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

impl Serializable for SetClientDhParamsAnswer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        match self {
            Self::DhGenOk(x)    => x.serialize(buf),
            Self::DhGenRetry(x) => x.serialize(buf),
            Self::DhGenFail(x)  => x.serialize(buf),
        }
    }
}

impl RemoteCall for ReqPqMulti { type Return = ResPq; }
impl RemoteCall for ReqDhParams { type Return = ServerDhParams; }
impl RemoteCall for SetClientDhParams { type Return = SetClientDhParamsAnswer; }

// ─── Service messages ────────────────────────────────────────────────────────

tl_struct! {
    /// `ping_delay_disconnect`
    PingDelayDisconnect = 0xf3427b8c { ping_id: i64, disconnect_delay: i32 }
}

tl_struct! {
    /// `pong`
    Pong = 0x347773c5 { msg_id: i64, ping_id: i64 }
}

tl_struct! {
    /// `msgs_ack`
    MsgsAck = 0x62d6b459 { msg_ids: Vec<i64> }
}

tl_struct! {
    /// `bad_msg_notification`
    BadMsgNotification = 0xa7eff811 { bad_msg_id: i64, bad_msg_seqno: i32, error_code: i32 }
}

tl_struct! {
    /// `bad_server_salt`
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

tl_struct! {
    /// `new_session_created`
    NewSessionCreated = 0x9ec20908 { first_msg_id: i64, unique_id: i64, server_salt: i64 }
}

tl_struct! {
    /// `rpc_error`
    RpcError = 0x2144ca19 { error_code: i32, error_message: String }
}

tl_struct! {
    /// `updates.getState`
    GetState = 0xedd4882a {}
}

impl RemoteCall for PingDelayDisconnect { type Return = Pong; }

/// `rpc_result#f35c6d01 req_msg_id:long result:Object`
pub const RPC_RESULT_ID: u32 = 0xf35c6d01;
/// `msg_container#73f1f8dc messages:vector<%Message>`
pub const MSG_CONTAINER_ID: u32 = 0x73f1f8dc;
/// `gzip_packed#3072cfa1 packed_data:bytes`
pub const GZIP_PACKED_ID: u32 = 0x3072cfa1;
/// `msg_detailed_info#276d3ec6`
pub const MSG_DETAILED_INFO_ID: u32 = 0x276d3ec6;
/// `msg_new_detailed_info#809db6df`
pub const MSG_NEW_DETAILED_INFO_ID: u32 = 0x809db6df;
/// `future_salts#ae500895`
pub const FUTURE_SALTS_ID: u32 = 0xae500895;

/// Constructor IDs of the `Updates` type family.
pub const UPDATES_IDS: &[u32] = &[
    0xe317af7e, // updatesTooLong
    0x313bc7f8, // updateShortMessage
    0x4d6deea5, // updateShortChatMessage
    0x78d4dec1, // updateShort
    0x725b04c3, // updatesCombined
    0x74ae4240, // updates
    0x9015e101, // updateShortSentMessage
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn res_pq_reads_fingerprint_vector() {
        let src = ResPq {
            nonce: [1; 16],
            server_nonce: [2; 16],
            pq: vec![0x17, 0xED, 0x48, 0x94, 0x1A, 0x08, 0xF9, 0x81],
            server_public_key_fingerprints: vec![-3414540481677951611],
        };
        let bytes = src.to_bytes();
        assert_eq!(&bytes[..4], &0x05162463u32.to_le_bytes());
        assert_eq!(ResPq::from_bytes(&bytes).unwrap(), src);
    }

    #[test]
    fn boxed_answer_rejects_unknown_constructor() {
        let bytes = 0xdeadbeefu32.to_le_bytes();
        assert_eq!(
            SetClientDhParamsAnswer::from_bytes(&bytes),
            Err(Error::UnexpectedConstructor { id: 0xdeadbeef })
        );
    }

    #[test]
    fn get_state_is_bare_constructor() {
        assert_eq!(GetState {}.to_bytes(), 0xedd4882au32.to_le_bytes());
    }
}
