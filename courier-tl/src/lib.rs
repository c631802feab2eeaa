//! Minimal TL runtime for the courier MTProto stack.
//!
//! Application payloads travel through courier as opaque byte buffers, so
//! this crate only carries:
//!
//! | Module          | Contents                                                  |
//! |-----------------|-----------------------------------------------------------|
//! | [`serialize`]   | [`Serializable`] and the TL primitive encodings           |
//! | [`deserialize`] | [`Deserializable`], [`Cursor`] and primitive decodings    |
//! | [`mtproto`]     | Service constructors spoken by the protocol layer itself  |
//!
//! ```rust
//! use courier_tl::{Serializable, mtproto::ReqPqMulti};
//!
//! let bytes = ReqPqMulti { nonce: [7u8; 16] }.to_bytes();
//! assert_eq!(&bytes[..4], &0xbe7e8ef1u32.to_le_bytes());
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod mtproto;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Constructor ID of the boxed `Vector` type.
pub const VECTOR_ID: u32 = 0x1cb5c415;

/// Every service constructor has a unique 32-bit ID.
pub trait Identifiable {
    /// The constructor ID as listed in the MTProto schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a request the client can send; `Return` is the decoded answer.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}

/// Opaque payload passed through without interpretation.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

impl Serializable for Blob {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.0.iter().copied());
    }
}
