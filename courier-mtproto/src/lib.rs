//! Sans-IO MTProto 2.0 building blocks for courier.
//!
//! This crate handles:
//! * Message ids ([`MessageSequencer`]) and the plaintext envelope
//! * Stream framings (abridged, intermediate, padded, full)
//! * Encrypted sessions ([`EncryptedSession`]) and inbound envelope decoding
//! * The DH auth key exchange ([`authentication`])
//!
//! Nothing here touches a socket; the client crate drives these types over
//! whatever stream it has.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod encrypted;
pub mod envelope;
pub mod message;
pub mod transport;

pub use encrypted::EncryptedSession;
pub use envelope::{Envelope, Inbound, RpcOutcome};
pub use message::{Clock, MessageId, MessageSequencer, SystemClock};
pub use transport::{FrameError, Framing, Unpacked};
