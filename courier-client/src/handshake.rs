//! Async driver for the auth key exchange.
//!
//! The cryptographic checks live in [`courier_mtproto::authentication`];
//! this module only moves its messages over a [`Connection`] as plaintext
//! envelopes. [`Handshaker`] is a trait so sessions can be exercised against
//! an in-process server that hands out fixed keys.

use std::time::Duration;

use async_trait::async_trait;
use courier_crypto::AuthKey;
use courier_mtproto::MessageSequencer;
use courier_mtproto::authentication as auth;
use courier_mtproto::message::{parse_plaintext, to_plaintext_bytes};
use courier_tl::mtproto::{ResPq, ServerDhParams, SetClientDhParamsAnswer};
use courier_tl::{Deserializable, Serializable};

use crate::endpoint::Endpoint;
use crate::errors::HandshakeError;
use crate::transport::Connection;

/// Upper bound on one complete exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// What a successful exchange yields.
#[derive(Clone, Debug, PartialEq)]
pub struct Negotiated {
    /// The new authorization key.
    pub auth_key:    AuthKey,
    /// Initial server salt.
    pub first_salt:  i64,
    /// Server time minus local time, in seconds.
    pub time_offset: i32,
}

impl From<auth::Finished> for Negotiated {
    fn from(f: auth::Finished) -> Self {
        Self { auth_key: f.auth_key, first_salt: f.first_salt, time_offset: f.time_offset }
    }
}

/// Negotiates an auth key over a freshly opened connection.
#[async_trait]
pub trait Handshaker: Send + Sync {
    /// Run the exchange. Never retried by the caller.
    async fn negotiate(
        &self,
        conn:      &mut Connection,
        endpoint:  &Endpoint,
        sequencer: &MessageSequencer,
    ) -> Result<Negotiated, HandshakeError>;
}

/// The real Diffie–Hellman exchange.
#[derive(Clone, Copy, Debug, Default)]
pub struct DhHandshake;

#[async_trait]
impl Handshaker for DhHandshake {
    async fn negotiate(
        &self,
        conn:      &mut Connection,
        endpoint:  &Endpoint,
        sequencer: &MessageSequencer,
    ) -> Result<Negotiated, HandshakeError> {
        tracing::info!("[courier] negotiating auth key with {endpoint}");

        let (req, s1) = auth::step1()?;
        let res_pq: ResPq = exchange(conn, sequencer, &req).await?;

        let (req, s2) = auth::step2(s1, res_pq, endpoint.handshake_dc_id())?;
        let dh_params: ServerDhParams = exchange(conn, sequencer, &req).await?;

        let (req, s3) = auth::step3(s2, dh_params)?;
        let answer: SetClientDhParamsAnswer = exchange(conn, sequencer, &req).await?;

        let done = auth::finish(s3, answer)?;
        tracing::info!("[courier] auth key {:?} ready for {endpoint}", done.auth_key);
        Ok(done.into())
    }
}

async fn exchange<R: Deserializable>(
    conn:      &mut Connection,
    sequencer: &MessageSequencer,
    request:   &impl Serializable,
) -> Result<R, HandshakeError> {
    conn.send(&to_plaintext_bytes(sequencer.next(), &request.to_bytes())).await?;
    let frame = conn.recv().await?;
    let (_, body) = parse_plaintext(&frame)?;
    Ok(R::from_bytes(body)?)
}

/// Run `handshaker` bounded by [`HANDSHAKE_TIMEOUT`].
pub(crate) async fn negotiate_bounded(
    handshaker: &dyn Handshaker,
    conn:       &mut Connection,
    endpoint:   &Endpoint,
    sequencer:  &MessageSequencer,
) -> Result<Negotiated, HandshakeError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshaker.negotiate(conn, endpoint, sequencer))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}
