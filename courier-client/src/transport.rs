//! Transport Connection: one framed byte stream to one datacenter.
//!
//! A [`Connector`] produces the raw stream (direct TCP or SOCKS5). The
//! [`Connection`] on top writes the framing's init bytes (or the Obfuscated2
//! header), then exchanges whole payloads. It never reconnects; the session
//! owning it decides what to do on failure.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use courier_crypto::obfuscated::ObfuscatedCipher;
use courier_mtproto::transport::{Abridged, Framing, FrameError, Full, Intermediate, PaddedIntermediate, Unpacked};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::errors::TransportError;
use crate::socks5::Socks5Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 16 * 1024;

// ─── TransportKind ────────────────────────────────────────────────────────────

/// Which MTProto transport framing to use for all connections.
///
/// | Variant              | Init bytes   | Notes                          |
/// |----------------------|--------------|--------------------------------|
/// | `Abridged`           | `0xef`       | Default, smallest overhead     |
/// | `Intermediate`       | `0xeeeeeeee` | Better proxy compat            |
/// | `PaddedIntermediate` | `0xdddddddd` | Random 0..15 byte padding      |
/// | `Full`               | none         | Adds seqno + CRC32             |
/// | `Obfuscated`         | random 64B   | AES-256-CTR over the stream    |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// [Abridged]: length prefix is 1 or 4 bytes.
    ///
    /// [Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
    #[default]
    Abridged,
    /// [Intermediate]: 4-byte LE length prefix.
    ///
    /// [Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
    Intermediate,
    /// Intermediate with random trailing padding.
    PaddedIntermediate,
    /// [Full]: 4-byte length + seqno + CRC32.
    ///
    /// [Full]: https://core.telegram.org/mtproto/mtproto-transports#full
    Full,
    /// [Obfuscated2] over one of the tagged framings.
    ///
    /// `secret` is the 16-byte proxy secret, or `None` for keyless obfuscation.
    ///
    /// [Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation
    Obfuscated { framing: ObfuscatedFraming, secret: Option<[u8; 16]> },
}

/// Framings that can run under Obfuscated2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObfuscatedFraming {
    #[default]
    Abridged,
    Intermediate,
    PaddedIntermediate,
}

impl TransportKind {
    fn framing(&self) -> Box<dyn Framing> {
        match self {
            Self::Abridged           => Box::new(Abridged),
            Self::Intermediate       => Box::new(Intermediate),
            Self::PaddedIntermediate => Box::new(PaddedIntermediate),
            Self::Full               => Box::new(Full::default()),
            Self::Obfuscated { framing, .. } => match framing {
                ObfuscatedFraming::Abridged           => Box::new(Abridged),
                ObfuscatedFraming::Intermediate       => Box::new(Intermediate),
                ObfuscatedFraming::PaddedIntermediate => Box::new(PaddedIntermediate),
            },
        }
    }
}

// ─── Connector ────────────────────────────────────────────────────────────────

/// Any bidirectional byte stream a [`Connection`] can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ByteStream for T {}

/// Boxed [`ByteStream`].
pub type BoxStream = Box<dyn ByteStream>;

/// Opens raw streams to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh stream to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxStream, TransportError>;
}

/// Direct TCP, or SOCKS5 when a proxy is configured.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    proxy: Option<Socks5Config>,
}

impl TcpConnector {
    /// Connector that routes through `proxy` if given.
    pub fn new(proxy: Option<Socks5Config>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxStream, TransportError> {
        let target = endpoint.socket_addr();
        let open = async {
            let stream = match &self.proxy {
                Some(proxy) => proxy.connect(target).await?,
                None        => TcpStream::connect(target).await?,
            };
            tune(&stream)?;
            Ok::<BoxStream, TransportError>(Box::new(stream))
        };
        tokio::time::timeout(CONNECT_TIMEOUT, open).await.map_err(|_| TransportError::Timeout)?
    }
}

// Idle NAT mappings drop silent connections; keepalive keeps them open
// between pings.
fn tune(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

// ─── Connection ───────────────────────────────────────────────────────────────

/// A framed (and optionally obfuscated) stream to one endpoint.
pub struct Connection {
    stream:   BoxStream,
    framing:  Box<dyn Framing>,
    cipher:   Option<ObfuscatedCipher>,
    rbuf:     Vec<u8>,
    wbuf:     Vec<u8>,
    endpoint: Endpoint,
}

impl Connection {
    /// Connect through `connector` and send the transport preamble.
    pub async fn open(
        connector: &dyn Connector,
        endpoint:  &Endpoint,
        kind:      &TransportKind,
    ) -> Result<Self, TransportError> {
        let stream = connector.connect(endpoint).await?;
        Self::start(stream, endpoint.clone(), kind).await
    }

    /// Send the transport preamble on an already open stream.
    pub async fn start(mut stream: BoxStream, endpoint: Endpoint, kind: &TransportKind) -> Result<Self, TransportError> {
        let framing = kind.framing();
        let cipher = match (kind, framing.obfuscation_tag()) {
            (TransportKind::Obfuscated { secret, .. }, Some(tag)) => {
                let (cipher, header) = ObfuscatedCipher::new(tag, secret.as_ref())
                    .map_err(|e| io::Error::other(e.to_string()))?;
                stream.write_all(&header).await?;
                Some(cipher)
            }
            _ => {
                let init = framing.init_bytes();
                if !init.is_empty() {
                    stream.write_all(init).await?;
                }
                None
            }
        };
        stream.flush().await?;
        tracing::debug!("[courier] transport to {endpoint} ready");

        Ok(Self { stream, framing, cipher, rbuf: Vec::new(), wbuf: Vec::new(), endpoint })
    }

    /// The endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint { &self.endpoint }

    /// Frame and send one payload.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.wbuf.clear();
        self.framing.pack(payload, &mut self.wbuf);
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt(&mut self.wbuf);
        }
        self.stream.write_all(&self.wbuf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one payload.
    ///
    /// Cancel-safe: bytes read before the future is dropped stay buffered
    /// for the next call.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.framing.unpack(&self.rbuf) {
                Ok(Unpacked { consumed, payload }) => {
                    self.rbuf.drain(..consumed);
                    return Ok(payload);
                }
                Err(FrameError::Incomplete { .. }) => {}
                Err(FrameError::Status { code, consumed }) => {
                    self.rbuf.drain(..consumed);
                    return Err(TransportError::Server { code });
                }
                Err(e) => return Err(e.into()),
            }

            let start = self.rbuf.len();
            self.rbuf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.rbuf).await?;
            if n == 0 {
                return Err(TransportError::Eof);
            }
            if let Some(cipher) = &mut self.cipher {
                cipher.decrypt(&mut self.rbuf[start..]);
            }
        }
    }

    /// Shut the write side down. Errors are ignored; the stream is dropped anyway.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        crate::endpoint::DcTable::default().resolve(2, false).unwrap()
    }

    #[tokio::test]
    async fn preamble_matches_framing() {
        for (kind, expected) in [
            (TransportKind::Abridged, vec![0xef]),
            (TransportKind::Intermediate, vec![0xee; 4]),
            (TransportKind::PaddedIntermediate, vec![0xdd; 4]),
        ] {
            let (client, mut server) = tokio::io::duplex(1024);
            let _conn = Connection::start(Box::new(client), endpoint(), &kind).await.unwrap();
            let mut got = vec![0u8; expected.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn obfuscated_header_is_64_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let kind = TransportKind::Obfuscated { framing: ObfuscatedFraming::Intermediate, secret: None };
        let _conn = Connection::start(Box::new(client), endpoint(), &kind).await.unwrap();
        let mut header = [0u8; 64];
        server.read_exact(&mut header).await.unwrap();
        assert_ne!(header[0], 0xef);
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::start(Box::new(client), endpoint(), &TransportKind::Intermediate).await.unwrap();

        let mut wire = 8u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        server.write_all(&wire[..6]).await.unwrap();
        let reader = tokio::spawn(async move { conn.recv().await.map(|p| (p, conn)) });
        tokio::task::yield_now().await;
        server.write_all(&wire[6..]).await.unwrap();

        let (payload, _) = reader.await.unwrap().unwrap();
        assert_eq!(payload, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn negative_status_surfaces_as_server_error() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::start(Box::new(client), endpoint(), &TransportKind::Abridged).await.unwrap();
        let mut wire = vec![1u8];
        wire.extend((-404i32).to_le_bytes());
        server.write_all(&wire).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(err.is_stale_key());
    }

    #[tokio::test]
    async fn peer_hangup_is_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::start(Box::new(client), endpoint(), &TransportKind::Abridged).await.unwrap();
        drop(server);
        assert!(matches!(conn.recv().await, Err(TransportError::Eof)));
    }

    #[tokio::test]
    async fn sent_payload_is_framed() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::start(Box::new(client), endpoint(), &TransportKind::Full).await.unwrap();
        conn.send(&[9; 8]).await.unwrap();

        let mut wire = vec![0u8; 20];
        server.read_exact(&mut wire).await.unwrap();
        let got = Full::default().unpack(&wire).unwrap();
        assert_eq!(got.payload, [9; 8]);
    }
}
