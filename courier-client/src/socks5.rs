//! SOCKS5 tunnelling for datacenter connections.
//!
//! ```rust,no_run
//! use courier_client::{Config, Socks5Config};
//!
//! let cfg = Config::default().with_proxy(Socks5Config::new("127.0.0.1:1080").with_login("user", "secret"));
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::errors::TransportError;

/// Username/password sub-negotiation (RFC 1929).
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyLogin {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyLogin").field("username", &self.username).field("password", &"<redacted>").finish()
    }
}

/// Where to find the proxy and how to log in to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socks5Config {
    /// `host:port` of the proxy.
    pub proxy_addr: String,
    pub login:      Option<ProxyLogin>,
}

impl Socks5Config {
    /// An anonymous proxy.
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self { proxy_addr: proxy_addr.into(), login: None }
    }

    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(ProxyLogin { username: username.into(), password: password.into() });
        self
    }

    /// Open a TCP stream to `target` through the proxy.
    ///
    /// Failing to reach the proxy is an I/O error; a refusal by the proxy
    /// itself is [`TransportError::Proxy`].
    pub async fn connect(&self, target: SocketAddr) -> Result<TcpStream, TransportError> {
        tracing::debug!("[courier] tunnelling to {target} via {}", self.proxy_addr);
        let proxy = self.proxy_addr.as_str();
        let tunnel = match &self.login {
            None => Socks5Stream::connect(proxy, target).await,
            Some(l) => Socks5Stream::connect_with_password(proxy, target, &l.username, &l.password).await,
        };
        match tunnel {
            Ok(stream) => Ok(stream.into_inner()),
            Err(tokio_socks::Error::Io(e)) => Err(e.into()),
            // tokio-socks folds a failed TCP connect to the proxy into this variant
            Err(tokio_socks::Error::ProxyServerUnreachable) => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy {} unreachable", self.proxy_addr),
            )
            .into()),
            Err(e) => Err(TransportError::Proxy(format!("{}: {e}", self.proxy_addr))),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn debug_hides_the_password() {
        let cfg = Socks5Config::new("10.0.0.1:1080").with_login("alice", "hunter2");
        let shown = format!("{cfg:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn refused_method_is_a_proxy_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            // no acceptable authentication method
            sock.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let err = Socks5Config::new(addr.to_string())
            .connect("149.154.167.51:443".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Proxy(_)), "{err}");
    }

    #[tokio::test]
    async fn unreachable_proxy_is_an_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Socks5Config::new(addr.to_string())
            .connect("149.154.167.51:443".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(&err, TransportError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused), "{err}");
    }
}
