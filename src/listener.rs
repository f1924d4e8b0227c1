//! Listening sockets and accepted connections.
//!
//! One factory over two transports: network (`host:port`) and Unix-domain
//! (a filesystem path). Binding yields a [`Listener`]; accepting yields a
//! [`Conn`], a plain bidirectional byte stream, plus the [`Peer`] it came
//! from. Everything downstream (PROXY decode, HTTP) works against the byte
//! stream and never cares which transport produced it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::config::Transport;
use crate::error::{Error, Result};

/// A bound, listening socket. Yields connections until dropped.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Binds the configured transport.
    ///
    /// Failure here is fatal: a server that cannot listen has nothing else
    /// to do. For Unix sockets, a stale socket file left by a previous run
    /// is removed before binding, and the fresh socket file is restricted
    /// to owner and group so it is not world-connectable.
    pub async fn bind(transport: &Transport) -> Result<Self> {
        match transport {
            Transport::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|source| {
                    Error::Listen { addr: addr.clone(), source }
                })?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            Transport::Unix(path) => {
                use std::os::unix::fs::PermissionsExt;

                let addr = path.display().to_string();
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %addr, "removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(Error::Listen { addr, source }),
                }
                let listener = UnixListener::bind(path)
                    .map_err(|source| Error::Listen { addr: addr.clone(), source })?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))
                    .map_err(|source| Error::Listen { addr, source })?;
                Ok(Self::Unix(listener))
            }
        }
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> io::Result<(Conn, Peer)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Conn::Tcp(stream), Peer::Tcp(peer)))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Conn::Unix(stream), Peer::Unix))
            }
        }
    }

    /// The address actually bound, for network transports. This is how an
    /// ephemeral-port bind (`:0`) reports the port it got.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }
}

/// An accepted connection, independent of the transport that produced it.
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Conn::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Conn::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Conn::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Conn::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Conn::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Conn::Tcp(stream) => stream.is_write_vectored(),
            #[cfg(unix)]
            Conn::Unix(stream) => stream.is_write_vectored(),
        }
    }
}

/// The socket-level identity of the far end of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    Tcp(SocketAddr),
    /// Unix-domain peers are usually unnamed; the transport is the identity.
    #[cfg(unix)]
    Unix,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Peer::Unix => f.write_str("uds"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn unix_bind_replaces_stale_socket_and_restricts_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tsuka.sock");
        std::fs::write(&path, "stale").unwrap();

        let listener = Listener::bind(&Transport::Unix(path.clone())).await.unwrap();
        assert!(listener.local_addr().is_none());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770, "socket file must not be world-accessible");

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, Peer::Unix);

        client.write_all(b"hi").await.unwrap();
        let mut got = [0u8; 2];
        conn.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");
    }

    #[tokio::test]
    async fn tcp_bind_reports_the_ephemeral_port() {
        let listener = Listener::bind(&Transport::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
