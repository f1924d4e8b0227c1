//! PROXY protocol support.
//!
//! An intermediary such as HAProxy can prepend a preamble to each forwarded
//! connection carrying the original client address: v1 is a single
//! CRLF-terminated text line, v2 a binary header behind a 12-byte signature.
//! [`ProxyStream`] strips that preamble from the byte stream before the HTTP
//! layer ever reads it, and republishes the declared source address through
//! [`RemoteAddr`].
//!
//! The decode is lazy. Nothing is read at accept time; the first
//! `poll_read` on the wrapped connection buffers bytes until a verdict is
//! reached, then replays whatever arrived beyond the preamble. Connections
//! that are accepted but never read never pay for a decode. Each connection
//! is decoded at most once.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::listener::Peer;

/// Why a PROXY preamble failed to parse.
///
/// Connection-scoped: a parse failure terminates (or, in permissive mode,
/// demotes) the one connection that sent it and never affects its siblings.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProxyParseError {
    /// The leading bytes match neither the v1 nor the v2 signature.
    #[error("no PROXY protocol signature")]
    NoSignature,

    /// A signature matched but the rest of the header is broken: bad
    /// address, bad port, missing fields, impossible length.
    #[error("malformed PROXY protocol header")]
    Malformed,

    /// A v2 header declared a protocol version other than 2.
    #[error("unsupported PROXY protocol version {0}")]
    Version(u8),

    /// The header declared an address family this server does not carry
    /// (v2 `AF_UNIX`, unknown v1 family tokens).
    #[error("unsupported PROXY protocol address family {0}")]
    UnsupportedFamily(String),
}

// ── Header parsing ────────────────────────────────────────────────────────────

const V1_SIG: &[u8] = b"PROXY ";
const V2_SIG: &[u8] = &[
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// A v1 line is at most 107 bytes including its CRLF.
const V1_MAX: usize = 107;

/// A fully parsed preamble: the bytes it occupied and the source address it
/// declared. `PROXY UNKNOWN` and v2 `LOCAL`/`UNSPEC` carry no address.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub len: usize,
    pub source: Option<SocketAddr>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Parse {
    /// Not enough bytes to reach a verdict yet.
    Incomplete,
    Done(Header),
}

/// Inspects the leading bytes of a connection for a PROXY preamble.
///
/// Pure: consumes nothing. The caller discards `Header::len` bytes on
/// success. `Incomplete` is returned only while the bytes seen so far are
/// still a prefix of a valid header, so a non-PROXY client is rejected as
/// soon as its first byte diverges from both signatures.
pub(crate) fn parse_header(buf: &[u8]) -> Result<Parse, ProxyParseError> {
    if buf.starts_with(V2_SIG) {
        return parse_v2(buf);
    }
    if V2_SIG.starts_with(buf) {
        return Ok(Parse::Incomplete);
    }
    if buf.starts_with(V1_SIG) {
        return parse_v1(buf);
    }
    if V1_SIG.starts_with(buf) {
        return Ok(Parse::Incomplete);
    }
    Err(ProxyParseError::NoSignature)
}

fn parse_v1(buf: &[u8]) -> Result<Parse, ProxyParseError> {
    let crlf = buf
        .windows(2)
        .take(V1_MAX - 1)
        .position(|w| w == b"\r\n");
    let line_end = match crlf {
        Some(i) => i,
        None if buf.len() >= V1_MAX => return Err(ProxyParseError::Malformed),
        None => return Ok(Parse::Incomplete),
    };
    let len = line_end + 2;

    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| ProxyParseError::Malformed)?;
    let mut fields = line.split(' ');
    fields.next(); // "PROXY", guaranteed by the signature match

    let family = fields.next().ok_or(ProxyParseError::Malformed)?;
    match family {
        "TCP4" | "TCP6" => {}
        // The protocol obliges receivers to accept UNKNOWN and ignore the
        // rest of the line; the socket address stays authoritative.
        "UNKNOWN" => return Ok(Parse::Done(Header { len, source: None })),
        other => return Err(ProxyParseError::UnsupportedFamily(other.to_string())),
    }

    let src_ip = fields.next().ok_or(ProxyParseError::Malformed)?;
    let dst_ip = fields.next().ok_or(ProxyParseError::Malformed)?;
    let src_port = fields.next().ok_or(ProxyParseError::Malformed)?;
    let dst_port = fields.next().ok_or(ProxyParseError::Malformed)?;
    if fields.next().is_some() {
        return Err(ProxyParseError::Malformed);
    }

    let src_port: u16 = src_port.parse().map_err(|_| ProxyParseError::Malformed)?;
    let _: u16 = dst_port.parse().map_err(|_| ProxyParseError::Malformed)?;

    let source = if family == "TCP4" {
        let src: Ipv4Addr = src_ip.parse().map_err(|_| ProxyParseError::Malformed)?;
        let _: Ipv4Addr = dst_ip.parse().map_err(|_| ProxyParseError::Malformed)?;
        SocketAddr::new(IpAddr::V4(src), src_port)
    } else {
        let src: Ipv6Addr = src_ip.parse().map_err(|_| ProxyParseError::Malformed)?;
        let _: Ipv6Addr = dst_ip.parse().map_err(|_| ProxyParseError::Malformed)?;
        SocketAddr::new(IpAddr::V6(src), src_port)
    };
    Ok(Parse::Done(Header { len, source: Some(source) }))
}

fn parse_v2(buf: &[u8]) -> Result<Parse, ProxyParseError> {
    if buf.len() < 16 {
        return Ok(Parse::Incomplete);
    }

    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 2 {
        return Err(ProxyParseError::Version(ver_cmd >> 4));
    }
    let family = buf[13];
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let total = 16 + addr_len;
    if buf.len() < total {
        return Ok(Parse::Incomplete);
    }

    let source = match ver_cmd & 0x0f {
        // LOCAL: health checks from the proxy itself. The address block, if
        // any, is skipped and the socket address stays authoritative.
        0x0 => None,
        0x1 => match family >> 4 {
            0x0 => None, // AF_UNSPEC
            0x1 => {
                // AF_INET: src4 dst4 srcport dstport
                if addr_len < 12 {
                    return Err(ProxyParseError::Malformed);
                }
                let a = &buf[16..];
                let src = Ipv4Addr::new(a[0], a[1], a[2], a[3]);
                let port = u16::from_be_bytes([a[8], a[9]]);
                Some(SocketAddr::new(IpAddr::V4(src), port))
            }
            0x2 => {
                // AF_INET6: src16 dst16 srcport dstport
                if addr_len < 36 {
                    return Err(ProxyParseError::Malformed);
                }
                let a = &buf[16..];
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&a[..16]);
                let port = u16::from_be_bytes([a[32], a[33]]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => {
                return Err(ProxyParseError::UnsupportedFamily(format!("{other:#x}")));
            }
        },
        _ => return Err(ProxyParseError::Malformed),
    };
    Ok(Parse::Done(Header { len: total, source }))
}

// ── RemoteAddr ────────────────────────────────────────────────────────────────

/// The client address a connection reports.
///
/// Starts out as the socket peer. A successful PROXY decode records the
/// declared source address, which permanently replaces the peer for the
/// remainder of the connection. Clones share the same record, so a handle
/// captured at accept time observes the address decoded later.
#[derive(Clone, Debug)]
pub struct RemoteAddr {
    socket: Peer,
    declared: Arc<OnceLock<SocketAddr>>,
}

impl RemoteAddr {
    pub fn new(socket: Peer) -> Self {
        Self { socket, declared: Arc::new(OnceLock::new()) }
    }

    /// The address requests on this connection are attributed to: the
    /// PROXY-declared source if one was decoded, the socket peer otherwise.
    pub fn client(&self) -> Peer {
        match self.declared.get() {
            Some(addr) => Peer::Tcp(*addr),
            None => self.socket.clone(),
        }
    }

    fn record(&self, addr: SocketAddr) {
        let _ = self.declared.set(addr);
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.client())
    }
}

// ── ProxyStream ───────────────────────────────────────────────────────────────

/// How [`ProxyStream`] treats the leading bytes of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    /// No decode attempt; reads pass straight through.
    Disabled,
    /// Expect a preamble; when it is absent or malformed, replay the bytes
    /// as opaque request data.
    Permissive,
    /// Expect a preamble; when it is absent or malformed, fail the read and
    /// let the connection die.
    Strict,
}

impl ProxyMode {
    /// Resolves the two configuration flags into a mode.
    pub fn from_flags(enabled: bool, strict: bool) -> Self {
        match (enabled, strict) {
            (false, _) => Self::Disabled,
            (true, false) => Self::Permissive,
            (true, true) => Self::Strict,
        }
    }
}

enum State {
    /// Accumulating leading bytes; no verdict yet.
    Detecting(BytesMut),
    /// Verdict reached; drain these bytes before touching the socket again.
    Buffered(BytesMut),
    /// Reads go straight to the inner stream.
    Pass,
}

/// Connection decorator that strips a PROXY preamble.
///
/// A layered adapter: it satisfies the same `AsyncRead + AsyncWrite`
/// contract as the stream it wraps, so the HTTP layer (or any further
/// wrapper) is none the wiser. Writes always pass straight through; only
/// the read side carries state.
pub struct ProxyStream<S> {
    inner: S,
    remote: RemoteAddr,
    mode: ProxyMode,
    state: State,
}

impl<S> ProxyStream<S> {
    pub fn new(inner: S, remote: RemoteAddr, mode: ProxyMode) -> Self {
        let state = match mode {
            ProxyMode::Disabled => State::Pass,
            ProxyMode::Permissive | ProxyMode::Strict => {
                State::Detecting(BytesMut::with_capacity(256))
            }
        };
        Self { inner, remote, mode, state }
    }

    /// Handle to the connection's observable client address.
    pub fn remote(&self) -> &RemoteAddr {
        &self.remote
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Pass => return Pin::new(&mut this.inner).poll_read(cx, buf),

                State::Buffered(rest) => {
                    if rest.is_empty() {
                        this.state = State::Pass;
                        continue;
                    }
                    let n = rest.len().min(buf.remaining());
                    buf.put_slice(&rest.split_to(n));
                    return Poll::Ready(Ok(()));
                }

                State::Detecting(acc) => match parse_header(acc) {
                    Ok(Parse::Done(header)) => {
                        if let Some(source) = header.source {
                            this.remote.record(source);
                            debug!(%source, "PROXY preamble decoded");
                        }
                        let mut rest = std::mem::take(acc);
                        rest.advance(header.len);
                        this.state = State::Buffered(rest);
                    }

                    Ok(Parse::Incomplete) => {
                        let mut chunk = [0u8; 512];
                        let mut read_buf = ReadBuf::new(&mut chunk);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                                if acc.is_empty() {
                                    // Clean close before a single byte: plain EOF.
                                    this.state = State::Pass;
                                    return Poll::Ready(Ok(()));
                                }
                                // EOF mid-preamble.
                                warn!(
                                    peer = %this.remote,
                                    "connection closed inside PROXY preamble"
                                );
                                if this.mode == ProxyMode::Strict {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        ProxyParseError::Malformed,
                                    )));
                                }
                                let rest = std::mem::take(acc);
                                this.state = State::Buffered(rest);
                            }
                            Poll::Ready(Ok(())) => acc.extend_from_slice(read_buf.filled()),
                        }
                    }

                    Err(err) => {
                        warn!(peer = %this.remote, error = %err, "PROXY preamble rejected");
                        if this.mode == ProxyMode::Strict {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                err,
                            )));
                        }
                        // Permissive: nothing is eaten, the bytes become
                        // ordinary request data.
                        let rest = std::mem::take(acc);
                        this.state = State::Buffered(rest);
                    }
                },
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const V1_LINE: &[u8] = b"PROXY TCP4 203.0.113.5 198.51.100.1 12345 80\r\n";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn peer() -> Peer {
        Peer::Tcp(addr("10.0.0.1:9999"))
    }

    // ── parse_header ──────────────────────────────────────────────────────────

    #[test]
    fn v1_tcp4() {
        let parsed = parse_header(V1_LINE).unwrap();
        assert_eq!(
            parsed,
            Parse::Done(Header { len: V1_LINE.len(), source: Some(addr("203.0.113.5:12345")) })
        );
    }

    #[test]
    fn v1_tcp6() {
        let line = b"PROXY TCP6 2001:db8::1 2001:db8::2 443 80\r\n";
        let parsed = parse_header(line).unwrap();
        assert_eq!(
            parsed,
            Parse::Done(Header { len: line.len(), source: Some(addr("[2001:db8::1]:443")) })
        );
    }

    #[test]
    fn v1_unknown_family_carries_no_address() {
        let line = b"PROXY UNKNOWN ffff::1 ffff::2 1 2\r\n";
        let parsed = parse_header(line).unwrap();
        assert_eq!(parsed, Parse::Done(Header { len: line.len(), source: None }));
    }

    #[test]
    fn v1_unsupported_family() {
        assert_eq!(
            parse_header(b"PROXY TCP5 1.2.3.4 5.6.7.8 1 2\r\n"),
            Err(ProxyParseError::UnsupportedFamily("TCP5".to_string()))
        );
    }

    #[test]
    fn v1_bad_port_is_malformed() {
        assert_eq!(
            parse_header(b"PROXY TCP4 1.2.3.4 5.6.7.8 99999 80\r\n"),
            Err(ProxyParseError::Malformed)
        );
    }

    #[test]
    fn v1_missing_fields_is_malformed() {
        assert_eq!(
            parse_header(b"PROXY TCP4 1.2.3.4 5.6.7.8\r\n"),
            Err(ProxyParseError::Malformed)
        );
    }

    #[test]
    fn v1_line_without_crlf_overflows() {
        let mut line = b"PROXY TCP4 ".to_vec();
        line.extend(std::iter::repeat_n(b'1', 120));
        assert_eq!(parse_header(&line), Err(ProxyParseError::Malformed));
    }

    #[test]
    fn signature_prefixes_are_incomplete() {
        assert_eq!(parse_header(b"").unwrap(), Parse::Incomplete);
        assert_eq!(parse_header(b"PROX").unwrap(), Parse::Incomplete);
        assert_eq!(parse_header(&V2_SIG[..5]).unwrap(), Parse::Incomplete);
        assert_eq!(parse_header(b"PROXY TCP4 203.0").unwrap(), Parse::Incomplete);
    }

    #[test]
    fn non_signature_bytes_are_rejected_immediately() {
        assert_eq!(parse_header(b"G"), Err(ProxyParseError::NoSignature));
        assert_eq!(parse_header(b"GET / HTTP/1.1\r\n"), Err(ProxyParseError::NoSignature));
    }

    fn v2_header(ver_cmd: u8, family: u8, addrs: &[u8]) -> Vec<u8> {
        let mut buf = V2_SIG.to_vec();
        buf.push(ver_cmd);
        buf.push(family);
        buf.extend_from_slice(&(addrs.len() as u16).to_be_bytes());
        buf.extend_from_slice(addrs);
        buf
    }

    #[test]
    fn v2_inet() {
        let mut addrs = Vec::new();
        addrs.extend_from_slice(&[203, 0, 113, 5]); // src
        addrs.extend_from_slice(&[198, 51, 100, 1]); // dst
        addrs.extend_from_slice(&12345u16.to_be_bytes());
        addrs.extend_from_slice(&80u16.to_be_bytes());
        let buf = v2_header(0x21, 0x11, &addrs);

        let parsed = parse_header(&buf).unwrap();
        assert_eq!(
            parsed,
            Parse::Done(Header { len: buf.len(), source: Some(addr("203.0.113.5:12345")) })
        );
    }

    #[test]
    fn v2_inet6() {
        let src = addr("[2001:db8::1]:443");
        let mut addrs = Vec::new();
        match src.ip() {
            IpAddr::V6(ip) => addrs.extend_from_slice(&ip.octets()),
            IpAddr::V4(_) => unreachable!(),
        }
        addrs.extend_from_slice(&[0u8; 16]); // dst
        addrs.extend_from_slice(&443u16.to_be_bytes());
        addrs.extend_from_slice(&80u16.to_be_bytes());
        let buf = v2_header(0x21, 0x21, &addrs);

        let parsed = parse_header(&buf).unwrap();
        assert_eq!(parsed, Parse::Done(Header { len: buf.len(), source: Some(src) }));
    }

    #[test]
    fn v2_local_carries_no_address() {
        let buf = v2_header(0x20, 0x00, &[]);
        let parsed = parse_header(&buf).unwrap();
        assert_eq!(parsed, Parse::Done(Header { len: buf.len(), source: None }));
    }

    #[test]
    fn v2_unix_family_is_unsupported() {
        let buf = v2_header(0x21, 0x31, &[0u8; 216]);
        assert_eq!(
            parse_header(&buf),
            Err(ProxyParseError::UnsupportedFamily("0x3".to_string()))
        );
    }

    #[test]
    fn v2_wrong_version() {
        let buf = v2_header(0x31, 0x11, &[0u8; 12]);
        assert_eq!(parse_header(&buf), Err(ProxyParseError::Version(3)));
    }

    #[test]
    fn v2_truncated_address_block_is_malformed() {
        let buf = v2_header(0x21, 0x11, &[0u8; 4]);
        assert_eq!(parse_header(&buf), Err(ProxyParseError::Malformed));
    }

    // ── ProxyStream ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn strips_preamble_and_overrides_address() {
        let (mut client, server) = tokio::io::duplex(1024);
        let remote = RemoteAddr::new(peer());
        let mut stream = ProxyStream::new(server, remote.clone(), ProxyMode::Permissive);

        client.write_all(V1_LINE).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(remote.client(), Peer::Tcp(addr("203.0.113.5:12345")));
    }

    #[tokio::test]
    async fn reassembles_fragmented_preamble() {
        let (mut client, server) = tokio::io::duplex(16);
        let remote = RemoteAddr::new(peer());
        let mut stream = ProxyStream::new(server, remote.clone(), ProxyMode::Strict);

        let writer = tokio::spawn(async move {
            let mut bytes = V1_LINE.to_vec();
            bytes.extend_from_slice(b"ping");
            for fragment in bytes.chunks(7) {
                client.write_all(fragment).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut got = vec![0u8; 4];
        stream.read_exact(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(&got, b"ping");
        assert_eq!(remote.client(), Peer::Tcp(addr("203.0.113.5:12345")));
    }

    #[tokio::test]
    async fn permissive_replays_non_proxy_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let remote = RemoteAddr::new(peer());
        let mut stream = ProxyStream::new(server, remote.clone(), ProxyMode::Permissive);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"GET / HTTP/1.1\r\n\r\n");
        // No preamble, so the socket peer stands.
        assert_eq!(remote.client(), peer());
    }

    #[tokio::test]
    async fn strict_fails_the_read_on_non_proxy_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = ProxyStream::new(server, RemoteAddr::new(peer()), ProxyMode::Strict);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut got = Vec::new();
        let err = stream.read_to_end(&mut got).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn disabled_mode_passes_preamble_bytes_through() {
        let (mut client, server) = tokio::io::duplex(1024);
        let remote = RemoteAddr::new(peer());
        let mut stream = ProxyStream::new(server, remote.clone(), ProxyMode::Disabled);

        client.write_all(V1_LINE).await.unwrap();
        drop(client);

        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, V1_LINE);
        assert_eq!(remote.client(), peer());
    }
}
