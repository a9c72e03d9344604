//! Per-protocol upstream handshakes.
//!
//! Dials one chained-proxy candidate (TCP, plus a TLS client handshake when
//! the hop requires encryption) and negotiates the hop's wire protocol:
//! hand-rolled HTTP CONNECT, hand-rolled SOCKS4 connect command, or SOCKS5
//! through tokio-socks (method selection and username/password
//! subnegotiation included). Every failure maps into the error taxonomy the
//! fallback loop recovers from.

use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use http::header::HeaderValue;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::proxy::chain::ChainedProxySpec;

/// Stream flowing toward an upstream hop, whatever transport it rides on
pub trait ChainStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChainStream for T {}

/// Boxed upstream stream
pub type BoxedChainStream = Box<dyn ChainStream>;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// TLS client config for encrypted hops, verified against the web PKI
fn hop_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// Dial a candidate: TCP connect plus the hop's TLS handshake when required.
///
/// No chain handshake runs here; the caller decides whether the hop needs
/// one (HTTP hops forwarding plain requests do not).
pub(crate) async fn dial_candidate(spec: &ChainedProxySpec) -> Result<BoxedChainStream> {
    debug!("Connecting to {} proxy at {}", spec.protocol, spec.address);

    let stream = TcpStream::connect(&spec.address).await.map_err(|e| {
        ProxyError::UpstreamConnectFailure(format!(
            "TCP connect to {} failed: {}",
            spec.address, e
        ))
    })?;

    if !spec.requires_encryption {
        return Ok(Box::new(stream));
    }

    let name = ServerName::try_from(spec.host().to_string()).map_err(|_| {
        ProxyError::UpstreamConnectFailure(format!("invalid TLS server name '{}'", spec.host()))
    })?;
    let tls = TlsConnector::from(hop_tls_config())
        .connect(name, stream)
        .await
        .map_err(|e| {
            ProxyError::UpstreamConnectFailure(format!(
                "TLS handshake with {} failed: {}",
                spec.address, e
            ))
        })?;

    debug!("Encrypted hop to {} established", spec.address);
    Ok(Box::new(tls))
}

/// Run an HTTP CONNECT handshake on an established hop stream.
///
/// `authorization` is the exact `Proxy-Authorization` value the hop should
/// see, already decided by the header policy. Returns any bytes the proxy
/// sent past the end of its response headers; they belong to the tunnel and
/// must be replayed to the reader (see [`with_prefix`]).
pub(crate) async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    authorization: Option<&HeaderValue>,
) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let authority = format_connect_authority(host, port);
    let mut head = Vec::with_capacity(128);
    head.extend_from_slice(
        format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority).as_bytes(),
    );
    if let Some(value) = authorization {
        head.extend_from_slice(b"Proxy-Authorization: ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    stream.write_all(&head).await.map_err(|e| {
        ProxyError::UpstreamConnectFailure(format!("failed to send CONNECT: {}", e))
    })?;

    // Read to the end of the response headers; the proxy may deliver them in
    // arbitrarily small pieces.
    let mut response = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let headers_end = loop {
        let n = stream.read(&mut chunk).await.map_err(|e| {
            ProxyError::UpstreamConnectFailure(format!("failed to read CONNECT response: {}", e))
        })?;
        if n == 0 {
            return Err(ProxyError::UpstreamProtocolError(
                "connection closed during CONNECT handshake".to_string(),
            ));
        }
        let scan_from = response.len().saturating_sub(3);
        response.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_headers_end(&response[scan_from..]) {
            break scan_from + pos;
        }
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(ProxyError::UpstreamProtocolError(
                "oversized CONNECT response".to_string(),
            ));
        }
    };

    let status_line = response[..headers_end]
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            ProxyError::UpstreamProtocolError(format!("bad CONNECT status line: {}", status_line))
        })?;

    match status {
        200..=299 => {
            debug!("HTTP CONNECT tunnel to {} established", authority);
            Ok(Bytes::copy_from_slice(&response[headers_end..]))
        }
        407 => Err(ProxyError::UpstreamAuthenticationFailed(status_line)),
        _ => Err(ProxyError::UpstreamProtocolError(format!(
            "CONNECT failed: {}",
            status_line
        ))),
    }
}

/// Byte offset just past the first `\r\n\r\n`, if present
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Run a SOCKS4 connect command on an established hop stream.
///
/// SOCKS4 carries no authentication subnegotiation; the optional userid
/// rides in the connect request itself. The destination must already be
/// resolved to IPv4.
pub(crate) async fn socks4_connect<S>(
    mut stream: S,
    dest: SocketAddrV4,
    userid: Option<&str>,
) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request = Vec::with_capacity(16);
    request.push(0x04); // VN
    request.push(0x01); // CD = CONNECT
    request.extend_from_slice(&dest.port().to_be_bytes());
    request.extend_from_slice(&dest.ip().octets());
    if let Some(userid) = userid {
        request.extend_from_slice(userid.as_bytes());
    }
    request.push(0x00);

    stream.write_all(&request).await.map_err(|e| {
        ProxyError::UpstreamConnectFailure(format!("failed to send SOCKS4 connect: {}", e))
    })?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(|e| {
        ProxyError::UpstreamConnectFailure(format!("failed to read SOCKS4 reply: {}", e))
    })?;

    if reply[0] != 0x00 {
        return Err(ProxyError::UpstreamProtocolError(format!(
            "bad SOCKS4 reply version {}",
            reply[0]
        )));
    }
    match reply[1] {
        0x5a => {
            debug!("SOCKS4 connection to {} established", dest);
            Ok(stream)
        }
        code @ 0x5b..=0x5d => Err(ProxyError::UpstreamConnectFailure(format!(
            "SOCKS4 connect rejected (code {:#04x})",
            code
        ))),
        code => Err(ProxyError::UpstreamProtocolError(format!(
            "unexpected SOCKS4 reply code {:#04x}",
            code
        ))),
    }
}

/// Run a SOCKS5 negotiation on an established hop stream.
///
/// With credentials configured the method list offers NO_AUTH and PASSWORD
/// and the username/password subnegotiation must succeed; without them only
/// NO_AUTH is attempted. The destination hostname is resolved remotely by
/// the proxy.
pub(crate) async fn socks5_connect(
    stream: BoxedChainStream,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<BoxedChainStream> {
    let target = (host, port);
    let connected = match credentials {
        Some((username, password)) => {
            Socks5Stream::connect_with_password_and_socket(stream, target, username, password)
                .await
        }
        None => Socks5Stream::connect_with_socket(stream, target).await,
    }
    .map_err(|e| ProxyError::UpstreamConnectFailure(format!("SOCKS5 connect failed: {}", e)))?;

    debug!("SOCKS5 connection to {}:{} established", host, port);
    Ok(Box::new(connected))
}

/// Bracket IPv6 literals for the CONNECT authority form
pub(crate) fn format_connect_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Replay `prefix` before reading from `inner`.
///
/// Used when a CONNECT response carried tunnel bytes past its headers.
pub(crate) fn with_prefix(inner: BoxedChainStream, prefix: Bytes) -> BoxedChainStream {
    if prefix.is_empty() {
        inner
    } else {
        Box::new(Prefixed { prefix, inner })
    }
}

struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
