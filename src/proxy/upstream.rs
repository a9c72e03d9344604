//! Server-facing connection: resolution, chained-candidate fallback, and
//! request transmission.
//!
//! One [`ServerConnection`] drives the upstream side of a flow through its
//! states: resolve the destination, walk the ordered candidate list from the
//! chained-proxy manager (TCP connect, optional per-hop TLS, chain
//! handshake, advancing on any failure), then send buffered requests over a
//! hyper client connection and collect the responses.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::filters::{ProxyRequest, ProxyResponse};
use crate::flow::FlowContext;
use crate::proxy::chain::{ChainProtocol, ChainedProxyCandidate};
use crate::proxy::handshake::{self, BoxedChainStream};
use crate::proxy::headers::HopPolicy;
use crate::proxy::ProxyShared;

/// Resolves destination hosts for direct connections
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ProxyError::UnknownHost(format!("{}: {}", host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ProxyError::UnknownHost(host.to_string()));
        }
        Ok(addrs)
    }
}

/// How the established hop stream will be used
pub(crate) enum HopUse {
    /// The stream carries forwarded HTTP requests (an HTTP hop stays in
    /// absolute-form proxy mode; SOCKS hops and direct connections reach the
    /// origin itself)
    Forward,
    /// The stream must end up tunneled through to the destination; HTTP hops
    /// run a CONNECT handshake carrying this `Proxy-Authorization` context
    Tunnel {
        client_authorization: Option<HeaderValue>,
    },
}

/// An established upstream HTTP session for one flow
pub(crate) struct UpstreamSession {
    sender: SendRequest<Full<Bytes>>,
    candidate: ChainedProxyCandidate,
    host: String,
    port: u16,
    absolute_form: bool,
}

impl UpstreamSession {
    pub(crate) fn new(
        sender: SendRequest<Full<Bytes>>,
        candidate: ChainedProxyCandidate,
        host: String,
        port: u16,
        absolute_form: bool,
    ) -> Self {
        Self {
            sender,
            candidate,
            host,
            port,
            absolute_form,
        }
    }

    pub(crate) fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    pub(crate) fn candidate(&self) -> &ChainedProxyCandidate {
        &self.candidate
    }

    /// Probe whether the cached connection can take another request
    pub(crate) async fn is_ready(&mut self) -> bool {
        self.sender.ready().await.is_ok()
    }

    /// The candidate the header policy sees for requests on this session.
    ///
    /// Requests on a tunneled or origin session cross into the origin hop,
    /// not the chained hop the bytes happen to ride through.
    fn policy_candidate(&self) -> ChainedProxyCandidate {
        if self.absolute_form {
            self.candidate.clone()
        } else {
            ChainedProxyCandidate::direct()
        }
    }
}

/// Server-facing half of one flow
pub(crate) struct ServerConnection<'a> {
    shared: &'a ProxyShared,
    flow: &'a FlowContext,
}

impl<'a> ServerConnection<'a> {
    pub(crate) fn new(shared: &'a ProxyShared, flow: &'a FlowContext) -> Self {
        Self { shared, flow }
    }

    /// Walk the candidate list until a hop is established.
    ///
    /// Fallback is strictly sequential; each failed candidate fires its
    /// `connection_failed` hook and the loop advances. If every candidate
    /// fails the whole attempt fails and the origin request is never sent.
    pub(crate) async fn connect(
        &self,
        request: &ProxyRequest,
        host: &str,
        port: u16,
        hop_use: HopUse,
    ) -> Result<(BoxedChainStream, ChainedProxyCandidate)> {
        let candidates = self
            .shared
            .chain
            .lookup(request, self.flow.client_addr())
            .await;
        let total = candidates.len();
        let started = Instant::now();

        let mut attempts: u32 = 0;
        let mut last: Option<ProxyError> = None;

        for candidate in candidates {
            attempts += 1;
            debug!(
                "Attempting {} for {}:{} (attempt {}/{})",
                candidate.label(),
                host,
                port,
                attempts,
                total
            );

            match tokio::time::timeout(
                self.shared.config.connect_timeout,
                self.attempt(&candidate, host, port, &hop_use),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    candidate.notify_succeeded();
                    self.flow.record_timing("connect", started.elapsed());
                    return Ok((stream, candidate));
                }
                Ok(Err(cause)) => {
                    warn!(
                        "Candidate {} failed for {}:{}: {}",
                        candidate.label(),
                        host,
                        port,
                        cause
                    );
                    candidate.notify_failed(&cause);
                    last = Some(cause);
                }
                Err(_) => {
                    let cause = ProxyError::ConnectTimeout;
                    warn!(
                        "Candidate {} timed out for {}:{}",
                        candidate.label(),
                        host,
                        port
                    );
                    candidate.notify_failed(&cause);
                    last = Some(cause);
                }
            }
        }

        match (attempts, last) {
            (_, None) => Err(ProxyError::UpstreamConnectFailure(
                "no upstream candidates".to_string(),
            )),
            (1, Some(cause)) => Err(cause),
            (attempts, Some(cause)) => Err(ProxyError::CandidatesExhausted {
                attempts,
                last: cause.to_string(),
            }),
        }
    }

    /// One candidate: TCP connect, per-hop TLS, chain handshake
    async fn attempt(
        &self,
        candidate: &ChainedProxyCandidate,
        host: &str,
        port: u16,
        hop_use: &HopUse,
    ) -> Result<BoxedChainStream> {
        let Some(spec) = candidate.spec() else {
            return self.connect_direct(host, port).await;
        };

        let mut stream = handshake::dial_candidate(spec).await?;

        match spec.protocol {
            ChainProtocol::Http => {
                if let HopUse::Tunnel {
                    client_authorization,
                } = hop_use
                {
                    let policy = HopPolicy {
                        local_auth_configured: self.shared.authenticator.is_some(),
                        candidate,
                    };
                    let authorization =
                        policy.next_hop_authorization(client_authorization.as_ref());
                    let remainder =
                        handshake::http_connect(&mut stream, host, port, authorization.as_ref())
                            .await?;
                    return Ok(handshake::with_prefix(stream, remainder));
                }
                Ok(stream)
            }
            ChainProtocol::Socks4 => {
                let dest = self.resolve_ipv4(host, port).await?;
                handshake::socks4_connect(stream, dest, spec.username.as_deref()).await
            }
            ChainProtocol::Socks5 => {
                let credentials = spec
                    .username
                    .as_deref()
                    .map(|user| (user, spec.password.as_deref().unwrap_or("")));
                handshake::socks5_connect(stream, host, port, credentials).await
            }
        }
    }

    async fn connect_direct(&self, host: &str, port: u16) -> Result<BoxedChainStream> {
        let started = Instant::now();
        let addrs = self.shared.resolver.resolve(host, port).await?;
        self.flow.record_timing("resolve", started.elapsed());

        let mut last: Option<std::io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(e) => last = Some(e),
            }
        }
        Err(ProxyError::UpstreamConnectFailure(format!(
            "TCP connect to {}:{} failed: {}",
            host,
            port,
            last.map(|e| e.to_string())
                .unwrap_or_else(|| "no reachable address".to_string())
        )))
    }

    /// SOCKS4 carries no hostname form; the destination resolves locally
    async fn resolve_ipv4(&self, host: &str, port: u16) -> Result<SocketAddrV4> {
        let addrs = self.shared.resolver.resolve(host, port).await?;
        addrs
            .into_iter()
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                ProxyError::UpstreamConnectFailure(format!(
                    "SOCKS4 requires an IPv4 destination for {}",
                    host
                ))
            })
    }

    /// Establish a hop and start an HTTP/1.1 session over it
    pub(crate) async fn open_session(
        &self,
        request: &ProxyRequest,
        host: &str,
        port: u16,
    ) -> Result<UpstreamSession> {
        let (stream, candidate) = self.connect(request, host, port, HopUse::Forward).await?;
        let absolute_form = candidate
            .spec()
            .map(|spec| spec.protocol.is_http())
            .unwrap_or(false);

        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|e| {
                ProxyError::UpstreamConnectFailure(format!("HTTP handshake failed: {}", e))
            })?;

        let watched = candidate.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
            watched.notify_disconnected();
        });

        Ok(UpstreamSession::new(
            sender,
            candidate,
            host.to_string(),
            port,
            absolute_form,
        ))
    }

    /// Apply the hop header policy and rewrite the request target for the
    /// session's wire form
    pub(crate) fn prepare_for_hop(
        &self,
        request: &mut ProxyRequest,
        session: &UpstreamSession,
    ) -> Result<()> {
        let policy_candidate = session.policy_candidate();
        let policy = HopPolicy {
            local_auth_configured: self.shared.authenticator.is_some(),
            candidate: &policy_candidate,
        };
        policy.prepare_request_headers(request.headers_mut());
        set_request_target(request, session)
    }

    /// Write one prepared request and collect the buffered response
    pub(crate) async fn transmit(
        &self,
        session: &mut UpstreamSession,
        request: ProxyRequest,
    ) -> Result<ProxyResponse> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(body));

        session.sender.ready().await.map_err(|e| {
            ProxyError::UpstreamProtocolError(format!("upstream connection not ready: {}", e))
        })?;

        let response = tokio::time::timeout(
            self.shared.config.response_timeout,
            session.sender.send_request(request),
        )
        .await
        .map_err(|_| ProxyError::ResponseTimeout)?
        .map_err(|e| ProxyError::UpstreamProtocolError(format!("upstream request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        let bytes = tokio::time::timeout(self.shared.config.response_timeout, body.collect())
            .await
            .map_err(|_| ProxyError::ResponseTimeout)?
            .map_err(|e| {
                ProxyError::UpstreamProtocolError(format!(
                    "failed to read upstream response: {}",
                    e
                ))
            })?
            .to_bytes();

        Ok(Response::from_parts(parts, bytes))
    }
}

fn set_request_target(request: &mut ProxyRequest, session: &UpstreamSession) -> Result<()> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if session.absolute_form {
        let uri: Uri = format!(
            "http://{}{}",
            authority_string(&session.host, session.port),
            path_and_query
        )
        .parse()?;
        *request.uri_mut() = uri;
    } else {
        *request.uri_mut() = path_and_query.parse()?;
    }

    if !request.headers().contains_key(HOST) {
        let value = authority_string(&session.host, session.port);
        request.headers_mut().insert(
            HOST,
            HeaderValue::from_str(&value)
                .map_err(|_| ProxyError::MalformedRequest("invalid host".to_string()))?,
        );
    }
    Ok(())
}

/// `host[:port]` with the default HTTP port elided and IPv6 bracketed
fn authority_string(host: &str, port: u16) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port == 80 {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parse host and port from a request: absolute-form URI first, `Host`
/// header as a fallback
pub(crate) fn parse_request_target<T>(request: &http::Request<T>) -> Result<(String, u16)> {
    let uri = request.uri();
    if let Some(host) = uri.host() {
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        return Ok((host.to_string(), port));
    }

    let header = request.headers().get(HOST).ok_or_else(|| {
        ProxyError::MalformedRequest(
            "request has neither an absolute URI nor a Host header".to_string(),
        )
    })?;
    let raw = header
        .to_str()
        .map_err(|_| ProxyError::MalformedRequest("invalid Host header".to_string()))?;
    let authority: http::uri::Authority = raw
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("invalid Host header '{}'", raw)))?;

    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, authority.port_u16().unwrap_or(80)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_target_absolute_form() {
        let request = http::Request::builder()
            .uri("http://example.com:8080/path")
            .body(())
            .unwrap();
        assert_eq!(
            parse_request_target(&request).unwrap(),
            ("example.com".to_string(), 8080)
        );

        let request = http::Request::builder()
            .uri("http://example.com/path")
            .body(())
            .unwrap();
        assert_eq!(
            parse_request_target(&request).unwrap(),
            ("example.com".to_string(), 80)
        );
    }

    #[test]
    fn test_parse_request_target_host_header_fallback() {
        let request = http::Request::builder()
            .uri("/path")
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(
            parse_request_target(&request).unwrap(),
            ("example.com".to_string(), 8080)
        );

        let request = http::Request::builder().uri("/path").body(()).unwrap();
        assert!(matches!(
            parse_request_target(&request),
            Err(ProxyError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_authority_string_forms() {
        assert_eq!(authority_string("example.com", 80), "example.com");
        assert_eq!(authority_string("example.com", 8080), "example.com:8080");
        assert_eq!(authority_string("::1", 8080), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_system_resolver_resolves_localhost() {
        let resolver = SystemResolver;
        let addrs = resolver.resolve("127.0.0.1", 80).await.unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].port(), 80);
    }

    #[tokio::test]
    async fn test_system_resolver_unknown_host() {
        let resolver = SystemResolver;
        let err = resolver
            .resolve("definitely-not-a-host.invalid", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownHost(_)));
    }
}
