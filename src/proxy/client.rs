//! Client-facing connection state machine.
//!
//! One [`ClientConnection`] owns an accepted client socket for its lifetime
//! and drives it through the request cycle: parse, authenticate, filter,
//! dispatch to the server-facing connection, and reply — returning to await
//! the next request on the same socket unless the outgoing response asked
//! for closure. CONNECT requests fork into either a blind relay tunnel or a
//! MITM interception whose decrypted requests re-enter the same cycle.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use http::header::{CONNECTION, CONTENT_TYPE, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::events::RequestRecord;
use crate::filters::{ProxyRequest, ProxyResponse};
use crate::flow::FlowContext;
use crate::proxy::auth::{self, AuthDecision};
use crate::proxy::chain::ChainedProxyCandidate;
use crate::proxy::handshake::BoxedChainStream;
use crate::proxy::headers;
use crate::proxy::mitm::MitmManager;
use crate::proxy::tunnel;
use crate::proxy::upstream::{parse_request_target, HopUse, ServerConnection, UpstreamSession};
use crate::proxy::ProxyShared;

/// Client-facing half of one flow
pub(crate) struct ClientConnection {
    shared: Arc<ProxyShared>,
    flow: Arc<FlowContext>,
    /// Per-flow upstream reuse: the last session, kept for the next request
    /// to the same authority on this client connection
    cached: tokio::sync::Mutex<Option<UpstreamSession>>,
}

impl ClientConnection {
    /// Own one accepted client socket until it closes
    pub(crate) async fn serve(
        shared: Arc<ProxyShared>,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) {
        shared.trackers.client_connected(client_addr);
        let flow = Arc::new(FlowContext::new(client_addr));
        debug!(flow_id = %flow.id(), "Client connected from {}", client_addr);

        let connection = Arc::new(ClientConnection {
            shared: shared.clone(),
            flow,
            cached: tokio::sync::Mutex::new(None),
        });

        let io = TokioIo::new(stream);
        let service = service_fn({
            let connection = connection.clone();
            move |request: Request<Incoming>| {
                let connection = connection.clone();
                async move { Ok::<_, Infallible>(connection.handle(request).await) }
            }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .timer(TokioTimer::new())
            .header_read_timeout(shared.config.idle_timeout)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!("Client connection ended: {}", e);
        }

        // Dropping a cached session closes its connection; the session's
        // driver task fires the candidate's disconnected callback.
        connection.cached.lock().await.take();
        shared.trackers.client_disconnected(client_addr);
    }

    /// One request through the full cycle
    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let method = request.method().clone();
        let target = request.uri().to_string();
        self.shared
            .trackers
            .request_received(&self.flow, method.as_str(), &target);

        // Authentication gate. Requests without parseable credentials are
        // challenged without ever invoking the authenticator.
        match auth::authorize(self.shared.authenticator.as_ref(), request.headers()).await {
            AuthDecision::Anonymous | AuthDecision::Authenticated => {}
            AuthDecision::Challenge => {
                debug!(flow_id = %self.flow.id(), "Challenging client for proxy credentials");
                let realm = self
                    .shared
                    .authenticator
                    .as_ref()
                    .map(|authenticator| authenticator.realm().to_string())
                    .unwrap_or_else(|| "Proxy".to_string());
                let response = auth::challenge_response(&realm);
                self.record_response(&method, &target, response.status(), started, "local");
                return response.map(Full::new);
            }
        }

        let result = if method == Method::CONNECT {
            self.handle_connect(request).await
        } else {
            self.handle_http(request).await
        };

        match result {
            Ok((response, upstream)) => {
                self.record_response(&method, &target, response.status(), started, &upstream);
                response.map(Full::new)
            }
            Err(error) => {
                warn!(flow_id = %self.flow.id(), "{} {} failed: {}", method, target, error);
                self.shared.trackers.exception_caught(&self.flow, &error);
                let response = error_response(&error);
                self.record_response(&method, &target, response.status(), started, "none");
                response.map(Full::new)
            }
        }
    }

    /// Forward a plain HTTP request upstream
    async fn handle_http(&self, request: Request<Incoming>) -> Result<(ProxyResponse, String)> {
        let (host, port) = parse_request_target(&request)?;

        let (parts, body) = request.into_parts();
        let body = body.collect().await.map_err(|e| {
            ProxyError::MalformedRequest(format!("failed to read request body: {}", e))
        })?;
        let mut request: ProxyRequest = Request::from_parts(parts, body.to_bytes());

        let mut filters = self.shared.filters.create(&request, &self.flow);
        if let Some(mut response) = filters.client_to_proxy_request(&mut request) {
            filters.proxy_to_client_response(&mut response);
            return Ok((response, "short-circuit".to_string()));
        }

        let server = ServerConnection::new(&self.shared, &self.flow);

        // Reuse the flow's previous session when it still points at the same
        // authority and its connection is alive; otherwise open a fresh one
        // through the fallback loop.
        let cached = {
            let mut slot = self.cached.lock().await;
            match slot.take() {
                Some(mut session) if session.matches(&host, port) => {
                    if session.is_ready().await {
                        Some(session)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        let mut session = match cached {
            Some(session) => session,
            None => server.open_session(&request, &host, port).await?,
        };

        server.prepare_for_hop(&mut request, &session)?;
        if let Some(mut response) = filters.proxy_to_server_request(&mut request) {
            filters.proxy_to_client_response(&mut response);
            return Ok((response, "short-circuit".to_string()));
        }

        let upstream_label = session.candidate().label();
        let mut response = server.transmit(&mut session, request).await?;

        filters.server_to_proxy_response(&mut response);

        // An origin that asked to close its connection cannot take another
        // request; only live sessions are kept for per-flow reuse. The
        // closure never propagates to the client either way.
        let origin_closing = response_requests_close(&response);
        headers::prepare_response_headers(response.headers_mut());
        if !origin_closing {
            *self.cached.lock().await = Some(session);
        }

        filters.proxy_to_client_response(&mut response);
        Ok((response, upstream_label))
    }

    /// Establish a CONNECT tunnel, blind or intercepted
    async fn handle_connect(&self, request: Request<Incoming>) -> Result<(ProxyResponse, String)> {
        let authority = request
            .uri()
            .authority()
            .map(|authority| authority.to_string())
            .unwrap_or_else(|| request.uri().to_string());
        let (host, port) = parse_authority(&authority)?;

        // Head-only copy for filters and candidate lookup; the CONNECT body
        // is empty by definition.
        let mut connect_request: ProxyRequest = Request::new(Bytes::new());
        *connect_request.method_mut() = request.method().clone();
        *connect_request.uri_mut() = request.uri().clone();
        *connect_request.version_mut() = request.version();
        *connect_request.headers_mut() = request.headers().clone();

        let mut filters = self.shared.filters.create(&connect_request, &self.flow);
        if let Some(mut response) = filters.client_to_proxy_request(&mut connect_request) {
            filters.proxy_to_client_response(&mut response);
            return Ok((response, "short-circuit".to_string()));
        }

        let client_authorization = connect_request.headers().get(PROXY_AUTHORIZATION).cloned();
        let server = ServerConnection::new(&self.shared, &self.flow);
        let (stream, candidate) = server
            .connect(
                &connect_request,
                &host,
                port,
                HopUse::Tunnel {
                    client_authorization,
                },
            )
            .await?;
        let upstream_label = candidate.label();

        // Intercept only when a MITM collaborator is configured and the
        // destination is presumed to speak TLS; CONNECT is also used for
        // plaintext protocols, which get a blind relay.
        let plan = match &self.shared.mitm {
            Some(manager) if manager.presumes_tls(&host, port) => {
                let upstream_tls = self.upstream_tls_handshake(manager, &host, stream).await?;
                TunnelPlan::Intercept {
                    manager: manager.clone(),
                    upstream_tls,
                }
            }
            _ => TunnelPlan::Blind { stream },
        };

        // The synthetic 200 terminating tunnel establishment passes the
        // response hooks like any other upstream response.
        let mut response: ProxyResponse = Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::new())
            .expect("static response is always valid");
        filters.server_to_proxy_response(&mut response);
        filters.proxy_to_client_response(&mut response);

        let shared = self.shared.clone();
        let flow = self.flow.clone();
        let on_upgrade = hyper::upgrade::on(request);
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                    return;
                }
            };
            let client_io = TokioIo::new(upgraded);

            match plan {
                TunnelPlan::Blind { stream } => {
                    match tunnel::copy_bidirectional(client_io, stream).await {
                        Ok((sent, received)) => {
                            shared.trackers.bytes_transferred(&flow, sent, received);
                        }
                        Err(e) => debug!("Tunnel relay ended: {}", e),
                    }
                    candidate.notify_disconnected();
                }
                TunnelPlan::Intercept {
                    manager,
                    upstream_tls,
                } => {
                    if let Err(e) = serve_intercepted_tunnel(
                        shared,
                        flow,
                        manager,
                        host,
                        port,
                        candidate,
                        upstream_tls,
                        client_io,
                    )
                    .await
                    {
                        debug!("Intercepted tunnel ended: {}", e);
                    }
                }
            }
        });

        Ok((response, upstream_label))
    }

    /// TLS session to the real destination, over whatever hop carries it
    async fn upstream_tls_handshake(
        &self,
        manager: &Arc<dyn MitmManager>,
        host: &str,
        stream: BoxedChainStream,
    ) -> Result<tokio_rustls::client::TlsStream<BoxedChainStream>> {
        let config = manager.upstream_config(host)?;
        let name = ServerName::try_from(host.to_string()).map_err(|_| {
            ProxyError::UpstreamConnectFailure(format!("invalid TLS server name '{}'", host))
        })?;

        tokio::time::timeout(
            self.shared.config.connect_timeout,
            TlsConnector::from(config).connect(name, stream),
        )
        .await
        .map_err(|_| ProxyError::ConnectTimeout)?
        .map_err(|e| {
            ProxyError::UpstreamConnectFailure(format!(
                "upstream TLS handshake with {} failed: {}",
                host, e
            ))
        })
    }

    fn record_response(
        &self,
        method: &Method,
        target: &str,
        status: StatusCode,
        started: Instant,
        upstream: &str,
    ) {
        record_response(
            &self.shared,
            &self.flow,
            method,
            target,
            status,
            started,
            upstream,
        );
    }
}

enum TunnelPlan {
    Blind {
        stream: BoxedChainStream,
    },
    Intercept {
        manager: Arc<dyn MitmManager>,
        upstream_tls: tokio_rustls::client::TlsStream<BoxedChainStream>,
    },
}

/// Serve decrypted requests inside an intercepted tunnel.
///
/// Both TLS sessions are active here: the upstream session to the real
/// destination and the client session using the minted certificate. Each
/// plaintext request re-enters the normal cycle, filters included,
/// multiplexed over the single upstream session.
#[allow(clippy::too_many_arguments)]
async fn serve_intercepted_tunnel(
    shared: Arc<ProxyShared>,
    flow: Arc<FlowContext>,
    manager: Arc<dyn MitmManager>,
    host: String,
    port: u16,
    candidate: ChainedProxyCandidate,
    upstream_tls: tokio_rustls::client::TlsStream<BoxedChainStream>,
    client_io: TokioIo<Upgraded>,
) -> Result<()> {
    let serving_config = manager.client_facing_config(&host)?;
    let client_tls = TlsAcceptor::from(serving_config)
        .accept(client_io)
        .await
        .map_err(|e| {
            ProxyError::UpstreamConnectFailure(format!("client TLS handshake failed: {}", e))
        })?;
    debug!(flow_id = %flow.id(), "Intercepting TLS tunnel to {}:{}", host, port);

    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(upstream_tls))
        .await
        .map_err(|e| {
            ProxyError::UpstreamConnectFailure(format!(
                "HTTP handshake inside tunnel failed: {}",
                e
            ))
        })?;
    let watched = candidate.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Tunnel upstream connection ended: {}", e);
        }
        watched.notify_disconnected();
    });

    let session = Arc::new(tokio::sync::Mutex::new(UpstreamSession::new(
        sender, candidate, host, port, false,
    )));

    let service = service_fn({
        let shared = shared.clone();
        let flow = flow.clone();
        let session = session.clone();
        move |request: Request<Incoming>| {
            let shared = shared.clone();
            let flow = flow.clone();
            let session = session.clone();
            async move {
                Ok::<_, Infallible>(handle_tunneled_request(shared, flow, session, request).await)
            }
        }
    });

    hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(shared.config.idle_timeout)
        .serve_connection(TokioIo::new(client_tls), service)
        .await
        .map_err(|e| ProxyError::Http(e.to_string()))
}

/// One decrypted request inside an intercepted tunnel
async fn handle_tunneled_request(
    shared: Arc<ProxyShared>,
    flow: Arc<FlowContext>,
    session: Arc<tokio::sync::Mutex<UpstreamSession>>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let method = request.method().clone();
    let target = request.uri().to_string();
    shared
        .trackers
        .request_received(&flow, method.as_str(), &target);

    match forward_tunneled_request(&shared, &flow, &session, request).await {
        Ok((response, upstream)) => {
            record_response(
                &shared,
                &flow,
                &method,
                &target,
                response.status(),
                started,
                &upstream,
            );
            response.map(Full::new)
        }
        Err(error) => {
            warn!(flow_id = %flow.id(), "tunneled {} {} failed: {}", method, target, error);
            shared.trackers.exception_caught(&flow, &error);
            let response = error_response(&error);
            record_response(
                &shared,
                &flow,
                &method,
                &target,
                response.status(),
                started,
                "none",
            );
            response.map(Full::new)
        }
    }
}

async fn forward_tunneled_request(
    shared: &Arc<ProxyShared>,
    flow: &Arc<FlowContext>,
    session: &Arc<tokio::sync::Mutex<UpstreamSession>>,
    request: Request<Incoming>,
) -> Result<(ProxyResponse, String)> {
    let (parts, body) = request.into_parts();
    let body = body.collect().await.map_err(|e| {
        ProxyError::MalformedRequest(format!("failed to read request body: {}", e))
    })?;
    let mut request: ProxyRequest = Request::from_parts(parts, body.to_bytes());

    let mut filters = shared.filters.create(&request, flow);
    if let Some(mut response) = filters.client_to_proxy_request(&mut request) {
        filters.proxy_to_client_response(&mut response);
        return Ok((response, "short-circuit".to_string()));
    }

    let server = ServerConnection::new(shared, flow);
    let mut session = session.lock().await;

    server.prepare_for_hop(&mut request, &session)?;
    if let Some(mut response) = filters.proxy_to_server_request(&mut request) {
        filters.proxy_to_client_response(&mut response);
        return Ok((response, "short-circuit".to_string()));
    }

    let upstream_label = session.candidate().label();
    let mut response = server.transmit(&mut session, request).await?;

    filters.server_to_proxy_response(&mut response);
    headers::prepare_response_headers(response.headers_mut());
    filters.proxy_to_client_response(&mut response);
    Ok((response, upstream_label))
}

fn record_response(
    shared: &ProxyShared,
    flow: &FlowContext,
    method: &Method,
    target: &str,
    status: StatusCode,
    started: Instant,
    upstream: &str,
) {
    let record = RequestRecord {
        flow_id: flow.id(),
        client_addr: flow.client_addr(),
        method: method.to_string(),
        target: target.to_string(),
        status: status.as_u16(),
        response_time_ms: started.elapsed().as_millis() as u64,
        upstream: upstream.to_string(),
        timestamp: Utc::now(),
    };
    shared.trackers.response_sent(&record);
}

/// Whether a response (as received, before sanitation) asks for the
/// connection to close
fn response_requests_close(response: &ProxyResponse) -> bool {
    response
        .headers()
        .get_all(CONNECTION)
        .iter()
        .any(|value| {
            value
                .to_str()
                .map(|s| s.to_ascii_lowercase().contains("close"))
                .unwrap_or(false)
        })
}

/// Synthesize the client-facing response for a failed exchange.
///
/// The client socket stays open except on malformed input.
fn error_response(error: &ProxyError) -> ProxyResponse {
    let mut builder = Response::builder()
        .status(error.status_code())
        .header(CONTENT_TYPE, "text/plain");
    if error.closes_client_connection() {
        builder = builder.header(CONNECTION, "close");
    }
    builder
        .body(Bytes::from(error.to_string()))
        .expect("static response is always valid")
}

/// Parse and validate a CONNECT authority (`host:port`)
fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port_str) = authority.rsplit_once(':').ok_or_else(|| {
        ProxyError::MalformedRequest(format!(
            "CONNECT authority '{}' must be host:port",
            authority
        ))
    })?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::MalformedRequest(
            "CONNECT host cannot be empty".to_string(),
        ));
    }

    let port: u16 = port_str.parse().map_err(|_| {
        ProxyError::MalformedRequest(format!("invalid CONNECT port '{}'", port_str))
    })?;
    if port == 0 {
        return Err(ProxyError::MalformedRequest(
            "invalid CONNECT port 0".to_string(),
        ));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:8443").unwrap(),
            ("::1".to_string(), 8443)
        );

        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("example.com:0").is_err());
        assert!(parse_authority("example.com:notaport").is_err());
    }

    #[test]
    fn test_error_response_closure() {
        let response = error_response(&ProxyError::ResponseTimeout);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!response.headers().contains_key(CONNECTION));

        let response = error_response(&ProxyError::MalformedRequest("bad".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
    }
}
