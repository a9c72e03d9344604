//! Chained-proxy candidates and their manager.
//!
//! A manager produces a fresh ordered candidate list per request; the
//! server-facing connection walks the list in order, falling back on
//! connect or handshake failure. A reserved direct sentinel means "skip
//! chaining, connect straight to the origin".

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::filters::ProxyRequest;

/// Wire protocol spoken toward a chained upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainProtocol {
    Http,
    Socks4,
    Socks5,
}

impl ChainProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainProtocol::Http => "http",
            ChainProtocol::Socks4 => "socks4",
            ChainProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Some(ChainProtocol::Http),
            "socks4" => Some(ChainProtocol::Socks4),
            "socks5" => Some(ChainProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ChainProtocol::Socks4 | ChainProtocol::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ChainProtocol::Http)
    }
}

impl fmt::Display for ChainProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable description of one chained upstream hop
#[derive(Debug, Clone)]
pub struct ChainedProxySpec {
    /// Proxy address in `host:port` form
    pub address: String,
    pub protocol: ChainProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Run a TLS client handshake on the hop socket before the chain handshake
    pub requires_encryption: bool,
}

impl ChainedProxySpec {
    pub fn new(address: impl Into<String>, protocol: ChainProtocol) -> Self {
        Self {
            address: address.into(),
            protocol,
            username: None,
            password: None,
            requires_encryption: false,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_encryption(mut self) -> Self {
        self.requires_encryption = true;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// Host part of the proxy address, used as the TLS server name
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.address,
        }
    }
}

/// Lifecycle callbacks for one candidate, fired by the fallback loop
pub trait CandidateEvents: Send + Sync {
    fn connection_succeeded(&self) {}
    fn connection_failed(&self, _cause: &ProxyError) {}
    fn disconnected(&self) {}
}

/// One entry of a per-request candidate list: either a chained hop or the
/// direct-connection sentinel
#[derive(Clone)]
pub struct ChainedProxyCandidate {
    spec: Option<ChainedProxySpec>,
    events: Option<Arc<dyn CandidateEvents>>,
}

impl ChainedProxyCandidate {
    /// The reserved sentinel: skip chaining and connect directly
    pub fn direct() -> Self {
        Self {
            spec: None,
            events: None,
        }
    }

    pub fn chained(spec: ChainedProxySpec) -> Self {
        Self {
            spec: Some(spec),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn CandidateEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_direct(&self) -> bool {
        self.spec.is_none()
    }

    pub fn spec(&self) -> Option<&ChainedProxySpec> {
        self.spec.as_ref()
    }

    /// Display label for logs and activity records
    pub fn label(&self) -> String {
        match &self.spec {
            Some(spec) => format!("{}://{}", spec.protocol, spec.address),
            None => "direct".to_string(),
        }
    }

    pub(crate) fn notify_succeeded(&self) {
        if let Some(events) = &self.events {
            events.connection_succeeded();
        }
    }

    pub(crate) fn notify_failed(&self, cause: &ProxyError) {
        if let Some(events) = &self.events {
            events.connection_failed(cause);
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        if let Some(events) = &self.events {
            events.disconnected();
        }
    }
}

impl fmt::Debug for ChainedProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedProxyCandidate")
            .field("spec", &self.spec)
            .field("has_events", &self.events.is_some())
            .finish()
    }
}

/// Produces the ordered candidate list for one request.
///
/// A fresh list is built per request; candidates are never shared mutable
/// state across flows.
#[async_trait]
pub trait ChainedProxyManager: Send + Sync {
    async fn lookup(
        &self,
        request: &ProxyRequest,
        client_addr: SocketAddr,
    ) -> Vec<ChainedProxyCandidate>;
}

/// Default manager: every request connects directly to the origin
pub struct DirectConnectManager;

#[async_trait]
impl ChainedProxyManager for DirectConnectManager {
    async fn lookup(
        &self,
        _request: &ProxyRequest,
        _client_addr: SocketAddr,
    ) -> Vec<ChainedProxyCandidate> {
        vec![ChainedProxyCandidate::direct()]
    }
}

/// Manager serving a fixed candidate list, optionally ending in the direct
/// sentinel as a last resort
pub struct StaticChainManager {
    candidates: Vec<ChainedProxyCandidate>,
    fall_back_to_direct: bool,
}

impl StaticChainManager {
    pub fn new(candidates: Vec<ChainedProxyCandidate>) -> Self {
        Self {
            candidates,
            fall_back_to_direct: false,
        }
    }

    pub fn fall_back_to_direct(mut self) -> Self {
        self.fall_back_to_direct = true;
        self
    }
}

#[async_trait]
impl ChainedProxyManager for StaticChainManager {
    async fn lookup(
        &self,
        _request: &ProxyRequest,
        _client_addr: SocketAddr,
    ) -> Vec<ChainedProxyCandidate> {
        let mut list = self.candidates.clone();
        if self.fall_back_to_direct {
            list.push(ChainedProxyCandidate::direct());
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProxyRequest {
        http::Request::builder()
            .uri("http://example.com/")
            .body(bytes::Bytes::new())
            .unwrap()
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_chain_protocol_parsing_and_helpers() {
        assert_eq!(ChainProtocol::from_str("HTTP"), Some(ChainProtocol::Http));
        assert_eq!(ChainProtocol::from_str("https"), Some(ChainProtocol::Http));
        assert_eq!(
            ChainProtocol::from_str("SOCKS5"),
            Some(ChainProtocol::Socks5)
        );
        assert_eq!(ChainProtocol::from_str("unknown"), None);

        assert!(ChainProtocol::Socks4.is_socks());
        assert!(!ChainProtocol::Http.is_socks());
        assert!(ChainProtocol::Http.is_http());

        assert_eq!(ChainProtocol::Socks5.to_string(), "socks5");
    }

    #[test]
    fn test_direct_sentinel() {
        let candidate = ChainedProxyCandidate::direct();
        assert!(candidate.is_direct());
        assert!(candidate.spec().is_none());
        assert_eq!(candidate.label(), "direct");
    }

    #[test]
    fn test_spec_host_extraction() {
        let spec = ChainedProxySpec::new("proxy.example:3128", ChainProtocol::Http);
        assert_eq!(spec.host(), "proxy.example");

        let spec = ChainedProxySpec::new("[::1]:1080", ChainProtocol::Socks5);
        assert_eq!(spec.host(), "::1");
    }

    #[tokio::test]
    async fn test_direct_manager_returns_sentinel() {
        let manager = DirectConnectManager;
        let list = manager.lookup(&request(), client_addr()).await;
        assert_eq!(list.len(), 1);
        assert!(list[0].is_direct());
    }

    #[tokio::test]
    async fn test_static_manager_appends_direct_fallback() {
        let spec = ChainedProxySpec::new("127.0.0.1:3128", ChainProtocol::Http);
        let manager =
            StaticChainManager::new(vec![ChainedProxyCandidate::chained(spec)]).fall_back_to_direct();

        let list = manager.lookup(&request(), client_addr()).await;
        assert_eq!(list.len(), 2);
        assert!(!list[0].is_direct());
        assert!(list[1].is_direct());
    }
}
