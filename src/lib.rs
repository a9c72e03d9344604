//! Viaduct - Intercepting HTTP(S) Forward Proxy
//!
//! Viaduct is an intercepting forward proxy built around a dual connection
//! engine: a client-facing and a server-facing state machine paired per
//! flow.
//!
//! ## Features
//!
//! - HTTP/1.1 proxy semantics: absolute-URI requests and CONNECT tunnels
//! - Basic proxy authentication with a pluggable authenticator
//! - Chained upstream proxies (HTTP CONNECT, SOCKS4, SOCKS5) with ordered
//!   fallback and a direct-connection sentinel
//! - Per-hop TLS toward encrypted chained proxies
//! - MITM tunnel interception with a dynamic certificate authority
//! - Four-hook request/response filter pipeline with short-circuiting
//! - Activity trackers receiving ordered lifecycle notifications
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use viaduct::{ProxyConfig, ProxyServerBuilder, StaticProxyAuthenticator};
//!
//! #[tokio::main]
//! async fn main() -> viaduct::Result<()> {
//!     let server = ProxyServerBuilder::new(ProxyConfig::default())
//!         .authenticator(Arc::new(StaticProxyAuthenticator::new("user", "pass")))
//!         .bind()
//!         .await?;
//!
//!     let (_shutdown, rx) = tokio::sync::watch::channel(false);
//!     server.run(rx).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod filters;
pub mod flow;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use events::{ActivityTracker, RequestRecord, TracingActivityTracker};
pub use filters::{
    HttpFilters, HttpFiltersFactory, NoopFilters, NoopFiltersFactory, ProxyRequest, ProxyResponse,
};
pub use flow::FlowContext;
pub use proxy::{
    CaConfig, CandidateEvents, CertificateAuthority, ChainProtocol, ChainedProxyCandidate,
    ChainedProxyManager, ChainedProxySpec, DirectConnectManager, MitmManager, ProxyAuthenticator,
    ProxyServer, ProxyServerBuilder, Resolver, StaticChainManager, StaticProxyAuthenticator,
    SystemResolver,
};
