//! Proxy engine
//!
//! This module provides the dual connection engine:
//! - Client-facing connection handling with proxy authentication
//! - Server-facing connection handling with chained-proxy fallback
//! - HTTP CONNECT, SOCKS4, and SOCKS5 upstream handshakes
//! - CONNECT tunneling, blind or MITM-intercepted
//! - Hop-by-hop header policy

pub mod auth;
pub mod chain;
pub mod handshake;
pub mod headers;
pub mod mitm;
pub mod server;
pub mod tunnel;

pub(crate) mod client;
pub(crate) mod upstream;

pub use auth::{ProxyAuthenticator, StaticProxyAuthenticator};
pub use chain::{
    CandidateEvents, ChainProtocol, ChainedProxyCandidate, ChainedProxyManager, ChainedProxySpec,
    DirectConnectManager, StaticChainManager,
};
pub use mitm::{CaConfig, CertificateAuthority, MitmManager};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use upstream::{Resolver, SystemResolver};

pub(crate) use server::ProxyShared;
