//! Proxy server: listener, accept loop, and collaborator wiring.
//!
//! Collaborators are injected through [`ProxyServerBuilder`] as small trait
//! objects with no-op defaults; the accept loop hands each client socket to
//! its own connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::events::{ActivityTracker, TrackerSet};
use crate::filters::{HttpFiltersFactory, NoopFiltersFactory};
use crate::proxy::auth::ProxyAuthenticator;
use crate::proxy::chain::{ChainedProxyManager, DirectConnectManager};
use crate::proxy::client::ClientConnection;
use crate::proxy::mitm::MitmManager;
use crate::proxy::upstream::{Resolver, SystemResolver};

/// Collaborators and configuration shared by every connection
pub(crate) struct ProxyShared {
    pub(crate) config: ProxyConfig,
    pub(crate) authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub(crate) chain: Arc<dyn ChainedProxyManager>,
    pub(crate) filters: Arc<dyn HttpFiltersFactory>,
    pub(crate) mitm: Option<Arc<dyn MitmManager>>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) trackers: TrackerSet,
}

/// Builder wiring collaborators into a proxy server
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    chain: Arc<dyn ChainedProxyManager>,
    filters: Arc<dyn HttpFiltersFactory>,
    mitm: Option<Arc<dyn MitmManager>>,
    resolver: Arc<dyn Resolver>,
    trackers: Vec<Arc<dyn ActivityTracker>>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            authenticator: None,
            chain: Arc::new(DirectConnectManager),
            filters: Arc::new(NoopFiltersFactory),
            mitm: None,
            resolver: Arc::new(SystemResolver),
            trackers: Vec::new(),
        }
    }

    /// Require clients to authenticate with Basic proxy credentials
    pub fn authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn chain_manager(mut self, chain: Arc<dyn ChainedProxyManager>) -> Self {
        self.chain = chain;
        self
    }

    pub fn filters_factory(mut self, filters: Arc<dyn HttpFiltersFactory>) -> Self {
        self.filters = filters;
        self
    }

    /// Enable CONNECT interception through a MITM collaborator
    pub fn mitm_manager(mut self, mitm: Arc<dyn MitmManager>) -> Self {
        self.mitm = Some(mitm);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Register an activity tracker; trackers are notified in registration order
    pub fn tracker(mut self, tracker: Arc<dyn ActivityTracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    /// Bind the listener and produce a runnable server
    pub async fn bind(self) -> Result<ProxyServer> {
        let listener = TcpListener::bind(self.config.bind_addr())
            .await
            .map_err(|e| {
                ProxyError::InvalidConfig(format!(
                    "failed to bind {}: {}",
                    self.config.bind_addr(),
                    e
                ))
            })?;
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;

        let shared = Arc::new(ProxyShared {
            config: self.config,
            authenticator: self.authenticator,
            chain: self.chain,
            filters: self.filters,
            mitm: self.mitm,
            resolver: self.resolver,
            trackers: TrackerSet::new(self.trackers),
        });

        Ok(ProxyServer {
            shared,
            listener,
            local_addr,
        })
    }
}

/// Intercepting forward proxy server
pub struct ProxyServer {
    shared: Arc<ProxyShared>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the shutdown channel flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Proxy server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                ClientConnection::serve(shared, stream, client_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        debug!("Accept loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ProxyConfig {
            port: 0,
            ..ProxyConfig::default()
        };
        let server = ProxyServerBuilder::new(config).bind().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_accept_loop() {
        let config = ProxyConfig {
            port: 0,
            ..ProxyConfig::default()
        };
        let server = ProxyServerBuilder::new(config).bind().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("run did not stop")
            .unwrap()
            .unwrap();
    }
}
