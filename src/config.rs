use std::env;
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Proxy engine configuration.
///
/// All knobs are explicit construction parameters; the environment is only
/// consulted by [`ProxyConfig::from_env`], which the binary uses.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port for the proxy listener (default: 8000, 0 picks an ephemeral port)
    pub port: u16,
    /// Timeout covering TCP connect, per-hop TLS, and the chain handshake
    /// for a single candidate; expiry advances the fallback loop
    pub connect_timeout: Duration,
    /// Timeout for an upstream response; expiry surfaces 504 to the client
    pub response_timeout: Duration,
    /// Idle window after which a quiet client connection is closed
    pub idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(70),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from `VIADUCT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = ProxyConfig::default();
        Ok(ProxyConfig {
            host: get_env_or("VIADUCT_HOST", &defaults.host),
            port: parse_env("VIADUCT_PORT", defaults.port)?,
            connect_timeout: Duration::from_secs(parse_env(
                "VIADUCT_CONNECT_TIMEOUT",
                defaults.connect_timeout.as_secs(),
            )?),
            response_timeout: Duration::from_secs(parse_env(
                "VIADUCT_RESPONSE_TIMEOUT",
                defaults.response_timeout.as_secs(),
            )?),
            idle_timeout: Duration::from_secs(parse_env(
                "VIADUCT_IDLE_TIMEOUT",
                defaults.idle_timeout.as_secs(),
            )?),
        })
    }

    /// Socket address string the listener binds
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ProxyError::InvalidConfig(format!("{} must be a valid number", key))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.bind_addr(), "127.0.0.1:8000");
    }
}
