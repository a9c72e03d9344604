//! Client-side proxy authentication.
//!
//! Basic authentication on the client-to-proxy hop. The gate guarantees that
//! `authenticate()` is invoked exactly once per credential-carrying attempt
//! and never for an unauthenticated first attempt.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderMap, Response, StatusCode};
use tracing::{debug, warn};

use crate::filters::ProxyResponse;

/// Validates client credentials on the client-to-proxy hop
#[async_trait]
pub trait ProxyAuthenticator: Send + Sync {
    /// Check one set of credentials. Called exactly once per attempt.
    async fn authenticate(&self, username: &str, password: &str) -> bool;

    /// Realm named in the `Proxy-Authenticate` challenge
    fn realm(&self) -> &str {
        "Proxy"
    }
}

/// Authenticator backed by a single fixed credential pair
pub struct StaticProxyAuthenticator {
    username: String,
    password: String,
    realm: String,
}

impl StaticProxyAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: "Proxy".to_string(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }
}

#[async_trait]
impl ProxyAuthenticator for StaticProxyAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        if username == self.username && password == self.password {
            debug!("Proxy authentication successful for user: {}", username);
            true
        } else {
            warn!("Proxy authentication failed for user: {}", username);
            false
        }
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

/// Outcome of the authentication gate for one request
#[derive(Debug, PartialEq, Eq)]
pub enum AuthDecision {
    /// No authenticator configured; the request proceeds unauthenticated
    Anonymous,
    /// Reply 407 with a challenge; `authenticate()` was only invoked if the
    /// request actually carried parseable credentials
    Challenge,
    /// Credentials accepted
    Authenticated,
}

/// Run the authentication gate for one request.
///
/// Requests without a parseable `Proxy-Authorization` header are challenged
/// without invoking `authenticate()`; requests with credentials invoke it
/// exactly once.
pub async fn authorize(
    authenticator: Option<&Arc<dyn ProxyAuthenticator>>,
    headers: &HeaderMap,
) -> AuthDecision {
    let Some(authenticator) = authenticator else {
        return AuthDecision::Anonymous;
    };

    let Some(header) = headers.get(PROXY_AUTHORIZATION) else {
        return AuthDecision::Challenge;
    };

    let Some((username, password)) = decode_basic(header) else {
        warn!("Unparseable Proxy-Authorization header");
        return AuthDecision::Challenge;
    };

    if authenticator.authenticate(&username, &password).await {
        AuthDecision::Authenticated
    } else {
        AuthDecision::Challenge
    }
}

/// Parse a `Basic <base64(user:pass)>` header value
pub fn decode_basic(value: &HeaderValue) -> Option<(String, String)> {
    let raw = value.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (username, password) = credentials.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Build a 407 Proxy Authentication Required response naming the realm
pub fn challenge_response(realm: &str) -> ProxyResponse {
    Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header(
            PROXY_AUTHENTICATE,
            format!("Basic realm=\"{}\"", realm),
        )
        .body(Bytes::new())
        .expect("static challenge response is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuthenticator {
        inner: StaticProxyAuthenticator,
        calls: AtomicUsize,
    }

    impl CountingAuthenticator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: StaticProxyAuthenticator::new("user", "pass"),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProxyAuthenticator for CountingAuthenticator {
        async fn authenticate(&self, username: &str, password: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.authenticate(username, password).await
        }
    }

    fn headers_with(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = value {
            headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
    }

    #[tokio::test]
    async fn test_no_authenticator_is_anonymous() {
        let decision = authorize(None, &headers_with(Some(&basic("a", "b")))).await;
        assert_eq!(decision, AuthDecision::Anonymous);
    }

    #[tokio::test]
    async fn test_missing_header_challenges_without_invoking_authenticate() {
        let counting = CountingAuthenticator::new();
        let authenticator: Arc<dyn ProxyAuthenticator> = counting.clone();

        let decision = authorize(Some(&authenticator), &headers_with(None)).await;
        assert_eq!(decision, AuthDecision::Challenge);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unparseable_header_challenges_without_invoking_authenticate() {
        let counting = CountingAuthenticator::new();
        let authenticator: Arc<dyn ProxyAuthenticator> = counting.clone();

        let decision = authorize(Some(&authenticator), &headers_with(Some("Bearer tok"))).await;
        assert_eq!(decision, AuthDecision::Challenge);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_credentials_invoke_authenticate_exactly_once() {
        let counting = CountingAuthenticator::new();
        let authenticator: Arc<dyn ProxyAuthenticator> = counting.clone();

        let decision =
            authorize(Some(&authenticator), &headers_with(Some(&basic("user", "pass")))).await;
        assert_eq!(decision, AuthDecision::Authenticated);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials_invoke_authenticate_exactly_once() {
        let counting = CountingAuthenticator::new();
        let authenticator: Arc<dyn ProxyAuthenticator> = counting.clone();

        let decision =
            authorize(Some(&authenticator), &headers_with(Some(&basic("user", "wrong")))).await;
        assert_eq!(decision, AuthDecision::Challenge);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_basic() {
        let value = HeaderValue::from_str(&basic("user", "pa:ss")).unwrap();
        let (user, pass) = decode_basic(&value).unwrap();
        assert_eq!(user, "user");
        assert_eq!(pass, "pa:ss");

        assert!(decode_basic(&HeaderValue::from_static("Basic !!!")).is_none());
        assert!(decode_basic(&HeaderValue::from_static("Digest abc")).is_none());
    }

    #[test]
    fn test_challenge_names_the_realm() {
        let response = challenge_response("internal");
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers().get(PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"internal\""
        );
    }
}
