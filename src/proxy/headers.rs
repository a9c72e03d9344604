//! Hop-by-hop header policy.
//!
//! A fixed set of headers is stripped whenever a message crosses a hop
//! boundary, in either direction. `Proxy-Authorization` is the one
//! conditional exception; [`HopPolicy`] decides what, if anything, the next
//! hop gets to see.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};

use crate::proxy::chain::ChainedProxyCandidate;

/// Check if a header is a hop-by-hop header that must not cross a hop boundary
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

const STRIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove every hop-by-hop header, `Proxy-Authorization` included
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in STRIPPED {
        headers.remove(*name);
    }
}

/// Encode Basic credentials as a `Proxy-Authorization` header value
pub fn basic_credentials(username: &str, password: &str) -> HeaderValue {
    let encoded = BASE64.encode(format!("{}:{}", username, password).as_bytes());
    HeaderValue::from_str(&format!("Basic {}", encoded))
        .expect("base64 output is always a valid header value")
}

/// Decides the `Proxy-Authorization` treatment for one hop boundary.
///
/// The supported scenarios:
/// (a) only the local proxy authenticates — the client header is consumed
///     locally and nothing is forwarded;
/// (b) both authenticate — the client header is consumed and replaced with a
///     freshly issued header carrying the candidate's credentials;
/// (c) only the next hop authenticates — the client header passes through
///     untouched;
/// (d) neither authenticates — the header is absent throughout.
///
/// SOCKS candidates never receive an HTTP `Proxy-Authorization` header;
/// their credentials travel inside the SOCKS handshake.
pub struct HopPolicy<'a> {
    /// A `ProxyAuthenticator` is configured on the local proxy
    pub local_auth_configured: bool,
    /// The candidate the hop goes through
    pub candidate: &'a ChainedProxyCandidate,
}

impl HopPolicy<'_> {
    /// The `Proxy-Authorization` value the next hop should see, if any.
    ///
    /// `client_header` is the value the client sent, untouched.
    pub fn next_hop_authorization(
        &self,
        client_header: Option<&HeaderValue>,
    ) -> Option<HeaderValue> {
        let spec = match self.candidate.spec() {
            Some(spec) if spec.protocol.is_http() => spec,
            // Direct connections and SOCKS hops carry no HTTP proxy credentials.
            _ => return None,
        };

        if let Some(username) = &spec.username {
            let password = spec.password.as_deref().unwrap_or("");
            return Some(basic_credentials(username, password));
        }

        if !self.local_auth_configured {
            // The local proxy is not consuming the header; let a downstream
            // authenticating proxy see the original value.
            return client_header.cloned();
        }

        None
    }

    /// Apply the full request-direction policy: strip the fixed set, then
    /// attach whatever `Proxy-Authorization` the next hop is entitled to.
    pub fn prepare_request_headers(&self, headers: &mut HeaderMap) {
        let client_header = headers.get(PROXY_AUTHORIZATION).cloned();
        strip_hop_by_hop(headers);
        if let Some(value) = self.next_hop_authorization(client_header.as_ref()) {
            headers.insert(PROXY_AUTHORIZATION, value);
        }
    }
}

/// Response-direction sanitation for one hop boundary
pub fn prepare_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::chain::{ChainProtocol, ChainedProxySpec};

    fn http_candidate(credentials: bool) -> ChainedProxyCandidate {
        let mut spec = ChainedProxySpec::new("127.0.0.1:3128", ChainProtocol::Http);
        if credentials {
            spec = spec.with_credentials("chainuser", "chainpass");
        }
        ChainedProxyCandidate::chained(spec)
    }

    fn socks_candidate() -> ChainedProxyCandidate {
        let spec = ChainedProxySpec::new("127.0.0.1:1080", ChainProtocol::Socks5)
            .with_credentials("socksuser", "sockspass");
        ChainedProxyCandidate::chained(spec)
    }

    fn headers_with_client_auth() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("expires"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("proxy-authenticate", HeaderValue::from_static("Basic"));
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic Y2xpZW50OnNlY3JldA=="),
        );
        headers
    }

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop_header("Proxy-Authorization"));
        assert!(!is_hop_by_hop_header("Host"));
        assert!(!is_hop_by_hop_header("Content-Length"));
    }

    #[test]
    fn test_fixed_set_is_stripped_in_both_directions() {
        let mut headers = headers_with_client_auth();
        strip_hop_by_hop(&mut headers);

        for name in STRIPPED {
            assert!(!headers.contains_key(*name), "{} survived stripping", name);
        }
        assert!(headers.contains_key("host"));

        let mut response_headers = HeaderMap::new();
        response_headers.insert("connection", HeaderValue::from_static("close"));
        response_headers.insert("content-type", HeaderValue::from_static("text/plain"));
        prepare_response_headers(&mut response_headers);
        assert!(!response_headers.contains_key("connection"));
        assert!(response_headers.contains_key("content-type"));
    }

    #[test]
    fn test_scenario_a_local_auth_only_consumes_header() {
        let candidate = http_candidate(false);
        let policy = HopPolicy {
            local_auth_configured: true,
            candidate: &candidate,
        };

        let mut headers = headers_with_client_auth();
        policy.prepare_request_headers(&mut headers);
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_scenario_b_both_authenticate_replaces_header() {
        let candidate = http_candidate(true);
        let policy = HopPolicy {
            local_auth_configured: true,
            candidate: &candidate,
        };

        let mut headers = headers_with_client_auth();
        policy.prepare_request_headers(&mut headers);

        let value = headers.get(PROXY_AUTHORIZATION).unwrap();
        let expected = basic_credentials("chainuser", "chainpass");
        assert_eq!(value, &expected);
    }

    #[test]
    fn test_scenario_c_passthrough_preserves_header_byte_for_byte() {
        let candidate = http_candidate(false);
        let policy = HopPolicy {
            local_auth_configured: false,
            candidate: &candidate,
        };

        let mut headers = headers_with_client_auth();
        let original = headers.get(PROXY_AUTHORIZATION).cloned().unwrap();
        policy.prepare_request_headers(&mut headers);

        assert_eq!(headers.get(PROXY_AUTHORIZATION), Some(&original));
    }

    #[test]
    fn test_scenario_d_no_auth_anywhere_keeps_header_absent() {
        let candidate = ChainedProxyCandidate::direct();
        let policy = HopPolicy {
            local_auth_configured: false,
            candidate: &candidate,
        };

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        policy.prepare_request_headers(&mut headers);
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_direct_hop_strips_client_header() {
        let candidate = ChainedProxyCandidate::direct();
        let policy = HopPolicy {
            local_auth_configured: false,
            candidate: &candidate,
        };

        let mut headers = headers_with_client_auth();
        policy.prepare_request_headers(&mut headers);
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_socks_hop_never_sees_http_credentials() {
        let candidate = socks_candidate();
        let policy = HopPolicy {
            local_auth_configured: false,
            candidate: &candidate,
        };

        let mut headers = headers_with_client_auth();
        policy.prepare_request_headers(&mut headers);
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_fresh_upstream_header_is_independent_of_client_header() {
        let candidate = http_candidate(true);
        let policy = HopPolicy {
            local_auth_configured: false,
            candidate: &candidate,
        };

        // Even without local auth, a credentialed HTTP hop gets its own header.
        let mut headers = headers_with_client_auth();
        policy.prepare_request_headers(&mut headers);
        assert_eq!(
            headers.get(PROXY_AUTHORIZATION),
            Some(&basic_credentials("chainuser", "chainpass"))
        );
    }
}
