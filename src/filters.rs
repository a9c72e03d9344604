//! Request/response interception hooks.
//!
//! A filter set is created per originating client request (tunneled requests
//! included) and its four hooks are invoked exactly once per applicable
//! message, in pipeline order, synchronously within the owning connection's
//! task. A non-`None` return from either request hook short-circuits the
//! remaining pipeline stages and becomes the final response.

use bytes::Bytes;

use crate::flow::FlowContext;

/// A fully buffered request flowing through the filter pipeline
pub type ProxyRequest = http::Request<Bytes>;

/// A fully buffered response flowing through the filter pipeline
pub type ProxyResponse = http::Response<Bytes>;

/// Interception hooks for one originating client request
pub trait HttpFilters: Send {
    /// Invoked after the client request is parsed, before upstream dispatch
    fn client_to_proxy_request(&mut self, _request: &mut ProxyRequest) -> Option<ProxyResponse> {
        None
    }

    /// Invoked after the upstream link is established, before the request is
    /// written to it
    fn proxy_to_server_request(&mut self, _request: &mut ProxyRequest) -> Option<ProxyResponse> {
        None
    }

    /// Invoked for every upstream response, including the synthetic `200`
    /// that terminates CONNECT tunnel establishment
    fn server_to_proxy_response(&mut self, _response: &mut ProxyResponse) {}

    /// Invoked immediately before the response is written to the client
    fn proxy_to_client_response(&mut self, _response: &mut ProxyResponse) {}
}

/// Factory producing one [`HttpFilters`] instance per originating request
pub trait HttpFiltersFactory: Send + Sync {
    fn create(&self, original_request: &ProxyRequest, flow: &FlowContext) -> Box<dyn HttpFilters>;
}

/// Filter set that intercepts nothing
pub struct NoopFilters;

impl HttpFilters for NoopFilters {}

/// Factory for [`NoopFilters`]
pub struct NoopFiltersFactory;

impl HttpFiltersFactory for NoopFiltersFactory {
    fn create(&self, _original_request: &ProxyRequest, _flow: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(NoopFilters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn test_noop_filters_pass_everything_through() {
        let mut filters = NoopFilters;
        let mut request: ProxyRequest = Request::builder()
            .uri("http://example.com/")
            .body(Bytes::new())
            .unwrap();

        assert!(filters.client_to_proxy_request(&mut request).is_none());
        assert!(filters.proxy_to_server_request(&mut request).is_none());
    }
}
