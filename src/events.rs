//! Lifecycle event observers.
//!
//! Activity trackers receive ordered, read-only notifications from the
//! connection engine. They are injected as an explicit list at construction
//! time and invoked synchronously within the owning flow's task.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::flow::FlowContext;

/// One completed client exchange, as reported to activity trackers
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub flow_id: Uuid,
    pub client_addr: SocketAddr,
    pub method: String,
    pub target: String,
    pub status: u16,
    pub response_time_ms: u64,
    /// Chained-proxy address the exchange went through, or "direct"
    pub upstream: String,
    pub timestamp: DateTime<Utc>,
}

/// Observer of connection lifecycle events.
///
/// All methods are notifications: implementations receive shared references
/// and cannot mutate flow state. Default implementations ignore the event.
pub trait ActivityTracker: Send + Sync {
    fn client_connected(&self, _client_addr: SocketAddr) {}

    fn client_disconnected(&self, _client_addr: SocketAddr) {}

    fn request_received(&self, _flow: &FlowContext, _method: &str, _target: &str) {}

    fn response_sent(&self, _record: &RequestRecord) {}

    /// Reported when a blind tunnel closes, with bytes relayed in each direction
    fn bytes_transferred(&self, _flow: &FlowContext, _sent: u64, _received: u64) {}

    fn exception_caught(&self, _flow: &FlowContext, _error: &ProxyError) {}
}

/// Ordered set of activity trackers, notified in registration order
#[derive(Clone, Default)]
pub struct TrackerSet {
    trackers: Arc<Vec<Arc<dyn ActivityTracker>>>,
}

impl TrackerSet {
    pub fn new(trackers: Vec<Arc<dyn ActivityTracker>>) -> Self {
        Self {
            trackers: Arc::new(trackers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub(crate) fn client_connected(&self, client_addr: SocketAddr) {
        for tracker in self.trackers.iter() {
            tracker.client_connected(client_addr);
        }
    }

    pub(crate) fn client_disconnected(&self, client_addr: SocketAddr) {
        for tracker in self.trackers.iter() {
            tracker.client_disconnected(client_addr);
        }
    }

    pub(crate) fn request_received(&self, flow: &FlowContext, method: &str, target: &str) {
        for tracker in self.trackers.iter() {
            tracker.request_received(flow, method, target);
        }
    }

    pub(crate) fn response_sent(&self, record: &RequestRecord) {
        for tracker in self.trackers.iter() {
            tracker.response_sent(record);
        }
    }

    pub(crate) fn bytes_transferred(&self, flow: &FlowContext, sent: u64, received: u64) {
        for tracker in self.trackers.iter() {
            tracker.bytes_transferred(flow, sent, received);
        }
    }

    pub(crate) fn exception_caught(&self, flow: &FlowContext, error: &ProxyError) {
        for tracker in self.trackers.iter() {
            tracker.exception_caught(flow, error);
        }
    }
}

/// Reference tracker that emits each record as a structured log line
pub struct TracingActivityTracker;

impl ActivityTracker for TracingActivityTracker {
    fn response_sent(&self, record: &RequestRecord) {
        match serde_json::to_string(record) {
            Ok(json) => info!(target: "viaduct::access", "{}", json),
            Err(_) => info!(
                target: "viaduct::access",
                "{} {} -> {} ({}ms via {})",
                record.method, record.target, record.status, record.response_time_ms,
                record.upstream
            ),
        }
    }

    fn exception_caught(&self, flow: &FlowContext, error: &ProxyError) {
        info!(
            target: "viaduct::access",
            flow_id = %flow.id(),
            "exchange failed: {}",
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTracker {
        connected: AtomicUsize,
        responses: AtomicUsize,
    }

    impl ActivityTracker for CountingTracker {
        fn client_connected(&self, _client_addr: SocketAddr) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn response_sent(&self, _record: &RequestRecord) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record() -> RequestRecord {
        RequestRecord {
            flow_id: Uuid::new_v4(),
            client_addr: "127.0.0.1:5000".parse().unwrap(),
            method: "GET".to_string(),
            target: "http://example.com/".to_string(),
            status: 200,
            response_time_ms: 4,
            upstream: "direct".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_tracker_set_notifies_all() {
        let a = Arc::new(CountingTracker::default());
        let b = Arc::new(CountingTracker::default());
        let set = TrackerSet::new(vec![a.clone(), b.clone()]);

        set.client_connected("127.0.0.1:5000".parse().unwrap());
        set.response_sent(&record());
        set.response_sent(&record());

        assert_eq!(a.connected.load(Ordering::SeqCst), 1);
        assert_eq!(b.responses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_record_serializes() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains("\"status\":200"));
        assert!(json.contains("\"upstream\":\"direct\""));
    }
}
