//! Per-flow context shared by the paired client and server connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

/// One logical client-to-origin exchange.
///
/// Created when a client socket produces its first request and dropped with
/// the client connection. Owned by the connection's task; observers only ever
/// see a shared reference, which exposes no mutators.
#[derive(Debug)]
pub struct FlowContext {
    id: Uuid,
    client_addr: SocketAddr,
    started: Instant,
    timings: Mutex<HashMap<String, Duration>>,
}

impl FlowContext {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr,
            started: Instant::now(),
            timings: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Time since the client connection produced this flow
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record a named phase duration (resolve, connect, handshake, ...)
    pub(crate) fn record_timing(&self, key: &str, value: Duration) {
        self.timings.lock().insert(key.to_string(), value);
    }

    /// Snapshot of the recorded phase timings
    pub fn timings(&self) -> HashMap<String, Duration> {
        self.timings.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_flow_ids_are_unique() {
        let a = FlowContext::new(client_addr());
        let b = FlowContext::new(client_addr());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_timings_snapshot() {
        let flow = FlowContext::new(client_addr());
        flow.record_timing("connect", Duration::from_millis(12));
        flow.record_timing("handshake", Duration::from_millis(3));

        let timings = flow.timings();
        assert_eq!(timings.len(), 2);
        assert_eq!(timings["connect"], Duration::from_millis(12));
    }
}
