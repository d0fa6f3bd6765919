//! Mock transport for testing.
//!
//! Every `open()` creates a [`MockConnection`] the test can drive: open it,
//! deliver frames, inject errors, drop it, and inspect what the provider
//! sent on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ConnectRequest, Connection, ConnectionId, EventSink, Transport, TransportEvent};
use crate::error::{Result, SyncError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct MockConnectionInner {
    sent: Vec<Vec<u8>>,
    closed: bool,
}

/// Test-side handle to one connection attempt.
#[derive(Debug, Clone)]
pub struct MockConnection {
    request: ConnectRequest,
    events: EventSink,
    inner: Arc<Mutex<MockConnectionInner>>,
}

impl MockConnection {
    pub fn id(&self) -> ConnectionId {
        self.events.connection_id()
    }

    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Report the connection as established.
    pub fn open(&self) {
        self.events.send(TransportEvent::Open);
    }

    /// Deliver an inbound frame.
    pub fn deliver(&self, data: Vec<u8>) {
        self.events.send(TransportEvent::Message(data));
    }

    /// Report a non-fatal error.
    pub fn fail(&self, error: &str) {
        self.events.send(TransportEvent::Error(error.to_string()));
    }

    /// Simulate the remote side going away.
    pub fn drop_connection(&self, reason: Option<&str>) {
        lock(&self.inner).closed = true;
        self.events
            .send(TransportEvent::Close(reason.map(str::to_string)));
    }

    /// Frames sent by the provider, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).sent.clone()
    }

    /// Forget frames captured so far.
    pub fn clear_sent(&self) {
        lock(&self.inner).sent.clear();
    }

    /// Whether the provider closed this connection (or it was dropped).
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

struct MockLink {
    inner: Arc<Mutex<MockConnectionInner>>,
}

impl Connection for MockLink {
    fn send(&mut self, data: Vec<u8>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(SyncError::TransportClosed);
        }
        inner.sent.push(data);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.inner).closed = true;
    }
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connections: Vec<MockConnection>,
    fail_next_open: Option<String>,
}

/// Transport whose connections are driven by the test.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All connection attempts so far, oldest first.
    pub fn connections(&self) -> Vec<MockConnection> {
        lock(&self.inner).connections.clone()
    }

    /// The most recent connection attempt.
    pub fn last(&self) -> Option<MockConnection> {
        lock(&self.inner).connections.last().cloned()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.inner).connections.len()
    }

    /// Make the next `open()` return an error.
    pub fn fail_next_open(&self, error: &str) {
        lock(&self.inner).fail_next_open = Some(error.to_string());
    }
}

impl Transport for MockTransport {
    fn open(&self, request: &ConnectRequest, events: EventSink) -> Result<Box<dyn Connection>> {
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.fail_next_open.take() {
            return Err(SyncError::Transport(error));
        }
        let shared = Arc::new(Mutex::new(MockConnectionInner::default()));
        inner.connections.push(MockConnection {
            request: request.clone(),
            events,
            inner: shared.clone(),
        });
        Ok(Box::new(MockLink { inner: shared }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn request() -> ConnectRequest {
        ConnectRequest {
            url: "ws://mock/room".to_string(),
            transports: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_connection_round_trip() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut link = transport.open(&request(), EventSink::new(3, tx)).unwrap();
        let handle = transport.last().unwrap();
        assert_eq!(handle.id(), 3);

        handle.open();
        handle.deliver(vec![1, 2]);
        assert_eq!(rx.recv().await.unwrap(), (3, TransportEvent::Open));
        assert_eq!(rx.recv().await.unwrap(), (3, TransportEvent::Message(vec![1, 2])));

        link.send(vec![9]).unwrap();
        assert_eq!(handle.sent(), vec![vec![9]]);

        link.close();
        assert!(handle.is_closed());
        assert!(link.send(vec![10]).is_err());
    }

    #[tokio::test]
    async fn test_fail_next_open() {
        let transport = MockTransport::new();
        transport.fail_next_open("refused");
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(transport.open(&request(), EventSink::new(1, tx.clone())).is_err());
        assert!(transport.open(&request(), EventSink::new(2, tx)).is_ok());
        assert_eq!(transport.open_count(), 1);
    }
}
