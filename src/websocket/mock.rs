//! Deterministic in-memory WebSocket backend
//!
//! Implements [`WebSocketTransport`] without any networking so the
//! secure-connect state machines can be driven event by event. Tests (or
//! simulations) decide when a pending connect completes or fails, inject
//! received frames, and inspect every frame the core handed to
//! `dispatch_send`.
//!
//! Because transport methods are invoked while the caller holds the
//! dispatch lock, the mock never calls back into the sink synchronously:
//! events are queued and delivered by [`MockTransport::pump`], which the
//! test calls from outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bvlc::ErrorCode;
use crate::util::HostNPort;
use crate::websocket::{
    ConnHandle, ContextId, EventSink, Result, ServerHandle, TlsCredentials, WebSocketError,
    WebSocketEvent, WebSocketEventKind, WebSocketProtocol, WebSocketTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Outbound connect issued, not yet completed by the test.
    Connecting,
    /// Live in both directions.
    Open,
    /// Closed; kept until the disconnect event has been pumped.
    Closed,
}

struct MockConn {
    ctx: ContextId,
    sink: Arc<dyn EventSink>,
    state: ConnState,
    url: Option<String>,
    proto: WebSocketProtocol,
    server: Option<ServerHandle>,
    peer: HostNPort,
    sent: Vec<Vec<u8>>,
}

struct MockServer {
    ctx: ContextId,
    sink: Arc<dyn EventSink>,
    proto: WebSocketProtocol,
    port: u16,
    running: bool,
}

#[derive(Default)]
struct MockInner {
    next_id: u64,
    conns: HashMap<u64, MockConn>,
    servers: HashMap<u64, MockServer>,
    queue: Vec<WebSocketEvent>,
}

impl MockInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`WebSocketTransport`] with explicit event pumping.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<MockInner>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        self.inner.lock().expect("mock transport poisoned")
    }

    fn queue_conn_event(
        inner: &mut MockInner,
        conn: ConnHandle,
        kind: WebSocketEventKind,
    ) -> bool {
        if let Some(entry) = inner.conns.get(&conn.0) {
            let event = WebSocketEvent {
                ctx: entry.ctx,
                conn: Some(conn),
                kind,
            };
            inner.queue.push(event);
            true
        } else {
            false
        }
    }

    /// Deliver every queued event. Returns the number delivered. Call
    /// repeatedly (or use [`MockTransport::pump_until_idle`]) since
    /// handlers typically trigger further transport calls.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let event = {
                let mut inner = self.lock();
                if inner.queue.is_empty() {
                    break;
                }
                inner.queue.remove(0)
            };
            let sink = {
                let inner = self.lock();
                match &event.conn {
                    Some(conn) => inner.conns.get(&conn.0).map(|c| c.sink.clone()),
                    None => None,
                }
                .or_else(|| {
                    inner
                        .servers
                        .values()
                        .find(|s| s.ctx == event.ctx)
                        .map(|s| s.sink.clone())
                })
            };
            if let Some(sink) = sink {
                sink.dispatch(event.clone());
            }
            // drop closed connections once their disconnect is delivered
            if let (Some(conn), WebSocketEventKind::Disconnected { .. }) = (&event.conn, &event.kind)
            {
                self.lock().conns.remove(&conn.0);
            }
            delivered += 1;
        }
        delivered
    }

    /// Pump until no handler produces further events.
    pub fn pump_until_idle(&self) {
        while self.pump() > 0 {}
    }

    /// Outbound connects that have not been completed or failed yet,
    /// with the URL each one targets.
    pub fn pending_connects(&self) -> Vec<(ConnHandle, String)> {
        let inner = self.lock();
        let mut pending: Vec<_> = inner
            .conns
            .iter()
            .filter(|(_, c)| c.state == ConnState::Connecting)
            .map(|(id, c)| (ConnHandle(*id), c.url.clone().unwrap_or_default()))
            .collect();
        pending.sort_by_key(|(handle, _)| handle.0);
        pending
    }

    /// Complete a pending outbound connect.
    pub fn complete_connect(&self, conn: ConnHandle) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns.get_mut(&conn.0) {
            entry.state = ConnState::Open;
        }
        Self::queue_conn_event(&mut inner, conn, WebSocketEventKind::Connected);
    }

    /// Fail a pending outbound connect (or drop a live connection).
    pub fn fail_connection(&self, conn: ConnHandle, reason: ErrorCode, description: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns.get_mut(&conn.0) {
            entry.state = ConnState::Closed;
        }
        Self::queue_conn_event(
            &mut inner,
            conn,
            WebSocketEventKind::Disconnected {
                reason,
                description: description.to_string(),
            },
        );
    }

    /// Simulate an inbound connection on a running server, returning the
    /// new connection handle.
    pub fn accept(&self, server: ServerHandle, peer: HostNPort) -> Option<ConnHandle> {
        let mut inner = self.lock();
        let (ctx, sink, proto) = match inner.servers.get(&server.0) {
            Some(entry) if entry.running => (entry.ctx, entry.sink.clone(), entry.proto),
            _ => return None,
        };
        let id = inner.next_id();
        inner.conns.insert(
            id,
            MockConn {
                ctx,
                sink,
                state: ConnState::Open,
                url: None,
                proto,
                server: Some(server),
                peer,
                sent: Vec::new(),
            },
        );
        let conn = ConnHandle(id);
        Self::queue_conn_event(&mut inner, conn, WebSocketEventKind::Connected);
        Some(conn)
    }

    /// Inject one received binary message on a live connection.
    pub fn deliver(&self, conn: ConnHandle, frame: &[u8]) {
        let mut inner = self.lock();
        Self::queue_conn_event(
            &mut inner,
            conn,
            WebSocketEventKind::Received {
                data: frame.to_vec(),
            },
        );
    }

    /// Frames handed to `dispatch_send` on this connection, in order.
    pub fn sent_frames(&self, conn: ConnHandle) -> Vec<Vec<u8>> {
        self.lock()
            .conns
            .get(&conn.0)
            .map(|c| c.sent.clone())
            .unwrap_or_default()
    }

    /// Drop the record of frames already inspected.
    pub fn clear_sent(&self, conn: ConnHandle) {
        if let Some(entry) = self.lock().conns.get_mut(&conn.0) {
            entry.sent.clear();
        }
    }

    /// Negotiated subprotocol of a connection.
    pub fn protocol(&self, conn: ConnHandle) -> Option<WebSocketProtocol> {
        self.lock().conns.get(&conn.0).map(|c| c.proto)
    }

    /// Running servers as `(handle, port)` pairs.
    pub fn servers(&self) -> Vec<(ServerHandle, u16)> {
        let inner = self.lock();
        let mut servers: Vec<_> = inner
            .servers
            .iter()
            .filter(|(_, s)| s.running)
            .map(|(id, s)| (ServerHandle(*id), s.port))
            .collect();
        servers.sort_by_key(|(handle, _)| handle.0);
        servers
    }

    /// Context id of the first running server, if any.
    pub fn server_ctx(&self) -> Option<ContextId> {
        let inner = self.lock();
        let mut servers: Vec<_> = inner.servers.iter().filter(|(_, s)| s.running).collect();
        servers.sort_by_key(|(id, _)| **id);
        servers.first().map(|(_, s)| s.ctx)
    }

    /// True while the connection exists and is not closed.
    pub fn is_open(&self, conn: ConnHandle) -> bool {
        self.lock()
            .conns
            .get(&conn.0)
            .map_or(false, |c| c.state == ConnState::Open)
    }
}

impl WebSocketTransport for MockTransport {
    fn connect(
        &self,
        proto: WebSocketProtocol,
        url: &str,
        _credentials: &TlsCredentials,
        _connect_timeout: Duration,
        ctx: ContextId,
        sink: Arc<dyn EventSink>,
    ) -> Result<ConnHandle> {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.conns.insert(
            id,
            MockConn {
                ctx,
                sink,
                state: ConnState::Connecting,
                url: Some(url.to_string()),
                proto,
                server: None,
                peer: HostNPort::None,
                sent: Vec::new(),
            },
        );
        Ok(ConnHandle(id))
    }

    fn disconnect(&self, conn: ConnHandle) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns.get_mut(&conn.0) {
            if entry.state != ConnState::Closed {
                entry.state = ConnState::Closed;
                Self::queue_conn_event(
                    &mut inner,
                    conn,
                    WebSocketEventKind::Disconnected {
                        reason: ErrorCode::Success,
                        description: "closed locally".to_string(),
                    },
                );
            }
        }
    }

    fn request_send(&self, conn: ConnHandle) {
        let mut inner = self.lock();
        let sendable_pending = inner.queue.iter().any(|event| {
            event.conn == Some(conn) && matches!(event.kind, WebSocketEventKind::Sendable)
        });
        if !sendable_pending {
            Self::queue_conn_event(&mut inner, conn, WebSocketEventKind::Sendable);
        }
    }

    fn dispatch_send(&self, conn: ConnHandle, frame: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        match inner.conns.get_mut(&conn.0) {
            Some(entry) if entry.state != ConnState::Closed => {
                entry.sent.push(frame.to_vec());
                Ok(())
            }
            _ => Err(WebSocketError::NotConnected),
        }
    }

    fn start_server(
        &self,
        proto: WebSocketProtocol,
        port: u16,
        _iface: Option<&str>,
        _credentials: &TlsCredentials,
        _connect_timeout: Duration,
        ctx: ContextId,
        sink: Arc<dyn EventSink>,
    ) -> Result<ServerHandle> {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.servers.insert(
            id,
            MockServer {
                ctx,
                sink: sink.clone(),
                proto,
                port,
                running: true,
            },
        );
        inner.queue.push(WebSocketEvent {
            ctx,
            conn: None,
            kind: WebSocketEventKind::ServerStarted,
        });
        Ok(ServerHandle(id))
    }

    fn stop_server(&self, server: ServerHandle) {
        let mut inner = self.lock();
        let ctx = match inner.servers.get_mut(&server.0) {
            Some(entry) if entry.running => {
                entry.running = false;
                entry.ctx
            }
            _ => return,
        };
        // close connections accepted by this server first
        let conns: Vec<u64> = inner
            .conns
            .iter()
            .filter(|(_, c)| c.server == Some(server) && c.state != ConnState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in conns {
            if let Some(entry) = inner.conns.get_mut(&id) {
                entry.state = ConnState::Closed;
            }
            Self::queue_conn_event(
                &mut inner,
                ConnHandle(id),
                WebSocketEventKind::Disconnected {
                    reason: ErrorCode::Success,
                    description: "server stopped".to_string(),
                },
            );
        }
        inner.queue.push(WebSocketEvent {
            ctx,
            conn: None,
            kind: WebSocketEventKind::ServerStopped,
        });
    }

    fn peer_address(&self, conn: ConnHandle) -> Option<HostNPort> {
        self.lock().conns.get(&conn.0).map(|c| c.peer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<WebSocketEvent>>,
    }

    impl EventSink for RecordingSink {
        fn dispatch(&self, event: WebSocketEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_connect_complete_and_deliver() {
        let mock = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let ctx = ContextId::next();

        let conn = mock
            .connect(
                WebSocketProtocol::Hub,
                "wss://hub.example:4443/",
                &TlsCredentials::default(),
                Duration::from_secs(5),
                ctx,
                sink.clone(),
            )
            .unwrap();
        assert_eq!(mock.pending_connects().len(), 1);

        mock.complete_connect(conn);
        mock.deliver(conn, &[1, 2, 3]);
        mock.pump_until_idle();

        let events = sink.events.lock().unwrap();
        assert!(matches!(events[0].kind, WebSocketEventKind::Connected));
        assert!(matches!(
            &events[1].kind,
            WebSocketEventKind::Received { data } if data == &[1, 2, 3]
        ));
    }

    #[test]
    fn test_server_lifecycle() {
        let mock = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let ctx = ContextId::next();

        let server = mock
            .start_server(
                WebSocketProtocol::DirectConnect,
                4443,
                None,
                &TlsCredentials::default(),
                Duration::from_secs(5),
                ctx,
                sink.clone(),
            )
            .unwrap();
        let conn = mock.accept(server, HostNPort::Domain("peer".into(), 1)).unwrap();
        mock.stop_server(server);
        mock.pump_until_idle();

        let events = sink.events.lock().unwrap();
        assert!(matches!(events[0].kind, WebSocketEventKind::ServerStarted));
        assert!(matches!(events[1].kind, WebSocketEventKind::Connected));
        assert!(matches!(
            events[2].kind,
            WebSocketEventKind::Disconnected { .. }
        ));
        assert!(matches!(events[3].kind, WebSocketEventKind::ServerStopped));
        assert_eq!(events[1].conn, Some(conn));
    }

    #[test]
    fn test_sendable_coalesced() {
        let mock = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let ctx = ContextId::next();
        let conn = mock
            .connect(
                WebSocketProtocol::Hub,
                "wss://hub/",
                &TlsCredentials::default(),
                Duration::from_secs(5),
                ctx,
                sink.clone(),
            )
            .unwrap();
        mock.complete_connect(conn);
        mock.request_send(conn);
        mock.request_send(conn);
        mock.pump_until_idle();
        let sendables = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e.kind, WebSocketEventKind::Sendable))
            .count();
        assert_eq!(sendables, 1);
    }
}
