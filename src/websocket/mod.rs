//! WebSocket transport contract for BACnet/SC
//!
//! BACnet/SC rides on TLS WebSocket connections negotiated with one of two
//! subprotocols: `hub.bsc.bacnet.org` for hub traffic and
//! `dc.bsc.bacnet.org` for direct connections (AB.7.1). This module
//! defines the contract the secure-connect core consumes:
//!
//! - [`WebSocketTransport`] — initiate and accept connections, request
//!   writable notifications, send single messages from within a dispatch
//!   callback, query peer addresses
//! - [`WebSocketEvent`] — the event set delivered to an [`EventSink`]:
//!   connected, disconnected (with reason), received, sendable,
//!   server-started, server-stopped
//! - [`TlsCredentials`] — CA chain, operational certificate and private
//!   key handed over as byte blobs at startup
//!
//! Two backends are provided: [`tungstenite::TungsteniteTransport`], the
//! production implementation on tokio-tungstenite with rustls, and
//! [`mock::MockTransport`], a deterministic in-memory backend used to
//! exercise the state machines without any networking.
//!
//! Transport rules the core relies on:
//!
//! - events for one connection are delivered in order;
//! - `request_send` never blocks: the sendable notification arrives later,
//!   from a transport task;
//! - `dispatch_send` hands exactly one WebSocket binary message to the
//!   writer and is only meaningful for a live connection.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bvlc::ErrorCode;
use crate::util::HostNPort;

pub mod mock;
pub mod tungstenite;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors surfaced by a WebSocket transport backend
#[derive(Debug)]
pub enum WebSocketError {
    /// The URL could not be parsed or uses an unsupported scheme.
    InvalidUrl(String),
    /// Certificate or key material could not be loaded.
    Tls(String),
    /// Network I/O error.
    Io(std::io::Error),
    /// The referenced connection or server no longer exists.
    NotConnected,
    /// The server socket could not be bound or started.
    ServerFailed(String),
}

impl fmt::Display for WebSocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebSocketError::InvalidUrl(url) => write!(f, "invalid websocket url: {}", url),
            WebSocketError::Tls(msg) => write!(f, "TLS error: {}", msg),
            WebSocketError::Io(e) => write!(f, "I/O error: {}", e),
            WebSocketError::NotConnected => write!(f, "websocket is not connected"),
            WebSocketError::ServerFailed(msg) => write!(f, "websocket server error: {}", msg),
        }
    }
}

impl Error for WebSocketError {}

impl From<std::io::Error> for WebSocketError {
    fn from(error: std::io::Error) -> Self {
        WebSocketError::Io(error)
    }
}

/// WebSocket subprotocol negotiated for an SC connection (AB.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebSocketProtocol {
    /// `hub.bsc.bacnet.org` — hub connector and hub function traffic.
    Hub,
    /// `dc.bsc.bacnet.org` — direct peer-to-peer connections.
    DirectConnect,
}

impl WebSocketProtocol {
    /// The `Sec-WebSocket-Protocol` token sent on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            WebSocketProtocol::Hub => "hub.bsc.bacnet.org",
            WebSocketProtocol::DirectConnect => "dc.bsc.bacnet.org",
        }
    }
}

impl fmt::Display for WebSocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one socket context within the process. Transport events are
/// routed back to their owning context by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

impl ContextId {
    /// Allocate a process-unique context id.
    pub fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Transport-assigned handle for a single WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u64);

/// Transport-assigned handle for a listening server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle(pub u64);

/// Certificate material for one context, provided as PEM byte blobs.
#[derive(Clone, Default)]
pub struct TlsCredentials {
    /// Issuer (CA) certificate chain used to verify the peer.
    pub ca_chain: Vec<u8>,
    /// Operational certificate chain presented to the peer.
    pub cert_chain: Vec<u8>,
    /// Private key matching the operational certificate.
    pub private_key: Vec<u8>,
}

impl fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key material stays out of logs
        f.debug_struct("TlsCredentials")
            .field("ca_chain_len", &self.ca_chain.len())
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key_len", &self.private_key.len())
            .finish()
    }
}

/// Event kinds delivered by a transport backend.
#[derive(Debug, Clone)]
pub enum WebSocketEventKind {
    /// The connection completed (initiator) or was accepted (acceptor).
    Connected,
    /// The connection closed; `reason` maps the transport-level cause to a
    /// BACnet error code, `description` is a UTF-8 detail string.
    Disconnected {
        reason: ErrorCode,
        description: String,
    },
    /// One WebSocket binary message arrived.
    Received { data: Vec<u8> },
    /// The connection is writable; the owner may call
    /// [`WebSocketTransport::dispatch_send`].
    Sendable,
    /// The acceptor server is listening.
    ServerStarted,
    /// The acceptor server stopped; all of its connections are gone.
    ServerStopped,
}

/// One transport event, routed to the owning context.
#[derive(Debug, Clone)]
pub struct WebSocketEvent {
    pub ctx: ContextId,
    /// Connection the event refers to; absent for server lifecycle events.
    pub conn: Option<ConnHandle>,
    pub kind: WebSocketEventKind,
}

/// Receiver of transport events. The implementation takes the process-wide
/// dispatch lock, routes the event into the owning state machine and
/// returns; it must not block on I/O.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: WebSocketEvent);
}

/// The transport consumed by the secure-connect core.
///
/// Methods never block on network I/O: `connect` and `start_server` spawn
/// background work and report completion through the sink; `request_send`
/// schedules a [`WebSocketEventKind::Sendable`] callback; `dispatch_send`
/// enqueues one message with the connection's writer.
pub trait WebSocketTransport: Send + Sync {
    /// Begin an outbound connection. The returned handle is live
    /// immediately; `Connected` or `Disconnected` arrives later.
    fn connect(
        &self,
        proto: WebSocketProtocol,
        url: &str,
        credentials: &TlsCredentials,
        connect_timeout: Duration,
        ctx: ContextId,
        sink: Arc<dyn EventSink>,
    ) -> Result<ConnHandle>;

    /// Close a connection. A `Disconnected` event follows.
    fn disconnect(&self, conn: ConnHandle);

    /// Request a `Sendable` callback for the connection.
    fn request_send(&self, conn: ConnHandle);

    /// Send one binary message. Valid while the connection is live,
    /// normally from within a `Sendable` callback.
    fn dispatch_send(&self, conn: ConnHandle, frame: &[u8]) -> Result<()>;

    /// Start an acceptor. `ServerStarted` arrives once listening; each
    /// accepted connection produces a `Connected` event with a fresh
    /// handle.
    fn start_server(
        &self,
        proto: WebSocketProtocol,
        port: u16,
        iface: Option<&str>,
        credentials: &TlsCredentials,
        connect_timeout: Duration,
        ctx: ContextId,
        sink: Arc<dyn EventSink>,
    ) -> Result<ServerHandle>;

    /// Stop an acceptor; its connections are closed and `ServerStopped`
    /// arrives last.
    fn stop_server(&self, server: ServerHandle);

    /// Peer address of an accepted connection, for telemetry.
    fn peer_address(&self, conn: ConnHandle) -> Option<HostNPort>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_strings() {
        assert_eq!(WebSocketProtocol::Hub.as_str(), "hub.bsc.bacnet.org");
        assert_eq!(
            WebSocketProtocol::DirectConnect.as_str(),
            "dc.bsc.bacnet.org"
        );
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_credentials_debug_hides_key() {
        let creds = TlsCredentials {
            ca_chain: vec![1, 2, 3],
            cert_chain: vec![4, 5],
            private_key: b"very secret".to_vec(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("private_key_len"));
    }
}
