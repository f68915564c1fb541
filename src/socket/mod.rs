//! BACnet/SC socket and socket context
//!
//! An [`ScSocket`] is one live SC association: a WebSocket connection plus
//! the per-peer state machine of AB.6.2 — connect/accept handshake,
//! heartbeat keep-alive, disconnect handshake and the framing rules a hub
//! enforces on its spokes. A [`SocketContext`] owns a fixed pool of
//! sockets together with the role configuration (initiator or acceptor,
//! hub or direct-connect protocol, credentials, identity and timeouts).
//!
//! # State machines
//!
//! Initiator path:
//!
//! ```text
//! IDLE -> AWAITING_WEBSOCKET -> AWAITING_ACCEPT -> CONNECTED
//!      -> DISCONNECTING -> IDLE
//! ```
//!
//! Acceptor path:
//!
//! ```text
//! IDLE -> AWAITING_REQUEST -> CONNECTED -> DISCONNECTING -> IDLE
//! ```
//!
//! Error exits close the WebSocket (`ERROR`), optionally after flushing
//! queued frames (`ERROR_FLUSH_TX`), and reach `IDLE` when the transport
//! reports the disconnect.
//!
//! # Event flow
//!
//! Transport events enter through [`SocketContext::on_ws_event`]; frames
//! received in CONNECTED or DISCONNECTING are staged and drained by
//! [`SocketContext::maintenance`], which also runs every timer. Both
//! methods return [`Output`] values the owning component (hub connector,
//! hub function or node switch) interprets. Neither blocks.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::bvlc::{
    self, BvlcFunction, DecodedMessage, ErrorClass, ErrorCode, Payload,
};
use crate::util::{DeviceUuid, HostNPort, Timer, VmacAddress};
use crate::websocket::{
    ConnHandle, ContextId, EventSink, ServerHandle, TlsCredentials, WebSocketEventKind,
    WebSocketProtocol, WebSocketTransport,
};
use crate::BVLC_SC_NPDU_MAX_SIZE;

/// Result type for secure-connect operations
pub type ScResult<T> = std::result::Result<T, ScError>;

/// Internal operation results of the secure-connect core
#[derive(Debug)]
pub enum ScError {
    /// Buffers or pool slots are exhausted.
    NoResources,
    /// An input parameter is invalid.
    BadParam,
    /// The operation is not valid in the current state.
    InvalidOperation,
    /// The underlying WebSocket transport failed.
    Transport(crate::websocket::WebSocketError),
}

impl fmt::Display for ScError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScError::NoResources => write!(f, "no resources"),
            ScError::BadParam => write!(f, "bad parameter"),
            ScError::InvalidOperation => write!(f, "invalid operation"),
            ScError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl Error for ScError {}

impl From<crate::websocket::WebSocketError> for ScError {
    fn from(error: crate::websocket::WebSocketError) -> Self {
        ScError::Transport(error)
    }
}

/// Role of a socket context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Opens outbound connections (hub connector, node switch initiator).
    Initiator,
    /// Accepts inbound connections (hub function, node switch acceptor).
    Acceptor,
}

/// Lifecycle state of a socket context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxState {
    Idle,
    Initializing,
    Initialized,
    Deinitializing,
}

/// State of one socket (AB.6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    AwaitingWebsocket,
    AwaitingRequest,
    AwaitingAccept,
    Connected,
    Disconnecting,
    Error,
    ErrorFlushTx,
}

/// Configuration of one socket context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub kind: ContextKind,
    pub proto: WebSocketProtocol,
    /// Listening port; acceptor contexts only.
    pub port: u16,
    /// Interface name to bind; acceptor contexts only.
    pub iface: Option<String>,
    pub credentials: TlsCredentials,
    pub local_vmac: VmacAddress,
    pub local_uuid: DeviceUuid,
    /// Largest BVLC message this datalink accepts.
    pub max_bvlc_len: u16,
    /// Largest NPDU this datalink handles.
    pub max_npdu_len: u16,
    /// AB.6.2 recommends 10 seconds.
    pub connect_timeout: std::time::Duration,
    /// 12.56.Y10 SC_Heartbeat_Timeout; recommended default 300 seconds.
    pub heartbeat_timeout: std::time::Duration,
    pub disconnect_timeout: std::time::Duration,
}

/// Frames buffered per socket, on top of one in-flight message each way.
const TX_QUEUED_FRAMES: usize = 2;

/// Events a context hands up to its owning component.
#[derive(Debug)]
pub enum Output {
    /// A socket completed its handshake.
    Connected { socket: usize },
    /// A socket reached IDLE; `reason` explains why.
    Disconnected {
        socket: usize,
        reason: ErrorCode,
        description: String,
    },
    /// A frame arrived on a CONNECTED (or DISCONNECTING) socket and
    /// passed the framing rules.
    Received {
        socket: usize,
        pdu: Vec<u8>,
        decoded: DecodedMessage,
    },
    /// The context finished starting (acceptor: server is listening).
    Initialized,
    /// The context reached IDLE; all sockets are down.
    Deinitialized,
    /// An inbound connection attempt failed; recorded in the
    /// failed-connection-requests telemetry list.
    FailedRequest {
        peer: HostNPort,
        vmac: VmacAddress,
        uuid: DeviceUuid,
        error: ErrorCode,
        description: String,
    },
}

/// One SC association.
#[derive(Debug)]
pub struct ScSocket {
    state: SocketState,
    conn: Option<ConnHandle>,
    reason: ErrorCode,
    reason_description: String,
    /// Connect/disconnect timeout timer.
    timer: Timer,
    heartbeat: Timer,
    peer_vmac: VmacAddress,
    peer_uuid: DeviceUuid,
    peer_max_bvlc: u16,
    peer_max_npdu: u16,
    message_id: u16,
    expected_connect_accept_message_id: u16,
    expected_disconnect_message_id: u16,
    expected_heartbeat_message_id: u16,
    tx: VecDeque<Vec<u8>>,
    tx_bytes: usize,
    rx: VecDeque<Vec<u8>>,
    rx_bytes: usize,
}

impl ScSocket {
    fn new() -> Self {
        ScSocket {
            state: SocketState::Idle,
            conn: None,
            reason: ErrorCode::Success,
            reason_description: String::new(),
            timer: Timer::new(),
            heartbeat: Timer::new(),
            peer_vmac: VmacAddress::UNSPECIFIED,
            peer_uuid: DeviceUuid::default(),
            peer_max_bvlc: 0,
            peer_max_npdu: 0,
            message_id: 0,
            expected_connect_accept_message_id: 0,
            expected_disconnect_message_id: 0,
            expected_heartbeat_message_id: 0,
            tx: VecDeque::new(),
            tx_bytes: 0,
            rx: VecDeque::new(),
            rx_bytes: 0,
        }
    }

    fn reset(&mut self) {
        *self = ScSocket::new();
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// VMAC of the connected peer.
    pub fn peer_vmac(&self) -> VmacAddress {
        self.peer_vmac
    }

    /// Device UUID of the connected peer.
    pub fn peer_uuid(&self) -> DeviceUuid {
        self.peer_uuid
    }

    /// Remote `max_bvlc_len` / `max_npdu_len` caps; zero unless the socket
    /// is CONNECTED or DISCONNECTING.
    pub fn peer_caps(&self) -> (u16, u16) {
        match self.state {
            SocketState::Connected | SocketState::Disconnecting => {
                (self.peer_max_bvlc, self.peer_max_npdu)
            }
            _ => (0, 0),
        }
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }
}

/// A pool of sockets sharing one role, credential set and identity.
pub struct SocketContext {
    id: ContextId,
    state: CtxState,
    cfg: ContextConfig,
    server: Option<ServerHandle>,
    sockets: Vec<ScSocket>,
    transport: Arc<dyn WebSocketTransport>,
    sink: Arc<dyn EventSink>,
}

impl SocketContext {
    /// Create a context with `pool_size` socket slots. The context is
    /// IDLE until [`SocketContext::start`].
    pub fn new(
        cfg: ContextConfig,
        pool_size: usize,
        transport: Arc<dyn WebSocketTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        SocketContext {
            id: ContextId::next(),
            state: CtxState::Idle,
            cfg,
            server: None,
            sockets: (0..pool_size).map(|_| ScSocket::new()).collect(),
            transport,
            sink,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> CtxState {
        self.state
    }

    pub fn kind(&self) -> ContextKind {
        self.cfg.kind
    }

    pub fn config(&self) -> &ContextConfig {
        &self.cfg
    }

    pub fn socket(&self, index: usize) -> &ScSocket {
        &self.sockets[index]
    }

    pub fn pool_size(&self) -> usize {
        self.sockets.len()
    }

    /// Indexes of sockets currently in CONNECTED state.
    pub fn connected_sockets(&self) -> Vec<usize> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SocketState::Connected)
            .map(|(i, _)| i)
            .collect()
    }

    /// Find a non-idle socket by peer VMAC.
    pub fn find_socket_by_vmac(&self, vmac: &VmacAddress) -> Option<usize> {
        self.sockets
            .iter()
            .position(|s| s.state != SocketState::Idle && s.peer_vmac == *vmac)
    }

    /// Find a non-idle socket by peer UUID.
    pub fn find_socket_by_uuid(&self, uuid: &DeviceUuid) -> Option<usize> {
        self.sockets
            .iter()
            .position(|s| s.state != SocketState::Idle && s.peer_uuid == *uuid)
    }

    /// Peer address of an accepted socket, for telemetry records.
    pub fn peer_address(&self, index: usize) -> HostNPort {
        self.sockets[index]
            .conn
            .and_then(|conn| self.transport.peer_address(conn))
            .unwrap_or(HostNPort::None)
    }

    /// Start the context. An initiator is usable immediately; an acceptor
    /// reports [`Output::Initialized`] once its server is listening.
    pub fn start(&mut self) -> ScResult<Vec<Output>> {
        if self.state != CtxState::Idle {
            return Err(ScError::InvalidOperation);
        }
        let mut outputs = Vec::new();
        match self.cfg.kind {
            ContextKind::Acceptor => {
                let server = self.transport.start_server(
                    self.cfg.proto,
                    self.cfg.port,
                    self.cfg.iface.as_deref(),
                    &self.cfg.credentials,
                    self.cfg.connect_timeout,
                    self.id,
                    self.sink.clone(),
                )?;
                self.server = Some(server);
                self.state = CtxState::Initializing;
            }
            ContextKind::Initiator => {
                self.state = CtxState::Initialized;
                outputs.push(Output::Initialized);
            }
        }
        Ok(outputs)
    }

    /// Stop the context cooperatively: close every socket and, for an
    /// acceptor, the server. [`Output::Deinitialized`] is reported once
    /// everything is down; it may be emitted synchronously when nothing
    /// was active.
    pub fn stop(&mut self) -> Vec<Output> {
        let mut outputs = Vec::new();
        if self.state == CtxState::Idle || self.state == CtxState::Deinitializing {
            return outputs;
        }
        self.state = CtxState::Deinitializing;
        match self.cfg.kind {
            ContextKind::Initiator => {
                let mut active = false;
                for socket in &self.sockets {
                    if socket.state != SocketState::Idle {
                        active = true;
                        if let Some(conn) = socket.conn {
                            self.transport.disconnect(conn);
                        }
                    }
                }
                if !active {
                    self.state = CtxState::Idle;
                    outputs.push(Output::Deinitialized);
                }
            }
            ContextKind::Acceptor => {
                if let Some(server) = self.server {
                    self.transport.stop_server(server);
                } else {
                    self.state = CtxState::Idle;
                    outputs.push(Output::Deinitialized);
                }
            }
        }
        outputs
    }

    /// Begin an outbound connection on socket `index`. Initiator contexts
    /// only.
    pub fn connect(&mut self, index: usize, url: &str) -> ScResult<()> {
        if self.state != CtxState::Initialized || self.cfg.kind != ContextKind::Initiator {
            return Err(ScError::InvalidOperation);
        }
        if index >= self.sockets.len() || self.sockets[index].state != SocketState::Idle {
            return Err(ScError::InvalidOperation);
        }
        let conn = self.transport.connect(
            self.cfg.proto,
            url,
            &self.cfg.credentials,
            self.cfg.connect_timeout,
            self.id,
            self.sink.clone(),
        )?;
        let socket = &mut self.sockets[index];
        socket.reset();
        socket.state = SocketState::AwaitingWebsocket;
        socket.conn = Some(conn);
        Ok(())
    }

    /// Begin an orderly disconnect of a CONNECTED socket.
    pub fn disconnect_socket(&mut self, index: usize, now: Instant) {
        if self.state != CtxState::Initialized
            || self.sockets[index].state != SocketState::Connected
        {
            return;
        }
        let message_id = self.sockets[index].next_message_id();
        self.sockets[index].expected_disconnect_message_id = message_id;
        self.sockets[index].state = SocketState::Disconnecting;
        let timeout = self.cfg.disconnect_timeout;
        self.sockets[index].timer.set(now, timeout);
        self.queue_frame(index, bvlc::encode_disconnect_request(message_id));
    }

    /// Queue a frame for transmission on a CONNECTED socket.
    pub fn send(&mut self, index: usize, pdu: &[u8]) -> ScResult<()> {
        self.send_parts(index, pdu, &[])
    }

    /// Queue a frame assembled from two parts (header + payload) without
    /// an intermediate copy by the caller.
    pub fn send_parts(&mut self, index: usize, part1: &[u8], part2: &[u8]) -> ScResult<()> {
        if part1.is_empty() {
            return Err(ScError::BadParam);
        }
        if self.state != CtxState::Initialized {
            return Err(ScError::InvalidOperation);
        }
        let socket = &mut self.sockets[index];
        if socket.state != SocketState::Connected {
            return Err(ScError::InvalidOperation);
        }
        let total = part1.len() + part2.len();
        if total > u16::MAX as usize {
            return Err(ScError::BadParam);
        }
        let budget = (self.cfg.max_bvlc_len as usize + 2) * TX_QUEUED_FRAMES;
        if socket.tx_bytes + total > budget {
            return Err(ScError::NoResources);
        }
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(part1);
        frame.extend_from_slice(part2);
        socket.tx.push_back(frame);
        socket.tx_bytes += total;
        if let Some(conn) = socket.conn {
            self.transport.request_send(conn);
        }
        Ok(())
    }

    fn queue_frame(&mut self, index: usize, frame: Vec<u8>) {
        let socket = &mut self.sockets[index];
        socket.tx_bytes += frame.len();
        socket.tx.push_back(frame);
        if let Some(conn) = socket.conn {
            self.transport.request_send(conn);
        }
    }

    fn find_socket_by_conn(&self, conn: ConnHandle) -> Option<usize> {
        self.sockets
            .iter()
            .position(|s| s.state != SocketState::Idle && s.conn == Some(conn))
    }

    fn find_free_socket(&self) -> Option<usize> {
        self.sockets.iter().position(|s| s.state == SocketState::Idle)
    }

    /// Move a socket to ERROR and close its WebSocket; the disconnect
    /// event will complete the transition to IDLE.
    fn process_error(&mut self, index: usize, reason: ErrorCode, description: &str) {
        let socket = &mut self.sockets[index];
        socket.state = SocketState::Error;
        socket.reason = reason;
        socket.reason_description = description.to_string();
        if let Some(conn) = socket.conn {
            self.transport.disconnect(conn);
        }
    }

    /// Send a BVLC-Result NAK using the socket's own message id, provided
    /// the offending message may be NAKed at all.
    fn send_protocol_error(
        &mut self,
        index: usize,
        decoded: &DecodedMessage,
        header_marker: Option<u8>,
        class: ErrorClass,
        code: ErrorCode,
        details: &'static str,
    ) {
        if !decoded.need_send_bvlc_result() {
            return;
        }
        let message_id = self.sockets[index].next_message_id();
        let function = decoded.header.function;
        let frame = bvlc::encode_result_nak(
            message_id,
            None,
            None,
            function,
            header_marker,
            class,
            code,
            Some(details),
        );
        self.queue_frame(index, frame);
    }

    /// Entry point for all transport events belonging to this context.
    pub fn on_ws_event(
        &mut self,
        conn: Option<ConnHandle>,
        kind: WebSocketEventKind,
        now: Instant,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();
        match kind {
            WebSocketEventKind::ServerStarted => {
                self.state = CtxState::Initialized;
                outputs.push(Output::Initialized);
            }
            WebSocketEventKind::ServerStopped => {
                for socket in &mut self.sockets {
                    socket.reset();
                }
                self.server = None;
                self.state = CtxState::Idle;
                outputs.push(Output::Deinitialized);
            }
            WebSocketEventKind::Connected => match self.cfg.kind {
                ContextKind::Initiator => {
                    if let Some(index) = conn.and_then(|c| self.find_socket_by_conn(c)) {
                        self.on_initiator_ws_connected(index, now);
                    }
                }
                ContextKind::Acceptor => {
                    let Some(conn) = conn else {
                        return outputs;
                    };
                    match self.find_free_socket() {
                        Some(index) => {
                            let socket = &mut self.sockets[index];
                            socket.reset();
                            socket.conn = Some(conn);
                            socket.state = SocketState::AwaitingRequest;
                            let timeout = self.cfg.connect_timeout;
                            socket.timer.set(now, timeout);
                        }
                        None => {
                            debug!("no free socket, dropping inbound connection");
                            self.transport.disconnect(conn);
                        }
                    }
                }
            },
            WebSocketEventKind::Disconnected {
                reason,
                description,
            } => {
                if let Some(index) = conn.and_then(|c| self.find_socket_by_conn(c)) {
                    outputs.extend(self.on_ws_disconnected(index, reason, description));
                }
            }
            WebSocketEventKind::Received { data } => {
                if let Some(index) = conn.and_then(|c| self.find_socket_by_conn(c)) {
                    outputs.extend(self.on_ws_received(index, data, now));
                }
            }
            WebSocketEventKind::Sendable => {
                if let Some(index) = conn.and_then(|c| self.find_socket_by_conn(c)) {
                    self.on_ws_sendable(index);
                }
            }
        }
        outputs
    }

    fn on_initiator_ws_connected(&mut self, index: usize, now: Instant) {
        if self.sockets[index].state != SocketState::AwaitingWebsocket {
            return;
        }
        let connect_timeout = self.cfg.connect_timeout;
        let message_id = crate::util::random_message_id();
        {
            let socket = &mut self.sockets[index];
            socket.state = SocketState::AwaitingAccept;
            socket.timer.set(now, connect_timeout);
            socket.message_id = message_id;
            socket.expected_connect_accept_message_id = message_id;
        }
        debug!(
            "sending connect request, vmac {} uuid {}",
            self.cfg.local_vmac, self.cfg.local_uuid
        );
        let frame = bvlc::encode_connect_request(
            message_id,
            &self.cfg.local_vmac,
            &self.cfg.local_uuid,
            self.cfg.max_bvlc_len,
            self.cfg.max_npdu_len,
        );
        self.queue_frame(index, frame);
    }

    fn on_ws_disconnected(
        &mut self,
        index: usize,
        reason: ErrorCode,
        description: String,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();
        let prior = self.sockets[index].state;
        let stored_reason = self.sockets[index].reason;
        let stored_description = self.sockets[index].reason_description.clone();
        // back to IDLE, keeping the peer identity readable until the slot
        // is reused (status records are written after this event)
        {
            let socket = &mut self.sockets[index];
            socket.state = SocketState::Idle;
            socket.conn = None;
            socket.tx.clear();
            socket.tx_bytes = 0;
            socket.rx.clear();
            socket.rx_bytes = 0;
            socket.timer.stop();
            socket.heartbeat.stop();
        }

        if self.state == CtxState::Deinitializing {
            if self
                .sockets
                .iter()
                .all(|s| s.state == SocketState::Idle)
                && self.server.is_none()
            {
                self.state = CtxState::Idle;
                outputs.push(Output::Deinitialized);
            }
            return outputs;
        }

        let (reason, description) =
            if prior == SocketState::Error || prior == SocketState::ErrorFlushTx {
                (stored_reason, stored_description)
            } else {
                (reason, description)
            };
        outputs.push(Output::Disconnected {
            socket: index,
            reason,
            description,
        });
        outputs
    }

    fn on_ws_received(&mut self, index: usize, data: Vec<u8>, now: Instant) -> Vec<Output> {
        match self.sockets[index].state {
            SocketState::AwaitingAccept => self.process_awaiting_accept(index, &data, now),
            SocketState::AwaitingRequest => self.process_awaiting_request(index, &data, now),
            SocketState::Connected | SocketState::Disconnecting => {
                // stage for the runloop; every frame counts two length
                // octets against the buffer budget
                let budget = (self.cfg.max_bvlc_len as usize + 2).max(512) * 8;
                if data.len() > BVLC_SC_NPDU_MAX_SIZE {
                    debug!("oversized frame of {} octets dropped", data.len());
                } else if self.sockets[index].rx_bytes + data.len() + 2 > budget {
                    debug!("rx buffer full, frame of {} octets dropped", data.len());
                } else {
                    let socket = &mut self.sockets[index];
                    socket.rx_bytes += data.len() + 2;
                    socket.rx.push_back(data);
                }
                Vec::new()
            }
            _ => {
                debug!(
                    "frame of {} octets dropped in state {:?}",
                    data.len(),
                    self.sockets[index].state
                );
                Vec::new()
            }
        }
    }

    fn on_ws_sendable(&mut self, index: usize) {
        let Some(conn) = self.sockets[index].conn else {
            return;
        };
        while let Some(frame) = self.sockets[index].tx.pop_front() {
            self.sockets[index].tx_bytes -= frame.len();
            if let Err(e) = self.transport.dispatch_send(conn, &frame) {
                warn!("send failed, closing socket: {}", e);
                self.process_error(index, ErrorCode::WebsocketError, "send failed");
                return;
            }
        }
        if self.sockets[index].state == SocketState::ErrorFlushTx {
            let reason = self.sockets[index].reason;
            let description = self.sockets[index].reason_description.clone();
            self.process_error(index, reason, &description);
        }
    }

    fn process_awaiting_accept(&mut self, index: usize, data: &[u8], now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        let decoded = match bvlc::decode_message(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("decoding failed awaiting accept: {}", e);
                return outputs;
            }
        };

        match (&decoded.header.function, &decoded.payload) {
            (
                BvlcFunction::ConnectAccept,
                Payload::ConnectAccept {
                    vmac,
                    uuid,
                    max_bvlc_len,
                    max_npdu_len,
                },
            ) => {
                if decoded.header.message_id
                    != self.sockets[index].expected_connect_accept_message_id
                {
                    debug!(
                        "connect accept with unexpected message id {:04x}",
                        decoded.header.message_id
                    );
                    return outputs;
                }
                let heartbeat = self.cfg.heartbeat_timeout;
                let socket = &mut self.sockets[index];
                socket.peer_vmac = *vmac;
                socket.peer_uuid = *uuid;
                socket.peer_max_bvlc = *max_bvlc_len;
                socket.peer_max_npdu = *max_npdu_len;
                socket.heartbeat.set(now, heartbeat);
                socket.state = SocketState::Connected;
                socket.timer.stop();
                outputs.push(Output::Connected { socket: index });
            }
            (BvlcFunction::Result, Payload::Result(result)) => {
                if result.function != BvlcFunction::ConnectRequest {
                    debug!("unexpected result for {:?} awaiting accept", result.function);
                } else if decoded.header.message_id
                    != self.sockets[index].expected_connect_accept_message_id
                {
                    debug!(
                        "result with unexpected message id {:04x}",
                        decoded.header.message_id
                    );
                } else if result
                    .error
                    .as_ref()
                    .map_or(false, |e| e.code == ErrorCode::NodeDuplicateVmac)
                {
                    // AB.6.2.2: the initiating peer must pick a new
                    // Random-48 VMAC; surface the error so the node can
                    // regenerate and restart
                    self.process_error(index, ErrorCode::NodeDuplicateVmac, "duplicate vmac");
                } else {
                    debug!("unexpected result error awaiting accept");
                }
            }
            (BvlcFunction::DisconnectRequest, _) | (BvlcFunction::DisconnectAck, _) => {
                self.process_error(
                    index,
                    ErrorCode::WebsocketClosedByPeer,
                    "peer disconnected during handshake",
                );
            }
            (function, _) => {
                debug!("unexpected {:?} discarded awaiting accept", function);
            }
        }
        outputs
    }

    fn process_awaiting_request(&mut self, index: usize, data: &[u8], now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        let decoded = match bvlc::decode_message(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("decoding failed awaiting request: {}", e);
                return outputs;
            }
        };
        let (vmac, uuid, max_bvlc_len, max_npdu_len) = match decoded.payload {
            Payload::ConnectRequest {
                vmac,
                uuid,
                max_bvlc_len,
                max_npdu_len,
            } => (vmac, uuid, max_bvlc_len, max_npdu_len),
            _ => {
                debug!(
                    "unexpected {:?} discarded awaiting request",
                    decoded.header.function
                );
                return outputs;
            }
        };
        let request_message_id = decoded.header.message_id;
        let heartbeat = self.cfg.heartbeat_timeout;

        // AB.6.2.3: a connect request from a known device UUID replaces
        // the existing connection
        if let Some(existing) = self.find_socket_by_uuid(&uuid).filter(|&e| e != index) {
            debug!("accepting connection from known uuid {} vmac {}", uuid, vmac);
            {
                let socket = &mut self.sockets[index];
                socket.peer_vmac = vmac;
                socket.peer_uuid = uuid;
                socket.peer_max_bvlc = max_bvlc_len;
                socket.peer_max_npdu = max_npdu_len;
            }
            let accept = bvlc::encode_connect_accept(
                request_message_id,
                &self.cfg.local_vmac,
                &self.cfg.local_uuid,
                self.cfg.max_bvlc_len,
                self.cfg.max_npdu_len,
            );
            self.queue_frame(index, accept);

            let old_message_id = self.sockets[existing].next_message_id();
            self.sockets[existing].expected_disconnect_message_id = old_message_id;
            self.queue_frame(existing, bvlc::encode_disconnect_request(old_message_id));

            let socket = &mut self.sockets[index];
            socket.heartbeat.set(now, heartbeat * 2);
            socket.timer.stop();
            socket.state = SocketState::Connected;
            outputs.push(Output::Connected { socket: index });
            return outputs;
        }

        // same VMAC under a different UUID is a duplicate on the network
        let duplicate_vmac = self
            .find_socket_by_vmac(&vmac)
            .filter(|&e| e != index)
            .is_some()
            || (vmac == self.cfg.local_vmac && uuid != self.cfg.local_uuid);
        if duplicate_vmac {
            warn!("rejecting connection with duplicate vmac {} from uuid {}", vmac, uuid);
            let nak = bvlc::encode_result_nak(
                request_message_id,
                None,
                None,
                BvlcFunction::ConnectRequest,
                None,
                ErrorClass::Communication,
                ErrorCode::NodeDuplicateVmac,
                None,
            );
            {
                let socket = &mut self.sockets[index];
                socket.state = SocketState::ErrorFlushTx;
                socket.reason = ErrorCode::NodeDuplicateVmac;
                socket.reason_description = "duplicate vmac".to_string();
            }
            outputs.push(Output::FailedRequest {
                peer: self.peer_address(index),
                vmac,
                uuid,
                error: ErrorCode::NodeDuplicateVmac,
                description: "duplicate vmac".to_string(),
            });
            self.queue_frame(index, nak);
            return outputs;
        }

        let accept = bvlc::encode_connect_accept(
            request_message_id,
            &self.cfg.local_vmac,
            &self.cfg.local_uuid,
            self.cfg.max_bvlc_len,
            self.cfg.max_npdu_len,
        );
        {
            let socket = &mut self.sockets[index];
            socket.peer_vmac = vmac;
            socket.peer_uuid = uuid;
            socket.peer_max_bvlc = max_bvlc_len;
            socket.peer_max_npdu = max_npdu_len;
            socket.heartbeat.set(now, heartbeat * 2);
            socket.timer.stop();
            socket.state = SocketState::Connected;
        }
        debug!("accepted connection from uuid {} with vmac {}", uuid, vmac);
        self.queue_frame(index, accept);
        outputs.push(Output::Connected { socket: index });
        outputs
    }

    /// Enforce the hub framing rules of AB.2.1 on a decoded frame; `Err`
    /// means the frame was handled (NAKed or dropped).
    fn check_hub_framing(
        &mut self,
        index: usize,
        decoded: &DecodedMessage,
    ) -> std::result::Result<(), ()> {
        if self.cfg.proto != WebSocketProtocol::Hub {
            return Ok(());
        }
        if !matches!(
            decoded.header.function,
            BvlcFunction::EncapsulatedNpdu
                | BvlcFunction::Advertisement
                | BvlcFunction::AdvertisementSolicitation
                | BvlcFunction::AddressResolution
                | BvlcFunction::AddressResolutionAck
                | BvlcFunction::Result
        ) {
            return Ok(());
        }
        match self.cfg.kind {
            ContextKind::Initiator => {
                // hub connector receiving from the hub
                if decoded.header.origin.is_none()
                    && decoded.header.function != BvlcFunction::Result
                {
                    self.send_protocol_error(
                        index,
                        decoded,
                        None,
                        ErrorClass::Communication,
                        ErrorCode::HeaderEncodingError,
                        "'Originating Virtual Address' field must be present",
                    );
                    return Err(());
                }
                if decoded
                    .header
                    .dest
                    .map_or(false, |dest| !dest.is_broadcast())
                {
                    self.send_protocol_error(
                        index,
                        decoded,
                        None,
                        ErrorClass::Communication,
                        ErrorCode::HeaderEncodingError,
                        "'Destination Virtual Address' field must be absent",
                    );
                    return Err(());
                }
            }
            ContextKind::Acceptor => {
                // hub function receiving from a node
                if decoded.header.dest.is_none() {
                    self.send_protocol_error(
                        index,
                        decoded,
                        None,
                        ErrorClass::Communication,
                        ErrorCode::HeaderEncodingError,
                        "'Destination Virtual Address' field must be present",
                    );
                    return Err(());
                }
                if decoded.header.origin.is_some() {
                    self.send_protocol_error(
                        index,
                        decoded,
                        None,
                        ErrorClass::Communication,
                        ErrorCode::HeaderEncodingError,
                        "'Originating Virtual Address' field must be absent",
                    );
                    return Err(());
                }
            }
        }
        Ok(())
    }

    fn process_staged_frame(&mut self, index: usize, data: Vec<u8>, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        let decoded = match bvlc::decode_message(&data) {
            Ok(decoded) => decoded,
            Err(e) => {
                // EA-001-4: frames under four octets are dropped without
                // a NAK
                if e.is_short_frame() {
                    debug!("frame under four octets dropped silently");
                    return outputs;
                }
                match BvlcFunction::try_from(data[0]) {
                    Ok(function) if function != BvlcFunction::Result => {
                        let message_id = self.sockets[index].next_message_id();
                        let frame = bvlc::encode_result_nak(
                            message_id,
                            None,
                            None,
                            function,
                            None,
                            e.class,
                            e.code,
                            e.details,
                        );
                        self.queue_frame(index, frame);
                    }
                    _ => debug!("undecodable frame dropped: {}", e),
                }
                return outputs;
            }
        };

        if self.check_hub_framing(index, &decoded).is_err() {
            return outputs;
        }

        // every valid frame restarts the heartbeat; the acceptor allows
        // twice the timeout before declaring the peer a zombie
        let heartbeat = match self.cfg.kind {
            ContextKind::Initiator => self.cfg.heartbeat_timeout,
            ContextKind::Acceptor => self.cfg.heartbeat_timeout * 2,
        };
        self.sockets[index].heartbeat.set(now, heartbeat);

        match self.sockets[index].state {
            SocketState::Connected => {
                outputs.extend(self.process_connected_frame(index, data, decoded))
            }
            SocketState::Disconnecting => {
                outputs.extend(self.process_disconnecting_frame(index, data, decoded))
            }
            _ => {}
        }
        outputs
    }

    fn process_connected_frame(
        &mut self,
        index: usize,
        data: Vec<u8>,
        decoded: DecodedMessage,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();
        match decoded.header.function {
            BvlcFunction::HeartbeatAck => {
                if decoded.header.message_id != self.sockets[index].expected_heartbeat_message_id {
                    debug!(
                        "heartbeat ack with unexpected message id {:04x}",
                        decoded.header.message_id
                    );
                }
            }
            BvlcFunction::HeartbeatRequest => {
                let frame = bvlc::encode_heartbeat_ack(decoded.header.message_id);
                self.queue_frame(index, frame);
            }
            BvlcFunction::DisconnectRequest => {
                let message_id = self.sockets[index].next_message_id();
                let frame = bvlc::encode_disconnect_ack(message_id);
                {
                    let socket = &mut self.sockets[index];
                    socket.reason = ErrorCode::WebsocketClosedByPeer;
                    socket.reason_description = "peer initiated disconnect".to_string();
                    socket.state = SocketState::ErrorFlushTx;
                }
                self.queue_frame(index, frame);
            }
            BvlcFunction::DisconnectAck => {
                // the remote believes we asked to disconnect; close and
                // let it clear itself up
                debug!("unexpected disconnect ack, closing socket");
                let socket = &mut self.sockets[index];
                socket.state = SocketState::Disconnecting;
                if let Some(conn) = socket.conn {
                    self.transport.disconnect(conn);
                }
            }
            BvlcFunction::Result => {
                if decoded.header.dest.is_none() && decoded.header.origin.is_none() {
                    debug!("unsolicited bvlc result dropped");
                } else {
                    outputs.push(Output::Received {
                        socket: index,
                        pdu: data,
                        decoded,
                    });
                }
            }
            BvlcFunction::EncapsulatedNpdu
            | BvlcFunction::AddressResolution
            | BvlcFunction::AddressResolutionAck
            | BvlcFunction::Advertisement
            | BvlcFunction::AdvertisementSolicitation
            | BvlcFunction::ProprietaryMessage => {
                outputs.push(Output::Received {
                    socket: index,
                    pdu: data,
                    decoded,
                });
            }
            BvlcFunction::ConnectRequest | BvlcFunction::ConnectAccept => {
                debug!(
                    "{:?} not valid in connected state, dropped",
                    decoded.header.function
                );
            }
        }
        outputs
    }

    fn process_disconnecting_frame(
        &mut self,
        index: usize,
        data: Vec<u8>,
        decoded: DecodedMessage,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();
        match &decoded.payload {
            Payload::DisconnectAck => {
                if decoded.header.message_id != self.sockets[index].expected_disconnect_message_id {
                    debug!(
                        "disconnect ack with unexpected message id {:04x}",
                        decoded.header.message_id
                    );
                }
                if let Some(conn) = self.sockets[index].conn {
                    self.transport.disconnect(conn);
                }
            }
            Payload::Result(result)
                if result.function == BvlcFunction::DisconnectRequest && result.is_nak() =>
            {
                debug!("got result nak on disconnect request");
                if let Some(conn) = self.sockets[index].conn {
                    self.transport.disconnect(conn);
                }
            }
            _ => {
                outputs.push(Output::Received {
                    socket: index,
                    pdu: data,
                    decoded,
                });
            }
        }
        outputs
    }

    /// Drain staged frames and run every socket timer. Called from the
    /// runloop at least once a second and after transport dispatches.
    pub fn maintenance(&mut self, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        if self.state != CtxState::Initialized && self.state != CtxState::Deinitializing {
            return outputs;
        }
        for index in 0..self.sockets.len() {
            loop {
                let Some(frame) = self.sockets[index].rx.pop_front() else {
                    break;
                };
                self.sockets[index].rx_bytes -= frame.len() + 2;
                outputs.extend(self.process_staged_frame(index, frame, now));
            }

            let state = self.sockets[index].state;
            let expired = self.sockets[index].timer.expired(now);
            match state {
                SocketState::AwaitingAccept | SocketState::AwaitingRequest if expired => {
                    self.process_error(index, ErrorCode::Timeout, "connect timed out");
                }
                SocketState::Disconnecting if expired => {
                    self.process_error(index, ErrorCode::Timeout, "disconnect timed out");
                }
                SocketState::Connected => {
                    if self.sockets[index].heartbeat.expired(now) {
                        match self.cfg.kind {
                            ContextKind::Initiator => {
                                let message_id = self.sockets[index].next_message_id();
                                self.sockets[index].expected_heartbeat_message_id = message_id;
                                debug!("sending heartbeat request {:04x}", message_id);
                                let heartbeat = self.cfg.heartbeat_timeout;
                                self.sockets[index].heartbeat.set(now, heartbeat);
                                self.queue_frame(index, bvlc::encode_heartbeat_request(message_id));
                            }
                            ContextKind::Acceptor => {
                                debug!("heartbeat expired, disconnecting zombie socket");
                                if let Some(conn) = self.sockets[index].conn {
                                    self.transport.disconnect(conn);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        outputs
    }
}
