//! Hub connector: the spoke side of the star topology
//!
//! A hub connector owns one initiator socket context with two reserved
//! sockets — index 0 dials the primary hub URI, index 1 the failover.
//! The ladder:
//!
//! ```text
//! IDLE -> CONNECTING_PRIMARY -> CONNECTED_PRIMARY
//!              | failure            | drop
//!              v                    v
//!        CONNECTING_FAILOVER   CONNECTING_PRIMARY
//!              | failure
//!              v
//!        WAIT_FOR_RECONNECT --(reconnect timeout)--> CONNECTING_PRIMARY
//! ```
//!
//! A duplicate-VMAC NAK from either hub parks the connector in
//! `DUPLICATED_VMAC`; the owning node reacts by regenerating its VMAC and
//! restarting every role.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::bvlc::{DecodedMessage, ErrorCode, HubConnectorState};
use crate::socket::{ContextConfig, ContextKind, Output, ScResult, SocketContext};
use crate::telemetry::{ConnectionState, HubConnectionStatus};
use crate::util::Timer;
use crate::websocket::{
    ConnHandle, ContextId, EventSink, WebSocketEventKind, WebSocketProtocol, WebSocketTransport,
};

const PRIMARY: usize = 0;
const FAILOVER: usize = 1;

/// Ladder state of a hub connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    ConnectingPrimary,
    ConnectingFailover,
    ConnectedPrimary,
    ConnectedFailover,
    WaitForReconnect,
    WaitForCtxDeinit,
    DuplicatedVmac,
}

/// Events a hub connector reports to the node.
#[derive(Debug)]
pub enum HubConnectorEvent {
    ConnectedPrimary,
    ConnectedFailover,
    /// A frame arrived from the hub and passed the framing rules.
    Received { pdu: Vec<u8>, decoded: DecodedMessage },
    /// A hub rejected our VMAC; the node must regenerate and restart.
    DuplicatedVmac,
    Stopped,
}

/// Maintains the connection to a primary/failover hub pair.
pub struct HubConnector {
    ctx: SocketContext,
    state: ConnectorState,
    primary_url: String,
    failover_url: String,
    reconnect_timeout: Duration,
    reconnect: Timer,
    primary_status: HubConnectionStatus,
    failover_status: HubConnectionStatus,
}

impl HubConnector {
    /// Build a hub connector. `cfg` must describe an initiator context on
    /// the hub protocol; the URLs may be empty (an empty primary goes
    /// straight to the reconnect wait).
    pub fn new(
        cfg: ContextConfig,
        primary_url: String,
        failover_url: String,
        reconnect_timeout: Duration,
        transport: Arc<dyn WebSocketTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        debug_assert_eq!(cfg.kind, ContextKind::Initiator);
        debug_assert_eq!(cfg.proto, WebSocketProtocol::Hub);
        HubConnector {
            ctx: SocketContext::new(cfg, 2, transport, sink),
            state: ConnectorState::Idle,
            primary_url,
            failover_url,
            reconnect_timeout,
            reconnect: Timer::new(),
            primary_status: HubConnectionStatus::default(),
            failover_status: HubConnectionStatus::default(),
        }
    }

    pub fn ctx_id(&self) -> ContextId {
        self.ctx.id()
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Hub connector state as advertised on the wire and mirrored by the
    /// `SC_Hub_Connector_State` property.
    pub fn wire_state(&self) -> HubConnectorState {
        match self.state {
            ConnectorState::ConnectedPrimary => HubConnectorState::ConnectedToPrimary,
            ConnectorState::ConnectedFailover => HubConnectorState::ConnectedToFailover,
            _ => HubConnectorState::NoHubConnection,
        }
    }

    /// Last status record of the primary (or failover) hub connection.
    pub fn status(&self, primary: bool) -> &HubConnectionStatus {
        if primary {
            &self.primary_status
        } else {
            &self.failover_status
        }
    }

    pub fn stopped(&self) -> bool {
        self.state == ConnectorState::Idle
    }

    /// Start the connector and dial the primary hub.
    pub fn start(&mut self, now: Instant) -> ScResult<()> {
        self.ctx.start()?;
        self.try_connect(PRIMARY, now);
        Ok(())
    }

    /// Stop the connector; [`HubConnectorEvent::Stopped`] follows once
    /// both sockets are down.
    pub fn stop(&mut self, now: Instant) -> Vec<HubConnectorEvent> {
        if self.state == ConnectorState::WaitForCtxDeinit || self.state == ConnectorState::Idle {
            return Vec::new();
        }
        self.state = ConnectorState::WaitForCtxDeinit;
        let outputs = self.ctx.stop();
        self.process(outputs, now)
    }

    /// Send an already-encoded BVLC frame to the hub. Valid only while
    /// attached to one of the two hubs.
    pub fn send(&mut self, pdu: &[u8]) -> ScResult<()> {
        match self.state {
            ConnectorState::ConnectedPrimary => self.ctx.send(PRIMARY, pdu),
            ConnectorState::ConnectedFailover => self.ctx.send(FAILOVER, pdu),
            _ => Err(crate::socket::ScError::InvalidOperation),
        }
    }

    /// Route a transport event belonging to this connector's context.
    pub fn on_ws_event(
        &mut self,
        conn: Option<ConnHandle>,
        kind: WebSocketEventKind,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        let outputs = self.ctx.on_ws_event(conn, kind, now);
        self.process(outputs, now)
    }

    /// Run socket timers and the reconnect ladder.
    pub fn maintenance(&mut self, now: Instant) -> Vec<HubConnectorEvent> {
        let outputs = self.ctx.maintenance(now);
        let events = self.process(outputs, now);
        if self.state == ConnectorState::WaitForReconnect && self.reconnect.expired(now) {
            self.try_connect(PRIMARY, now);
        }
        events
    }

    fn url_for(&self, which: usize) -> &str {
        if which == PRIMARY {
            &self.primary_url
        } else {
            &self.failover_url
        }
    }

    fn try_connect(&mut self, which: usize, now: Instant) {
        self.state = if which == PRIMARY {
            ConnectorState::ConnectingPrimary
        } else {
            ConnectorState::ConnectingFailover
        };
        if self.url_for(which).is_empty() {
            self.state = ConnectorState::WaitForReconnect;
            self.reconnect.set(now, self.reconnect_timeout);
            return;
        }
        let url = self.url_for(which).to_string();
        debug!("hub connector dialing {}", url);
        if self.ctx.connect(which, &url).is_err() {
            if which == PRIMARY {
                self.try_connect(FAILOVER, now);
            } else {
                self.state = ConnectorState::WaitForReconnect;
                self.reconnect.set(now, self.reconnect_timeout);
            }
        }
    }

    fn update_status(
        &mut self,
        primary: bool,
        state: ConnectionState,
        error: Option<ErrorCode>,
        details: &str,
    ) {
        let status = if primary {
            &mut self.primary_status
        } else {
            &mut self.failover_status
        };
        status.state = state;
        match state {
            ConnectionState::NotConnected | ConnectionState::DisconnectedWithErrors => {
                status.disconnect_timestamp = crate::encoding::BacnetDateTime::now();
            }
            ConnectionState::Connected | ConnectionState::FailedToConnect => {
                status.connect_timestamp = crate::encoding::BacnetDateTime::now();
            }
        }
        status.error = error;
        status.error_details = crate::util::bounded_string(details, 128);
    }

    fn process(&mut self, outputs: Vec<Output>, now: Instant) -> Vec<HubConnectorEvent> {
        let mut events = Vec::new();
        for output in outputs {
            match output {
                Output::Connected { socket } => match (self.state, socket) {
                    (ConnectorState::ConnectingPrimary, PRIMARY) => {
                        self.state = ConnectorState::ConnectedPrimary;
                        self.update_status(true, ConnectionState::Connected, None, "");
                        events.push(HubConnectorEvent::ConnectedPrimary);
                    }
                    (ConnectorState::ConnectingFailover, FAILOVER) => {
                        self.state = ConnectorState::ConnectedFailover;
                        self.update_status(false, ConnectionState::Connected, None, "");
                        events.push(HubConnectorEvent::ConnectedFailover);
                    }
                    _ => {}
                },
                Output::Disconnected {
                    socket: _,
                    reason,
                    description,
                } => {
                    if reason == ErrorCode::NodeDuplicateVmac
                        && self.state != ConnectorState::WaitForCtxDeinit
                    {
                        let primary = self.state == ConnectorState::ConnectingPrimary;
                        self.update_status(
                            primary,
                            ConnectionState::FailedToConnect,
                            Some(reason),
                            &description,
                        );
                        self.state = ConnectorState::DuplicatedVmac;
                        events.push(HubConnectorEvent::DuplicatedVmac);
                        continue;
                    }
                    match self.state {
                        ConnectorState::ConnectingPrimary => {
                            self.update_status(
                                true,
                                ConnectionState::FailedToConnect,
                                Some(reason),
                                &description,
                            );
                            self.try_connect(FAILOVER, now);
                        }
                        ConnectorState::ConnectingFailover => {
                            self.update_status(
                                false,
                                ConnectionState::FailedToConnect,
                                Some(reason),
                                &description,
                            );
                            self.state = ConnectorState::WaitForReconnect;
                            self.reconnect.set(now, self.reconnect_timeout);
                        }
                        ConnectorState::ConnectedPrimary | ConnectorState::ConnectedFailover => {
                            let clean = reason == ErrorCode::WebsocketClosedByPeer
                                || reason == ErrorCode::Success;
                            let status_state = if clean {
                                ConnectionState::NotConnected
                            } else {
                                ConnectionState::DisconnectedWithErrors
                            };
                            let primary = self.state == ConnectorState::ConnectedPrimary;
                            self.update_status(primary, status_state, None, "");
                            self.try_connect(PRIMARY, now);
                        }
                        _ => {}
                    }
                }
                Output::Received { pdu, decoded, .. } => {
                    events.push(HubConnectorEvent::Received { pdu, decoded });
                }
                Output::Initialized => {}
                Output::Deinitialized => {
                    self.state = ConnectorState::Idle;
                    events.push(HubConnectorEvent::Stopped);
                }
                Output::FailedRequest { .. } => {}
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvlc;
    use crate::util::{DeviceUuid, VmacAddress};
    use crate::websocket::mock::MockTransport;
    use crate::websocket::WebSocketEvent;

    struct NullSink;

    impl EventSink for NullSink {
        fn dispatch(&self, _event: WebSocketEvent) {}
    }

    fn config() -> ContextConfig {
        ContextConfig {
            kind: ContextKind::Initiator,
            proto: WebSocketProtocol::Hub,
            port: 0,
            iface: None,
            credentials: Default::default(),
            local_vmac: VmacAddress::from([0x02, 0, 0, 0, 0, 1]),
            local_uuid: DeviceUuid::new([3; 16]),
            max_bvlc_len: 1476,
            max_npdu_len: 1440,
            connect_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
        }
    }

    fn connector(reconnect_s: u64) -> (HubConnector, Arc<MockTransport>) {
        let mock = MockTransport::new();
        let hc = HubConnector::new(
            config(),
            "wss://h1.example:4443/".to_string(),
            "wss://h2.example:4443/".to_string(),
            Duration::from_secs(reconnect_s),
            mock.clone(),
            Arc::new(NullSink),
        );
        (hc, mock)
    }

    fn fail(
        hc: &mut HubConnector,
        mock: &MockTransport,
        conn: ConnHandle,
        reason: ErrorCode,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        mock.fail_connection(conn, reason, "failed");
        hc.on_ws_event(
            Some(conn),
            WebSocketEventKind::Disconnected {
                reason,
                description: "failed".to_string(),
            },
            now,
        )
    }

    fn complete_handshake(
        hc: &mut HubConnector,
        mock: &MockTransport,
        conn: ConnHandle,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        hc.on_ws_event(Some(conn), WebSocketEventKind::Connected, now);
        hc.on_ws_event(Some(conn), WebSocketEventKind::Sendable, now);
        let frames = mock.sent_frames(conn);
        let request = bvlc::decode_message(frames.last().unwrap()).unwrap();
        mock.clear_sent(conn);
        let accept = bvlc::encode_connect_accept(
            request.header.message_id,
            &VmacAddress::from([0x02, 9, 9, 9, 9, 9]),
            &DeviceUuid::new([9; 16]),
            1476,
            1440,
        );
        hc.on_ws_event(Some(conn), WebSocketEventKind::Received { data: accept }, now)
    }

    #[test]
    fn test_primary_connects() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();
        assert_eq!(hc.state(), ConnectorState::ConnectingPrimary);

        let (conn, url) = mock.pending_connects()[0].clone();
        assert_eq!(url, "wss://h1.example:4443/");
        let events = complete_handshake(&mut hc, &mock, conn, t0);
        assert!(matches!(events[..], [HubConnectorEvent::ConnectedPrimary]));
        assert_eq!(hc.state(), ConnectorState::ConnectedPrimary);
        assert_eq!(hc.wire_state(), HubConnectorState::ConnectedToPrimary);
        assert_eq!(hc.status(true).state, ConnectionState::Connected);
    }

    #[test]
    fn test_failover_ladder() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();

        // primary refuses
        let (conn, _) = mock.pending_connects()[0].clone();
        fail(&mut hc, &mock, conn, ErrorCode::TcpConnectionRefused, t0);
        assert_eq!(hc.state(), ConnectorState::ConnectingFailover);
        assert_eq!(hc.status(true).state, ConnectionState::FailedToConnect);
        assert_eq!(hc.status(true).error, Some(ErrorCode::TcpConnectionRefused));
        assert_eq!(hc.status(true).error_details, "failed");

        // failover completes the handshake
        let (conn, url) = mock.pending_connects()[0].clone();
        assert_eq!(url, "wss://h2.example:4443/");
        let events = complete_handshake(&mut hc, &mock, conn, t0);
        assert!(matches!(events[..], [HubConnectorEvent::ConnectedFailover]));
        assert_eq!(hc.wire_state(), HubConnectorState::ConnectedToFailover);
        assert_eq!(hc.status(false).state, ConnectionState::Connected);
    }

    #[test]
    fn test_reconnect_wait_after_both_fail() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();

        let (conn, _) = mock.pending_connects()[0].clone();
        fail(&mut hc, &mock, conn, ErrorCode::TcpConnectionRefused, t0);
        let (conn, _) = mock.pending_connects()[0].clone();
        fail(&mut hc, &mock, conn, ErrorCode::TcpConnectionRefused, t0);
        assert_eq!(hc.state(), ConnectorState::WaitForReconnect);
        assert!(mock.pending_connects().is_empty());

        // before the timeout nothing happens
        hc.maintenance(t0 + Duration::from_secs(4));
        assert!(mock.pending_connects().is_empty());

        // the reconnect timer re-dials the primary
        hc.maintenance(t0 + Duration::from_secs(5));
        assert_eq!(hc.state(), ConnectorState::ConnectingPrimary);
        assert_eq!(mock.pending_connects().len(), 1);
    }

    #[test]
    fn test_drop_from_connected_retries_primary() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();
        let (conn, _) = mock.pending_connects()[0].clone();
        complete_handshake(&mut hc, &mock, conn, t0);

        hc.on_ws_event(
            Some(conn),
            WebSocketEventKind::Disconnected {
                reason: ErrorCode::WebsocketClosedByPeer,
                description: "closed".to_string(),
            },
            t0,
        );
        // clean close is recorded as not-connected, and the ladder starts
        // over at the primary
        assert_eq!(hc.status(true).state, ConnectionState::NotConnected);
        assert_eq!(hc.state(), ConnectorState::ConnectingPrimary);
    }

    #[test]
    fn test_duplicate_vmac_parks_connector() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();
        let (conn, _) = mock.pending_connects()[0].clone();

        let events = fail(&mut hc, &mock, conn, ErrorCode::NodeDuplicateVmac, t0);
        assert!(matches!(events[..], [HubConnectorEvent::DuplicatedVmac]));
        assert_eq!(hc.state(), ConnectorState::DuplicatedVmac);
        // no further dialing until the node restarts us
        assert!(mock.pending_connects().is_empty());
    }

    #[test]
    fn test_send_only_while_connected() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();
        assert!(hc.send(&[1, 2, 3]).is_err());

        let (conn, _) = mock.pending_connects()[0].clone();
        complete_handshake(&mut hc, &mock, conn, t0);
        let frame = bvlc::encode_encapsulated_npdu(1, None, Some(&VmacAddress::BROADCAST), &[0xAA]);
        hc.send(&frame).unwrap();
        hc.on_ws_event(Some(conn), WebSocketEventKind::Sendable, t0);
        assert_eq!(mock.sent_frames(conn), vec![frame]);
    }

    #[test]
    fn test_stop_reports_stopped() {
        let t0 = Instant::now();
        let (mut hc, mock) = connector(5);
        hc.start(t0).unwrap();
        let (conn, _) = mock.pending_connects()[0].clone();
        complete_handshake(&mut hc, &mock, conn, t0);

        let events = hc.stop(t0);
        assert!(events.is_empty());
        let events = hc.on_ws_event(
            Some(conn),
            WebSocketEventKind::Disconnected {
                reason: ErrorCode::Success,
                description: String::new(),
            },
            t0,
        );
        assert!(matches!(events[..], [HubConnectorEvent::Stopped]));
        assert!(hc.stopped());
    }
}
