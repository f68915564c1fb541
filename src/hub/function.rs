//! Hub function: the star-topology forwarder
//!
//! The hub function accepts spoke connections on the hub protocol and
//! relays every frame that carries a destination VMAC:
//!
//! - broadcast destination: the frame is copied once, the originating
//!   VMAC of the sending spoke is inserted, and the copy goes to every
//!   other CONNECTED spoke;
//! - unicast destination: the destination field is removed, the
//!   originating VMAC inserted, and the frame goes to the addressed
//!   spoke, or is dropped when no spoke owns that VMAC.
//!
//! Handshake, heartbeat and disconnect frames never reach this layer;
//! the sockets consume them. Per-peer connection status records and
//! failed connection requests are maintained here and mirrored into
//! Network-Port properties by the datalink maintenance tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::bvlc::{self, ErrorCode};
use crate::socket::{ContextConfig, ContextKind, Output, ScResult, SocketContext};
use crate::telemetry::{ConnectionState, FailedConnectionRequest, HubFunctionConnectionStatus};
use crate::encoding::BacnetDateTime;
use crate::websocket::{
    ConnHandle, ContextId, EventSink, WebSocketEventKind, WebSocketProtocol, WebSocketTransport,
};

/// Spoke connections a hub function accepts.
pub const HUB_FUNCTION_CONNECTIONS: usize = 10;

/// Bounded length of the per-peer status list.
const STATUS_LIST_MAX: usize = HUB_FUNCTION_CONNECTIONS * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubFunctionState {
    Idle,
    Starting,
    Started,
    Stopping,
}

/// Events a hub function reports to the node.
#[derive(Debug)]
pub enum HubFunctionEvent {
    Started,
    Stopped,
    /// A spoke was torn down over a duplicate VMAC; the node treats this
    /// like its own duplicate and restarts.
    DuplicatedVmac,
    /// An inbound connection attempt failed.
    FailedRequest(FailedConnectionRequest),
}

/// Accepts spoke connections and forwards frames among them.
pub struct HubFunction {
    ctx: SocketContext,
    state: HubFunctionState,
    status: VecDeque<HubFunctionConnectionStatus>,
}

impl HubFunction {
    /// Build a hub function over an acceptor context on the hub protocol.
    pub fn new(
        cfg: ContextConfig,
        transport: Arc<dyn WebSocketTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        debug_assert_eq!(cfg.kind, ContextKind::Acceptor);
        debug_assert_eq!(cfg.proto, WebSocketProtocol::Hub);
        HubFunction {
            ctx: SocketContext::new(cfg, HUB_FUNCTION_CONNECTIONS, transport, sink),
            state: HubFunctionState::Idle,
            status: VecDeque::new(),
        }
    }

    pub fn ctx_id(&self) -> ContextId {
        self.ctx.id()
    }

    pub fn started(&self) -> bool {
        self.state == HubFunctionState::Started
    }

    pub fn stopped(&self) -> bool {
        self.state == HubFunctionState::Idle
    }

    /// Per-peer connection status records, oldest first.
    pub fn status_list(&self) -> impl Iterator<Item = &HubFunctionConnectionStatus> {
        self.status.iter()
    }

    /// Start accepting spokes; [`HubFunctionEvent::Started`] follows once
    /// the server is listening.
    pub fn start(&mut self) -> ScResult<()> {
        self.ctx.start()?;
        self.state = HubFunctionState::Starting;
        Ok(())
    }

    /// Stop the hub function; [`HubFunctionEvent::Stopped`] follows.
    pub fn stop(&mut self, now: Instant) -> Vec<HubFunctionEvent> {
        if self.state == HubFunctionState::Idle || self.state == HubFunctionState::Stopping {
            return Vec::new();
        }
        self.state = HubFunctionState::Stopping;
        let outputs = self.ctx.stop();
        self.process(outputs, now)
    }

    /// Route a transport event belonging to this hub function's context.
    pub fn on_ws_event(
        &mut self,
        conn: Option<ConnHandle>,
        kind: WebSocketEventKind,
        now: Instant,
    ) -> Vec<HubFunctionEvent> {
        let outputs = self.ctx.on_ws_event(conn, kind, now);
        self.process(outputs, now)
    }

    /// Drain staged frames and run socket timers.
    pub fn maintenance(&mut self, now: Instant) -> Vec<HubFunctionEvent> {
        let outputs = self.ctx.maintenance(now);
        self.process(outputs, now)
    }

    fn status_for_vmac(&mut self, vmac: crate::util::VmacAddress) -> &mut HubFunctionConnectionStatus {
        if let Some(pos) = self.status.iter().position(|s| s.peer_vmac == vmac) {
            return &mut self.status[pos];
        }
        if self.status.len() >= STATUS_LIST_MAX {
            self.status.pop_front();
        }
        self.status.push_back(HubFunctionConnectionStatus {
            peer_vmac: vmac,
            ..Default::default()
        });
        let last = self.status.len() - 1;
        &mut self.status[last]
    }

    fn update_status(&mut self, socket: usize, connected: bool, reason: ErrorCode, description: &str) {
        let vmac = self.ctx.socket(socket).peer_vmac();
        if vmac.is_unspecified() {
            return;
        }
        let uuid = self.ctx.socket(socket).peer_uuid();
        let peer = self.ctx.peer_address(socket);
        let details = crate::util::bounded_string(description, 128);
        let status = self.status_for_vmac(vmac);
        status.peer_uuid = uuid;
        status.peer_address = peer;
        status.error = None;
        status.error_details = details;
        if connected {
            status.state = ConnectionState::Connected;
            status.connect_timestamp = BacnetDateTime::now();
            status.disconnect_timestamp = BacnetDateTime::unspecified();
        } else {
            status.disconnect_timestamp = BacnetDateTime::now();
            if reason == ErrorCode::WebsocketClosedByPeer || reason == ErrorCode::Success {
                status.state = ConnectionState::NotConnected;
            } else {
                status.state = ConnectionState::DisconnectedWithErrors;
                status.error = Some(reason);
            }
        }
    }

    fn forward(&mut self, from: usize, pdu: Vec<u8>, decoded: &bvlc::DecodedMessage) {
        // the socket layer already rejected frames with an origin or
        // without a dest on the hub protocol
        let Some(dest) = decoded.header.dest else {
            return;
        };
        let sender_vmac = self.ctx.socket(from).peer_vmac();

        if dest.is_broadcast() {
            let mut frame = pdu;
            bvlc::set_orig(&mut frame, &sender_vmac);
            for target in self.ctx.connected_sockets() {
                if target == from {
                    continue;
                }
                if let Err(e) = self.ctx.send(target, &frame) {
                    debug!("broadcast forward to socket {} failed: {}", target, e);
                }
            }
        } else {
            let Some(target) = self.ctx.find_socket_by_vmac(&dest) else {
                debug!("no spoke for dest vmac {}, frame dropped", dest);
                return;
            };
            let mut frame = pdu;
            bvlc::remove_dest_set_orig(&mut frame, &sender_vmac);
            if let Err(e) = self.ctx.send(target, &frame) {
                debug!("unicast forward to socket {} failed: {}", target, e);
            }
        }
    }

    fn process(&mut self, outputs: Vec<Output>, _now: Instant) -> Vec<HubFunctionEvent> {
        let mut events = Vec::new();
        for output in outputs {
            match output {
                Output::Connected { socket } => {
                    self.update_status(socket, true, ErrorCode::Success, "");
                }
                Output::Disconnected {
                    socket,
                    reason,
                    description,
                } => {
                    self.update_status(socket, false, reason, &description);
                    if reason == ErrorCode::NodeDuplicateVmac {
                        events.push(HubFunctionEvent::DuplicatedVmac);
                    }
                }
                Output::Received {
                    socket,
                    pdu,
                    decoded,
                } => {
                    self.forward(socket, pdu, &decoded);
                }
                Output::Initialized => {
                    self.state = HubFunctionState::Started;
                    events.push(HubFunctionEvent::Started);
                }
                Output::Deinitialized => {
                    self.state = HubFunctionState::Idle;
                    events.push(HubFunctionEvent::Stopped);
                }
                Output::FailedRequest {
                    peer,
                    vmac,
                    uuid,
                    error,
                    description,
                } => {
                    events.push(HubFunctionEvent::FailedRequest(FailedConnectionRequest {
                        timestamp: BacnetDateTime::now(),
                        peer_address: peer,
                        peer_vmac: vmac,
                        peer_uuid: uuid,
                        error: Some(error),
                        error_details: description,
                    }));
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bvlc::{BvlcFunction, Payload};
    use crate::util::{DeviceUuid, HostNPort, VmacAddress};
    use crate::websocket::mock::MockTransport;
    use crate::websocket::{ServerHandle, WebSocketEvent};

    struct NullSink;

    impl EventSink for NullSink {
        fn dispatch(&self, _event: WebSocketEvent) {}
    }

    fn peer_vmac(last: u8) -> VmacAddress {
        VmacAddress::from([0x02, 0x10, 0x20, 0x30, 0x40, last])
    }

    fn peer_uuid(last: u8) -> DeviceUuid {
        let mut octets = [0x33; 16];
        octets[15] = last;
        DeviceUuid::new(octets)
    }

    fn hub() -> (HubFunction, Arc<MockTransport>, ServerHandle) {
        let mock = MockTransport::new();
        let cfg = ContextConfig {
            kind: ContextKind::Acceptor,
            proto: WebSocketProtocol::Hub,
            port: 4443,
            iface: None,
            credentials: Default::default(),
            local_vmac: VmacAddress::from([0x02, 0, 0, 0, 0, 0x99]),
            local_uuid: DeviceUuid::new([1; 16]),
            max_bvlc_len: 1476,
            max_npdu_len: 1440,
            connect_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
        };
        let mut hf = HubFunction::new(cfg, mock.clone(), Arc::new(NullSink));
        hf.start().unwrap();
        let (server, _) = mock.servers()[0];
        let events = hf.on_ws_event(None, WebSocketEventKind::ServerStarted, Instant::now());
        assert!(matches!(events[..], [HubFunctionEvent::Started]));
        (hf, mock, server)
    }

    fn attach_peer(
        hf: &mut HubFunction,
        mock: &MockTransport,
        server: ServerHandle,
        last: u8,
        now: Instant,
    ) -> ConnHandle {
        let conn = mock
            .accept(server, HostNPort::Domain(format!("peer{}", last), 4443))
            .unwrap();
        hf.on_ws_event(Some(conn), WebSocketEventKind::Connected, now);
        let request =
            bvlc::encode_connect_request(0x0100 + last as u16, &peer_vmac(last), &peer_uuid(last), 1476, 1440);
        hf.on_ws_event(Some(conn), WebSocketEventKind::Received { data: request }, now);
        hf.on_ws_event(Some(conn), WebSocketEventKind::Sendable, now);
        mock.clear_sent(conn);
        conn
    }

    fn drain(
        hf: &mut HubFunction,
        mock: &MockTransport,
        conn: ConnHandle,
        now: Instant,
    ) -> Vec<Vec<u8>> {
        hf.on_ws_event(Some(conn), WebSocketEventKind::Sendable, now);
        let frames = mock.sent_frames(conn);
        mock.clear_sent(conn);
        frames
    }

    #[test]
    fn test_broadcast_forward() {
        let t0 = Instant::now();
        let (mut hf, mock, server) = hub();
        let c1 = attach_peer(&mut hf, &mock, server, 1, t0);
        let c2 = attach_peer(&mut hf, &mock, server, 2, t0);
        let c3 = attach_peer(&mut hf, &mock, server, 3, t0);

        let frame = bvlc::encode_encapsulated_npdu(
            77,
            None,
            Some(&VmacAddress::BROADCAST),
            &[0xAA, 0xBB],
        );
        hf.on_ws_event(Some(c1), WebSocketEventKind::Received { data: frame }, t0);
        hf.maintenance(t0);

        // sender receives nothing back
        assert!(drain(&mut hf, &mock, c1, t0).is_empty());

        for conn in [c2, c3] {
            let frames = drain(&mut hf, &mock, conn, t0);
            assert_eq!(frames.len(), 1);
            let decoded = bvlc::decode_message(&frames[0]).unwrap();
            assert_eq!(decoded.header.function, BvlcFunction::EncapsulatedNpdu);
            assert_eq!(decoded.header.origin, Some(peer_vmac(1)));
            assert_eq!(decoded.header.dest, Some(VmacAddress::BROADCAST));
            assert_eq!(decoded.payload, Payload::EncapsulatedNpdu(vec![0xAA, 0xBB]));
        }
    }

    #[test]
    fn test_unicast_forward() {
        let t0 = Instant::now();
        let (mut hf, mock, server) = hub();
        let c1 = attach_peer(&mut hf, &mock, server, 1, t0);
        let c2 = attach_peer(&mut hf, &mock, server, 2, t0);
        let c3 = attach_peer(&mut hf, &mock, server, 3, t0);

        let frame = bvlc::encode_encapsulated_npdu(78, None, Some(&peer_vmac(2)), &[0xCC]);
        hf.on_ws_event(Some(c1), WebSocketEventKind::Received { data: frame }, t0);
        hf.maintenance(t0);

        let frames = drain(&mut hf, &mock, c2, t0);
        assert_eq!(frames.len(), 1);
        let decoded = bvlc::decode_message(&frames[0]).unwrap();
        assert_eq!(decoded.header.origin, Some(peer_vmac(1)));
        assert!(decoded.header.dest.is_none());
        assert_eq!(decoded.payload, Payload::EncapsulatedNpdu(vec![0xCC]));

        assert!(drain(&mut hf, &mock, c1, t0).is_empty());
        assert!(drain(&mut hf, &mock, c3, t0).is_empty());
    }

    #[test]
    fn test_unknown_dest_dropped() {
        let t0 = Instant::now();
        let (mut hf, mock, server) = hub();
        let c1 = attach_peer(&mut hf, &mock, server, 1, t0);
        let c2 = attach_peer(&mut hf, &mock, server, 2, t0);

        let frame = bvlc::encode_encapsulated_npdu(79, None, Some(&peer_vmac(9)), &[0xDD]);
        hf.on_ws_event(Some(c1), WebSocketEventKind::Received { data: frame }, t0);
        hf.maintenance(t0);

        assert!(drain(&mut hf, &mock, c1, t0).is_empty());
        assert!(drain(&mut hf, &mock, c2, t0).is_empty());
    }

    #[test]
    fn test_status_records_lifecycle() {
        let t0 = Instant::now();
        let (mut hf, mock, server) = hub();
        let c1 = attach_peer(&mut hf, &mock, server, 1, t0);

        let status: Vec<_> = hf.status_list().collect();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].peer_vmac, peer_vmac(1));
        assert_eq!(status[0].state, ConnectionState::Connected);
        assert!(!status[0].connect_timestamp.is_unspecified());

        hf.on_ws_event(
            Some(c1),
            WebSocketEventKind::Disconnected {
                reason: ErrorCode::WebsocketError,
                description: "reset".to_string(),
            },
            t0,
        );
        let status: Vec<_> = hf.status_list().collect();
        assert_eq!(status[0].state, ConnectionState::DisconnectedWithErrors);
        assert_eq!(status[0].error, Some(ErrorCode::WebsocketError));
    }

    #[test]
    fn test_failed_request_surfaced() {
        let t0 = Instant::now();
        let (mut hf, mock, server) = hub();
        let _c1 = attach_peer(&mut hf, &mock, server, 1, t0);

        // a second device claims peer 1's vmac
        let conn = mock
            .accept(server, HostNPort::Domain("imp".into(), 4443))
            .unwrap();
        hf.on_ws_event(Some(conn), WebSocketEventKind::Connected, t0);
        let request = bvlc::encode_connect_request(0x0200, &peer_vmac(1), &peer_uuid(9), 1476, 1440);
        let events = hf.on_ws_event(Some(conn), WebSocketEventKind::Received { data: request }, t0);
        match &events[..] {
            [HubFunctionEvent::FailedRequest(record)] => {
                assert_eq!(record.peer_vmac, peer_vmac(1));
                assert_eq!(record.error, Some(ErrorCode::NodeDuplicateVmac));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }
}
