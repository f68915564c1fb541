use std::sync::Arc;
use std::time::{Duration, Instant};

use super::*;
use crate::bvlc::HubConnectorState;
use crate::websocket::mock::MockTransport;
use crate::websocket::WebSocketEvent;

struct NullSink;

impl EventSink for NullSink {
    fn dispatch(&self, _event: WebSocketEvent) {}
}

fn local_vmac() -> VmacAddress {
    VmacAddress::from([0x02, 0, 0, 0, 0, 0x11])
}

fn hub_vmac() -> VmacAddress {
    VmacAddress::from([0x02, 0xFF, 0, 0, 0, 0x01])
}

fn peer_vmac(last: u8) -> VmacAddress {
    VmacAddress::from([0x02, 0x77, 0, 0, 0, last])
}

fn base_config() -> NodeConfig {
    NodeConfig {
        credentials: Default::default(),
        local_vmac: local_vmac(),
        local_uuid: DeviceUuid::new([0x11; 16]),
        max_bvlc_len: 1476,
        max_npdu_len: 1440,
        connect_timeout: Duration::from_secs(10),
        heartbeat_timeout: Duration::from_secs(300),
        disconnect_timeout: Duration::from_secs(10),
        reconnect_timeout: Duration::from_secs(5),
        address_resolution_timeout: Duration::from_secs(10),
        address_resolution_freshness: Duration::from_secs(60),
        primary_hub_uri: "wss://hub1.example:4443/".to_string(),
        failover_hub_uri: "wss://hub2.example:4443/".to_string(),
        iface: None,
        hub_function_enabled: false,
        hub_function_port: 4443,
        direct_connect_initiate_enabled: false,
        direct_connect_accept_enabled: false,
        direct_connect_port: 4444,
        direct_connect_accept_uris: vec!["wss://me.example:4444/".to_string()],
    }
}

fn node_with(conf: NodeConfig) -> (ScNode, Arc<MockTransport>) {
    let mock = MockTransport::new();
    let node = ScNode::new(conf, mock.clone(), Arc::new(NullSink));
    (node, mock)
}

fn hub_ctx(node: &ScNode) -> ContextId {
    node.hub_connector.as_ref().unwrap().ctx_id()
}

/// Complete the hub handshake of the pending outbound connection and
/// return its transport handle.
fn attach_to_hub(node: &mut ScNode, mock: &MockTransport, now: Instant) -> ConnHandle {
    let ctx = hub_ctx(node);
    let (conn, _) = mock.pending_connects()[0].clone();
    node.on_ws_event(ctx, Some(conn), WebSocketEventKind::Connected, now);
    mock.complete_connect(conn);
    node.on_ws_event(ctx, Some(conn), WebSocketEventKind::Sendable, now);
    let frames = mock.sent_frames(conn);
    let request = bvlc::decode_message(frames.last().unwrap()).unwrap();
    mock.clear_sent(conn);
    let accept = bvlc::encode_connect_accept(
        request.header.message_id,
        &hub_vmac(),
        &DeviceUuid::new([0xFF; 16]),
        1476,
        1440,
    );
    node.on_ws_event(ctx, Some(conn), WebSocketEventKind::Received { data: accept }, now);
    conn
}

/// Deliver a frame as if the hub forwarded it, and drain the node's
/// response frames.
fn hub_roundtrip(
    node: &mut ScNode,
    mock: &MockTransport,
    conn: ConnHandle,
    frame: Vec<u8>,
    now: Instant,
) -> (Vec<NodeEvent>, Vec<Vec<u8>>) {
    let ctx = hub_ctx(node);
    node.on_ws_event(ctx, Some(conn), WebSocketEventKind::Received { data: frame }, now);
    let mut events = node.maintenance(now);
    let more = node.on_ws_event(ctx, Some(conn), WebSocketEventKind::Sendable, now);
    events.extend(more);
    let frames = mock.sent_frames(conn);
    mock.clear_sent(conn);
    (events, frames)
}

#[test]
fn test_start_with_hub_connector_only_is_immediate() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    let events = node.start(t0).unwrap();
    assert!(matches!(events[..], [NodeEvent::Started]));
    assert!(node.started());
    assert_eq!(node.local_vmac(), local_vmac());
    assert_eq!(mock.pending_connects().len(), 1);
}

#[test]
fn test_advertisement_solicitation_answered() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    node.start(t0).unwrap();
    let conn = attach_to_hub(&mut node, &mock, t0);
    assert_eq!(node.hub_connector_state(), HubConnectorState::ConnectedToPrimary);

    let solicitation =
        bvlc::encode_advertisement_solicitation(0x2222, Some(&peer_vmac(1)), None);
    let (events, frames) = hub_roundtrip(&mut node, &mock, conn, solicitation, t0);
    assert!(events.is_empty());
    assert_eq!(frames.len(), 1);
    let advert = bvlc::decode_message(&frames[0]).unwrap();
    assert_eq!(advert.header.dest, Some(peer_vmac(1)));
    match advert.payload {
        Payload::Advertisement {
            hub_status,
            support,
            max_bvlc_len,
            max_npdu_len,
        } => {
            assert_eq!(hub_status, HubConnectorState::ConnectedToPrimary);
            assert_eq!(support, DirectConnectionSupport::Unsupported);
            assert_eq!(max_bvlc_len, 1476);
            assert_eq!(max_npdu_len, 1440);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_address_resolution_nak_when_accept_disabled() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    node.start(t0).unwrap();
    let conn = attach_to_hub(&mut node, &mock, t0);

    let resolution = bvlc::encode_address_resolution(0x3333, Some(&peer_vmac(1)), None);
    let (_, frames) = hub_roundtrip(&mut node, &mock, conn, resolution, t0);
    assert_eq!(frames.len(), 1);
    let nak = bvlc::decode_message(&frames[0]).unwrap();
    match nak.payload {
        Payload::Result(result) => {
            assert!(result.is_nak());
            assert_eq!(result.function, BvlcFunction::AddressResolution);
            assert_eq!(
                result.error.unwrap().code,
                ErrorCode::OptionalFunctionalityNotSupported
            );
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_address_resolution_ack_when_accept_enabled() {
    let t0 = Instant::now();
    let mut conf = base_config();
    conf.direct_connect_accept_enabled = true;
    let (mut node, mock) = node_with(conf);
    node.start(t0).unwrap();

    // the switch acceptor must come up before the node reports started
    assert!(!node.started());
    assert!(node.node_switch.as_ref().unwrap().accepts_connections());
    let acceptor_ctx = mock_server_ctx(&mock);
    let events = node.on_ws_event(acceptor_ctx, None, WebSocketEventKind::ServerStarted, t0);
    assert!(matches!(events[..], [NodeEvent::Started]));

    let conn = attach_to_hub(&mut node, &mock, t0);
    let resolution = bvlc::encode_address_resolution(0x4444, Some(&peer_vmac(1)), None);
    let (_, frames) = hub_roundtrip(&mut node, &mock, conn, resolution, t0);
    assert_eq!(frames.len(), 1);
    let ack = bvlc::decode_message(&frames[0]).unwrap();
    assert_eq!(ack.header.function, BvlcFunction::AddressResolutionAck);
    assert_eq!(ack.header.message_id, 0x4444);
    assert_eq!(ack.header.dest, Some(peer_vmac(1)));
    assert_eq!(
        ack.payload,
        Payload::AddressResolutionAck("wss://me.example:4444/".to_string())
    );
}

#[test]
fn test_must_understand_option_naked() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    node.start(t0).unwrap();
    let conn = attach_to_hub(&mut node, &mock, t0);

    let mut frame =
        bvlc::encode_encapsulated_npdu(0x5555, Some(&peer_vmac(2)), None, &[0xAA, 0xBB]);
    bvlc::add_destination_option(
        &mut frame,
        &crate::bvlc::HeaderOption::proprietary(true, 999, 1, vec![]),
    )
    .unwrap();

    let (events, frames) = hub_roundtrip(&mut node, &mock, conn, frame, t0);
    // the frame is dropped, not delivered
    assert!(events.is_empty());
    assert_eq!(frames.len(), 1);
    let nak = bvlc::decode_message(&frames[0]).unwrap();
    assert_eq!(nak.header.dest, Some(peer_vmac(2)));
    match nak.payload {
        Payload::Result(result) => {
            assert!(result.is_nak());
            let error = result.error.unwrap();
            assert_eq!(error.code, ErrorCode::HeaderNotUnderstood);
            assert_ne!(error.header_marker, 0);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn test_npdu_delivered_to_upper_layer() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    node.start(t0).unwrap();
    let conn = attach_to_hub(&mut node, &mock, t0);

    let frame = bvlc::encode_encapsulated_npdu(
        0x6666,
        Some(&peer_vmac(3)),
        Some(&VmacAddress::BROADCAST),
        &[0x01, 0x02, 0x03],
    );
    let (events, frames) = hub_roundtrip(&mut node, &mock, conn, frame.clone(), t0);
    assert!(frames.is_empty());
    match &events[..] {
        [NodeEvent::ReceivedNpdu { pdu }] => assert_eq!(*pdu, frame),
        other => panic!("unexpected events {:?}", other),
    }
}

#[test]
fn test_duplicate_vmac_triggers_restart_with_new_vmac() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    node.start(t0).unwrap();
    let old_vmac = node.local_vmac();
    let ctx = hub_ctx(&node);

    let (conn, _) = mock.pending_connects()[0].clone();
    mock.fail_connection(conn, ErrorCode::NodeDuplicateVmac, "duplicate vmac");
    let events = node.on_ws_event(
        ctx,
        Some(conn),
        WebSocketEventKind::Disconnected {
            reason: ErrorCode::NodeDuplicateVmac,
            description: "duplicate vmac".to_string(),
        },
        t0,
    );
    // hub-connector-only node: stop and restart complete synchronously
    assert!(matches!(events[..], [NodeEvent::Restarted]));
    assert!(node.started());
    assert_ne!(node.local_vmac(), old_vmac);
    // the restarted hub connector is dialing again
    assert_eq!(mock.pending_connects().len(), 1);
}

#[test]
fn test_address_resolution_nak_caches_negative_record() {
    let t0 = Instant::now();
    let (mut node, mock) = node_with(base_config());
    node.start(t0).unwrap();
    let conn = attach_to_hub(&mut node, &mock, t0);

    let nak = bvlc::encode_result_nak(
        0x7777,
        Some(&peer_vmac(4)),
        None,
        BvlcFunction::AddressResolution,
        None,
        ErrorClass::Communication,
        ErrorCode::OptionalFunctionalityNotSupported,
        None,
    );
    let (events, _) = hub_roundtrip(&mut node, &mock, conn, nak, t0);
    assert!(matches!(events[..], [NodeEvent::ReceivedResult { .. }]));
    // negative record: a lookup still misses
    assert!(node.cache.lookup(&peer_vmac(4), t0).is_none());
}

#[test]
fn test_parse_uri_blob() {
    let urls = parse_uri_blob("wss://a:1/ wss://b:2/  wss://c:3/", 128, 4);
    assert_eq!(urls, vec!["wss://a:1/", "wss://b:2/", "wss://c:3/"]);

    // oversized entries are skipped
    let long = format!("wss://{}:4/", "x".repeat(140));
    let urls = parse_uri_blob(&format!("{} wss://ok:5/", long), 128, 4);
    assert_eq!(urls, vec!["wss://ok:5/"]);

    // the count cap truncates
    let urls = parse_uri_blob("a b c d e f", 128, 4);
    assert_eq!(urls.len(), 4);
}

#[test]
fn test_address_cache_expiry_and_eviction() {
    let t0 = Instant::now();
    let mut cache = AddressCache::new(2, 4, Duration::from_secs(10));

    cache.insert(&peer_vmac(1), vec!["wss://p1/".to_string()], t0);
    assert_eq!(
        cache.lookup(&peer_vmac(1), t0).map(|urls| urls.to_vec()),
        Some(vec!["wss://p1/".to_string()])
    );

    // expiry frees the record
    assert!(cache.lookup(&peer_vmac(1), t0 + Duration::from_secs(10)).is_none());
    assert!(cache.lookup(&peer_vmac(1), t0).is_none());

    // eviction picks the least recently refreshed entry
    cache.insert(&peer_vmac(1), vec!["wss://p1/".to_string()], t0);
    cache.insert(&peer_vmac(2), vec!["wss://p2/".to_string()], t0 + Duration::from_secs(1));
    cache.insert(&peer_vmac(3), vec!["wss://p3/".to_string()], t0 + Duration::from_secs(2));
    assert!(cache.lookup(&peer_vmac(1), t0 + Duration::from_secs(3)).is_none());
    assert!(cache.lookup(&peer_vmac(2), t0 + Duration::from_secs(3)).is_some());
    assert!(cache.lookup(&peer_vmac(3), t0 + Duration::from_secs(3)).is_some());
}

/// Find the context id of the only acceptor by probing which context the
/// mock server belongs to.
fn mock_server_ctx(mock: &MockTransport) -> ContextId {
    mock.server_ctx().expect("a server should be running")
}
