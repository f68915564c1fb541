use std::sync::Arc;
use std::time::{Duration, Instant};

use super::*;
use crate::bvlc::{BvlcFunction, Payload};
use crate::util::{DeviceUuid, HostNPort};
use crate::websocket::mock::MockTransport;
use crate::websocket::WebSocketEvent;

struct NullSink;

impl EventSink for NullSink {
    fn dispatch(&self, _event: WebSocketEvent) {}
}

fn local_vmac() -> VmacAddress {
    VmacAddress::from([0x02, 0, 0, 0, 0, 0x0A])
}

fn peer_vmac(last: u8) -> VmacAddress {
    VmacAddress::from([0x02, 0x50, 0x60, 0x70, 0x80, last])
}

fn peer_uuid(last: u8) -> DeviceUuid {
    let mut octets = [0x44; 16];
    octets[15] = last;
    DeviceUuid::new(octets)
}

fn cfg(kind: ContextKind) -> ContextConfig {
    ContextConfig {
        kind,
        proto: WebSocketProtocol::DirectConnect,
        port: 4444,
        iface: None,
        credentials: Default::default(),
        local_vmac: local_vmac(),
        local_uuid: DeviceUuid::new([0x0A; 16]),
        max_bvlc_len: 1476,
        max_npdu_len: 1440,
        connect_timeout: Duration::from_secs(10),
        heartbeat_timeout: Duration::from_secs(30),
        disconnect_timeout: Duration::from_secs(10),
    }
}

fn switch_with_both_sides(now: Instant) -> (NodeSwitch, Arc<MockTransport>) {
    let mock = MockTransport::new();
    let mut ns = NodeSwitch::new(
        Some(cfg(ContextKind::Initiator)),
        Some(cfg(ContextKind::Acceptor)),
        Duration::from_secs(5),
        Duration::from_secs(3),
        mock.clone(),
        Arc::new(NullSink),
    );
    ns.start(now).unwrap();
    // the initiator side is up synchronously, the acceptor once its
    // server listens
    assert!(!ns.started());
    let acceptor_ctx = acceptor_ctx_id(&ns, &mock);
    let events = ns.on_ws_event(acceptor_ctx, None, WebSocketEventKind::ServerStarted, now);
    assert!(matches!(events[..], [NodeSwitchEvent::Started]));
    assert!(ns.started());
    (ns, mock)
}

fn acceptor_ctx_id(ns: &NodeSwitch, _mock: &MockTransport) -> ContextId {
    ns.acceptor.as_ref().unwrap().ctx.id()
}

fn initiator_ctx_id(ns: &NodeSwitch) -> ContextId {
    ns.initiator.as_ref().unwrap().ctx.id()
}

fn cache() -> AddressCache {
    AddressCache::new(16, 4, Duration::from_secs(60))
}

/// Complete the connect handshake of the pending outbound connection.
fn complete_outbound(
    ns: &mut NodeSwitch,
    mock: &MockTransport,
    peer_last: u8,
    now: Instant,
) -> (ConnHandle, Vec<NodeSwitchEvent>) {
    let ctx = initiator_ctx_id(ns);
    let (conn, _) = mock.pending_connects()[0].clone();
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Connected, now);
    mock.complete_connect(conn);
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Sendable, now);
    let frames = mock.sent_frames(conn);
    let request = bvlc::decode_message(frames.last().unwrap()).unwrap();
    assert_eq!(request.header.function, BvlcFunction::ConnectRequest);
    mock.clear_sent(conn);
    let accept = bvlc::encode_connect_accept(
        request.header.message_id,
        &peer_vmac(peer_last),
        &peer_uuid(peer_last),
        1476,
        1440,
    );
    let events = ns.on_ws_event(
        ctx,
        Some(conn),
        WebSocketEventKind::Received { data: accept },
        now,
    );
    (conn, events)
}

#[test]
fn test_connect_with_explicit_urls() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();

    let urls = vec!["wss://b1.example:4444/".to_string()];
    let events = ns.connect(None, &urls, &mut cache, t0).unwrap();
    assert!(events.is_empty());
    assert_eq!(mock.pending_connects()[0].1, "wss://b1.example:4444/");

    let (_conn, events) = complete_outbound(&mut ns, &mock, 1, t0);
    match &events[..] {
        [NodeSwitchEvent::Connected { dest }] => assert_eq!(*dest, peer_vmac(1)),
        other => panic!("unexpected events {:?}", other),
    }
    assert!(ns.connected(Some(&peer_vmac(1)), &[]));
    assert!(ns.connected(None, &urls));
}

#[test]
fn test_url_cycling_and_delay() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();
    let ctx = initiator_ctx_id(&ns);

    let urls = vec![
        "wss://b1.example:4444/".to_string(),
        "wss://b2.example:4444/".to_string(),
    ];
    ns.connect(None, &urls, &mut cache, t0).unwrap();

    // first URL fails
    let (conn, url) = mock.pending_connects()[0].clone();
    assert_eq!(url, "wss://b1.example:4444/");
    mock.fail_connection(conn, ErrorCode::TcpConnectionRefused, "refused");
    ns.on_ws_event(
        ctx,
        Some(conn),
        WebSocketEventKind::Disconnected {
            reason: ErrorCode::TcpConnectionRefused,
            description: "refused".to_string(),
        },
        t0,
    );

    // second URL is dialed
    let (conn, url) = mock.pending_connects()[0].clone();
    assert_eq!(url, "wss://b2.example:4444/");
    mock.fail_connection(conn, ErrorCode::TcpConnectionRefused, "refused");
    ns.on_ws_event(
        ctx,
        Some(conn),
        WebSocketEventKind::Disconnected {
            reason: ErrorCode::TcpConnectionRefused,
            description: "refused".to_string(),
        },
        t0,
    );

    // both exhausted: the slot delays, then restarts from the first URL
    assert!(mock.pending_connects().is_empty());
    ns.maintenance(&mut cache, t0 + Duration::from_secs(4));
    assert!(mock.pending_connects().is_empty());
    ns.maintenance(&mut cache, t0 + Duration::from_secs(5));
    assert_eq!(mock.pending_connects()[0].1, "wss://b1.example:4444/");
}

#[test]
fn test_connect_by_vmac_with_cached_uris() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();
    cache.insert(
        &peer_vmac(2),
        vec!["wss://b2.example:4444/".to_string()],
        t0,
    );

    let events = ns.connect(Some(peer_vmac(2)), &[], &mut cache, t0).unwrap();
    assert!(events.is_empty());
    assert_eq!(mock.pending_connects()[0].1, "wss://b2.example:4444/");
}

#[test]
fn test_connect_by_vmac_resolution_flow() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();

    // no cached URIs: the switch asks for an address resolution
    let events = ns.connect(Some(peer_vmac(3)), &[], &mut cache, t0).unwrap();
    match &events[..] {
        [NodeSwitchEvent::SendAddressResolution { dest }] => assert_eq!(*dest, peer_vmac(3)),
        other => panic!("unexpected events {:?}", other),
    }
    assert!(mock.pending_connects().is_empty());

    // the ack pushes URIs in and connecting starts
    let urls = vec!["wss://b3.example:4444/".to_string()];
    let events = ns.process_address_resolution(&peer_vmac(3), &urls, &mut cache, t0);
    assert!(events.is_empty());
    assert_eq!(mock.pending_connects()[0].1, "wss://b3.example:4444/");

    let (_conn, events) = complete_outbound(&mut ns, &mock, 3, t0);
    assert!(matches!(events[..], [NodeSwitchEvent::Connected { .. }]));
}

#[test]
fn test_resolution_timeout_delays_then_retries() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();

    ns.connect(Some(peer_vmac(4)), &[], &mut cache, t0).unwrap();

    // resolution window passes without an ack
    let events = ns.maintenance(&mut cache, t0 + Duration::from_secs(3));
    assert!(events.is_empty());

    // after the reconnect delay the switch resolves again
    let events = ns.maintenance(&mut cache, t0 + Duration::from_secs(8));
    match &events[..] {
        [NodeSwitchEvent::SendAddressResolution { dest }] => assert_eq!(*dest, peer_vmac(4)),
        other => panic!("unexpected events {:?}", other),
    }
    let _ = mock;
}

#[test]
fn test_send_routing() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();

    ns.connect(
        None,
        &["wss://b5.example:4444/".to_string()],
        &mut cache,
        t0,
    )
    .unwrap();
    let (conn, _) = complete_outbound(&mut ns, &mock, 5, t0);
    mock.clear_sent(conn);

    // broadcast falls back to the hub
    let broadcast =
        bvlc::encode_encapsulated_npdu(1, None, Some(&VmacAddress::BROADCAST), &[0xAA]);
    assert_eq!(ns.send(&broadcast).unwrap(), SendDisposition::FallbackToHub);

    // unicast to the direct peer goes out with both vmac fields removed
    let unicast =
        bvlc::encode_encapsulated_npdu(2, Some(&local_vmac()), Some(&peer_vmac(5)), &[0xBB]);
    assert_eq!(ns.send(&unicast).unwrap(), SendDisposition::Direct);
    let ctx = initiator_ctx_id(&ns);
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Sendable, t0);
    let frames = mock.sent_frames(conn);
    assert_eq!(frames.len(), 1);
    let sent = bvlc::decode_message(&frames[0]).unwrap();
    assert!(sent.header.origin.is_none());
    assert!(sent.header.dest.is_none());
    assert_eq!(sent.payload, Payload::EncapsulatedNpdu(vec![0xBB]));

    // unicast to an unknown peer falls back to the hub
    let elsewhere =
        bvlc::encode_encapsulated_npdu(3, None, Some(&peer_vmac(9)), &[0xCC]);
    assert_eq!(ns.send(&elsewhere).unwrap(), SendDisposition::FallbackToHub);
}

#[test]
fn test_local_disconnect() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let mut cache = cache();

    ns.connect(
        None,
        &["wss://b6.example:4444/".to_string()],
        &mut cache,
        t0,
    )
    .unwrap();
    let (conn, _) = complete_outbound(&mut ns, &mock, 6, t0);
    mock.clear_sent(conn);

    let events = ns.disconnect(&peer_vmac(6), t0);
    assert!(events.is_empty());

    let ctx = initiator_ctx_id(&ns);
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Sendable, t0);
    let frames = mock.sent_frames(conn);
    assert_eq!(
        bvlc::decode_message(&frames[0]).unwrap().header.function,
        BvlcFunction::DisconnectRequest
    );

    // the peer acks; the websocket closes; the slot goes idle without a
    // reconnect attempt
    let request = bvlc::decode_message(&frames[0]).unwrap();
    let ack = bvlc::encode_disconnect_ack(request.header.message_id);
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Received { data: ack }, t0);
    ns.maintenance(&mut cache, t0);
    let events = ns.on_ws_event(
        ctx,
        Some(conn),
        WebSocketEventKind::Disconnected {
            reason: ErrorCode::Success,
            description: String::new(),
        },
        t0,
    );
    match &events[..] {
        [NodeSwitchEvent::Disconnected { dest }] => assert_eq!(*dest, peer_vmac(6)),
        other => panic!("unexpected events {:?}", other),
    }
    assert!(!ns.connected(Some(&peer_vmac(6)), &[]));
    assert!(mock.pending_connects().is_empty());
}

#[test]
fn test_accepted_frame_gets_origin_installed() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let ctx = acceptor_ctx_id(&ns, &mock);
    let server = mock.servers()[0].0;

    let conn = mock
        .accept(server, HostNPort::Domain("peer7".into(), 4444))
        .unwrap();
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Connected, t0);
    let request = bvlc::encode_connect_request(0x0700, &peer_vmac(7), &peer_uuid(7), 1476, 1440);
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Received { data: request }, t0);

    // a frame on the direct link carries neither vmac field
    let npdu = bvlc::encode_encapsulated_npdu(5, None, None, &[0xEE]);
    ns.on_ws_event(ctx, Some(conn), WebSocketEventKind::Received { data: npdu }, t0);
    let mut cache = cache();
    let events = ns.maintenance(&mut cache, t0);
    match &events[..] {
        [NodeSwitchEvent::Received { decoded, .. }] => {
            assert_eq!(decoded.header.origin, Some(peer_vmac(7)));
        }
        other => panic!("unexpected events {:?}", other),
    }
    assert!(ns.connected(Some(&peer_vmac(7)), &[]));
}

#[test]
fn test_stop_reports_stopped() {
    let t0 = Instant::now();
    let (mut ns, mock) = switch_with_both_sides(t0);
    let ctx = acceptor_ctx_id(&ns, &mock);

    let events = ns.stop(t0);
    assert!(events.is_empty());
    let events = ns.on_ws_event(ctx, None, WebSocketEventKind::ServerStopped, t0);
    assert!(matches!(events[..], [NodeSwitchEvent::Stopped]));
    assert!(ns.stopped());
}
