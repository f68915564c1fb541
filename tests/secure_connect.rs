//! End-to-end scenarios over the mock WebSocket transport.
//!
//! These tests drive the full stack — datalink façade, node, roles,
//! sockets, codec — with the deterministic in-memory transport. A
//! background thread pumps transport events so the blocking façade
//! behaves as it would over real sockets, and each test plays the role
//! of the remote hub or peer on the wire, byte for byte.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bacnet_sc::bvlc::{self, BvlcFunction, ErrorClass, ErrorCode, Payload};
use bacnet_sc::datalink::{BacnetAddress, ScDataLink};
use bacnet_sc::netport::NetworkPortConfig;
use bacnet_sc::telemetry::ConnectionState;
use bacnet_sc::util::{DeviceUuid, VmacAddress};
use bacnet_sc::websocket::mock::MockTransport;
use bacnet_sc::websocket::{ConnHandle, ServerHandle};

const WAIT: Duration = Duration::from_secs(3);

/// Background thread delivering queued mock transport events.
struct Pumper {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Pumper {
    fn start(mocks: Vec<Arc<MockTransport>>) -> Pumper {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                for mock in &mocks {
                    mock.pump();
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        Pumper {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Pumper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Wait for the next outbound connect attempt on `mock` and return it.
fn wait_pending_connect(mock: &MockTransport) -> (ConnHandle, String) {
    let mut found = None;
    assert!(
        wait_until(|| {
            found = mock.pending_connects().into_iter().next();
            found.is_some()
        }),
        "no outbound connection attempt appeared"
    );
    found.unwrap()
}

/// Wait for a frame matching `function` sent on `conn`, consuming the
/// send log.
fn wait_sent_frame(mock: &MockTransport, conn: ConnHandle, function: BvlcFunction) -> Vec<u8> {
    let mut found = None;
    assert!(
        wait_until(|| {
            for frame in mock.sent_frames(conn) {
                if frame.first() == Some(&(function as u8)) {
                    found = Some(frame);
                    mock.clear_sent(conn);
                    return true;
                }
            }
            false
        }),
        "no {:?} frame was sent",
        function
    );
    found.unwrap()
}

fn vmac(last: u8) -> VmacAddress {
    VmacAddress::from([0x02, 0xAB, 0xCD, 0xEF, 0x00, last])
}

fn uuid(last: u8) -> DeviceUuid {
    let mut octets = [0x55; 16];
    octets[15] = last;
    DeviceUuid::new(octets)
}

fn config(vmac_last: u8) -> NetworkPortConfig {
    let mut config = NetworkPortConfig::default();
    config.local_vmac = Some(vmac(vmac_last));
    config.local_uuid = uuid(vmac_last);
    config.primary_hub_uri = "wss://hub1.example:4443/".to_string();
    config.failover_hub_uri = "wss://hub2.example:4443/".to_string();
    config.maximum_reconnect_time = Duration::from_secs(5);
    config
}

/// Play the hub: accept the pending outbound connection and complete the
/// connect handshake with the given hub identity.
fn accept_as_hub(
    mock: &MockTransport,
    hub_vmac: VmacAddress,
    hub_uuid: DeviceUuid,
) -> ConnHandle {
    let (conn, _url) = wait_pending_connect(mock);
    mock.complete_connect(conn);
    let request = wait_sent_frame(mock, conn, BvlcFunction::ConnectRequest);
    let decoded = bvlc::decode_message(&request).unwrap();
    let accept = bvlc::encode_connect_accept(
        decoded.header.message_id,
        &hub_vmac,
        &hub_uuid,
        1476,
        1440,
    );
    mock.deliver(conn, &accept);
    conn
}

#[test]
fn test_datalink_send_and_receive_over_hub() {
    let mock = MockTransport::new();
    let _pumper = Pumper::start(vec![mock.clone()]);

    let link = ScDataLink::init_with_transport(config(1), mock.clone()).unwrap();
    assert_eq!(link.get_my_address().mac, *vmac(1).as_bytes());
    assert_eq!(link.get_broadcast_address().net, bacnet_sc::BROADCAST_NETWORK);

    let hub_conn = accept_as_hub(&mock, vmac(0xFE), uuid(0xFE));
    assert!(wait_until(|| {
        link.maintenance_timer(Duration::from_secs(1));
        link.network_port_storage().primary_hub_connection_status.state
            == ConnectionState::Connected
    }));

    // outbound broadcast rides the hub connection
    let npdu = [0x01u8, 0x20, 0xFF, 0xFF, 0x00, 0xFF];
    let sent_len = link.send_pdu(&BacnetAddress::broadcast(), &npdu).unwrap();
    assert_eq!(sent_len, npdu.len());
    let frame = wait_sent_frame(&mock, hub_conn, BvlcFunction::EncapsulatedNpdu);
    let decoded = bvlc::decode_message(&frame).unwrap();
    assert_eq!(decoded.header.dest, Some(VmacAddress::BROADCAST));
    assert_eq!(decoded.payload, Payload::EncapsulatedNpdu(npdu.to_vec()));

    // inbound NPDU from a peer, forwarded by the hub with its origin
    let inbound = bvlc::encode_encapsulated_npdu(
        0x4321,
        Some(&vmac(7)),
        Some(&VmacAddress::BROADCAST),
        &[0xAA, 0xBB],
    );
    mock.deliver(hub_conn, &inbound);

    let mut src = BacnetAddress::default();
    let mut buffer = [0u8; 1500];
    let len = link.receive(&mut src, &mut buffer, WAIT);
    assert_eq!(len, 2);
    assert_eq!(&buffer[..2], &[0xAA, 0xBB]);
    assert_eq!(src.mac, *vmac(7).as_bytes());
    assert_eq!(src.mac_len, 6);

    let mut link = link;
    link.cleanup();
}

#[test]
fn test_primary_failover_ladder() {
    let mock = MockTransport::new();
    let _pumper = Pumper::start(vec![mock.clone()]);

    let link = ScDataLink::init_with_transport(config(2), mock.clone()).unwrap();

    // the primary refuses
    let (conn, url) = wait_pending_connect(&mock);
    assert_eq!(url, "wss://hub1.example:4443/");
    mock.fail_connection(conn, ErrorCode::TcpConnectionRefused, "connection refused");

    // the connector moves to the failover
    let (conn, url) = wait_pending_connect(&mock);
    assert_eq!(url, "wss://hub2.example:4443/");
    mock.complete_connect(conn);
    let request = wait_sent_frame(&mock, conn, BvlcFunction::ConnectRequest);
    let decoded = bvlc::decode_message(&request).unwrap();
    let accept =
        bvlc::encode_connect_accept(decoded.header.message_id, &vmac(0xFD), &uuid(0xFD), 1476, 1440);
    mock.deliver(conn, &accept);

    assert!(wait_until(|| {
        link.maintenance_timer(Duration::from_secs(1));
        let storage = link.network_port_storage();
        storage.primary_hub_connection_status.state == ConnectionState::FailedToConnect
            && storage.failover_hub_connection_status.state == ConnectionState::Connected
    }));
    let storage = link.network_port_storage();
    assert_eq!(
        storage.primary_hub_connection_status.error,
        Some(ErrorCode::TcpConnectionRefused)
    );
    assert_eq!(
        storage.hub_connector_state,
        bacnet_sc::bvlc::HubConnectorState::ConnectedToFailover
    );

    let mut link = link;
    link.cleanup();
}

#[test]
fn test_duplicate_vmac_restart() {
    let mock = MockTransport::new();
    let _pumper = Pumper::start(vec![mock.clone()]);

    let link = ScDataLink::init_with_transport(config(3), mock.clone()).unwrap();
    let old_address = link.get_my_address();

    // the hub rejects our vmac during the handshake
    let (conn, _) = wait_pending_connect(&mock);
    mock.complete_connect(conn);
    let request = wait_sent_frame(&mock, conn, BvlcFunction::ConnectRequest);
    let decoded = bvlc::decode_message(&request).unwrap();
    let nak = bvlc::encode_result_nak(
        decoded.header.message_id,
        None,
        None,
        BvlcFunction::ConnectRequest,
        None,
        ErrorClass::Communication,
        ErrorCode::NodeDuplicateVmac,
        None,
    );
    mock.deliver(conn, &nak);

    // the node regenerates its vmac and rejoins
    assert!(wait_until(|| {
        let address = link.get_my_address();
        address.mac_len == 6 && address.mac != old_address.mac
    }));
    // a fresh connect attempt is under way under the new identity
    let (conn, _) = wait_pending_connect(&mock);
    mock.complete_connect(conn);
    let request = wait_sent_frame(&mock, conn, BvlcFunction::ConnectRequest);
    let decoded = bvlc::decode_message(&request).unwrap();
    match decoded.payload {
        Payload::ConnectRequest { vmac: v, uuid: u, .. } => {
            assert_ne!(v.as_bytes(), &old_address.mac);
            // the device uuid is persistent across the restart
            assert_eq!(u, uuid(3));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let mut link = link;
    link.cleanup();
}

/// Relay a unicast frame from one hub spoke to another the way a hub
/// function would: strip the destination, insert the sender as origin.
fn hub_relay(frame: &[u8], sender: VmacAddress) -> Vec<u8> {
    let mut forwarded = frame.to_vec();
    bvlc::remove_dest_set_orig(&mut forwarded, &sender);
    forwarded
}

#[test]
fn test_direct_connect_via_address_resolution() {
    let mock_a = MockTransport::new();
    let mock_b = MockTransport::new();
    let _pumper = Pumper::start(vec![mock_a.clone(), mock_b.clone()]);

    // node A initiates direct connections; node B accepts them
    let mut config_a = config(0x0A);
    config_a.direct_connect_initiate_enabled = true;
    let mut config_b = config(0x0B);
    config_b.direct_connect_accept_enabled = true;
    config_b.direct_connect_accept_uris = vec!["wss://b.example:4444/".to_string()];

    let link_a = ScDataLink::init_with_transport(config_a, mock_a.clone()).unwrap();
    let link_b = ScDataLink::init_with_transport(config_b, mock_b.clone()).unwrap();

    let hub_a = accept_as_hub(&mock_a, vmac(0xFE), uuid(0xFE));
    let hub_b = accept_as_hub(&mock_b, vmac(0xFE), uuid(0xFE));

    // A asks for a direct connection to B by VMAC only
    link_a.connect_direct(Some(vmac(0x0B)), &[]).unwrap();

    // A resolves B's address over the hub
    let resolution = wait_sent_frame(&mock_a, hub_a, BvlcFunction::AddressResolution);
    let decoded = bvlc::decode_message(&resolution).unwrap();
    assert_eq!(decoded.header.dest, Some(vmac(0x0B)));
    mock_b.deliver(hub_b, &hub_relay(&resolution, vmac(0x0A)));

    // B answers with its accept URI; the hub relays it back
    let ack = wait_sent_frame(&mock_b, hub_b, BvlcFunction::AddressResolutionAck);
    let decoded = bvlc::decode_message(&ack).unwrap();
    assert_eq!(
        decoded.payload,
        Payload::AddressResolutionAck("wss://b.example:4444/".to_string())
    );
    mock_a.deliver(hub_a, &hub_relay(&ack, vmac(0x0B)));

    // A dials the resolved URI; bridge the handshake to B's acceptor
    let (direct_a, url) = wait_pending_connect(&mock_a);
    assert_eq!(url, "wss://b.example:4444/");
    mock_a.complete_connect(direct_a);
    let request = wait_sent_frame(&mock_a, direct_a, BvlcFunction::ConnectRequest);

    let direct_server: ServerHandle = mock_b
        .servers()
        .into_iter()
        .find(|(_, port)| *port == 4444)
        .map(|(server, _)| server)
        .expect("B's direct acceptor should be listening");
    let direct_b = mock_b
        .accept(direct_server, bacnet_sc::util::HostNPort::Domain("a.example".into(), 49152))
        .unwrap();
    mock_b.deliver(direct_b, &request);
    let accept = wait_sent_frame(&mock_b, direct_b, BvlcFunction::ConnectAccept);
    mock_a.deliver(direct_a, &accept);

    assert!(wait_until(|| {
        link_a.direct_connection_established(Some(&vmac(0x0B)), &[])
    }));
    assert!(wait_until(|| {
        link_b.direct_connection_established(Some(&vmac(0x0A)), &[])
    }));

    // unicast from A to B now bypasses the hub entirely
    mock_a.clear_sent(hub_a);
    let npdu = [0x01u8, 0x04, 0x00, 0x05];
    link_a
        .send_pdu(&BacnetAddress::unicast(vmac(0x0B)), &npdu)
        .unwrap();
    let frame = wait_sent_frame(&mock_a, direct_a, BvlcFunction::EncapsulatedNpdu);
    let decoded = bvlc::decode_message(&frame).unwrap();
    // both identities are bound by the link itself
    assert!(decoded.header.origin.is_none());
    assert!(decoded.header.dest.is_none());
    assert!(mock_a.sent_frames(hub_a).is_empty());

    mock_b.deliver(direct_b, &frame);
    let mut src = BacnetAddress::default();
    let mut buffer = [0u8; 1500];
    let len = link_b.receive(&mut src, &mut buffer, WAIT);
    assert_eq!(len, npdu.len());
    assert_eq!(&buffer[..len], &npdu);
    assert_eq!(src.mac, *vmac(0x0A).as_bytes());

    let mut link_a = link_a;
    let mut link_b = link_b;
    link_a.cleanup();
    link_b.cleanup();
}

#[test]
fn test_advertisement_solicitation_roundtrip() {
    let mock = MockTransport::new();
    let _pumper = Pumper::start(vec![mock.clone()]);

    let link = ScDataLink::init_with_transport(config(4), mock.clone()).unwrap();
    let hub_conn = accept_as_hub(&mock, vmac(0xFE), uuid(0xFE));

    let solicitation = bvlc::encode_advertisement_solicitation(0x0101, Some(&vmac(9)), None);
    mock.deliver(hub_conn, &solicitation);

    let advert = wait_sent_frame(&mock, hub_conn, BvlcFunction::Advertisement);
    let decoded = bvlc::decode_message(&advert).unwrap();
    assert_eq!(decoded.header.dest, Some(vmac(9)));
    match decoded.payload {
        Payload::Advertisement { hub_status, .. } => {
            assert_eq!(
                hub_status,
                bacnet_sc::bvlc::HubConnectorState::ConnectedToPrimary
            );
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let mut link = link;
    link.cleanup();
}
