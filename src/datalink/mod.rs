//! BACnet/SC datalink façade
//!
//! This module exposes the blocking send/receive surface the upper BACnet
//! stack expects from any datalink: initialize, send a PDU to a BACnet
//! address, receive the next NPDU with a timeout, query local and
//! broadcast addresses, run the maintenance tick, clean up.
//!
//! # Overview
//!
//! [`ScDataLink::init`] builds an [`crate::node::ScNode`] from a
//! [`NetworkPortConfig`] snapshot, spawns the maintenance runloop and
//! blocks until the node reports started. Inbound NPDUs are buffered in a
//! bounded FIFO and handed out by [`ScDataLink::receive`]; all other
//! traffic (handshakes, heartbeats, advertisements, address resolution)
//! is consumed inside the core.
//!
//! `BACNET_ADDRESS` maps onto [`BacnetAddress`]: the VMAC rides in
//! `mac[0..6]` with `mac_len = 6`, and `net = 0xFFFF` addresses the
//! global broadcast.
//!
//! # Examples
//!
//! ```no_run
//! use bacnet_sc::datalink::ScDataLink;
//! use bacnet_sc::netport::NetworkPortConfig;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = NetworkPortConfig::default();
//! config.primary_hub_uri = "wss://hub.example.org:4443/".to_string();
//! let mut link = ScDataLink::init(config)?;
//!
//! let broadcast = link.get_broadcast_address();
//! link.send_pdu(&broadcast, &[0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF])?;
//!
//! let mut buffer = [0u8; 1500];
//! let mut source = Default::default();
//! let len = link.receive(&mut source, &mut buffer, Duration::from_millis(500));
//! if len > 0 {
//!     println!("{} octets from {:?}", len, source);
//! }
//! link.cleanup();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bvlc::{self, Payload};
use crate::netport::{NetworkPortConfig, NetworkPortStorage};
use crate::node::{NodeEvent, ScNode};
use crate::runloop::Runloop;
use crate::socket::{ScError, ScResult};
use crate::util::VmacAddress;
use crate::websocket::tungstenite::TungsteniteTransport;
use crate::websocket::{EventSink, WebSocketEvent, WebSocketTransport};
use crate::VMAC_SIZE;

/// `net` value addressing the global BACnet broadcast.
pub const BROADCAST_NETWORK: u16 = 0xFFFF;

/// NPDUs buffered in the inbound FIFO.
const RX_BUFFERED_PACKETS: usize = 10;

/// BACnet datalink address: up to one VMAC in `mac`, plus the network
/// number used to flag broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacnetAddress {
    pub net: u16,
    pub mac_len: u8,
    pub mac: [u8; VMAC_SIZE],
}

impl BacnetAddress {
    /// Address of a specific SC node.
    pub fn unicast(vmac: VmacAddress) -> Self {
        BacnetAddress {
            net: 0,
            mac_len: VMAC_SIZE as u8,
            mac: *vmac.as_bytes(),
        }
    }

    /// The global broadcast address.
    pub fn broadcast() -> Self {
        BacnetAddress {
            net: BROADCAST_NETWORK,
            mac_len: VMAC_SIZE as u8,
            mac: [0xFF; VMAC_SIZE],
        }
    }

    /// True when the address selects the global broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.net == BROADCAST_NETWORK || self.mac_len == 0
    }
}

impl fmt::Display for BacnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            match VmacAddress::try_from(&self.mac[..self.mac_len as usize]) {
                Ok(vmac) => write!(f, "{}", vmac),
                Err(_) => write!(f, "mac[{}]", self.mac_len),
            }
        }
    }
}

/// Common surface of BACnet datalinks in this crate's style: frame-level
/// send/receive plus address queries.
pub trait DataLink: Send {
    /// Send an NPDU to `dest`.
    fn send_frame(&mut self, frame: &[u8], dest: &BacnetAddress) -> ScResult<usize>;

    /// Receive the next NPDU, blocking up to `timeout`; returns the NPDU
    /// length and fills `src`, or 0 on timeout.
    fn receive_frame(
        &mut self,
        src: &mut BacnetAddress,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> usize;

    /// Local address of this datalink.
    fn local_address(&self) -> BacnetAddress;

    /// Broadcast address of this datalink.
    fn broadcast_address(&self) -> BacnetAddress;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Starting,
    Started,
    Stopping,
}

struct LinkCore {
    state: LinkState,
    node: Option<ScNode>,
    fifo: VecDeque<Vec<u8>>,
    fifo_bytes: usize,
    fifo_capacity: usize,
    storage: NetworkPortStorage,
}

struct LinkShared {
    core: Mutex<LinkCore>,
    /// Signals init/cleanup completion.
    control: Condvar,
    /// Signals data in the RX FIFO.
    data: Condvar,
}

fn handle_node_events(core: &mut LinkCore, shared: &LinkShared, events: Vec<NodeEvent>) {
    for event in events {
        match event {
            NodeEvent::Started | NodeEvent::Restarted | NodeEvent::Stopped => {
                if matches!(event, NodeEvent::Stopped) && core.state == LinkState::Stopping {
                    core.state = LinkState::Idle;
                }
                if matches!(event, NodeEvent::Started) && core.state == LinkState::Starting {
                    core.state = LinkState::Started;
                }
                shared.control.notify_all();
            }
            NodeEvent::ReceivedNpdu { pdu } => {
                if core.state != LinkState::Started {
                    continue;
                }
                if core.fifo_bytes + pdu.len() + 2 > core.fifo_capacity {
                    warn!("rx fifo full, npdu of {} octets dropped", pdu.len());
                    continue;
                }
                core.fifo_bytes += pdu.len() + 2;
                core.fifo.push_back(pdu);
                shared.data.notify_all();
            }
            NodeEvent::ReceivedResult { .. }
            | NodeEvent::ReceivedAdvertisement { .. }
            | NodeEvent::ReceivedProprietary { .. } => {
                // consumed by the node layer; nothing to buffer here
            }
            NodeEvent::DirectConnected { dest } => {
                debug!("direct connection to {} established", dest);
            }
            NodeEvent::DirectDisconnected { dest } => {
                debug!("direct connection to {} closed", dest);
            }
        }
    }
}

/// Routes transport events into the node under the dispatch lock.
struct LinkSink {
    shared: Weak<LinkShared>,
}

impl EventSink for LinkSink {
    fn dispatch(&self, event: WebSocketEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut guard = shared.core.lock().expect("datalink lock poisoned");
        let core = &mut *guard;
        let now = Instant::now();
        let Some(node) = core.node.as_mut() else {
            return;
        };
        let mut events = node.on_ws_event(event.ctx, event.conn, event.kind, now);
        // drain frames the event may have staged
        events.extend(node.maintenance(now));
        handle_node_events(core, &shared, events);
    }
}

/// The blocking BACnet/SC datalink.
pub struct ScDataLink {
    shared: Arc<LinkShared>,
    runloop: Option<Runloop>,
}

impl ScDataLink {
    /// Initialize the datalink with the production WebSocket transport.
    /// Blocks until the node reports started.
    pub fn init(config: NetworkPortConfig) -> ScResult<Self> {
        let transport = Arc::new(TungsteniteTransport::new()?);
        Self::init_with_transport(config, transport)
    }

    /// Initialize against a caller-supplied transport backend.
    pub fn init_with_transport(
        config: NetworkPortConfig,
        transport: Arc<dyn WebSocketTransport>,
    ) -> ScResult<Self> {
        let node_config = config.to_node_config();
        let fifo_capacity =
            (node_config.max_npdu_len as usize * RX_BUFFERED_PACKETS).next_power_of_two();
        let shared = Arc::new(LinkShared {
            core: Mutex::new(LinkCore {
                state: LinkState::Starting,
                node: None,
                fifo: VecDeque::new(),
                fifo_bytes: 0,
                fifo_capacity,
                storage: NetworkPortStorage::default(),
            }),
            control: Condvar::new(),
            data: Condvar::new(),
        });

        let sink = Arc::new(LinkSink {
            shared: Arc::downgrade(&shared),
        });
        let mut node = ScNode::new(node_config, transport, sink);

        {
            let mut guard = shared.core.lock().expect("datalink lock poisoned");
            let core = &mut *guard;
            let now = Instant::now();
            match node.start(now) {
                Ok(events) => {
                    core.node = Some(node);
                    handle_node_events(core, &shared, events);
                }
                Err(e) => {
                    core.state = LinkState::Idle;
                    return Err(e);
                }
            }
        }

        let tick_shared = shared.clone();
        let runloop = Runloop::spawn(move |now| {
            let mut guard = tick_shared.core.lock().expect("datalink lock poisoned");
            let core = &mut *guard;
            let events = match core.node.as_mut() {
                Some(node) => node.maintenance(now),
                None => Vec::new(),
            };
            handle_node_events(core, &tick_shared, events);
            if let Some(node) = core.node.as_ref() {
                core.storage.update_from(node);
            }
        });

        // wait for the node to come up (or to fail and fall back to IDLE)
        {
            let mut core = shared.core.lock().expect("datalink lock poisoned");
            while core.state == LinkState::Starting {
                core = shared
                    .control
                    .wait(core)
                    .expect("datalink lock poisoned");
            }
            if core.state != LinkState::Started {
                drop(core);
                return Err(ScError::InvalidOperation);
            }
        }

        Ok(ScDataLink {
            shared,
            runloop: Some(runloop),
        })
    }

    /// Stop the node and release every resource. Blocks until the node
    /// reports stopped. The datalink may be re-initialized afterwards.
    pub fn cleanup(&mut self) {
        {
            let mut core = self.shared.core.lock().expect("datalink lock poisoned");
            if core.state == LinkState::Idle || core.state == LinkState::Stopping {
                return;
            }
            core.state = LinkState::Stopping;
            let now = Instant::now();
            let events = match core.node.as_mut() {
                Some(node) => node.stop(now),
                None => Vec::new(),
            };
            handle_node_events(&mut *core, &self.shared, events);
            // unblock any receiver
            self.shared.data.notify_all();
            while core.state == LinkState::Stopping {
                core = self
                    .shared
                    .control
                    .wait(core)
                    .expect("datalink lock poisoned");
            }
            core.node = None;
            core.fifo.clear();
            core.fifo_bytes = 0;
        }
        if let Some(mut runloop) = self.runloop.take() {
            runloop.stop();
        }
    }

    /// Encode `pdu` as an Encapsulated-NPDU and send it to `dest`.
    /// Returns the NPDU length on success.
    pub fn send_pdu(&self, dest: &BacnetAddress, pdu: &[u8]) -> ScResult<usize> {
        let mut core = self.shared.core.lock().expect("datalink lock poisoned");
        if core.state != LinkState::Started {
            return Err(ScError::InvalidOperation);
        }
        let dest_vmac = if dest.is_broadcast() {
            VmacAddress::BROADCAST
        } else if dest.mac_len as usize == VMAC_SIZE {
            VmacAddress::from(dest.mac)
        } else {
            return Err(ScError::BadParam);
        };
        let node = core.node.as_mut().ok_or(ScError::InvalidOperation)?;
        node.send_npdu(&dest_vmac, pdu)?;
        Ok(pdu.len())
    }

    /// Pop the next NPDU from the RX FIFO, blocking up to `timeout`.
    /// Returns the NPDU length with the origin VMAC in `src`, or 0 on
    /// timeout, shutdown or a malformed frame.
    pub fn receive(
        &self,
        src: &mut BacnetAddress,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> usize {
        let mut core = self.shared.core.lock().expect("datalink lock poisoned");
        if core.state != LinkState::Started {
            return 0;
        }
        if core.fifo.is_empty() {
            let (guard, _timeout) = self
                .shared
                .data
                .wait_timeout(core, timeout)
                .expect("datalink lock poisoned");
            core = guard;
        }
        if core.state != LinkState::Started {
            return 0;
        }
        let Some(frame) = core.fifo.pop_front() else {
            return 0;
        };
        core.fifo_bytes -= frame.len() + 2;
        drop(core);

        let decoded = match bvlc::decode_message(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("npdu dropped from fifo: {}", e);
                return 0;
            }
        };
        let (Some(origin), Payload::EncapsulatedNpdu(npdu)) =
            (decoded.header.origin, decoded.payload)
        else {
            debug!("npdu without origin dropped");
            return 0;
        };
        if npdu.len() > buffer.len() {
            debug!("npdu of {} octets exceeds caller buffer", npdu.len());
            return 0;
        }
        buffer[..npdu.len()].copy_from_slice(&npdu);
        *src = BacnetAddress::unicast(origin);
        npdu.len()
    }

    /// Local VMAC as a BACnet address; zeroed unless started.
    pub fn get_my_address(&self) -> BacnetAddress {
        let core = self.shared.core.lock().expect("datalink lock poisoned");
        if core.state != LinkState::Started {
            return BacnetAddress::default();
        }
        core.node
            .as_ref()
            .map(|node| BacnetAddress::unicast(node.local_vmac()))
            .unwrap_or_default()
    }

    /// The global broadcast address of this datalink.
    pub fn get_broadcast_address(&self) -> BacnetAddress {
        BacnetAddress::broadcast()
    }

    /// Begin establishing a direct connection to `dest` or to one of
    /// `urls`.
    pub fn connect_direct(
        &self,
        dest: Option<VmacAddress>,
        urls: &[String],
    ) -> ScResult<()> {
        let mut core = self.shared.core.lock().expect("datalink lock poisoned");
        if core.state != LinkState::Started {
            return Err(ScError::InvalidOperation);
        }
        let now = Instant::now();
        let core = &mut *core;
        let node = core.node.as_mut().ok_or(ScError::InvalidOperation)?;
        let events = node.connect_direct(dest, urls, now)?;
        handle_node_events(core, &self.shared, events);
        Ok(())
    }

    /// Tear down the direct connection to `dest`.
    pub fn disconnect_direct(&self, dest: &VmacAddress) {
        let mut core = self.shared.core.lock().expect("datalink lock poisoned");
        if core.state != LinkState::Started {
            return;
        }
        let now = Instant::now();
        let core = &mut *core;
        let events = match core.node.as_mut() {
            Some(node) => node.disconnect_direct(dest, now),
            None => Vec::new(),
        };
        handle_node_events(core, &self.shared, events);
    }

    /// True iff a direct connection matching `dest` or `urls` exists.
    pub fn direct_connection_established(
        &self,
        dest: Option<&VmacAddress>,
        urls: &[String],
    ) -> bool {
        let core = self.shared.core.lock().expect("datalink lock poisoned");
        core.state == LinkState::Started
            && core
                .node
                .as_ref()
                .map_or(false, |node| node.direct_connection_established(dest, urls))
    }

    /// Tick node timers and refresh the Network-Port property mirror.
    pub fn maintenance_timer(&self, _elapsed: Duration) {
        let mut guard = self.shared.core.lock().expect("datalink lock poisoned");
        let core = &mut *guard;
        let now = Instant::now();
        let events = match core.node.as_mut() {
            Some(node) => node.maintenance(now),
            None => Vec::new(),
        };
        handle_node_events(core, &self.shared, events);
        if let Some(node) = core.node.as_ref() {
            core.storage.update_from(node);
        }
    }

    /// Snapshot of the mirrored Network-Port properties.
    pub fn network_port_storage(&self) -> NetworkPortStorage {
        self.shared
            .core
            .lock()
            .expect("datalink lock poisoned")
            .storage
            .clone()
    }
}

impl DataLink for ScDataLink {
    fn send_frame(&mut self, frame: &[u8], dest: &BacnetAddress) -> ScResult<usize> {
        self.send_pdu(dest, frame)
    }

    fn receive_frame(
        &mut self,
        src: &mut BacnetAddress,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> usize {
        self.receive(src, buffer, timeout)
    }

    fn local_address(&self) -> BacnetAddress {
        self.get_my_address()
    }

    fn broadcast_address(&self) -> BacnetAddress {
        self.get_broadcast_address()
    }
}

impl Drop for ScDataLink {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        let addr = BacnetAddress::broadcast();
        assert_eq!(addr.net, BROADCAST_NETWORK);
        assert_eq!(addr.mac_len, 6);
        assert_eq!(addr.mac, [0xFF; 6]);
        assert!(addr.is_broadcast());
    }

    #[test]
    fn test_unicast_address() {
        let vmac = VmacAddress::from([0x02, 1, 2, 3, 4, 5]);
        let addr = BacnetAddress::unicast(vmac);
        assert!(!addr.is_broadcast());
        assert_eq!(addr.mac_len, 6);
        assert_eq!(&addr.mac, vmac.as_bytes());
    }

    #[test]
    fn test_zero_mac_len_is_broadcast() {
        let addr = BacnetAddress {
            net: 0,
            mac_len: 0,
            mac: [0; 6],
        };
        assert!(addr.is_broadcast());
    }
}
