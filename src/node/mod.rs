//! BACnet/SC node orchestration
//!
//! An [`ScNode`] owns the three datalink roles — always a hub connector,
//! optionally a hub function and a node switch — and the address
//! resolution cache. It routes transport events to the owning role,
//! dispatches received BVLC messages (AB.6.5), answers advertisement
//! solicitations and address resolutions, and restarts the whole stack
//! with a fresh Random-48 VMAC when any role reports a duplicate-VMAC
//! rejection.
//!
//! Outbound routing: with a node switch configured, every PDU goes
//! through it first (it may own a direct link to the destination);
//! everything else — and all broadcast traffic — rides the hub connector.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bvlc::{
    self, BvlcFunction, DecodedMessage, DirectConnectionSupport, ErrorClass, ErrorCode, Payload,
};
use crate::hub::{HubConnector, HubConnectorEvent, HubFunction, HubFunctionEvent};
use crate::socket::{ContextConfig, ContextKind, ScError, ScResult};
use crate::switch::{NodeSwitch, NodeSwitchEvent, SendDisposition};
use crate::telemetry::{FailedConnectionRequest, HubConnectionStatus};
use crate::util::{DeviceUuid, Timer, VmacAddress};
use crate::websocket::{
    ConnHandle, ContextId, EventSink, TlsCredentials, WebSocketEventKind, WebSocketProtocol,
    WebSocketTransport,
};

/// Longest URI accepted from an Address-Resolution-ACK.
pub const MAX_URI_LEN: usize = 128;

/// Candidate URIs kept per resolved VMAC.
pub const MAX_URIS_PER_VMAC: usize = 4;

/// Bounded length of the failed-connection-requests log.
const FAILED_REQUEST_LOG_MAX: usize = 16;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Starting,
    Started,
    Restarting,
    Stopping,
}

/// Events a node reports to the datalink layer.
#[derive(Debug)]
pub enum NodeEvent {
    Started,
    /// The node completed a duplicate-VMAC restart under a new VMAC.
    Restarted,
    Stopped,
    /// An Encapsulated-NPDU arrived; `pdu` is the full BVLC frame.
    ReceivedNpdu { pdu: Vec<u8> },
    /// A BVLC-Result arrived that is not consumed internally.
    ReceivedResult { pdu: Vec<u8> },
    ReceivedAdvertisement { pdu: Vec<u8> },
    ReceivedProprietary { pdu: Vec<u8> },
    DirectConnected { dest: VmacAddress },
    DirectDisconnected { dest: VmacAddress },
}

/// Node configuration assembled from the Network-Port object.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub credentials: TlsCredentials,
    pub local_vmac: VmacAddress,
    pub local_uuid: DeviceUuid,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub address_resolution_timeout: Duration,
    pub address_resolution_freshness: Duration,
    pub primary_hub_uri: String,
    pub failover_hub_uri: String,
    pub iface: Option<String>,
    pub hub_function_enabled: bool,
    pub hub_function_port: u16,
    pub direct_connect_initiate_enabled: bool,
    pub direct_connect_accept_enabled: bool,
    pub direct_connect_port: u16,
    /// URIs advertised in Address-Resolution-ACKs when accepting direct
    /// connections.
    pub direct_connect_accept_uris: Vec<String>,
}

impl NodeConfig {
    fn switch_enabled(&self) -> bool {
        self.direct_connect_initiate_enabled || self.direct_connect_accept_enabled
    }
}

struct CacheEntry {
    used: bool,
    vmac: VmacAddress,
    urls: Vec<String>,
    fresh: Timer,
}

/// VMAC-to-URI cache fed by Address-Resolution-ACKs.
///
/// Lookups on an expired entry free it and miss. Insertion reuses a free
/// slot, else evicts the entry with the largest elapsed freshness time.
pub struct AddressCache {
    entries: Vec<CacheEntry>,
    max_uris: usize,
    freshness: Duration,
}

impl AddressCache {
    pub fn new(max_entries: usize, max_uris: usize, freshness: Duration) -> Self {
        AddressCache {
            entries: (0..max_entries)
                .map(|_| CacheEntry {
                    used: false,
                    vmac: VmacAddress::UNSPECIFIED,
                    urls: Vec::new(),
                    fresh: Timer::new(),
                })
                .collect(),
            max_uris,
            freshness,
        }
    }

    /// Fresh candidate URIs for `vmac`; `None` on miss, expiry or an
    /// empty (negative) record.
    pub fn lookup(&mut self, vmac: &VmacAddress, now: Instant) -> Option<&[String]> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.used && e.vmac == *vmac)?;
        if self.entries[pos].fresh.expired(now) {
            self.entries[pos].used = false;
            self.entries[pos].urls.clear();
            return None;
        }
        if self.entries[pos].urls.is_empty() {
            return None;
        }
        Some(&self.entries[pos].urls)
    }

    /// Install or refresh the record for `vmac`. An empty `urls` list
    /// records a peer known to not accept direct connections.
    pub fn insert(&mut self, vmac: &VmacAddress, mut urls: Vec<String>, now: Instant) {
        urls.truncate(self.max_uris);
        if let Some(entry) = self.entries.iter_mut().find(|e| e.used && e.vmac == *vmac) {
            entry.urls = urls;
            entry.fresh.set(now, self.freshness);
            return;
        }
        let slot = match self.entries.iter().position(|e| !e.used) {
            Some(free) => free,
            None => {
                // evict the least recently refreshed entry
                let mut oldest = 0;
                let mut oldest_elapsed = Duration::ZERO;
                for (i, entry) in self.entries.iter().enumerate() {
                    let elapsed = entry.fresh.elapsed(now);
                    if elapsed >= oldest_elapsed {
                        oldest_elapsed = elapsed;
                        oldest = i;
                    }
                }
                oldest
            }
        };
        let entry = &mut self.entries[slot];
        entry.used = true;
        entry.vmac = *vmac;
        entry.urls = urls;
        entry.fresh.set(now, self.freshness);
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.used = false;
            entry.urls.clear();
            entry.fresh.stop();
        }
    }
}

/// Split a space-separated URI blob, dropping empty and oversized
/// entries.
pub fn parse_uri_blob(blob: &str, max_len: usize, max_count: usize) -> Vec<String> {
    blob.split(' ')
        .filter(|uri| !uri.is_empty() && uri.len() <= max_len)
        .take(max_count)
        .map(str::to_string)
        .collect()
}

enum RoleEvent {
    Hc(HubConnectorEvent),
    Hf(HubFunctionEvent),
    Ns(NodeSwitchEvent),
}

/// The orchestration layer owning the three SC roles.
pub struct ScNode {
    state: NodeState,
    conf: NodeConfig,
    transport: Arc<dyn WebSocketTransport>,
    sink: Arc<dyn EventSink>,
    hub_connector: Option<HubConnector>,
    hub_function: Option<HubFunction>,
    node_switch: Option<NodeSwitch>,
    cache: AddressCache,
    failed_requests: VecDeque<FailedConnectionRequest>,
    message_id: u16,
}

impl ScNode {
    pub fn new(
        conf: NodeConfig,
        transport: Arc<dyn WebSocketTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let freshness = conf.address_resolution_freshness;
        ScNode {
            state: NodeState::Idle,
            conf,
            transport,
            sink,
            hub_connector: None,
            hub_function: None,
            node_switch: None,
            cache: AddressCache::new(
                crate::switch::NODE_SWITCH_CONNECTIONS,
                MAX_URIS_PER_VMAC,
                freshness,
            ),
            failed_requests: VecDeque::new(),
            message_id: crate::util::random_message_id(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn started(&self) -> bool {
        self.state == NodeState::Started
    }

    /// Local VMAC; regenerated when a duplicate is detected.
    pub fn local_vmac(&self) -> VmacAddress {
        self.conf.local_vmac
    }

    pub fn config(&self) -> &NodeConfig {
        &self.conf
    }

    /// Hub connection status records for property mirroring.
    pub fn hub_status(&self, primary: bool) -> Option<&HubConnectionStatus> {
        self.hub_connector.as_ref().map(|hc| hc.status(primary))
    }

    /// Current hub connector state for property mirroring.
    pub fn hub_connector_state(&self) -> bvlc::HubConnectorState {
        self.hub_connector
            .as_ref()
            .map_or(bvlc::HubConnectorState::NoHubConnection, |hc| {
                hc.wire_state()
            })
    }

    pub fn hub_function(&self) -> Option<&HubFunction> {
        self.hub_function.as_ref()
    }

    pub fn node_switch(&self) -> Option<&NodeSwitch> {
        self.node_switch.as_ref()
    }

    /// The bounded failed-connection-requests log, oldest first.
    pub fn failed_requests(&self) -> impl Iterator<Item = &FailedConnectionRequest> {
        self.failed_requests.iter()
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    fn ctx_config(
        &self,
        kind: ContextKind,
        proto: WebSocketProtocol,
        port: u16,
        iface: Option<String>,
    ) -> ContextConfig {
        ContextConfig {
            kind,
            proto,
            port,
            iface,
            credentials: self.conf.credentials.clone(),
            local_vmac: self.conf.local_vmac,
            local_uuid: self.conf.local_uuid,
            max_bvlc_len: self.conf.max_bvlc_len,
            max_npdu_len: self.conf.max_npdu_len,
            connect_timeout: self.conf.connect_timeout,
            heartbeat_timeout: self.conf.heartbeat_timeout,
            disconnect_timeout: self.conf.disconnect_timeout,
        }
    }

    /// Start the node. [`NodeEvent::Started`] is reported once every
    /// configured role is up; with neither hub function nor node switch
    /// configured that happens synchronously.
    pub fn start(&mut self, now: Instant) -> ScResult<Vec<NodeEvent>> {
        if self.state != NodeState::Idle {
            return Err(ScError::InvalidOperation);
        }
        self.state = NodeState::Starting;
        self.cache.clear();
        self.start_roles(now)
    }

    /// Stop the node. [`NodeEvent::Stopped`] follows once every role
    /// reports down.
    pub fn stop(&mut self, now: Instant) -> Vec<NodeEvent> {
        if self.state == NodeState::Idle || self.state == NodeState::Stopping {
            return Vec::new();
        }
        self.state = NodeState::Stopping;
        let mut queue = VecDeque::new();
        self.stop_roles(now, &mut queue);
        self.drive(queue, now)
    }

    fn start_roles(&mut self, now: Instant) -> ScResult<Vec<NodeEvent>> {
        let mut queue = VecDeque::new();

        let hub_cfg = self.ctx_config(ContextKind::Initiator, WebSocketProtocol::Hub, 0, None);
        let mut hub_connector = HubConnector::new(
            hub_cfg,
            self.conf.primary_hub_uri.clone(),
            self.conf.failover_hub_uri.clone(),
            self.conf.reconnect_timeout,
            self.transport.clone(),
            self.sink.clone(),
        );
        hub_connector.start(now)?;
        self.hub_connector = Some(hub_connector);

        if self.conf.hub_function_enabled {
            let cfg = self.ctx_config(
                ContextKind::Acceptor,
                WebSocketProtocol::Hub,
                self.conf.hub_function_port,
                self.conf.iface.clone(),
            );
            let mut hub_function = HubFunction::new(cfg, self.transport.clone(), self.sink.clone());
            if let Err(e) = hub_function.start() {
                self.abort_start(now);
                return Err(e);
            }
            self.hub_function = Some(hub_function);
        }

        if self.conf.switch_enabled() {
            let initiate_cfg = self.conf.direct_connect_initiate_enabled.then(|| {
                self.ctx_config(ContextKind::Initiator, WebSocketProtocol::DirectConnect, 0, None)
            });
            let accept_cfg = self.conf.direct_connect_accept_enabled.then(|| {
                self.ctx_config(
                    ContextKind::Acceptor,
                    WebSocketProtocol::DirectConnect,
                    self.conf.direct_connect_port,
                    self.conf.iface.clone(),
                )
            });
            let mut node_switch = NodeSwitch::new(
                initiate_cfg,
                accept_cfg,
                self.conf.reconnect_timeout,
                self.conf.address_resolution_timeout,
                self.transport.clone(),
                self.sink.clone(),
            );
            match node_switch.start(now) {
                Ok(events) => {
                    self.node_switch = Some(node_switch);
                    queue.extend(events.into_iter().map(RoleEvent::Ns));
                }
                Err(e) => {
                    self.abort_start(now);
                    return Err(e);
                }
            }
        }

        if !self.conf.hub_function_enabled && !self.conf.switch_enabled() {
            return Ok(self.enter_started());
        }
        Ok(self.drive(queue, now))
    }

    fn abort_start(&mut self, now: Instant) {
        if let Some(mut hub_connector) = self.hub_connector.take() {
            hub_connector.stop(now);
        }
        if let Some(mut hub_function) = self.hub_function.take() {
            hub_function.stop(now);
        }
        if let Some(mut node_switch) = self.node_switch.take() {
            node_switch.stop(now);
        }
        self.state = NodeState::Idle;
    }

    fn stop_roles(&mut self, now: Instant, queue: &mut VecDeque<RoleEvent>) {
        if let Some(hub_connector) = self.hub_connector.as_mut() {
            queue.extend(hub_connector.stop(now).into_iter().map(RoleEvent::Hc));
        }
        if let Some(hub_function) = self.hub_function.as_mut() {
            queue.extend(hub_function.stop(now).into_iter().map(RoleEvent::Hf));
        }
        if let Some(node_switch) = self.node_switch.as_mut() {
            queue.extend(node_switch.stop(now).into_iter().map(RoleEvent::Ns));
        }
    }

    fn enter_started(&mut self) -> Vec<NodeEvent> {
        match self.state {
            NodeState::Starting => {
                self.state = NodeState::Started;
                vec![NodeEvent::Started]
            }
            NodeState::Restarting => {
                self.state = NodeState::Started;
                vec![NodeEvent::Restarted]
            }
            _ => Vec::new(),
        }
    }

    /// Send an already-encoded BVLC frame: through the node switch when
    /// one is configured (it may own a direct link), else via the hub.
    pub fn send(&mut self, pdu: &[u8]) -> ScResult<()> {
        if self.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        if let Some(node_switch) = self.node_switch.as_mut() {
            match node_switch.send(pdu)? {
                SendDisposition::Direct => return Ok(()),
                SendDisposition::FallbackToHub => {}
            }
        }
        self.hub_send(pdu)
    }

    /// Encapsulate one NPDU for `dest` under a fresh message id and send
    /// it through the normal routing.
    pub fn send_npdu(&mut self, dest: &VmacAddress, npdu: &[u8]) -> ScResult<()> {
        let message_id = self.next_message_id();
        let frame = bvlc::encode_encapsulated_npdu(message_id, None, Some(dest), npdu);
        self.send(&frame)
    }

    /// Send via the hub connector regardless of direct links.
    pub fn hub_send(&mut self, pdu: &[u8]) -> ScResult<()> {
        self.hub_connector
            .as_mut()
            .ok_or(ScError::InvalidOperation)?
            .send(pdu)
    }

    fn send_address_resolution(&mut self, dest: VmacAddress) {
        let message_id = self.next_message_id();
        let frame = bvlc::encode_address_resolution(message_id, None, Some(&dest));
        if let Err(e) = self.send(&frame) {
            debug!("address resolution for {} not sent: {}", dest, e);
        }
    }

    /// Begin a direct connection to a peer.
    pub fn connect_direct(
        &mut self,
        dest: Option<VmacAddress>,
        urls: &[String],
        now: Instant,
    ) -> ScResult<Vec<NodeEvent>> {
        if self.state != NodeState::Started || !self.conf.direct_connect_initiate_enabled {
            return Err(ScError::InvalidOperation);
        }
        let Some(node_switch) = self.node_switch.as_mut() else {
            return Err(ScError::InvalidOperation);
        };
        let events = node_switch.connect(dest, urls, &mut self.cache, now)?;
        Ok(self.drive(events.into_iter().map(RoleEvent::Ns).collect(), now))
    }

    /// Tear down the direct connection to `dest`.
    pub fn disconnect_direct(&mut self, dest: &VmacAddress, now: Instant) -> Vec<NodeEvent> {
        if self.state != NodeState::Started {
            return Vec::new();
        }
        let Some(node_switch) = self.node_switch.as_mut() else {
            return Vec::new();
        };
        let events = node_switch.disconnect(dest, now);
        self.drive(events.into_iter().map(RoleEvent::Ns).collect(), now)
    }

    /// True iff a direct connection matching `dest` or `urls` exists.
    pub fn direct_connection_established(
        &self,
        dest: Option<&VmacAddress>,
        urls: &[String],
    ) -> bool {
        self.node_switch
            .as_ref()
            .map_or(false, |ns| ns.connected(dest, urls))
    }

    /// Route a transport event to the role owning its context.
    pub fn on_ws_event(
        &mut self,
        ctx: ContextId,
        conn: Option<ConnHandle>,
        kind: WebSocketEventKind,
        now: Instant,
    ) -> Vec<NodeEvent> {
        let mut queue = VecDeque::new();
        if let Some(hub_connector) = self.hub_connector.as_mut() {
            if hub_connector.ctx_id() == ctx {
                queue.extend(
                    hub_connector
                        .on_ws_event(conn, kind, now)
                        .into_iter()
                        .map(RoleEvent::Hc),
                );
                return self.drive(queue, now);
            }
        }
        if let Some(hub_function) = self.hub_function.as_mut() {
            if hub_function.ctx_id() == ctx {
                queue.extend(
                    hub_function
                        .on_ws_event(conn, kind, now)
                        .into_iter()
                        .map(RoleEvent::Hf),
                );
                return self.drive(queue, now);
            }
        }
        if let Some(node_switch) = self.node_switch.as_mut() {
            if node_switch.owns_ctx(ctx) {
                queue.extend(
                    node_switch
                        .on_ws_event(ctx, conn, kind, now)
                        .into_iter()
                        .map(RoleEvent::Ns),
                );
                return self.drive(queue, now);
            }
        }
        debug!("transport event for unknown context {:?} dropped", ctx);
        Vec::new()
    }

    /// Run every role's timers and drain staged frames.
    pub fn maintenance(&mut self, now: Instant) -> Vec<NodeEvent> {
        let mut queue = VecDeque::new();
        if let Some(hub_connector) = self.hub_connector.as_mut() {
            queue.extend(hub_connector.maintenance(now).into_iter().map(RoleEvent::Hc));
        }
        if let Some(hub_function) = self.hub_function.as_mut() {
            queue.extend(hub_function.maintenance(now).into_iter().map(RoleEvent::Hf));
        }
        if let Some(node_switch) = self.node_switch.as_mut() {
            queue.extend(
                node_switch
                    .maintenance(&mut self.cache, now)
                    .into_iter()
                    .map(RoleEvent::Ns),
            );
        }
        self.drive(queue, now)
    }

    fn store_failed_request(&mut self, record: FailedConnectionRequest) {
        if self.failed_requests.len() >= FAILED_REQUEST_LOG_MAX {
            self.failed_requests.pop_front();
        }
        self.failed_requests.push_back(record);
    }

    fn restart(&mut self, now: Instant, queue: &mut VecDeque<RoleEvent>) {
        if self.state == NodeState::Stopping || self.state == NodeState::Restarting {
            return;
        }
        warn!("duplicate vmac detected, restarting node");
        self.state = NodeState::Restarting;
        self.stop_roles(now, queue);
    }

    fn roles_stopped(&self) -> bool {
        self.hub_connector.is_none() && self.hub_function.is_none() && self.node_switch.is_none()
    }

    fn roles_started(&self) -> bool {
        self.hub_function.as_ref().map_or(true, |hf| hf.started())
            && self.node_switch.as_ref().map_or(true, |ns| ns.started())
    }

    /// A role reported down. During startup that is fatal: tear the
    /// rest down and let the stop path report the failure.
    fn role_stopped(&mut self, now: Instant, queue: &mut VecDeque<RoleEvent>) -> Vec<NodeEvent> {
        if self.state == NodeState::Starting {
            self.state = NodeState::Stopping;
            self.stop_roles(now, queue);
        }
        self.process_stop_progress(now)
    }

    fn process_stop_progress(&mut self, now: Instant) -> Vec<NodeEvent> {
        if !self.roles_stopped() {
            return Vec::new();
        }
        match self.state {
            NodeState::Stopping => {
                self.state = NodeState::Idle;
                vec![NodeEvent::Stopped]
            }
            NodeState::Restarting => {
                // AB.6.2.2: pick a new Random-48 VMAC before rejoining
                self.conf.local_vmac = VmacAddress::random();
                debug!("restarting under new vmac {}", self.conf.local_vmac);
                match self.start_roles(now) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("restart failed: {}", e);
                        self.state = NodeState::Idle;
                        vec![NodeEvent::Stopped]
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    fn process_start_progress(&mut self) -> Vec<NodeEvent> {
        if (self.state == NodeState::Starting || self.state == NodeState::Restarting)
            && self.roles_started()
        {
            self.enter_started()
        } else {
            Vec::new()
        }
    }

    fn drive(&mut self, mut queue: VecDeque<RoleEvent>, now: Instant) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        while let Some(event) = queue.pop_front() {
            match event {
                RoleEvent::Hc(HubConnectorEvent::ConnectedPrimary)
                | RoleEvent::Hc(HubConnectorEvent::ConnectedFailover) => {}
                RoleEvent::Hc(HubConnectorEvent::Received { pdu, decoded }) => {
                    out.extend(self.process_received(pdu, decoded, now, &mut queue));
                }
                RoleEvent::Hc(HubConnectorEvent::DuplicatedVmac) => {
                    self.restart(now, &mut queue);
                }
                RoleEvent::Hc(HubConnectorEvent::Stopped) => {
                    self.hub_connector = None;
                    out.extend(self.role_stopped(now, &mut queue));
                }
                RoleEvent::Hf(HubFunctionEvent::Started) => {
                    out.extend(self.process_start_progress());
                }
                RoleEvent::Hf(HubFunctionEvent::Stopped) => {
                    self.hub_function = None;
                    out.extend(self.role_stopped(now, &mut queue));
                }
                RoleEvent::Hf(HubFunctionEvent::DuplicatedVmac) => {
                    self.restart(now, &mut queue);
                }
                RoleEvent::Hf(HubFunctionEvent::FailedRequest(record)) => {
                    self.store_failed_request(record);
                }
                RoleEvent::Ns(NodeSwitchEvent::Started) => {
                    out.extend(self.process_start_progress());
                }
                RoleEvent::Ns(NodeSwitchEvent::Stopped) => {
                    self.node_switch = None;
                    out.extend(self.role_stopped(now, &mut queue));
                }
                RoleEvent::Ns(NodeSwitchEvent::DuplicatedVmac) => {
                    self.restart(now, &mut queue);
                }
                RoleEvent::Ns(NodeSwitchEvent::Connected { dest }) => {
                    out.push(NodeEvent::DirectConnected { dest });
                }
                RoleEvent::Ns(NodeSwitchEvent::Disconnected { dest }) => {
                    out.push(NodeEvent::DirectDisconnected { dest });
                }
                RoleEvent::Ns(NodeSwitchEvent::Received { pdu, decoded }) => {
                    out.extend(self.process_received(pdu, decoded, now, &mut queue));
                }
                RoleEvent::Ns(NodeSwitchEvent::SendAddressResolution { dest }) => {
                    self.send_address_resolution(dest);
                }
                RoleEvent::Ns(NodeSwitchEvent::FailedRequest(record)) => {
                    self.store_failed_request(record);
                }
            }
        }
        out
    }

    /// Dispatch one received BVLC message (AB.6.5).
    fn process_received(
        &mut self,
        pdu: Vec<u8>,
        decoded: DecodedMessage,
        now: Instant,
        queue: &mut VecDeque<RoleEvent>,
    ) -> Vec<NodeEvent> {
        let mut out = Vec::new();

        // a destination option this node does not understand kills the
        // frame, with a NAK when the message can be NAKed at all
        if let Some(option) = decoded
            .header
            .dest_options
            .iter()
            .find(|o| o.must_understand)
        {
            debug!("frame with must-understand destination option dropped");
            if decoded.need_send_bvlc_result() {
                let frame = bvlc::encode_result_nak(
                    decoded.header.message_id,
                    None,
                    decoded.header.origin.as_ref(),
                    decoded.header.function,
                    Some(option.marker),
                    ErrorClass::Communication,
                    ErrorCode::HeaderNotUnderstood,
                    Some("'must understand' option not understood"),
                );
                if let Err(e) = self.send(&frame) {
                    debug!("header-not-understood nak not sent: {}", e);
                }
            }
            return out;
        }

        match decoded.header.function {
            BvlcFunction::Result => {
                if let Payload::Result(result) = &decoded.payload {
                    if result.function == BvlcFunction::AddressResolution && result.is_nak() {
                        // the peer exists but does not resolve; cache a
                        // negative record so we stop asking
                        if let Some(origin) = decoded.header.origin {
                            debug!("address resolution nak from {}", origin);
                            self.cache.insert(&origin, Vec::new(), now);
                        }
                    }
                }
                out.push(NodeEvent::ReceivedResult { pdu });
            }
            BvlcFunction::Advertisement => {
                out.push(NodeEvent::ReceivedAdvertisement { pdu });
            }
            BvlcFunction::AdvertisementSolicitation => {
                let support = if self.conf.direct_connect_accept_enabled {
                    DirectConnectionSupport::Supported
                } else {
                    DirectConnectionSupport::Unsupported
                };
                let message_id = self.next_message_id();
                let frame = bvlc::encode_advertisement(
                    message_id,
                    None,
                    decoded.header.origin.as_ref(),
                    self.hub_connector_state(),
                    support,
                    self.conf.max_bvlc_len,
                    self.conf.max_npdu_len,
                );
                if let Err(e) = self.send(&frame) {
                    debug!("advertisement not sent: {}", e);
                }
            }
            BvlcFunction::AddressResolution => {
                if self.conf.direct_connect_accept_enabled {
                    let uris = self.conf.direct_connect_accept_uris.join(" ");
                    let frame = bvlc::encode_address_resolution_ack(
                        decoded.header.message_id,
                        None,
                        decoded.header.origin.as_ref(),
                        &uris,
                    );
                    if let Err(e) = self.send(&frame) {
                        debug!("address resolution ack not sent: {}", e);
                    }
                } else {
                    let frame = bvlc::encode_result_nak(
                        decoded.header.message_id,
                        None,
                        decoded.header.origin.as_ref(),
                        BvlcFunction::AddressResolution,
                        None,
                        ErrorClass::Communication,
                        ErrorCode::OptionalFunctionalityNotSupported,
                        Some("direct connections are not supported"),
                    );
                    if let Err(e) = self.send(&frame) {
                        debug!("address resolution nak not sent: {}", e);
                    }
                }
            }
            BvlcFunction::AddressResolutionAck => {
                if let (Some(origin), Payload::AddressResolutionAck(blob)) =
                    (decoded.header.origin, &decoded.payload)
                {
                    let urls = parse_uri_blob(blob, MAX_URI_LEN, MAX_URIS_PER_VMAC);
                    self.cache.insert(&origin, urls.clone(), now);
                    if let Some(node_switch) = self.node_switch.as_mut() {
                        queue.extend(
                            node_switch
                                .process_address_resolution(&origin, &urls, &mut self.cache, now)
                                .into_iter()
                                .map(RoleEvent::Ns),
                        );
                    }
                }
            }
            BvlcFunction::EncapsulatedNpdu => {
                out.push(NodeEvent::ReceivedNpdu { pdu });
            }
            BvlcFunction::ProprietaryMessage => {
                out.push(NodeEvent::ReceivedProprietary { pdu });
            }
            _ => {
                debug!(
                    "{:?} is handled by the socket layer, dropped here",
                    decoded.header.function
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests;
