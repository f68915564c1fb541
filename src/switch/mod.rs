//! Node switch: direct peer-to-peer connections
//!
//! The node switch lets two SC nodes exchange unicast traffic without the
//! hub in the middle. It runs up to two socket contexts on the
//! direct-connect protocol: an acceptor bound to the configured port and
//! an initiator for outbound connections.
//!
//! An outbound attempt is tracked in a slot:
//!
//! ```text
//! IDLE -> WAIT_CONNECTION -> CONNECTED
//!   \        | all URLs failed   | drop
//!    \       v                   v
//!     -> WAIT_RESOLUTION -> DELAYING -> WAIT_CONNECTION ...
//! ```
//!
//! A slot opened by destination VMAC first consults the address
//! resolution cache; on a miss it asks the node to send an
//! Address-Resolution over the hub and waits in `WAIT_RESOLUTION` until
//! the matching ACK pushes candidate URIs in. URL lists are cycled one
//! entry at a time with a reconnect delay between full passes.
//!
//! The switch also decides per outbound PDU whether a direct link exists
//! (strip both VMAC fields, send on the link) or the frame must fall
//! back to the hub connector.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::bvlc::{self, DecodedMessage, ErrorCode};
use crate::encoding::BacnetDateTime;
use crate::node::AddressCache;
use crate::socket::{ContextConfig, ContextKind, Output, ScError, ScResult, SocketContext};
use crate::telemetry::{ConnectionState, DirectConnectionStatus, FailedConnectionRequest};
use crate::util::{Timer, VmacAddress};
use crate::websocket::{
    ConnHandle, ContextId, EventSink, WebSocketEventKind, WebSocketProtocol, WebSocketTransport,
};

/// Outbound and inbound direct connections supported per node switch.
pub const NODE_SWITCH_CONNECTIONS: usize = 10;

/// Bounded length of the direct-connection status list.
const STATUS_LIST_MAX: usize = NODE_SWITCH_CONNECTIONS * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideState {
    Idle,
    Starting,
    Started,
    Stopping,
}

/// Sub-state of one outbound connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    WaitConnection,
    WaitResolution,
    Connected,
    Delaying,
    LocalDisconnect,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    dest: VmacAddress,
    urls: Vec<String>,
    url_index: usize,
    timer: Timer,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: SlotState::Idle,
            dest: VmacAddress::UNSPECIFIED,
            urls: Vec::new(),
            url_index: 0,
            timer: Timer::new(),
        }
    }

    fn reset(&mut self) {
        *self = Slot::new();
    }

    /// URL of the attempt in flight, if any.
    fn current_url(&self) -> Option<&str> {
        self.url_index
            .checked_sub(1)
            .and_then(|i| self.urls.get(i))
            .map(String::as_str)
    }
}

/// Events a node switch reports to the node.
#[derive(Debug)]
pub enum NodeSwitchEvent {
    Started,
    Stopped,
    DuplicatedVmac,
    /// A direct connection to `dest` completed.
    Connected { dest: VmacAddress },
    /// The direct connection to `dest` is gone.
    Disconnected { dest: VmacAddress },
    /// A frame arrived on a direct link; the originating VMAC has been
    /// installed from the link's peer identity.
    Received { pdu: Vec<u8>, decoded: DecodedMessage },
    /// The switch needs candidate URIs for `dest`: the node must send an
    /// Address-Resolution over the hub.
    SendAddressResolution { dest: VmacAddress },
    /// An inbound direct connection attempt failed.
    FailedRequest(FailedConnectionRequest),
}

/// Routing decision for one outbound PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Sent on a direct link.
    Direct,
    /// No direct link; the caller sends the frame via the hub connector.
    FallbackToHub,
}

struct InitiatorSide {
    ctx: SocketContext,
    state: SideState,
    slots: Vec<Slot>,
}

struct AcceptorSide {
    ctx: SocketContext,
    state: SideState,
}

/// Direct peer-to-peer connection manager.
pub struct NodeSwitch {
    initiator: Option<InitiatorSide>,
    acceptor: Option<AcceptorSide>,
    reconnect_timeout: Duration,
    resolution_timeout: Duration,
    status: VecDeque<DirectConnectionStatus>,
}

impl NodeSwitch {
    /// Build a node switch. `initiate_cfg`/`accept_cfg` are present for
    /// the enabled directions; at least one must be given.
    pub fn new(
        initiate_cfg: Option<ContextConfig>,
        accept_cfg: Option<ContextConfig>,
        reconnect_timeout: Duration,
        resolution_timeout: Duration,
        transport: Arc<dyn WebSocketTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let initiator = initiate_cfg.map(|cfg| {
            debug_assert_eq!(cfg.kind, ContextKind::Initiator);
            debug_assert_eq!(cfg.proto, WebSocketProtocol::DirectConnect);
            InitiatorSide {
                ctx: SocketContext::new(cfg, NODE_SWITCH_CONNECTIONS, transport.clone(), sink.clone()),
                state: SideState::Idle,
                slots: (0..NODE_SWITCH_CONNECTIONS).map(|_| Slot::new()).collect(),
            }
        });
        let acceptor = accept_cfg.map(|cfg| {
            debug_assert_eq!(cfg.kind, ContextKind::Acceptor);
            debug_assert_eq!(cfg.proto, WebSocketProtocol::DirectConnect);
            AcceptorSide {
                ctx: SocketContext::new(cfg, NODE_SWITCH_CONNECTIONS, transport, sink),
                state: SideState::Idle,
            }
        });
        NodeSwitch {
            initiator,
            acceptor,
            reconnect_timeout,
            resolution_timeout,
            status: VecDeque::new(),
        }
    }

    /// True if this switch accepts inbound direct connections.
    pub fn accepts_connections(&self) -> bool {
        self.acceptor.is_some()
    }

    /// True if this switch initiates outbound direct connections.
    pub fn initiates_connections(&self) -> bool {
        self.initiator.is_some()
    }

    /// True if the event context id belongs to this switch.
    pub fn owns_ctx(&self, ctx: ContextId) -> bool {
        self.initiator.as_ref().map_or(false, |s| s.ctx.id() == ctx)
            || self.acceptor.as_ref().map_or(false, |s| s.ctx.id() == ctx)
    }

    pub fn started(&self) -> bool {
        self.initiator.as_ref().map_or(true, |s| s.state == SideState::Started)
            && self.acceptor.as_ref().map_or(true, |s| s.state == SideState::Started)
            && (self.initiator.is_some() || self.acceptor.is_some())
    }

    pub fn stopped(&self) -> bool {
        self.initiator.as_ref().map_or(true, |s| s.state == SideState::Idle)
            && self.acceptor.as_ref().map_or(true, |s| s.state == SideState::Idle)
    }

    /// Per-peer direct connection status records, oldest first.
    pub fn status_list(&self) -> impl Iterator<Item = &DirectConnectionStatus> {
        self.status.iter()
    }

    /// Start the enabled sides. [`NodeSwitchEvent::Started`] follows once
    /// every side is up; an initiator-only switch starts synchronously.
    pub fn start(&mut self, now: Instant) -> ScResult<Vec<NodeSwitchEvent>> {
        let mut outputs = Vec::new();
        if let Some(side) = self.initiator.as_mut() {
            side.state = SideState::Starting;
            for output in side.ctx.start()? {
                outputs.push((true, output));
            }
        }
        if let Some(side) = self.acceptor.as_mut() {
            side.state = SideState::Starting;
            for output in side.ctx.start()? {
                outputs.push((false, output));
            }
        }
        Ok(self.process(outputs, now))
    }

    /// Stop both sides; [`NodeSwitchEvent::Stopped`] follows.
    pub fn stop(&mut self, now: Instant) -> Vec<NodeSwitchEvent> {
        let mut outputs = Vec::new();
        if let Some(side) = self.initiator.as_mut() {
            if side.state != SideState::Idle && side.state != SideState::Stopping {
                side.state = SideState::Stopping;
                for output in side.ctx.stop() {
                    outputs.push((true, output));
                }
            }
        }
        if let Some(side) = self.acceptor.as_mut() {
            if side.state != SideState::Idle && side.state != SideState::Stopping {
                side.state = SideState::Stopping;
                for output in side.ctx.stop() {
                    outputs.push((false, output));
                }
            }
        }
        self.process(outputs, now)
    }

    /// Open a direct connection by explicit URL list or by destination
    /// VMAC (resolved through the cache or an Address-Resolution
    /// exchange).
    pub fn connect(
        &mut self,
        dest: Option<VmacAddress>,
        urls: &[String],
        cache: &mut AddressCache,
        now: Instant,
    ) -> ScResult<Vec<NodeSwitchEvent>> {
        if dest.is_some() == !urls.is_empty() {
            // exactly one of dest and urls selects the target
            return Err(ScError::BadParam);
        }
        let Some(side) = self.initiator.as_mut() else {
            return Err(ScError::InvalidOperation);
        };
        if side.state != SideState::Started {
            return Err(ScError::InvalidOperation);
        }

        let mut events = Vec::new();
        if !urls.is_empty() {
            let slot = Self::alloc_slot(side)?;
            side.slots[slot].urls = urls.to_vec();
            side.slots[slot].url_index = 0;
            Self::connect_or_delay(
                side,
                slot,
                None,
                cache,
                self.reconnect_timeout,
                self.resolution_timeout,
                now,
                &mut events,
            );
        } else {
            let dest = dest.ok_or(ScError::BadParam)?;
            if Self::find_slot_by_vmac(side, &dest).is_none() {
                let slot = Self::alloc_slot(side)?;
                side.slots[slot].urls.clear();
                side.slots[slot].url_index = 0;
                Self::connect_or_delay(
                    side,
                    slot,
                    Some(dest),
                    cache,
                    self.reconnect_timeout,
                    self.resolution_timeout,
                    now,
                    &mut events,
                );
            }
        }
        Ok(events)
    }

    /// Close the direct connection to `dest`, if any.
    pub fn disconnect(&mut self, dest: &VmacAddress, now: Instant) -> Vec<NodeSwitchEvent> {
        let mut events = Vec::new();
        let Some(side) = self.initiator.as_mut() else {
            return events;
        };
        if let Some(slot) = Self::find_slot_by_vmac(side, dest) {
            match side.slots[slot].state {
                SlotState::LocalDisconnect => {}
                SlotState::Connected | SlotState::WaitConnection => {
                    side.ctx.disconnect_socket(slot, now);
                    side.slots[slot].state = SlotState::LocalDisconnect;
                }
                _ => {
                    let dest = side.slots[slot].dest;
                    side.slots[slot].reset();
                    events.push(NodeSwitchEvent::Disconnected { dest });
                }
            }
        }
        events
    }

    /// Route one outbound frame: on a direct link when one exists for the
    /// destination, otherwise report hub fallback.
    pub fn send(&mut self, pdu: &[u8]) -> ScResult<SendDisposition> {
        if bvlc::pdu_has_no_dest(pdu) || bvlc::pdu_has_dest_broadcast(pdu) {
            return Ok(SendDisposition::FallbackToHub);
        }
        let Some(dest) = bvlc::pdu_get_dest(pdu) else {
            return Ok(SendDisposition::FallbackToHub);
        };

        if let Some(side) = self.initiator.as_mut() {
            if let Some(slot) = Self::find_slot_by_vmac(side, &dest) {
                if side.slots[slot].state == SlotState::Connected {
                    let mut frame = pdu.to_vec();
                    bvlc::remove_orig_and_dest(&mut frame);
                    side.ctx.send(slot, &frame)?;
                    return Ok(SendDisposition::Direct);
                }
            }
        }
        if let Some(side) = self.acceptor.as_mut() {
            if let Some(index) = side.ctx.find_socket_by_vmac(&dest) {
                if side.ctx.socket(index).state() == crate::socket::SocketState::Connected {
                    let mut frame = pdu.to_vec();
                    bvlc::remove_orig_and_dest(&mut frame);
                    side.ctx.send(index, &frame)?;
                    return Ok(SendDisposition::Direct);
                }
            }
        }
        Ok(SendDisposition::FallbackToHub)
    }

    /// True iff a direct connection matching `dest` or one of `urls`
    /// exists (AB.6.4.3 checks).
    pub fn connected(&self, dest: Option<&VmacAddress>, urls: &[String]) -> bool {
        if dest.is_none() && urls.is_empty() {
            return false;
        }
        if let Some(side) = self.initiator.as_ref() {
            if let Some(dest) = dest {
                if let Some(slot) = Self::find_slot_by_vmac(side, dest) {
                    if side.slots[slot].state == SlotState::Connected {
                        return true;
                    }
                }
            } else {
                for slot in &side.slots {
                    if slot.state == SlotState::Connected
                        && slot.urls.iter().any(|u| urls.contains(u))
                    {
                        return true;
                    }
                }
            }
        }
        if let Some(side) = self.acceptor.as_ref() {
            if let Some(dest) = dest {
                if let Some(index) = side.ctx.find_socket_by_vmac(dest) {
                    if side.ctx.socket(index).state() == crate::socket::SocketState::Connected {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Push a decoded Address-Resolution-ACK URI list to the matching
    /// slot; a slot waiting in `WAIT_RESOLUTION` starts connecting.
    pub fn process_address_resolution(
        &mut self,
        vmac: &VmacAddress,
        urls: &[String],
        cache: &mut AddressCache,
        now: Instant,
    ) -> Vec<NodeSwitchEvent> {
        let mut events = Vec::new();
        if urls.is_empty() {
            return events;
        }
        let reconnect = self.reconnect_timeout;
        let resolution = self.resolution_timeout;
        if let Some(side) = self.initiator.as_mut() {
            if let Some(slot) = Self::find_slot_by_vmac(side, vmac) {
                if side.slots[slot].state == SlotState::WaitResolution {
                    side.slots[slot].urls = urls.to_vec();
                    side.slots[slot].url_index = 0;
                    Self::connect_or_delay(
                        side, slot, None, cache, reconnect, resolution, now, &mut events,
                    );
                }
            }
        }
        events
    }

    /// Route a transport event belonging to one of this switch's
    /// contexts.
    pub fn on_ws_event(
        &mut self,
        ctx: ContextId,
        conn: Option<ConnHandle>,
        kind: WebSocketEventKind,
        now: Instant,
    ) -> Vec<NodeSwitchEvent> {
        let mut outputs = Vec::new();
        if let Some(side) = self.initiator.as_mut() {
            if side.ctx.id() == ctx {
                for output in side.ctx.on_ws_event(conn, kind, now) {
                    outputs.push((true, output));
                }
                return self.process(outputs, now);
            }
        }
        if let Some(side) = self.acceptor.as_mut() {
            if side.ctx.id() == ctx {
                for output in side.ctx.on_ws_event(conn, kind, now) {
                    outputs.push((false, output));
                }
                return self.process(outputs, now);
            }
        }
        Vec::new()
    }

    /// Drain staged frames, run socket timers and tick the slot machine.
    pub fn maintenance(&mut self, cache: &mut AddressCache, now: Instant) -> Vec<NodeSwitchEvent> {
        let mut outputs = Vec::new();
        if let Some(side) = self.initiator.as_mut() {
            for output in side.ctx.maintenance(now) {
                outputs.push((true, output));
            }
        }
        if let Some(side) = self.acceptor.as_mut() {
            for output in side.ctx.maintenance(now) {
                outputs.push((false, output));
            }
        }
        let mut events = self.process(outputs, now);

        let reconnect = self.reconnect_timeout;
        let resolution = self.resolution_timeout;
        if let Some(side) = self.initiator.as_mut() {
            for slot in 0..side.slots.len() {
                match side.slots[slot].state {
                    SlotState::Delaying if side.slots[slot].timer.expired(now) => {
                        side.slots[slot].url_index = 0;
                        let dest = side.slots[slot].dest;
                        let dest = (!dest.is_unspecified()).then_some(dest);
                        Self::connect_or_delay(
                            side, slot, dest, cache, reconnect, resolution, now, &mut events,
                        );
                    }
                    SlotState::WaitResolution if side.slots[slot].timer.expired(now) => {
                        side.slots[slot].state = SlotState::Delaying;
                        side.slots[slot].timer.set(now, reconnect);
                    }
                    _ => {}
                }
            }
        }
        events
    }

    fn alloc_slot(side: &mut InitiatorSide) -> ScResult<usize> {
        side.slots
            .iter()
            .position(|s| s.state == SlotState::Idle)
            .ok_or(ScError::NoResources)
    }

    fn find_slot_by_vmac(side: &InitiatorSide, vmac: &VmacAddress) -> Option<usize> {
        side.slots
            .iter()
            .position(|s| s.state != SlotState::Idle && s.dest == *vmac)
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_or_delay(
        side: &mut InitiatorSide,
        slot: usize,
        dest: Option<VmacAddress>,
        cache: &mut AddressCache,
        reconnect: Duration,
        resolution: Duration,
        now: Instant,
        events: &mut Vec<NodeSwitchEvent>,
    ) {
        if !side.slots[slot].urls.is_empty() {
            Self::connect_next_url(side, slot, reconnect, now);
        } else if let Some(dest) = dest {
            if let Some(urls) = cache.lookup(&dest, now) {
                side.slots[slot].urls = urls.to_vec();
                side.slots[slot].url_index = 0;
                Self::connect_next_url(side, slot, reconnect, now);
            } else {
                side.slots[slot].state = SlotState::WaitResolution;
                side.slots[slot].dest = dest;
                side.slots[slot].urls.clear();
                side.slots[slot].timer.set(now, resolution);
                events.push(NodeSwitchEvent::SendAddressResolution { dest });
            }
        }
    }

    fn connect_next_url(side: &mut InitiatorSide, slot: usize, reconnect: Duration, now: Instant) {
        loop {
            if side.slots[slot].url_index >= side.slots[slot].urls.len() {
                side.slots[slot].state = SlotState::Delaying;
                side.slots[slot].timer.set(now, reconnect);
                side.slots[slot].url_index = 0;
                return;
            }
            side.slots[slot].state = SlotState::WaitConnection;
            let url = side.slots[slot].urls[side.slots[slot].url_index].clone();
            side.slots[slot].url_index += 1;
            match side.ctx.connect(slot, &url) {
                Ok(()) => return,
                Err(e) => {
                    debug!("direct connect to {} failed synchronously: {}", url, e);
                }
            }
        }
    }

    fn status_for_vmac(&mut self, vmac: VmacAddress) -> &mut DirectConnectionStatus {
        if let Some(pos) = self.status.iter().position(|s| s.peer_vmac == vmac) {
            return &mut self.status[pos];
        }
        if self.status.len() >= STATUS_LIST_MAX {
            self.status.pop_front();
        }
        self.status.push_back(DirectConnectionStatus {
            peer_vmac: vmac,
            ..Default::default()
        });
        let last = self.status.len() - 1;
        &mut self.status[last]
    }

    #[allow(clippy::too_many_arguments)]
    fn update_status(
        &mut self,
        initiator: bool,
        socket: usize,
        connected: bool,
        failed_to_connect: bool,
        uri: Option<String>,
        reason: ErrorCode,
        description: &str,
    ) {
        let (vmac, uuid, peer) = {
            let side_ctx = if initiator {
                self.initiator.as_ref().map(|s| &s.ctx)
            } else {
                self.acceptor.as_ref().map(|s| &s.ctx)
            };
            let Some(ctx) = side_ctx else { return };
            (
                ctx.socket(socket).peer_vmac(),
                ctx.socket(socket).peer_uuid(),
                ctx.peer_address(socket),
            )
        };
        if vmac.is_unspecified() {
            return;
        }
        let details = crate::util::bounded_string(description, 128);
        let status = self.status_for_vmac(vmac);
        status.uri = if initiator { uri.unwrap_or_default() } else { String::new() };
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
            if failed_to_connect {
                status.state = ConnectionState::FailedToConnect;
                status.error = Some(reason);
            } else if reason == ErrorCode::WebsocketClosedByPeer || reason == ErrorCode::Success {
                status.state = ConnectionState::NotConnected;
            } else {
                status.state = ConnectionState::DisconnectedWithErrors;
                status.error = Some(reason);
            }
        }
    }

    fn side_states(&self) -> (Option<SideState>, Option<SideState>) {
        (
            self.initiator.as_ref().map(|s| s.state),
            self.acceptor.as_ref().map(|s| s.state),
        )
    }

    fn process(&mut self, outputs: Vec<(bool, Output)>, now: Instant) -> Vec<NodeSwitchEvent> {
        let mut events = Vec::new();
        let reconnect = self.reconnect_timeout;

        for (is_initiator, output) in outputs {
            match output {
                Output::Connected { socket } => {
                    if is_initiator {
                        let Some(side) = self.initiator.as_mut() else { continue };
                        if side.slots[socket].state != SlotState::WaitConnection {
                            continue;
                        }
                        side.slots[socket].state = SlotState::Connected;
                        // a slot opened by URL has no dest yet: always
                        // take the peer identity from the socket
                        let dest = side.ctx.socket(socket).peer_vmac();
                        side.slots[socket].dest = dest;
                        let uri = side.slots[socket].current_url().map(str::to_string);
                        self.update_status(true, socket, true, false, uri, ErrorCode::Success, "");
                        events.push(NodeSwitchEvent::Connected { dest });
                    } else {
                        self.update_status(false, socket, true, false, None, ErrorCode::Success, "");
                    }
                }
                Output::Disconnected {
                    socket,
                    reason,
                    description,
                } => {
                    if reason == ErrorCode::NodeDuplicateVmac {
                        events.push(NodeSwitchEvent::DuplicatedVmac);
                    }
                    if is_initiator {
                        let Some(side) = self.initiator.as_mut() else { continue };
                        let uri = side.slots[socket].current_url().map(str::to_string);
                        match side.slots[socket].state {
                            SlotState::WaitConnection => {
                                self.update_status(
                                    true, socket, false, true, uri, reason, &description,
                                );
                                let side = self.initiator.as_mut().expect("side checked above");
                                Self::connect_next_url(side, socket, reconnect, now);
                            }
                            SlotState::Connected => {
                                self.update_status(
                                    true, socket, false, false, uri, reason, &description,
                                );
                                let side = self.initiator.as_mut().expect("side checked above");
                                let dest = side.slots[socket].dest;
                                events.push(NodeSwitchEvent::Disconnected { dest });
                                side.slots[socket].url_index = 0;
                                Self::connect_next_url(side, socket, reconnect, now);
                            }
                            SlotState::LocalDisconnect => {
                                self.update_status(
                                    true,
                                    socket,
                                    false,
                                    false,
                                    uri,
                                    ErrorCode::Success,
                                    "",
                                );
                                let side = self.initiator.as_mut().expect("side checked above");
                                let dest = side.slots[socket].dest;
                                side.slots[socket].reset();
                                events.push(NodeSwitchEvent::Disconnected { dest });
                            }
                            _ => {}
                        }
                    } else {
                        self.update_status(false, socket, false, false, None, reason, &description);
                    }
                }
                Output::Received { socket, pdu, decoded: _ } => {
                    // a direct link binds both identities; install the
                    // peer VMAC as origin before handing the frame up
                    let peer = if is_initiator {
                        self.initiator.as_ref().map(|s| s.ctx.socket(socket).peer_vmac())
                    } else {
                        self.acceptor.as_ref().map(|s| s.ctx.socket(socket).peer_vmac())
                    };
                    let Some(peer) = peer else { continue };
                    let mut frame = pdu;
                    bvlc::set_orig(&mut frame, &peer);
                    match bvlc::decode_message(&frame) {
                        Ok(redecoded) => events.push(NodeSwitchEvent::Received {
                            pdu: frame,
                            decoded: redecoded,
                        }),
                        Err(e) => {
                            debug!("re-decode after origin insert failed: {}", e);
                        }
                    }
                }
                Output::Initialized => {
                    if is_initiator {
                        if let Some(side) = self.initiator.as_mut() {
                            side.state = SideState::Started;
                        }
                    } else if let Some(side) = self.acceptor.as_mut() {
                        side.state = SideState::Started;
                    }
                    if self.started() {
                        events.push(NodeSwitchEvent::Started);
                    }
                }
                Output::Deinitialized => {
                    if is_initiator {
                        if let Some(side) = self.initiator.as_mut() {
                            for slot in side.slots.iter_mut() {
                                if slot.state == SlotState::Connected {
                                    let dest = slot.dest;
                                    events.push(NodeSwitchEvent::Disconnected { dest });
                                }
                                slot.reset();
                            }
                            side.state = SideState::Idle;
                        }
                    } else if let Some(side) = self.acceptor.as_mut() {
                        side.state = SideState::Idle;
                    }
                    let (initiator, acceptor) = self.side_states();
                    let initiator_idle = initiator.map_or(true, |s| s == SideState::Idle);
                    let acceptor_idle = acceptor.map_or(true, |s| s == SideState::Idle);
                    if initiator_idle && acceptor_idle {
                        events.push(NodeSwitchEvent::Stopped);
                    }
                }
                Output::FailedRequest {
                    peer,
                    vmac,
                    uuid,
                    error,
                    description,
                } => {
                    events.push(NodeSwitchEvent::FailedRequest(FailedConnectionRequest {
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
mod tests;
