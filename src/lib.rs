//! # BACnet Secure Connect (BACnet/SC) datalink
//!
//! This crate implements the BACnet/SC datalink defined by ASHRAE 135
//! Addendum cc (Clauses AB.*): a TLS-over-WebSocket transport that carries
//! BACnet NPDUs between nodes identified by 6-octet virtual MAC addresses.
//!
//! # Overview
//!
//! A BACnet/SC node plays up to three roles at once:
//!
//! - **Hub connector**: maintains an outbound connection to a primary hub,
//!   failing over to a secondary hub and retrying with back-off.
//! - **Hub function**: accepts connections from other nodes and forwards
//!   frames among them, acting as the star-topology rendezvous.
//! - **Node switch**: accepts or initiates direct peer-to-peer connections
//!   that bypass the hub for unicast traffic, using a BVLC address
//!   resolution exchange to map a VMAC to candidate WebSocket URIs.
//!
//! The layering, bottom up:
//!
//! - [`bvlc`] — byte-exact encoder/decoder for the 13 BVLC/SC message types
//!   and their header options.
//! - [`websocket`] — the transport contract (events, protocol strings, TLS
//!   material) and the tokio-tungstenite production backend.
//! - [`socket`] — one SC association: connect/accept handshake, heartbeats,
//!   disconnect handshake, framing-rule enforcement.
//! - [`hub`], [`switch`] — the hub connector/function and the node switch.
//! - [`node`] — role orchestration, duplicate-VMAC restart, the address
//!   resolution cache.
//! - [`datalink`] — the blocking send/receive façade consumed by the upper
//!   BACnet stack.
//!
//! All shared state lives behind a single dispatch lock; transport
//! callbacks and the [`runloop::Runloop`] maintenance thread (one-second
//! tick) serialize through it.

pub mod bvlc;
pub mod datalink;
pub mod encoding;
pub mod hub;
pub mod netport;
pub mod node;
pub mod runloop;
pub mod socket;
pub mod switch;
pub mod telemetry;
pub mod util;
pub mod websocket;

// Re-export main types without glob imports to avoid conflicts
pub use bvlc::{BvlcFunction, DecodedMessage, ErrorClass, ErrorCode};
pub use datalink::{BacnetAddress, DataLink, ScDataLink, BROADCAST_NETWORK};
pub use netport::NetworkPortConfig;
pub use node::ScNode;
pub use util::{DeviceUuid, VmacAddress};

/// Size in octets of a BACnet/SC virtual MAC address (Clause H.7.3).
pub const VMAC_SIZE: usize = 6;

/// Size in octets of a BACnet/SC device UUID (AB.1.5.3, RFC 4122).
pub const UUID_SIZE: usize = 16;

/// Octets reserved in front of every outbound frame so origin and
/// destination VMAC fields can be inserted without moving the payload.
pub const BSC_PRE: usize = 2 * VMAC_SIZE;

/// Default maximum BVLC message size accepted by this datalink.
pub const BVLC_SC_NPDU_SIZE: usize = 1440;

/// Absolute NPDU ceiling for BACnet/SC (Table 6-1, NPDU Lengths of
/// BACnet Data Link Layers).
pub const BVLC_SC_NPDU_MAX_SIZE: usize = 61327;

/// Maximum number of header options per option list. The standard does
/// not bound the list; this implementation does.
pub const HEADER_OPTION_MAX: usize = 4;

#[cfg(test)]
mod tests {
    use crate::util::VmacAddress;
    use crate::{BSC_PRE, UUID_SIZE, VMAC_SIZE};

    #[test]
    fn test_constants() {
        assert_eq!(VMAC_SIZE, 6);
        assert_eq!(UUID_SIZE, 16);
        assert_eq!(BSC_PRE, 12);
    }

    #[test]
    fn test_broadcast_vmac() {
        assert!(VmacAddress::BROADCAST.is_broadcast());
        assert!(!VmacAddress::from([0, 1, 2, 3, 4, 5]).is_broadcast());
    }
}
