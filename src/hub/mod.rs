//! BACnet/SC hub roles
//!
//! Two of the three roles a secure-connect node can play live here:
//!
//! - [`connector::HubConnector`] keeps the node attached to a redundant
//!   hub pair: connect to the primary, fail over to the secondary, retry
//!   with back-off (AB.6.2.2 from the spoke side).
//! - [`function::HubFunction`] is the hub itself: it accepts spoke
//!   connections and forwards every Encapsulated-NPDU among them,
//!   rewriting the originating VMAC so receivers know the true sender
//!   (AB.6.2.4).
//!
//! Both are thin interpreters over a [`crate::socket::SocketContext`];
//! the per-connection handshake, heartbeat and disconnect machinery is
//! the socket's business.

pub mod connector;
pub mod function;

pub use connector::{ConnectorState, HubConnector, HubConnectorEvent};
pub use function::{HubFunction, HubFunctionEvent};
