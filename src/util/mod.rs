//! Common BACnet/SC value types and helpers
//!
//! This module provides the small building blocks shared by every layer of
//! the secure-connect datalink:
//!
//! - [`VmacAddress`] — the 6-octet virtual MAC identifying a node on an SC
//!   network, including Random-48 generation per AB.1.5.2
//! - [`DeviceUuid`] — the persistent 16-octet device UUID (AB.1.5.3)
//! - [`HostNPort`] — a peer address as either a socket address or a DNS
//!   name plus port, as used by telemetry records
//! - [`Timer`] — a millisecond one-shot timer with an explicit-`now` API so
//!   state machines stay deterministic under test
//!
//! # Examples
//!
//! ```
//! use bacnet_sc::util::VmacAddress;
//!
//! let vmac = VmacAddress::random();
//! assert!(!vmac.is_broadcast());
//! assert!(!vmac.is_unspecified());
//! // Locally administered, individual address
//! assert_eq!(vmac.as_bytes()[0] & 0x03, 0x02);
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::{UUID_SIZE, VMAC_SIZE};

pub mod enum_macros;

/// BACnet/SC virtual MAC address (Clause H.7.3).
///
/// For broadcast BVLC messages the destination VMAC is the non-EUI-48
/// value `FF:FF:FF:FF:FF:FF`. The reserved EUI-48 value
/// `00:00:00:00:00:00` is never used on the wire and marks an unknown or
/// uninitialized address internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VmacAddress([u8; VMAC_SIZE]);

impl VmacAddress {
    /// The Local Broadcast VMAC address.
    pub const BROADCAST: VmacAddress = VmacAddress([0xFF; VMAC_SIZE]);

    /// The reserved all-zero address (unknown/uninitialized).
    pub const UNSPECIFIED: VmacAddress = VmacAddress([0; VMAC_SIZE]);

    /// Create a VMAC from raw octets.
    pub const fn new(octets: [u8; VMAC_SIZE]) -> Self {
        VmacAddress(octets)
    }

    /// Generate a Random-48 VMAC per AB.1.5.2: random octets with the
    /// locally-administered bit set and the individual/group bit clear in
    /// the first octet. Redraws while the result collides with the
    /// broadcast or reserved address.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut octets = [0u8; VMAC_SIZE];
            rng.fill(&mut octets[..]);
            octets[0] = (octets[0] & 0xF0) | 0x02;
            let vmac = VmacAddress(octets);
            if !vmac.is_broadcast() && !vmac.is_unspecified() {
                return vmac;
            }
        }
    }

    /// Raw octets of the address.
    pub const fn as_bytes(&self) -> &[u8; VMAC_SIZE] {
        &self.0
    }

    /// True for the Local Broadcast VMAC address (all ones).
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; VMAC_SIZE]
    }

    /// True for the reserved all-zero address.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; VMAC_SIZE]
    }
}

impl From<[u8; VMAC_SIZE]> for VmacAddress {
    fn from(octets: [u8; VMAC_SIZE]) -> Self {
        VmacAddress(octets)
    }
}

impl TryFrom<&[u8]> for VmacAddress {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> std::result::Result<Self, Self::Error> {
        Ok(VmacAddress(slice.try_into()?))
    }
}

impl fmt::Display for VmacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for octet in &self.0 {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{}", hex::encode_upper([*octet]))?;
            first = false;
        }
        Ok(())
    }
}

/// BACnet/SC device UUID (AB.1.5.3).
///
/// Identifies the device regardless of its current VMAC address or device
/// instance number. Generated before first deployment, stored
/// persistently, and never changed over the lifetime of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceUuid([u8; UUID_SIZE]);

impl DeviceUuid {
    /// Create a UUID from raw octets.
    pub const fn new(octets: [u8; UUID_SIZE]) -> Self {
        DeviceUuid(octets)
    }

    /// Raw octets of the UUID.
    pub const fn as_bytes(&self) -> &[u8; UUID_SIZE] {
        &self.0
    }
}

impl From<[u8; UUID_SIZE]> for DeviceUuid {
    fn from(octets: [u8; UUID_SIZE]) -> Self {
        DeviceUuid(octets)
    }
}

impl TryFrom<&[u8]> for DeviceUuid {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> std::result::Result<Self, Self::Error> {
        Ok(DeviceUuid(slice.try_into()?))
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

/// Peer address in BACnet Host-N-Port form: a resolved socket address or
/// a DNS hostname plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HostNPort {
    /// No address information available.
    None,
    /// Packed IPv4/IPv6 address and port.
    Ip(SocketAddr),
    /// DNS hostname and port.
    Domain(String, u16),
}

impl HostNPort {
    /// Port component, if any address is present.
    pub fn port(&self) -> Option<u16> {
        match self {
            HostNPort::None => None,
            HostNPort::Ip(addr) => Some(addr.port()),
            HostNPort::Domain(_, port) => Some(*port),
        }
    }
}

impl Default for HostNPort {
    fn default() -> Self {
        HostNPort::None
    }
}

impl fmt::Display for HostNPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostNPort::None => write!(f, "(none)"),
            HostNPort::Ip(addr) => write!(f, "{}", addr),
            HostNPort::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Millisecond one-shot timer.
///
/// Expiry checks take an explicit `now` so the maintenance loop passes a
/// single sampled instant through every state machine and tests can drive
/// time synthetically.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    started: Option<Instant>,
    interval: Duration,
}

impl Timer {
    /// Create a stopped timer.
    pub fn new() -> Self {
        Timer::default()
    }

    /// Arm the timer for `interval` from `now`.
    pub fn set(&mut self, now: Instant, interval: Duration) {
        self.started = Some(now);
        self.interval = interval;
    }

    /// Re-arm with the previously configured interval.
    pub fn restart(&mut self, now: Instant) {
        self.started = Some(now);
    }

    /// Disarm the timer; `expired` returns false until re-armed.
    pub fn stop(&mut self) {
        self.started = None;
    }

    /// True once the interval has elapsed since the timer was armed.
    pub fn expired(&self, now: Instant) -> bool {
        match self.started {
            Some(started) => now.saturating_duration_since(started) >= self.interval,
            None => false,
        }
    }

    /// Time elapsed since the timer was armed; zero when stopped.
    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.started {
            Some(started) => now.saturating_duration_since(started),
            None => Duration::ZERO,
        }
    }

    /// True if the timer is armed.
    pub fn is_armed(&self) -> bool {
        self.started.is_some()
    }
}

/// Copy a detail string into the bounded form stored in telemetry
/// records, truncating on a character boundary.
pub fn bounded_string(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Random initial 16-bit message id. Message ids are monotone per sender
/// after this, wrapping at 2^16.
pub fn random_message_id() -> u16 {
    rand::thread_rng().gen()
}
