//! Secure-connect connection status records
//!
//! Every BACnet/SC role keeps per-peer telemetry that is surfaced through
//! Network-Port properties: hub connection status (primary and failover),
//! hub function connection status, direct connection status, and the
//! bounded failed-connection-requests log. Each record carries the peer
//! identity, connect/disconnect timestamps, a BACnet error code and a
//! UTF-8 detail string.
//!
//! The records are plain data here; ownership rules live with the
//! components (the hub connector mutates its own two records, the hub
//! function and node switch maintain per-peer lists, oldest entries are
//! overwritten when a bounded list fills).
//!
//! The `encode_sc_*` / `decode_sc_*` pairs produce the Clause 21
//! constructed sequences with numbered context tags used by the
//! `SC_*_Status` properties; `_context_` variants wrap a record in an
//! outer context tag for use inside lists.

use std::fmt;

use crate::bvlc::ErrorCode;
use crate::encoding::{
    self, decode_context_character_string, decode_context_datetime, decode_context_enumerated,
    decode_context_octet_string, decode_context_tag, decode_context_unsigned,
    encode_closing_tag, encode_context_character_string, encode_context_datetime,
    encode_context_enumerated, encode_context_octet_string, encode_context_tag,
    encode_context_unsigned, encode_opening_tag, is_closing_tag, is_opening_tag, BacnetDateTime,
    EncodingError,
};
use crate::util::{DeviceUuid, HostNPort, VmacAddress};
use crate::{UUID_SIZE, VMAC_SIZE};

/// Result alias shared with the encoding layer
pub type Result<T> = encoding::Result<T>;

/// BACnetSCConnectionState (Clause 21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    NotConnected = 0,
    Connected = 1,
    DisconnectedWithErrors = 2,
    FailedToConnect = 3,
}

impl ConnectionState {
    fn carries_error(self) -> bool {
        matches!(
            self,
            ConnectionState::DisconnectedWithErrors | ConnectionState::FailedToConnect
        )
    }
}

impl TryFrom<u32> for ConnectionState {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            0 => Ok(ConnectionState::NotConnected),
            1 => Ok(ConnectionState::Connected),
            2 => Ok(ConnectionState::DisconnectedWithErrors),
            3 => Ok(ConnectionState::FailedToConnect),
            other => Err(other),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::NotConnected => "not-connected",
            ConnectionState::Connected => "connected",
            ConnectionState::DisconnectedWithErrors => "disconnected-with-errors",
            ConnectionState::FailedToConnect => "failed-to-connect",
        };
        f.write_str(name)
    }
}

/// SC_Primary_Hub_Connection_Status / SC_Failover_Hub_Connection_Status
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HubConnectionStatus {
    pub state: ConnectionState,
    pub connect_timestamp: BacnetDateTime,
    pub disconnect_timestamp: BacnetDateTime,
    pub error: Option<ErrorCode>,
    pub error_details: String,
}

impl Default for HubConnectionStatus {
    fn default() -> Self {
        HubConnectionStatus {
            state: ConnectionState::NotConnected,
            connect_timestamp: BacnetDateTime::unspecified(),
            disconnect_timestamp: BacnetDateTime::unspecified(),
            error: None,
            error_details: String::new(),
        }
    }
}

impl fmt::Display for HubConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connect {} disconnect {}",
            self.state, self.connect_timestamp, self.disconnect_timestamp
        )?;
        if let Some(error) = self.error {
            write!(f, " error {} '{}'", error, self.error_details)?;
        }
        Ok(())
    }
}

/// One entry of the SC_Hub_Function_Connection_Status list
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HubFunctionConnectionStatus {
    pub state: ConnectionState,
    pub connect_timestamp: BacnetDateTime,
    pub disconnect_timestamp: BacnetDateTime,
    pub peer_address: HostNPort,
    pub peer_vmac: VmacAddress,
    pub peer_uuid: DeviceUuid,
    pub error: Option<ErrorCode>,
    pub error_details: String,
}

impl Default for HubFunctionConnectionStatus {
    fn default() -> Self {
        HubFunctionConnectionStatus {
            state: ConnectionState::NotConnected,
            connect_timestamp: BacnetDateTime::unspecified(),
            disconnect_timestamp: BacnetDateTime::unspecified(),
            peer_address: HostNPort::None,
            peer_vmac: VmacAddress::UNSPECIFIED,
            peer_uuid: DeviceUuid::default(),
            error: None,
            error_details: String::new(),
        }
    }
}

impl fmt::Display for HubFunctionConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peer {} vmac {} uuid {}",
            self.state, self.peer_address, self.peer_vmac, self.peer_uuid
        )?;
        if let Some(error) = self.error {
            write!(f, " error {} '{}'", error, self.error_details)?;
        }
        Ok(())
    }
}

/// One entry of the SC_Direct_Connect_Connection_Status list
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DirectConnectionStatus {
    /// URI dialed for initiated connections; empty for accepted ones.
    pub uri: String,
    pub state: ConnectionState,
    pub connect_timestamp: BacnetDateTime,
    pub disconnect_timestamp: BacnetDateTime,
    pub peer_address: HostNPort,
    pub peer_vmac: VmacAddress,
    pub peer_uuid: DeviceUuid,
    pub error: Option<ErrorCode>,
    pub error_details: String,
}

impl Default for DirectConnectionStatus {
    fn default() -> Self {
        DirectConnectionStatus {
            uri: String::new(),
            state: ConnectionState::NotConnected,
            connect_timestamp: BacnetDateTime::unspecified(),
            disconnect_timestamp: BacnetDateTime::unspecified(),
            peer_address: HostNPort::None,
            peer_vmac: VmacAddress::UNSPECIFIED,
            peer_uuid: DeviceUuid::default(),
            error: None,
            error_details: String::new(),
        }
    }
}

impl fmt::Display for DirectConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uri '{}' peer {} vmac {} uuid {}",
            self.state, self.uri, self.peer_address, self.peer_vmac, self.peer_uuid
        )?;
        if let Some(error) = self.error {
            write!(f, " error {} '{}'", error, self.error_details)?;
        }
        Ok(())
    }
}

/// One entry of the SC_Failed_Connection_Requests list
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailedConnectionRequest {
    pub timestamp: BacnetDateTime,
    pub peer_address: HostNPort,
    pub peer_vmac: VmacAddress,
    pub peer_uuid: DeviceUuid,
    pub error: Option<ErrorCode>,
    pub error_details: String,
}

impl Default for FailedConnectionRequest {
    fn default() -> Self {
        FailedConnectionRequest {
            timestamp: BacnetDateTime::unspecified(),
            peer_address: HostNPort::None,
            peer_vmac: VmacAddress::UNSPECIFIED,
            peer_uuid: DeviceUuid::default(),
            error: None,
            error_details: String::new(),
        }
    }
}

impl fmt::Display for FailedConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peer {} vmac {} uuid {}",
            self.timestamp, self.peer_address, self.peer_vmac, self.peer_uuid
        )?;
        if let Some(error) = self.error {
            write!(f, " error {} '{}'", error, self.error_details)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BACnetHostNPort
// ---------------------------------------------------------------------------

fn encode_context_host_n_port(buffer: &mut Vec<u8>, tag: u8, value: &HostNPort) -> Result<()> {
    encode_opening_tag(buffer, tag)?;
    // host [0] BACnetHostAddress (CHOICE)
    encode_opening_tag(buffer, 0)?;
    match value {
        HostNPort::None => {
            // none [0] NULL
            encode_context_tag(buffer, 0, 0)?;
        }
        HostNPort::Ip(addr) => {
            // ip-address [1] OCTET STRING
            match addr.ip() {
                std::net::IpAddr::V4(ip) => {
                    encode_context_octet_string(buffer, 1, &ip.octets())?;
                }
                std::net::IpAddr::V6(ip) => {
                    encode_context_octet_string(buffer, 1, &ip.octets())?;
                }
            }
        }
        HostNPort::Domain(name, _) => {
            // name [2] CharacterString
            encode_context_character_string(buffer, 2, name)?;
        }
    }
    encode_closing_tag(buffer, 0)?;
    // port [1] Unsigned16
    encode_context_unsigned(buffer, 1, u32::from(value.port().unwrap_or(0)))?;
    encode_closing_tag(buffer, tag)?;
    Ok(())
}

fn decode_context_host_n_port(data: &[u8], tag: u8) -> Result<(HostNPort, usize)> {
    if !is_opening_tag(data, tag) {
        return Err(EncodingError::InvalidTag);
    }
    let mut pos = 1;
    if !is_opening_tag(&data[pos..], 0) {
        return Err(EncodingError::InvalidTag);
    }
    pos += 1;

    enum Host {
        None,
        Ip(Vec<u8>),
        Name(String),
    }
    let (choice_tag, _length, consumed) = decode_context_tag(&data[pos..])?;
    let host = match choice_tag {
        0 => {
            pos += consumed;
            Host::None
        }
        1 => {
            let (octets, used) = decode_context_octet_string(&data[pos..], 1)?;
            pos += used;
            Host::Ip(octets)
        }
        2 => {
            let (name, used) = decode_context_character_string(&data[pos..], 2)?;
            pos += used;
            Host::Name(name)
        }
        _ => return Err(EncodingError::InvalidTag),
    };
    if !is_closing_tag(&data[pos..], 0) {
        return Err(EncodingError::InvalidFormat("missing host closing tag".to_string()));
    }
    pos += 1;

    let (port, used) = decode_context_unsigned(&data[pos..], 1)?;
    pos += used;
    if port > u32::from(u16::MAX) {
        return Err(EncodingError::ValueOutOfRange);
    }
    if !is_closing_tag(&data[pos..], tag) {
        return Err(EncodingError::InvalidFormat("missing closing tag".to_string()));
    }
    pos += 1;

    let value = match host {
        Host::None => HostNPort::None,
        Host::Ip(octets) => {
            let ip: std::net::IpAddr = match octets.len() {
                4 => std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).into(),
                16 => {
                    let array: [u8; 16] = octets
                        .try_into()
                        .map_err(|_| EncodingError::InvalidLength)?;
                    std::net::Ipv6Addr::from(array).into()
                }
                _ => return Err(EncodingError::InvalidLength),
            };
            HostNPort::Ip(std::net::SocketAddr::new(ip, port as u16))
        }
        Host::Name(name) => HostNPort::Domain(name, port as u16),
    };
    Ok((value, pos))
}

fn encode_error_fields(
    buffer: &mut Vec<u8>,
    error_tag: u8,
    error: Option<ErrorCode>,
    details: &str,
) -> Result<()> {
    encode_context_enumerated(
        buffer,
        error_tag,
        u32::from(u16::from(error.unwrap_or(ErrorCode::Other))),
    )?;
    encode_context_character_string(buffer, error_tag + 1, details)?;
    Ok(())
}

fn decode_error_fields(data: &[u8], error_tag: u8) -> Result<(Option<ErrorCode>, String, usize)> {
    let mut pos = 0;
    let (raw, used) = decode_context_enumerated(&data[pos..], error_tag)?;
    pos += used;
    if raw > u32::from(u16::MAX) {
        return Err(EncodingError::ValueOutOfRange);
    }
    let mut details = String::new();
    if let Ok((s, used)) = decode_context_character_string(&data[pos..], error_tag + 1) {
        details = s;
        pos += used;
    }
    Ok((Some(ErrorCode::from(raw as u16)), details, pos))
}

fn decode_vmac(data: &[u8], tag: u8) -> Result<(VmacAddress, usize)> {
    let (octets, used) = decode_context_octet_string(data, tag)?;
    if octets.len() != VMAC_SIZE {
        return Err(EncodingError::InvalidLength);
    }
    Ok((
        VmacAddress::try_from(&octets[..]).map_err(|_| EncodingError::InvalidLength)?,
        used,
    ))
}

fn decode_uuid(data: &[u8], tag: u8) -> Result<(DeviceUuid, usize)> {
    let (octets, used) = decode_context_octet_string(data, tag)?;
    if octets.len() != UUID_SIZE {
        return Err(EncodingError::InvalidLength);
    }
    Ok((
        DeviceUuid::try_from(&octets[..]).map_err(|_| EncodingError::InvalidLength)?,
        used,
    ))
}

// ---------------------------------------------------------------------------
// BACnetSCHubConnection
// ---------------------------------------------------------------------------

/// Encode a BACnetSCHubConnection sequence.
pub fn encode_sc_hub_connection(buffer: &mut Vec<u8>, value: &HubConnectionStatus) -> Result<()> {
    encode_context_enumerated(buffer, 0, value.state as u32)?;
    encode_context_datetime(buffer, 1, &value.connect_timestamp)?;
    encode_context_datetime(buffer, 2, &value.disconnect_timestamp)?;
    if value.state.carries_error() {
        encode_error_fields(buffer, 3, value.error, &value.error_details)?;
    }
    Ok(())
}

/// Decode a BACnetSCHubConnection sequence, returning `(value, consumed)`.
pub fn decode_sc_hub_connection(data: &[u8]) -> Result<(HubConnectionStatus, usize)> {
    let mut pos = 0;
    let (state_raw, used) = decode_context_enumerated(&data[pos..], 0)?;
    pos += used;
    let state = ConnectionState::try_from(state_raw).map_err(|_| EncodingError::ValueOutOfRange)?;
    let (connect_timestamp, used) = decode_context_datetime(&data[pos..], 1)?;
    pos += used;
    let (disconnect_timestamp, used) = decode_context_datetime(&data[pos..], 2)?;
    pos += used;
    let (error, error_details) = if state.carries_error() {
        let (error, details, used) = decode_error_fields(&data[pos..], 3)?;
        pos += used;
        (error, details)
    } else {
        (None, String::new())
    };
    Ok((
        HubConnectionStatus {
            state,
            connect_timestamp,
            disconnect_timestamp,
            error,
            error_details,
        },
        pos,
    ))
}

/// Encode a BACnetSCHubConnection wrapped in an outer context tag.
pub fn encode_context_sc_hub_connection(
    buffer: &mut Vec<u8>,
    tag: u8,
    value: &HubConnectionStatus,
) -> Result<()> {
    encode_opening_tag(buffer, tag)?;
    encode_sc_hub_connection(buffer, value)?;
    encode_closing_tag(buffer, tag)?;
    Ok(())
}

/// Decode a context-wrapped BACnetSCHubConnection.
pub fn decode_context_sc_hub_connection(
    data: &[u8],
    tag: u8,
) -> Result<(HubConnectionStatus, usize)> {
    if !is_opening_tag(data, tag) {
        return Err(EncodingError::InvalidTag);
    }
    let (value, used) = decode_sc_hub_connection(&data[1..])?;
    let pos = 1 + used;
    if !is_closing_tag(&data[pos..], tag) {
        return Err(EncodingError::InvalidFormat("missing closing tag".to_string()));
    }
    Ok((value, pos + 1))
}

// ---------------------------------------------------------------------------
// BACnetSCHubFunctionConnection
// ---------------------------------------------------------------------------

/// Encode a BACnetSCHubFunctionConnection sequence.
pub fn encode_sc_hub_function_connection(
    buffer: &mut Vec<u8>,
    value: &HubFunctionConnectionStatus,
) -> Result<()> {
    encode_context_enumerated(buffer, 0, value.state as u32)?;
    encode_context_datetime(buffer, 1, &value.connect_timestamp)?;
    encode_context_datetime(buffer, 2, &value.disconnect_timestamp)?;
    encode_context_host_n_port(buffer, 3, &value.peer_address)?;
    encode_context_octet_string(buffer, 4, value.peer_vmac.as_bytes())?;
    encode_context_octet_string(buffer, 5, value.peer_uuid.as_bytes())?;
    if value.state.carries_error() {
        encode_error_fields(buffer, 6, value.error, &value.error_details)?;
    }
    Ok(())
}

/// Decode a BACnetSCHubFunctionConnection sequence.
pub fn decode_sc_hub_function_connection(
    data: &[u8],
) -> Result<(HubFunctionConnectionStatus, usize)> {
    let mut pos = 0;
    let (state_raw, used) = decode_context_enumerated(&data[pos..], 0)?;
    pos += used;
    let state = ConnectionState::try_from(state_raw).map_err(|_| EncodingError::ValueOutOfRange)?;
    let (connect_timestamp, used) = decode_context_datetime(&data[pos..], 1)?;
    pos += used;
    let (disconnect_timestamp, used) = decode_context_datetime(&data[pos..], 2)?;
    pos += used;
    let (peer_address, used) = decode_context_host_n_port(&data[pos..], 3)?;
    pos += used;
    let (peer_vmac, used) = decode_vmac(&data[pos..], 4)?;
    pos += used;
    let (peer_uuid, used) = decode_uuid(&data[pos..], 5)?;
    pos += used;
    let (error, error_details) = if state.carries_error() {
        let (error, details, used) = decode_error_fields(&data[pos..], 6)?;
        pos += used;
        (error, details)
    } else {
        (None, String::new())
    };
    Ok((
        HubFunctionConnectionStatus {
            state,
            connect_timestamp,
            disconnect_timestamp,
            peer_address,
            peer_vmac,
            peer_uuid,
            error,
            error_details,
        },
        pos,
    ))
}

/// Encode a BACnetSCHubFunctionConnection wrapped in an outer context tag.
pub fn encode_context_sc_hub_function_connection(
    buffer: &mut Vec<u8>,
    tag: u8,
    value: &HubFunctionConnectionStatus,
) -> Result<()> {
    encode_opening_tag(buffer, tag)?;
    encode_sc_hub_function_connection(buffer, value)?;
    encode_closing_tag(buffer, tag)?;
    Ok(())
}

/// Decode a context-wrapped BACnetSCHubFunctionConnection.
pub fn decode_context_sc_hub_function_connection(
    data: &[u8],
    tag: u8,
) -> Result<(HubFunctionConnectionStatus, usize)> {
    if !is_opening_tag(data, tag) {
        return Err(EncodingError::InvalidTag);
    }
    let (value, used) = decode_sc_hub_function_connection(&data[1..])?;
    let pos = 1 + used;
    if !is_closing_tag(&data[pos..], tag) {
        return Err(EncodingError::InvalidFormat("missing closing tag".to_string()));
    }
    Ok((value, pos + 1))
}

// ---------------------------------------------------------------------------
// BACnetSCDirectConnection
// ---------------------------------------------------------------------------

/// Encode a BACnetSCDirectConnection sequence.
pub fn encode_sc_direct_connection(
    buffer: &mut Vec<u8>,
    value: &DirectConnectionStatus,
) -> Result<()> {
    encode_context_character_string(buffer, 0, &value.uri)?;
    encode_context_enumerated(buffer, 1, value.state as u32)?;
    encode_context_datetime(buffer, 2, &value.connect_timestamp)?;
    encode_context_datetime(buffer, 3, &value.disconnect_timestamp)?;
    encode_context_host_n_port(buffer, 4, &value.peer_address)?;
    encode_context_octet_string(buffer, 5, value.peer_vmac.as_bytes())?;
    encode_context_octet_string(buffer, 6, value.peer_uuid.as_bytes())?;
    if value.state.carries_error() {
        encode_error_fields(buffer, 7, value.error, &value.error_details)?;
    }
    Ok(())
}

/// Decode a BACnetSCDirectConnection sequence.
pub fn decode_sc_direct_connection(data: &[u8]) -> Result<(DirectConnectionStatus, usize)> {
    let mut pos = 0;
    let (uri, used) = decode_context_character_string(&data[pos..], 0)?;
    pos += used;
    let (state_raw, used) = decode_context_enumerated(&data[pos..], 1)?;
    pos += used;
    let state = ConnectionState::try_from(state_raw).map_err(|_| EncodingError::ValueOutOfRange)?;
    let (connect_timestamp, used) = decode_context_datetime(&data[pos..], 2)?;
    pos += used;
    let (disconnect_timestamp, used) = decode_context_datetime(&data[pos..], 3)?;
    pos += used;
    let (peer_address, used) = decode_context_host_n_port(&data[pos..], 4)?;
    pos += used;
    let (peer_vmac, used) = decode_vmac(&data[pos..], 5)?;
    pos += used;
    let (peer_uuid, used) = decode_uuid(&data[pos..], 6)?;
    pos += used;
    let (error, error_details) = if state.carries_error() {
        let (error, details, used) = decode_error_fields(&data[pos..], 7)?;
        pos += used;
        (error, details)
    } else {
        (None, String::new())
    };
    Ok((
        DirectConnectionStatus {
            uri,
            state,
            connect_timestamp,
            disconnect_timestamp,
            peer_address,
            peer_vmac,
            peer_uuid,
            error,
            error_details,
        },
        pos,
    ))
}

/// Encode a BACnetSCDirectConnection wrapped in an outer context tag.
pub fn encode_context_sc_direct_connection(
    buffer: &mut Vec<u8>,
    tag: u8,
    value: &DirectConnectionStatus,
) -> Result<()> {
    encode_opening_tag(buffer, tag)?;
    encode_sc_direct_connection(buffer, value)?;
    encode_closing_tag(buffer, tag)?;
    Ok(())
}

/// Decode a context-wrapped BACnetSCDirectConnection.
pub fn decode_context_sc_direct_connection(
    data: &[u8],
    tag: u8,
) -> Result<(DirectConnectionStatus, usize)> {
    if !is_opening_tag(data, tag) {
        return Err(EncodingError::InvalidTag);
    }
    let (value, used) = decode_sc_direct_connection(&data[1..])?;
    let pos = 1 + used;
    if !is_closing_tag(&data[pos..], tag) {
        return Err(EncodingError::InvalidFormat("missing closing tag".to_string()));
    }
    Ok((value, pos + 1))
}

// ---------------------------------------------------------------------------
// BACnetSCFailedConnectionRequest
// ---------------------------------------------------------------------------

/// Encode a BACnetSCFailedConnectionRequest sequence.
pub fn encode_sc_failed_connection_request(
    buffer: &mut Vec<u8>,
    value: &FailedConnectionRequest,
) -> Result<()> {
    encode_context_datetime(buffer, 0, &value.timestamp)?;
    encode_context_host_n_port(buffer, 1, &value.peer_address)?;
    encode_context_octet_string(buffer, 2, value.peer_vmac.as_bytes())?;
    encode_context_octet_string(buffer, 3, value.peer_uuid.as_bytes())?;
    if value.error.is_some() {
        encode_error_fields(buffer, 4, value.error, &value.error_details)?;
    }
    Ok(())
}

/// Decode a BACnetSCFailedConnectionRequest sequence.
pub fn decode_sc_failed_connection_request(
    data: &[u8],
) -> Result<(FailedConnectionRequest, usize)> {
    let mut pos = 0;
    let (timestamp, used) = decode_context_datetime(&data[pos..], 0)?;
    pos += used;
    let (peer_address, used) = decode_context_host_n_port(&data[pos..], 1)?;
    pos += used;
    let (peer_vmac, used) = decode_vmac(&data[pos..], 2)?;
    pos += used;
    let (peer_uuid, used) = decode_uuid(&data[pos..], 3)?;
    pos += used;
    let (error, error_details) = match decode_error_fields(&data[pos..], 4) {
        Ok((error, details, used)) => {
            pos += used;
            (error, details)
        }
        Err(_) => (None, String::new()),
    };
    Ok((
        FailedConnectionRequest {
            timestamp,
            peer_address,
            peer_vmac,
            peer_uuid,
            error,
            error_details,
        },
        pos,
    ))
}

/// Encode a BACnetSCFailedConnectionRequest wrapped in an outer context tag.
pub fn encode_context_sc_failed_connection_request(
    buffer: &mut Vec<u8>,
    tag: u8,
    value: &FailedConnectionRequest,
) -> Result<()> {
    encode_opening_tag(buffer, tag)?;
    encode_sc_failed_connection_request(buffer, value)?;
    encode_closing_tag(buffer, tag)?;
    Ok(())
}

/// Decode a context-wrapped BACnetSCFailedConnectionRequest.
pub fn decode_context_sc_failed_connection_request(
    data: &[u8],
    tag: u8,
) -> Result<(FailedConnectionRequest, usize)> {
    if !is_opening_tag(data, tag) {
        return Err(EncodingError::InvalidTag);
    }
    let (value, used) = decode_sc_failed_connection_request(&data[1..])?;
    let pos = 1 + used;
    if !is_closing_tag(&data[pos..], tag) {
        return Err(EncodingError::InvalidFormat("missing closing tag".to_string()));
    }
    Ok((value, pos + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{BacnetDate, BacnetTime};

    fn stamp() -> BacnetDateTime {
        BacnetDateTime {
            date: BacnetDate {
                year: 124,
                month: 7,
                day: 15,
                weekday: 1,
            },
            time: BacnetTime {
                hour: 10,
                minute: 30,
                second: 0,
                hundredths: 0,
            },
        }
    }

    fn vmac() -> VmacAddress {
        VmacAddress::from([0x02, 1, 2, 3, 4, 5])
    }

    fn uuid() -> DeviceUuid {
        DeviceUuid::new([9; 16])
    }

    #[test]
    fn test_hub_connection_roundtrip_without_error() {
        let value = HubConnectionStatus {
            state: ConnectionState::Connected,
            connect_timestamp: stamp(),
            disconnect_timestamp: BacnetDateTime::unspecified(),
            error: None,
            error_details: String::new(),
        };
        let mut buffer = Vec::new();
        encode_sc_hub_connection(&mut buffer, &value).unwrap();
        let (decoded, consumed) = decode_sc_hub_connection(&buffer).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_hub_connection_roundtrip_with_error() {
        let value = HubConnectionStatus {
            state: ConnectionState::FailedToConnect,
            connect_timestamp: stamp(),
            disconnect_timestamp: stamp(),
            error: Some(ErrorCode::TcpConnectionRefused),
            error_details: "connection refused".to_string(),
        };
        let mut buffer = Vec::new();
        encode_context_sc_hub_connection(&mut buffer, 2, &value).unwrap();
        let (decoded, consumed) = decode_context_sc_hub_connection(&buffer, 2).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_hub_function_connection_roundtrip() {
        let value = HubFunctionConnectionStatus {
            state: ConnectionState::Connected,
            connect_timestamp: stamp(),
            disconnect_timestamp: BacnetDateTime::unspecified(),
            peer_address: HostNPort::Ip("192.168.1.20:47808".parse().unwrap()),
            peer_vmac: vmac(),
            peer_uuid: uuid(),
            error: None,
            error_details: String::new(),
        };
        let mut buffer = Vec::new();
        encode_sc_hub_function_connection(&mut buffer, &value).unwrap();
        let (decoded, consumed) = decode_sc_hub_function_connection(&buffer).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_direct_connection_roundtrip() {
        let value = DirectConnectionStatus {
            uri: "wss://b.example:4443/".to_string(),
            state: ConnectionState::DisconnectedWithErrors,
            connect_timestamp: stamp(),
            disconnect_timestamp: stamp(),
            peer_address: HostNPort::Domain("b.example".to_string(), 4443),
            peer_vmac: vmac(),
            peer_uuid: uuid(),
            error: Some(ErrorCode::WebsocketError),
            error_details: "reset".to_string(),
        };
        let mut buffer = Vec::new();
        encode_context_sc_direct_connection(&mut buffer, 0, &value).unwrap();
        let (decoded, consumed) = decode_context_sc_direct_connection(&buffer, 0).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_failed_connection_request_roundtrip() {
        let value = FailedConnectionRequest {
            timestamp: stamp(),
            peer_address: HostNPort::Ip("10.0.0.9:4443".parse().unwrap()),
            peer_vmac: vmac(),
            peer_uuid: uuid(),
            error: Some(ErrorCode::NodeDuplicateVmac),
            error_details: "duplicate vmac".to_string(),
        };
        let mut buffer = Vec::new();
        encode_sc_failed_connection_request(&mut buffer, &value).unwrap();
        let (decoded, consumed) = decode_sc_failed_connection_request(&buffer).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());

        let mut wrapped = Vec::new();
        encode_context_sc_failed_connection_request(&mut wrapped, 1, &value).unwrap();
        let (decoded, consumed) = decode_context_sc_failed_connection_request(&wrapped, 1).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, wrapped.len());
    }

    #[test]
    fn test_failed_connection_request_without_error() {
        let value = FailedConnectionRequest {
            timestamp: stamp(),
            peer_address: HostNPort::None,
            peer_vmac: vmac(),
            peer_uuid: uuid(),
            error: None,
            error_details: String::new(),
        };
        let mut buffer = Vec::new();
        encode_sc_failed_connection_request(&mut buffer, &value).unwrap();
        let (decoded, _) = decode_sc_failed_connection_request(&buffer).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_host_n_port_variants() {
        for value in [
            HostNPort::None,
            HostNPort::Ip("10.1.2.3:47808".parse().unwrap()),
            HostNPort::Ip("[2001:db8::1]:4443".parse().unwrap()),
            HostNPort::Domain("hub.example.org".to_string(), 443),
        ] {
            let mut buffer = Vec::new();
            encode_context_host_n_port(&mut buffer, 3, &value).unwrap();
            let (decoded, consumed) = decode_context_host_n_port(&buffer, 3).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buffer.len());
        }
    }

    #[test]
    fn test_display_renders_fields() {
        let value = DirectConnectionStatus {
            uri: "wss://b.example:4443/".to_string(),
            state: ConnectionState::Connected,
            ..Default::default()
        };
        let rendered = value.to_string();
        assert!(rendered.contains("connected"));
        assert!(rendered.contains("wss://b.example:4443/"));
    }
}
