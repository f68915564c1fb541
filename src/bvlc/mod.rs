//! BVLC/SC message encoding and decoding
//!
//! This module implements the BACnet/SC virtual link layer messages of
//! AB.2: a stateless, byte-exact encoder/decoder for the 13 message types
//! and their header options.
//!
//! # Frame layout
//!
//! ```text
//! function(1) | control(1) | message-id(2)
//!   | [originating VMAC(6)] | [destination VMAC(6)]
//!   | [destination options...] | [data options...] | payload
//! ```
//!
//! Control flags (AB.2.2) announce which optional fields are present.
//! Each header option is a TLV whose marker octet carries more-follows,
//! must-understand and has-data bits plus a 5-bit option type (AB.2.3).
//!
//! # Error reporting
//!
//! [`decode_message`] classifies failures into a BACnet error class, error
//! code and an optional detail string; the caller decides whether the
//! failure warrants a BVLC-Result NAK. A frame shorter than four octets is
//! reported with [`ErrorCode::Other`] and, per EA-001-4, must be discarded
//! without a NAK — [`DecodeError::is_short_frame`] identifies that case.
//!
//! # Examples
//!
//! ```
//! use bacnet_sc::bvlc::{encode_heartbeat_request, decode_message, BvlcFunction, Payload};
//!
//! let frame = encode_heartbeat_request(0x1234);
//! let decoded = decode_message(&frame).unwrap();
//! assert_eq!(decoded.header.function, BvlcFunction::HeartbeatRequest);
//! assert_eq!(decoded.header.message_id, 0x1234);
//! assert!(matches!(decoded.payload, Payload::HeartbeatRequest));
//! ```

use std::error::Error;
use std::fmt;

use bitflags::bitflags;

use crate::util::{DeviceUuid, VmacAddress};
use crate::vendor_range_enum;
use crate::{BSC_PRE, HEADER_OPTION_MAX, UUID_SIZE, VMAC_SIZE};

/// Result type for BVLC/SC decoding
pub type Result<T> = std::result::Result<T, DecodeError>;

/// BVLC/SC message types (AB.2, BACnet/SC Virtual Link Layer Messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BvlcFunction {
    /// BVLC-Result
    Result = 0x00,
    /// Encapsulated-NPDU
    EncapsulatedNpdu = 0x01,
    /// Address-Resolution
    AddressResolution = 0x02,
    /// Address-Resolution-ACK
    AddressResolutionAck = 0x03,
    /// Advertisement
    Advertisement = 0x04,
    /// Advertisement-Solicitation
    AdvertisementSolicitation = 0x05,
    /// Connect-Request
    ConnectRequest = 0x06,
    /// Connect-Accept
    ConnectAccept = 0x07,
    /// Disconnect-Request
    DisconnectRequest = 0x08,
    /// Disconnect-ACK
    DisconnectAck = 0x09,
    /// Heartbeat-Request
    HeartbeatRequest = 0x0A,
    /// Heartbeat-ACK
    HeartbeatAck = 0x0B,
    /// Proprietary-Message
    ProprietaryMessage = 0x0C,
}

impl TryFrom<u8> for BvlcFunction {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(BvlcFunction::Result),
            0x01 => Ok(BvlcFunction::EncapsulatedNpdu),
            0x02 => Ok(BvlcFunction::AddressResolution),
            0x03 => Ok(BvlcFunction::AddressResolutionAck),
            0x04 => Ok(BvlcFunction::Advertisement),
            0x05 => Ok(BvlcFunction::AdvertisementSolicitation),
            0x06 => Ok(BvlcFunction::ConnectRequest),
            0x07 => Ok(BvlcFunction::ConnectAccept),
            0x08 => Ok(BvlcFunction::DisconnectRequest),
            0x09 => Ok(BvlcFunction::DisconnectAck),
            0x0A => Ok(BvlcFunction::HeartbeatRequest),
            0x0B => Ok(BvlcFunction::HeartbeatAck),
            0x0C => Ok(BvlcFunction::ProprietaryMessage),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Control flags of the BVLC/SC header (AB.2.2). Reserved upper bits
    /// must be zero on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        const DATA_OPTIONS = 1 << 0;
        const DEST_OPTIONS = 1 << 1;
        const DEST_VADDR = 1 << 2;
        const ORIG_VADDR = 1 << 3;
    }
}

bitflags! {
    /// Header option marker bits (AB.2.3). The low five bits carry the
    /// option type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionMarker: u8 {
        const HAS_DATA = 1 << 5;
        const MUST_UNDERSTAND = 1 << 6;
        const MORE_FOLLOWS = 1 << 7;
    }
}

/// Mask extracting the option type from a header option marker octet.
pub const OPTION_TYPE_MASK: u8 = 0x1F;

/// Header option type: Secure-Path (AB.2.3.1)
pub const OPTION_TYPE_SECURE_PATH: u8 = 1;
/// Header option type: Proprietary (AB.2.3.2)
pub const OPTION_TYPE_PROPRIETARY: u8 = 31;

vendor_range_enum! {
    /// BACnet error class carried in BVLC-Result NAK messages.
    ErrorClass {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    },
    u16,
    64..=65535
}

vendor_range_enum! {
    /// BACnet error codes used by the secure-connect datalink. The set is
    /// the SC-relevant subset of the BACnet error-code enumeration;
    /// vendor-proprietary values occupy 256 and up.
    ErrorCode {
        Other = 0,
        Timeout = 30,
        OptionalFunctionalityNotSupported = 45,
        ParameterOutOfRange = 80,
        OutOfMemory = 81,
        Success = 84,
        AddressingError = 115,
        BvlcFunctionUnknown = 143,
        BvlcProprietaryFunctionUnknown = 144,
        HeaderEncodingError = 145,
        HeaderNotUnderstood = 146,
        HttpError = 147,
        HttpNoUpgrade = 148,
        HttpResourceNotLocal = 149,
        HttpProxyAuthenticationFailed = 150,
        HttpResponseTimeout = 151,
        HttpResponseSyntaxError = 152,
        HttpResponseValueError = 153,
        HttpResponseMissingHeader = 154,
        HttpWebsocketHeaderError = 155,
        HttpUpgradeRequired = 156,
        HttpUpgradeError = 157,
        HttpTemporaryUnavailable = 158,
        HttpNotAServer = 159,
        MessageIncomplete = 160,
        NodeDuplicateVmac = 161,
        NotABacnetScHub = 162,
        PayloadExpected = 163,
        UnexpectedData = 164,
        TcpClosedByLocal = 165,
        TcpClosedOther = 166,
        TcpConnectTimeout = 167,
        TcpConnectionRefused = 168,
        TlsClientAuthenticationFailed = 169,
        TlsClientCertificateError = 170,
        TlsClientCertificateExpired = 171,
        TlsClientCertificateRevoked = 172,
        TlsError = 173,
        TlsServerAuthenticationFailed = 174,
        TlsServerCertificateError = 175,
        TlsServerCertificateExpired = 176,
        TlsServerCertificateRevoked = 177,
        WebsocketCloseError = 178,
        WebsocketClosedAbnormally = 179,
        WebsocketClosedByPeer = 180,
        WebsocketDataAgainstSpec = 181,
        WebsocketDataInconsistent = 182,
        WebsocketDataNotAccepted = 183,
        WebsocketError = 184,
        WebsocketFrameTooLong = 185,
        WebsocketProtocolError = 186,
        WebsocketSchemeNotSupported = 187,
    },
    u16,
    256..=65535
}

/// Hub connector state advertised in Advertisement messages and mirrored
/// by the `SC_Hub_Connector_State` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum HubConnectorState {
    /// No hub connection established.
    NoHubConnection = 0,
    /// Connected to the primary hub.
    ConnectedToPrimary = 1,
    /// Connected to the failover hub.
    ConnectedToFailover = 2,
}

impl TryFrom<u8> for HubConnectorState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(HubConnectorState::NoHubConnection),
            1 => Ok(HubConnectorState::ConnectedToPrimary),
            2 => Ok(HubConnectorState::ConnectedToFailover),
            other => Err(other),
        }
    }
}

/// Direct-connection acceptance advertised in Advertisement messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirectConnectionSupport {
    /// The node does not accept direct connections.
    Unsupported = 0,
    /// The node accepts direct connections.
    Supported = 1,
}

/// A decoded header option TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOption {
    /// The raw marker octet as it appeared on the wire (more-follows bit
    /// included); echoed as the 'Error Header Marker' in NAKs.
    pub marker: u8,
    /// Must-understand bit from the marker.
    pub must_understand: bool,
    /// The option content.
    pub data: HeaderOptionData,
}

/// Header option content by option type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOptionData {
    /// Secure-Path option; carries no data.
    SecurePath,
    /// Proprietary option: vendor id, vendor-defined option type and bytes.
    Proprietary {
        vendor_id: u16,
        option_type: u8,
        data: Vec<u8>,
    },
    /// Unknown option type, kept for must-understand screening.
    Unknown { option_type: u8, data: Vec<u8> },
}

impl HeaderOption {
    /// Build a Secure-Path option.
    pub fn secure_path(must_understand: bool) -> Self {
        let mut marker = OPTION_TYPE_SECURE_PATH;
        if must_understand {
            marker |= OptionMarker::MUST_UNDERSTAND.bits();
        }
        HeaderOption {
            marker,
            must_understand,
            data: HeaderOptionData::SecurePath,
        }
    }

    /// Build a proprietary option.
    pub fn proprietary(must_understand: bool, vendor_id: u16, option_type: u8, data: Vec<u8>) -> Self {
        let mut marker = OPTION_TYPE_PROPRIETARY | OptionMarker::HAS_DATA.bits();
        if must_understand {
            marker |= OptionMarker::MUST_UNDERSTAND.bits();
        }
        HeaderOption {
            marker,
            must_understand,
            data: HeaderOptionData::Proprietary {
                vendor_id,
                option_type,
                data,
            },
        }
    }

    /// Packed wire form of this option; `more_follows` controls the
    /// continuation bit.
    fn pack(&self, more_follows: bool) -> Vec<u8> {
        let mut marker = self.marker & !OptionMarker::MORE_FOLLOWS.bits();
        if more_follows {
            marker |= OptionMarker::MORE_FOLLOWS.bits();
        }
        let mut out = vec![marker];
        match &self.data {
            HeaderOptionData::SecurePath => {}
            HeaderOptionData::Proprietary {
                vendor_id,
                option_type,
                data,
            } => {
                let len = (data.len() + 3) as u16;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&vendor_id.to_be_bytes());
                out.push(*option_type);
                out.extend_from_slice(data);
            }
            HeaderOptionData::Unknown { data, .. } => {
                if marker & OptionMarker::HAS_DATA.bits() != 0 {
                    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }
}

/// A BVLC-Result payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPayload {
    /// The BVLC function the result refers to.
    pub function: BvlcFunction,
    /// 0 = ACK, 1 = NAK.
    pub result_code: u8,
    /// Error information, present exactly when `result_code` is 1.
    pub error: Option<ResultError>,
}

/// Error fields of a BVLC-Result NAK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultError {
    /// Header marker of the offending option, zero when not applicable.
    pub header_marker: u8,
    pub class: ErrorClass,
    pub code: ErrorCode,
    /// UTF-8 error details, no terminator, possibly empty.
    pub details: String,
}

impl ResultPayload {
    /// True if this result is a negative acknowledgement.
    pub fn is_nak(&self) -> bool {
        self.result_code != 0
    }
}

/// Decoded message payload, by BVLC function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Result(ResultPayload),
    EncapsulatedNpdu(Vec<u8>),
    AddressResolution,
    /// Space-separated UTF-8 WebSocket URI list, no terminator.
    AddressResolutionAck(String),
    Advertisement {
        hub_status: HubConnectorState,
        support: DirectConnectionSupport,
        max_bvlc_len: u16,
        max_npdu_len: u16,
    },
    AdvertisementSolicitation,
    ConnectRequest {
        vmac: VmacAddress,
        uuid: DeviceUuid,
        max_bvlc_len: u16,
        max_npdu_len: u16,
    },
    ConnectAccept {
        vmac: VmacAddress,
        uuid: DeviceUuid,
        max_bvlc_len: u16,
        max_npdu_len: u16,
    },
    DisconnectRequest,
    DisconnectAck,
    HeartbeatRequest,
    HeartbeatAck,
    Proprietary {
        vendor_id: u16,
        function: u8,
        data: Vec<u8>,
    },
}

/// Decoded fixed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    pub function: BvlcFunction,
    pub message_id: u16,
    pub origin: Option<VmacAddress>,
    pub dest: Option<VmacAddress>,
    pub dest_options: Vec<HeaderOption>,
    pub data_options: Vec<HeaderOption>,
}

/// A fully decoded BVLC/SC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub header: DecodedHeader,
    pub payload: Payload,
}

impl DecodedMessage {
    /// True if a decode failure or framing violation on this message may
    /// be answered with a BVLC-Result NAK: never for broadcast messages
    /// and never for BVLC-Result itself (no meta-NAKs).
    pub fn need_send_bvlc_result(&self) -> bool {
        if self.header.function == BvlcFunction::Result {
            return false;
        }
        !self.header.dest.map_or(false, |d| d.is_broadcast())
    }
}

/// Decode failure: BACnet error class/code plus an optional detail string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub details: Option<&'static str>,
}

impl DecodeError {
    fn new(class: ErrorClass, code: ErrorCode, details: &'static str) -> Self {
        DecodeError {
            class,
            code,
            details: Some(details),
        }
    }

    /// True for frames shorter than four octets, which are discarded
    /// without a NAK (EA-001-4).
    pub fn is_short_frame(&self) -> bool {
        self.code == ErrorCode::Other
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BVLC decode error: class {}, code {}", self.class, self.code)?;
        if let Some(details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl Error for DecodeError {}

fn header_error(details: &'static str) -> DecodeError {
    DecodeError::new(ErrorClass::Communication, ErrorCode::HeaderEncodingError, details)
}

fn incomplete(details: &'static str) -> DecodeError {
    DecodeError::new(ErrorClass::Communication, ErrorCode::MessageIncomplete, details)
}

fn unexpected(details: &'static str) -> DecodeError {
    DecodeError::new(ErrorClass::Communication, ErrorCode::UnexpectedData, details)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn encode_header(
    function: BvlcFunction,
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
) -> Vec<u8> {
    let mut flags = ControlFlags::empty();
    if origin.is_some() {
        flags |= ControlFlags::ORIG_VADDR;
    }
    if dest.is_some() {
        flags |= ControlFlags::DEST_VADDR;
    }
    let mut out = Vec::with_capacity(BSC_PRE + 16);
    out.push(function as u8);
    out.push(flags.bits());
    out.extend_from_slice(&message_id.to_be_bytes());
    if let Some(origin) = origin {
        out.extend_from_slice(origin.as_bytes());
    }
    if let Some(dest) = dest {
        out.extend_from_slice(dest.as_bytes());
    }
    out
}

/// Encode a BVLC-Result ACK for `function`.
pub fn encode_result_ack(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
    function: BvlcFunction,
) -> Vec<u8> {
    let mut out = encode_header(BvlcFunction::Result, message_id, origin, dest);
    out.push(function as u8);
    out.push(0);
    out
}

/// Encode a BVLC-Result NAK for `function`. The error class and code are
/// mandatory; `header_marker` is zero when no header option is at fault.
pub fn encode_result_nak(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
    function: BvlcFunction,
    header_marker: Option<u8>,
    class: ErrorClass,
    code: ErrorCode,
    details: Option<&str>,
) -> Vec<u8> {
    let mut out = encode_header(BvlcFunction::Result, message_id, origin, dest);
    out.push(function as u8);
    out.push(1);
    out.push(header_marker.unwrap_or(0));
    out.extend_from_slice(&u16::from(class).to_be_bytes());
    out.extend_from_slice(&u16::from(code).to_be_bytes());
    if let Some(details) = details {
        out.extend_from_slice(details.as_bytes());
    }
    out
}

/// Encode an Encapsulated-NPDU carrying `npdu`.
pub fn encode_encapsulated_npdu(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
    npdu: &[u8],
) -> Vec<u8> {
    let mut out = encode_header(BvlcFunction::EncapsulatedNpdu, message_id, origin, dest);
    out.extend_from_slice(npdu);
    out
}

/// Encode an Address-Resolution message.
pub fn encode_address_resolution(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
) -> Vec<u8> {
    encode_header(BvlcFunction::AddressResolution, message_id, origin, dest)
}

/// Encode an Address-Resolution-ACK. `uris` is the space-separated UTF-8
/// WebSocket URI list, written without a terminator.
pub fn encode_address_resolution_ack(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
    uris: &str,
) -> Vec<u8> {
    let mut out = encode_header(BvlcFunction::AddressResolutionAck, message_id, origin, dest);
    out.extend_from_slice(uris.as_bytes());
    out
}

/// Encode an Advertisement message.
pub fn encode_advertisement(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
    hub_status: HubConnectorState,
    support: DirectConnectionSupport,
    max_bvlc_len: u16,
    max_npdu_len: u16,
) -> Vec<u8> {
    let mut out = encode_header(BvlcFunction::Advertisement, message_id, origin, dest);
    out.push(hub_status as u8);
    out.push(support as u8);
    out.extend_from_slice(&max_bvlc_len.to_be_bytes());
    out.extend_from_slice(&max_npdu_len.to_be_bytes());
    out
}

/// Encode an Advertisement-Solicitation message.
pub fn encode_advertisement_solicitation(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
) -> Vec<u8> {
    encode_header(BvlcFunction::AdvertisementSolicitation, message_id, origin, dest)
}

fn encode_connect_payload(
    mut out: Vec<u8>,
    vmac: &VmacAddress,
    uuid: &DeviceUuid,
    max_bvlc_len: u16,
    max_npdu_len: u16,
) -> Vec<u8> {
    out.extend_from_slice(vmac.as_bytes());
    out.extend_from_slice(uuid.as_bytes());
    out.extend_from_slice(&max_bvlc_len.to_be_bytes());
    out.extend_from_slice(&max_npdu_len.to_be_bytes());
    out
}

/// Encode a Connect-Request carrying the local identity and caps.
pub fn encode_connect_request(
    message_id: u16,
    vmac: &VmacAddress,
    uuid: &DeviceUuid,
    max_bvlc_len: u16,
    max_npdu_len: u16,
) -> Vec<u8> {
    let out = encode_header(BvlcFunction::ConnectRequest, message_id, None, None);
    encode_connect_payload(out, vmac, uuid, max_bvlc_len, max_npdu_len)
}

/// Encode a Connect-Accept carrying the local identity and caps.
pub fn encode_connect_accept(
    message_id: u16,
    vmac: &VmacAddress,
    uuid: &DeviceUuid,
    max_bvlc_len: u16,
    max_npdu_len: u16,
) -> Vec<u8> {
    let out = encode_header(BvlcFunction::ConnectAccept, message_id, None, None);
    encode_connect_payload(out, vmac, uuid, max_bvlc_len, max_npdu_len)
}

/// Encode a Disconnect-Request.
pub fn encode_disconnect_request(message_id: u16) -> Vec<u8> {
    encode_header(BvlcFunction::DisconnectRequest, message_id, None, None)
}

/// Encode a Disconnect-ACK.
pub fn encode_disconnect_ack(message_id: u16) -> Vec<u8> {
    encode_header(BvlcFunction::DisconnectAck, message_id, None, None)
}

/// Encode a Heartbeat-Request.
pub fn encode_heartbeat_request(message_id: u16) -> Vec<u8> {
    encode_header(BvlcFunction::HeartbeatRequest, message_id, None, None)
}

/// Encode a Heartbeat-ACK.
pub fn encode_heartbeat_ack(message_id: u16) -> Vec<u8> {
    encode_header(BvlcFunction::HeartbeatAck, message_id, None, None)
}

/// Encode a Proprietary-Message.
pub fn encode_proprietary_message(
    message_id: u16,
    origin: Option<&VmacAddress>,
    dest: Option<&VmacAddress>,
    vendor_id: u16,
    function: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut out = encode_header(BvlcFunction::ProprietaryMessage, message_id, origin, dest);
    out.extend_from_slice(&vendor_id.to_be_bytes());
    out.push(function);
    out.extend_from_slice(data);
    out
}

// ---------------------------------------------------------------------------
// Header option manipulation on packed frames
// ---------------------------------------------------------------------------

/// Byte offset just past the fixed header and any VMAC fields.
fn vmac_fields_end(pdu: &[u8]) -> usize {
    let flags = ControlFlags::from_bits_truncate(pdu[1]);
    let mut offset = 4;
    if flags.contains(ControlFlags::ORIG_VADDR) {
        offset += VMAC_SIZE;
    }
    if flags.contains(ControlFlags::DEST_VADDR) {
        offset += VMAC_SIZE;
    }
    offset
}

/// Length in bytes of the packed option list starting at `data`, or an
/// error if it is malformed or runs past the buffer.
fn packed_options_len(data: &[u8]) -> Result<usize> {
    let mut pos = 0;
    loop {
        if pos >= data.len() {
            return Err(incomplete("header option list is truncated"));
        }
        let marker = data[pos];
        pos += 1;
        if marker & OptionMarker::HAS_DATA.bits() != 0 {
            if data.len() < pos + 2 {
                return Err(incomplete("header option length is truncated"));
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if data.len() < pos + len {
                return Err(incomplete("header option data is truncated"));
            }
            pos += len;
        }
        if marker & OptionMarker::MORE_FOLLOWS.bits() == 0 {
            return Ok(pos);
        }
    }
}

fn add_option(pdu: &mut Vec<u8>, option: &HeaderOption, list_flag: ControlFlags) -> Result<()> {
    if pdu.len() < 4 {
        return Err(DecodeError::new(
            ErrorClass::Communication,
            ErrorCode::Other,
            "message is shorter than four octets",
        ));
    }
    let flags = ControlFlags::from_bits_truncate(pdu[1]);
    let mut insert_at = vmac_fields_end(pdu);
    if list_flag == ControlFlags::DATA_OPTIONS && flags.contains(ControlFlags::DEST_OPTIONS) {
        insert_at += packed_options_len(&pdu[insert_at..])?;
    }
    let list_present = flags.contains(list_flag);
    let packed = option.pack(list_present);
    pdu.splice(insert_at..insert_at, packed);
    pdu[1] = (flags | list_flag).bits();
    Ok(())
}

/// Insert `option` at the head of the destination options list of a
/// packed frame, setting the control flag and continuation bits.
pub fn add_destination_option(pdu: &mut Vec<u8>, option: &HeaderOption) -> Result<()> {
    add_option(pdu, option, ControlFlags::DEST_OPTIONS)
}

/// Insert `option` at the head of the data options list of a packed
/// frame, setting the control flag and continuation bits.
pub fn add_data_option(pdu: &mut Vec<u8>, option: &HeaderOption) -> Result<()> {
    add_option(pdu, option, ControlFlags::DATA_OPTIONS)
}

// ---------------------------------------------------------------------------
// Origin/destination rewriting on packed frames
// ---------------------------------------------------------------------------

/// Insert or overwrite the originating VMAC of a packed frame. Used by the
/// hub function before forwarding a broadcast on behalf of a peer.
pub fn set_orig(pdu: &mut Vec<u8>, orig: &VmacAddress) {
    if pdu.len() < 4 {
        return;
    }
    let flags = ControlFlags::from_bits_truncate(pdu[1]);
    if flags.contains(ControlFlags::ORIG_VADDR) {
        pdu[4..4 + VMAC_SIZE].copy_from_slice(orig.as_bytes());
    } else {
        pdu[1] = (flags | ControlFlags::ORIG_VADDR).bits();
        pdu.splice(4..4, orig.as_bytes().iter().copied());
    }
}

/// Remove the destination VMAC and insert `orig` as the originating VMAC.
/// Used by the hub function when forwarding a unicast frame.
pub fn remove_dest_set_orig(pdu: &mut Vec<u8>, orig: &VmacAddress) {
    if pdu.len() < 4 {
        return;
    }
    let flags = ControlFlags::from_bits_truncate(pdu[1]);
    if flags.contains(ControlFlags::DEST_VADDR) {
        let dest_at = if flags.contains(ControlFlags::ORIG_VADDR) {
            4 + VMAC_SIZE
        } else {
            4
        };
        if pdu.len() >= dest_at + VMAC_SIZE {
            pdu.drain(dest_at..dest_at + VMAC_SIZE);
            pdu[1] = (flags - ControlFlags::DEST_VADDR).bits();
        }
    }
    set_orig(pdu, orig);
}

/// Remove both VMAC fields from a packed frame. Used on direct links where
/// both identities are bound by the connection itself.
pub fn remove_orig_and_dest(pdu: &mut Vec<u8>) {
    if pdu.len() < 4 {
        return;
    }
    let flags = ControlFlags::from_bits_truncate(pdu[1]);
    // after removing the origin field the destination slides down to the
    // same offset, so both drains start at octet 4
    if flags.contains(ControlFlags::ORIG_VADDR) {
        if pdu.len() < 4 + VMAC_SIZE {
            return;
        }
        pdu.drain(4..4 + VMAC_SIZE);
    }
    if flags.contains(ControlFlags::DEST_VADDR) {
        if pdu.len() < 4 + VMAC_SIZE {
            return;
        }
        pdu.drain(4..4 + VMAC_SIZE);
    }
    pdu[1] = (flags - (ControlFlags::ORIG_VADDR | ControlFlags::DEST_VADDR)).bits();
}

/// True if the packed frame carries no destination VMAC.
pub fn pdu_has_no_dest(pdu: &[u8]) -> bool {
    pdu.len() >= 4 && !ControlFlags::from_bits_truncate(pdu[1]).contains(ControlFlags::DEST_VADDR)
}

/// True if the packed frame is addressed to the Local Broadcast VMAC.
pub fn pdu_has_dest_broadcast(pdu: &[u8]) -> bool {
    pdu_get_dest(pdu).map_or(false, |dest| dest.is_broadcast())
}

/// Destination VMAC of a packed frame, if present.
pub fn pdu_get_dest(pdu: &[u8]) -> Option<VmacAddress> {
    if pdu.len() < 4 {
        return None;
    }
    let flags = ControlFlags::from_bits_truncate(pdu[1]);
    if !flags.contains(ControlFlags::DEST_VADDR) {
        return None;
    }
    let dest_at = if flags.contains(ControlFlags::ORIG_VADDR) {
        4 + VMAC_SIZE
    } else {
        4
    };
    pdu.get(dest_at..dest_at + VMAC_SIZE)
        .and_then(|bytes| VmacAddress::try_from(bytes).ok())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn decode_options(data: &[u8]) -> Result<(Vec<HeaderOption>, usize)> {
    let mut options = Vec::new();
    let mut pos = 0;
    loop {
        if pos >= data.len() {
            return Err(incomplete("header option list is truncated"));
        }
        let marker = data[pos];
        pos += 1;
        let option_type = marker & OPTION_TYPE_MASK;
        let has_data = marker & OptionMarker::HAS_DATA.bits() != 0;
        let must_understand = marker & OptionMarker::MUST_UNDERSTAND.bits() != 0;

        let payload: &[u8] = if has_data {
            if data.len() < pos + 2 {
                return Err(incomplete("header option length is truncated"));
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if data.len() < pos + len {
                return Err(incomplete("header option data is truncated"));
            }
            let payload = &data[pos..pos + len];
            pos += len;
            payload
        } else {
            &[]
        };

        let option_data = match option_type {
            OPTION_TYPE_SECURE_PATH => {
                if has_data {
                    return Err(header_error("secure path option must not carry data"));
                }
                HeaderOptionData::SecurePath
            }
            OPTION_TYPE_PROPRIETARY => {
                if payload.len() < 3 {
                    return Err(header_error(
                        "proprietary option must carry vendor id and option type",
                    ));
                }
                HeaderOptionData::Proprietary {
                    vendor_id: u16::from_be_bytes([payload[0], payload[1]]),
                    option_type: payload[2],
                    data: payload[3..].to_vec(),
                }
            }
            other => HeaderOptionData::Unknown {
                option_type: other,
                data: payload.to_vec(),
            },
        };

        options.push(HeaderOption {
            marker,
            must_understand,
            data: option_data,
        });
        if options.len() > HEADER_OPTION_MAX {
            return Err(unexpected("too many header options"));
        }

        if marker & OptionMarker::MORE_FOLLOWS.bits() == 0 {
            return Ok((options, pos));
        }
    }
}

fn decode_result_payload(payload: &[u8]) -> Result<Payload> {
    if payload.len() < 2 {
        return Err(DecodeError::new(
            ErrorClass::Communication,
            ErrorCode::PayloadExpected,
            "result payload is too short",
        ));
    }
    let function = BvlcFunction::try_from(payload[0])
        .map_err(|_| unexpected("result refers to an unknown bvlc function"))?;
    let result_code = payload[1];
    match result_code {
        0 => {
            if payload.len() != 2 {
                return Err(unexpected("result ack must not carry error fields"));
            }
            Ok(Payload::Result(ResultPayload {
                function,
                result_code,
                error: None,
            }))
        }
        1 => {
            if payload.len() < 7 {
                return Err(incomplete("result nak is missing error fields"));
            }
            let details = std::str::from_utf8(&payload[7..])
                .map_err(|_| unexpected("error details are not valid utf-8"))?
                .to_string();
            Ok(Payload::Result(ResultPayload {
                function,
                result_code,
                error: Some(ResultError {
                    header_marker: payload[2],
                    class: ErrorClass::from(u16::from_be_bytes([payload[3], payload[4]])),
                    code: ErrorCode::from(u16::from_be_bytes([payload[5], payload[6]])),
                    details,
                }),
            }))
        }
        _ => Err(unexpected("result code must be 0 or 1")),
    }
}

fn decode_connect_payload(payload: &[u8]) -> Result<(VmacAddress, DeviceUuid, u16, u16)> {
    if payload.len() != VMAC_SIZE + UUID_SIZE + 4 {
        return Err(incomplete("connect payload must carry vmac, uuid and caps"));
    }
    let vmac = VmacAddress::try_from(&payload[..VMAC_SIZE])
        .map_err(|_| incomplete("connect payload must carry vmac, uuid and caps"))?;
    let uuid = DeviceUuid::try_from(&payload[VMAC_SIZE..VMAC_SIZE + UUID_SIZE])
        .map_err(|_| incomplete("connect payload must carry vmac, uuid and caps"))?;
    let caps = &payload[VMAC_SIZE + UUID_SIZE..];
    Ok((
        vmac,
        uuid,
        u16::from_be_bytes([caps[0], caps[1]]),
        u16::from_be_bytes([caps[2], caps[3]]),
    ))
}

fn expect_empty(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(unexpected("message must not carry a payload"))
    }
}

/// Decode a BVLC/SC frame.
///
/// Never panics and never reads past `buf`. On failure the error carries
/// the BACnet error class/code the caller may NAK with; frames shorter
/// than four octets report [`ErrorCode::Other`] and must be dropped
/// silently.
pub fn decode_message(buf: &[u8]) -> Result<DecodedMessage> {
    if buf.len() < 4 {
        return Err(DecodeError::new(
            ErrorClass::Communication,
            ErrorCode::Other,
            "message is shorter than four octets",
        ));
    }

    let function = BvlcFunction::try_from(buf[0]).map_err(|_| {
        DecodeError::new(
            ErrorClass::Communication,
            ErrorCode::BvlcFunctionUnknown,
            "unknown bvlc function",
        )
    })?;

    if buf[1] & 0xF0 != 0 {
        return Err(header_error("reserved control flag bits must be zero"));
    }
    let flags = ControlFlags::from_bits_truncate(buf[1]);
    let message_id = u16::from_be_bytes([buf[2], buf[3]]);
    let mut pos = 4;

    let origin = if flags.contains(ControlFlags::ORIG_VADDR) {
        let bytes = buf
            .get(pos..pos + VMAC_SIZE)
            .ok_or_else(|| incomplete("originating vmac is truncated"))?;
        pos += VMAC_SIZE;
        Some(
            VmacAddress::try_from(bytes)
                .map_err(|_| incomplete("originating vmac is truncated"))?,
        )
    } else {
        None
    };

    let dest = if flags.contains(ControlFlags::DEST_VADDR) {
        let bytes = buf
            .get(pos..pos + VMAC_SIZE)
            .ok_or_else(|| incomplete("destination vmac is truncated"))?;
        pos += VMAC_SIZE;
        Some(
            VmacAddress::try_from(bytes)
                .map_err(|_| incomplete("destination vmac is truncated"))?,
        )
    } else {
        None
    };

    // connection control messages are bound to the link itself
    if matches!(
        function,
        BvlcFunction::ConnectRequest
            | BvlcFunction::ConnectAccept
            | BvlcFunction::DisconnectRequest
            | BvlcFunction::DisconnectAck
            | BvlcFunction::HeartbeatRequest
            | BvlcFunction::HeartbeatAck
    ) && (origin.is_some() || dest.is_some())
    {
        return Err(header_error(
            "connection control messages must not carry vmac fields",
        ));
    }

    let dest_options = if flags.contains(ControlFlags::DEST_OPTIONS) {
        let (options, used) = decode_options(&buf[pos..])?;
        pos += used;
        options
    } else {
        Vec::new()
    };

    let data_options = if flags.contains(ControlFlags::DATA_OPTIONS) {
        let (options, used) = decode_options(&buf[pos..])?;
        pos += used;
        options
    } else {
        Vec::new()
    };

    let payload_bytes = &buf[pos..];

    let payload = match function {
        BvlcFunction::Result => decode_result_payload(payload_bytes)?,
        BvlcFunction::EncapsulatedNpdu => {
            if payload_bytes.is_empty() {
                return Err(DecodeError::new(
                    ErrorClass::Communication,
                    ErrorCode::PayloadExpected,
                    "encapsulated npdu must carry a payload",
                ));
            }
            Payload::EncapsulatedNpdu(payload_bytes.to_vec())
        }
        BvlcFunction::AddressResolution => {
            expect_empty(payload_bytes)?;
            Payload::AddressResolution
        }
        BvlcFunction::AddressResolutionAck => Payload::AddressResolutionAck(
            std::str::from_utf8(payload_bytes)
                .map_err(|_| unexpected("websocket uris are not valid utf-8"))?
                .to_string(),
        ),
        BvlcFunction::Advertisement => {
            if payload_bytes.len() != 6 {
                return Err(incomplete("advertisement payload must be six octets"));
            }
            let hub_status = HubConnectorState::try_from(payload_bytes[0])
                .map_err(|_| unexpected("unknown hub connection status"))?;
            let support = match payload_bytes[1] {
                0 => DirectConnectionSupport::Unsupported,
                1 => DirectConnectionSupport::Supported,
                _ => return Err(unexpected("unknown direct connection support value")),
            };
            Payload::Advertisement {
                hub_status,
                support,
                max_bvlc_len: u16::from_be_bytes([payload_bytes[2], payload_bytes[3]]),
                max_npdu_len: u16::from_be_bytes([payload_bytes[4], payload_bytes[5]]),
            }
        }
        BvlcFunction::AdvertisementSolicitation => {
            expect_empty(payload_bytes)?;
            Payload::AdvertisementSolicitation
        }
        BvlcFunction::ConnectRequest => {
            let (vmac, uuid, max_bvlc_len, max_npdu_len) = decode_connect_payload(payload_bytes)?;
            Payload::ConnectRequest {
                vmac,
                uuid,
                max_bvlc_len,
                max_npdu_len,
            }
        }
        BvlcFunction::ConnectAccept => {
            let (vmac, uuid, max_bvlc_len, max_npdu_len) = decode_connect_payload(payload_bytes)?;
            Payload::ConnectAccept {
                vmac,
                uuid,
                max_bvlc_len,
                max_npdu_len,
            }
        }
        BvlcFunction::DisconnectRequest => {
            expect_empty(payload_bytes)?;
            Payload::DisconnectRequest
        }
        BvlcFunction::DisconnectAck => {
            expect_empty(payload_bytes)?;
            Payload::DisconnectAck
        }
        BvlcFunction::HeartbeatRequest => {
            expect_empty(payload_bytes)?;
            Payload::HeartbeatRequest
        }
        BvlcFunction::HeartbeatAck => {
            expect_empty(payload_bytes)?;
            Payload::HeartbeatAck
        }
        BvlcFunction::ProprietaryMessage => {
            if payload_bytes.len() < 3 {
                return Err(DecodeError::new(
                    ErrorClass::Communication,
                    ErrorCode::PayloadExpected,
                    "proprietary message must carry vendor id and function",
                ));
            }
            Payload::Proprietary {
                vendor_id: u16::from_be_bytes([payload_bytes[0], payload_bytes[1]]),
                function: payload_bytes[2],
                data: payload_bytes[3..].to_vec(),
            }
        }
    };

    Ok(DecodedMessage {
        header: DecodedHeader {
            function,
            message_id,
            origin,
            dest,
            dest_options,
            data_options,
        },
        payload,
    })
}
