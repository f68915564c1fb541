//! BACnet primitive value encoding (Clause 20 subset)
//!
//! This module provides the tag-length-value encoders and decoders that the
//! secure-connect telemetry records are built from. BACnet/SC itself frames
//! messages with the fixed layouts in [`crate::bvlc`]; Clause 20 encoding
//! only appears where connection status records are mirrored into
//! Network-Port properties (Clause 21 constructed sequences with numbered
//! context tags).
//!
//! The supported subset:
//!
//! - application and context tags, including extended lengths
//! - unsigned integers and enumerated values
//! - octet strings and UTF-8 character strings
//! - Date, Time and the constructed DateTime used for connection stamps
//!
//! Encoders append to a `Vec<u8>`; decoders return `(value, consumed)`.
//!
//! # Examples
//!
//! ```
//! use bacnet_sc::encoding::{encode_context_unsigned, decode_context_unsigned};
//!
//! let mut buffer = Vec::new();
//! encode_context_unsigned(&mut buffer, 3, 1000).unwrap();
//! let (value, consumed) = decode_context_unsigned(&buffer, 3).unwrap();
//! assert_eq!(value, 1000);
//! assert_eq!(consumed, buffer.len());
//! ```

use std::error::Error;
use std::fmt;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Buffer underflow during decoding
    BufferUnderflow,
    /// Invalid tag number encountered
    InvalidTag,
    /// Invalid length value
    InvalidLength,
    /// Unexpected end of data during decoding
    UnexpectedEndOfData,
    /// Invalid encoding format
    InvalidFormat(String),
    /// Value out of valid range
    ValueOutOfRange,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::BufferUnderflow => write!(f, "Buffer underflow during decoding"),
            EncodingError::InvalidTag => write!(f, "Invalid tag number encountered"),
            EncodingError::InvalidLength => write!(f, "Invalid length value"),
            EncodingError::UnexpectedEndOfData => write!(f, "Unexpected end of data"),
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            EncodingError::ValueOutOfRange => write!(f, "Value out of valid range"),
        }
    }
}

impl Error for EncodingError {}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

/// Encode a BACnet application tag with the given content length
pub fn encode_application_tag(buffer: &mut Vec<u8>, tag: ApplicationTag, length: usize) -> Result<()> {
    let tag_byte = if length < 5 {
        (tag as u8) << 4 | (length as u8)
    } else {
        (tag as u8) << 4 | 5
    };

    buffer.push(tag_byte);
    if length >= 5 {
        encode_extended_length(buffer, length)?;
    }

    Ok(())
}

/// Decode a BACnet application tag, returning `(tag, length, consumed)`
pub fn decode_application_tag(data: &[u8]) -> Result<(ApplicationTag, usize, usize)> {
    if data.is_empty() {
        return Err(EncodingError::BufferUnderflow);
    }

    let tag_byte = data[0];
    if (tag_byte & 0x08) != 0 {
        // context-specific tag
        return Err(EncodingError::InvalidTag);
    }

    let tag = match tag_byte >> 4 {
        0 => ApplicationTag::Null,
        1 => ApplicationTag::Boolean,
        2 => ApplicationTag::UnsignedInt,
        3 => ApplicationTag::SignedInt,
        4 => ApplicationTag::Real,
        5 => ApplicationTag::Double,
        6 => ApplicationTag::OctetString,
        7 => ApplicationTag::CharacterString,
        8 => ApplicationTag::BitString,
        9 => ApplicationTag::Enumerated,
        10 => ApplicationTag::Date,
        11 => ApplicationTag::Time,
        12 => ApplicationTag::ObjectIdentifier,
        _ => return Err(EncodingError::InvalidTag),
    };

    let (length, consumed) = decode_tag_length(data)?;
    Ok((tag, length, consumed))
}

/// Encode a context-specific tag with the given content length
pub fn encode_context_tag(buffer: &mut Vec<u8>, tag_number: u8, length: usize) -> Result<()> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange);
    }

    let tag_byte = if length < 5 {
        0x08 | (tag_number << 4) | (length as u8)
    } else {
        0x08 | (tag_number << 4) | 5
    };

    buffer.push(tag_byte);
    if length >= 5 {
        encode_extended_length(buffer, length)?;
    }

    Ok(())
}

/// Decode a context-specific tag, returning `(tag_number, length, consumed)`
pub fn decode_context_tag(data: &[u8]) -> Result<(u8, usize, usize)> {
    if data.is_empty() {
        return Err(EncodingError::BufferUnderflow);
    }

    let tag_byte = data[0];
    if (tag_byte & 0x08) == 0 {
        return Err(EncodingError::InvalidTag);
    }
    if matches!(tag_byte & 0x07, 6 | 7) {
        // opening/closing tags carry no length
        return Err(EncodingError::InvalidTag);
    }

    let tag_number = tag_byte >> 4;
    let (length, consumed) = decode_tag_length(data)?;
    Ok((tag_number, length, consumed))
}

/// Encode an opening tag for constructed data
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange);
    }
    buffer.push(0x0E | (tag_number << 4));
    Ok(())
}

/// Encode a closing tag for constructed data
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange);
    }
    buffer.push(0x0F | (tag_number << 4));
    Ok(())
}

/// True if the byte at the start of `data` is the opening tag for `tag_number`
pub fn is_opening_tag(data: &[u8], tag_number: u8) -> bool {
    !data.is_empty() && data[0] == (0x0E | (tag_number << 4))
}

/// True if the byte at the start of `data` is the closing tag for `tag_number`
pub fn is_closing_tag(data: &[u8], tag_number: u8) -> bool {
    !data.is_empty() && data[0] == (0x0F | (tag_number << 4))
}

fn encode_extended_length(buffer: &mut Vec<u8>, length: usize) -> Result<()> {
    if length < 254 {
        buffer.push(length as u8);
    } else if length < 65536 {
        buffer.push(254);
        buffer.extend_from_slice(&(length as u16).to_be_bytes());
    } else if length <= u32::MAX as usize {
        buffer.push(255);
        buffer.extend_from_slice(&(length as u32).to_be_bytes());
    } else {
        return Err(EncodingError::InvalidLength);
    }
    Ok(())
}

fn decode_tag_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = (data[0] & 0x07) as usize;
    let mut consumed = 1;

    if length == 5 {
        if data.len() < 2 {
            return Err(EncodingError::BufferUnderflow);
        }
        let len_byte = data[1];
        consumed += 1;
        if len_byte < 254 {
            length = len_byte as usize;
        } else if len_byte == 254 {
            if data.len() < 4 {
                return Err(EncodingError::BufferUnderflow);
            }
            length = u16::from_be_bytes([data[2], data[3]]) as usize;
            consumed += 2;
        } else {
            if data.len() < 6 {
                return Err(EncodingError::BufferUnderflow);
            }
            length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
            consumed += 4;
        }
    }

    Ok((length, consumed))
}

fn unsigned_content_length(value: u32) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn push_unsigned_content(buffer: &mut Vec<u8>, value: u32) {
    let bytes = value.to_be_bytes();
    let skip = 4 - unsigned_content_length(value);
    buffer.extend_from_slice(&bytes[skip..]);
}

fn pull_unsigned_content(data: &[u8], length: usize) -> Result<u32> {
    if length == 0 || length > 4 {
        return Err(EncodingError::InvalidLength);
    }
    if data.len() < length {
        return Err(EncodingError::UnexpectedEndOfData);
    }
    let mut value = 0u32;
    for &b in &data[..length] {
        value = (value << 8) | b as u32;
    }
    Ok(value)
}

/// Encode an unsigned integer with a context tag
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    encode_context_tag(buffer, tag_number, unsigned_content_length(value))?;
    push_unsigned_content(buffer, value);
    Ok(())
}

/// Decode a context-tagged unsigned integer, returning `(value, consumed)`
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_context_tag(data)?;
    if tag != tag_number {
        return Err(EncodingError::InvalidTag);
    }
    let value = pull_unsigned_content(&data[consumed..], length)?;
    Ok((value, consumed + length))
}

/// Encode an enumerated value with a context tag
pub fn encode_context_enumerated(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    // enumerated content is encoded exactly like unsigned
    encode_context_unsigned(buffer, tag_number, value)
}

/// Decode a context-tagged enumerated value, returning `(value, consumed)`
pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, tag_number)
}

/// Encode an octet string with a context tag
pub fn encode_context_octet_string(buffer: &mut Vec<u8>, tag_number: u8, octets: &[u8]) -> Result<()> {
    encode_context_tag(buffer, tag_number, octets.len())?;
    buffer.extend_from_slice(octets);
    Ok(())
}

/// Decode a context-tagged octet string, returning `(octets, consumed)`
pub fn decode_context_octet_string(data: &[u8], tag_number: u8) -> Result<(Vec<u8>, usize)> {
    let (tag, length, consumed) = decode_context_tag(data)?;
    if tag != tag_number {
        return Err(EncodingError::InvalidTag);
    }
    if data.len() < consumed + length {
        return Err(EncodingError::UnexpectedEndOfData);
    }
    Ok((data[consumed..consumed + length].to_vec(), consumed + length))
}

/// Character set octet for UTF-8 (ANSI X3.4 / UTF-8 in Clause 20.2.9)
const CHARSET_UTF8: u8 = 0;

/// Encode a UTF-8 character string with a context tag
pub fn encode_context_character_string(buffer: &mut Vec<u8>, tag_number: u8, s: &str) -> Result<()> {
    encode_context_tag(buffer, tag_number, s.len() + 1)?;
    buffer.push(CHARSET_UTF8);
    buffer.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Decode a context-tagged UTF-8 character string, returning `(string, consumed)`
pub fn decode_context_character_string(data: &[u8], tag_number: u8) -> Result<(String, usize)> {
    let (tag, length, consumed) = decode_context_tag(data)?;
    if tag != tag_number {
        return Err(EncodingError::InvalidTag);
    }
    if length == 0 {
        return Err(EncodingError::InvalidLength);
    }
    if data.len() < consumed + length {
        return Err(EncodingError::UnexpectedEndOfData);
    }
    if data[consumed] != CHARSET_UTF8 {
        return Err(EncodingError::InvalidFormat(format!(
            "unsupported character set {}",
            data[consumed]
        )));
    }
    let s = std::str::from_utf8(&data[consumed + 1..consumed + length])
        .map_err(|_| EncodingError::InvalidFormat("invalid UTF-8".to_string()))?
        .to_string();
    Ok((s, consumed + length))
}

/// Octet used for "unspecified" date/time components (Clause 20.2.11/12)
pub const DATETIME_UNSPECIFIED: u8 = 0xFF;

/// BACnet Date: year offset from 1900, month, day and day-of-week, each
/// component independently allowed to be unspecified (`0xFF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacnetDate {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    /// 1 = Monday .. 7 = Sunday
    pub weekday: u8,
}

impl BacnetDate {
    pub const fn unspecified() -> Self {
        BacnetDate {
            year: DATETIME_UNSPECIFIED,
            month: DATETIME_UNSPECIFIED,
            day: DATETIME_UNSPECIFIED,
            weekday: DATETIME_UNSPECIFIED,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.year == DATETIME_UNSPECIFIED
            && self.month == DATETIME_UNSPECIFIED
            && self.day == DATETIME_UNSPECIFIED
            && self.weekday == DATETIME_UNSPECIFIED
    }
}

/// BACnet Time: hour, minute, second and hundredths, each component
/// independently allowed to be unspecified (`0xFF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacnetTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl BacnetTime {
    pub const fn unspecified() -> Self {
        BacnetTime {
            hour: DATETIME_UNSPECIFIED,
            minute: DATETIME_UNSPECIFIED,
            second: DATETIME_UNSPECIFIED,
            hundredths: DATETIME_UNSPECIFIED,
        }
    }
}

/// BACnet DateTime, the constructed pair used by connection status stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacnetDateTime {
    pub date: BacnetDate,
    pub time: BacnetTime,
}

impl BacnetDateTime {
    /// A fully unspecified stamp, used for "never happened" timestamps.
    pub const fn unspecified() -> Self {
        BacnetDateTime {
            date: BacnetDate::unspecified(),
            time: BacnetTime::unspecified(),
        }
    }

    /// Capture the current local time.
    pub fn now() -> Self {
        use chrono::{Datelike, Local, Timelike};
        let now = Local::now();
        BacnetDateTime {
            date: BacnetDate {
                year: now.year().saturating_sub(1900).clamp(0, 254) as u8,
                month: now.month() as u8,
                day: now.day() as u8,
                weekday: now.weekday().number_from_monday() as u8,
            },
            time: BacnetTime {
                hour: now.hour() as u8,
                minute: now.minute() as u8,
                second: now.second() as u8,
                hundredths: (now.timestamp_subsec_millis() / 10) as u8,
            },
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.date.is_unspecified()
    }
}

impl fmt::Display for BacnetDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unspecified() {
            return write!(f, "(unspecified)");
        }
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:02}",
            self.date.year as u16 + 1900,
            self.date.month,
            self.date.day,
            self.time.hour,
            self.time.minute,
            self.time.second,
            self.time.hundredths
        )
    }
}

/// Encode a Date with its application tag
pub fn encode_application_date(buffer: &mut Vec<u8>, date: &BacnetDate) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Date, 4)?;
    buffer.extend_from_slice(&[date.year, date.month, date.day, date.weekday]);
    Ok(())
}

/// Decode an application-tagged Date, returning `(date, consumed)`
pub fn decode_application_date(data: &[u8]) -> Result<(BacnetDate, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Date || length != 4 {
        return Err(EncodingError::InvalidTag);
    }
    if data.len() < consumed + 4 {
        return Err(EncodingError::UnexpectedEndOfData);
    }
    let date = BacnetDate {
        year: data[consumed],
        month: data[consumed + 1],
        day: data[consumed + 2],
        weekday: data[consumed + 3],
    };
    Ok((date, consumed + 4))
}

/// Encode a Time with its application tag
pub fn encode_application_time(buffer: &mut Vec<u8>, time: &BacnetTime) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Time, 4)?;
    buffer.extend_from_slice(&[time.hour, time.minute, time.second, time.hundredths]);
    Ok(())
}

/// Decode an application-tagged Time, returning `(time, consumed)`
pub fn decode_application_time(data: &[u8]) -> Result<(BacnetTime, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Time || length != 4 {
        return Err(EncodingError::InvalidTag);
    }
    if data.len() < consumed + 4 {
        return Err(EncodingError::UnexpectedEndOfData);
    }
    let time = BacnetTime {
        hour: data[consumed],
        minute: data[consumed + 1],
        second: data[consumed + 2],
        hundredths: data[consumed + 3],
    };
    Ok((time, consumed + 4))
}

/// Encode a DateTime inside a context-tagged constructed wrapper
pub fn encode_context_datetime(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    dt: &BacnetDateTime,
) -> Result<()> {
    encode_opening_tag(buffer, tag_number)?;
    encode_application_date(buffer, &dt.date)?;
    encode_application_time(buffer, &dt.time)?;
    encode_closing_tag(buffer, tag_number)?;
    Ok(())
}

/// Decode a context-tagged constructed DateTime, returning `(datetime, consumed)`
pub fn decode_context_datetime(data: &[u8], tag_number: u8) -> Result<(BacnetDateTime, usize)> {
    if !is_opening_tag(data, tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let mut pos = 1;
    let (date, used) = decode_application_date(&data[pos..])?;
    pos += used;
    let (time, used) = decode_application_time(&data[pos..])?;
    pos += used;
    if !is_closing_tag(&data[pos..], tag_number) {
        return Err(EncodingError::InvalidFormat("missing closing tag".to_string()));
    }
    Ok((BacnetDateTime { date, time }, pos + 1))
}
