//! TLS record framing
//!
//! Every TLS record starts with a 5-byte header (RFC 8446 Section 5.1):
//!
//! ```text
//!   +--------------+-------------------+------------------+
//!   | content type | legacy version    | length           |
//!   |   (1 byte)   | (2 bytes, BE)     | (2 bytes, BE)    |
//!   +--------------+-------------------+------------------+
//! ```
//!
//! followed by `length` bytes of payload. Only the header is interpreted;
//! payloads are carried opaquely.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// TLS record header size (5 bytes)
pub const RECORD_HEADER_SIZE: usize = 5;

/// Direction of a captured record relative to the local client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the handshake engine to the server
    Outgoing,
    /// Received from the server
    Incoming,
}

impl Direction {
    /// Get direction name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }

    /// Arrow used when rendering records
    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::Outgoing => "->",
            Direction::Incoming => "<-",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS record content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// change_cipher_spec (20)
    ChangeCipherSpec = 20,
    /// alert (21)
    Alert = 21,
    /// handshake (22)
    Handshake = 22,
    /// application_data (23)
    ApplicationData = 23,
    /// heartbeat (24, RFC 6520)
    Heartbeat = 24,
}

impl ContentType {
    /// Convert content type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create content type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            24 => Some(ContentType::Heartbeat),
            _ => None,
        }
    }

    /// Get content type name
    pub fn name(&self) -> &'static str {
        match self {
            ContentType::ChangeCipherSpec => "change_cipher_spec",
            ContentType::Alert => "alert",
            ContentType::Handshake => "handshake",
            ContentType::ApplicationData => "application_data",
            ContentType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u8())
    }
}

/// Decoded TLS record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Raw content type byte
    pub content_type: u8,
    /// Legacy record version (e.g. 0x0303)
    pub version: u16,
    /// Declared payload length
    pub length: u16,
}

impl RecordHeader {
    /// Decode a record header
    ///
    /// Any byte values are accepted. The relay must forward whatever the peer
    /// sends, so validation is left to OpenSSL.
    pub fn decode(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        RecordHeader {
            content_type: bytes[0],
            version: u16::from_be_bytes([bytes[1], bytes[2]]),
            length: u16::from_be_bytes([bytes[3], bytes[4]]),
        }
    }

    /// Decode the header at the start of a buffer, if enough bytes are present
    pub fn peek(buf: &[u8]) -> Option<Self> {
        let header: &[u8; RECORD_HEADER_SIZE] = buf.get(..RECORD_HEADER_SIZE)?.try_into().ok()?;
        Some(Self::decode(header))
    }

    /// Encode the header
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let version = self.version.to_be_bytes();
        let length = self.length.to_be_bytes();
        [self.content_type, version[0], version[1], length[0], length[1]]
    }

    /// Number of payload bytes still needed after the header
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Total record size including the header
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len()
    }

    /// Known content type, if any
    pub fn kind(&self) -> Option<ContentType> {
        ContentType::from_u8(self.content_type)
    }
}

/// A captured TLS record
///
/// `data` holds the full wire bytes: the 5-byte header followed by
/// `length` bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Direction the record travelled
    pub direction: Direction,
    /// Raw content type byte
    pub content_type: u8,
    /// Legacy record version
    pub version: u16,
    /// Declared payload length
    pub length: u16,
    /// Header and payload as seen on the wire
    pub data: Bytes,
}

impl Record {
    /// Build a record from a decoded header and its payload
    ///
    /// Returns `None` if the payload length disagrees with the header.
    pub fn new(direction: Direction, header: RecordHeader, payload: &[u8]) -> Option<Self> {
        if payload.len() != header.payload_len() {
            return None;
        }

        Some(Self::assemble(direction, header, payload))
    }

    /// Build a record whose payload length is already known to match
    pub(crate) fn assemble(direction: Direction, header: RecordHeader, payload: &[u8]) -> Self {
        debug_assert_eq!(payload.len(), header.payload_len());

        let mut data = BytesMut::with_capacity(header.record_len());
        data.put_slice(&header.encode());
        data.put_slice(payload);

        Record {
            direction,
            content_type: header.content_type,
            version: header.version,
            length: header.length,
            data: data.freeze(),
        }
    }

    /// Build a record from complete wire bytes
    ///
    /// Returns `None` unless `wire` holds exactly one record.
    pub fn from_wire(direction: Direction, wire: Bytes) -> Option<Self> {
        let header = RecordHeader::peek(&wire)?;
        if wire.len() != header.record_len() {
            return None;
        }

        Some(Record {
            direction,
            content_type: header.content_type,
            version: header.version,
            length: header.length,
            data: wire,
        })
    }

    /// Header fields as a `RecordHeader`
    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            content_type: self.content_type,
            version: self.version,
            length: self.length,
        }
    }

    /// Payload bytes (after the header)
    pub fn payload(&self) -> Bytes {
        self.data.slice(RECORD_HEADER_SIZE..)
    }

    /// Known content type, if any
    pub fn kind(&self) -> Option<ContentType> {
        ContentType::from_u8(self.content_type)
    }

    /// Whether `data` agrees with the header fields
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.length as usize + RECORD_HEADER_SIZE
            && RecordHeader::peek(&self.data) == Some(self.header())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.direction.arrow())?;
        match self.kind() {
            Some(kind) => write!(f, "{}", kind)?,
            None => write!(f, "unknown({})", self.content_type)?,
        }
        write!(f, " 0x{:04x} len={}", self.version, self.length)
    }
}
