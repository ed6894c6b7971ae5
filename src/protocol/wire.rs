//! Wire framing shared by the channel variants.
//!
//! # Stream frame format
//!
//! ```text
//! +-----------+-----------+------------------+------------------+
//! | length    | version   |  message header  | operation bytes  |
//! | (4 B, BE) | (4 B, BE) |  (16 B, BE)      |  (length-16 B)   |
//! +-----------+-----------+------------------+------------------+
//! ```
//!
//! The leading 8 bytes are the transport header ([`SockHeader`]): a big-endian
//! length covering everything after the transport header, and the wire
//! version. The message header ([`MsgHeader`]) carries the correlation id, the
//! completion status (zero in requests), and the length of the operation
//! payload that follows. The operation bytes are opaque to this layer.
//!
//! Datagram channels do not use stream framing; they exchange bincode-encoded
//! [`DatagramMsg`]/[`DatagramEvent`] envelopes whose payloads are
//! scatter-gather descriptors rather than message bytes.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// Version tag validated on every received stream frame.
pub const WIRE_VERSION: u32 = 1;

/// Maximum bytes after the transport header in one stream frame (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the packed [`SockHeader`].
pub const SOCK_HEADER_LEN: usize = 8;

/// Size of the packed [`MsgHeader`].
pub const MSG_HEADER_LEN: usize = 16;

/// Per-frame transport header: length then version, both big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockHeader {
    /// Bytes following this header: message header plus operation payload.
    pub len: u32,
    pub version: u32,
}

impl SockHeader {
    /// Header for a frame whose body (message header + payload) is `len` bytes.
    pub fn new(len: u32) -> Self {
        Self {
            len,
            version: WIRE_VERSION,
        }
    }

    /// Pack into the 8-byte on-wire form.
    pub fn pack(&self) -> [u8; SOCK_HEADER_LEN] {
        let mut buf = [0u8; SOCK_HEADER_LEN];
        buf[..4].copy_from_slice(&self.len.to_be_bytes());
        buf[4..].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    /// Parse and validate a received transport header.
    ///
    /// Rejects version mismatches and frames too short to hold a message
    /// header or larger than [`MAX_MESSAGE_SIZE`]; a failure here means the
    /// byte stream can no longer be trusted and the channel must die.
    pub fn parse(buf: &[u8; SOCK_HEADER_LEN]) -> io::Result<Self> {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if version != WIRE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported wire version {}", version),
            ));
        }
        if (len as usize) < MSG_HEADER_LEN || len as usize > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad frame length: {} bytes", len),
            ));
        }
        Ok(Self { len, version })
    }
}

/// Fixed message header present in both directions, hand-packed big-endian:
/// correlation id (8 B), status (4 B), payload length (4 B).
///
/// `status` is meaningful only in replies; requests carry zero. `len` is the
/// length of the operation payload that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub id: u64,
    pub status: u32,
    pub len: u32,
}

impl MsgHeader {
    /// Request-direction header for correlation id `id`.
    pub fn request(id: u64, payload_len: u32) -> Self {
        Self {
            id,
            status: 0,
            len: payload_len,
        }
    }

    /// Pack into the fixed 16-byte on-wire form.
    pub fn pack(&self) -> [u8; MSG_HEADER_LEN] {
        let mut buf = [0u8; MSG_HEADER_LEN];
        buf[..8].copy_from_slice(&self.id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.status.to_be_bytes());
        buf[12..].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Unpack from an exactly-sized header region.
    pub fn unpack_exact(data: &[u8; MSG_HEADER_LEN]) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[..8]);
        let mut status = [0u8; 4];
        status.copy_from_slice(&data[8..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[12..16]);
        Self {
            id: u64::from_be_bytes(id),
            status: u32::from_be_bytes(status),
            len: u32::from_be_bytes(len),
        }
    }

    /// Unpack from a received header region of at least [`MSG_HEADER_LEN`].
    pub fn unpack(data: &[u8]) -> io::Result<Self> {
        if data.len() < MSG_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated message header",
            ));
        }
        let mut raw = [0u8; MSG_HEADER_LEN];
        raw.copy_from_slice(&data[..MSG_HEADER_LEN]);
        Ok(Self::unpack_exact(&raw))
    }
}

/// One scatter-gather entry in a datagram request: a donated region handle
/// plus the byte range inside it the host should read or write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SgDescriptor {
    pub region: u32,
    pub offset: u32,
    pub len: u32,
}

/// Descriptor of one donated pool region, announced to the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub region: u32,
    pub len: u32,
}

/// Guest-to-host datagrams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DatagramMsg {
    /// A request submitted by descriptor list. The first descriptor always
    /// covers the message header and operation bytes of the request buffer;
    /// the rest are caller-attached data segments.
    Request { id: u64, segments: Vec<SgDescriptor> },
    /// Additional pool regions granted to the host (initial donation and
    /// replenish responses).
    Donate { regions: Vec<RegionDescriptor> },
}

impl DatagramMsg {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        bincode::deserialize(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Host-to-guest notifications delivered through the datagram callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DatagramEvent {
    /// The host finished the request with `id`; the reply occupies the first
    /// `len` operation bytes of the request's own region.
    Complete { id: u64, status: u32, len: u32 },
    /// The host is running low on donated pages and asks for `count` more.
    Replenish { count: u32 },
    /// Unsolicited host-initiated message, dispatched outside this layer.
    HostPush { payload: Vec<u8> },
}

impl DatagramEvent {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        bincode::deserialize(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Assemble a complete stream frame: transport header plus `body`.
pub fn encode_frame(body: &[u8]) -> io::Result<Vec<u8>> {
    if body.len() < MSG_HEADER_LEN || body.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame body length: {} bytes", body.len()),
        ));
    }
    let mut buf = Vec::with_capacity(SOCK_HEADER_LEN + body.len());
    buf.extend_from_slice(&SockHeader::new(body.len() as u32).pack());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Read one full frame body (message header + payload) from a reader.
///
/// Used by in-process test hosts; the stream receiver proper runs its own
/// incremental state machine so a partial frame never desynchronizes it.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut head = [0u8; SOCK_HEADER_LEN];
    reader.read_exact(&mut head)?;
    let header = SockHeader::parse(&head)?;

    let mut body = vec![0u8; header.len as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}
