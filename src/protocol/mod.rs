//! Wire protocol shared by every channel variant.
//!
//! This module defines the framing and envelope types exchanged with the
//! host: the stream transport header, the fixed message header carrying the
//! correlation id, and the datagram descriptor envelopes. Operation payloads
//! are opaque byte ranges; no channel interprets them.

mod wire;

pub use wire::{
    encode_frame, read_frame, DatagramEvent, DatagramMsg, MsgHeader, RegionDescriptor,
    SgDescriptor, SockHeader, MAX_MESSAGE_SIZE, MSG_HEADER_LEN, SOCK_HEADER_LEN, WIRE_VERSION,
};
