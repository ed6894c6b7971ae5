//! Synchronous hypervisor-port channel.
//!
//! The fallback variant: no connection setup, no receiver path. `send` hands
//! the prefixed message to the hypervisor call primitive and the reply is in
//! the buffer when the call returns, so the request completes inline and the
//! caller's wait never actually blocks.

use std::io;
use std::sync::Arc;

use tracing::debug;

use super::{
    classify_send_error, Channel, ChannelKind, ChannelStatus, SendError, StatusCell,
};
use crate::error::{ReplyStatus, TransportError};
use crate::protocol::{MsgHeader, MSG_HEADER_LEN};
use crate::request::{MessageBuf, Request};

/// Service selector consumed by the hypervisor before the message proper.
pub const PORT_PREFIX: &[u8] = b"f ";

/// The synchronous call primitive supplied by the host environment.
///
/// `buf[..request_len]` holds the prefixed request. The implementation
/// consumes the service prefix, performs the roundtrip, writes the reply
/// (message header plus payload) at the start of `buf`, and returns the
/// reply length. `buf` is always sized for the largest permitted reply.
pub trait PortBackend: Send {
    fn roundtrip(&mut self, buf: &mut [u8], request_len: usize) -> io::Result<usize>;
}

pub struct PortChannel {
    backend: Box<dyn PortBackend>,
    status: Arc<StatusCell>,
    max_payload: usize,
}

impl PortChannel {
    pub fn new(backend: Box<dyn PortBackend>, max_payload: usize) -> Self {
        Self {
            backend,
            status: StatusCell::new(ChannelStatus::Uninitialized),
            max_payload,
        }
    }

    fn roundtrip_buf_len(&self) -> usize {
        PORT_PREFIX.len() + MSG_HEADER_LEN + self.max_payload
    }
}

impl Channel for PortChannel {
    fn name(&self) -> &'static str {
        "port"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Port
    }

    fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    /// The port needs no connection setup, so open always succeeds.
    fn open(&mut self) -> io::Result<()> {
        if self.status.get() != ChannelStatus::Connected {
            debug!(target: "volume-link::port", "port channel opened");
            self.status.set(ChannelStatus::Connected);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.status.set(ChannelStatus::NotConnected);
    }

    fn mark_dead(&self) {
        self.status.set(ChannelStatus::Dead);
    }

    fn allocate(&self, id: u64, size: usize) -> Result<Arc<Request>, TransportError> {
        if size > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                requested: size,
                limit: self.max_payload,
            });
        }
        Ok(Request::new(
            id,
            ChannelKind::Port,
            MessageBuf::heap(PORT_PREFIX, size),
        ))
    }

    fn send(&mut self, request: &Arc<Request>) -> Result<(), SendError> {
        let msg = request.prefixed_bytes();
        let mut buf = vec![0u8; self.roundtrip_buf_len().max(msg.len())];
        buf[..msg.len()].copy_from_slice(&msg);

        let reply_len = self
            .backend
            .roundtrip(&mut buf, msg.len())
            .map_err(classify_send_error)?;

        if reply_len > buf.len() || reply_len < MSG_HEADER_LEN {
            return Err(SendError::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad port reply length: {} bytes", reply_len),
            )));
        }
        let header = MsgHeader::unpack(&buf[..MSG_HEADER_LEN]).map_err(SendError::Transport)?;
        if header.id != request.id() {
            return Err(SendError::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "port reply id {} does not match request {}",
                    header.id,
                    request.id()
                ),
            )));
        }
        if header.len as usize > reply_len - MSG_HEADER_LEN {
            return Err(SendError::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                "port reply shorter than its declared payload",
            )));
        }

        // Inline completion: Unsent straight to Completed, no Submitted hop.
        request.complete(
            ReplyStatus::from_wire(header.status),
            &buf[MSG_HEADER_LEN..MSG_HEADER_LEN + header.len as usize],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestState;

    /// Replies to every request with the payload reversed.
    struct ReverseBackend;

    impl PortBackend for ReverseBackend {
        fn roundtrip(&mut self, buf: &mut [u8], request_len: usize) -> io::Result<usize> {
            assert_eq!(&buf[..PORT_PREFIX.len()], PORT_PREFIX);
            let header = MsgHeader::unpack(&buf[PORT_PREFIX.len()..])?;
            let payload_at = PORT_PREFIX.len() + MSG_HEADER_LEN;
            assert_eq!(payload_at + header.len as usize, request_len);

            let mut payload = buf[payload_at..payload_at + header.len as usize].to_vec();
            payload.reverse();

            let reply = MsgHeader {
                id: header.id,
                status: 0,
                len: payload.len() as u32,
            };
            buf[..MSG_HEADER_LEN].copy_from_slice(&reply.pack());
            buf[MSG_HEADER_LEN..MSG_HEADER_LEN + payload.len()].copy_from_slice(&payload);
            Ok(MSG_HEADER_LEN + payload.len())
        }
    }

    struct InterruptedBackend;

    impl PortBackend for InterruptedBackend {
        fn roundtrip(&mut self, _buf: &mut [u8], _len: usize) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Interrupted, "signal"))
        }
    }

    #[test]
    fn test_open_cannot_fail_and_is_idempotent() {
        let mut channel = PortChannel::new(Box::new(ReverseBackend), 1024);
        assert_eq!(channel.status(), ChannelStatus::Uninitialized);

        channel.open().unwrap();
        assert_eq!(channel.status(), ChannelStatus::Connected);
        channel.open().unwrap();
        assert_eq!(channel.status(), ChannelStatus::Connected);

        channel.close();
        assert_eq!(channel.status(), ChannelStatus::NotConnected);
        channel.close();
        assert_eq!(channel.status(), ChannelStatus::NotConnected);
    }

    #[test]
    fn test_send_completes_inline() {
        let mut channel = PortChannel::new(Box::new(ReverseBackend), 1024);
        channel.open().unwrap();

        let req = channel.allocate(7, 64).unwrap();
        req.set_payload(b"abc").unwrap();
        req.advance(RequestState::Unsent);

        channel.send(&req).unwrap();
        assert_eq!(req.state(), RequestState::Completed);
        assert!(req.reply_status().is_success());
        assert_eq!(req.payload_bytes(), b"cba");
    }

    #[test]
    fn test_allocate_rejects_oversized_payload() {
        let channel = PortChannel::new(Box::new(ReverseBackend), 16);
        assert!(matches!(
            channel.allocate(1, 17),
            Err(TransportError::PayloadTooLarge {
                requested: 17,
                limit: 16
            })
        ));
    }

    #[test]
    fn test_interrupted_roundtrip_surfaces_as_interrupted() {
        let mut channel = PortChannel::new(Box::new(InterruptedBackend), 64);
        channel.open().unwrap();

        let req = channel.allocate(2, 8).unwrap();
        req.advance(RequestState::Unsent);
        assert!(matches!(channel.send(&req), Err(SendError::Interrupted)));
        // The request is untouched and could be retried by the caller.
        assert_eq!(req.state(), RequestState::Unsent);
    }
}
