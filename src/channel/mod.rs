//! Pluggable host channels.
//!
//! All message traffic flows through exactly one [`Channel`] at a time. The
//! three variants share a capability surface but differ in framing and in
//! when completion happens:
//!
//! - [`PortChannel`]: synchronous hypervisor call; `send` performs the whole
//!   roundtrip inline and the request completes before `send` returns.
//! - [`StreamChannel`]: connection-oriented socket (TCP, unix, vsock) with a
//!   dedicated receiver thread completing requests asynchronously.
//! - [`DatagramChannel`]: connectionless descriptor sends over donated pool
//!   memory; completion arrives through an event callback that may run in a
//!   restricted context.
//!
//! Channel status lives in a shared atomic cell so receiver threads and
//! callbacks can mark a channel `Dead` without taking the transport's channel
//! mutex; the transport reaps dead channels on the next send.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::TransportError;
use crate::request::Request;

mod datagram;
mod port;
mod stream;
mod tcp;
mod unix;
mod vsock;

pub use datagram::{DatagramBackend, DatagramChannel, DatagramEventSink, HostPushHandler};
pub use port::{PortBackend, PortChannel, PORT_PREFIX};
pub use stream::{StreamChannel, StreamConn, StreamConnector};
pub use tcp::TcpConnector;
pub use unix::UnixConnector;
#[cfg(target_os = "linux")]
pub use vsock::VsockConnector;
pub use vsock::{HOST_CID, LOCAL_CID};

/// The channel variants, in fixed failover preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Datagram,
    Stream,
    Port,
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStatus {
    Uninitialized = 0,
    NotConnected = 1,
    Connected = 2,
    Dead = 3,
}

impl ChannelStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::NotConnected,
            2 => Self::Connected,
            _ => Self::Dead,
        }
    }
}

/// Shared channel status cell. The owning channel and its receiver path each
/// hold an `Arc`; any side may flip it to `Dead`.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(initial: ChannelStatus) -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(initial as u8)))
    }

    pub(crate) fn get(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: ChannelStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Send failure classification driving the transport's failover loop.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Caller-level interruption before the message was handed off.
    /// Propagates to the caller without retry or channel-state change.
    #[error("send interrupted")]
    Interrupted,

    /// The channel can no longer carry traffic; the transport marks it dead
    /// and fails over.
    #[error("channel transport error: {0}")]
    Transport(io::Error),
}

/// Map a backend I/O failure onto the transient-vs-fatal split.
pub(crate) fn classify_send_error(err: io::Error) -> SendError {
    if err.kind() == io::ErrorKind::Interrupted {
        SendError::Interrupted
    } else {
        SendError::Transport(err)
    }
}

/// Capability surface shared by the three channel variants.
pub trait Channel: Send {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ChannelKind;

    fn status(&self) -> ChannelStatus;

    /// Establish the channel. A no-op returning `Ok` when already
    /// `Connected`.
    fn open(&mut self) -> io::Result<()>;

    /// Tear the channel down and return it to `NotConnected`. Idempotent;
    /// joins any receiver the channel started.
    fn close(&mut self);

    /// Condemn the channel after a fatal send failure. The transport reaps
    /// dead channels (close plus pending flush) before picking a successor.
    fn mark_dead(&self);

    /// Allocate a request buffer laid out for this channel, sized for a
    /// `size`-byte operation payload.
    fn allocate(&self, id: u64, size: usize) -> Result<Arc<Request>, TransportError>;

    /// Dispatch a request. On success the request is `Submitted` (or already
    /// `Completed` for the inline port variant).
    fn send(&mut self, request: &Arc<Request>) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_shared_between_holders() {
        let cell = StatusCell::new(ChannelStatus::NotConnected);
        let other = Arc::clone(&cell);

        cell.set(ChannelStatus::Connected);
        assert_eq!(other.get(), ChannelStatus::Connected);

        other.set(ChannelStatus::Dead);
        assert_eq!(cell.get(), ChannelStatus::Dead);
    }

    #[test]
    fn test_interrupted_errors_classify_as_interrupted() {
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(matches!(
            classify_send_error(interrupted),
            SendError::Interrupted
        ));

        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            classify_send_error(broken),
            SendError::Transport(_)
        ));
    }
}
