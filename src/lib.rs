//! Guest-side transport for a host–guest filesystem client.
//!
//! `volume-link` carries opaque filesystem messages between guest callers and
//! the host, multiplexed over whichever channel the host environment
//! currently offers:
//!
//! - **Protocol**: stream framing and datagram envelopes, correlated by
//!   request id
//! - **Channels**: synchronous hypervisor port, stream sockets (TCP, unix,
//!   vsock), and zero-copy datagrams over donated pool memory
//! - **Transport**: pending-request index, fixed channel preference, and
//!   automatic failover that flushes requests stranded on a dead channel
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use volume_link::{Transport, VsockConnector, HOST_CID};
//!
//! let transport = Transport::builder()
//!     .stream(Box::new(VsockConnector::new(HOST_CID, 2000)))
//!     .port(Box::new(hypervisor_port))
//!     .build()?;
//!
//! let request = transport.allocate_request(4096)?;
//! request.set_payload(&encoded_operation)?;
//! transport.send_request(&request)?;
//! let reply = request.payload_bytes();
//! ```
//!
//! Callers never pick a channel: the transport prefers datagram over stream
//! over port, reroutes in-flight allocation when the active channel changes,
//! and falls back to the synchronous port when nothing better is reachable.

pub mod channel;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod transport;

#[cfg(target_os = "linux")]
pub use channel::VsockConnector;
pub use channel::{
    Channel, ChannelKind, ChannelStatus, DatagramBackend, DatagramChannel, DatagramEventSink,
    HostPushHandler, PortBackend, PortChannel, SendError, StreamChannel, StreamConn,
    StreamConnector, TcpConnector, UnixConnector, HOST_CID, LOCAL_CID, PORT_PREFIX,
};
pub use config::TransportConfig;
pub use error::{ReplyStatus, TransportError};
pub use pool::{PagePool, PoolBuf, Region};
pub use protocol::{
    DatagramEvent, DatagramMsg, MsgHeader, RegionDescriptor, SgDescriptor, SockHeader,
    MAX_MESSAGE_SIZE, MSG_HEADER_LEN, SOCK_HEADER_LEN, WIRE_VERSION,
};
pub use request::{Request, RequestState};
pub use transport::{Transport, TransportBuilder};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::channel::{ChannelKind, ChannelStatus};
    pub use crate::config::TransportConfig;
    pub use crate::error::{ReplyStatus, TransportError};
    pub use crate::request::{Request, RequestState};
    pub use crate::transport::Transport;
}
