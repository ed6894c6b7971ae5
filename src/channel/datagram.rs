//! Zero-copy datagram channel.
//!
//! At open the channel donates a pool of memory regions to the host and
//! registers an event sink. A send never copies the request: it submits a
//! datagram listing `(region, offset, len)` descriptors, the host reads the
//! request out of the donated regions, writes the reply back into the same
//! regions, and delivers a completion event carrying only id, status, and
//! length. The sink may be invoked from a restricted context, so everything
//! it does is brief and non-blocking: an index lookup, an in-place
//! completion, a pool grow, or a handler dispatch.

use std::io;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::{
    classify_send_error, Channel, ChannelKind, ChannelStatus, SendError, StatusCell,
};
use crate::error::{ReplyStatus, TransportError};
use crate::pool::PagePool;
use crate::protocol::{DatagramEvent, DatagramMsg, MSG_HEADER_LEN};
use crate::request::{MessageBuf, Request, RequestState};
use crate::transport::PendingIndex;

/// Best-effort receiver for unsolicited host-pushed messages.
pub type HostPushHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// The connectionless delivery mechanism supplied by the host environment.
///
/// `open` registers the event sink and receives the donated pool handle;
/// after `close` returns, no further events may be delivered. `send` must
/// never block: it either queues the datagram or fails.
pub trait DatagramBackend: Send + Sync {
    fn open(&self, sink: DatagramEventSink, pool: Arc<PagePool>) -> io::Result<()>;

    fn send(&self, msg: &[u8]) -> io::Result<()>;

    fn close(&self);
}

/// Callback handle the backend invokes for each host notification.
#[derive(Clone)]
pub struct DatagramEventSink {
    pending: Arc<PendingIndex>,
    pool: Arc<PagePool>,
    backend: Weak<dyn DatagramBackend>,
    host_push: Option<HostPushHandler>,
}

impl DatagramEventSink {
    /// Deliver one host event. Safe to call from any context; never blocks
    /// beyond brief internal locks.
    pub fn deliver(&self, event: DatagramEvent) {
        match event {
            DatagramEvent::Complete { id, status, len } => match self.pending.get(id) {
                Some(req) => {
                    req.complete_in_place(ReplyStatus::from_wire(status), len as usize);
                    debug!(target: "volume-link::datagram", id, len, "completion delivered");
                }
                None => {
                    debug!(target: "volume-link::datagram", id, "completion for unknown id, dropped");
                }
            },
            DatagramEvent::Replenish { count } => {
                let added = self.pool.grow(count as usize);
                if added.is_empty() {
                    warn!(target: "volume-link::datagram", asked = count, "replenish refused, pool at cap");
                    return;
                }
                let backend = match self.backend.upgrade() {
                    Some(b) => b,
                    None => return,
                };
                let donation = DatagramMsg::Donate { regions: added };
                match donation.encode() {
                    Ok(bytes) => {
                        if let Err(e) = backend.send(&bytes) {
                            warn!(target: "volume-link::datagram", error = %e, "replenish donation send failed");
                        }
                    }
                    Err(e) => {
                        warn!(target: "volume-link::datagram", error = %e, "replenish donation encode failed");
                    }
                }
            }
            DatagramEvent::HostPush { payload } => match &self.host_push {
                Some(handler) => handler(payload),
                None => {
                    debug!(
                        target: "volume-link::datagram",
                        len = payload.len(),
                        "host push with no handler registered, dropped"
                    );
                }
            },
        }
    }
}

pub struct DatagramChannel {
    backend: Arc<dyn DatagramBackend>,
    pending: Arc<PendingIndex>,
    status: Arc<StatusCell>,
    pool: Option<Arc<PagePool>>,
    pool_regions: usize,
    max_pool_regions: usize,
    region_size: usize,
    host_push: Option<HostPushHandler>,
}

impl DatagramChannel {
    pub(crate) fn new(
        backend: Arc<dyn DatagramBackend>,
        pending: Arc<PendingIndex>,
        pool_regions: usize,
        max_pool_regions: usize,
        region_size: usize,
        host_push: Option<HostPushHandler>,
    ) -> Self {
        Self {
            backend,
            pending,
            status: StatusCell::new(ChannelStatus::Uninitialized),
            pool: None,
            pool_regions,
            max_pool_regions,
            region_size,
            host_push,
        }
    }

    fn max_payload(&self) -> usize {
        self.region_size - MSG_HEADER_LEN
    }
}

impl Channel for DatagramChannel {
    fn name(&self) -> &'static str {
        "datagram"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Datagram
    }

    fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    fn open(&mut self) -> io::Result<()> {
        if self.status.get() == ChannelStatus::Connected {
            return Ok(());
        }

        let pool = PagePool::new(self.pool_regions, self.region_size, self.max_pool_regions);
        let sink = DatagramEventSink {
            pending: Arc::clone(&self.pending),
            pool: Arc::clone(&pool),
            backend: Arc::downgrade(&self.backend),
            host_push: self.host_push.clone(),
        };
        self.backend.open(sink, Arc::clone(&pool))?;

        // Announce the donated regions before any request can reference them.
        let donation = DatagramMsg::Donate {
            regions: pool.descriptors(),
        }
        .encode()?;
        if let Err(e) = self.backend.send(&donation) {
            self.backend.close();
            return Err(e);
        }

        info!(
            target: "volume-link::datagram",
            regions = self.pool_regions,
            region_size = self.region_size,
            "datagram channel opened, pool donated"
        );
        self.pool = Some(pool);
        self.status.set(ChannelStatus::Connected);
        Ok(())
    }

    fn close(&mut self) {
        self.status.set(ChannelStatus::NotConnected);
        self.backend.close();
        // Dropping the handles revokes the donation once the backend lets
        // go of its clone as well.
        self.pool = None;
    }

    fn mark_dead(&self) {
        self.status.set(ChannelStatus::Dead);
    }

    fn allocate(&self, id: u64, size: usize) -> Result<Arc<Request>, TransportError> {
        if size > self.max_payload() {
            return Err(TransportError::PayloadTooLarge {
                requested: size,
                limit: self.max_payload(),
            });
        }
        let pool = self.pool.as_ref().ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "datagram channel has no pool",
            ))
        })?;
        let buf = pool
            .alloc()
            .ok_or(TransportError::OutOfMemory { requested: size })?;
        Ok(Request::new(id, ChannelKind::Datagram, MessageBuf::pooled(buf)))
    }

    fn send(&mut self, request: &Arc<Request>) -> Result<(), SendError> {
        let segments = request.descriptors().ok_or_else(|| {
            SendError::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request buffer is not pool-backed",
            ))
        })?;

        let msg = DatagramMsg::Request {
            id: request.id(),
            segments,
        }
        .encode()
        .map_err(SendError::Transport)?;

        self.backend.send(&msg).map_err(classify_send_error)?;

        request.advance(RequestState::Submitted);
        debug!(target: "volume-link::datagram", id = request.id(), "request submitted");
        Ok(())
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        self.close();
    }
}
