//! Channel orchestration and request dispatch.
//!
//! A [`Transport`] owns every configured channel but routes all traffic
//! through one active channel at a time, preferring datagram over stream over
//! port. Callers allocate a request, fill its payload, and hand it to
//! [`Transport::send_request`], which blocks until the host replies or the
//! request is failed by a channel flush.
//!
//! Failover is driven entirely from the send path: a fatal send error marks
//! the active channel dead, and the next iteration reaps it (close, then fail
//! every request still submitted on it) and walks the remaining candidates in
//! preference order. Each channel kind is dispatched to at most once per
//! call, so a send touches a bounded number of channels before giving up.
//!
//! Buffers are channel-specific, so moving a request to a different channel
//! allocates a fresh buffer under the same correlation id, copies the payload
//! across, and swaps the pending entry; when the copy completes, the reply is
//! copied back into the caller's original request.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::channel::{
    Channel, ChannelKind, ChannelStatus, DatagramBackend, DatagramChannel, HostPushHandler,
    PortBackend, PortChannel, SendError, StreamChannel, StreamConnector,
};
use crate::config::TransportConfig;
use crate::error::{ReplyStatus, TransportError};
use crate::protocol::MSG_HEADER_LEN;
use crate::request::{Request, RequestState};

/// In-flight request index keyed by correlation id.
///
/// Receiver paths look up entries by id and complete them without removing
/// them; the dispatching caller removes its own entry after its wait ends.
/// The map is sharded, so lookups from the stream receiver thread and the
/// datagram callback never contend with the transport's channel mutex.
pub(crate) struct PendingIndex {
    map: DashMap<u64, Arc<Request>>,
}

impl PendingIndex {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, request: &Arc<Request>) {
        self.map.insert(request.id(), Arc::clone(request));
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<Request>> {
        self.map.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Request>> {
        self.map.remove(&id).map(|(_, request)| request)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Remove every request that is `Submitted` on `owner`'s buffers.
    ///
    /// The state is re-checked under the removal lock, so a request whose
    /// reply lands concurrently stays owned by its waiter and keeps that
    /// reply.
    pub(crate) fn drain_submitted(&self, owner: ChannelKind) -> Vec<Arc<Request>> {
        let ids: Vec<u64> = self
            .map
            .iter()
            .filter(|entry| {
                entry.value().owner() == owner
                    && entry.value().state() == RequestState::Submitted
            })
            .map(|entry| *entry.key())
            .collect();

        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            let removed = self.map.remove_if(&id, |_, request| {
                request.owner() == owner && request.state() == RequestState::Submitted
            });
            if let Some((_, request)) = removed {
                drained.push(request);
            }
        }
        drained
    }

    /// Remove every submitted request regardless of owner. Shutdown only.
    pub(crate) fn drain_all_submitted(&self) -> Vec<Arc<Request>> {
        let ids: Vec<u64> = self
            .map
            .iter()
            .filter(|entry| entry.value().state() == RequestState::Submitted)
            .map(|entry| *entry.key())
            .collect();

        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            let removed = self
                .map
                .remove_if(&id, |_, request| request.state() == RequestState::Submitted);
            if let Some((_, request)) = removed {
                drained.push(request);
            }
        }
        drained
    }
}

struct ChannelSet {
    /// Configured channels in failover preference order.
    channels: Vec<Box<dyn Channel>>,
    active: Option<usize>,
}

/// The guest-side transport: all configured channels, the pending index, and
/// the correlation id counter.
pub struct Transport {
    channels: Mutex<ChannelSet>,
    pending: Arc<PendingIndex>,
    next_id: AtomicU64,
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    /// Allocate a request sized for a `size`-byte operation payload, laid
    /// out for the currently active channel (selecting one if necessary).
    ///
    /// Correlation ids increase monotonically and wrap after `u64::MAX`
    /// allocations; a collision with a request still pending from before the
    /// wrap is a known, accepted limitation.
    pub fn allocate_request(&self, size: usize) -> Result<Arc<Request>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut set = self.channels.lock().unwrap();
        let mut tried = Vec::new();
        let idx = self
            .ensure_active(&mut set, &mut tried)
            .ok_or(TransportError::ConnectionFailed)?;
        set.channels[idx].allocate(id, size)
    }

    /// Dispatch `request` and block until it completes, failing over across
    /// channels as needed. On `Ok` the reply payload is in the request
    /// buffer; a non-success completion surfaces as
    /// [`TransportError::RequestFailed`].
    pub fn send_request(&self, request: &Arc<Request>) -> Result<(), TransportError> {
        if !request.advance(RequestState::Unsent) && request.state() != RequestState::Unsent {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request was already dispatched",
            )));
        }

        // `current` is the buffer actually traveling; it diverges from the
        // caller's request only after a cross-channel copy.
        let mut current = Arc::clone(request);
        {
            let mut set = self.channels.lock().unwrap();
            self.pending.insert(request);

            let mut tried: Vec<ChannelKind> = Vec::new();
            loop {
                let idx = match self.ensure_active(&mut set, &mut tried) {
                    Some(idx) => idx,
                    None => {
                        self.pending.remove(current.id());
                        warn!(
                            target: "volume-link::transport",
                            id = current.id(),
                            "no channel available"
                        );
                        return Err(TransportError::ConnectionFailed);
                    }
                };

                let kind = set.channels[idx].kind();
                if current.owner() != kind {
                    current = match self.reallocate(set.channels[idx].as_ref(), &current) {
                        Ok(copy) => copy,
                        Err(e) => {
                            self.pending.remove(current.id());
                            return Err(e);
                        }
                    };
                }

                match set.channels[idx].send(&current) {
                    Ok(()) => break,
                    Err(SendError::Interrupted) => {
                        // Never dispatched; undo the insert and hand the
                        // untouched request back for a caller retry.
                        self.pending.remove(current.id());
                        debug!(
                            target: "volume-link::transport",
                            id = current.id(),
                            "send interrupted before dispatch"
                        );
                        return Err(TransportError::Interrupted);
                    }
                    Err(SendError::Transport(e)) => {
                        warn!(
                            target: "volume-link::transport",
                            channel = set.channels[idx].name(),
                            id = current.id(),
                            error = %e,
                            "send failed, failing over"
                        );
                        if !tried.contains(&kind) {
                            tried.push(kind);
                        }
                        set.channels[idx].mark_dead();
                    }
                }
            }
        }

        current.wait();
        self.pending.remove(current.id());

        // A copy traveled in the original's place; bring the reply home.
        if !Arc::ptr_eq(&current, request) {
            request.complete(current.reply_status(), &current.flattened_payload());
        }

        let status = request.reply_status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::RequestFailed(status))
        }
    }

    /// Requests currently in the pending index.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Close every channel and fail anything still in flight.
    pub fn shutdown(&self) {
        // Drop runs this during unwinds; a poisoned lock must not panic here.
        let mut set = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.active = None;
        for channel in set.channels.iter_mut() {
            channel.close();
        }

        let stranded = self.pending.drain_all_submitted();
        if !stranded.is_empty() {
            warn!(
                target: "volume-link::transport",
                count = stranded.len(),
                "shutdown with requests in flight"
            );
        }
        for request in stranded {
            request.fail(ReplyStatus::IoError);
        }
        info!(target: "volume-link::transport", "transport shut down");
    }

    /// Return a connected channel to dispatch on, reaping a dead active
    /// channel and walking the candidates in preference order. `tried`
    /// carries the kinds already dispatched to in this call; each is
    /// attempted at most once.
    fn ensure_active(&self, set: &mut ChannelSet, tried: &mut Vec<ChannelKind>) -> Option<usize> {
        if let Some(idx) = set.active {
            match set.channels[idx].status() {
                ChannelStatus::Connected => return Some(idx),
                ChannelStatus::Dead => self.reap(set, idx),
                _ => set.active = None,
            }
        }

        for idx in 0..set.channels.len() {
            let kind = set.channels[idx].kind();
            if tried.contains(&kind) || set.channels[idx].status() == ChannelStatus::Dead {
                continue;
            }
            tried.push(kind);
            match set.channels[idx].open() {
                Ok(()) => {
                    info!(
                        target: "volume-link::transport",
                        channel = set.channels[idx].name(),
                        "channel selected"
                    );
                    set.active = Some(idx);
                    return Some(idx);
                }
                Err(e) => {
                    warn!(
                        target: "volume-link::transport",
                        channel = set.channels[idx].name(),
                        error = %e,
                        "channel open failed"
                    );
                }
            }
        }
        None
    }

    /// Close a dead channel and fail every request still submitted on it.
    /// Completion is idempotent, so a reply racing the flush costs nothing:
    /// whichever side claims the request first wins.
    fn reap(&self, set: &mut ChannelSet, idx: usize) {
        let name = set.channels[idx].name();
        let kind = set.channels[idx].kind();
        info!(target: "volume-link::transport", channel = name, "reaping dead channel");

        set.channels[idx].close();
        if set.active == Some(idx) {
            set.active = None;
        }

        let orphans = self.pending.drain_submitted(kind);
        if !orphans.is_empty() {
            warn!(
                target: "volume-link::transport",
                channel = name,
                count = orphans.len(),
                "failing requests stranded on dead channel"
            );
        }
        for request in orphans {
            request.fail(ReplyStatus::IoError);
        }
    }

    /// Allocate a same-id buffer on `channel` and move the payload across.
    fn reallocate(
        &self,
        channel: &dyn Channel,
        current: &Arc<Request>,
    ) -> Result<Arc<Request>, TransportError> {
        let payload = current.flattened_payload();
        let size = current.capacity().max(payload.len());
        let copy = channel.allocate(current.id(), size)?;
        copy.set_payload(&payload)?;
        copy.advance(RequestState::Unsent);

        self.pending.remove(current.id());
        self.pending.insert(&copy);
        debug!(
            target: "volume-link::transport",
            id = current.id(),
            channel = channel.name(),
            "request copied to new channel's buffer"
        );
        Ok(copy)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Assembles a [`Transport`] from the channel backends the host environment
/// provides. The port backend is mandatory; it is the always-available
/// fallback the failover walk ends on.
pub struct TransportBuilder {
    config: TransportConfig,
    datagram: Option<Arc<dyn DatagramBackend>>,
    stream: Option<Box<dyn StreamConnector>>,
    port: Option<Box<dyn PortBackend>>,
    host_push: Option<HostPushHandler>,
}

impl TransportBuilder {
    fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            datagram: None,
            stream: None,
            port: None,
            host_push: None,
        }
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable the zero-copy datagram channel.
    pub fn datagram(mut self, backend: Arc<dyn DatagramBackend>) -> Self {
        self.datagram = Some(backend);
        self
    }

    /// Enable the stream-socket channel.
    pub fn stream(mut self, connector: Box<dyn StreamConnector>) -> Self {
        self.stream = Some(connector);
        self
    }

    /// Supply the mandatory synchronous port backend.
    pub fn port(mut self, backend: Box<dyn PortBackend>) -> Self {
        self.port = Some(backend);
        self
    }

    /// Receive unsolicited host-pushed messages from the datagram channel.
    pub fn on_host_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.host_push = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Transport, TransportError> {
        let port = self.port.ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a port backend is required as the fallback channel",
            ))
        })?;

        let pending = Arc::new(PendingIndex::new());
        let mut channels: Vec<Box<dyn Channel>> = Vec::new();

        if let Some(backend) = self.datagram {
            if self.config.region_size <= MSG_HEADER_LEN {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "region_size {} cannot hold the {}-byte message header",
                        self.config.region_size, MSG_HEADER_LEN
                    ),
                )));
            }
            channels.push(Box::new(DatagramChannel::new(
                backend,
                Arc::clone(&pending),
                self.config.pool_regions,
                self.config.max_pool_regions,
                self.config.region_size,
                self.host_push.clone(),
            )));
        }
        if let Some(connector) = self.stream {
            channels.push(Box::new(StreamChannel::new(
                connector,
                Arc::clone(&pending),
                self.config.write_retry_delay,
            )));
        }
        channels.push(Box::new(PortChannel::new(port, self.config.port_max_payload)));

        info!(
            target: "volume-link::transport",
            channels = channels.len(),
            "transport ready"
        );
        Ok(Transport {
            channels: Mutex::new(ChannelSet {
                channels,
                active: None,
            }),
            pending,
            next_id: AtomicU64::new(1),
        })
    }
}
