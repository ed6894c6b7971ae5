//! Reference-counted in-flight requests.
//!
//! Every message exchanged with the host travels inside a [`Request`]: an
//! `Arc`-shared object holding the message buffer, a forward-only lifecycle
//! state, and the one-shot signal the sending caller blocks on. The buffer
//! layout is channel-specific and fixed at allocation:
//!
//! ```text
//! +----------------+------------------+-------------------+
//! | channel prefix | message header   | operation region  |
//! | (0..n bytes)   | (16 bytes)       | (capacity bytes)  |
//! +----------------+------------------+-------------------+
//! ```
//!
//! Port-channel buffers carry a service-selector prefix; stream and datagram
//! buffers have none. Datagram buffers live in a donated pool region so the
//! host can write the reply in place; large transfers attach extra pool
//! regions as scatter-gather segments instead of copying into one buffer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::channel::ChannelKind;
use crate::error::{ReplyStatus, TransportError};
use crate::pool::PoolBuf;
use crate::protocol::{MsgHeader, SgDescriptor, MSG_HEADER_LEN};

/// Lifecycle of a request. Transitions only move forward; skipping states is
/// allowed (the port channel completes without ever being `Submitted`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestState {
    Allocated = 0,
    Unsent = 1,
    Submitted = 2,
    Completed = 3,
}

impl RequestState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Allocated,
            1 => Self::Unsent,
            2 => Self::Submitted,
            _ => Self::Completed,
        }
    }
}

enum Storage {
    Heap(Vec<u8>),
    Pooled(PoolBuf),
}

impl Storage {
    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Storage::Heap(bytes) => f(bytes),
            Storage::Pooled(buf) => buf.region().with_bytes(|bytes| f(bytes)),
        }
    }

    fn with_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self {
            Storage::Heap(bytes) => f(bytes),
            Storage::Pooled(buf) => buf.region().with_bytes(f),
        }
    }

    fn region_id(&self) -> Option<u32> {
        match self {
            Storage::Heap(_) => None,
            Storage::Pooled(buf) => Some(buf.region_id()),
        }
    }
}

/// One attached scatter-gather segment: a pool region owned for the life of
/// the request plus the number of valid bytes in it.
struct SgSegment {
    buf: PoolBuf,
    len: usize,
}

impl SgSegment {
    fn descriptor(&self) -> SgDescriptor {
        SgDescriptor {
            region: self.buf.region_id(),
            offset: 0,
            len: self.len as u32,
        }
    }
}

/// Channel-specific message buffer. All byte access goes through the owning
/// [`Request`]'s mutex; pooled storage additionally locks the region so the
/// completion callback and the guest side never interleave writes.
pub struct MessageBuf {
    storage: Storage,
    prefix_len: usize,
    capacity: usize,
    payload_len: usize,
    segments: Vec<SgSegment>,
}

impl MessageBuf {
    /// Heap-backed buffer with a channel prefix and a zeroed operation region.
    pub(crate) fn heap(prefix: &[u8], capacity: usize) -> Self {
        let mut bytes = vec![0u8; prefix.len() + MSG_HEADER_LEN + capacity];
        bytes[..prefix.len()].copy_from_slice(prefix);
        Self {
            storage: Storage::Heap(bytes),
            prefix_len: prefix.len(),
            capacity,
            payload_len: 0,
            segments: Vec::new(),
        }
    }

    /// Pool-backed buffer occupying a whole donated region, prefix-free.
    /// Regions are recycled, so the buffer is re-zeroed here.
    pub(crate) fn pooled(buf: PoolBuf) -> Self {
        let capacity = buf.len() - MSG_HEADER_LEN;
        buf.region().with_bytes(|bytes| bytes.fill(0));
        Self {
            storage: Storage::Pooled(buf),
            prefix_len: 0,
            capacity,
            payload_len: 0,
            segments: Vec::new(),
        }
    }

    fn header_offset(&self) -> usize {
        self.prefix_len
    }

    fn op_offset(&self) -> usize {
        self.prefix_len + MSG_HEADER_LEN
    }

    fn write_header(&mut self, header: &MsgHeader) {
        let off = self.header_offset();
        let packed = header.pack();
        self.storage
            .with_mut(|bytes| bytes[off..off + MSG_HEADER_LEN].copy_from_slice(&packed));
    }

    fn header(&self) -> MsgHeader {
        let off = self.header_offset();
        self.storage.with(|bytes| {
            let mut raw = [0u8; MSG_HEADER_LEN];
            raw.copy_from_slice(&bytes[off..off + MSG_HEADER_LEN]);
            MsgHeader::unpack_exact(&raw)
        })
    }

    fn set_payload(&mut self, id: u64, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.capacity {
            return Err(TransportError::PayloadTooLarge {
                requested: data.len(),
                limit: self.capacity,
            });
        }
        let off = self.op_offset();
        self.storage
            .with_mut(|bytes| bytes[off..off + data.len()].copy_from_slice(data));
        self.payload_len = data.len();
        self.write_header(&MsgHeader::request(id, data.len() as u32));
        Ok(())
    }

    fn append(&mut self, id: u64, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        let op_off = self.op_offset();
        let used = self.payload_len;
        let capacity = self.capacity;
        match &mut self.storage {
            Storage::Heap(bytes) => {
                let end = used + data.len();
                if end > capacity {
                    return Err(TransportError::PayloadTooLarge {
                        requested: end,
                        limit: capacity,
                    });
                }
                bytes[op_off + used..op_off + end].copy_from_slice(data);
                self.payload_len = end;
            }
            Storage::Pooled(buf) => {
                let pool = Arc::clone(buf.pool());
                let mut added = Vec::new();
                for chunk in data.chunks(pool.region_size()) {
                    let seg = pool.alloc().ok_or(TransportError::OutOfMemory {
                        requested: chunk.len(),
                    })?;
                    seg.region()
                        .with_bytes(|bytes| bytes[..chunk.len()].copy_from_slice(chunk));
                    added.push(SgSegment {
                        buf: seg,
                        len: chunk.len(),
                    });
                }
                self.segments.extend(added);
            }
        }
        self.write_header(&MsgHeader::request(id, self.payload_len as u32));
        Ok(())
    }

    /// Store a received reply: header, then payload into the operation
    /// region, spilling overflow into the attached segments in order.
    /// Returns how many payload bytes found room.
    fn store_reply(&mut self, id: u64, status: ReplyStatus, payload: &[u8]) -> usize {
        self.write_header(&MsgHeader {
            id,
            status: status.to_wire(),
            len: payload.len() as u32,
        });
        let op_off = self.op_offset();
        let head = payload.len().min(self.capacity);
        self.storage
            .with_mut(|bytes| bytes[op_off..op_off + head].copy_from_slice(&payload[..head]));
        self.payload_len = head;

        let mut rest = &payload[head..];
        for seg in self.segments.iter_mut() {
            let take = rest.len().min(seg.buf.len());
            if take > 0 {
                seg.buf
                    .region()
                    .with_bytes(|bytes| bytes[..take].copy_from_slice(&rest[..take]));
            }
            seg.len = take;
            rest = &rest[take..];
        }
        payload.len() - rest.len()
    }

    /// Bookkeeping twin of [`store_reply`](Self::store_reply) for replies the
    /// host already wrote into the pooled regions. Returns the declared bytes
    /// that exceed the buffer and its segments.
    fn note_reply_in_place(&mut self, id: u64, status: ReplyStatus, len: usize) -> usize {
        self.write_header(&MsgHeader {
            id,
            status: status.to_wire(),
            len: len as u32,
        });
        let head = len.min(self.capacity);
        self.payload_len = head;

        let mut rest = len - head;
        for seg in self.segments.iter_mut() {
            let take = rest.min(seg.buf.len());
            seg.len = take;
            rest -= take;
        }
        rest
    }

    fn payload_bytes(&self) -> Vec<u8> {
        let off = self.op_offset();
        self.storage
            .with(|bytes| bytes[off..off + self.payload_len].to_vec())
    }

    fn flattened_payload(&self) -> Vec<u8> {
        let mut out = self.payload_bytes();
        for seg in &self.segments {
            seg.buf
                .region()
                .with_bytes(|bytes| out.extend_from_slice(&bytes[..seg.len]));
        }
        out
    }

    fn message_bytes(&self) -> Vec<u8> {
        let off = self.header_offset();
        let len = MSG_HEADER_LEN + self.payload_len;
        self.storage.with(|bytes| bytes[off..off + len].to_vec())
    }

    fn prefixed_bytes(&self) -> Vec<u8> {
        let len = self.prefix_len + MSG_HEADER_LEN + self.payload_len;
        self.storage.with(|bytes| bytes[..len].to_vec())
    }

    fn descriptors(&self) -> Option<Vec<SgDescriptor>> {
        let region = self.storage.region_id()?;
        let mut list = Vec::with_capacity(1 + self.segments.len());
        list.push(SgDescriptor {
            region,
            offset: 0,
            len: (MSG_HEADER_LEN + self.payload_len) as u32,
        });
        list.extend(self.segments.iter().map(|seg| seg.descriptor()));
        Some(list)
    }
}

/// A single in-flight request. Shared as `Arc<Request>` between the caller,
/// the pending index, and whichever receiver path completes it; the buffer
/// is freed (pool regions returned) when the last holder drops its clone.
pub struct Request {
    id: u64,
    owner: ChannelKind,
    state: AtomicU8,
    buf: Mutex<MessageBuf>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl Request {
    pub(crate) fn new(id: u64, owner: ChannelKind, buf: MessageBuf) -> Arc<Self> {
        let (done_tx, done_rx) = bounded(1);
        let req = Self {
            id,
            owner,
            state: AtomicU8::new(RequestState::Allocated as u8),
            buf: Mutex::new(buf),
            done_tx,
            done_rx,
        };
        // Stamp a valid zero-length request header so the buffer is
        // well-formed even if the caller never sets a payload.
        req.buf
            .lock()
            .unwrap()
            .write_header(&MsgHeader::request(id, 0));
        Arc::new(req)
    }

    /// Correlation id replies are matched on.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The channel variant whose allocator produced this buffer.
    pub fn owner(&self) -> ChannelKind {
        self.owner
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move the lifecycle forward to `to`. Returns `false` (and changes
    /// nothing) if the request already reached `to` or a later state.
    pub(crate) fn advance(&self, to: RequestState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    /// Copy `data` into the operation region, replacing any prior payload.
    pub fn set_payload(&self, data: &[u8]) -> Result<(), TransportError> {
        self.buf.lock().unwrap().set_payload(self.id, data)
    }

    /// Attach more payload. On pool-backed buffers this allocates fresh
    /// regions as scatter-gather segments instead of copying into the
    /// operation region; on heap buffers it extends the payload in place.
    pub fn append(&self, data: &[u8]) -> Result<(), TransportError> {
        self.buf.lock().unwrap().append(self.id, data)
    }

    /// Operation-region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.lock().unwrap().capacity
    }

    /// Valid bytes currently in the operation region.
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.buf.lock().unwrap().payload_bytes()
    }

    /// Operation-region bytes followed by every segment's bytes.
    pub fn flattened_payload(&self) -> Vec<u8> {
        self.buf.lock().unwrap().flattened_payload()
    }

    /// Completion status recorded in the buffer header.
    pub fn reply_status(&self) -> ReplyStatus {
        ReplyStatus::from_wire(self.buf.lock().unwrap().header().status)
    }

    /// Payload length the completing side declared.
    pub fn reply_len(&self) -> usize {
        self.buf.lock().unwrap().header().len as usize
    }

    pub(crate) fn message_bytes(&self) -> Vec<u8> {
        self.buf.lock().unwrap().message_bytes()
    }

    pub(crate) fn prefixed_bytes(&self) -> Vec<u8> {
        self.buf.lock().unwrap().prefixed_bytes()
    }

    pub(crate) fn descriptors(&self) -> Option<Vec<SgDescriptor>> {
        self.buf.lock().unwrap().descriptors()
    }

    /// Complete with a received reply. Exactly one completion wins; later
    /// calls (a racing flush, a duplicate reply) change nothing.
    pub fn complete(&self, status: ReplyStatus, payload: &[u8]) {
        if !self.advance(RequestState::Completed) {
            return;
        }
        let truncated = {
            let mut buf = self.buf.lock().unwrap();
            payload.len() - buf.store_reply(self.id, status, payload)
        };
        if truncated > 0 {
            debug!(
                target: "volume-link::request",
                id = self.id,
                truncated,
                "reply larger than request buffer"
            );
        }
        let _ = self.done_tx.try_send(());
    }

    /// Complete a reply the host already placed into the pooled regions.
    /// Never copies and never blocks, so it is callable from the datagram
    /// event callback.
    pub fn complete_in_place(&self, status: ReplyStatus, len: usize) {
        if !self.advance(RequestState::Completed) {
            return;
        }
        let truncated = self
            .buf
            .lock()
            .unwrap()
            .note_reply_in_place(self.id, status, len);
        if truncated > 0 {
            debug!(
                target: "volume-link::request",
                id = self.id,
                truncated,
                "reply larger than request buffer"
            );
        }
        let _ = self.done_tx.try_send(());
    }

    /// Synthesize a header-only reply carrying `status`, then behave exactly
    /// as a normal completion. Used for flush-on-dead and receive failures.
    pub fn fail(&self, status: ReplyStatus) {
        self.complete(status, &[]);
    }

    /// Block until a completion signal arrives. No timeout: once dispatched,
    /// a request resolves only by reply or by channel-failure flush.
    pub(crate) fn wait(&self) {
        // The sender half lives in this struct, so recv cannot disconnect.
        let _ = self.done_rx.recv();
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}
