//! Stream-socket channel.
//!
//! One connection, one dedicated receiver thread. `send` frames the message
//! and writes it inline (with bounded backoff when the socket is full), then
//! returns with the request `Submitted`; the receiver thread matches replies
//! to pending requests by correlation id and completes them.
//!
//! The receiver runs a small framing state machine per reply: transport
//! header, then message header, then payload. Replies whose id matches no
//! pending request are drained so the byte stream stays in sync. Any
//! unrecoverable receive error marks the channel `Dead`; the transport reaps
//! it (close plus flush of its submitted requests) on the next send.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    classify_send_error, Channel, ChannelKind, ChannelStatus, SendError, StatusCell,
};
use crate::error::{ReplyStatus, TransportError};
use crate::protocol::{
    encode_frame, MsgHeader, SockHeader, MAX_MESSAGE_SIZE, MSG_HEADER_LEN, SOCK_HEADER_LEN,
};
use crate::request::{MessageBuf, Request, RequestState};
use crate::transport::PendingIndex;

/// Largest operation payload a stream request can carry.
pub(crate) const STREAM_MAX_PAYLOAD: usize = MAX_MESSAGE_SIZE - MSG_HEADER_LEN;

/// Give up after this many full-socket retries of one send.
const MAX_WRITE_ATTEMPTS: u32 = 16;

/// Ceiling for the exponential write backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One end of a connected stream socket. Cloning shares the descriptor so
/// the receiver thread can read while senders write; shutdown unblocks it.
pub trait StreamConn: Read + Write + Send {
    fn try_clone(&self) -> io::Result<Box<dyn StreamConn>>;

    fn shutdown(&self) -> io::Result<()>;
}

/// Dials the host endpoint for the stream channel.
pub trait StreamConnector: Send {
    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;

    fn connect(&self) -> io::Result<Box<dyn StreamConn>>;
}

pub struct StreamChannel {
    connector: Box<dyn StreamConnector>,
    pending: Arc<PendingIndex>,
    status: Arc<StatusCell>,
    conn: Option<Box<dyn StreamConn>>,
    receiver: Option<JoinHandle<()>>,
    retry_delay: Duration,
}

impl StreamChannel {
    pub(crate) fn new(
        connector: Box<dyn StreamConnector>,
        pending: Arc<PendingIndex>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            connector,
            pending,
            status: StatusCell::new(ChannelStatus::Uninitialized),
            conn: None,
            receiver: None,
            retry_delay,
        }
    }
}

impl Channel for StreamChannel {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    fn open(&mut self) -> io::Result<()> {
        if self.status.get() == ChannelStatus::Connected {
            return Ok(());
        }

        let conn = self.connector.connect()?;
        let read_side = conn.try_clone()?;
        let pending = Arc::clone(&self.pending);
        let status = Arc::clone(&self.status);

        let receiver = thread::Builder::new()
            .name("volume-link-stream-recv".to_string())
            .spawn(move || receiver_loop(read_side, pending, status))?;

        info!(
            target: "volume-link::stream",
            endpoint = %self.connector.describe(),
            "stream channel connected"
        );
        self.conn = Some(conn);
        self.receiver = Some(receiver);
        self.status.set(ChannelStatus::Connected);
        Ok(())
    }

    fn close(&mut self) {
        // Flip the status first so the receiver treats the socket shutdown
        // as an orderly close rather than a death.
        self.status.set(ChannelStatus::NotConnected);
        if let Some(conn) = self.conn.take() {
            let _ = conn.shutdown();
        }
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
            debug!(target: "volume-link::stream", "receiver thread joined");
        }
    }

    fn mark_dead(&self) {
        self.status.set(ChannelStatus::Dead);
    }

    fn allocate(&self, id: u64, size: usize) -> Result<Arc<Request>, TransportError> {
        if size > STREAM_MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                requested: size,
                limit: STREAM_MAX_PAYLOAD,
            });
        }
        Ok(Request::new(
            id,
            ChannelKind::Stream,
            MessageBuf::heap(&[], size),
        ))
    }

    fn send(&mut self, request: &Arc<Request>) -> Result<(), SendError> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            SendError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream channel has no connection",
            ))
        })?;

        let frame = encode_frame(&request.message_bytes()).map_err(SendError::Transport)?;

        let mut written = 0;
        let mut attempts = 0u32;
        let mut delay = self.retry_delay;
        while written < frame.len() {
            match conn.write(&frame[written..]) {
                Ok(0) => {
                    return Err(SendError::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream write returned zero",
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if written == 0 {
                        return Err(SendError::Interrupted);
                    }
                    // A half-written frame cannot be abandoned without
                    // desynchronizing the stream.
                    continue;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    attempts += 1;
                    if attempts > MAX_WRITE_ATTEMPTS {
                        return Err(SendError::Transport(e));
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => return Err(classify_send_error(e)),
            }
        }
        conn.flush().map_err(classify_send_error)?;

        request.advance(RequestState::Submitted);
        debug!(
            target: "volume-link::stream",
            id = request.id(),
            len = frame.len(),
            "request submitted"
        );
        Ok(())
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiver thread body: WaitHeader, WaitReplyHeader, WaitPayload, repeat.
fn receiver_loop(mut conn: Box<dyn StreamConn>, pending: Arc<PendingIndex>, status: Arc<StatusCell>) {
    loop {
        // WaitHeader: fixed transport header, version/size validation.
        let mut head = [0u8; SOCK_HEADER_LEN];
        if let Err(e) = conn.read_exact(&mut head) {
            note_receiver_exit(&status, &e);
            break;
        }
        let sock = match SockHeader::parse(&head) {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "volume-link::stream", error = %e, "bad transport header, killing channel");
                status.set(ChannelStatus::Dead);
                break;
            }
        };

        // WaitReplyHeader: correlation id and declared payload length.
        let mut raw = [0u8; MSG_HEADER_LEN];
        if let Err(e) = conn.read_exact(&mut raw) {
            note_receiver_exit(&status, &e);
            break;
        }
        let header = MsgHeader::unpack_exact(&raw);
        let payload_len = sock.len as usize - MSG_HEADER_LEN;
        if header.len as usize != payload_len {
            warn!(
                target: "volume-link::stream",
                id = header.id,
                declared = header.len,
                framed = payload_len,
                "reply length disagrees with frame, killing channel"
            );
            if let Some(req) = pending.get(header.id) {
                req.fail(ReplyStatus::ProtocolError);
            }
            status.set(ChannelStatus::Dead);
            break;
        }

        // Take a reference while the index lock is held; an unmatched id
        // still gets its payload drained so framing stays correct.
        let target = pending.get(header.id);

        // WaitPayload.
        let mut payload = vec![0u8; payload_len];
        if let Err(e) = conn.read_exact(&mut payload) {
            warn!(
                target: "volume-link::stream",
                id = header.id,
                error = %e,
                "receive failed mid-payload"
            );
            if let Some(req) = target {
                req.fail(ReplyStatus::IoError);
            }
            status.set(ChannelStatus::Dead);
            break;
        }

        match target {
            Some(req) => {
                req.complete(ReplyStatus::from_wire(header.status), &payload);
                debug!(
                    target: "volume-link::stream",
                    id = header.id,
                    len = payload_len,
                    "reply completed"
                );
            }
            None => {
                debug!(
                    target: "volume-link::stream",
                    id = header.id,
                    len = payload_len,
                    "reply matches no pending request, drained"
                );
            }
        }
    }
}

/// A read failure after `close()` is an orderly exit; any other is a death
/// the transport will reap on its next send.
fn note_receiver_exit(status: &StatusCell, err: &io::Error) {
    if status.get() == ChannelStatus::Connected {
        warn!(target: "volume-link::stream", error = %err, "connection lost");
        status.set(ChannelStatus::Dead);
    } else {
        debug!(target: "volume-link::stream", "receiver exiting after close");
    }
}
