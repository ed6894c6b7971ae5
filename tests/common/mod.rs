//! Shared fixtures for transport integration tests.
//!
//! Three in-process hosts, one per channel variant:
//! - port backends servicing the synchronous roundtrip inline,
//! - [`StreamHost`]: a unix-socket server thread speaking the stream frame
//!   format, with scripted failure behaviors,
//! - [`MemoryDatagramHost`]: a worker thread servicing descriptor sends out
//!   of the donated pool and delivering completion events.

// Allow dead code - these fixtures are conditionally used by different tests
#![allow(dead_code)]

use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use volume_link::protocol::{encode_frame, read_frame, DatagramEvent, DatagramMsg, MsgHeader, MSG_HEADER_LEN};
use volume_link::{
    DatagramBackend, DatagramEventSink, PagePool, PortBackend, UnixConnector, PORT_PREFIX,
};

/// Initialize tracing once for the test process.
static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Build a reply frame for `id` carrying `payload`.
pub fn reply_frame(id: u64, status: u32, payload: &[u8]) -> Vec<u8> {
    let header = MsgHeader {
        id,
        status,
        len: payload.len() as u32,
    };
    let mut body = header.pack().to_vec();
    body.extend_from_slice(payload);
    encode_frame(&body).unwrap()
}

// ---------------------------------------------------------------------------
// Port backends
// ---------------------------------------------------------------------------

fn parse_port_request(buf: &[u8], request_len: usize) -> (MsgHeader, Vec<u8>) {
    assert_eq!(&buf[..PORT_PREFIX.len()], PORT_PREFIX);
    let header = MsgHeader::unpack(&buf[PORT_PREFIX.len()..]).unwrap();
    let payload_at = PORT_PREFIX.len() + MSG_HEADER_LEN;
    assert_eq!(payload_at + header.len as usize, request_len);
    let payload = buf[payload_at..payload_at + header.len as usize].to_vec();
    (header, payload)
}

fn write_port_reply(buf: &mut [u8], id: u64, payload: &[u8]) -> usize {
    let reply = MsgHeader {
        id,
        status: 0,
        len: payload.len() as u32,
    };
    buf[..MSG_HEADER_LEN].copy_from_slice(&reply.pack());
    buf[MSG_HEADER_LEN..MSG_HEADER_LEN + payload.len()].copy_from_slice(payload);
    MSG_HEADER_LEN + payload.len()
}

/// Port backend answering with the payload uppercased.
pub struct UppercasePort;

impl PortBackend for UppercasePort {
    fn roundtrip(&mut self, buf: &mut [u8], request_len: usize) -> io::Result<usize> {
        let (header, payload) = parse_port_request(buf, request_len);
        let reply = payload.to_ascii_uppercase();
        Ok(write_port_reply(buf, header.id, &reply))
    }
}

/// Port backend answering with the payload twice: the reply is larger than
/// the request.
pub struct DoublingPort;

impl PortBackend for DoublingPort {
    fn roundtrip(&mut self, buf: &mut [u8], request_len: usize) -> io::Result<usize> {
        let (header, payload) = parse_port_request(buf, request_len);
        let mut reply = payload.clone();
        reply.extend_from_slice(&payload);
        Ok(write_port_reply(buf, header.id, &reply))
    }
}

/// Port backend whose every roundtrip fails fatally.
pub struct BrokenPort;

impl PortBackend for BrokenPort {
    fn roundtrip(&mut self, _buf: &mut [u8], _request_len: usize) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "port wedged"))
    }
}

// ---------------------------------------------------------------------------
// Stream host
// ---------------------------------------------------------------------------

/// How the stream host treats its single accepted connection.
#[derive(Clone, Copy)]
pub enum StreamBehavior {
    /// Service every frame with an uppercased reply until the peer closes.
    Echo,
    /// Accept, then drop the connection immediately.
    CloseOnConnect,
    /// Read one frame, then drop the connection without replying.
    CloseAfterOneRead,
    /// Read frames forever, never replying, until the peer closes.
    ReadAndHold,
}

/// A unix-socket host serving one connection on a background thread. The
/// listener is dropped after the first accept, so reconnect attempts are
/// refused.
pub struct StreamHost {
    path: PathBuf,
    _dir: TempDir,
    handle: Option<JoinHandle<()>>,
}

impl StreamHost {
    pub fn spawn(behavior: StreamBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let handle = thread::Builder::new()
            .name("test-stream-host".to_string())
            .spawn(move || {
                let (mut conn, _) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                drop(listener);
                serve_stream(&mut conn, behavior);
            })
            .unwrap();

        Self {
            path,
            _dir: dir,
            handle: Some(handle),
        }
    }

    /// Connector for the transport under test.
    pub fn connector(&self) -> Box<UnixConnector> {
        Box::new(UnixConnector::new(&self.path))
    }
}

impl Drop for StreamHost {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_stream(conn: &mut UnixStream, behavior: StreamBehavior) {
    match behavior {
        StreamBehavior::CloseOnConnect => {}
        StreamBehavior::CloseAfterOneRead => {
            let _ = read_frame(conn);
        }
        StreamBehavior::ReadAndHold => {
            while read_frame(conn).is_ok() {}
        }
        StreamBehavior::Echo => {
            while let Ok(body) = read_frame(conn) {
                let header = match MsgHeader::unpack(&body) {
                    Ok(h) => h,
                    Err(_) => break,
                };
                let reply = body[MSG_HEADER_LEN..].to_ascii_uppercase();
                if conn.write_all(&reply_frame(header.id, 0, &reply)).is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Datagram host
// ---------------------------------------------------------------------------

/// In-memory datagram backend: sends are queued to a worker thread, which
/// services requests out of the donated pool (uppercasing the payload in
/// place) and delivers completion events through the sink, the way a real
/// host writes replies by DMA and raises an interrupt.
pub struct MemoryDatagramHost {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    donated: Arc<AtomicUsize>,
}

impl MemoryDatagramHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            donated: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Regions the guest has donated so far.
    pub fn donated_regions(&self) -> usize {
        self.donated.load(Ordering::Acquire)
    }
}

impl DatagramBackend for MemoryDatagramHost {
    fn open(&self, sink: DatagramEventSink, pool: Arc<PagePool>) -> io::Result<()> {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let donated = Arc::clone(&self.donated);

        let worker = thread::Builder::new()
            .name("test-datagram-host".to_string())
            .spawn(move || {
                while let Ok(bytes) = rx.recv() {
                    let msg = match DatagramMsg::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(_) => continue,
                    };
                    match msg {
                        DatagramMsg::Donate { regions } => {
                            donated.fetch_add(regions.len(), Ordering::AcqRel);
                        }
                        DatagramMsg::Request { id, segments } => {
                            let first = segments[0];
                            let head_region = match pool.region(first.region) {
                                Some(r) => r,
                                None => continue,
                            };

                            // Gather the payload from every descriptor: the
                            // first carries the message header, the rest are
                            // raw spill chunks.
                            let head_len = first.len as usize - MSG_HEADER_LEN;
                            let mut payload =
                                head_region.read_at(MSG_HEADER_LEN, head_len).unwrap();
                            for seg in &segments[1..] {
                                let region = pool.region(seg.region).unwrap();
                                let chunk = region
                                    .read_at(seg.offset as usize, seg.len as usize)
                                    .unwrap();
                                payload.extend_from_slice(&chunk);
                            }
                            payload.make_ascii_uppercase();

                            // Scatter the reply back in the layout the guest
                            // reads it in: operation region first, then each
                            // attached region from offset zero.
                            let head = payload.len().min(pool.region_size() - MSG_HEADER_LEN);
                            head_region.write_at(MSG_HEADER_LEN, &payload[..head]).unwrap();
                            let mut rest = &payload[head..];
                            for seg in &segments[1..] {
                                if rest.is_empty() {
                                    break;
                                }
                                let region = pool.region(seg.region).unwrap();
                                let take = rest.len().min(region.len());
                                region.write_at(0, &rest[..take]).unwrap();
                                rest = &rest[take..];
                            }
                            sink.deliver(DatagramEvent::Complete {
                                id,
                                status: 0,
                                len: payload.len() as u32,
                            });
                        }
                    }
                }
            })?;

        *self.tx.lock().unwrap() = Some(tx);
        *self.worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    fn send(&self, msg: &[u8]) -> io::Result<()> {
        let guard = self.tx.lock().unwrap();
        let tx = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "datagram host closed"))?;
        tx.send(msg.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "datagram host gone"))
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}
