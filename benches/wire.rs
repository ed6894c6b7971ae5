//! Wire framing and dispatch benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use std::io;

use volume_link::protocol::{encode_frame, DatagramEvent, DatagramMsg, SgDescriptor};
use volume_link::{MsgHeader, PortBackend, Transport, MSG_HEADER_LEN, PORT_PREFIX};

fn bench_pack_msg_header(c: &mut Criterion) {
    let header = MsgHeader::request(77, 4096);
    c.bench_function("pack_msg_header", |b| b.iter(|| black_box(header.pack())));
}

fn bench_unpack_msg_header(c: &mut Criterion) {
    let raw = MsgHeader::request(77, 4096).pack();
    c.bench_function("unpack_msg_header", |b| {
        b.iter(|| black_box(MsgHeader::unpack_exact(&raw)))
    });
}

fn bench_encode_frame_4kb(c: &mut Criterion) {
    let mut body = MsgHeader::request(1, 4096).pack().to_vec();
    body.extend_from_slice(&vec![0u8; 4096]);

    let mut group = c.benchmark_group("encode_frame");
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("4kb", |b| {
        b.iter(|| black_box(encode_frame(&body).unwrap()))
    });
    group.finish();
}

fn bench_encode_frame_64kb(c: &mut Criterion) {
    let mut body = MsgHeader::request(1, 65536).pack().to_vec();
    body.extend_from_slice(&vec![0u8; 65536]);

    let mut group = c.benchmark_group("encode_frame");
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("64kb", |b| {
        b.iter(|| black_box(encode_frame(&body).unwrap()))
    });
    group.finish();
}

fn bench_encode_datagram_request(c: &mut Criterion) {
    let msg = DatagramMsg::Request {
        id: 42,
        segments: (0..8u32)
            .map(|i| SgDescriptor {
                region: i,
                offset: 0,
                len: 65536,
            })
            .collect(),
    };

    c.bench_function("encode_datagram_request", |b| {
        b.iter(|| black_box(msg.encode().unwrap()))
    });
}

fn bench_decode_datagram_event(c: &mut Criterion) {
    let encoded = DatagramEvent::Complete {
        id: 42,
        status: 0,
        len: 65536,
    }
    .encode()
    .unwrap();

    c.bench_function("decode_datagram_event", |b| {
        b.iter(|| black_box(DatagramEvent::decode(&encoded).unwrap()))
    });
}

/// Port backend echoing the request payload back unchanged.
struct EchoPort;

impl PortBackend for EchoPort {
    fn roundtrip(&mut self, buf: &mut [u8], request_len: usize) -> io::Result<usize> {
        let header = MsgHeader::unpack(&buf[PORT_PREFIX.len()..])?;
        let payload_at = PORT_PREFIX.len() + MSG_HEADER_LEN;
        let payload = buf[payload_at..payload_at + header.len as usize].to_vec();
        debug_assert_eq!(payload_at + payload.len(), request_len);

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

fn bench_port_dispatch_4kb(c: &mut Criterion) {
    let transport = Transport::builder()
        .port(Box::new(EchoPort))
        .build()
        .unwrap();
    let payload = vec![0x42u8; 4096];

    let mut group = c.benchmark_group("port_dispatch");
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("4kb", |b| {
        b.iter(|| {
            let req = transport.allocate_request(4096).unwrap();
            req.set_payload(&payload).unwrap();
            transport.send_request(&req).unwrap();
            black_box(req.payload_bytes())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_pack_msg_header,
    bench_unpack_msg_header,
    bench_encode_frame_4kb,
    bench_encode_frame_64kb,
    bench_encode_datagram_request,
    bench_decode_datagram_event,
    bench_port_dispatch_4kb,
);

criterion_main!(benches);
