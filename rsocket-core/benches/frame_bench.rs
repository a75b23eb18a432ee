// Frame codec and dispatch benchmarks using criterion.
//
// Measures:
//   - Frame encode / decode throughput across payload sizes
//   - Connection dispatch throughput for per-stream payload frames

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bytes::Bytes;
use rsocket_core::{
    ConnectionConfig, ConnectionStateMachine, Frame, Payload, RejectingResponder, Role,
    SetupParams,
};

const SIZES: &[usize] = &[64, 1024, 8192, 65536];

fn payload_frame(stream_id: u32, size: usize) -> Frame {
    Frame::Payload {
        stream_id,
        follows: false,
        complete: false,
        next: true,
        payload: Payload::from_data(Bytes::from(vec![0xABu8; size])),
    }
}

// ---------------------------------------------------------------------------
// Frame encode throughput
// ---------------------------------------------------------------------------

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for &size in SIZES {
        let frame = payload_frame(1, size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &frame,
            |b, f| {
                b.iter(|| {
                    black_box(f.encode());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Frame decode throughput
// ---------------------------------------------------------------------------

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    for &size in SIZES {
        let encoded = payload_frame(1, size).encode();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &encoded,
            |b, data| {
                b.iter(|| {
                    black_box(Frame::decode(data).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Connection dispatch throughput
// ---------------------------------------------------------------------------

struct NullTransport;

impl rsocket_core::FrameTransport for NullTransport {
    fn send_frame(&mut self, _frame: Bytes) -> rsocket_core::Result<()> {
        Ok(())
    }

    fn close(&mut self, _reason: rsocket_core::CloseReason) {}
}

fn bench_connection_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection_dispatch");
    for &size in SIZES {
        let mut conn = ConnectionStateMachine::new(
            Role::Client,
            Box::new(RejectingResponder),
            ConnectionConfig::default(),
        )
        .unwrap();
        conn.connect_client(Box::new(NullTransport), SetupParams::default())
            .unwrap();
        let stream_id = conn
            .request_stream(Payload::from_data(Bytes::from_static(b"bench")), u32::MAX)
            .unwrap();
        let encoded = payload_frame(stream_id, size).encode();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &encoded,
            |b, data| {
                b.iter(|| {
                    conn.process_frame(black_box(data));
                    while conn.poll_event().is_some() {}
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_connection_dispatch
);
criterion_main!(benches);
