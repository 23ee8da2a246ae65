use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rtp_proto::rtp::{RtpHeader, RtpPacket};

fn sample(seq: u16) -> RtpPacket {
    RtpPacket {
        header: RtpHeader {
            version: 2,
            padding: false,
            marker: false,
            payload_type: 111,
            sequence_number: seq,
            timestamp: seq as u32 * 160,
            ssrc: 0xA5A5_A5A5,
            csrc: Default::default(),
            extensions: Default::default(),
        }
        .with_transport_wide_sequence(seq),
        payload: Bytes::from_static(&[0u8; 160]),
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut samples: Vec<Bytes> = (0..64u16)
        .map(|seq| {
            let mut out = BytesMut::new();
            sample(seq).encode(&mut out);
            out.freeze()
        })
        .collect();
    samples.rotate_left(0);
    let mut cycled = samples.iter().cloned().cycle();

    let mut rtp_criterion = c.benchmark_group("rtp");
    rtp_criterion.throughput(Throughput::Elements(1));

    rtp_criterion.bench_function("decode", |bencher| {
        bencher.iter(|| {
            RtpPacket::decode(cycled.next().unwrap()).unwrap();
        })
    });

    rtp_criterion.bench_function("encode", |bencher| {
        bencher.iter(|| {
            let mut out = BytesMut::new();
            sample(42).encode(&mut out);
            out
        })
    });

    rtp_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
