//! Wire encoding throughput benchmark.
//!
//! Measures object-proxy message encode/decode, parameter marshaling and
//! broker envelope framing using Criterion.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use objbroker::dconnect::marshal::{write_params, Limits, ObjectCodec, Side};
use objbroker::dconnect::wire::Message;
use objbroker::dconnect::{InstanceHandle, MethodInfo, ObjectRef, ParamInfo, TypeTag, Value};
use objbroker::ipc::codec::{decode_envelope, encode_envelope, read_frame};
use objbroker::types::{ClientId, InterfaceId, RequestIndex, TargetId};
use std::io::Cursor;

const MAX_FRAME: u32 = 16 * 1024 * 1024;
const SIZES: &[usize] = &[0, 64, 1024, 16384];

/// Marshals without object references.
struct NoObjects;

impl ObjectCodec for NoObjects {
    fn encode_object(&mut self, _object: Option<&ObjectRef>, _iid: &InterfaceId) -> objbroker::Result<u64> {
        Ok(0)
    }

    fn decode_object(&mut self, _raw: u64, _iid: &InterfaceId) -> objbroker::Result<Option<ObjectRef>> {
        Ok(None)
    }
}

fn invoke_message(size: usize) -> Message {
    Message::Invoke {
        request: RequestIndex(42),
        handle: InstanceHandle::from_raw(0x40),
        method: 3,
        params: Bytes::from(vec![0xABu8; size]),
    }
}

fn bench_message_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoke_encode");
    for &size in SIZES {
        let msg = invoke_message(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, m| {
            b.iter(|| black_box(m).encode());
        });
    }
    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoke_decode");
    for &size in SIZES {
        let wire = invoke_message(size).encode();
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| Message::decode(black_box(w.clone())).unwrap());
        });
    }
    group.finish();
}

fn bench_write_params(c: &mut Criterion) {
    let method = MethodInfo::new("put")
        .param(ParamInfo::input("name", TypeTag::CString))
        .param(ParamInfo::input("count", TypeTag::U32))
        .param(ParamInfo::input("items", TypeTag::array(TypeTag::I64, 1)));
    let limits = Limits {
        max_array_elements: 1 << 20,
    };

    let mut group = c.benchmark_group("write_params");
    for &count in &[0usize, 16, 256, 4096] {
        let params = vec![
            Value::str("benchmark"),
            Value::U32(count as u32),
            Value::Array(Some((0..count as i64).map(Value::I64).collect())),
        ];
        group.bench_with_input(BenchmarkId::from_parameter(count), &params, |b, p| {
            b.iter(|| {
                let mut out = BytesMut::with_capacity(16 + count * 8);
                write_params(&mut out, &method, black_box(p), Side::Request, &mut NoObjects, limits).unwrap();
                out
            });
        });
    }
    group.finish();
}

fn bench_envelope_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let target = TargetId::from_u128(0x0bad_cafe);

    let mut group = c.benchmark_group("envelope_round_trip");
    for &size in SIZES {
        let payload = vec![0xCDu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, p| {
            b.iter(|| {
                let frame = encode_envelope(ClientId::new(7), target, black_box(p));
                let (_, body) = rt
                    .block_on(read_frame(&mut Cursor::new(frame.as_ref()), MAX_FRAME))
                    .unwrap()
                    .unwrap();
                decode_envelope(body).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_write_params,
    bench_envelope_frame
);
criterion_main!(benches);
