use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forgepool_core::envelope::Envelope;
use forgepool_core::value::Value;

fn sample_request() -> Envelope {
    Envelope::Request {
        id: 42,
        method: "fib".to_string(),
        params: vec![
            Value::Number(40.0),
            Value::String("warm".to_string()),
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]),
        ],
    }
}

fn sample_response() -> Envelope {
    Envelope::ok_response(
        42,
        Value::Object(vec![
            ("status".to_string(), Value::String("done".to_string())),
            ("value".to_string(), Value::Number(102_334_155.0)),
        ]),
    )
}

fn bench_encode(c: &mut Criterion) {
    let request = sample_request();
    let response = sample_response();
    c.bench_function("encode_request", |b| {
        b.iter(|| black_box(serde_json::to_vec(&request).unwrap()))
    });
    c.bench_function("encode_response", |b| {
        b.iter(|| black_box(serde_json::to_vec(&response).unwrap()))
    });
}

fn bench_decode(c: &mut Criterion) {
    let request_bytes = serde_json::to_vec(&sample_request()).unwrap();
    let response_bytes = serde_json::to_vec(&sample_response()).unwrap();
    c.bench_function("decode_request", |b| {
        b.iter(|| black_box(serde_json::from_slice::<Envelope>(&request_bytes).unwrap()))
    });
    c.bench_function("decode_response", |b| {
        b.iter(|| black_box(serde_json::from_slice::<Envelope>(&response_bytes).unwrap()))
    });
}

criterion_group!(codec_benches, bench_encode, bench_decode);
criterion_main!(codec_benches);
