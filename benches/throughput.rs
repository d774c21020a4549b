//! Throughput benchmarks

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use secnode_core::core::codec::{decode_line, encode_line};
use secnode_core::core::datatype::DataType;
use secnode_core::core::dispatcher::{make_update, Dispatcher, NodeInfo};
use secnode_core::core::module::{Module, ParamValue, Parameter};
use secnode_core::core::transport::Connection;
use secnode_core::{Message, SecopCodec};
use serde_json::json;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

fn codec_benchmark(c: &mut Criterion) {
    let line = r#"update cryo:value [4.2153,{"t":1700000000.123,"e":0.001}]"#;
    let msg = decode_line(line).unwrap();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(line.len() as u64));

    group.bench_function("decode_line", |b| {
        b.iter(|| black_box(decode_line(black_box(line)).unwrap()))
    });

    group.bench_function("encode_line", |b| b.iter(|| black_box(encode_line(black_box(&msg)))));

    group.bench_function("frame_roundtrip", |b| {
        let mut codec = SecopCodec::default();
        let mut buf = BytesMut::with_capacity(256);
        b.iter(|| {
            codec.encode(msg.clone(), &mut buf).unwrap();
            black_box(codec.decode(&mut buf).unwrap())
        })
    });

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let dispatcher = Dispatcher::new(NodeInfo::new("bench", ""));
    let module = Module::builder("cryo")
        .parameter(Parameter::new("value", DataType::double(Some("K"))))
        .parameter(Parameter::new("target", DataType::double(Some("K"))).writable())
        .build()
        .unwrap();
    dispatcher.register_module(Arc::new(module)).unwrap();
    let (conn, mut rx) = Connection::channel("bench");
    dispatcher.add_connection(conn.clone());

    let mut group = c.benchmark_group("dispatch");

    group.bench_function("read", |b| {
        let request = Message::new("read", Some("cryo:value".into()), None);
        b.iter(|| black_box(dispatcher.handle(conn.id(), black_box(&request))))
    });

    group.bench_function("change", |b| {
        let request = Message::new("change", Some("cryo:target".into()), Some(json!(1.5)));
        b.iter(|| black_box(dispatcher.handle(conn.id(), black_box(&request))))
    });

    group.bench_function("make_update", |b| {
        let record = ParamValue::new(json!(4.2), 1_700_000_000.0);
        b.iter(|| black_box(make_update("cryo", "value", &record)))
    });

    group.finish();
    while rx.try_recv().is_ok() {}
}

criterion_group!(benches, codec_benchmark, dispatch_benchmark);
criterion_main!(benches);
