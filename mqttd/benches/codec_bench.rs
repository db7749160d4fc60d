//! Simple benchmarks for packet encoding/decoding and topic matching.
//!
//! Run with: cargo bench -p mqttd --bench codec_bench

use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use mqttd::protocol::codec;
use mqttd::protocol::v4::{Connect, Packet, Publish, Subscribe, SubscribeFilter};
use mqttd::topics::Topics;
use mqttd::trie::Subscriber;
use mqttd::QoS;

const ITERATIONS: u32 = 100_000;
const MAX_SIZE: usize = 1024 * 1024;

fn bench<F: FnMut()>(name: &str, mut f: F) {
    // Warmup
    for _ in 0..1000 {
        f();
    }

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        f();
    }
    let elapsed = start.elapsed();

    let per_op = elapsed / ITERATIONS;
    let ops_per_sec = if per_op.as_nanos() > 0 {
        1_000_000_000 / per_op.as_nanos()
    } else {
        0
    };

    println!(
        "{:40} {:>10.2?} per op, {:>12} ops/sec",
        name,
        per_op,
        format_number(ops_per_sec as u64)
    );
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

fn encode(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    packet.write(&mut buf).expect("encode");
    buf.to_vec()
}

fn bench_variable_int() {
    println!("\n=== Variable Length Integer ===");

    let mut buf = BytesMut::with_capacity(4);
    for (name, value) in [
        ("encode 127 (1 byte)", 127),
        ("encode 16383 (2 bytes)", 16_383),
        ("encode 2097151 (3 bytes)", 2_097_151),
        ("encode 268435455 (4 bytes)", 268_435_455),
    ] {
        bench(name, || {
            buf.clear();
            let _ = codec::write_variable_int(&mut buf, black_box(value));
        });
    }

    for (name, encoded) in [
        ("decode 127 (1 byte)", &[0x7F][..]),
        ("decode 16383 (2 bytes)", &[0xFF, 0x7F][..]),
        ("decode 2097151 (3 bytes)", &[0xFF, 0xFF, 0x7F][..]),
        ("decode 268435455 (4 bytes)", &[0xFF, 0xFF, 0xFF, 0x7F][..]),
    ] {
        bench(name, || {
            let _ = codec::read_variable_int(black_box(encoded));
        });
    }
}

fn bench_publish_packet() {
    println!("\n=== PUBLISH Packet ===");

    for (label, size) in [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)] {
        let mut publish = Publish::new("test/topic", QoS::AtLeastOnce, Bytes::from(vec![0u8; size]));
        publish.pkid = 1;
        let packet = Packet::Publish(publish);

        let mut buf = BytesMut::with_capacity(size + 32);
        bench(&format!("encode {label} payload"), || {
            buf.clear();
            let _ = packet.write(&mut buf);
        });

        let encoded = encode(&packet);
        bench(&format!("decode {label} payload"), || {
            let _ = Packet::read(black_box(&encoded), MAX_SIZE);
        });
    }
}

fn bench_connect_packet() {
    println!("\n=== CONNECT Packet ===");

    let mut connect = Connect::new("benchmark-client-12345");
    connect.keep_alive = 60;
    connect.username = Some("username".to_string());
    connect.password = Some(Bytes::from_static(b"password"));
    let packet = Packet::Connect(connect);

    let mut buf = BytesMut::with_capacity(128);
    bench("encode CONNECT", || {
        buf.clear();
        let _ = packet.write(&mut buf);
    });

    let encoded = encode(&packet);
    bench("decode CONNECT", || {
        let _ = Packet::read(black_box(&encoded), MAX_SIZE);
    });
}

fn bench_subscribe_packet() {
    println!("\n=== SUBSCRIBE Packet ===");

    let filters = ["topic/1", "topic/2", "topic/3", "topic/+/wildcard", "topic/#"]
        .into_iter()
        .map(|f| SubscribeFilter::new(f, QoS::AtLeastOnce))
        .collect();
    let packet = Packet::Subscribe(Subscribe { pkid: 1, filters });

    let mut buf = BytesMut::with_capacity(128);
    bench("encode SUBSCRIBE (5 topics)", || {
        buf.clear();
        let _ = packet.write(&mut buf);
    });

    let encoded = encode(&packet);
    bench("decode SUBSCRIBE (5 topics)", || {
        let _ = Packet::read(black_box(&encoded), MAX_SIZE);
    });
}

fn bench_topic_matching() {
    println!("\n=== Topic Matching ===");

    let topics = Topics::new();
    for device in 0..1000 {
        let subscriber: Subscriber = Arc::from(format!("client-{device}"));
        topics.subscribe(&format!("devices/{device}/state"), 1, &subscriber).expect("subscribe");
        topics.subscribe(&format!("devices/{device}/+/set"), 0, &subscriber).expect("subscribe");
    }
    let monitor: Subscriber = Arc::from("monitor");
    topics.subscribe("devices/#", 0, &monitor).expect("subscribe");

    bench("match exact + # (1000 devices)", || {
        let _ = topics.subscribers(black_box("devices/500/state"), QoS::AtMostOnce);
    });

    bench("match + (1000 devices)", || {
        let _ = topics.subscribers(black_box("devices/42/light/set"), QoS::AtMostOnce);
    });

    bench("match miss", || {
        let _ = topics.subscribers(black_box("other/topic"), QoS::AtMostOnce);
    });
}

fn bench_throughput() {
    println!("\n=== Throughput Test ===");

    let packet = Packet::Publish(Publish::new("sensor/temp", QoS::AtMostOnce, Bytes::from_static(b"25.5")));
    let encoded = encode(&packet);
    let iterations = 1_000_000u64;

    let mut buf = BytesMut::with_capacity(64);
    let start = Instant::now();
    for _ in 0..iterations {
        buf.clear();
        let _ = black_box(&packet).write(&mut buf);
    }
    let elapsed = start.elapsed();
    println!(
        "{:40} {:>12} msgs/sec",
        "encode small PUBLISH",
        format_number((iterations as f64 / elapsed.as_secs_f64()) as u64)
    );

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = Packet::read(black_box(&encoded), MAX_SIZE);
    }
    let elapsed = start.elapsed();
    println!(
        "{:40} {:>12} msgs/sec",
        "decode small PUBLISH",
        format_number((iterations as f64 / elapsed.as_secs_f64()) as u64)
    );
}

fn main() {
    println!("mqttd codec benchmarks");
    println!("======================");

    bench_variable_int();
    bench_publish_packet();
    bench_connect_packet();
    bench_subscribe_packet();
    bench_topic_matching();
    bench_throughput();
}
