//! Benchmarks for payload parsing, window deduplication and IPFIX packing.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use wspr_aggregator::aggregator::{DEFAULT_GRACE, WindowBucket, dedup_window};
use wspr_aggregator::ipfix::{PacketHeader, ReceiverInfo, SenderReport, build_packet};
use wspr_aggregator::parser::parse_spot_payload;
use wspr_aggregator::spot::WsprSpot;

/// Sample spot payloads as published by a receiver.
const SAMPLE_PAYLOADS: &[&str] = &[
    r#"{"callsign":"G0XYZ","grid":"IO91","snr":-14,"frequency":14097050,"dbm":23,"drift":0,"dt":0.2,"epoch_time":"2024-06-01T12:00:00Z"}"#,
    r#"{"callsign":"K1ABC","grid":"FN42","snr":-8,"frequency":7040100,"dbm":37,"drift":-1,"dt":-0.4,"epoch_time":"2024-06-01T12:00:00Z"}"#,
    r#"{"callsign":"JA1ZZZ","grid":"PM95","snr":-27,"frequency":14097110,"dbm":30,"drift":1,"dt":1.1,"epoch_time":"2024-06-01T12:00:00Z"}"#,
    r#"{"callsign":"VK2DEF","grid":"QF56","snr":-21,"frequency":10140200,"dbm":23,"drift":0,"dt":0.9,"epoch_time":"2024-06-01T12:00:00Z"}"#,
    r#"{"callsign":"<...>","grid":"","snr":-25,"frequency":14097090,"dbm":23,"drift":0,"dt":0.3,"epoch_time":"2024-06-01T12:00:00Z"}"#,
];

const INSTANCES: &[&str] = &["kiwi-a", "kiwi-b", "kiwi-c"];

fn sample_spots() -> Vec<WsprSpot> {
    INSTANCES
        .iter()
        .enumerate()
        .flat_map(|(i, instance)| {
            SAMPLE_PAYLOADS.iter().filter_map(move |p| {
                let mut spot = parse_spot_payload(p.as_bytes(), instance).ok()?;
                spot.snr -= i as i32;
                Some(spot)
            })
        })
        .collect()
}

fn bench_parse_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_payload");

    group.throughput(Throughput::Elements(1));
    group.bench_function("single", |b| {
        b.iter(|| parse_spot_payload(black_box(SAMPLE_PAYLOADS[0].as_bytes()), "kiwi-a"))
    });

    group.throughput(Throughput::Elements(SAMPLE_PAYLOADS.len() as u64));
    group.bench_function("batch", |b| {
        b.iter(|| {
            for payload in SAMPLE_PAYLOADS {
                let _ = parse_spot_payload(black_box(payload.as_bytes()), "kiwi-a");
            }
        })
    });

    group.finish();
}

fn bench_dedup_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_window");
    let spots = sample_spots();

    group.throughput(Throughput::Elements(spots.len() as u64));
    group.bench_function("three_instances", |b| {
        b.iter(|| {
            let mut bucket = WindowBucket::new(spots[0].cycle_key(), DEFAULT_GRACE);
            for spot in &spots {
                bucket.insert(spot.clone());
            }
            dedup_window(black_box(bucket))
        })
    });

    group.finish();
}

fn bench_build_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_packet");

    let receiver = ReceiverInfo {
        callsign: "N0CALL".to_string(),
        locator: "FN42".to_string(),
        program: wspr_aggregator::PROGRAM_NAME.to_string(),
        antenna: String::new(),
    };
    let reports: Vec<SenderReport> = (0..50)
        .map(|i| SenderReport {
            callsign: format!("K{}ABC", i % 10),
            frequency: 14_097_000 + i * 10,
            snr: -20,
            mode: "WSPR".to_string(),
            locator: if i % 3 == 0 { String::new() } else { "FN42".to_string() },
            flow_start: 1_717_243_200,
        })
        .collect();
    let header = PacketHeader {
        export_time: 1_717_243_320,
        sequence: 0,
        observation_domain: 0x1234_5678,
    };

    group.bench_function("with_descriptors", |b| {
        b.iter(|| build_packet(header, true, &receiver, black_box(&reports)))
    });
    group.bench_function("records_only", |b| {
        b.iter(|| build_packet(header, false, &receiver, black_box(&reports)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_payload,
    bench_dedup_window,
    bench_build_packet
);
criterion_main!(benches);
