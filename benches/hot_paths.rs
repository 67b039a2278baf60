use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use httpmon::probe::wire::{parse_page, FRAGMENT_SIZE, PAGE_BYTES, TX_RECORD_SIZE};
use httpmon::probe::PAGE_SIZE;
use httpmon::stats::Aggregator;
use httpmon::telemetry::Telemetry;
use httpmon::transaction::{ConnTuple, IpFamily, Method, Transaction};

fn tx_record(slot: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TX_RECORD_SIZE);
    buf.extend_from_slice(&0u64.to_ne_bytes()); // src_ip_high
    buf.extend_from_slice(&0x7f00_0001u64.to_ne_bytes()); // src_ip_low
    buf.extend_from_slice(&0u64.to_ne_bytes()); // dst_ip_high
    buf.extend_from_slice(&0x0a01_0203u64.to_ne_bytes()); // dst_ip_low
    buf.extend_from_slice(&(40_000u16 + slot as u16).to_ne_bytes());
    buf.extend_from_slice(&8080u16.to_ne_bytes());
    buf.push(0); // family: IPv4
    buf.push(1); // method: GET
    buf.extend_from_slice(&200u16.to_ne_bytes());
    buf.extend_from_slice(&1_000u64.to_ne_bytes());
    buf.extend_from_slice(&2_000_000u64.to_ne_bytes());
    let mut frag = [0u8; FRAGMENT_SIZE];
    let line = format!("GET /api/v1/orders/{slot} HTTP/1.1");
    frag[..line.len()].copy_from_slice(line.as_bytes());
    buf.extend_from_slice(&frag);
    buf.extend_from_slice(&(40_000u16 + slot as u16).to_ne_bytes()); // owner_src_port
    buf.extend_from_slice(&[0u8; 2]); // pad
    buf.extend_from_slice(&(slot as u32).to_ne_bytes()); // tcp_seq
    buf.extend_from_slice(&0u64.to_ne_bytes()); // static_tags
    buf
}

fn page_buf(idx: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PAGE_BYTES);
    buf.extend_from_slice(&idx.to_ne_bytes());
    buf.push(PAGE_SIZE as u8);
    buf.extend_from_slice(&[0u8; 7]);
    for slot in 0..PAGE_SIZE {
        buf.extend_from_slice(&tx_record(slot));
    }
    buf
}

fn batch(endpoints: usize) -> Vec<Transaction> {
    (0..128)
        .map(|i| Transaction {
            tuple: ConnTuple {
                src_ip_high: 0,
                src_ip_low: 0x7f00_0001,
                dst_ip_high: 0,
                dst_ip_low: 0x7f00_0001,
                src_port: 40_000,
                dst_port: 8080,
                family: IpFamily::V4,
            },
            method: Method::Get,
            status_code: 200,
            request_started: 1_000,
            response_last_seen: 2_000_000,
            request_fragment: format!("GET /api/v1/orders/{} HTTP/1.1", i % endpoints).into_bytes(),
            owner_src_port: 40_000,
            tcp_seq: i as u32,
            static_tags: 0,
            dynamic_tags: Vec::new(),
        })
        .collect()
}

fn bench_parse_page(c: &mut Criterion) {
    let buf = page_buf(42);

    c.bench_function("parse_full_page", |b| {
        b.iter(|| parse_page(black_box(&buf)).expect("page parses"));
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let txs = batch(16);

    c.bench_function("aggregate_128_txs_16_endpoints", |b| {
        let aggregator = Aggregator::new(100_000, Vec::new(), Arc::new(Telemetry::new()));
        b.iter_batched(
            || txs.clone(),
            |txs| aggregator.aggregate(black_box(txs)),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_parse_page, bench_aggregate);
criterion_main!(benches);
