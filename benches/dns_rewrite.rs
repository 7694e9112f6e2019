//! Benchmarks for DNS packet inspection and rewriting.
//!
//! Measures the per-packet work done on the relay path: recognising a DNS
//! datagram, extracting its names and rebuilding it with fresh answers.

use std::hint::black_box;
use std::net::{Ipv4Addr, SocketAddrV4};

use criterion::{BenchmarkId, Criterion, Throughput};

use splitvpn::dns::{self, AnswerMap, DnsMessage};

fn build_query_packet(name: &str) -> Vec<u8> {
    let payload = DnsMessage::query(0x1234, name)
        .to_bytes()
        .expect("query encodes");
    dns::build_udp_packet(
        &dns::ipv4_udp_header_template(),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 6), 40000),
        SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
        &payload,
    )
    .expect("packet fits")
}

fn bench_inspect(c: &mut Criterion) {
    let query = build_query_packet("www.example.com");
    let not_dns = {
        let mut packet = query.clone();
        // UDP destination port, after the 20-byte IP header.
        packet[22..24].copy_from_slice(&443u16.to_be_bytes());
        packet
    };

    let mut group = c.benchmark_group("dns");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("is_dns", "query"), |b| {
        b.iter(|| dns::is_dns(black_box(&query)))
    });
    group.bench_function(BenchmarkId::new("is_dns", "other_udp"), |b| {
        b.iter(|| dns::is_dns(black_box(&not_dns)))
    });
    group.bench_function("extract_query_names", |b| {
        b.iter(|| dns::extract_query_names(black_box(&query)))
    });
    group.finish();
}

fn bench_rewrite(c: &mut Criterion) {
    let query = build_query_packet("www.example.com");

    let mut group = c.benchmark_group("dns_rewrite");
    group.throughput(Throughput::Elements(1));
    for count in [1usize, 8] {
        let mut answers = AnswerMap::default();
        answers.insert(
            "www.example.com".to_string(),
            (0..count as u8).map(|i| Ipv4Addr::new(93, 184, 216, i)).collect(),
        );
        group.bench_with_input(BenchmarkId::new("spoofed_reply", count), &answers, |b, answers| {
            b.iter(|| dns::rewrite_with_fresh_answers(black_box(&query), answers, true))
        });
    }
    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_inspect(&mut criterion);
    bench_rewrite(&mut criterion);
    criterion.final_summary();
}
