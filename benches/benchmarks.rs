//! Performance benchmarks for wg-console
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use wg_console::firewall::profile_rules;
use wg_console::registry::AclProfile;
use wg_console::wireguard::{allocate, parse_dump, parse_sections};

fn bench_allocation(c: &mut Criterion) {
    let subnet: ipnet::Ipv4Net = "10.50.0.0/24".parse().unwrap();
    let mut group = c.benchmark_group("allocate");

    for used_count in [0u32, 100, 250] {
        let used: HashSet<Ipv4Addr> = (3..3 + used_count)
            .map(|i| Ipv4Addr::from(u32::from(subnet.network()) + i))
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(used_count),
            &used,
            |b, used| {
                b.iter(|| allocate(black_box(subnet), 3, 254, used));
            },
        );
    }
    group.finish();
}

fn bench_dump_parsing(c: &mut Criterion) {
    let mut dump = String::from("privkey\tpubkey\t51820\toff\n");
    for i in 0..250 {
        dump.push_str(&format!(
            "peer-key-{i}=\t(none)\t203.0.113.{}:51111\t10.50.0.{}/32\t1700000000\t1048576\t2097152\t25\n",
            i % 250,
            i % 250,
        ));
    }

    c.bench_function("parse_dump_250_peers", |b| {
        b.iter(|| parse_dump(black_box(&dump)));
    });
}

fn bench_config_parsing(c: &mut Criterion) {
    let mut config = String::from(
        "[Interface]\nAddress = 10.50.0.1/24\nListenPort = 51820\nPrivateKey = server-key\n",
    );
    for i in 0..250 {
        config.push_str(&format!(
            "\n[Peer]\n# peer-{i}\nPublicKey = peer-key-{i}=\nAllowedIPs = 10.50.0.{}/32\n",
            i % 250,
        ));
    }

    c.bench_function("parse_sections_250_peers", |b| {
        b.iter(|| parse_sections(black_box(&config)));
    });
}

fn bench_rule_building(c: &mut Criterion) {
    let address = Ipv4Addr::new(10, 50, 0, 4);
    let server = Ipv4Addr::new(10, 50, 0, 1);

    c.bench_function("profile_rules_internet_only", |b| {
        b.iter(|| {
            profile_rules(
                black_box(address),
                black_box(AclProfile::InternetOnly),
                black_box(server),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_allocation,
    bench_dump_parsing,
    bench_config_parsing,
    bench_rule_building
);
criterion_main!(benches);
