//! Throughput of the parity XOR kernel, the hottest loop of the RAID-SP
//! write path.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ublk_engine::raidsp::parity;
use ublk_engine::IoBuf;

fn bench_parity_renew(c: &mut Criterion) {
    let mut group = c.benchmark_group("parity_renew");
    for &strip_kib in &[4usize, 64, 256] {
        let strip = strip_kib * 1024;
        // Four data strips folding onto one parity strip.
        let data = IoBuf::from_vec((0..strip * 4).map(|i| i as u8).collect());
        let parity = IoBuf::alloc(strip);

        group.throughput(Throughput::Bytes((strip * 4) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{strip_kib}KiB-strip")),
            &strip,
            |b, _| b.iter(|| parity::parity_renew(&data, &parity)),
        );
    }
    group.finish();
}

fn bench_incremental_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("parity_to");
    let strip = 64 * 1024;
    let parity = IoBuf::alloc(strip);
    for &delta_kib in &[4usize, 16, 64] {
        let delta = IoBuf::from_vec(vec![0x5a; delta_kib * 1024]);
        group.throughput(Throughput::Bytes((delta_kib * 1024) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{delta_kib}KiB-delta")),
            &delta_kib,
            |b, _| b.iter(|| parity::parity_to(&delta, &parity, 4096)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_parity_renew, bench_incremental_fold);
criterion_main!(benches);
