//! Criterion benchmarks for slean trimming on the software backend
//!
//! Tracks the cost of:
//! - Sizing derivation and stage table construction (startup path)
//! - Key derivation per job
//! - A full trimming job through the bucketed pipeline vs the reference trimmer

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use slean_trimmer::reference::trim_edges;
use slean_trimmer::{
    BitmapSlot, Blake2bKeys, CpuBackend, Job, JobIdentity, JobPlan, KeyDeriver, ResourceSizing,
    RoundScheduler, SipHashKeys, TrimmingConfig,
};
use std::hint::black_box;

fn config(edge_bits: u32, rounds: u32) -> TrimmingConfig {
    TrimmingConfig::new(edge_bits)
        .with_parts(4)
        .with_local_ram_kb(32)
        .with_trimming_rounds(rounds)
}

/// Benchmark: sizing and plan construction for production graph sizes
fn bench_startup(c: &mut Criterion) {
    let mut group = c.benchmark_group("startup");

    for edge_bits in [29, 31, 32].iter() {
        let cfg = config(*edge_bits, 90);
        group.bench_with_input(BenchmarkId::new("derive_sizing", edge_bits), &cfg, |b, cfg| {
            b.iter(|| black_box(ResourceSizing::derive(black_box(cfg)).unwrap()));
        });

        let sizing = ResourceSizing::derive(&cfg).unwrap();
        group.bench_with_input(BenchmarkId::new("build_plan", edge_bits), &sizing, |b, sizing| {
            b.iter(|| black_box(JobPlan::build(black_box(&cfg), sizing)));
        });
    }

    group.finish();
}

/// Benchmark: BLAKE2b key derivation for one nonce
fn bench_key_derivation(c: &mut Criterion) {
    let header = vec![0x5a_u8; 232];
    c.bench_function("derive_keys", |b| {
        let mut nonce = 0_u64;
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            black_box(Blake2bKeys.derive_keys(black_box(&header), nonce))
        });
    });
}

/// Benchmark: one complete job, bucketed pipeline vs reference trimmer
fn bench_trimming_job(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let keys = SipHashKeys([1, 2, 3, 4]);
    let job = Job {
        identity: JobIdentity {
            height: 0,
            id: 0,
            nonce: 0,
        },
        keys,
    };

    let mut group = c.benchmark_group("trimming_job");
    group.sample_size(10);

    for edge_bits in [14, 16, 18].iter() {
        let cfg = config(*edge_bits, 16);
        let sizing = ResourceSizing::derive(&cfg).unwrap();
        let plan = JobPlan::build(&cfg, &sizing);
        let mut scheduler =
            RoundScheduler::new(CpuBackend::new(sizing), Blake2bKeys, plan).unwrap();

        group.bench_function(BenchmarkId::new("cpu_backend", edge_bits), |b| {
            b.iter(|| {
                let bitmap = runtime
                    .block_on(scheduler.trim_job(black_box(&job), BitmapSlot::One))
                    .unwrap();
                black_box(bitmap);
            });
        });

        group.bench_with_input(BenchmarkId::new("reference", edge_bits), edge_bits, |b, &bits| {
            b.iter(|| black_box(trim_edges(black_box(&keys), bits, 16)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_startup, bench_key_derivation, bench_trimming_job);
criterion_main!(benches);
