//! Criterion benchmarks for the MoE dispatch pipeline.
//!
//! Covers the individual stages (routing, shuffling) and full
//! `MoELayer::dispatch` calls with dense experts at several concurrency
//! levels, all on the CPU.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::Device;
use moe_core::moe::{shuffle_tokens, CentroidRouter, ShuffleTargets};
use moe_core::testing::{wave, write_dense_archive};
use moe_core::{InputShape, MoELayer, MoELayerConfig, SublayerType, Workspace};

const EMBEDDING: usize = 64;
const HIDDEN: usize = 128;
const EXPERTS: usize = 8;

// ---------------------------------------------------------------------------
// Stage benchmarks
// ---------------------------------------------------------------------------

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");
    let router = CentroidRouter::new(wave(EXPERTS * EMBEDDING, 1, 1.0), EXPERTS, Device::Cpu)
        .expect("failed to build router");

    for &tokens in &[64, 512] {
        let input = wave(tokens * EMBEDDING, 2, 1.0);
        let mut affinity = vec![0.0; tokens * EXPERTS];
        let mut assignments = vec![0u32; tokens];
        let mut mix = vec![0.0; tokens];
        group.bench_with_input(BenchmarkId::new("tokens", tokens), &tokens, |b, _| {
            b.iter(|| {
                router
                    .route(black_box(&input), &mut affinity, &mut assignments, &mut mix)
                    .expect("route failed")
            });
        });
    }
    group.finish();
}

fn bench_shuffle(c: &mut Criterion) {
    let mut group = c.benchmark_group("shuffle");

    for &tokens in &[64, 512] {
        let input = wave(tokens * EMBEDDING, 3, 1.0);
        let assignments: Vec<u32> = (0..tokens).map(|t| ((t * 5) % EXPERTS) as u32).collect();
        let mix = vec![0.5; tokens];
        let mut positions = vec![0u32; tokens];
        let mut features = vec![0.0; tokens * EMBEDDING];
        let mut routed_mix = vec![0.0; tokens];
        group.bench_with_input(BenchmarkId::new("tokens", tokens), &tokens, |b, _| {
            b.iter(|| {
                shuffle_tokens(
                    black_box(&assignments),
                    &mix,
                    &input,
                    EMBEDDING,
                    EXPERTS,
                    ShuffleTargets {
                        positions: &mut positions,
                        features: &mut features,
                        mix: &mut routed_mix,
                    },
                )
                .expect("shuffle failed")
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Full dispatch
// ---------------------------------------------------------------------------

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_dense");
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let archive = dir.path().join("experts.safetensors");
    write_dense_archive(&archive, EXPERTS, EMBEDDING, HIDDEN).expect("failed to write archive");

    let shape = InputShape::new(4, 64, EMBEDDING);
    let input = wave(shape.numel(), 4, 1.0);

    for &concurrency in &[1, 2, 4] {
        let config = MoELayerConfig::new(
            EXPERTS,
            HIDDEN,
            wave(EXPERTS * EMBEDDING, 1, 1.0),
            &archive,
            SublayerType::T5FeedForward,
        )
        .with_max_concurrency(concurrency);
        let mut layer = MoELayer::new(config).expect("failed to build layer");
        layer.initialize().expect("failed to initialize layer");
        let mut workspace =
            Workspace::with_size(layer.compute_workspace_size(&shape)).expect("workspace allocation failed");
        let mut output = vec![0.0; shape.numel()];

        group.bench_with_input(
            BenchmarkId::new("slots", concurrency),
            &concurrency,
            |b, _| {
                b.iter(|| {
                    layer
                        .dispatch(&shape, black_box(&input), &mut output, &mut workspace)
                        .expect("dispatch failed")
                });
            },
        );
    }
    group.finish();
}

criterion_group!(stages, bench_route, bench_shuffle);
criterion_group!(pipeline, bench_dispatch);
criterion_main!(stages, pipeline);
