//! Benchmark for layer resolution and streaming ticks.
//!
//! TARGET: a 16-layer resolve under 2µs; a 5x5 neighbourhood of cells
//! resolved and ticked well inside a 16ms frame.
//!
//! Run with: cargo bench --package stratum_layers --bench resolver_benchmark

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stratum_layers::{
    AssetBinding, AssetDescriptor, AssetKind, AssetStreamingService, BlendMode, CompletionSender, InMemoryRegistry,
    LayerCatalog, LayerDefinition, LayerResolver, RequestId, StreamHandle, StreamingConfig, StreamingController,
    StreamingOutcome,
};
use stratum_mask::{MaskCacheConfig, MaskField, MaskSource, MaskStore, PixelGrid};
use stratum_shared::{CellCoord, Vec2};

const WORLD: f32 = 4096.0;

/// Answers every request immediately.
struct InstantService;

impl AssetStreamingService for InstantService {
    fn request_load(&self, request: RequestId, _asset: &AssetDescriptor, reply: CompletionSender) {
        reply.complete(request, StreamingOutcome::Loaded(StreamHandle(request.0)));
    }
    fn request_unload(&self, request: RequestId, _handle: StreamHandle, reply: CompletionSender) {
        reply.complete(request, StreamingOutcome::Unloaded);
    }
    fn cancel(&self, _request: RequestId) {}
}

/// `count` layers, each on its own 256x256 gradient mask, every fourth one
/// sharing an additive channel.
fn world(count: usize) -> LayerResolver {
    let store = MaskStore::new(MaskCacheConfig::default());
    let mut catalog = LayerCatalog::new();
    for i in 0..count {
        let path = format!("layer_{i}.png");
        let source = MaskSource::new(&path, Vec2::ZERO, Vec2::new(WORLD, WORLD));
        let phase = i as u32 * 37;
        let grid = PixelGrid::from_fn(256, 256, |x, y| {
            let v = ((x + y + phase) % 256) as f32 / 255.0;
            [v, v, v, 1.0]
        });
        catalog.register_mask_bounds(&path, source.bounds()).unwrap();
        store.insert(MaskField::from_grid(&source, &grid).unwrap());

        let mut layer = LayerDefinition::new(format!("layer_{i:02}"), &path)
            .with_priority(i as i32)
            .with_threshold(0.1)
            .with_asset(AssetBinding::new(format!("/Game/Asset{i}"), AssetKind::StaticMesh));
        if i % 4 == 0 {
            layer = layer.with_blend(BlendMode::Additive).with_output("shared");
        }
        catalog.add_layer(layer).unwrap();
    }
    catalog.freeze();
    LayerResolver::new(Arc::new(catalog), Arc::new(store))
}

fn benchmark_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    group.throughput(Throughput::Elements(1));

    for count in [1usize, 4, 16] {
        let resolver = world(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &resolver, |b, resolver| {
            let mut i = 0u32;
            b.iter(|| {
                i = i.wrapping_add(7919);
                let coord = Vec2::new((i % 4096) as f32, ((i / 4096) % 4096) as f32);
                black_box(resolver.resolve(black_box(coord)))
            });
        });
    }
    group.finish();
}

fn benchmark_neighbourhood_tick(c: &mut Criterion) {
    let resolver = world(16);
    let mut registry = InMemoryRegistry::new();
    for i in 0..16 {
        registry.insert(format!("/Game/Asset{i}"), AssetKind::StaticMesh);
    }
    let mut controller = StreamingController::new(
        StreamingConfig::default(),
        Arc::clone(resolver.catalog()),
        Arc::new(registry),
        Arc::new(InstantService),
    );
    let cell_size = controller.config().cell_size;
    let cells = CellCoord::new(8, 8).neighborhood(2);

    let mut group = c.benchmark_group("streaming");
    group.throughput(Throughput::Elements(cells.len() as u64));
    group.bench_function("neighbourhood_5x5", |b| {
        b.iter(|| {
            controller.drain_completions();
            controller.advance(Duration::from_millis(16));
            for &cell in &cells {
                let sample = resolver.resolve(cell.center(cell_size));
                controller.tick(cell, &sample);
            }
            controller.settle();
            black_box(controller.drain_events().len())
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_resolve, benchmark_neighbourhood_tick);
criterion_main!(benches);
