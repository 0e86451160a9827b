// Performance benchmarks for route resolution
//
// Run with: cargo bench --bench router_bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use minstrel_core::domain::router::resolve;
use minstrel_core::domain::*;
use std::hint::black_box;
use ConnectionFormat::*;

/// A chain of `depth` domains with `width` parallel gateways between neighbours
fn ladder(depth: u16, width: u16) -> InMemoryRegistry {
    let mut registry = InMemoryRegistry::new();
    for d in 1..=depth {
        registry
            .enter_domain(Domain {
                id: DomainId::new(d),
                name: format!("domain-{d}"),
                bus_name: "bench".to_string(),
                node_name: "bench".to_string(),
                early: false,
                complete: true,
                state: DomainState::Controlled,
            })
            .unwrap();
    }

    registry
        .enter_source(Source::new(SourceId::new(1), DomainId::new(1), "source").with_formats([Pcm, Stereo]))
        .unwrap();
    registry
        .enter_sink(Sink::new(SinkId::new(1), DomainId::new(depth), "sink").with_formats([Pcm, Stereo]))
        .unwrap();

    for d in 1..depth {
        for k in 0..width {
            let id = (d - 1) * width + k + 1;
            let sink_id = SinkId::new(1000 + id);
            let source_id = SourceId::new(1000 + id);
            registry
                .enter_sink(Sink::new(sink_id, DomainId::new(d), "gw-in").with_formats([Pcm, Stereo]))
                .unwrap();
            registry
                .enter_source(Source::new(source_id, DomainId::new(d + 1), "gw-out").with_formats([Pcm, Stereo]))
                .unwrap();
            registry
                .enter_gateway(Gateway {
                    id: GatewayId::new(id),
                    name: format!("gw-{id}"),
                    sink_id,
                    source_id,
                    domain_sink_id: DomainId::new(d),
                    domain_source_id: DomainId::new(d + 1),
                    control_domain_id: DomainId::new(d),
                    sink_formats: vec![Pcm, Stereo],
                    source_formats: vec![Pcm, Stereo],
                    conversion: ConversionMatrix::identity(2),
                })
                .unwrap();
        }
    }

    registry
}

fn bench_resolve_ladder(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_ladder");
    let controller = PriorityController::new(vec![Pcm, Stereo]);

    for (depth, width) in [(2u16, 1u16), (3, 2), (4, 3), (5, 3)] {
        let registry = ladder(depth, width);
        let label = format!("{depth}x{width}");
        group.bench_with_input(BenchmarkId::from_parameter(label), &registry, |b, registry| {
            b.iter(|| {
                black_box(resolve(registry, &controller, false, SourceId::new(1), SinkId::new(1)).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_resolve_same_domain(c: &mut Criterion) {
    let registry = ladder(1, 0);
    let controller = PriorityController::new(vec![Stereo, Pcm]);

    c.bench_function("resolve_same_domain", |b| {
        b.iter(|| {
            black_box(resolve(&registry, &controller, true, SourceId::new(1), SinkId::new(1)).unwrap());
        });
    });
}

criterion_group!(benches, bench_resolve_ladder, bench_resolve_same_domain);
criterion_main!(benches);
