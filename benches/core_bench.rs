//! Benchmarks for infragraph core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use infragraph::core::graph::GraphBuilder;
use infragraph::core::parser::parse_config;
use infragraph::core::planner;
use infragraph::core::types::{ResourceDescriptor, ResourceKind, Value};
use infragraph::stack::build_stack;
use infragraph::tripwire::hasher::hash_properties;
use serde_json::json;

const STACK_YAML: &str = r#"
version: "1.0"
name: bench
settings:
  cluster_name: bench-cluster
  region: eu-west-1
  availability_zones: [a, b, c]
  karpenter_namespace: karpenter
tags:
  team: platform
  env: "{{settings.region}}"
"#;

fn bench_hash_properties(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_properties");
    for keys in [4, 32, 256] {
        let props: serde_json::Map<String, serde_json::Value> = (0..keys)
            .map(|i| (format!("key-{i}"), json!({"nested": [i, "v", {"b": true}]})))
            .collect();
        let props = serde_json::Value::Object(props);
        group.bench_with_input(BenchmarkId::from_parameter(keys), &props, |b, props| {
            b.iter(|| black_box(hash_properties(ResourceKind::HelmRelease, black_box(props))));
        });
    }
    group.finish();
}

fn bench_yaml_parse(c: &mut Criterion) {
    c.bench_function("yaml_parse_stack", |b| {
        b.iter(|| black_box(parse_config(black_box(STACK_YAML)).unwrap()));
    });
}

fn bench_build_stack(c: &mut Criterion) {
    let config = parse_config(STACK_YAML).unwrap();
    c.bench_function("build_stack", |b| {
        b.iter(|| black_box(build_stack(black_box(&config)).unwrap()));
    });
}

/// `width` parallel chains of `depth` resources each.
fn lattice(width: usize, depth: usize) -> infragraph::core::graph::DependencyGraph {
    let mut builder = GraphBuilder::new();
    for w in 0..width {
        for d in 0..depth {
            let mut desc = ResourceDescriptor::new(format!("r-{w}-{d}"), ResourceKind::Vpc)
                .prop("cidr_block", "10.0.0.0/16");
            if d > 0 {
                desc = desc.prop("parent", Value::output(format!("r-{w}-{}", d - 1), "id"));
            }
            builder.register(desc).unwrap();
        }
    }
    builder.build().unwrap()
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    for (width, depth) in [(10, 10), (50, 20), (200, 5)] {
        let graph = lattice(width, depth);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{depth}")),
            &graph,
            |b, graph| {
                b.iter(|| black_box(planner::plan(black_box(graph)).unwrap()));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_hash_properties,
    bench_yaml_parse,
    bench_build_stack,
    bench_plan
);
criterion_main!(benches);
