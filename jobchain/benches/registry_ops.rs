//! Benchmarks for the hot paths of job scheduling using criterion.
//!
//! These benchmarks measure:
//! - Operation flag lookups in the registry
//! - Plugin validation against configured ranges
//! - Dependency assignment against an in-memory store
//! - The update contract on a single record

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use jobchain::*;
use jobchain_testkit::{RecordingTransport, SamplePlugin, entry};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn bench_flag_lookup(c: &mut Criterion) {
    let registry = OperationRegistry::with_core_operations();

    c.bench_function("registry_is_parallelizable", |b| {
        b.iter(|| {
            for code in 1..=23 {
                let code = OperationCode::new(code);
                std::hint::black_box(registry.is_parallelizable(code));
            }
        })
    });
}

fn bench_plugin_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("plugin_validation");

    for plugins in [1usize, 10, 50] {
        let mut catalog = PluginCatalog::new();
        let mut ranges = BTreeMap::new();
        for i in 0..plugins {
            let plugin_id = format!("plugin-{i}");
            let start = 1_000 + (i as u32) * 10;
            let range = PluginRange::new(start, start + 9);
            ranges.insert(plugin_id.clone(), range);
            catalog
                .register(Arc::new(SamplePlugin::new(plugin_id)))
                .expect("unique plugin id");
        }

        let id = BenchmarkId::from_parameter(plugins);
        group.bench_with_input(id, &plugins, |b, _| {
            b.iter(|| catalog.validate(&ranges).expect("valid plugins"))
        });
    }

    group.finish();
}

fn bench_assign_dependency(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("assign_dependency");

    for existing in [10usize, 1_000] {
        let store = Arc::new(InMemoryJobStore::new());
        rt.block_on(async {
            for i in 0..existing {
                let job = JobRecord::new(
                    OwnerId(1),
                    Some(TargetRef::Entry(entry((i % 10) as i64))),
                    codes::EDIT_ENTRY,
                    "",
                    JobParams::empty(),
                );
                store.insert(job).await.expect("insert");
            }
        });
        let resolver = DependencyResolver::new(
            store,
            Arc::new(OperationRegistry::with_core_operations()),
            Arc::new(RecordingTransport::new()),
            JobEventBus::default(),
            DependencyConfig::default(),
            chrono::Duration::hours(24),
        );

        let id = BenchmarkId::from_parameter(existing);
        group.bench_with_input(id, &existing, |b, _| {
            b.to_async(&rt).iter(|| async {
                let mut job = JobRecord::new(
                    OwnerId(1),
                    Some(TargetRef::Entry(entry(3))),
                    codes::EDIT_ENTRY,
                    "",
                    JobParams::empty(),
                );
                resolver.assign_dependency(&mut job).await.expect("assign");
                job
            })
        });
    }

    group.finish();
}

fn bench_apply_update(c: &mut Criterion) {
    let update = JobUpdate::status(JobStatus::Processing).with_text("42%");

    c.bench_function("apply_update", |b| {
        b.iter_batched(
            || {
                JobRecord::new(
                    OwnerId(1),
                    Some(TargetRef::Entry(entry(1))),
                    codes::EDIT_ENTRY,
                    "",
                    JobParams::empty(),
                )
            },
            |mut record| record.apply_update(&update, |_| true, Utc::now()),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_flag_lookup,
    bench_plugin_validation,
    bench_assign_dependency,
    bench_apply_update
);
criterion_main!(benches);
