//! Benchmarks for kernel mapping resolution and full Module passes
//!
//! Target: a 1000-node pass with 20 distinct kernels resolves each kernel once

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kernel_module_operator::crd::{KernelMapping, Module, ModuleSpec};
use kernel_module_operator::domain::{ModuleRef, ObjectKey};
use kernel_module_operator::kernel::{find_mapping, resolve, KernelVersion, MappingCache, OsConfig};
use kernel_module_operator::reconcile::{ModuleHooks, ModulePorts, ReconcileDriver};
use kernel_module_operator::{InMemoryCluster, OperatorConfig};
use std::collections::BTreeMap;
use std::sync::Arc;

fn mappings(count: usize) -> Vec<KernelMapping> {
    let mut rules: Vec<KernelMapping> = (0..count)
        .map(|i| KernelMapping {
            regexp: Some(format!(r"^4\.{}\.\d+$", i)),
            container_image: Some("quay.io/acme/kmod:${KERNEL_FULL_VERSION}".into()),
            ..Default::default()
        })
        .collect();
    rules.push(KernelMapping {
        regexp: Some(r"^.+$".into()),
        container_image: Some("quay.io/acme/kmod:${KERNEL_FULL_VERSION}".into()),
        ..Default::default()
    });
    rules
}

fn spec(rules: Vec<KernelMapping>) -> ModuleSpec {
    ModuleSpec {
        selector: BTreeMap::from([("role".to_string(), "worker".to_string())]),
        module_name: "kmod".into(),
        module_parameters: vec![],
        container_image: None,
        build: None,
        sign: None,
        kernel_mappings: rules,
        device_plugin: None,
        image_repo_secret: None,
        service_account_name: None,
    }
}

fn bench_find_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping_resolution");
    group.throughput(Throughput::Elements(1));

    let kernel = KernelVersion::normalize("5.14.0-284.el9.x86_64");
    for count in [1usize, 10, 50] {
        let rules = mappings(count);
        group.bench_with_input(BenchmarkId::new("find_mapping", count), &rules, |b, rules| {
            b.iter(|| find_mapping(black_box(&kernel), rules));
        });
    }

    group.finish();
}

fn bench_cached_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping_resolution");
    group.throughput(Throughput::Elements(1000));

    let module = ModuleRef::new("kmod", "drivers");
    let spec = spec(mappings(10));
    let os = OsConfig::default();
    let kernels: Vec<KernelVersion> = (0..1000)
        .map(|i| KernelVersion::normalize(&format!("5.14.0-{}", i % 20)))
        .collect();

    group.bench_function("cached_1000_nodes_20_kernels", |b| {
        b.iter(|| {
            let mut cache = MappingCache::new();
            for kernel in &kernels {
                let _ = cache.get_or_resolve(kernel, |k| {
                    let rule = find_mapping(k, &spec.kernel_mappings)?.ok_or_else(|| {
                        kernel_module_operator::Error::NoKernelMapping {
                            kernel_version: k.to_string(),
                        }
                    })?;
                    resolve(&module, &spec, rule, k, &os)
                });
            }
            black_box(cache.resolutions())
        });
    });

    group.finish();
}

fn bench_module_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("module_pass");
    group.sample_size(20);

    let cluster = Arc::new(InMemoryCluster::new());
    for i in 0..200 {
        cluster.add_node(
            &format!("worker-{:03}", i),
            &format!("5.14.0-{}", i % 10),
            &[("role", "worker")],
        );
    }
    for i in 0..10 {
        cluster.push_image(&format!("quay.io/acme/kmod:5.14.0-{}", i));
    }
    let mut module = Module::new("kmod", spec(mappings(5)));
    module.metadata.namespace = Some("drivers".into());
    module.metadata.uid = Some("uid-1".into());
    cluster.add_module(module);

    let ports = ModulePorts {
        modules: cluster.clone(),
        nodes: cluster.clone(),
        jobs: cluster.clone(),
        workloads: cluster.clone(),
        node_state: cluster.clone(),
        registry: cluster.clone(),
    };
    let driver = ReconcileDriver::new(ModuleHooks::new(Arc::new(OperatorConfig::default()), ports));
    let key = ObjectKey::namespaced("drivers", "kmod");

    group.bench_function("steady_state_200_nodes", |b| {
        b.iter(|| tokio_test::block_on(driver.reconcile(black_box(&key))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_find_mapping,
    bench_cached_resolution,
    bench_module_pass
);
criterion_main!(benches);
