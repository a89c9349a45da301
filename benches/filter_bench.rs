//! Filter compiler and formatting benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use wmi_sampler::{
    compile_filters, format_property_values, ComparisonOp, CounterType, CounterTypeMap, CounterTypeRegistry,
    FilterGroup, FilterItem, FilterSpec, FilterValue, PropertyBag, FREQUENCY_SYS100NS, TIMESTAMP_SYS100NS,
};

fn process_filters(groups: usize) -> FilterSpec {
    (0..groups).fold(FilterSpec::new(), |spec, i| {
        spec.or(FilterGroup::new()
            .with("Name", format!("worker-{}%", i))
            .with("Priority", FilterValue::compare(ComparisonOp::Ge, 8))
            .with(
                "CommandLine",
                FilterValue::list(vec![
                    FilterItem::from("%--serve%"),
                    FilterItem::compare(ComparisonOp::NotLike, "%--debug%"),
                ]),
            ))
    })
}

fn bench_compile_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_filters");
    for groups in [1usize, 4, 16] {
        let spec = process_filters(groups);
        group.bench_with_input(BenchmarkId::from_parameter(groups), &spec, |b, spec| {
            b.iter(|| compile_filters(black_box(spec), &["commandline"]))
        });
    }
    group.finish();
}

fn bench_format_row(c: &mut Criterion) {
    let mut types = CounterTypeMap::new();
    types.insert("PercentProcessorTime", CounterType::PERF_100NSEC_TIMER);
    types.insert("InterruptsPersec", CounterType::PERF_COUNTER_COUNTER);
    let registry = CounterTypeRegistry::with_builtins();

    let previous = PropertyBag::new()
        .with("Name", "_Total")
        .with("PercentProcessorTime", 1_000_000u64)
        .with("InterruptsPersec", 5_000u64)
        .with(TIMESTAMP_SYS100NS, 0u64)
        .with(FREQUENCY_SYS100NS, 10_000_000u64);
    let current = PropertyBag::new()
        .with("Name", "_Total")
        .with("PercentProcessorTime", 6_000_000u64)
        .with("InterruptsPersec", 9_000u64)
        .with(TIMESTAMP_SYS100NS, 10_000_000u64)
        .with(FREQUENCY_SYS100NS, 10_000_000u64);

    c.bench_function("format_property_values", |b| {
        b.iter(|| format_property_values(black_box(&previous), black_box(&current), &types, &registry))
    });
}

criterion_group!(benches, bench_compile_filters, bench_format_row);
criterion_main!(benches);
