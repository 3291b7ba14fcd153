//! Fixpoint performance benchmarks: transitive-closure recursion and
//! counting aggregation over varying input sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use c4::Client;

fn bench_transitive_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitive_closure");
    for size in [100u32, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let client = Client::make(0).unwrap();
                client
                    .install_str("edge(int8,int8) keys(0,1); path(int8,int8) keys(0,1);")
                    .unwrap();
                let facts: String =
                    (0..size).map(|i| format!("edge({i},{});", i + 1)).collect::<Vec<_>>().join("");
                client.install_str(&facts).unwrap();
                client.install_str("path(X,Y) :- edge(X,Y); path(X,Z) :- path(X,Y), edge(Y,Z);").unwrap();
                client.dump_table("path").unwrap();
                client.destroy();
            });
        });
    }
    group.finish();
}

fn bench_count_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_aggregation");
    for size in [1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let client = Client::make(0).unwrap();
                client.install_str("data(int8,int8) keys(0,1); counts(int8,int8) keys(0);").unwrap();
                let facts: String =
                    (0..size).map(|i| format!("data({},{i});", i % 10)).collect::<Vec<_>>().join("");
                client.install_str(&facts).unwrap();
                client.install_str("counts(G, count<V>) :- data(G,V);").unwrap();
                client.dump_table("counts").unwrap();
                client.destroy();
            });
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3));
    targets = bench_transitive_closure, bench_count_aggregation
}
criterion_main!(benches);
