use cellsync_core::ot::{apply, transform, Component, Side};
use cellsync_core::{paths, SharedDocument, Unit};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

fn notebook(units: usize) -> serde_json::Value {
    let units = (0..units).map(|i| Unit::code(format!("x{i} = {i}"))).collect();
    SharedDocument::new(units).to_value().unwrap()
}

fn bench_apply_text_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("OT Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("apply_text_insert", |b| {
        let doc = notebook(100);
        let op = vec![Component::TextInsert {
            path: paths::unit_source(50),
            offset: 2,
            text: "y".into(),
        }];
        b.iter(|| {
            let mut doc = doc.clone();
            apply(&mut doc, black_box(&op)).unwrap();
            black_box(doc);
        })
    });

    group.finish();
}

fn bench_transform_against_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("OT Operations");

    // One incoming edit rebased over 64 concurrent structural and text edits.
    let log: Vec<Vec<Component>> = (0..64)
        .map(|i| {
            if i % 2 == 0 {
                vec![Component::ListInsert { path: paths::unit(0), value: Unit::code("").to_value() }]
            } else {
                vec![Component::TextInsert { path: paths::unit_source(10), offset: 0, text: "z".into() }]
            }
        })
        .collect();
    let incoming = vec![Component::TextInsert {
        path: paths::unit_source(10),
        offset: 0,
        text: "a".into(),
    }];
    group.throughput(Throughput::Elements(log.len() as u64));

    group.bench_function("transform_over_64", |b| {
        b.iter(|| {
            let rebased = log
                .iter()
                .fold(incoming.clone(), |op, other| transform(&op, other, Side::Left));
            black_box(rebased);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_apply_text_edit, bench_transform_against_log);
criterion_main!(benches);
