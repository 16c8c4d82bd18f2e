use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use event_bus::partitioner::partition_for_key;
use event_contracts::{resolve_key, EventEnvelope, InvoiceCreated, SourceKeyStrategy};
use rust_decimal::Decimal;

fn invoice() -> EventEnvelope {
    EventEnvelope::new(InvoiceCreated::new(
        "INV-1",
        "EMP-7",
        "Initech",
        Decimal::new(10_000, 2),
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        Some("Quarterly retainer".to_string()),
    ))
    .with_correlation_id(Some("req-42".to_string()))
    .enrich()
}

fn bench_encode(c: &mut Criterion) {
    let envelope = invoice();
    c.bench_function("envelope_to_wire", |b| {
        b.iter(|| black_box(&envelope).to_wire().unwrap())
    });
}

fn bench_decode(c: &mut Criterion) {
    let wire = invoice().to_wire().unwrap();
    c.bench_function("envelope_from_wire", |b| {
        b.iter(|| EventEnvelope::from_wire(black_box(&wire)).unwrap())
    });
}

fn bench_partition(c: &mut Criterion) {
    let envelope = invoice();
    c.bench_function("resolve_key_and_partition", |b| {
        b.iter(|| {
            let key = resolve_key(None, &SourceKeyStrategy, black_box(&envelope));
            key.map(|k| partition_for_key(&k, 3))
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_partition);
criterion_main!(benches);
