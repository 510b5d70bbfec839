use batchguard::aggregate::{AggregateCache, GroupBy, Measure};
use batchguard::batch::{Batch, RowOperation};
use batchguard::cascade::{CascadeRouter, DeleteEmptyParent};
use batchguard::catalog::schema::TableSchema;
use batchguard::catalog::types::{ColumnType, Row};
use batchguard::config::CoordinatorConfig;
use batchguard::coordinator::BatchCoordinator;
use batchguard::policy::{CapPolicy, GuardPolicy};
use batchguard::storage::MemoryTable;
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

const SEEDED_ROWS: i64 = 10_000;
const GROUPS: i64 = 100;
const BATCH_ROWS: i64 = 256;

fn emp(id: i64, salary: f64) -> Row {
    Row::from_values(vec![id.into(), (id % GROUPS).into(), salary.into()])
}

fn seeded_table() -> MemoryTable {
    let schema = TableSchema::new("employees", "emp_id")
        .column("emp_id", ColumnType::Integer, false)
        .column("dept_id", ColumnType::Integer, false)
        .column("salary", ColumnType::Float, true);
    let table = MemoryTable::new(schema).expect("table");
    table
        .seed((0..SEEDED_ROWS).map(|id| emp(id, 1_000.0 + (id % 37) as f64 * 50.0)))
        .expect("seed");
    table
}

fn insert_batch() -> Batch {
    (SEEDED_ROWS..SEEDED_ROWS + BATCH_ROWS)
        .map(|id| RowOperation::insert(emp(id, 1_000.0 + (id % 7) as f64 * 1_000.0)))
        .collect()
}

fn delete_batch() -> Batch {
    (0..BATCH_ROWS)
        .map(|id| RowOperation::delete(emp(id, 1_000.0 + (id % 37) as f64 * 50.0)))
        .collect()
}

fn bench_aggregation(c: &mut Criterion) {
    let rows = seeded_table().rows();
    c.bench_function("aggregate_cache_10k_rows", |b| {
        b.iter(|| {
            black_box(
                AggregateCache::from_rows(&rows, GroupBy::column(1), Measure::Column(2))
                    .expect("aggregate"),
            )
        })
    });
}

fn bench_batches(c: &mut Criterion) {
    let capped = BatchCoordinator::builder(GroupBy::column(1))
        .policy(CapPolicy::group_average("salary_cap", 2, 1.5))
        .config(CoordinatorConfig::development())
        .build()
        .expect("coordinator");
    c.bench_function("capped_insert_batch", |b| {
        b.iter_batched(
            || (seeded_table(), insert_batch()),
            |(table, batch)| black_box(capped.run(batch, &table, &table).expect("run")),
            BatchSize::LargeInput,
        )
    });

    let parents = Arc::new(
        MemoryTable::new(
            TableSchema::new("departments", "dept_id").column(
                "dept_id",
                ColumnType::Integer,
                false,
            ),
        )
        .expect("departments"),
    );
    let guarded = BatchCoordinator::builder(GroupBy::column(1))
        .policy(GuardPolicy::new("keep_one"))
        .after_row(DeleteEmptyParent::new("departments"))
        .cascade_action(Arc::new(CascadeRouter::new().route("departments", parents)))
        .build()
        .expect("coordinator");
    c.bench_function("guarded_delete_batch", |b| {
        b.iter_batched(
            || (seeded_table(), delete_batch()),
            |(table, batch)| black_box(guarded.run(batch, &table, &table).expect("run")),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_aggregation, bench_batches);
criterion_main!(benches);
