use super::{BatchCoordinator, CancelHandle, StatementHook};
use crate::aggregate::{AggregateCache, GroupBy, Measure};
use crate::batch::result::{BatchResult, RowOutcome};
use crate::batch::{Batch, RowOperation};
use crate::cascade::DeleteEmptyParent;
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{ColumnType, Row, Value};
use crate::config::CoordinatorConfig;
use crate::coordinator::phase::BatchPhase;
use crate::error::{BatchError, BatchErrorCode};
use crate::policy::{CapPolicy, GuardPolicy};
use crate::storage::MemoryTable;
use crate::{DiagnosticEvent, DiagnosticsHook};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn employees() -> MemoryTable {
    let schema = TableSchema::new("employees", "emp_id")
        .column("emp_id", ColumnType::Integer, false)
        .column("dept_id", ColumnType::Integer, false)
        .column("salary", ColumnType::Float, true);
    let table = MemoryTable::new(schema).expect("table");
    table
        .seed([emp(1, 10, 1000.0), emp(2, 10, 2000.0), emp(3, 20, 2100.0)])
        .expect("seed");
    table
}

fn emp(id: i64, dept: i64, salary: f64) -> Row {
    Row::from_values(vec![id.into(), dept.into(), salary.into()])
}

#[derive(Default)]
struct Counter {
    events: AtomicUsize,
    finished: AtomicUsize,
}

impl DiagnosticsHook for Counter {
    fn on_event(&self, event: &DiagnosticEvent) {
        self.events.fetch_add(1, Ordering::SeqCst);
        if matches!(event, DiagnosticEvent::BatchFinished { .. }) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Panicking;

impl DiagnosticsHook for Panicking {
    fn on_event(&self, _event: &DiagnosticEvent) {
        panic!("diagnostics hook exploded");
    }
}

#[test]
fn builder_derives_measure_from_policies() {
    let coordinator = BatchCoordinator::builder(GroupBy::column(1))
        .policy(CapPolicy::group_average("cap", 2, 1.5))
        .build()
        .expect("build");
    assert_eq!(coordinator.measure(), Measure::Column(2));
    assert!(!coordinator.is_global_scope());

    let global = BatchCoordinator::builder(GroupBy::column(1))
        .policy(CapPolicy::global_average("cap", 2, 1.2))
        .build()
        .expect("build");
    assert!(global.is_global_scope());
}

#[test]
fn builder_rejects_conflicting_measures() {
    let err = BatchCoordinator::builder(GroupBy::column(1))
        .policy(CapPolicy::group_average("a", 2, 1.5))
        .policy(CapPolicy::group_average("b", 0, 1.5))
        .build()
        .err()
        .expect("two measure columns");
    assert_eq!(err.code(), BatchErrorCode::ConfigurationError);

    let err = BatchCoordinator::builder(GroupBy::column(1))
        .measure(Measure::RowsOnly)
        .policy(CapPolicy::group_average("a", 2, 1.5))
        .build()
        .err()
        .expect("measure overridden away");
    assert_eq!(err.code(), BatchErrorCode::ConfigurationError);
}

#[test]
fn builder_requires_cascade_action_for_after_row_hooks() {
    let err = BatchCoordinator::builder(GroupBy::column(1))
        .after_row(DeleteEmptyParent::new("departments"))
        .build()
        .err()
        .expect("no cascade action");
    assert_eq!(err.code(), BatchErrorCode::ConfigurationError);
}

#[test]
fn clean_batch_walks_every_phase() {
    let table = employees();
    let coordinator = BatchCoordinator::builder(GroupBy::column(1))
        .policy(GuardPolicy::new("keep_one"))
        .build()
        .expect("build");
    let counter = Arc::new(Counter::default());
    coordinator.add_diagnostics_hook(counter.clone());

    let batch = Batch::new(vec![RowOperation::insert(emp(4, 20, 1500.0))]).labeled("hire");
    let result = coordinator.run(batch, &table, &table).expect("run");
    assert_eq!(result.phase, BatchPhase::Done);
    assert_eq!(result.label.as_deref(), Some("hire"));
    assert_eq!(result.rows_scanned, 3);
    assert_eq!(result.groups_aggregated, 2);
    assert_eq!(result.outcome(0), Some(&RowOutcome::Applied));
    assert_eq!(table.len(), 4);
    assert_eq!(counter.finished.load(Ordering::SeqCst), 1);
    // Aggregated + BatchFinished
    assert_eq!(counter.events.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_diagnostics_hook_does_not_fail_batch() {
    let table = employees();
    let coordinator = BatchCoordinator::builder(GroupBy::column(1))
        .build()
        .expect("build");
    let panicking: Arc<dyn DiagnosticsHook> = Arc::new(Panicking);
    coordinator.add_diagnostics_hook(panicking.clone());
    let result = coordinator
        .run(
            Batch::new(vec![RowOperation::insert(emp(4, 10, 1.0))]),
            &table,
            &table,
        )
        .expect("run");
    assert_eq!(result.applied_count(), 1);

    coordinator.remove_diagnostics_hook(&panicking);
    assert!(coordinator.diagnostics.lock().is_empty());
}

#[test]
fn cancelled_before_first_row_writes_nothing() {
    let table = employees();
    let coordinator = BatchCoordinator::builder(GroupBy::column(1))
        .build()
        .expect("build");
    let cancel = CancelHandle::new();
    cancel.cancel();
    let err = coordinator
        .run_cancellable(
            Batch::new(vec![RowOperation::insert(emp(4, 10, 1.0))]),
            &table,
            &table,
            &cancel,
        )
        .expect_err("cancelled");
    assert!(matches!(err, BatchError::Cancelled { rows_applied: 0 }));
    assert_eq!(table.len(), 3);
}

#[test]
fn oversized_batch_is_refused_up_front() {
    let table = employees();
    let coordinator = BatchCoordinator::builder(GroupBy::column(1))
        .config(CoordinatorConfig::default().with_max_batch_rows(1))
        .build()
        .expect("build");
    let batch = Batch::new(vec![
        RowOperation::insert(emp(4, 10, 1.0)),
        RowOperation::insert(emp(5, 10, 1.0)),
    ]);
    let err = coordinator.run(batch, &table, &table).expect_err("too big");
    assert_eq!(err.code(), BatchErrorCode::InvalidBatch);
    assert_eq!(table.len(), 3);
}

struct Veto;

impl StatementHook for Veto {
    fn before_statement(&self, cache: &AggregateCache) -> Result<(), BatchError> {
        if cache.contains(&Value::Integer(20)) {
            return Err(BatchError::ConfigurationError {
                message: "department 20 is frozen".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct Summary {
    seen: AtomicUsize,
}

impl StatementHook for Summary {
    fn after_statement(&self, result: &BatchResult) {
        self.seen.store(result.rows.len(), Ordering::SeqCst);
    }
}

#[test]
fn statement_hooks_bracket_the_row_loop() {
    let table = employees();
    let summary = Arc::new(Summary::default());
    let coordinator = BatchCoordinator::builder(GroupBy::column(1))
        .statement_hook(summary.clone())
        .build()
        .expect("build");
    coordinator
        .run(
            Batch::new(vec![
                RowOperation::insert(emp(4, 10, 1.0)),
                RowOperation::delete(emp(1, 10, 1000.0)),
            ]),
            &table,
            &table,
        )
        .expect("run");
    assert_eq!(summary.seen.load(Ordering::SeqCst), 2);

    let vetoed = BatchCoordinator::builder(GroupBy::column(1))
        .statement_hook(Arc::new(Veto))
        .build()
        .expect("build");
    let before = table.len();
    let err = vetoed
        .run(
            Batch::new(vec![RowOperation::insert(emp(9, 10, 1.0))]),
            &table,
            &table,
        )
        .expect_err("veto");
    assert_eq!(err.code(), BatchErrorCode::ConfigurationError);
    assert_eq!(table.len(), before);
}
