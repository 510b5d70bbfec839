use crate::batch::Batch;
use crate::batch::result::BatchResult;
use crate::coordinator::{BatchCoordinator, CancelHandle};
use crate::error::BatchError;
use crate::source::{RowSink, RowSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs batches for async callers on the blocking pool, with at most
/// `max_inflight_batches` in flight at once.
pub struct BatchExecutor {
    coordinator: Arc<BatchCoordinator>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl BatchExecutor {
    pub fn new(coordinator: Arc<BatchCoordinator>) -> Self {
        let permits = coordinator.config().max_inflight_batches;
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(permits)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator> {
        &self.coordinator
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuses new submissions. Batches already running finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn submit(
        &self,
        batch: Batch,
        source: Arc<dyn RowSource>,
        sink: Arc<dyn RowSink>,
    ) -> Result<BatchResult, BatchError> {
        self.submit_cancellable(batch, source, sink, CancelHandle::new())
            .await
    }

    pub async fn submit_cancellable(
        &self,
        batch: Batch,
        source: Arc<dyn RowSource>,
        sink: Arc<dyn RowSink>,
        cancel: CancelHandle,
    ) -> Result<BatchResult, BatchError> {
        if self.is_closed() {
            return Err(BatchError::Unavailable {
                message: "batch executor closed".into(),
            });
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BatchError::Unavailable {
                message: "batch executor closed".into(),
            })?;

        let coordinator = Arc::clone(&self.coordinator);
        debug!(label = ?batch.label, rows = batch.len(), "submitting batch");
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            coordinator.run_cancellable(batch, source.as_ref(), sink.as_ref(), &cancel)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "batch worker did not complete");
            BatchError::Unavailable {
                message: format!("batch worker did not complete: {e}"),
            }
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::BatchExecutor;
    use crate::aggregate::GroupBy;
    use crate::batch::{Batch, RowOperation};
    use crate::catalog::schema::TableSchema;
    use crate::catalog::types::{ColumnType, Row};
    use crate::coordinator::BatchCoordinator;
    use crate::error::BatchErrorCode;
    use crate::storage::MemoryTable;
    use std::sync::Arc;

    fn table() -> Arc<MemoryTable> {
        let schema = TableSchema::new("employees", "emp_id")
            .column("emp_id", ColumnType::Integer, false)
            .column("dept_id", ColumnType::Integer, false);
        Arc::new(MemoryTable::new(schema).expect("table"))
    }

    #[tokio::test]
    async fn closed_executor_refuses_batches() {
        let coordinator = BatchCoordinator::builder(GroupBy::column(1))
            .build()
            .expect("build");
        let executor = BatchExecutor::new(Arc::new(coordinator));
        let t = table();
        executor.close();
        let err = executor
            .submit(
                Batch::new(vec![RowOperation::insert(Row::from_values(vec![
                    1.into(),
                    10.into(),
                ]))]),
                t.clone(),
                t.clone(),
            )
            .await
            .expect_err("closed");
        assert_eq!(err.code(), BatchErrorCode::Unavailable);
        assert!(t.is_empty());
    }

    #[tokio::test]
    async fn permits_are_returned_after_each_batch() {
        let coordinator = BatchCoordinator::builder(GroupBy::column(1))
            .build()
            .expect("build");
        let executor = BatchExecutor::new(Arc::new(coordinator));
        let before = executor.available_permits();
        let t = table();
        let result = executor
            .submit(
                Batch::new(vec![RowOperation::insert(Row::from_values(vec![
                    1.into(),
                    10.into(),
                ]))]),
                t.clone(),
                t.clone(),
            )
            .await
            .expect("submit");
        assert_eq!(result.applied_count(), 1);
        assert_eq!(executor.available_permits(), before);
    }
}
