pub mod lock;
pub mod phase;
pub mod progress;

#[cfg(test)]
mod tests;

use crate::aggregate::{AggregateCache, GroupBy, Measure};
use crate::batch::result::{BatchResult, CascadeStatus, RowOutcome, RowReport};
use crate::batch::{Batch, RowOperation};
use crate::cascade::{AfterRowHook, CascadeAction, CascadeQueue};
use crate::config::{CoordinatorConfig, RejectionMode};
use crate::error::BatchError;
use crate::policy::{PolicyChain, PolicyContext, PolicyOutcome, RowPolicy};
use crate::source::{RowSink, RowSource};
use crate::{DiagnosticEvent, DiagnosticsHook};
use lock::{GLOBAL_GROUP_TOKEN, GroupLockManager};
use parking_lot::Mutex;
use phase::{BatchPhase, PhaseMachine};
use progress::BatchProgress;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked between rows.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Statement-level callbacks around the row loop.
pub trait StatementHook: Send + Sync {
    /// Runs once the aggregate cache is populated, before any row. An error
    /// fails the batch before anything is written.
    fn before_statement(&self, _cache: &AggregateCache) -> Result<(), BatchError> {
        Ok(())
    }

    /// Runs after every row and cascade has been processed.
    fn after_statement(&self, _result: &BatchResult) {}
}

pub struct CoordinatorBuilder {
    group_by: GroupBy,
    measure: Option<Measure>,
    config: CoordinatorConfig,
    policies: PolicyChain,
    after_row: Vec<Arc<dyn AfterRowHook>>,
    cascade: Option<Arc<dyn CascadeAction>>,
    statement_hooks: Vec<Arc<dyn StatementHook>>,
}

impl CoordinatorBuilder {
    /// Overrides the measure derived from the registered policies.
    pub fn measure(mut self, measure: Measure) -> Self {
        self.measure = Some(measure);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(self, policy: impl RowPolicy + 'static) -> Self {
        self.shared_policy(Arc::new(policy))
    }

    pub fn shared_policy(mut self, policy: Arc<dyn RowPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn after_row(mut self, hook: impl AfterRowHook + 'static) -> Self {
        self.after_row.push(Arc::new(hook));
        self
    }

    pub fn shared_after_row(mut self, hook: Arc<dyn AfterRowHook>) -> Self {
        self.after_row.push(hook);
        self
    }

    pub fn cascade_action(mut self, action: Arc<dyn CascadeAction>) -> Self {
        self.cascade = Some(action);
        self
    }

    pub fn statement_hook(mut self, hook: Arc<dyn StatementHook>) -> Self {
        self.statement_hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<BatchCoordinator, BatchError> {
        self.config.validate()?;

        let mut required: Option<usize> = None;
        let mut global_scope = false;
        for policy in self.policies.policies() {
            let req = policy.requirements();
            global_scope |= req.global;
            match (required, req.measure_column) {
                (Some(a), Some(b)) if a != b => {
                    return Err(BatchError::ConfigurationError {
                        message: format!(
                            "policies measure different columns ({a} and {b}); one cache holds one measure"
                        ),
                    });
                }
                (None, Some(b)) => required = Some(b),
                _ => {}
            }
        }

        let measure = match (self.measure, required) {
            (Some(Measure::Column(explicit)), Some(needed)) if explicit != needed => {
                return Err(BatchError::ConfigurationError {
                    message: format!(
                        "measure column {explicit} does not match column {needed} used by policies"
                    ),
                });
            }
            (Some(Measure::RowsOnly), Some(needed)) => {
                return Err(BatchError::ConfigurationError {
                    message: format!("policies need measure column {needed} but none is aggregated"),
                });
            }
            (Some(explicit), _) => explicit,
            (None, Some(needed)) => Measure::Column(needed),
            (None, None) => Measure::RowsOnly,
        };

        if !self.after_row.is_empty() && self.cascade.is_none() {
            return Err(BatchError::ConfigurationError {
                message: "after-row hooks registered without a cascade action".into(),
            });
        }

        Ok(BatchCoordinator {
            config: self.config,
            group_by: self.group_by,
            measure,
            policies: self.policies,
            after_row: self.after_row,
            cascade: self.cascade,
            statement_hooks: self.statement_hooks,
            diagnostics: Mutex::new(Vec::new()),
            locks: GroupLockManager::default(),
            global_scope,
        })
    }
}

/// Runs batches through aggregation, per-row policies, and deferred
/// cascades, in that order.
pub struct BatchCoordinator {
    config: CoordinatorConfig,
    group_by: GroupBy,
    measure: Measure,
    policies: PolicyChain,
    after_row: Vec<Arc<dyn AfterRowHook>>,
    cascade: Option<Arc<dyn CascadeAction>>,
    statement_hooks: Vec<Arc<dyn StatementHook>>,
    diagnostics: Mutex<Vec<Arc<dyn DiagnosticsHook>>>,
    locks: GroupLockManager,
    global_scope: bool,
}

impl BatchCoordinator {
    pub fn builder(group_by: GroupBy) -> CoordinatorBuilder {
        CoordinatorBuilder {
            group_by,
            measure: None,
            config: CoordinatorConfig::default(),
            policies: PolicyChain::new(),
            after_row: Vec::new(),
            cascade: None,
            statement_hooks: Vec::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    pub fn measure(&self) -> Measure {
        self.measure
    }

    pub fn policies(&self) -> &PolicyChain {
        &self.policies
    }

    /// True when some policy reads table-wide aggregates, which makes every
    /// batch conflict with every other.
    pub fn is_global_scope(&self) -> bool {
        self.global_scope
    }

    pub fn add_diagnostics_hook(&self, hook: Arc<dyn DiagnosticsHook>) {
        self.diagnostics.lock().push(hook);
    }

    pub fn remove_diagnostics_hook(&self, hook: &Arc<dyn DiagnosticsHook>) {
        let mut hooks = self.diagnostics.lock();
        hooks.retain(|existing| !Arc::ptr_eq(existing, hook));
    }

    pub fn run(
        &self,
        batch: Batch,
        source: &dyn RowSource,
        sink: &dyn RowSink,
    ) -> Result<BatchResult, BatchError> {
        self.execute(batch, source, sink, None)
    }

    pub fn run_cancellable(
        &self,
        batch: Batch,
        source: &dyn RowSource,
        sink: &dyn RowSink,
        cancel: &CancelHandle,
    ) -> Result<BatchResult, BatchError> {
        self.execute(batch, source, sink, Some(cancel))
    }

    fn execute(
        &self,
        batch: Batch,
        source: &dyn RowSource,
        sink: &dyn RowSink,
        cancel: Option<&CancelHandle>,
    ) -> Result<BatchResult, BatchError> {
        batch.validate(self.config.max_batch_rows)?;

        let _guard = if self.config.group_locking_enabled {
            Some(
                self.locks
                    .acquire_all(&self.lock_tokens(&batch), self.config.lock_timeout())?,
            )
        } else {
            None
        };

        let mut machine = PhaseMachine::new();
        let mut result = BatchResult::new(batch.label.clone());
        let outcome = self.run_phases(batch, source, sink, cancel, &mut machine, &mut result);
        if outcome.is_err() {
            machine.fail();
        }
        result.phase = machine.current();

        self.emit(&DiagnosticEvent::BatchFinished {
            label: result.label.clone(),
            phase: result.phase,
            rows_applied: result.applied_count(),
            rows_rejected: result.rejections().count(),
        });

        match outcome {
            Ok(()) => {
                info!(
                    label = ?result.label,
                    applied = result.applied_count(),
                    rejected = result.rejections().count(),
                    cascades = result.cascades_executed(),
                    "batch finished"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(label = ?result.label, code = err.code_str(), error = %err, "batch failed");
                Err(err)
            }
        }
    }

    fn run_phases(
        &self,
        batch: Batch,
        source: &dyn RowSource,
        sink: &dyn RowSink,
        cancel: Option<&CancelHandle>,
        machine: &mut PhaseMachine,
        result: &mut BatchResult,
    ) -> Result<(), BatchError> {
        machine.advance(BatchPhase::PreStatement)?;
        result.phase = machine.current();
        let cache = AggregateCache::populate(source, self.group_by, self.measure)?;
        result.rows_scanned = cache.global().rows as usize;
        result.groups_aggregated = cache.len();
        for hook in &self.statement_hooks {
            hook.before_statement(&cache)?;
        }
        info!(
            label = ?result.label,
            rows_scanned = result.rows_scanned,
            groups = result.groups_aggregated,
            "aggregate cache populated"
        );
        self.emit(&DiagnosticEvent::Aggregated {
            label: result.label.clone(),
            rows_scanned: result.rows_scanned,
            groups: result.groups_aggregated,
        });

        machine.advance(BatchPhase::RowProcessing)?;
        result.phase = machine.current();
        let mut progress = BatchProgress::default();
        let mut cascades = CascadeQueue::default();
        for (index, op) in batch.operations.into_iter().enumerate() {
            check_cancelled(cancel, &progress)?;
            self.process_row(index, op, &cache, &mut progress, &mut cascades, sink, result)?;
        }
        check_cancelled(cancel, &progress)?;

        machine.advance(BatchPhase::PostStatement)?;
        result.phase = machine.current();
        if let Some(action) = &self.cascade {
            debug!(queued = cascades.len(), "running deferred cascades");
            let ctx = PolicyContext {
                cache: &cache,
                progress: &progress,
                limit_scale: self.config.limit_scale,
            };
            result.cascades = cascades.run(action.as_ref(), &ctx, |report| {
                if report.status == CascadeStatus::Superseded {
                    debug!(request = %report.request, "cascade no longer needed");
                }
                if let Some(event) = DiagnosticEvent::from_cascade(report) {
                    if let DiagnosticEvent::CascadeFailed { reason, .. } = &event {
                        warn!(request = %report.request, reason = %reason, "cascade failed");
                    }
                    self.emit(&event);
                }
            });
        }
        for hook in &self.statement_hooks {
            hook.after_statement(result);
        }

        machine.advance(BatchPhase::Done)?;
        result.phase = machine.current();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_row(
        &self,
        index: usize,
        mut op: RowOperation,
        cache: &AggregateCache,
        progress: &mut BatchProgress,
        cascades: &mut CascadeQueue,
        sink: &dyn RowSink,
        result: &mut BatchResult,
    ) -> Result<(), BatchError> {
        let kind = op.kind();
        let ctx = PolicyContext {
            cache,
            progress: &*progress,
            limit_scale: self.config.limit_scale,
        };
        let outcome = match self.policies.evaluate(&op, &ctx)? {
            PolicyOutcome::Accept => RowOutcome::Applied,
            PolicyOutcome::Mutate(row) => {
                if let Some(submitted) = op.after().cloned() {
                    debug!(index, "row rewritten by policy");
                    self.emit(&DiagnosticEvent::RowMutated {
                        index,
                        submitted,
                        applied: row.clone(),
                    });
                }
                op.replace_after(row.clone());
                RowOutcome::Mutated { final_row: row }
            }
            PolicyOutcome::Reject(reason) => {
                warn!(index, %kind, reason = %reason, "row rejected");
                self.emit(&DiagnosticEvent::RowRejected {
                    index,
                    reason: reason.clone(),
                });
                result.rows.push(RowReport {
                    index,
                    kind,
                    outcome: RowOutcome::Rejected {
                        reason: reason.clone(),
                    },
                });
                if self.config.rejection_mode == RejectionMode::AbortBatch {
                    return Err(BatchError::PolicyRejection {
                        index,
                        reason,
                        rows_applied: progress.applied(),
                    });
                }
                return Ok(());
            }
        };

        sink.commit(&op).map_err(|e| BatchError::ApplyFailure {
            index,
            message: e.to_string(),
            rows_applied: progress.applied(),
        })?;
        progress.record(&op, &self.group_by);
        result.rows.push(RowReport {
            index,
            kind,
            outcome,
        });

        if self.after_row.is_empty() {
            return Ok(());
        }
        let ctx = PolicyContext {
            cache,
            progress: &*progress,
            limit_scale: self.config.limit_scale,
        };
        for hook in &self.after_row {
            for request in hook.after_row(index, &op, &ctx) {
                if !cascades.enqueue(index, request, hook) {
                    debug!(index, "duplicate cascade request collapsed");
                }
            }
        }
        Ok(())
    }

    fn lock_tokens(&self, batch: &Batch) -> Vec<String> {
        if self.global_scope {
            return vec![GLOBAL_GROUP_TOKEN.to_string()];
        }
        batch
            .touched_groups(&self.group_by)
            .iter()
            .map(|key| format!("{key:?}"))
            .collect()
    }

    fn emit(&self, event: &DiagnosticEvent) {
        let hooks = self.diagnostics.lock().clone();
        for hook in &hooks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook.on_event(event)))
                .is_err()
            {
                warn!("diagnostics hook panicked while handling event");
            }
        }
    }
}

fn check_cancelled(
    cancel: Option<&CancelHandle>,
    progress: &BatchProgress,
) -> Result<(), BatchError> {
    match cancel {
        Some(handle) if handle.is_cancelled() => Err(BatchError::Cancelled {
            rows_applied: progress.applied(),
        }),
        _ => Ok(()),
    }
}
