pub mod cap;
pub mod guard;

use crate::aggregate::AggregateCache;
use crate::batch::RowOperation;
use crate::catalog::types::{Row, Value};
use crate::coordinator::progress::BatchProgress;
use crate::error::BatchError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use cap::{CapPolicy, LimitBasis};
pub use guard::{CountSource, GuardPolicy};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicyOutcome {
    Accept,
    /// Apply the row with this after image instead.
    Mutate(Row),
    Reject(String),
}

/// What a policy does when the cache holds no aggregate for the row's group.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MissingGroup {
    /// Abort the batch with a configuration error.
    #[default]
    Fail,
    Accept,
    Reject,
    /// Fall back to the table-wide aggregate.
    UseGlobal,
}

/// Aggregates a policy needs the coordinator to compute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyRequirements {
    pub measure_column: Option<usize>,
    /// Reads table-wide aggregates, so every concurrent batch conflicts.
    pub global: bool,
}

/// Read-only view handed to policies for one row.
pub struct PolicyContext<'a> {
    pub cache: &'a AggregateCache,
    pub progress: &'a BatchProgress,
    pub limit_scale: u32,
}

impl PolicyContext<'_> {
    pub fn round_limit(&self, limit: f64) -> f64 {
        let factor = 10f64.powi(self.limit_scale as i32);
        (limit * factor).round() / factor
    }

    pub fn group_key(&self, op: &RowOperation) -> Option<Value> {
        op.group_key(&self.cache.group_by())
    }
}

pub trait RowPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Decides what happens to `op`. `Err` is reserved for configuration
    /// problems; row-level violations are `Ok(PolicyOutcome::Reject(..))`.
    fn evaluate(
        &self,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, BatchError>;

    fn requirements(&self) -> PolicyRequirements {
        PolicyRequirements::default()
    }
}

/// Adapts a closure into a `RowPolicy`.
pub struct PolicyFn<F> {
    name: String,
    requirements: PolicyRequirements,
    f: F,
}

impl<F> PolicyFn<F>
where
    F: Fn(&RowOperation, &PolicyContext<'_>) -> Result<PolicyOutcome, BatchError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            requirements: PolicyRequirements::default(),
            f,
        }
    }

    pub fn with_requirements(mut self, requirements: PolicyRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

impl<F> RowPolicy for PolicyFn<F>
where
    F: Fn(&RowOperation, &PolicyContext<'_>) -> Result<PolicyOutcome, BatchError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, BatchError> {
        (self.f)(op, ctx)
    }

    fn requirements(&self) -> PolicyRequirements {
        self.requirements
    }
}

/// Policies evaluated in order. A `Mutate` feeds the rewritten row to the
/// next policy; the first `Reject` wins.
#[derive(Clone, Default)]
pub struct PolicyChain {
    policies: Vec<Arc<dyn RowPolicy>>,
}

impl PolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, policy: Arc<dyn RowPolicy>) {
        self.policies.push(policy);
    }

    pub fn with(mut self, policy: impl RowPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> impl Iterator<Item = &Arc<dyn RowPolicy>> {
        self.policies.iter()
    }

    pub fn evaluate(
        &self,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, BatchError> {
        let mut current: Option<RowOperation> = None;
        for policy in &self.policies {
            let candidate = current.as_ref().unwrap_or(op);
            match policy.evaluate(candidate, ctx)? {
                PolicyOutcome::Accept => {}
                PolicyOutcome::Mutate(row) => {
                    let mut next = candidate.clone();
                    next.replace_after(row);
                    current = Some(next);
                }
                PolicyOutcome::Reject(reason) => {
                    return Ok(PolicyOutcome::Reject(format!(
                        "{}: {reason}",
                        policy.name()
                    )));
                }
            }
        }
        Ok(match current.and_then(|rewritten| rewritten.after().cloned()) {
            Some(row) if Some(&row) != op.after() => PolicyOutcome::Mutate(row),
            _ => PolicyOutcome::Accept,
        })
    }
}
