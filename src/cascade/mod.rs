use crate::batch::RowOperation;
use crate::batch::result::{CascadeReport, CascadeStatus};
use crate::catalog::types::Value;
use crate::policy::PolicyContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A follow-up action emitted by an after-row hook. Two requests are the
/// same cascade when they are equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum CascadeRequest {
    DeleteParent { table: String, key: Value },
    Custom { action: String, key: Value },
}

impl CascadeRequest {
    pub fn delete_parent(table: impl Into<String>, key: impl Into<Value>) -> Self {
        CascadeRequest::DeleteParent {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Name of the table or action the request is routed to.
    pub fn target(&self) -> &str {
        match self {
            CascadeRequest::DeleteParent { table, .. } => table,
            CascadeRequest::Custom { action, .. } => action,
        }
    }

    pub fn key(&self) -> &Value {
        match self {
            CascadeRequest::DeleteParent { key, .. } | CascadeRequest::Custom { key, .. } => key,
        }
    }
}

impl fmt::Display for CascadeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeRequest::DeleteParent { table, key } => write!(f, "delete {table}[{key}]"),
            CascadeRequest::Custom { action, key } => write!(f, "{action}[{key}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeFailure {
    #[error("no cascade target named '{0}'")]
    UnknownTarget(String),
    #[error("unsupported cascade request: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Action(String),
}

pub trait CascadeAction: Send + Sync {
    /// Applying a request whose effect is already in place must succeed.
    fn apply(&self, request: &CascadeRequest) -> Result<(), CascadeFailure>;
}

/// Reacts to an applied row. Runs after the row reached the sink; `ctx`
/// already counts that row in its batch progress.
pub trait AfterRowHook: Send + Sync {
    fn after_row(
        &self,
        index: usize,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Vec<CascadeRequest>;

    /// Checked against the end-of-batch state right before `request` runs.
    /// Returning false drops it as `Superseded`.
    fn still_needed(&self, _request: &CascadeRequest, _ctx: &PolicyContext<'_>) -> bool {
        true
    }
}

/// Emits `DeleteParent` for a group once the batch has removed its last row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEmptyParent {
    pub parent_table: String,
}

impl DeleteEmptyParent {
    pub fn new(parent_table: impl Into<String>) -> Self {
        Self {
            parent_table: parent_table.into(),
        }
    }
}

impl AfterRowHook for DeleteEmptyParent {
    fn after_row(
        &self,
        _index: usize,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Vec<CascadeRequest> {
        let group_by = ctx.cache.group_by();
        let Some(old) = op.old_group(&group_by) else {
            return Vec::new();
        };
        if op.new_group(&group_by).as_ref() == Some(&old) {
            return Vec::new();
        }
        if ctx.progress.running_count(ctx.cache, &old) > 0 {
            return Vec::new();
        }
        vec![CascadeRequest::DeleteParent {
            table: self.parent_table.clone(),
            key: old,
        }]
    }

    /// A later row may have moved or inserted a child back into the group.
    fn still_needed(&self, request: &CascadeRequest, ctx: &PolicyContext<'_>) -> bool {
        match request {
            CascadeRequest::DeleteParent { table, key } if *table == self.parent_table => {
                ctx.progress.running_count(ctx.cache, key) <= 0
            }
            _ => true,
        }
    }
}

/// Dispatches requests to the action registered for their target.
#[derive(Clone, Default)]
pub struct CascadeRouter {
    routes: BTreeMap<String, Arc<dyn CascadeAction>>,
}

impl CascadeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, target: impl Into<String>, action: Arc<dyn CascadeAction>) -> Self {
        self.routes.insert(target.into(), action);
        self
    }
}

impl CascadeAction for CascadeRouter {
    fn apply(&self, request: &CascadeRequest) -> Result<(), CascadeFailure> {
        let action = self
            .routes
            .get(request.target())
            .ok_or_else(|| CascadeFailure::UnknownTarget(request.target().to_string()))?;
        action.apply(request)
    }
}

struct QueuedCascade {
    origin_row: usize,
    request: CascadeRequest,
    hook: Arc<dyn AfterRowHook>,
    duplicate: bool,
}

/// Cascades collected during row processing, run once all rows are done.
#[derive(Default)]
pub(crate) struct CascadeQueue {
    entries: Vec<QueuedCascade>,
    seen: BTreeSet<CascadeRequest>,
}

impl CascadeQueue {
    /// Returns false when an identical request is already queued.
    pub(crate) fn enqueue(
        &mut self,
        origin_row: usize,
        request: CascadeRequest,
        hook: &Arc<dyn AfterRowHook>,
    ) -> bool {
        let duplicate = !self.seen.insert(request.clone());
        self.entries.push(QueuedCascade {
            origin_row,
            request,
            hook: Arc::clone(hook),
            duplicate,
        });
        !duplicate
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Runs every distinct request in emission order, skipping those the
    /// emitting hook no longer wants given `ctx`, the state after the last
    /// row. Failures are reported, never propagated.
    pub(crate) fn run(
        self,
        action: &dyn CascadeAction,
        ctx: &PolicyContext<'_>,
        mut on_report: impl FnMut(&CascadeReport),
    ) -> Vec<CascadeReport> {
        let mut reports = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let status = if entry.duplicate {
                CascadeStatus::Duplicate
            } else if !entry.hook.still_needed(&entry.request, ctx) {
                CascadeStatus::Superseded
            } else {
                match action.apply(&entry.request) {
                    Ok(()) => CascadeStatus::Applied,
                    Err(e) => CascadeStatus::Failed {
                        reason: e.to_string(),
                    },
                }
            };
            let report = CascadeReport {
                origin_row: entry.origin_row,
                request: entry.request,
                status,
            };
            on_report(&report);
            reports.push(report);
        }
        reports
    }
}
