pub mod aggregate;
pub mod batch;
pub mod cascade;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod declarative;
pub mod error;
pub mod executor;
pub mod policy;
pub mod source;
pub mod storage;

use crate::batch::result::CascadeReport;
use crate::cascade::CascadeRequest;
use crate::catalog::types::Row;
use crate::coordinator::phase::BatchPhase;

pub use crate::aggregate::{AggregateCache, GroupBy, GroupStats, Measure};
pub use crate::batch::result::{BatchResult, CascadeStatus, RowOutcome, RowReport};
pub use crate::batch::{Batch, OpKind, RowOperation};
pub use crate::config::{CoordinatorConfig, RejectionMode};
pub use crate::coordinator::{BatchCoordinator, CancelHandle, CoordinatorBuilder, StatementHook};
pub use crate::error::{BatchError, BatchErrorCode};
pub use crate::executor::BatchExecutor;
pub use crate::policy::{PolicyOutcome, RowPolicy};

/// Structured events a coordinator reports while running a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    Aggregated {
        label: Option<String>,
        rows_scanned: usize,
        groups: usize,
    },
    RowMutated {
        index: usize,
        submitted: Row,
        applied: Row,
    },
    RowRejected {
        index: usize,
        reason: String,
    },
    CascadeApplied {
        origin_row: usize,
        request: CascadeRequest,
    },
    CascadeFailed {
        origin_row: usize,
        request: CascadeRequest,
        reason: String,
    },
    BatchFinished {
        label: Option<String>,
        phase: BatchPhase,
        rows_applied: usize,
        rows_rejected: usize,
    },
}

impl DiagnosticEvent {
    pub(crate) fn from_cascade(report: &CascadeReport) -> Option<Self> {
        match &report.status {
            batch::result::CascadeStatus::Applied => Some(DiagnosticEvent::CascadeApplied {
                origin_row: report.origin_row,
                request: report.request.clone(),
            }),
            batch::result::CascadeStatus::Failed { reason } => {
                Some(DiagnosticEvent::CascadeFailed {
                    origin_row: report.origin_row,
                    request: report.request.clone(),
                    reason: reason.clone(),
                })
            }
            batch::result::CascadeStatus::Duplicate | batch::result::CascadeStatus::Superseded => {
                None
            }
        }
    }
}

/// Optional observer of coordinator events. Not required for correctness;
/// a panicking hook is logged and ignored.
pub trait DiagnosticsHook: Send + Sync {
    fn on_event(&self, event: &DiagnosticEvent);
}
