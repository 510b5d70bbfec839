use crate::batch::OpKind;
use crate::cascade::CascadeRequest;
use crate::catalog::types::Row;
use crate::coordinator::phase::BatchPhase;
use crate::error::BatchError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RowOutcome {
    /// Applied as submitted.
    Applied,
    /// Applied after a policy rewrote the after image.
    Mutated { final_row: Row },
    /// Not applied.
    Rejected { reason: String },
}

impl RowOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, RowOutcome::Rejected { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowReport {
    pub index: usize,
    pub kind: OpKind,
    pub outcome: RowOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CascadeStatus {
    Applied,
    /// Same request was already queued by an earlier row; not executed again.
    Duplicate,
    /// Dropped because rows later in the batch made it unnecessary.
    Superseded,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CascadeReport {
    /// Index of the row whose after-row hook emitted the request.
    pub origin_row: usize,
    pub request: CascadeRequest,
    pub status: CascadeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchResult {
    pub label: Option<String>,
    pub phase: BatchPhase,
    pub rows_scanned: usize,
    pub groups_aggregated: usize,
    pub rows: Vec<RowReport>,
    pub cascades: Vec<CascadeReport>,
}

impl BatchResult {
    pub(crate) fn new(label: Option<String>) -> Self {
        Self {
            label,
            phase: BatchPhase::Idle,
            rows_scanned: 0,
            groups_aggregated: 0,
            rows: Vec::new(),
            cascades: Vec::new(),
        }
    }

    pub fn outcome(&self, index: usize) -> Option<&RowOutcome> {
        self.rows.get(index).map(|r| &r.outcome)
    }

    pub fn applied_count(&self) -> usize {
        self.rows.iter().filter(|r| r.outcome.is_applied()).count()
    }

    pub fn rejections(&self) -> impl Iterator<Item = (usize, &str)> {
        self.rows.iter().filter_map(|r| match &r.outcome {
            RowOutcome::Rejected { reason } => Some((r.index, reason.as_str())),
            _ => None,
        })
    }

    pub fn mutations(&self) -> impl Iterator<Item = (usize, &Row)> {
        self.rows.iter().filter_map(|r| match &r.outcome {
            RowOutcome::Mutated { final_row } => Some((r.index, final_row)),
            _ => None,
        })
    }

    pub fn cascades_executed(&self) -> usize {
        self.cascades
            .iter()
            .filter(|c| c.status == CascadeStatus::Applied)
            .count()
    }

    pub fn cascade_failures(&self) -> impl Iterator<Item = &CascadeReport> {
        self.cascades
            .iter()
            .filter(|c| matches!(c.status, CascadeStatus::Failed { .. }))
    }

    /// No rejected rows and no failed cascades.
    pub fn is_clean(&self) -> bool {
        self.rejections().next().is_none() && self.cascade_failures().next().is_none()
    }

    /// For hosts that treat any rejection or cascade failure as a failed
    /// batch: turns the first one into an error.
    pub fn into_strict(self) -> Result<Self, BatchError> {
        if let Some((index, reason)) = self.rejections().next() {
            return Err(BatchError::PolicyRejection {
                index,
                reason: reason.to_string(),
                rows_applied: self.applied_count(),
            });
        }
        if let Some(report) = self.cascade_failures().next() {
            let message = match &report.status {
                CascadeStatus::Failed { reason } => reason.clone(),
                _ => String::new(),
            };
            return Err(BatchError::CascadeFailure {
                request: report.request.to_string(),
                message,
            });
        }
        Ok(self)
    }
}
