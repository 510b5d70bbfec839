use crate::batch::{OpKind, RowOperation};
use crate::catalog::types::Value;
use crate::error::BatchError;
use crate::policy::{MissingGroup, PolicyContext, PolicyOutcome, PolicyRequirements, RowPolicy};
use serde::{Deserialize, Serialize};

/// Where a guard reads the group's current size from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CountSource {
    /// Count as of the start of the batch only.
    Snapshot,
    /// Start-of-batch count adjusted for rows this batch already applied.
    #[default]
    Running,
}

/// Rejects a row leaving its group when fewer than `min_rows` would remain.
/// With the default `min_rows = 1` this refuses to remove a group's last row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardPolicy {
    pub name: String,
    #[serde(default = "default_min_rows")]
    pub min_rows: u64,
    #[serde(default)]
    pub count_source: CountSource,
    #[serde(default)]
    pub on_missing: MissingGroup,
}

fn default_min_rows() -> u64 {
    1
}

impl GuardPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_rows: default_min_rows(),
            count_source: CountSource::Running,
            on_missing: MissingGroup::Fail,
        }
    }

    pub fn min_rows(mut self, min_rows: u64) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn count_source(mut self, count_source: CountSource) -> Self {
        self.count_source = count_source;
        self
    }

    pub fn on_missing(mut self, on_missing: MissingGroup) -> Self {
        self.on_missing = on_missing;
        self
    }

    fn current_count(&self, key: &Value, ctx: &PolicyContext<'_>) -> Option<i64> {
        let cached = ctx.cache.count_for(key);
        match self.count_source {
            CountSource::Snapshot => cached.map(|c| c as i64),
            CountSource::Running => {
                let delta = ctx.progress.delta_for(key);
                if cached.is_none() && delta <= 0 {
                    None
                } else {
                    Some(ctx.progress.running_count(ctx.cache, key))
                }
            }
        }
    }
}

impl RowPolicy for GuardPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, BatchError> {
        let group_by = ctx.cache.group_by();
        let leaving = match op.kind() {
            OpKind::Delete => op.old_group(&group_by),
            OpKind::Update => match (op.old_group(&group_by), op.new_group(&group_by)) {
                (Some(old), Some(new)) if old != new => Some(old),
                _ => None,
            },
            OpKind::Insert => None,
        };
        let Some(key) = leaving else {
            return Ok(PolicyOutcome::Accept);
        };

        let Some(count) = self.current_count(&key, ctx) else {
            return match self.on_missing {
                MissingGroup::Accept => Ok(PolicyOutcome::Accept),
                MissingGroup::Reject => Ok(PolicyOutcome::Reject(format!(
                    "no row count for group {key}"
                ))),
                MissingGroup::Fail | MissingGroup::UseGlobal => Err(BatchError::MissingGroup {
                    policy: self.name.clone(),
                    key: key.to_string(),
                }),
            };
        };

        let remaining = count - 1;
        if remaining < self.min_rows as i64 {
            Ok(PolicyOutcome::Reject(format!(
                "group {key} would keep {} of at least {} row(s)",
                remaining.max(0),
                self.min_rows
            )))
        } else {
            Ok(PolicyOutcome::Accept)
        }
    }

    fn requirements(&self) -> PolicyRequirements {
        PolicyRequirements::default()
    }
}
