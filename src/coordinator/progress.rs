use crate::aggregate::{AggregateCache, GroupBy};
use crate::batch::RowOperation;
use crate::catalog::types::Value;
use std::collections::BTreeMap;

/// Net row-count change per group caused by rows already applied in the
/// current batch. Kept apart from the aggregate cache, which never changes
/// once populated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchProgress {
    deltas: BTreeMap<Value, i64>,
    applied: usize,
}

impl BatchProgress {
    pub(crate) fn record(&mut self, op: &RowOperation, group_by: &GroupBy) {
        if let Some(old) = op.old_group(group_by) {
            *self.deltas.entry(old).or_default() -= 1;
        }
        if let Some(new) = op.new_group(group_by) {
            *self.deltas.entry(new).or_default() += 1;
        }
        self.applied += 1;
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn delta_for(&self, key: &Value) -> i64 {
        self.deltas.get(key).copied().unwrap_or(0)
    }

    /// Rows the group holds now: the cached count plus this batch's changes.
    pub fn running_count(&self, cache: &AggregateCache, key: &Value) -> i64 {
        cache.count_for(key).unwrap_or(0) as i64 + self.delta_for(key)
    }
}
