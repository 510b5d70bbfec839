pub mod result;

use crate::aggregate::GroupBy;
use crate::catalog::types::{Row, Value};
use crate::error::BatchError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Insert => write!(f, "insert"),
            OpKind::Update => write!(f, "update"),
            OpKind::Delete => write!(f, "delete"),
        }
    }
}

/// One pending row change. `before` is absent on insert and `after` is
/// absent on delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowOperation {
    kind: OpKind,
    before: Option<Row>,
    after: Option<Row>,
}

impl RowOperation {
    pub fn insert(after: Row) -> Self {
        Self {
            kind: OpKind::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: Row, after: Row) -> Self {
        Self {
            kind: OpKind::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(before: Row) -> Self {
        Self {
            kind: OpKind::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// Builds an operation from raw parts, checking that the row images
    /// match the operation kind.
    pub fn from_parts(
        kind: OpKind,
        before: Option<Row>,
        after: Option<Row>,
    ) -> Result<Self, BatchError> {
        let op = Self {
            kind,
            before,
            after,
        };
        op.validate()?;
        Ok(op)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        let ok = match self.kind {
            OpKind::Insert => self.before.is_none() && self.after.is_some(),
            OpKind::Update => self.before.is_some() && self.after.is_some(),
            OpKind::Delete => self.before.is_some() && self.after.is_none(),
        };
        if ok {
            Ok(())
        } else {
            Err(BatchError::InvalidBatch {
                message: format!(
                    "{} requires {}",
                    self.kind,
                    match self.kind {
                        OpKind::Insert => "an after image and no before image",
                        OpKind::Update => "both before and after images",
                        OpKind::Delete => "a before image and no after image",
                    }
                ),
            })
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn before(&self) -> Option<&Row> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&Row> {
        self.after.as_ref()
    }

    /// Group the row occupied before the change, if any.
    pub fn old_group(&self, group_by: &GroupBy) -> Option<Value> {
        self.before.as_ref().map(|row| group_by.key_of(row))
    }

    /// Group the row occupies after the change, if any.
    pub fn new_group(&self, group_by: &GroupBy) -> Option<Value> {
        self.after.as_ref().map(|row| group_by.key_of(row))
    }

    /// The grouping key policies index the cache with: the new group for
    /// inserts and updates, the old group for deletes.
    pub fn group_key(&self, group_by: &GroupBy) -> Option<Value> {
        match self.kind {
            OpKind::Delete => self.old_group(group_by),
            OpKind::Insert | OpKind::Update => self.new_group(group_by),
        }
    }

    pub(crate) fn replace_after(&mut self, row: Row) {
        if self.after.is_some() {
            self.after = Some(row);
        }
    }
}

/// An ordered set of row operations submitted together, the unit of one
/// coordinator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub label: Option<String>,
    pub operations: Vec<RowOperation>,
}

impl Batch {
    pub fn new(operations: Vec<RowOperation>) -> Self {
        Self {
            label: None,
            operations,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn push(&mut self, op: RowOperation) {
        self.operations.push(op);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn validate(&self, max_rows: usize) -> Result<(), BatchError> {
        if self.operations.len() > max_rows {
            return Err(BatchError::InvalidBatch {
                message: format!(
                    "batch has {} rows, limit is {max_rows}",
                    self.operations.len()
                ),
            });
        }
        for (index, op) in self.operations.iter().enumerate() {
            op.validate().map_err(|e| BatchError::InvalidBatch {
                message: format!("operation {index}: {e}"),
            })?;
        }
        Ok(())
    }

    /// Every grouping key the batch touches, sorted and deduplicated.
    pub fn touched_groups(&self, group_by: &GroupBy) -> Vec<Value> {
        let mut keys: Vec<Value> = self
            .operations
            .iter()
            .flat_map(|op| [op.old_group(group_by), op.new_group(group_by)])
            .flatten()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl FromIterator<RowOperation> for Batch {
    fn from_iter<T: IntoIterator<Item = RowOperation>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
