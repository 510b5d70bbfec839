use crate::batch::{OpKind, RowOperation};
use crate::cascade::{CascadeAction, CascadeFailure, CascadeRequest};
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, Value};
use crate::error::BatchError;
use crate::source::{RowSink, RowSource, SinkError, SourceError};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A table held in memory and keyed by primary key. Serves as row source,
/// row sink and cascade target.
#[derive(Debug)]
pub struct MemoryTable {
    schema: TableSchema,
    pk_index: usize,
    rows: RwLock<BTreeMap<Value, Row>>,
}

impl MemoryTable {
    pub fn new(schema: TableSchema) -> Result<Self, BatchError> {
        let pk_index = schema.primary_key_index()?;
        Ok(Self {
            schema,
            pk_index,
            rows: RwLock::new(BTreeMap::new()),
        })
    }

    /// Inserts rows directly, bypassing any batch.
    pub fn seed(&self, rows: impl IntoIterator<Item = Row>) -> Result<(), BatchError> {
        let mut guard = self.rows.write();
        for row in rows {
            self.schema.validate_row(&row)?;
            let key = self.key_of(&row)?;
            guard.insert(key, row);
        }
        Ok(())
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.table_name
    }

    pub fn get(&self, key: &Value) -> Option<Row> {
        self.rows.read().get(key).cloned()
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.rows.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows.read().values().cloned().collect()
    }

    fn key_of(&self, row: &Row) -> Result<Value, BatchError> {
        row.get(self.pk_index)
            .cloned()
            .ok_or_else(|| BatchError::InvalidBatch {
                message: format!(
                    "row is missing primary key column '{}'",
                    self.schema.primary_key
                ),
            })
    }

    fn checked_row(&self, row: &Row) -> Result<Value, SinkError> {
        self.schema
            .validate_row(row)
            .and_then(|_| self.key_of(row))
            .map_err(|e| SinkError::Constraint(e.to_string()))
    }
}

impl RowSource for MemoryTable {
    fn scan(&self) -> Result<Vec<Row>, SourceError> {
        Ok(self.rows())
    }

    fn group_by(&self, column: usize, key: &Value) -> Result<Vec<Row>, SourceError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.get(column) == Some(key))
            .cloned()
            .collect())
    }
}

impl RowSink for MemoryTable {
    fn commit(&self, op: &RowOperation) -> Result<(), SinkError> {
        let mut rows = self.rows.write();
        match (op.kind(), op.before(), op.after()) {
            (OpKind::Insert, _, Some(after)) => {
                let key = self.checked_row(after)?;
                if rows.contains_key(&key) {
                    return Err(SinkError::DuplicateKey(key.to_string()));
                }
                rows.insert(key, after.clone());
            }
            (OpKind::Update, Some(before), Some(after)) => {
                let old_key = self.checked_row(before)?;
                let new_key = self.checked_row(after)?;
                if !rows.contains_key(&old_key) {
                    return Err(SinkError::MissingRow(old_key.to_string()));
                }
                if new_key != old_key && rows.contains_key(&new_key) {
                    return Err(SinkError::DuplicateKey(new_key.to_string()));
                }
                rows.remove(&old_key);
                rows.insert(new_key, after.clone());
            }
            (OpKind::Delete, Some(before), _) => {
                let key = self.checked_row(before)?;
                if rows.remove(&key).is_none() {
                    return Err(SinkError::MissingRow(key.to_string()));
                }
            }
            _ => {
                return Err(SinkError::Constraint(format!(
                    "{} is missing a row image",
                    op.kind()
                )));
            }
        }
        Ok(())
    }
}

impl CascadeAction for MemoryTable {
    fn apply(&self, request: &CascadeRequest) -> Result<(), CascadeFailure> {
        match request {
            CascadeRequest::DeleteParent { table, key } if *table == self.schema.table_name => {
                // Already gone counts as done.
                self.rows.write().remove(key);
                Ok(())
            }
            other => Err(CascadeFailure::Unsupported(other.to_string())),
        }
    }
}
