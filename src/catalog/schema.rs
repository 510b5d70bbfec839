use crate::catalog::types::{ColumnType, Row, Value};
use crate::error::BatchError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: String,
}

impl TableSchema {
    pub fn new(table_name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: Vec::new(),
            primary_key: primary_key.into(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, col_type: ColumnType, nullable: bool) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            col_type,
            nullable,
        });
        self
    }

    pub fn column_index(&self, name: &str) -> Result<usize, BatchError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| BatchError::UnknownColumn {
                table: self.table_name.clone(),
                column: name.to_string(),
            })
    }

    pub fn primary_key_index(&self) -> Result<usize, BatchError> {
        self.column_index(&self.primary_key)
    }

    pub fn primary_key_of<'a>(&self, row: &'a Row) -> Result<&'a Value, BatchError> {
        let idx = self.primary_key_index()?;
        row.get(idx).ok_or_else(|| BatchError::InvalidBatch {
            message: format!("row is missing primary key column '{}'", self.primary_key),
        })
    }

    /// Checks arity, NOT NULL and column types of a row against this schema.
    pub fn validate_row(&self, row: &Row) -> Result<(), BatchError> {
        if row.values.len() != self.columns.len() {
            return Err(BatchError::InvalidBatch {
                message: format!(
                    "row has {} values but table '{}' has {} columns",
                    row.values.len(),
                    self.table_name,
                    self.columns.len()
                ),
            });
        }
        for (col, value) in self.columns.iter().zip(&row.values) {
            if value.is_null() && !col.nullable {
                return Err(BatchError::NotNullViolation {
                    table: self.table_name.clone(),
                    column: col.name.clone(),
                });
            }
            if !value.matches_type(col.col_type) {
                return Err(BatchError::TypeMismatch {
                    table: self.table_name.clone(),
                    column: col.name.clone(),
                    expected: format!("{:?}", col.col_type),
                    actual: value.type_name().to_string(),
                });
            }
        }
        Ok(())
    }
}
