use crate::batch::RowOperation;
use crate::catalog::types::{Row, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("row source unreadable: {0}")]
    Unreadable(String),
    #[error("row source closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("duplicate key {0}")]
    DuplicateKey(String),
    #[error("row {0} not found")]
    MissingRow(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the committed rows of the table a batch targets. Only
/// consulted while the aggregate cache is being built.
pub trait RowSource: Send + Sync {
    fn scan(&self) -> Result<Vec<Row>, SourceError>;

    fn group_by(&self, column: usize, key: &Value) -> Result<Vec<Row>, SourceError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|row| row.get(column) == Some(key))
            .collect())
    }
}

/// Commits the final image of one row operation.
pub trait RowSink: Send + Sync {
    fn commit(&self, op: &RowOperation) -> Result<(), SinkError>;
}
