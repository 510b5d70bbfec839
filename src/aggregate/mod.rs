use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, Value};
use crate::error::BatchError;
use crate::source::RowSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extracts the grouping key of a row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupBy {
    pub column: usize,
}

impl GroupBy {
    pub fn column(column: usize) -> Self {
        Self { column }
    }

    pub fn named(schema: &TableSchema, column: &str) -> Result<Self, BatchError> {
        Ok(Self::column(schema.column_index(column)?))
    }

    /// Rows too short to carry the column group under `Null`.
    pub fn key_of(&self, row: &Row) -> Value {
        row.get(self.column).cloned().unwrap_or(Value::Null)
    }
}

/// What is folded into each group besides the row count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Measure {
    RowsOnly,
    Column(usize),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupStats {
    pub rows: u64,
    /// Rows whose measure was non-null.
    pub measured: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl GroupStats {
    pub fn average(&self) -> Option<f64> {
        (self.measured > 0).then(|| self.sum / self.measured as f64)
    }

    fn observe(&mut self, measure: Option<f64>) {
        self.rows += 1;
        if let Some(v) = measure {
            self.measured += 1;
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }
}

/// Per-group statistics computed once before a batch writes anything.
///
/// There is no mutating API: once `populate` returns, the cache is frozen
/// and is shared read-only with every row policy of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCache {
    group_by: GroupBy,
    measure: Measure,
    groups: BTreeMap<Value, GroupStats>,
    global: GroupStats,
}

impl AggregateCache {
    pub fn populate(
        source: &dyn RowSource,
        group_by: GroupBy,
        measure: Measure,
    ) -> Result<Self, BatchError> {
        let rows = source
            .scan()
            .map_err(|e| BatchError::AggregationFailure {
                message: e.to_string(),
            })?;
        Self::from_rows(rows.iter(), group_by, measure)
    }

    pub fn from_rows<'a>(
        rows: impl IntoIterator<Item = &'a Row>,
        group_by: GroupBy,
        measure: Measure,
    ) -> Result<Self, BatchError> {
        let mut groups: BTreeMap<Value, GroupStats> = BTreeMap::new();
        let mut global = GroupStats::default();
        for row in rows {
            let value = match measure {
                Measure::RowsOnly => None,
                Measure::Column(column) => measure_value(row, column)?,
            };
            global.observe(value);
            groups.entry(group_by.key_of(row)).or_default().observe(value);
        }
        Ok(Self {
            group_by,
            measure,
            groups,
            global,
        })
    }

    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    pub fn measure(&self) -> Measure {
        self.measure
    }

    pub fn get(&self, key: &Value) -> Option<&GroupStats> {
        self.groups.get(key)
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.groups.contains_key(key)
    }

    pub fn global(&self) -> &GroupStats {
        &self.global
    }

    pub fn count_for(&self, key: &Value) -> Option<u64> {
        self.get(key).map(|s| s.rows)
    }

    pub fn average_for(&self, key: &Value) -> Option<f64> {
        self.get(key).and_then(GroupStats::average)
    }

    pub fn max_for(&self, key: &Value) -> Option<f64> {
        self.get(key).and_then(|s| s.max)
    }

    pub fn min_for(&self, key: &Value) -> Option<f64> {
        self.get(key).and_then(|s| s.min)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.groups.keys()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn measure_value(row: &Row, column: usize) -> Result<Option<f64>, BatchError> {
    match row.get(column) {
        None => Err(BatchError::AggregationFailure {
            message: format!("row has no measure column {column}"),
        }),
        Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| BatchError::AggregationFailure {
                message: format!(
                    "measure column {column} holds non-numeric {}",
                    value.type_name()
                ),
            }),
    }
}
