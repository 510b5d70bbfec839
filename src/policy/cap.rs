use crate::batch::{OpKind, RowOperation};
use crate::catalog::types::Value;
use crate::error::BatchError;
use crate::policy::{MissingGroup, PolicyContext, PolicyOutcome, PolicyRequirements, RowPolicy};
use serde::{Deserialize, Serialize};

/// Aggregate a cap limit is derived from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LimitBasis {
    GlobalAverage,
    GroupAverage,
    GroupMax,
    Fixed(f64),
}

/// Clamps a numeric column to `basis * factor`. The limit is inclusive: a
/// value equal to it is accepted unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapPolicy {
    pub name: String,
    pub column: usize,
    pub basis: LimitBasis,
    pub factor: f64,
    #[serde(default)]
    pub on_missing: MissingGroup,
    #[serde(default = "default_cap_kinds")]
    pub applies_to: Vec<OpKind>,
}

pub(crate) fn default_cap_kinds() -> Vec<OpKind> {
    vec![OpKind::Insert, OpKind::Update]
}

enum Limit {
    Value(f64),
    Decided(PolicyOutcome),
}

impl CapPolicy {
    pub fn new(name: impl Into<String>, column: usize, basis: LimitBasis, factor: f64) -> Self {
        Self {
            name: name.into(),
            column,
            basis,
            factor,
            on_missing: MissingGroup::Fail,
            applies_to: default_cap_kinds(),
        }
    }

    /// Cap at `factor` times the table-wide average of `column`.
    pub fn global_average(name: impl Into<String>, column: usize, factor: f64) -> Self {
        Self::new(name, column, LimitBasis::GlobalAverage, factor)
    }

    /// Cap at `factor` times the average of `column` within the row's group.
    pub fn group_average(name: impl Into<String>, column: usize, factor: f64) -> Self {
        Self::new(name, column, LimitBasis::GroupAverage, factor)
    }

    pub fn on_missing(mut self, on_missing: MissingGroup) -> Self {
        self.on_missing = on_missing;
        self
    }

    pub fn applies_to(mut self, kinds: &[OpKind]) -> Self {
        self.applies_to = kinds.to_vec();
        self
    }

    /// The limit a row in `key`'s group is held to, after rounding.
    pub fn limit_for(
        &self,
        key: Option<&Value>,
        ctx: &PolicyContext<'_>,
    ) -> Result<Option<f64>, BatchError> {
        match self.resolve_limit(key, ctx)? {
            Limit::Value(limit) => Ok(Some(limit)),
            Limit::Decided(_) => Ok(None),
        }
    }

    fn resolve_limit(
        &self,
        key: Option<&Value>,
        ctx: &PolicyContext<'_>,
    ) -> Result<Limit, BatchError> {
        let global = || ctx.cache.global().average();
        let basis = match self.basis {
            LimitBasis::Fixed(v) => Some(v),
            LimitBasis::GlobalAverage => global(),
            LimitBasis::GroupAverage => key.and_then(|k| ctx.cache.average_for(k)),
            LimitBasis::GroupMax => key.and_then(|k| ctx.cache.max_for(k)),
        };
        let basis = match basis {
            Some(v) => v,
            None => match self.on_missing {
                MissingGroup::Accept => return Ok(Limit::Decided(PolicyOutcome::Accept)),
                MissingGroup::Reject => {
                    return Ok(Limit::Decided(PolicyOutcome::Reject(format!(
                        "no aggregate for group {}",
                        display_key(key)
                    ))));
                }
                MissingGroup::UseGlobal => match global() {
                    Some(v) => v,
                    None => return Err(self.missing(key)),
                },
                MissingGroup::Fail => return Err(self.missing(key)),
            },
        };
        Ok(Limit::Value(ctx.round_limit(basis * self.factor)))
    }

    fn missing(&self, key: Option<&Value>) -> BatchError {
        BatchError::MissingGroup {
            policy: self.name.clone(),
            key: display_key(key),
        }
    }
}

fn display_key(key: Option<&Value>) -> String {
    key.map_or_else(|| "<none>".to_string(), ToString::to_string)
}

/// Value of the same kind as `original` holding `limit`. Integer columns
/// round down so the result never exceeds the limit.
fn clamp_to(original: &Value, limit: f64) -> Value {
    match original {
        Value::Integer(_) => Value::Integer(limit.floor() as i64),
        Value::Timestamp(_) => Value::Timestamp(limit.floor() as i64),
        _ => Value::Float(limit),
    }
}

impl RowPolicy for CapPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        op: &RowOperation,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyOutcome, BatchError> {
        if !self.applies_to.contains(&op.kind()) {
            return Ok(PolicyOutcome::Accept);
        }
        let Some(after) = op.after() else {
            return Ok(PolicyOutcome::Accept);
        };
        let value = match after.get(self.column) {
            None | Some(Value::Null) => return Ok(PolicyOutcome::Accept),
            Some(value) => value,
        };
        let Some(numeric) = value.as_f64() else {
            return Ok(PolicyOutcome::Reject(format!(
                "column {} holds non-numeric {}",
                self.column,
                value.type_name()
            )));
        };
        let key = ctx.group_key(op);
        let limit = match self.resolve_limit(key.as_ref(), ctx)? {
            Limit::Value(limit) => limit,
            Limit::Decided(outcome) => return Ok(outcome),
        };
        if numeric > limit {
            Ok(PolicyOutcome::Mutate(
                after.with_value(self.column, clamp_to(value, limit)),
            ))
        } else {
            Ok(PolicyOutcome::Accept)
        }
    }

    fn requirements(&self) -> PolicyRequirements {
        PolicyRequirements {
            measure_column: match self.basis {
                LimitBasis::Fixed(_) => None,
                _ => Some(self.column),
            },
            global: matches!(self.basis, LimitBasis::GlobalAverage)
                || matches!(self.on_missing, MissingGroup::UseGlobal),
        }
    }
}
