use crate::aggregate::{GroupBy, Measure};
use crate::batch::OpKind;
use crate::cascade::DeleteEmptyParent;
use crate::catalog::schema::TableSchema;
use crate::config::CoordinatorConfig;
use crate::coordinator::{BatchCoordinator, CoordinatorBuilder};
use crate::error::BatchError;
use crate::policy::{CapPolicy, GuardPolicy, LimitBasis, MissingGroup};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A cap rule addressed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapRule {
    pub name: String,
    pub column: String,
    pub basis: LimitBasis,
    pub factor: f64,
    #[serde(default)]
    pub on_missing: MissingGroup,
    #[serde(default = "crate::policy::cap::default_cap_kinds")]
    pub applies_to: Vec<OpKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyRule {
    Cap(CapRule),
    Guard(GuardPolicy),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CascadeRule {
    DeleteEmptyParent { parent_table: String },
}

/// Coordinator setup loaded from JSON, with columns named rather than
/// indexed. Policies run in the order listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub group_by: String,
    #[serde(default)]
    pub measure: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
    #[serde(default)]
    pub cascades: Vec<CascadeRule>,
    #[serde(default)]
    pub config: CoordinatorConfig,
}

impl RuleSet {
    pub fn from_json(bytes: &[u8]) -> Result<Self, BatchError> {
        serde_json::from_slice(bytes).map_err(|e| BatchError::ConfigurationError {
            message: format!("invalid rule set: {e}"),
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| BatchError::ConfigurationError {
            message: format!("cannot read rule set {}: {e}", path.display()),
        })?;
        Self::from_json(&bytes)
    }

    /// Resolves column names against `schema`. Cascade rules register
    /// after-row hooks only; the caller still supplies the cascade action.
    pub fn build(&self, schema: &TableSchema) -> Result<CoordinatorBuilder, BatchError> {
        let group_by = GroupBy::named(schema, &self.group_by)?;
        let mut builder = BatchCoordinator::builder(group_by).config(self.config.clone());
        if let Some(measure) = &self.measure {
            builder = builder.measure(Measure::Column(schema.column_index(measure)?));
        }
        for rule in &self.policies {
            builder = match rule {
                PolicyRule::Cap(cap) => builder.policy(
                    CapPolicy::new(
                        cap.name.clone(),
                        schema.column_index(&cap.column)?,
                        cap.basis,
                        cap.factor,
                    )
                    .on_missing(cap.on_missing)
                    .applies_to(&cap.applies_to),
                ),
                PolicyRule::Guard(guard) => builder.policy(guard.clone()),
            };
        }
        for rule in &self.cascades {
            builder = match rule {
                CascadeRule::DeleteEmptyParent { parent_table } => {
                    builder.after_row(DeleteEmptyParent::new(parent_table.clone()))
                }
            };
        }
        Ok(builder)
    }
}
