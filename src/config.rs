use crate::error::BatchError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a `Reject` outcome affects the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RejectionMode {
    /// Skip the rejected row, record it and keep going.
    #[default]
    RowLocal,
    /// Stop at the first rejected row and fail the batch. Rows applied
    /// before it stay applied.
    AbortBatch,
}

/// Runtime configuration for a `BatchCoordinator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub rejection_mode: RejectionMode,
    pub group_locking_enabled: bool,
    pub lock_timeout_ms: u64,
    pub max_batch_rows: usize,
    /// Decimal places computed limits are rounded to.
    pub limit_scale: u32,
    pub max_inflight_batches: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rejection_mode: RejectionMode::RowLocal,
            group_locking_enabled: true,
            lock_timeout_ms: 5_000,
            max_batch_rows: 100_000,
            limit_scale: 2,
            max_inflight_batches: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
        }
    }
}

impl CoordinatorConfig {
    /// Every rejection fails the batch.
    pub fn strict() -> Self {
        Self {
            rejection_mode: RejectionMode::AbortBatch,
            ..Self::default()
        }
    }

    /// Single-host profile: rejections stay row-local and batches are not
    /// serialized against each other.
    pub fn development() -> Self {
        Self {
            rejection_mode: RejectionMode::RowLocal,
            group_locking_enabled: false,
            ..Self::default()
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, BatchError> {
        let config: Self =
            serde_json::from_slice(bytes).map_err(|e| BatchError::ConfigurationError {
                message: format!("invalid coordinator config: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.max_batch_rows == 0 {
            return Err(BatchError::ConfigurationError {
                message: "max_batch_rows must be greater than zero".into(),
            });
        }
        if self.max_inflight_batches == 0 {
            return Err(BatchError::ConfigurationError {
                message: "max_inflight_batches must be greater than zero".into(),
            });
        }
        if self.limit_scale > 9 {
            return Err(BatchError::ConfigurationError {
                message: format!("limit_scale {} exceeds 9", self.limit_scale),
            });
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_rejection_mode(mut self, mode: RejectionMode) -> Self {
        self.rejection_mode = mode;
        self
    }

    pub fn with_group_locking(mut self, enabled: bool) -> Self {
        self.group_locking_enabled = enabled;
        self
    }

    pub fn with_max_batch_rows(mut self, max_batch_rows: usize) -> Self {
        self.max_batch_rows = max_batch_rows;
        self
    }

    pub fn with_limit_scale(mut self, limit_scale: u32) -> Self {
        self.limit_scale = limit_scale;
        self
    }

    /// Rounds a computed limit to `limit_scale` decimal places.
    pub fn round_limit(&self, limit: f64) -> f64 {
        let factor = 10f64.powi(self.limit_scale as i32);
        (limit * factor).round() / factor
    }
}

#[cfg(test)]
mod tests {
    use super::{CoordinatorConfig, RejectionMode};

    #[test]
    fn profiles_pick_rejection_mode() {
        assert_eq!(
            CoordinatorConfig::default().rejection_mode,
            RejectionMode::RowLocal
        );
        assert_eq!(
            CoordinatorConfig::strict().rejection_mode,
            RejectionMode::AbortBatch
        );
        assert!(!CoordinatorConfig::development().group_locking_enabled);
    }

    #[test]
    fn json_config_fills_defaults() {
        let config =
            CoordinatorConfig::from_json(br#"{"rejection_mode":"AbortBatch","limit_scale":0}"#)
                .expect("parse");
        assert_eq!(config.rejection_mode, RejectionMode::AbortBatch);
        assert_eq!(config.limit_scale, 0);
        assert_eq!(config.lock_timeout_ms, 5_000);
    }

    #[test]
    fn json_config_is_validated() {
        let err = CoordinatorConfig::from_json(br#"{"max_batch_rows":0}"#).expect_err("zero");
        assert_eq!(err.code_str(), "configuration_error");
    }

    #[test]
    fn round_limit_uses_scale() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.round_limit(1700.0 * 1.2), 2040.0);
        assert_eq!(config.round_limit(1234.5678), 1234.57);
        let whole = CoordinatorConfig::default().with_limit_scale(0);
        assert_eq!(whole.round_limit(99.6), 100.0);
    }
}
