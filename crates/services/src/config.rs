use std::env;

use crate::error::ServicesInitError;

pub const MAX_OPS_ENV: &str = "QUIZ_STATS_MAX_OPS";

/// Tunables for applying attempt deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Cap on operations per atomic unit. The store's own cap still applies
    /// when it is lower.
    pub max_ops_per_unit: Option<usize>,
}

impl AggregatorConfig {
    /// Read overrides from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ServicesInitError::Config` if `QUIZ_STATS_MAX_OPS` is set but
    /// is not a positive integer.
    pub fn from_env() -> Result<Self, ServicesInitError> {
        match env::var(MAX_OPS_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Ok(Self {
                max_ops_per_unit: Some(parse_max_ops(&raw)?),
            }),
            _ => Ok(Self::default()),
        }
    }

    #[must_use]
    pub fn with_max_ops(mut self, max_ops: usize) -> Self {
        self.max_ops_per_unit = Some(max_ops);
        self
    }

    /// Limit actually used for a store advertising `store_max`.
    #[must_use]
    pub fn effective_max_ops(&self, store_max: usize) -> usize {
        self.max_ops_per_unit
            .map_or(store_max, |configured| configured.min(store_max))
    }
}

/// Parse a positive operation cap.
///
/// # Errors
///
/// Returns `ServicesInitError::Config` for non-numeric or zero values.
pub fn parse_max_ops(raw: &str) -> Result<usize, ServicesInitError> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(ServicesInitError::Config(format!(
            "{MAX_OPS_ENV} must be a positive integer, got {raw:?}"
        ))),
        Ok(value) => Ok(value),
    }
}
