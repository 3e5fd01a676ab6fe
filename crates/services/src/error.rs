//! Shared error types for the services crate.

use thiserror::Error;

use quiz_core::model::{AttemptError, AttemptId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted while aggregating one attempt record.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AggregationError {
    /// The payload can never be aggregated as-is; report it, do not retry.
    #[error("malformed attempt record: {0}")]
    MalformedRecord(#[from] AttemptError),

    /// Nothing was committed for the failing unit; the record may be retried.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(#[source] StorageError),

    #[error("atomic unit of {ops} operations exceeds the limit of {max}")]
    AtomicUnitTooLarge { ops: usize, max: usize },

    /// Some units of a chunked attempt are committed and the rest are not.
    ///
    /// Committed units are protected by their own markers, so redelivering the
    /// same record resumes with the remaining units instead of re-counting.
    #[error("attempt {attempt_id}: {committed} of {total} units applied before failure: {source}")]
    PartialApplyFailure {
        attempt_id: AttemptId,
        committed: usize,
        total: usize,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(StorageError),
}

impl AggregationError {
    /// Whether redelivering the same record may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::PartialApplyFailure { source, .. } => source.is_transient(),
            Self::MalformedRecord(_) | Self::AtomicUnitTooLarge { .. } | Self::Storage(_) => false,
        }
    }
}

impl From<StorageError> for AggregationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(_) => Self::StoreUnavailable(err),
            StorageError::UnitTooLarge { ops, max } => Self::AtomicUnitTooLarge { ops, max },
            other => Self::Storage(other),
        }
    }
}

/// Errors emitted while bootstrapping the aggregation services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServicesInitError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_taxonomy() {
        let err: AggregationError = StorageError::Unavailable("locked".into()).into();
        assert!(matches!(err, AggregationError::StoreUnavailable(_)));
        assert!(err.is_retryable());

        let err: AggregationError = StorageError::UnitTooLarge { ops: 9, max: 4 }.into();
        assert!(matches!(
            err,
            AggregationError::AtomicUnitTooLarge { ops: 9, max: 4 }
        ));
        assert!(!err.is_retryable());

        let err: AggregationError = StorageError::NotFound.into();
        assert!(matches!(err, AggregationError::Storage(_)));
    }

    #[test]
    fn malformed_records_are_not_retryable() {
        let err = AggregationError::from(AttemptError::MissingResults);
        assert!(!err.is_retryable());
    }
}
