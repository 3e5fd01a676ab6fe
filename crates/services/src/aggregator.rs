use std::sync::Arc;

use serde_json::Value;

use quiz_core::{aggregate, model::AttemptRecord, time::Clock};
use storage::repository::{CounterStore, Storage};

use crate::batch_applier::{ApplyOutcome, BatchApplier};
use crate::config::AggregatorConfig;
use crate::error::{AggregationError, ServicesInitError};

/// Entry point for newly observed attempt records.
///
/// Each call is independent: decode, fold into deltas, apply. No state is
/// kept between calls besides the injected store.
pub struct AttemptAggregator {
    applier: BatchApplier,
}

impl AttemptAggregator {
    #[must_use]
    pub fn new(clock: Clock, store: Arc<dyn CounterStore>, config: AggregatorConfig) -> Self {
        Self {
            applier: BatchApplier::new(clock, store, config),
        }
    }

    /// Build an aggregator over `storage`.
    #[must_use]
    pub fn with_storage(clock: Clock, storage: &Storage, config: AggregatorConfig) -> Self {
        Self::new(clock, Arc::clone(&storage.counters), config)
    }

    /// Open (and migrate) a `SQLite` store, returning it with an aggregator on top.
    ///
    /// # Errors
    ///
    /// Returns `ServicesInitError` if the database cannot be opened or migrated.
    pub async fn sqlite(
        db_url: &str,
        clock: Clock,
        config: AggregatorConfig,
    ) -> Result<(Storage, Self), ServicesInitError> {
        let storage = Storage::sqlite(db_url).await?;
        let aggregator = Self::with_storage(clock, &storage, config);
        Ok((storage, aggregator))
    }

    #[must_use]
    pub fn applier(&self) -> &BatchApplier {
        &self.applier
    }

    /// Process one delivery of an attempt.
    ///
    /// Safe to call repeatedly with the same `attempt_id`: redeliveries are
    /// reported through [`ApplyOutcome::is_duplicate`] and change nothing.
    ///
    /// # Errors
    ///
    /// Returns `AggregationError::MalformedRecord` without touching the store if
    /// the payload is invalid, otherwise the errors of [`BatchApplier::apply`].
    #[tracing::instrument(skip(self, payload))]
    pub async fn handle(
        &self,
        attempt_id: &str,
        payload: &Value,
    ) -> Result<ApplyOutcome, AggregationError> {
        let record = AttemptRecord::decode(attempt_id, payload).inspect_err(|err| {
            tracing::warn!(error = %err, "rejecting malformed attempt record");
        })?;
        self.handle_record(&record).await
    }

    /// Process a raw JSON byte payload.
    ///
    /// # Errors
    ///
    /// Same as [`AttemptAggregator::handle`], plus `MalformedRecord` for bytes
    /// that are not JSON.
    pub async fn handle_slice(
        &self,
        attempt_id: &str,
        payload: &[u8],
    ) -> Result<ApplyOutcome, AggregationError> {
        let record = AttemptRecord::decode_slice(attempt_id, payload).inspect_err(|err| {
            tracing::warn!(attempt_id, error = %err, "rejecting malformed attempt record");
        })?;
        self.handle_record(&record).await
    }

    /// Aggregate and apply an already validated record.
    ///
    /// # Errors
    ///
    /// See [`BatchApplier::apply`].
    pub async fn handle_record(
        &self,
        record: &AttemptRecord,
    ) -> Result<ApplyOutcome, AggregationError> {
        let deltas = aggregate(record);
        self.applier.apply(record.attempt_id(), &deltas).await
    }
}
