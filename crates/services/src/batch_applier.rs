use std::sync::Arc;

use serde::Serialize;

use quiz_core::{
    DeltaSet,
    model::{AttemptId, QuestionId, StatDelta},
    time::Clock,
};
use storage::repository::{AtomicUnit, CounterStore, MergeIncrement, UnitMarker, UnitOutcome};

use crate::config::AggregatorConfig;
use crate::error::AggregationError;

// Both marker kinds share one keyspace. A key is a kind tag, then digit-only
// chunk fields, then the attempt id, so no attempt id spells another unit's key.
const ATTEMPT_MARKER_TAG: &str = "attempt:";
const CHUNK_MARKER_TAG: &str = "chunk:";

/// Marker proving every delta of an attempt has been committed.
#[must_use]
pub fn attempt_marker_key(attempt_id: &AttemptId) -> String {
    format!("{ATTEMPT_MARKER_TAG}{attempt_id}")
}

/// Marker for unit `index` (1-based) of a chunked attempt.
#[must_use]
pub fn chunk_marker_key(attempt_id: &AttemptId, index: usize, total: usize) -> String {
    format!("{CHUNK_MARKER_TAG}{index}/{total}:{attempt_id}")
}

/// What applying one attempt did to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub attempt_id: AttemptId,
    pub questions: usize,
    pub units_committed: usize,
    pub units_skipped: usize,
}

impl ApplyOutcome {
    fn empty(attempt_id: &AttemptId) -> Self {
        Self {
            attempt_id: attempt_id.clone(),
            questions: 0,
            units_committed: 0,
            units_skipped: 0,
        }
    }

    /// True when this delivery found all of its work already committed.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.units_committed == 0 && self.units_skipped > 0
    }
}

//
// ─── APPLIER ───────────────────────────────────────────────────────────────────
//

/// Applies an attempt's deltas to the counter store exactly once per attempt.
///
/// Small delta sets go out as one atomic unit marked with the attempt id.
/// Sets that do not fit the store's operation cap are split, in key order,
/// into units that each carry their own chunk marker; the last unit also
/// carries the attempt marker.
pub struct BatchApplier {
    clock: Clock,
    store: Arc<dyn CounterStore>,
    config: AggregatorConfig,
}

impl BatchApplier {
    #[must_use]
    pub fn new(clock: Clock, store: Arc<dyn CounterStore>, config: AggregatorConfig) -> Self {
        Self {
            clock,
            store,
            config,
        }
    }

    /// Operation cap used when planning units.
    #[must_use]
    pub fn max_ops(&self) -> usize {
        self.config.effective_max_ops(self.store.max_ops_per_unit())
    }

    /// Split `deltas` into the atomic units that will be committed.
    ///
    /// # Errors
    ///
    /// Returns `AggregationError::AtomicUnitTooLarge` when the operation cap is
    /// too small to carry the markers alongside at least one increment.
    pub fn plan(
        &self,
        attempt_id: &AttemptId,
        deltas: &DeltaSet,
    ) -> Result<Vec<AtomicUnit>, AggregationError> {
        let max = self.max_ops();
        let now = self.clock.now();
        let marker = |key: String| UnitMarker::new(key, attempt_id.clone(), now);

        if deltas.is_empty() {
            return Ok(Vec::new());
        }

        let single_ops = deltas.len() + 1;
        if single_ops <= max {
            return Ok(vec![AtomicUnit::new(
                vec![marker(attempt_marker_key(attempt_id))],
                to_ops(deltas.iter().map(|(id, delta)| (id.clone(), delta))),
                now,
            )]);
        }

        // Every chunk leaves room for two markers so the last one can also
        // close out the attempt.
        if max < 3 {
            return Err(AggregationError::AtomicUnitTooLarge {
                ops: single_ops,
                max,
            });
        }

        let chunks = deltas.chunks(max - 2);
        let total = chunks.len();
        let units = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let index = i + 1;
                let mut markers = vec![marker(chunk_marker_key(attempt_id, index, total))];
                if index == total {
                    markers.push(marker(attempt_marker_key(attempt_id)));
                }
                AtomicUnit::new(markers, to_ops(chunk), now)
            })
            .collect();
        Ok(units)
    }

    /// Apply the deltas of `attempt_id`, skipping anything already committed.
    ///
    /// # Errors
    ///
    /// - `StoreUnavailable` if nothing was committed by this call and the store
    ///   failed transiently.
    /// - `AtomicUnitTooLarge` if the deltas cannot be planned within the cap.
    ///   An attempt whose marker is already committed is reported as a
    ///   duplicate before planning, so a smaller cap never fails a redelivery.
    /// - `PartialApplyFailure` if a later unit of a chunked attempt failed after
    ///   earlier units were applied.
    #[tracing::instrument(
        skip(self, attempt_id, deltas),
        fields(attempt_id = %attempt_id, questions = deltas.len())
    )]
    pub async fn apply(
        &self,
        attempt_id: &AttemptId,
        deltas: &DeltaSet,
    ) -> Result<ApplyOutcome, AggregationError> {
        let mut outcome = ApplyOutcome::empty(attempt_id);
        outcome.questions = deltas.len();

        if deltas.is_empty() {
            tracing::debug!("attempt has no results; nothing to apply");
            return Ok(outcome);
        }

        if self
            .store
            .is_processed(&attempt_marker_key(attempt_id))
            .await?
        {
            tracing::warn!("attempt already applied; ignoring redelivery");
            outcome.units_skipped = 1;
            return Ok(outcome);
        }

        let units = self.plan(attempt_id, deltas)?;
        let total = units.len();
        for (index, unit) in units.iter().enumerate() {
            match self.store.apply_unit(unit).await {
                Ok(UnitOutcome::Committed) => {
                    tracing::debug!(unit = index + 1, total, ops = unit.ops.len(), "unit committed");
                    outcome.units_committed += 1;
                }
                Ok(UnitOutcome::AlreadyApplied) => {
                    tracing::debug!(unit = index + 1, total, "unit already applied");
                    outcome.units_skipped += 1;
                }
                Err(source) if index == 0 => return Err(source.into()),
                Err(source) => {
                    tracing::error!(
                        committed = index,
                        total,
                        error = %source,
                        "chunked attempt partially applied"
                    );
                    return Err(AggregationError::PartialApplyFailure {
                        attempt_id: attempt_id.clone(),
                        committed: index,
                        total,
                        source,
                    });
                }
            }
        }

        if outcome.is_duplicate() {
            tracing::warn!("attempt already applied; ignoring redelivery");
        } else {
            tracing::info!(
                units_committed = outcome.units_committed,
                units_skipped = outcome.units_skipped,
                "attempt applied"
            );
        }
        Ok(outcome)
    }
}

fn to_ops(entries: impl IntoIterator<Item = (QuestionId, StatDelta)>) -> Vec<MergeIncrement> {
    entries
        .into_iter()
        .map(|(question_id, delta)| MergeIncrement::new(question_id, delta))
        .collect()
}
