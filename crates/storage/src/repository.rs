use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quiz_core::model::{AttemptId, QuestionId, QuestionStat, StatDelta};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Atomic-unit operation cap shared by the bundled backends.
pub const DEFAULT_MAX_OPS_PER_UNIT: usize = 500;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    /// Transient backend failure; the unit was not applied and may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("atomic unit has {ops} operations, limit is {max}")]
    UnitTooLarge { ops: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same unit may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

//
// ─── ATOMIC UNITS ──────────────────────────────────────────────────────────────
//

/// Create-if-absent-else-add for one question's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeIncrement {
    pub question_id: QuestionId,
    pub delta: StatDelta,
}

impl MergeIncrement {
    #[must_use]
    pub fn new(question_id: QuestionId, delta: StatDelta) -> Self {
        Self { question_id, delta }
    }
}

/// Persisted proof that a unit of an attempt has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMarker {
    pub key: String,
    pub attempt_id: AttemptId,
    pub processed_at: DateTime<Utc>,
}

impl UnitMarker {
    #[must_use]
    pub fn new(key: impl Into<String>, attempt_id: AttemptId, processed_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            attempt_id,
            processed_at,
        }
    }
}

/// A set of markers and increments committed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicUnit {
    pub markers: Vec<UnitMarker>,
    pub ops: Vec<MergeIncrement>,
    /// Stamped on every counter row the unit touches.
    pub applied_at: DateTime<Utc>,
}

impl AtomicUnit {
    #[must_use]
    pub fn new(
        markers: Vec<UnitMarker>,
        ops: Vec<MergeIncrement>,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Self {
            markers,
            ops,
            applied_at,
        }
    }

    /// A unit with no idempotency protection.
    #[must_use]
    pub fn unmarked(ops: Vec<MergeIncrement>, applied_at: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), ops, applied_at)
    }

    /// Number of store writes this unit performs.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.markers.len() + self.ops.len()
    }

    /// Reject the unit up front if it cannot fit in one commit.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::UnitTooLarge` when `op_count() > max`.
    pub fn check_size(&self, max: usize) -> Result<(), StorageError> {
        let ops = self.op_count();
        if ops > max {
            return Err(StorageError::UnitTooLarge { ops, max });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Committed,
    /// One of the unit's markers already existed; nothing was written.
    AlreadyApplied,
}

//
// ─── CONTRACT ──────────────────────────────────────────────────────────────────
//

/// Durable counter storage keyed by question.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Largest `AtomicUnit::op_count()` accepted by `apply_unit`.
    fn max_ops_per_unit(&self) -> usize;

    /// Commit a unit atomically.
    ///
    /// If any marker in the unit is already recorded, nothing is written and
    /// `UnitOutcome::AlreadyApplied` is returned. Otherwise every marker and
    /// every increment is persisted together, or none are.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::UnitTooLarge` before touching the store if the
    /// unit exceeds `max_ops_per_unit()`, `StorageError::Unavailable` on
    /// transient backend failures.
    async fn apply_unit(&self, unit: &AtomicUnit) -> Result<UnitOutcome, StorageError>;

    /// Fetch the counters for a question.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the question was never counted.
    async fn get_stat(&self, question_id: &QuestionId) -> Result<QuestionStat, StorageError>;

    /// Whether a marker with this key has been committed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lookup fails.
    async fn is_processed(&self, marker_key: &str) -> Result<bool, StorageError>;

    /// Merge a single increment outside any idempotency guard.
    ///
    /// # Errors
    ///
    /// Same as [`CounterStore::apply_unit`].
    async fn merge_increment(
        &self,
        question_id: &QuestionId,
        delta: StatDelta,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let unit = AtomicUnit::unmarked(vec![MergeIncrement::new(question_id.clone(), delta)], at);
        self.apply_unit(&unit).await.map(|_| ())
    }
}

//
// ─── IN-MEMORY ─────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct MemoryState {
    stats: HashMap<QuestionId, QuestionStat>,
    markers: HashMap<String, UnitMarker>,
}

/// Simple in-memory counter store for testing and prototyping.
///
/// Markers and counters live behind one lock, so each unit is applied in
/// isolation from concurrent units.
#[derive(Clone)]
pub struct InMemoryCounterStore {
    state: Arc<Mutex<MemoryState>>,
    max_ops: usize,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_ops(DEFAULT_MAX_OPS_PER_UNIT)
    }

    #[must_use]
    pub fn with_max_ops(max_ops: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_ops,
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn max_ops_per_unit(&self) -> usize {
        self.max_ops
    }

    async fn apply_unit(&self, unit: &AtomicUnit) -> Result<UnitOutcome, StorageError> {
        unit.check_size(self.max_ops)?;

        let mut guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        if unit
            .markers
            .iter()
            .any(|marker| guard.markers.contains_key(&marker.key))
        {
            return Ok(UnitOutcome::AlreadyApplied);
        }

        // Stage every merged value first so an overflow leaves the map untouched.
        let mut staged: HashMap<QuestionId, QuestionStat> = HashMap::new();
        for op in &unit.ops {
            let current = staged
                .get(&op.question_id)
                .or_else(|| guard.stats.get(&op.question_id))
                .cloned()
                .unwrap_or_else(|| QuestionStat::zero(op.question_id.clone()));
            let next = current
                .merged(op.delta)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            staged.insert(op.question_id.clone(), next);
        }

        guard.stats.extend(staged);
        for marker in &unit.markers {
            guard.markers.insert(marker.key.clone(), marker.clone());
        }
        Ok(UnitOutcome::Committed)
    }

    async fn get_stat(&self, question_id: &QuestionId) -> Result<QuestionStat, StorageError> {
        let guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        guard
            .stats
            .get(question_id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn is_processed(&self, marker_key: &str) -> Result<bool, StorageError> {
        let guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(guard.markers.contains_key(marker_key))
    }
}

/// Counter store handle behind a trait object for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub counters: Arc<dyn CounterStore>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let counters: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        Self { counters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiz_core::time::fixed_now;

    fn qid(s: &str) -> QuestionId {
        QuestionId::new(s).unwrap()
    }

    fn marker(key: &str) -> UnitMarker {
        UnitMarker::new(key, AttemptId::new("a1").unwrap(), fixed_now())
    }

    fn inc(q: &str, total: u64, correct: u64) -> MergeIncrement {
        MergeIncrement::new(qid(q), StatDelta::new(total, correct).unwrap())
    }

    #[tokio::test]
    async fn merge_increment_creates_then_adds() {
        let store = InMemoryCounterStore::new();
        assert!(matches!(
            store.get_stat(&qid("q1")).await,
            Err(StorageError::NotFound)
        ));

        store
            .merge_increment(&qid("q1"), StatDelta::single(true), fixed_now())
            .await
            .unwrap();
        store
            .merge_increment(&qid("q1"), StatDelta::single(false), fixed_now())
            .await
            .unwrap();

        let stat = store.get_stat(&qid("q1")).await.unwrap();
        assert_eq!(stat.total_attempts(), 2);
        assert_eq!(stat.correct_attempts(), 1);
    }

    #[tokio::test]
    async fn marked_unit_applies_once() {
        let store = InMemoryCounterStore::new();
        let unit = AtomicUnit::new(
            vec![marker("a1")],
            vec![inc("q1", 2, 1), inc("q2", 1, 1)],
            fixed_now(),
        );

        assert_eq!(store.apply_unit(&unit).await.unwrap(), UnitOutcome::Committed);
        assert_eq!(
            store.apply_unit(&unit).await.unwrap(),
            UnitOutcome::AlreadyApplied
        );
        assert!(store.is_processed("a1").await.unwrap());

        let stat = store.get_stat(&qid("q1")).await.unwrap();
        assert_eq!((stat.total_attempts(), stat.correct_attempts()), (2, 1));
    }

    #[tokio::test]
    async fn oversized_unit_is_rejected_without_writes() {
        let store = InMemoryCounterStore::with_max_ops(2);
        let unit = AtomicUnit::new(
            vec![marker("a1")],
            vec![inc("q1", 1, 0), inc("q2", 1, 0)],
            fixed_now(),
        );

        let err = store.apply_unit(&unit).await.unwrap_err();
        assert!(matches!(err, StorageError::UnitTooLarge { ops: 3, max: 2 }));
        assert!(!store.is_processed("a1").await.unwrap());
        assert!(store.get_stat(&qid("q1")).await.is_err());
    }

    #[tokio::test]
    async fn overflow_leaves_unit_unapplied() {
        let store = InMemoryCounterStore::new();
        store
            .merge_increment(&qid("q2"), StatDelta::new(u64::MAX, 0).unwrap(), fixed_now())
            .await
            .unwrap();

        let unit = AtomicUnit::new(
            vec![marker("a1")],
            vec![inc("q1", 1, 1), inc("q2", 1, 0)],
            fixed_now(),
        );
        assert!(store.apply_unit(&unit).await.is_err());
        assert!(store.get_stat(&qid("q1")).await.is_err());
        assert!(!store.is_processed("a1").await.unwrap());
    }

    #[tokio::test]
    async fn repeated_key_in_one_unit_accumulates() {
        let store = InMemoryCounterStore::new();
        let unit = AtomicUnit::unmarked(vec![inc("q1", 1, 1), inc("q1", 1, 0)], fixed_now());
        store.apply_unit(&unit).await.unwrap();
        let stat = store.get_stat(&qid("q1")).await.unwrap();
        assert_eq!((stat.total_attempts(), stat.correct_attempts()), (2, 1));
    }
}
