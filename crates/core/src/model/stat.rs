use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::QuestionId;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatError {
    #[error("correct attempts ({correct}) exceed total attempts ({total})")]
    CorrectExceedsTotal { total: u64, correct: u64 },

    #[error("counter overflow for question {0}")]
    Overflow(QuestionId),
}

//
// ─── DELTA ─────────────────────────────────────────────────────────────────────
//

/// Increment to apply to one question's counters.
///
/// `correct <= total` always holds, so adding a delta to a valid
/// [`QuestionStat`] keeps it valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatDelta {
    total: u64,
    correct: u64,
}

impl StatDelta {
    /// Build a delta from explicit counts.
    ///
    /// # Errors
    ///
    /// Returns `StatError::CorrectExceedsTotal` if `correct > total`.
    pub fn new(total: u64, correct: u64) -> Result<Self, StatError> {
        if correct > total {
            return Err(StatError::CorrectExceedsTotal { total, correct });
        }
        Ok(Self { total, correct })
    }

    /// Delta for a single answered question.
    #[must_use]
    pub fn single(is_correct: bool) -> Self {
        Self {
            total: 1,
            correct: u64::from(is_correct),
        }
    }

    /// Count one more answer into this delta.
    pub fn record(&mut self, is_correct: bool) {
        self.total += 1;
        if is_correct {
            self.correct += 1;
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn correct(&self) -> u64 {
        self.correct
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total == 0
    }
}

//
// ─── STAT ──────────────────────────────────────────────────────────────────────
//

/// Durable per-question counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStat {
    question_id: QuestionId,
    total_attempts: u64,
    correct_attempts: u64,
}

impl QuestionStat {
    /// Counters for a question that has not been answered yet.
    #[must_use]
    pub fn zero(question_id: QuestionId) -> Self {
        Self {
            question_id,
            total_attempts: 0,
            correct_attempts: 0,
        }
    }

    /// Rehydrate counters loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns `StatError::CorrectExceedsTotal` if the stored values break the
    /// counter invariant.
    pub fn from_persisted(
        question_id: QuestionId,
        total_attempts: u64,
        correct_attempts: u64,
    ) -> Result<Self, StatError> {
        if correct_attempts > total_attempts {
            return Err(StatError::CorrectExceedsTotal {
                total: total_attempts,
                correct: correct_attempts,
            });
        }
        Ok(Self {
            question_id,
            total_attempts,
            correct_attempts,
        })
    }

    /// Return these counters with `delta` merged in.
    ///
    /// # Errors
    ///
    /// Returns `StatError::Overflow` if either counter would exceed `u64::MAX`.
    pub fn merged(&self, delta: StatDelta) -> Result<Self, StatError> {
        let overflow = || StatError::Overflow(self.question_id.clone());
        Ok(Self {
            question_id: self.question_id.clone(),
            total_attempts: self
                .total_attempts
                .checked_add(delta.total())
                .ok_or_else(overflow)?,
            correct_attempts: self
                .correct_attempts
                .checked_add(delta.correct())
                .ok_or_else(overflow)?,
        })
    }

    #[must_use]
    pub fn question_id(&self) -> &QuestionId {
        &self.question_id
    }

    #[must_use]
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    #[must_use]
    pub fn correct_attempts(&self) -> u64 {
        self.correct_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qid(s: &str) -> QuestionId {
        QuestionId::new(s).unwrap()
    }

    #[test]
    fn delta_rejects_more_correct_than_total() {
        assert!(StatDelta::new(2, 1).is_ok());
        assert_eq!(
            StatDelta::new(1, 2).unwrap_err(),
            StatError::CorrectExceedsTotal {
                total: 1,
                correct: 2
            }
        );
    }

    #[test]
    fn record_counts_each_answer() {
        let mut delta = StatDelta::single(true);
        delta.record(false);
        delta.record(true);
        assert_eq!(delta.total(), 3);
        assert_eq!(delta.correct(), 2);
    }

    #[test]
    fn merged_adds_counters() {
        let stat = QuestionStat::from_persisted(qid("q1"), 4, 1).unwrap();
        let next = stat.merged(StatDelta::new(2, 2).unwrap()).unwrap();
        assert_eq!(next.total_attempts(), 6);
        assert_eq!(next.correct_attempts(), 3);
        assert_eq!(next.question_id(), &qid("q1"));
    }

    #[test]
    fn merged_detects_overflow() {
        let stat = QuestionStat::from_persisted(qid("q1"), u64::MAX, 0).unwrap();
        let err = stat.merged(StatDelta::single(false)).unwrap_err();
        assert_eq!(err, StatError::Overflow(qid("q1")));
    }

    #[test]
    fn persisted_invariant_is_checked() {
        assert!(QuestionStat::from_persisted(qid("q1"), 1, 2).is_err());
    }
}
