use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::ids::{AttemptId, QuestionId};

const RESULTS_FIELD: &str = "results";
const QUESTION_ID_FIELD: &str = "questionId";
const IS_CORRECT_FIELD: &str = "isCorrect";

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

/// Reasons an incoming attempt payload cannot be aggregated.
///
/// Every variant is permanent: the same payload will fail the same way until
/// it is corrected upstream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptError {
    #[error("attempt id cannot be empty")]
    EmptyAttemptId,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("`results` is missing")]
    MissingResults,

    #[error("`results` must be an array")]
    ResultsNotArray,

    #[error("result #{index} must be an object")]
    ItemNotObject { index: usize },

    #[error("result #{index} is missing `questionId`")]
    MissingQuestionId { index: usize },

    #[error("result #{index} has an invalid `questionId`")]
    InvalidQuestionId { index: usize },

    #[error("result #{index} is missing `isCorrect`")]
    MissingIsCorrect { index: usize },

    #[error("result #{index} has a non-boolean `isCorrect`")]
    InvalidIsCorrect { index: usize },
}

//
// ─── RECORD ────────────────────────────────────────────────────────────────────
//

/// One per-question outcome inside an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    pub question_id: QuestionId,
    pub is_correct: bool,
}

impl ResultItem {
    #[must_use]
    pub fn new(question_id: QuestionId, is_correct: bool) -> Self {
        Self {
            question_id,
            is_correct,
        }
    }
}

/// A validated, immutable quiz submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    attempt_id: AttemptId,
    results: Vec<ResultItem>,
}

impl AttemptRecord {
    #[must_use]
    pub fn new(attempt_id: AttemptId, results: Vec<ResultItem>) -> Self {
        Self {
            attempt_id,
            results,
        }
    }

    /// Decode a raw payload into a validated record.
    ///
    /// Only the fields needed for aggregation are inspected; anything else in
    /// the payload is ignored. Invalid items are never coerced: a missing
    /// `isCorrect` is an error, not `false`.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` describing the first problem found.
    pub fn decode(attempt_id: &str, payload: &Value) -> Result<Self, AttemptError> {
        let attempt_id = AttemptId::new(attempt_id).map_err(|_| AttemptError::EmptyAttemptId)?;

        let object = payload.as_object().ok_or(AttemptError::NotAnObject)?;
        let raw_results = object
            .get(RESULTS_FIELD)
            .ok_or(AttemptError::MissingResults)?
            .as_array()
            .ok_or(AttemptError::ResultsNotArray)?;

        let results = raw_results
            .iter()
            .enumerate()
            .map(|(index, item)| decode_item(index, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            attempt_id,
            results,
        })
    }

    /// Decode a raw JSON byte payload.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::InvalidJson` if the bytes do not parse, otherwise
    /// the same errors as [`AttemptRecord::decode`].
    pub fn decode_slice(attempt_id: &str, payload: &[u8]) -> Result<Self, AttemptError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| AttemptError::InvalidJson(e.to_string()))?;
        Self::decode(attempt_id, &value)
    }

    #[must_use]
    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    #[must_use]
    pub fn results(&self) -> &[ResultItem] {
        &self.results
    }
}

fn decode_item(index: usize, item: &Value) -> Result<ResultItem, AttemptError> {
    let object = item
        .as_object()
        .ok_or(AttemptError::ItemNotObject { index })?;

    let question_id = match object.get(QUESTION_ID_FIELD) {
        None | Some(Value::Null) => return Err(AttemptError::MissingQuestionId { index }),
        Some(Value::String(raw)) => QuestionId::new(raw.as_str())
            .map_err(|_| AttemptError::InvalidQuestionId { index })?,
        Some(_) => return Err(AttemptError::InvalidQuestionId { index }),
    };

    let is_correct = match object.get(IS_CORRECT_FIELD) {
        None | Some(Value::Null) => return Err(AttemptError::MissingIsCorrect { index }),
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Err(AttemptError::InvalidIsCorrect { index }),
    };

    Ok(ResultItem::new(question_id, is_correct))
}
