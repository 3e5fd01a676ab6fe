use quiz_core::model::{QuestionId, QuestionStat};
use sqlx::Row;
use sqlx::error::ErrorKind;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Constraint violations are permanent; everything else is worth a retry.
pub(crate) fn classify(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if !matches!(db.kind(), ErrorKind::Other) => {
            StorageError::Serialization(e.to_string())
        }
        _ => StorageError::Unavailable(e.to_string()),
    }
}

pub(crate) fn counter_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn counter_from_i64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn map_stat_row(row: &sqlx::sqlite::SqliteRow) -> Result<QuestionStat, StorageError> {
    let question_id = QuestionId::new(row.try_get::<String, _>("question_id").map_err(ser)?)
        .map_err(ser)?;
    let total = counter_from_i64(
        "total_attempts",
        row.try_get::<i64, _>("total_attempts").map_err(ser)?,
    )?;
    let correct = counter_from_i64(
        "correct_attempts",
        row.try_get::<i64, _>("correct_attempts").map_err(ser)?,
    )?;

    QuestionStat::from_persisted(question_id, total, correct).map_err(ser)
}
