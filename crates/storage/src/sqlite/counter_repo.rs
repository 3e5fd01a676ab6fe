use quiz_core::model::QuestionId;

use super::{
    SqliteRepository,
    mapping::{classify, counter_to_i64, map_stat_row},
};
use crate::repository::{AtomicUnit, CounterStore, StorageError, UnitOutcome};

#[async_trait::async_trait]
impl CounterStore for SqliteRepository {
    fn max_ops_per_unit(&self) -> usize {
        self.max_ops
    }

    async fn apply_unit(&self, unit: &AtomicUnit) -> Result<UnitOutcome, StorageError> {
        unit.check_size(self.max_ops)?;

        // Bind values are converted before the transaction opens.
        let mut rows = Vec::with_capacity(unit.ops.len());
        for op in &unit.ops {
            rows.push((
                op.question_id.as_str(),
                counter_to_i64("total_attempts", op.delta.total())?,
                counter_to_i64("correct_attempts", op.delta.correct())?,
            ));
        }

        // Dropping `tx` without commit rolls back, so any early return below
        // leaves the store untouched.
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Marker inserts go first: the write takes SQLite's reserved lock, so a
        // concurrent delivery of the same unit waits here and then sees the row.
        for marker in &unit.markers {
            let res = sqlx::query(
                r"
                    INSERT INTO processed_units (marker, attempt_id, processed_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(marker) DO NOTHING
                ",
            )
            .bind(marker.key.as_str())
            .bind(marker.attempt_id.as_str())
            .bind(marker.processed_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

            if res.rows_affected() == 0 {
                tx.rollback().await.map_err(classify)?;
                tracing::debug!(marker = %marker.key, "unit already applied");
                return Ok(UnitOutcome::AlreadyApplied);
            }
        }

        for (question_id, total, correct) in rows {
            sqlx::query(
                r"
                    INSERT INTO question_stats (
                        question_id, total_attempts, correct_attempts, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(question_id) DO UPDATE SET
                        total_attempts = question_stats.total_attempts + excluded.total_attempts,
                        correct_attempts = question_stats.correct_attempts + excluded.correct_attempts,
                        updated_at = excluded.updated_at
                ",
            )
            .bind(question_id)
            .bind(total)
            .bind(correct)
            .bind(unit.applied_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        tracing::debug!(
            markers = unit.markers.len(),
            ops = unit.ops.len(),
            "unit committed"
        );
        Ok(UnitOutcome::Committed)
    }

    async fn get_stat(
        &self,
        question_id: &QuestionId,
    ) -> Result<quiz_core::model::QuestionStat, StorageError> {
        let row = sqlx::query(
            r"
                SELECT question_id, total_attempts, correct_attempts
                FROM question_stats
                WHERE question_id = ?1
            ",
        )
        .bind(question_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?
        .ok_or(StorageError::NotFound)?;

        map_stat_row(&row)
    }

    async fn is_processed(&self, marker_key: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM processed_units WHERE marker = ?1")
            .bind(marker_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.is_some())
    }
}
