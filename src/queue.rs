//! Durable queue of scheduled pyramid builds and similar deferred work.
//!
//! At-least-once delivery: a master claims due jobs by atomically flipping
//! them from pending to running inside one transaction, so no job runs on
//! two masters simultaneously. The database is the only coordination point
//! between masters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use sqlx::{postgres::PgRow, types::Json, FromRow, PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

/// Jobs whose failed_attempts reached this are no longer claimed and get
/// marked failed by the ticker.
pub const MAX_ATTEMPTS: i32 = 5;

const RETRY_BASE_SECS: u64 = 60;
const RETRY_CAP_SECS: u64 = 3600;

/// Persisted status values. Frozen; changing them corrupts existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i32)]
pub enum JobStatus {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
}

impl TryFrom<i32> for JobStatus {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Running),
            2 => Ok(Self::Succeeded),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Cancelled),
            other => Err(anyhow::anyhow!("unknown job status {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobDetail {
    Pyramid { datasource_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    pub failed_attempts: i32,
    pub status: JobStatus,
    pub detail: JobDetail,
}

impl<'r> FromRow<'r, PgRow> for Job {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let job_id: String = row.try_get("job_id")?;
        let job_id = Uuid::parse_str(&job_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let status: i32 = row.try_get("status")?;
        let status = JobStatus::try_from(status).map_err(|e| sqlx::Error::Decode(e.into()))?;
        let detail: Json<JobDetail> = row.try_get("job_detail")?;
        Ok(Self {
            job_id,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            scheduled_for: row.try_get("scheduled_for")?,
            failed_attempts: row.try_get("failed_attempts")?,
            status,
            detail: detail.0,
        })
    }
}

/// How an executed job ended.
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    /// Transient failure; back on the queue after the given delay.
    Retry(Duration),
}

/// Exponential backoff for transient job failures.
pub fn retry_backoff(failed_attempts: i32) -> Duration {
    let exp = failed_attempts.clamp(0, 30) as u32;
    let secs = RETRY_BASE_SECS.saturating_mul(1u64 << exp);
    Duration::from_secs(secs.min(RETRY_CAP_SECS))
}

#[derive(Clone)]
pub struct JobQueue {
    db: PgPool,
}

impl JobQueue {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        detail: JobDetail,
        scheduled_for: Option<OffsetDateTime>,
    ) -> anyhow::Result<Uuid> {
        let job_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let mut delay = Duration::from_millis(100);
        for attempt in 1.. {
            let result = sqlx::query(
                "INSERT INTO queue \
                 (job_id, created_at, updated_at, scheduled_for, failed_attempts, status, \
                  job_detail) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(job_id.to_string())
            .bind(now)
            .bind(now)
            .bind(scheduled_for.unwrap_or(now))
            .bind(0_i32)
            .bind(JobStatus::Pending as i32)
            .bind(Json(&detail))
            .execute(&self.db)
            .await;

            match result {
                Ok(_) => break,
                Err(e) if crate::db::is_transient(&e) && attempt < crate::db::TRANSIENT_ATTEMPTS => {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(job_id)
    }

    /// Atomically claim up to `limit` due jobs: flip pending rows whose
    /// `scheduled_for` has passed to running and return them. Row locking
    /// keeps concurrent masters from claiming the same job.
    pub async fn claim_due(&self, limit: i64) -> anyhow::Result<Vec<Job>> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.db.begin().await?;
        let jobs: Vec<Job> = sqlx::query_as(
            "UPDATE queue \
             SET status = $1, updated_at = $2 \
             WHERE job_id IN ( \
                 SELECT job_id FROM queue \
                 WHERE status = $3 AND scheduled_for <= $4 AND failed_attempts < $5 \
                 ORDER BY scheduled_for \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT $6 \
             ) \
             RETURNING job_id, created_at, updated_at, scheduled_for, \
                       failed_attempts, status, job_detail",
        )
        .bind(JobStatus::Running as i32)
        .bind(now)
        .bind(JobStatus::Pending as i32)
        .bind(now)
        .bind(MAX_ATTEMPTS)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(jobs)
    }

    pub async fn complete(&self, job_id: Uuid, outcome: JobOutcome) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        match outcome {
            JobOutcome::Succeeded => {
                sqlx::query("UPDATE queue SET status = $1, updated_at = $2 WHERE job_id = $3")
                    .bind(JobStatus::Succeeded as i32)
                    .bind(now)
                    .bind(job_id.to_string())
                    .execute(&self.db)
                    .await?;
            }
            JobOutcome::Failed => {
                sqlx::query(
                    "UPDATE queue \
                     SET status = $1, updated_at = $2, failed_attempts = failed_attempts + 1 \
                     WHERE job_id = $3",
                )
                .bind(JobStatus::Failed as i32)
                .bind(now)
                .bind(job_id.to_string())
                .execute(&self.db)
                .await?;
            }
            JobOutcome::Retry(after) => {
                sqlx::query(
                    "UPDATE queue \
                     SET status = $1, updated_at = $2, scheduled_for = $3, \
                         failed_attempts = failed_attempts + 1 \
                     WHERE job_id = $4",
                )
                .bind(JobStatus::Pending as i32)
                .bind(now)
                .bind(now + after)
                .bind(job_id.to_string())
                .execute(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn list(&self, status: Option<JobStatus>) -> anyhow::Result<Vec<Job>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as("SELECT * FROM queue WHERE status = $1 ORDER BY scheduled_for")
                    .bind(status as i32)
                    .fetch_all(&self.db)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM queue ORDER BY scheduled_for")
                    .fetch_all(&self.db)
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Flag a pending or running job as cancelled. Executors observe the flag
    /// at their next safe point.
    pub async fn cancel(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE queue SET status = $1, updated_at = $2 \
             WHERE job_id = $3 AND status IN ($4, $5)",
        )
        .bind(JobStatus::Cancelled as i32)
        .bind(OffsetDateTime::now_utc())
        .bind(job_id.to_string())
        .bind(JobStatus::Pending as i32)
        .bind(JobStatus::Running as i32)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn status_of(&self, job_id: Uuid) -> anyhow::Result<Option<JobStatus>> {
        let status: Option<i32> = sqlx::query_scalar("SELECT status FROM queue WHERE job_id = $1")
            .bind(job_id.to_string())
            .fetch_optional(&self.db)
            .await?;
        status.map(JobStatus::try_from).transpose()
    }

    /// The pending or running pyramid job of a datasource, if one exists.
    /// Backs the idempotence of `POST /api/pyramid`.
    pub async fn active_pyramid(&self, datasource_id: &str) -> anyhow::Result<Option<Uuid>> {
        let job_id: Option<String> = sqlx::query_scalar(
            "SELECT job_id FROM queue \
             WHERE status IN ($1, $2) \
               AND job_detail->>'type' = 'pyramid' \
               AND job_detail->>'datasource_id' = $3 \
             ORDER BY created_at \
             LIMIT 1",
        )
        .bind(JobStatus::Pending as i32)
        .bind(JobStatus::Running as i32)
        .bind(datasource_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job_id.map(|id| Uuid::parse_str(&id)).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_integers_are_frozen() {
        assert_eq!(JobStatus::Pending as i32, 0);
        assert_eq!(JobStatus::Running as i32, 1);
        assert_eq!(JobStatus::Succeeded as i32, 2);
        assert_eq!(JobStatus::Failed as i32, 3);
        assert_eq!(JobStatus::Cancelled as i32, 4);
        for i in 0..=4 {
            assert_eq!(JobStatus::try_from(i).unwrap() as i32, i);
        }
        assert!(JobStatus::try_from(5).is_err());
    }

    #[test]
    fn status_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&JobStatus::Running).unwrap(), "1");
        let status: JobStatus = serde_json::from_str("4").unwrap();
        assert_eq!(status, JobStatus::Cancelled);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(60));
        assert_eq!(retry_backoff(1), Duration::from_secs(120));
        assert_eq!(retry_backoff(2), Duration::from_secs(240));
        assert_eq!(retry_backoff(6), Duration::from_secs(3600));
        assert_eq!(retry_backoff(30), Duration::from_secs(3600));
        assert_eq!(retry_backoff(i32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn job_detail_wire_shape() {
        let detail = JobDetail::Pyramid {
            datasource_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "pyramid", "datasource_id": "abc"})
        );
    }
}
