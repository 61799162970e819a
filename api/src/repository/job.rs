use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use forge_inbox::JobId;

use crate::{
    forge_inbox::ForgeInboxError,
    jobs::{Job, JobKind, JobStatus},
    repository::{db_error, Repository},
};

#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: Vec<u8>,
    pub dedup_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i64,
}

#[async_trait]
pub trait JobRepository {
    /// Inserts a job, returning `None` when a job with the same dedup key
    /// is already pending or running.
    async fn enqueue_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        new_job: NewJob,
    ) -> Result<Option<Job>, ForgeInboxError>;

    /// Atomically claims one due job: sets the lease and increments the
    /// attempt counter in a single statement, so no two workers can ever
    /// observe the same job as claimable.
    async fn claim_due_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, ForgeInboxError>;

    /// Heartbeat: extends the lease while the handler is still running.
    /// Returns false if the lease is no longer held.
    async fn renew_job_lease(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, ForgeInboxError>;

    async fn complete_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
    ) -> Result<bool, ForgeInboxError>;

    /// Records a handler failure. With `retry_at` the job goes back into
    /// the queue; without it the job is dead.
    async fn fail_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ForgeInboxError>;

    /// Shutdown path: hands a still-running job back to the queue without
    /// burning an attempt beyond the one already counted at claim.
    async fn release_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
        error: &str,
    ) -> Result<bool, ForgeInboxError>;

    /// Janitor sweep: expired leases transition running jobs back to
    /// pending so another worker picks them up.
    async fn sweep_expired_leases(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        now: DateTime<Utc>,
    ) -> Result<u64, ForgeInboxError>;

    async fn get_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
    ) -> Result<Option<Job>, ForgeInboxError>;
}

#[async_trait]
impl JobRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(kind = new_job.kind.to_string()), err)]
    async fn enqueue_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        new_job: NewJob,
    ) -> Result<Option<Job>, ForgeInboxError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
                INSERT INTO job
                  (id, kind, payload, dedup_key, run_at, max_attempts,
                   status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
                ON CONFLICT DO NOTHING
                RETURNING *
            "#,
        )
        .bind(JobId::new().to_string())
        .bind(new_job.kind.to_string())
        .bind(new_job.payload)
        .bind(new_job.dedup_key)
        .bind(new_job.run_at)
        .bind(new_job.max_attempts)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to enqueue {} job: {err}", new_job.kind);
            db_error(err, message)
        })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn claim_due_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, ForgeInboxError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
                UPDATE job SET
                  status = 'running',
                  lease_token = ?,
                  lease_expires_at = ?,
                  attempts = attempts + 1,
                  updated_at = ?
                WHERE id = (
                  SELECT id FROM job
                  WHERE status IN ('pending', 'failed')
                    AND run_at <= ?
                    AND attempts < max_attempts
                  ORDER BY run_at
                  LIMIT 1
                )
                RETURNING *
            "#,
        )
        .bind(lease_token)
        .bind(lease_expires_at)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to claim a due job: {err}");
            db_error(err, message)
        })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job_id.to_string()), err)]
    async fn renew_job_lease(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, ForgeInboxError> {
        let result = sqlx::query(
            "UPDATE job SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND status = 'running'",
        )
        .bind(lease_expires_at)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .bind(lease_token)
        .execute(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to renew lease for job {job_id}: {err}");
            db_error(err, message)
        })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job_id.to_string()), err)]
    async fn complete_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
    ) -> Result<bool, ForgeInboxError> {
        let result = sqlx::query(
            "UPDATE job SET status = 'succeeded', lease_token = NULL, \
             lease_expires_at = NULL, last_error = NULL, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(job_id.to_string())
        .bind(lease_token)
        .execute(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to complete job {job_id}: {err}");
            db_error(err, message)
        })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job_id.to_string()), err)]
    async fn fail_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ForgeInboxError> {
        let result = match retry_at {
            Some(retry_at) => {
                sqlx::query(
                    "UPDATE job SET status = 'failed', run_at = ?, last_error = ?, \
                     lease_token = NULL, lease_expires_at = NULL, updated_at = ? \
                     WHERE id = ? AND lease_token = ? AND status = 'running'",
                )
                .bind(retry_at)
                .bind(error)
                .bind(Utc::now())
                .bind(job_id.to_string())
                .bind(lease_token)
                .execute(&mut **executor)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE job SET status = 'dead', last_error = ?, \
                     lease_token = NULL, lease_expires_at = NULL, updated_at = ? \
                     WHERE id = ? AND lease_token = ? AND status = 'running'",
                )
                .bind(error)
                .bind(Utc::now())
                .bind(job_id.to_string())
                .bind(lease_token)
                .execute(&mut **executor)
                .await
            }
        }
        .map_err(|err| {
            let message = format!("Failed to record failure for job {job_id}: {err}");
            db_error(err, message)
        })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job_id.to_string()), err)]
    async fn release_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        lease_token: &str,
        error: &str,
    ) -> Result<bool, ForgeInboxError> {
        let result = sqlx::query(
            "UPDATE job SET status = 'pending', last_error = ?, \
             lease_token = NULL, lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND status = 'running'",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .bind(lease_token)
        .execute(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to release job {job_id}: {err}");
            db_error(err, message)
        })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn sweep_expired_leases(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        now: DateTime<Utc>,
    ) -> Result<u64, ForgeInboxError> {
        // A crashed job that already burned its last attempt is dead, not
        // requeued.
        sqlx::query(
            "UPDATE job SET status = 'dead', lease_token = NULL, \
             lease_expires_at = NULL, last_error = 'lease expired', updated_at = ? \
             WHERE status = 'running' AND lease_expires_at < ? \
             AND attempts >= max_attempts",
        )
        .bind(now)
        .bind(now)
        .execute(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to sweep exhausted job leases: {err}");
            db_error(err, message)
        })?;

        let result = sqlx::query(
            "UPDATE job SET status = 'pending', lease_token = NULL, \
             lease_expires_at = NULL, last_error = 'lease expired', updated_at = ? \
             WHERE status = 'running' AND lease_expires_at < ?",
        )
        .bind(now)
        .bind(now)
        .execute(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to sweep expired job leases: {err}");
            db_error(err, message)
        })?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job_id.to_string()), err)]
    async fn get_job(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
    ) -> Result<Option<Job>, ForgeInboxError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM job WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch job {job_id}: {err}");
                db_error(err, message)
            })?;

        row.map(|row| row.try_into()).transpose()
    }
}

#[derive(Debug, FromRow)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub dedup_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub status: String,
    pub last_error: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = ForgeInboxError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row
                .id
                .parse::<uuid::Uuid>()
                .map(JobId::from)
                .context("Invalid job id in storage")?,
            kind: JobKind::from_kind(&row.kind)
                .ok_or_else(|| anyhow!("Unknown job kind `{}` in storage", row.kind))?,
            payload: row.payload,
            dedup_key: row.dedup_key,
            run_at: row.run_at,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            status: JobStatus::from_status(&row.status)
                .ok_or_else(|| anyhow!("Unknown job status `{}` in storage", row.status))?,
            last_error: row.last_error,
            lease_token: row.lease_token,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
