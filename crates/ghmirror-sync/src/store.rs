//! Schedule rows, the job run ledger and cache-state rows.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghmirror_core::{CacheState, CacheStatus, JobStatus, JobTrigger, JobType, ScheduleConfig};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, Row};
use tracing::warn;
use uuid::Uuid;

/// Session advisory lock held by whichever process is running a job.
pub const RUN_LEASE_KEY: i64 = 0x6768_6a6f_6272_756e;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRunRecord {
    pub id: Uuid,
    pub job: JobType,
    pub trigger: JobTrigger,
    pub status: JobStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Persistence seam between the orchestrator and the database.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn load_schedule(&self, job: JobType) -> Result<Option<ScheduleConfig>>;

    async fn save_schedule(&self, job: JobType, schedule: &ScheduleConfig) -> Result<()>;

    /// Writes `schedule` only when the job type has no row yet. Returns true
    /// when a row was inserted.
    async fn seed_schedule(&self, job: JobType, schedule: &ScheduleConfig) -> Result<bool>;

    async fn create_run(&self, job: JobType, trigger: JobTrigger) -> Result<JobRunRecord>;

    async fn mark_running(&self, run_id: Uuid) -> Result<()>;

    /// Closes a run and mirrors its outcome onto the job type's schedule row.
    async fn finish_run(
        &self,
        run_id: Uuid,
        job: JobType,
        status: JobStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn append_log(&self, run_id: Uuid, level: LogLevel, message: &str) -> Result<()>;

    /// Force-fails runs a previous process left waiting or running.
    async fn fail_interrupted_runs(&self, reason: &str) -> Result<u64>;

    async fn last_run(&self, job: JobType) -> Result<Option<JobRunRecord>>;

    /// Cross-process half of the job lock. `None` while another process
    /// holds it.
    async fn try_acquire_run_lease(&self) -> Result<Option<Box<dyn RunLease>>>;
}

/// Proof that no other process is running a job. Dropping a lease without
/// releasing it still frees it, less gracefully.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Holds [`RUN_LEASE_KEY`] on a dedicated pooled connection.
struct PgRunLease {
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LEASE_KEY)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                drop(conn.detach());
                Err(anyhow!("run lease was not held by this session"))
            }
            Err(err) => {
                // closing the session drops the lock with it
                drop(conn.detach());
                Err(anyhow::Error::new(err).context("releasing run lease"))
            }
        }
    }
}

impl Drop for PgRunLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("run lease dropped without release; closing its connection");
            drop(conn.detach());
        }
    }
}

#[derive(Clone)]
pub struct PgSchedulerStore {
    pool: PgPool,
}

impl PgSchedulerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<JobRunRecord> {
    Ok(JobRunRecord {
        id: row.try_get("id")?,
        job: row.try_get::<String, _>("job_type")?.parse()?,
        trigger: row.try_get::<String, _>("trigger")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        requested_at: row.try_get("requested_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        summary: row.try_get("summary")?,
        error: row.try_get("error")?,
    })
}

const RUN_COLUMNS: &str = "id, job_type, trigger, status, requested_at, started_at, completed_at, summary, error";

#[async_trait]
impl SchedulerStore for PgSchedulerStore {
    async fn load_schedule(&self, job: JobType) -> Result<Option<ScheduleConfig>> {
        let row = sqlx::query("SELECT enabled, hour, minute, timezone FROM sync_config WHERE job_type = $1")
            .bind(job.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading {job} schedule"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let hour: i16 = row.try_get("hour")?;
        let minute: i16 = row.try_get("minute")?;
        Ok(Some(ScheduleConfig {
            enabled: row.try_get("enabled")?,
            hour: u8::try_from(hour).map_err(|_| anyhow!("stored hour {hour} for {job} is out of range"))?,
            minute: u8::try_from(minute).map_err(|_| anyhow!("stored minute {minute} for {job} is out of range"))?,
            timezone: row.try_get("timezone")?,
        }))
    }

    async fn save_schedule(&self, job: JobType, schedule: &ScheduleConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_config (job_type, enabled, hour, minute, timezone, updated_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (job_type) DO UPDATE
             SET enabled = EXCLUDED.enabled, hour = EXCLUDED.hour, minute = EXCLUDED.minute,
                 timezone = EXCLUDED.timezone, updated_at = now()",
        )
        .bind(job.as_str())
        .bind(schedule.enabled)
        .bind(i16::from(schedule.hour))
        .bind(i16::from(schedule.minute))
        .bind(&schedule.timezone)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving {job} schedule"))?;
        Ok(())
    }

    async fn seed_schedule(&self, job: JobType, schedule: &ScheduleConfig) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO sync_config (job_type, enabled, hour, minute, timezone)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (job_type) DO NOTHING",
        )
        .bind(job.as_str())
        .bind(schedule.enabled)
        .bind(i16::from(schedule.hour))
        .bind(i16::from(schedule.minute))
        .bind(&schedule.timezone)
        .execute(&self.pool)
        .await
        .with_context(|| format!("seeding {job} schedule"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, job: JobType, trigger: JobTrigger) -> Result<JobRunRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO sync_job_runs (id, job_type, trigger, status, requested_at)
             VALUES ($1, $2, $3, $4, now())
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(job.as_str())
        .bind(trigger.as_str())
        .bind(JobStatus::Waiting.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("creating {job} run"))?;
        run_from_row(&row)
    }

    async fn mark_running(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sync_job_runs SET status = $2, started_at = now() WHERE id = $1")
            .bind(run_id)
            .bind(JobStatus::Running.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("marking run {run_id} running"))?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        job: JobType,
        status: JobStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening run ledger transaction")?;
        sqlx::query(
            "UPDATE sync_job_runs SET status = $2, completed_at = now(), summary = $3, error = $4 WHERE id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(summary)
        .bind(error)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("closing run {run_id}"))?;
        sqlx::query(
            "INSERT INTO sync_config (job_type, last_run_at, last_status, last_error)
             VALUES ($1, now(), $2, $3)
             ON CONFLICT (job_type) DO UPDATE
             SET last_run_at = now(), last_status = EXCLUDED.last_status, last_error = EXCLUDED.last_error",
        )
        .bind(job.as_str())
        .bind(status.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("recording last {job} run"))?;
        tx.commit().await.context("committing run ledger")?;
        Ok(())
    }

    async fn append_log(&self, run_id: Uuid, level: LogLevel, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO sync_job_logs (run_id, level, message) VALUES ($1, $2, $3)")
            .bind(run_id)
            .bind(level.as_str())
            .bind(message)
            .execute(&self.pool)
            .await
            .with_context(|| format!("appending log for run {run_id}"))?;
        Ok(())
    }

    async fn fail_interrupted_runs(&self, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_job_runs SET status = $1, completed_at = now(), error = $2
             WHERE status IN ($3, $4)",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(reason)
        .bind(JobStatus::Waiting.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .context("failing interrupted runs")?;
        Ok(result.rows_affected())
    }

    async fn last_run(&self, job: JobType) -> Result<Option<JobRunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_job_runs WHERE job_type = $1 ORDER BY requested_at DESC LIMIT 1"
        ))
        .bind(job.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading last {job} run"))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn try_acquire_run_lease(&self) -> Result<Option<Box<dyn RunLease>>> {
        let mut conn = self.pool.acquire().await.context("acquiring run lease connection")?;
        let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(RUN_LEASE_KEY)
            .fetch_one(&mut *conn)
            .await
            .context("trying run lease")?;
        Ok(granted.then(|| Box::new(PgRunLease { conn: Some(conn) }) as Box<dyn RunLease>))
    }
}

pub async fn read_cache_state<'e, E>(executor: E, key: &str) -> Result<Option<CacheState>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        "SELECT key, status, last_successful_sync_at, run_id, counts, error FROM cache_state WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(executor)
    .await
    .with_context(|| format!("reading cache state `{key}`"))?;
    let Some(row) = row else {
        return Ok(None);
    };
    let counts: Json<BTreeMap<String, i64>> = row.try_get("counts")?;
    Ok(Some(CacheState {
        key: row.try_get("key")?,
        status: row.try_get::<String, _>("status")?.parse::<CacheStatus>()?,
        last_successful_sync_at: row.try_get("last_successful_sync_at")?,
        run_id: row.try_get("run_id")?,
        counts: counts.0,
        error: row.try_get("error")?,
    }))
}

pub async fn write_cache_state<'e, E>(executor: E, state: &CacheState) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO cache_state (key, status, last_successful_sync_at, run_id, counts, error, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, now())
         ON CONFLICT (key) DO UPDATE
         SET status = EXCLUDED.status,
             last_successful_sync_at = EXCLUDED.last_successful_sync_at,
             run_id = EXCLUDED.run_id,
             counts = EXCLUDED.counts,
             error = EXCLUDED.error,
             updated_at = now()",
    )
    .bind(&state.key)
    .bind(state.status.as_str())
    .bind(state.last_successful_sync_at)
    .bind(state.run_id)
    .bind(Json(&state.counts))
    .bind(&state.error)
    .execute(executor)
    .await
    .with_context(|| format!("writing cache state `{}`", state.key))?;
    Ok(())
}
