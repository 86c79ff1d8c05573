//! Task queue handing runs from the controller to the execution worker.
//!
//! One job per run id. The controller only ever enqueues and withdraws
//! pending jobs; claiming and completing belong to the worker. Withdrawal
//! and claim are each a single conditional statement, so at most one of
//! them wins for a given pending job.

use std::collections::HashMap;
use std::fmt;

use assist_core::Id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Active,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// Payload of a "execute this run" job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(rename = "runId")]
    pub run_id: Id,
}

/// A job to enqueue. The id is the run id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub name: String,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn for_run(name: &str, run_id: &Id) -> Self {
        Self {
            id: run_id.to_string(),
            name: name.to_string(),
            payload: JobPayload {
                run_id: run_id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was added, or a finished one was revived.
    Enqueued,
    /// A job with this id is already waiting.
    AlreadyPending,
    /// A worker holds the job and has not released it yet.
    AlreadyActive,
}

#[async_trait]
pub trait TaskQueue: Send + Sync + fmt::Debug {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome>;

    /// Remove the job only if no worker has claimed it yet.
    async fn cancel_if_pending(&self, job_id: &str) -> Result<bool>;

    async fn state(&self, job_id: &str) -> Result<Option<JobState>>;

    /// Claim the oldest pending job with this name.
    async fn claim(&self, name: &str) -> Result<Option<Job>>;

    /// Mark an active job done. Returns false if it was not active.
    async fn complete(&self, job_id: &str) -> Result<bool>;
}

// --- SQLite implementation ---

/// Queue stored in the `jobs` table next to the runs it drives.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for SqliteQueue {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, name, payload_json, state, enqueued_at, claimed_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, NULL)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                payload_json = excluded.payload_json,
                state = 'pending',
                enqueued_at = excluded.enqueued_at,
                claimed_at = NULL
            WHERE jobs.state = 'done'
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(EnqueueOutcome::Enqueued);
        }

        let state: String = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?1")
            .bind(&job.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        match JobState::parse(&state) {
            Some(JobState::Active) => Ok(EnqueueOutcome::AlreadyActive),
            Some(JobState::Pending) => Ok(EnqueueOutcome::AlreadyPending),
            _ => Err(QueueError::Corrupt(format!(
                "job {} left in state {state:?} after enqueue",
                job.id
            ))),
        }
    }

    async fn cancel_if_pending(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1 AND state = 'pending'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn state(&self, job_id: &str) -> Result<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        state
            .map(|s| {
                JobState::parse(&s)
                    .ok_or_else(|| QueueError::Corrupt(format!("job {job_id} has state {s:?}")))
            })
            .transpose()
    }

    async fn claim(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET state = 'active', claimed_at = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE name = ?2 AND state = 'pending'
                ORDER BY enqueued_at ASC, id ASC
                LIMIT 1
            ) AND state = 'pending'
            RETURNING id, name, payload_json, state, enqueued_at, claimed_at
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn complete(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET state = 'done' WHERE id = ?1 AND state = 'active'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    payload_json: String,
    state: String,
    enqueued_at: i64,
    claimed_at: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let state = JobState::parse(&self.state).ok_or_else(|| {
            QueueError::Corrupt(format!("job {} has state {:?}", self.id, self.state))
        })?;
        Ok(Job {
            payload: serde_json::from_str(&self.payload_json)?,
            id: self.id,
            name: self.name,
            state,
            enqueued_at: DateTime::from_timestamp_millis(self.enqueued_at).unwrap_or_default(),
            claimed_at: self.claimed_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

// --- In-memory implementation ---

/// Process-local queue. Every operation runs under one lock, which gives
/// withdrawal and claim the same mutual exclusion as the SQLite queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(&job.id).map(|existing| existing.state) {
            Some(JobState::Pending) => return Ok(EnqueueOutcome::AlreadyPending),
            Some(JobState::Active) => return Ok(EnqueueOutcome::AlreadyActive),
            Some(JobState::Done) | None => {}
        }
        jobs.insert(
            job.id.clone(),
            Job {
                id: job.id,
                name: job.name,
                payload: job.payload,
                state: JobState::Pending,
                enqueued_at: Utc::now(),
                claimed_at: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn cancel_if_pending(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(job_id).is_some_and(|job| job.state == JobState::Pending) {
            jobs.remove(job_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn state(&self, job_id: &str) -> Result<Option<JobState>> {
        Ok(self.jobs.lock().await.get(job_id).map(|job| job.state))
    }

    async fn claim(&self, name: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values_mut()
            .filter(|job| job.name == name && job.state == JobState::Pending)
            .min_by(|a, b| (a.enqueued_at, &a.id).cmp(&(b.enqueued_at, &b.id)));

        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.claimed_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn complete(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) if job.state == JobState::Active => {
                job.state = JobState::Done;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
