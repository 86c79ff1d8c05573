//! SQLite storage module for the run daemon.
//!
//! Persists assistants, threads, messages, runs and run steps. Run status
//! changes go through conditional updates (`WHERE id = ? AND status IN
//! (...)`) so a racing worker or duplicate request loses cleanly instead
//! of overwriting.

use assist_core::{
    Assistant, Id, Message, MessageRole, Metadata, QueryPlan, Run, RunError, RunStatus, RunStep,
    RunStepStatus, StepDetails, StepType, Thread,
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Executor, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for runs table queries.
const RUNS_COLUMNS: &str = "id, created_at, thread_id, assistant_id, status, started_at, \
    expires_at, cancelled_at, failed_at, completed_at, last_error_json, model, instructions, \
    tools_json, file_ids_json, metadata_json";

const STEPS_COLUMNS: &str = "id, created_at, run_id, thread_id, assistant_id, type, status, \
    step_details_json, completed_at, cancelled_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("run step not found: {0}")]
    StepNotFound(String),
    #[error("assistant not found: {0}")]
    AssistantNotFound(String),
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Shared connection pool, also used by the SQLite-backed job queue.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Assistant operations ---

    pub async fn insert_assistant(&self, assistant: &Assistant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assistants (id, created_at, name, model, instructions, tools_json,
                                    file_ids_json, metadata_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(assistant.id.as_ref())
        .bind(assistant.created_at.timestamp_millis())
        .bind(&assistant.name)
        .bind(&assistant.model)
        .bind(&assistant.instructions)
        .bind(serde_json::to_string(&assistant.tools)?)
        .bind(serde_json::to_string(&assistant.file_ids)?)
        .bind(serde_json::to_string(&assistant.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_assistant(&self, id: &Id) -> Result<Assistant> {
        let row = sqlx::query_as::<_, AssistantRow>("SELECT * FROM assistants WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AssistantNotFound(id.to_string()))?;
        row.into_assistant()
    }

    // --- Thread operations ---

    /// Insert a thread together with its initial messages.
    pub async fn insert_thread(&self, thread: &Thread, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_thread_in(&mut *tx, thread).await?;
        for message in messages {
            insert_message_in(&mut *tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_thread(&self, id: &Id) -> Result<Thread> {
        let row = sqlx::query_as::<_, ThreadRow>("SELECT * FROM threads WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ThreadNotFound(id.to_string()))?;
        row.into_thread()
    }

    pub async fn list_messages(&self, thread_id: &Id) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE thread_id = ?1 ORDER BY id ASC",
        )
        .bind(thread_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    // --- Run operations ---

    /// Insert a new run.
    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        insert_run_in(&self.pool, run).await
    }

    /// Insert a thread, its messages and a run against it in one transaction.
    pub async fn insert_thread_and_run(
        &self,
        thread: &Thread,
        messages: &[Message],
        run: &Run,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_thread_in(&mut *tx, thread).await?;
        for message in messages {
            insert_message_in(&mut *tx, message).await?;
        }
        insert_run_in(&mut *tx, run).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a run scoped to its thread.
    pub async fn get_run(&self, thread_id: &Id, run_id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1 AND thread_id = ?2");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(run_id.as_ref())
            .bind(thread_id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        row.into_run()
    }

    /// Get a run by id alone (worker side, where only the job payload is known).
    pub async fn get_run_by_id(&self, run_id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(run_id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        row.into_run()
    }

    /// List a thread's runs according to a pagination plan.
    ///
    /// Returns up to `plan.fetch` rows in fetch order; callers build the
    /// page with [`assist_core::Page::from_rows`].
    pub async fn list_runs(&self, thread_id: &Id, plan: &QueryPlan) -> Result<Vec<Run>> {
        let mut query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE thread_id = ?");
        if let Some((op, _)) = &plan.cursor {
            query.push_str(&format!(" AND id {op} ?"));
        }
        query.push_str(&format!(" ORDER BY id {} LIMIT ?", plan.order.as_sql()));

        let mut q = sqlx::query_as::<_, RunRow>(&query).bind(thread_id.as_ref());
        if let Some((_, cursor)) = &plan.cursor {
            q = q.bind(cursor.as_str());
        }
        let rows = q.bind(i64::from(plan.fetch)).fetch_all(&self.pool).await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// All runs currently in `status`, oldest first.
    pub async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE status = ?1 ORDER BY id ASC");
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Replace a run's metadata. Status is never touched here.
    pub async fn update_run_metadata(
        &self,
        thread_id: &Id,
        run_id: &Id,
        metadata: &Metadata,
    ) -> Result<Run> {
        let result =
            sqlx::query("UPDATE runs SET metadata_json = ?1 WHERE id = ?2 AND thread_id = ?3")
                .bind(serde_json::to_string(metadata)?)
                .bind(run_id.as_ref())
                .bind(thread_id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id.to_string()));
        }
        self.get_run(thread_id, run_id).await
    }

    /// Conditionally move a run to `to` if its status is one of `from`.
    ///
    /// Returns `false` when no row matched (missing run or status moved on).
    /// The timestamp column belonging to `to` is set if still empty.
    pub async fn transition_run(
        &self,
        run_id: &Id,
        from: &[RunStatus],
        to: RunStatus,
        last_error: Option<&RunError>,
    ) -> Result<bool> {
        transition_run_in(&self.pool, run_id, from, to, last_error).await
    }

    /// Settle a `cancelling` run to `cancelled`, cancelling its open steps.
    pub async fn settle_cancelled(&self, run_id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let moved = transition_run_in(
            &mut *tx,
            run_id,
            &[RunStatus::Cancelling],
            RunStatus::Cancelled,
            None,
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE run_steps SET status = ?1, cancelled_at = ?2 WHERE run_id = ?3 AND status = ?4",
        )
        .bind(RunStepStatus::Cancelled.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(run_id.as_ref())
        .bind(RunStepStatus::InProgress.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // --- Step operations ---

    pub async fn insert_step(&self, step: &RunStep) -> Result<()> {
        insert_step_in(&self.pool, step).await
    }

    /// Open a tool-call step and move the run `in_progress -> requires_action`.
    ///
    /// Fails with `Conflict` if the run already has an unresolved tool step;
    /// returns `false` if the run was no longer `in_progress`.
    pub async fn open_tool_step(&self, step: &RunStep) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        insert_step_in(&mut *tx, step).await?;
        let moved = transition_run_in(
            &mut *tx,
            &step.run_id,
            &[RunStatus::InProgress],
            RunStatus::RequiresAction,
            None,
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_step(&self, run_id: &Id, step_id: &Id) -> Result<RunStep> {
        let query = format!("SELECT {STEPS_COLUMNS} FROM run_steps WHERE id = ?1 AND run_id = ?2");
        let row = sqlx::query_as::<_, StepRow>(&query)
            .bind(step_id.as_ref())
            .bind(run_id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::StepNotFound(step_id.to_string()))?;
        row.into_step()
    }

    /// List a run's steps according to a pagination plan.
    pub async fn list_steps(&self, run_id: &Id, plan: &QueryPlan) -> Result<Vec<RunStep>> {
        let mut query = format!("SELECT {STEPS_COLUMNS} FROM run_steps WHERE run_id = ?");
        if let Some((op, _)) = &plan.cursor {
            query.push_str(&format!(" AND id {op} ?"));
        }
        query.push_str(&format!(" ORDER BY id {} LIMIT ?", plan.order.as_sql()));

        let mut q = sqlx::query_as::<_, StepRow>(&query).bind(run_id.as_ref());
        if let Some((_, cursor)) = &plan.cursor {
            q = q.bind(cursor.as_str());
        }
        let rows = q.bind(i64::from(plan.fetch)).fetch_all(&self.pool).await?;

        rows.into_iter().map(StepRow::into_step).collect()
    }

    /// Most recent `tool_calls` step of a run, whatever its status.
    pub async fn latest_tool_step(&self, run_id: &Id) -> Result<Option<RunStep>> {
        let query = format!(
            "SELECT {STEPS_COLUMNS} FROM run_steps WHERE run_id = ?1 AND type = ?2 \
             ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, StepRow>(&query)
            .bind(run_id.as_ref())
            .bind(StepType::ToolCalls.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(StepRow::into_step).transpose()
    }

    /// Resolve a tool step and re-queue its run in one transaction.
    ///
    /// Both updates are conditional (`requires_action` run, `in_progress`
    /// step). If either misses, nothing is written and `false` is returned.
    pub async fn commit_tool_outputs(
        &self,
        run_id: &Id,
        step_id: &Id,
        details: &StepDetails,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = transition_run_in(
            &mut *tx,
            run_id,
            RunStatus::ACCEPTS_TOOL_OUTPUTS,
            RunStatus::Queued,
            None,
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE run_steps SET step_details_json = ?1, status = ?2, completed_at = ?3 \
             WHERE id = ?4 AND status = ?5",
        )
        .bind(serde_json::to_string(details)?)
        .bind(RunStepStatus::Completed.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(step_id.as_ref())
        .bind(RunStepStatus::InProgress.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }
}

// --- Executor-generic helpers, shared by pool and transaction paths ---

async fn insert_thread_in<'e, E>(executor: E, thread: &Thread) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO threads (id, created_at, metadata_json) VALUES (?1, ?2, ?3)")
        .bind(thread.id.as_ref())
        .bind(thread.created_at.timestamp_millis())
        .bind(serde_json::to_string(&thread.metadata)?)
        .execute(executor)
        .await?;
    Ok(())
}

async fn insert_message_in<'e, E>(executor: E, message: &Message) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO messages (id, thread_id, created_at, role, content, file_ids_json,
                              assistant_id, run_id, metadata_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(message.id.as_ref())
    .bind(message.thread_id.as_ref())
    .bind(message.created_at.timestamp_millis())
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(serde_json::to_string(&message.file_ids)?)
    .bind(message.assistant_id.as_ref().map(|id| id.0.as_str()))
    .bind(message.run_id.as_ref().map(|id| id.0.as_str()))
    .bind(serde_json::to_string(&message.metadata)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_run_in<'e, E>(executor: E, run: &Run) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let last_error = run.last_error.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO runs (id, created_at, thread_id, assistant_id, status, started_at,
                          expires_at, cancelled_at, failed_at, completed_at, last_error_json,
                          model, instructions, tools_json, file_ids_json, metadata_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
    )
    .bind(run.id.as_ref())
    .bind(run.created_at.timestamp_millis())
    .bind(run.thread_id.as_ref())
    .bind(run.assistant_id.as_ref())
    .bind(run.status.as_str())
    .bind(run.started_at.map(|t| t.timestamp_millis()))
    .bind(run.expires_at.map(|t| t.timestamp_millis()))
    .bind(run.cancelled_at.map(|t| t.timestamp_millis()))
    .bind(run.failed_at.map(|t| t.timestamp_millis()))
    .bind(run.completed_at.map(|t| t.timestamp_millis()))
    .bind(last_error)
    .bind(&run.model)
    .bind(&run.instructions)
    .bind(serde_json::to_string(&run.tools)?)
    .bind(serde_json::to_string(&run.file_ids)?)
    .bind(serde_json::to_string(&run.metadata)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_step_in<'e, E>(executor: E, step: &RunStep) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO run_steps (id, created_at, run_id, thread_id, assistant_id, type, status,
                               step_details_json, completed_at, cancelled_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(step.id.as_ref())
    .bind(step.created_at.timestamp_millis())
    .bind(step.run_id.as_ref())
    .bind(step.thread_id.as_ref())
    .bind(step.assistant_id.as_ref())
    .bind(step.step_type.as_str())
    .bind(step.status.as_str())
    .bind(serde_json::to_string(&step.step_details)?)
    .bind(step.completed_at.map(|t| t.timestamp_millis()))
    .bind(step.cancelled_at.map(|t| t.timestamp_millis()))
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StorageError::Conflict(
            format!("run {} already has an unresolved tool call step", step.run_id),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Timestamp column stamped when a run enters `status`.
fn stamp_column(status: RunStatus) -> Option<&'static str> {
    match status {
        RunStatus::InProgress => Some("started_at"),
        RunStatus::Cancelling | RunStatus::Cancelled => Some("cancelled_at"),
        RunStatus::Completed => Some("completed_at"),
        RunStatus::Failed => Some("failed_at"),
        RunStatus::Queued | RunStatus::RequiresAction | RunStatus::Expired => None,
    }
}

async fn transition_run_in<'e, E>(
    executor: E,
    run_id: &Id,
    from: &[RunStatus],
    to: RunStatus,
    last_error: Option<&RunError>,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    if from.is_empty() {
        return Ok(false);
    }

    let mut query = String::from("UPDATE runs SET status = ?");
    if let Some(column) = stamp_column(to) {
        query.push_str(&format!(", {column} = COALESCE({column}, ?)"));
    }
    query.push_str(", last_error_json = COALESCE(?, last_error_json) WHERE id = ? AND status IN (");
    query.push_str(&vec!["?"; from.len()].join(", "));
    query.push(')');

    let mut q = sqlx::query(&query).bind(to.as_str());
    if stamp_column(to).is_some() {
        q = q.bind(Utc::now().timestamp_millis());
    }
    let last_error = last_error.map(serde_json::to_string).transpose()?;
    q = q.bind(last_error).bind(run_id.as_ref());
    for status in from {
        q = q.bind(status.as_str());
    }

    let result = q.execute(executor).await?;
    Ok(result.rows_affected() == 1)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct AssistantRow {
    id: String,
    created_at: i64,
    name: Option<String>,
    model: String,
    instructions: Option<String>,
    tools_json: String,
    file_ids_json: String,
    metadata_json: String,
}

impl AssistantRow {
    fn into_assistant(self) -> Result<Assistant> {
        Ok(Assistant {
            id: Id::from_string(self.id),
            created_at: from_millis(self.created_at),
            name: self.name,
            model: self.model,
            instructions: self.instructions,
            tools: serde_json::from_str(&self.tools_json)?,
            file_ids: serde_json::from_str(&self.file_ids_json)?,
            metadata: serde_json::from_str(&self.metadata_json)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ThreadRow {
    id: String,
    created_at: i64,
    metadata_json: String,
}

impl ThreadRow {
    fn into_thread(self) -> Result<Thread> {
        Ok(Thread {
            id: Id::from_string(self.id),
            created_at: from_millis(self.created_at),
            metadata: serde_json::from_str(&self.metadata_json)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    thread_id: String,
    created_at: i64,
    role: String,
    content: String,
    file_ids_json: String,
    assistant_id: Option<String>,
    run_id: Option<String>,
    metadata_json: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let role = MessageRole::parse(&self.role).ok_or_else(|| {
            StorageError::Corrupt(format!("message {} has unknown role {:?}", self.id, self.role))
        })?;
        Ok(Message {
            id: Id::from_string(self.id),
            thread_id: Id::from_string(self.thread_id),
            created_at: from_millis(self.created_at),
            role,
            content: self.content,
            file_ids: serde_json::from_str(&self.file_ids_json)?,
            assistant_id: self.assistant_id.map(Id::from_string),
            run_id: self.run_id.map(Id::from_string),
            metadata: serde_json::from_str(&self.metadata_json)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    created_at: i64,
    thread_id: String,
    assistant_id: String,
    status: String,
    started_at: Option<i64>,
    expires_at: Option<i64>,
    cancelled_at: Option<i64>,
    failed_at: Option<i64>,
    completed_at: Option<i64>,
    last_error_json: Option<String>,
    model: String,
    instructions: Option<String>,
    tools_json: String,
    file_ids_json: String,
    metadata_json: String,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Corrupt(format!("run {} has unknown status {:?}", self.id, self.status))
        })?;
        let last_error = self
            .last_error_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Run {
            id: Id::from_string(self.id),
            created_at: from_millis(self.created_at),
            thread_id: Id::from_string(self.thread_id),
            assistant_id: Id::from_string(self.assistant_id),
            status,
            started_at: self.started_at.map(from_millis),
            expires_at: self.expires_at.map(from_millis),
            cancelled_at: self.cancelled_at.map(from_millis),
            failed_at: self.failed_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            last_error,
            model: self.model,
            instructions: self.instructions,
            tools: serde_json::from_str(&self.tools_json)?,
            file_ids: serde_json::from_str(&self.file_ids_json)?,
            metadata: serde_json::from_str(&self.metadata_json)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    created_at: i64,
    run_id: String,
    thread_id: String,
    assistant_id: String,
    #[sqlx(rename = "type")]
    step_type: String,
    status: String,
    step_details_json: String,
    completed_at: Option<i64>,
    cancelled_at: Option<i64>,
}

impl StepRow {
    fn into_step(self) -> Result<RunStep> {
        let step_type = StepType::parse(&self.step_type).ok_or_else(|| {
            StorageError::Corrupt(format!("step {} has unknown type {:?}", self.id, self.step_type))
        })?;
        let status = RunStepStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Corrupt(format!("step {} has unknown status {:?}", self.id, self.status))
        })?;

        Ok(RunStep {
            id: Id::from_string(self.id),
            created_at: from_millis(self.created_at),
            run_id: Id::from_string(self.run_id),
            thread_id: Id::from_string(self.thread_id),
            assistant_id: Id::from_string(self.assistant_id),
            step_type,
            status,
            step_details: serde_json::from_str(&self.step_details_json)?,
            completed_at: self.completed_at.map(from_millis),
            cancelled_at: self.cancelled_at.map(from_millis),
        })
    }
}
