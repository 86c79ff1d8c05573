//! Worker-side half of the run lifecycle.
//!
//! The executor that actually runs models and tools links against this
//! module to claim work and report status. It owns the edges the
//! controller never writes: `queued -> in_progress`, `in_progress ->
//! requires_action` and the terminal outcomes.

use std::sync::Arc;

use assist_core::{
    prefix, Id, Run, RunError, RunStatus, RunStep, RunStepStatus, StepDetails, StepType, ToolCall,
};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::queue::{Job, JobState, QueueError, TaskQueue};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("run {run_id} is {status}, expected in_progress")]
    NotInProgress { run_id: String, status: RunStatus },
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// A run handed to the executor together with the job it came from.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub job: Job,
    pub run: Run,
}

/// How an execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(RunError),
    Expired,
    Cancelled,
}

impl RunOutcome {
    fn status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Failed(_) => RunStatus::Failed,
            Self::Expired => RunStatus::Expired,
            Self::Cancelled => RunStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    storage: Storage,
    queue: Arc<dyn TaskQueue>,
    job_name: String,
}

impl Worker {
    pub fn new(storage: Storage, queue: Arc<dyn TaskQueue>, job_name: impl Into<String>) -> Self {
        Self {
            storage,
            queue,
            job_name: job_name.into(),
        }
    }

    /// Claim the next job and move its run to `in_progress`.
    ///
    /// Jobs whose run is no longer `queued` are completed and skipped; a
    /// run found `cancelling` is settled to `cancelled` on the way.
    pub async fn claim_next(&self) -> Result<Option<ClaimedRun>> {
        while let Some(job) = self.queue.claim(&self.job_name).await? {
            let run_id = job.payload.run_id.clone();

            let run = match self.storage.get_run_by_id(&run_id).await {
                Ok(run) => run,
                Err(StorageError::RunNotFound(_)) => {
                    warn!(run_id = %run_id, "job references a missing run");
                    self.queue.complete(&job.id).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if self
                .storage
                .transition_run(&run.id, &[RunStatus::Queued], RunStatus::InProgress, None)
                .await?
            {
                let run = self.storage.get_run_by_id(&run_id).await?;
                info!(run_id = %run.id, thread_id = %run.thread_id, status = %run.status, "run claimed");
                return Ok(Some(ClaimedRun { job, run }));
            }

            let current = self.storage.get_run_by_id(&run_id).await?;
            if current.status == RunStatus::Cancelling {
                if self.storage.settle_cancelled(&run_id).await? {
                    info!(run_id = %run_id, status = %RunStatus::Cancelled, "cancelled run dropped at claim");
                }
            } else {
                debug!(run_id = %run_id, status = %current.status, "skipping job for run not queued");
            }
            self.queue.complete(&job.id).await?;
        }
        Ok(None)
    }

    /// Pick up a `queued` run that has no live job (poll resume policy).
    pub async fn poll_queued(&self) -> Result<Option<Run>> {
        for run in self.storage.list_runs_with_status(RunStatus::Queued).await? {
            if matches!(
                self.queue.state(run.id.as_ref()).await?,
                Some(JobState::Pending | JobState::Active)
            ) {
                continue;
            }
            if self
                .storage
                .transition_run(&run.id, &[RunStatus::Queued], RunStatus::InProgress, None)
                .await?
            {
                let run = self.storage.get_run_by_id(&run.id).await?;
                info!(run_id = %run.id, thread_id = %run.thread_id, status = %run.status, "run picked up by poll");
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    /// Pause a run on tool calls the client must execute.
    ///
    /// Releases the job, then opens the run's tool step and moves it to
    /// `requires_action` in one transaction. The job must be done before
    /// the run is visible as `requires_action`, otherwise a submission in
    /// between would find it active and the resumed run would never be
    /// re-dispatched.
    pub async fn require_action(&self, run_id: &Id, tool_calls: Vec<ToolCall>) -> Result<RunStep> {
        let run = self.storage.get_run_by_id(run_id).await?;
        let step = RunStep {
            id: Id::new(prefix::STEP),
            created_at: Utc::now(),
            run_id: run.id.clone(),
            thread_id: run.thread_id.clone(),
            assistant_id: run.assistant_id.clone(),
            step_type: StepType::ToolCalls,
            status: RunStepStatus::InProgress,
            step_details: StepDetails::tool_calls(tool_calls),
            completed_at: None,
            cancelled_at: None,
        };

        self.queue.complete(run_id.as_ref()).await?;

        if !self.storage.open_tool_step(&step).await? {
            let current = self.storage.get_run_by_id(run_id).await?;
            return Err(WorkerError::NotInProgress {
                run_id: run_id.to_string(),
                status: current.status,
            });
        }
        info!(run_id = %run.id, step_id = %step.id, status = %RunStatus::RequiresAction, "run requires action");
        Ok(step)
    }

    /// Record the end of an execution attempt.
    ///
    /// Applies to `in_progress` and `cancelling` runs, except that only an
    /// `in_progress` run can expire. Returns false if the run had already
    /// left those, e.g. it was cancelled before the worker got here. The
    /// job is completed either way.
    pub async fn finish(&self, run_id: &Id, outcome: RunOutcome) -> Result<bool> {
        let to = outcome.status();
        let last_error = match &outcome {
            RunOutcome::Failed(err) => Some(err),
            _ => None,
        };

        let moved = if to == RunStatus::Cancelled {
            self.storage.settle_cancelled(run_id).await?
                || self
                    .storage
                    .transition_run(run_id, &[RunStatus::InProgress], to, None)
                    .await?
        } else {
            let from: &[RunStatus] = if to == RunStatus::Expired {
                &[RunStatus::InProgress]
            } else {
                &[RunStatus::InProgress, RunStatus::Cancelling]
            };
            self.storage
                .transition_run(run_id, from, to, last_error)
                .await?
        };

        if moved {
            info!(run_id = %run_id, status = %to, "run finished");
        } else {
            debug!(run_id = %run_id, status = %to, "run already left execution");
        }
        self.queue.complete(run_id.as_ref()).await?;
        Ok(moved)
    }

    /// Settle `cancelling` runs that no worker holds.
    ///
    /// A run cancelled while waiting on tool outputs has no job in flight,
    /// so nothing else would move it out of `cancelling`.
    pub async fn settle_cancelling(&self) -> Result<usize> {
        let mut settled = 0;
        for run in self.storage.list_runs_with_status(RunStatus::Cancelling).await? {
            let free = match self.queue.state(run.id.as_ref()).await? {
                Some(JobState::Active) => false,
                Some(JobState::Pending) => self.queue.cancel_if_pending(run.id.as_ref()).await?,
                Some(JobState::Done) | None => true,
            };
            if free && self.storage.settle_cancelled(&run.id).await? {
                info!(run_id = %run.id, status = %RunStatus::Cancelled, "cancelling run settled");
                settled += 1;
            }
        }
        Ok(settled)
    }
}
