//! Run lifecycle controller.
//!
//! Owns the controller-side edges of the run state machine: creation,
//! metadata updates, tool-output submission and cancellation. Execution
//! state (`in_progress`, `completed`, `failed`, `expired`) is written by
//! the worker; see [`crate::worker`].
//!
//! The controller holds no mutable state of its own. Every status write
//! is a conditional update in storage so concurrent requests and the
//! worker can interleave freely.

use std::collections::HashSet;
use std::sync::Arc;

use assist_core::{
    pagination::PaginationError, prefix, Assistant, Id, ListParams, Message, MessageRole,
    Metadata, Page, RequiredAction, ResumePolicy, Run, RunStatus, RunStep, StepDetails, Thread,
    ToolCallKind, ToolOutput,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::queue::{EnqueueOutcome, JobState, NewJob, QueueError, TaskQueue};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("No {kind} found with id '{id}'")]
    NotFound { kind: &'static str, id: String },
    #[error("Run status is \"{status}\", cannot {action}")]
    InvalidState {
        status: RunStatus,
        action: &'static str,
    },
    #[error("{0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound(id) => Self::NotFound { kind: "run", id },
            StorageError::StepNotFound(id) => Self::NotFound {
                kind: "run step",
                id,
            },
            StorageError::AssistantNotFound(id) => Self::NotFound {
                kind: "assistant",
                id,
            },
            StorageError::ThreadNotFound(id) => Self::NotFound { kind: "thread", id },
            other => Self::Storage(other),
        }
    }
}

impl From<PaginationError> for ControllerError {
    fn from(err: PaginationError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

// --- Request/Response types ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAssistantParams {
    pub model: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateThreadParams {
    #[serde(default)]
    pub messages: Vec<NewMessage>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Body of a create-run request. Unset fields fall back to the assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunParams {
    pub assistant_id: Id,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub file_ids: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateThreadAndRunParams {
    #[serde(flatten)]
    pub run: CreateRunParams,
    #[serde(default)]
    pub thread: CreateThreadParams,
}

/// Body of a modify-run request. Only `metadata` may change; anything
/// else ends up in `rest` and is rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModifyRunParams {
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(flatten)]
    pub rest: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputsParams {
    pub tool_outputs: Vec<ToolOutput>,
}

/// Response of a successful tool-output submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub run_id: Id,
    pub thread_id: Id,
}

/// Wire representation of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunObject {
    pub object: &'static str,
    #[serde(flatten)]
    pub run: Run,
    pub required_action: Option<RequiredAction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepObject {
    pub object: &'static str,
    #[serde(flatten)]
    pub step: RunStep,
}

impl From<RunStep> for StepObject {
    fn from(step: RunStep) -> Self {
        Self {
            object: "thread.run.step",
            step,
        }
    }
}

// --- Controller ---

#[derive(Debug, Clone)]
pub struct RunController {
    storage: Storage,
    queue: Arc<dyn TaskQueue>,
    job_name: String,
    resume_policy: ResumePolicy,
}

impl RunController {
    pub fn new(
        storage: Storage,
        queue: Arc<dyn TaskQueue>,
        job_name: impl Into<String>,
        resume_policy: ResumePolicy,
    ) -> Self {
        Self {
            storage,
            queue,
            job_name: job_name.into(),
            resume_policy,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn resume_policy(&self) -> ResumePolicy {
        self.resume_policy
    }

    // --- Collaborator records ---

    pub async fn create_assistant(&self, params: CreateAssistantParams) -> Result<Assistant> {
        if params.model.trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "`model` must not be empty".to_string(),
            ));
        }
        let assistant = Assistant {
            id: Id::new(prefix::ASSISTANT),
            created_at: Utc::now(),
            name: params.name,
            model: params.model,
            instructions: params.instructions,
            tools: params.tools,
            file_ids: params.file_ids,
            metadata: params.metadata,
        };
        self.storage.insert_assistant(&assistant).await?;
        info!(assistant_id = %assistant.id, "assistant created");
        Ok(assistant)
    }

    pub async fn get_assistant(&self, id: &Id) -> Result<Assistant> {
        Ok(self.storage.get_assistant(id).await?)
    }

    pub async fn create_thread(&self, params: CreateThreadParams) -> Result<Thread> {
        let (thread, messages) = build_thread(params);
        self.storage.insert_thread(&thread, &messages).await?;
        info!(thread_id = %thread.id, messages = messages.len(), "thread created");
        Ok(thread)
    }

    pub async fn get_thread(&self, id: &Id) -> Result<Thread> {
        Ok(self.storage.get_thread(id).await?)
    }

    // --- Runs ---

    /// Create a `queued` run on an existing thread and hand it to the queue.
    pub async fn create_run(&self, thread_id: &Id, params: CreateRunParams) -> Result<RunObject> {
        let thread = self.storage.get_thread(thread_id).await?;
        let assistant = self.storage.get_assistant(&params.assistant_id).await?;

        let run = build_run(&thread.id, &assistant, params);
        self.storage.insert_run(&run).await?;
        info!(run_id = %run.id, thread_id = %run.thread_id, status = %run.status, "run created");

        self.enqueue(&run.id).await?;
        Ok(run_object(run, None))
    }

    /// Create a thread with its messages and a run against it atomically.
    pub async fn create_thread_and_run(
        &self,
        params: CreateThreadAndRunParams,
    ) -> Result<RunObject> {
        let assistant = self.storage.get_assistant(&params.run.assistant_id).await?;

        let (thread, messages) = build_thread(params.thread);
        let run = build_run(&thread.id, &assistant, params.run);
        self.storage
            .insert_thread_and_run(&thread, &messages, &run)
            .await?;
        info!(run_id = %run.id, thread_id = %run.thread_id, status = %run.status, "thread and run created");

        self.enqueue(&run.id).await?;
        Ok(run_object(run, None))
    }

    pub async fn get_run(&self, thread_id: &Id, run_id: &Id) -> Result<RunObject> {
        let run = self.storage.get_run(thread_id, run_id).await?;
        self.project(run).await
    }

    pub async fn list_runs(&self, thread_id: &Id, params: &ListParams) -> Result<Page<RunObject>> {
        let plan = params.plan()?;
        self.storage.get_thread(thread_id).await?;

        let rows = self.storage.list_runs(thread_id, &plan).await?;
        let page = Page::from_rows(rows, &plan, |run| run.id.as_ref());

        let mut data = Vec::with_capacity(page.data.len());
        for run in page.data {
            data.push(self.project(run).await?);
        }
        Ok(Page {
            object: page.object,
            data,
            first_id: page.first_id,
            last_id: page.last_id,
            has_more: page.has_more,
        })
    }

    /// Update a run's metadata. Status and every other field are read-only.
    pub async fn modify_run(
        &self,
        thread_id: &Id,
        run_id: &Id,
        params: ModifyRunParams,
    ) -> Result<RunObject> {
        if params.rest.contains_key("status") {
            return Err(ControllerError::InvalidInput(
                "`status` cannot be modified; use the cancel or submit_tool_outputs endpoints"
                    .to_string(),
            ));
        }
        if let Some(field) = params.rest.keys().next() {
            return Err(ControllerError::InvalidInput(format!(
                "`{field}` cannot be modified; only `metadata` is supported"
            )));
        }

        let run = match params.metadata {
            Some(metadata) => {
                let run = self
                    .storage
                    .update_run_metadata(thread_id, run_id, &metadata)
                    .await?;
                info!(run_id = %run.id, thread_id = %run.thread_id, "run metadata updated");
                run
            }
            None => self.storage.get_run(thread_id, run_id).await?,
        };
        self.project(run).await
    }

    /// Attach tool outputs to the open tool step and resume the run.
    ///
    /// All outputs are validated in memory first. The run and step are then
    /// committed together, so a rejected submission leaves no trace.
    pub async fn submit_tool_outputs(
        &self,
        thread_id: &Id,
        run_id: &Id,
        outputs: &[ToolOutput],
    ) -> Result<SubmitReceipt> {
        let run = self.storage.get_run(thread_id, run_id).await?;
        let step = self
            .storage
            .latest_tool_step(&run.id)
            .await?
            .ok_or_else(|| ControllerError::NotFound {
                kind: "tool call step for run",
                id: run.id.to_string(),
            })?;

        if !RunStatus::ACCEPTS_TOOL_OUTPUTS.contains(&run.status) {
            return Err(ControllerError::InvalidState {
                status: run.status,
                action: "submit tool outputs",
            });
        }
        if step.status != assist_core::RunStepStatus::InProgress {
            error!(
                run_id = %run.id,
                step_id = %step.id,
                step_status = step.status.as_str(),
                "run awaits tool outputs but its latest tool step is resolved"
            );
            return Err(ControllerError::Internal(format!(
                "tool call step {} is {} while run {} requires action",
                step.id,
                step.status.as_str(),
                run.id
            )));
        }

        let details = apply_tool_outputs(&step.step_details, outputs).inspect_err(|err| {
            if let ControllerError::Internal(msg) = err {
                error!(run_id = %run.id, step_id = %step.id, "{msg}");
            }
        })?;

        if !self
            .storage
            .commit_tool_outputs(&run.id, &step.id, &details)
            .await?
        {
            let current = self.storage.get_run(thread_id, run_id).await?;
            warn!(run_id = %run.id, status = %current.status, "tool output commit lost a race");
            return Err(ControllerError::InvalidState {
                status: current.status,
                action: "submit tool outputs",
            });
        }
        info!(
            run_id = %run.id,
            thread_id = %run.thread_id,
            step_id = %step.id,
            status = %RunStatus::Queued,
            "tool outputs submitted"
        );

        match self.resume_policy {
            ResumePolicy::Enqueue => self.enqueue(&run.id).await?,
            ResumePolicy::Poll => debug!(run_id = %run.id, "resume left to worker polling"),
        }

        Ok(SubmitReceipt {
            run_id: run.id,
            thread_id: run.thread_id,
        })
    }

    /// Request cancellation of a run.
    ///
    /// The run moves to `cancelling`. If its job has not been claimed yet the
    /// job is withdrawn and the run settles to `cancelled` immediately;
    /// otherwise the worker settles it.
    pub async fn cancel_run(&self, thread_id: &Id, run_id: &Id) -> Result<RunObject> {
        let run = self.storage.get_run(thread_id, run_id).await?;

        if run.status == RunStatus::Cancelled {
            debug!(run_id = %run.id, "run already cancelled");
            return self.project(run).await;
        }
        if !RunStatus::CANCELLABLE.contains(&run.status) {
            return Err(ControllerError::InvalidState {
                status: run.status,
                action: "cancel run",
            });
        }

        if !self
            .storage
            .transition_run(&run.id, RunStatus::CANCELLABLE, RunStatus::Cancelling, None)
            .await?
        {
            // The worker finished the run in between.
            let current = self.storage.get_run(thread_id, run_id).await?;
            if current.status == RunStatus::Cancelled {
                return self.project(current).await;
            }
            return Err(ControllerError::InvalidState {
                status: current.status,
                action: "cancel run",
            });
        }
        info!(run_id = %run.id, thread_id = %run.thread_id, status = %RunStatus::Cancelling, "run cancelling");

        if self.queue.cancel_if_pending(run.id.as_ref()).await? {
            if self.storage.settle_cancelled(&run.id).await? {
                info!(run_id = %run.id, thread_id = %run.thread_id, status = %RunStatus::Cancelled, "run cancelled before claim");
            }
        } else {
            debug!(run_id = %run.id, "job not pending, worker will settle cancellation");
        }

        let run = self.storage.get_run(thread_id, run_id).await?;
        self.project(run).await
    }

    // --- Steps ---

    pub async fn list_steps(
        &self,
        thread_id: &Id,
        run_id: &Id,
        params: &ListParams,
    ) -> Result<Page<StepObject>> {
        let plan = params.plan()?;
        let run = self.storage.get_run(thread_id, run_id).await?;
        let rows = self.storage.list_steps(&run.id, &plan).await?;
        Ok(Page::from_rows(rows, &plan, |step| step.id.as_ref()).map(StepObject::from))
    }

    pub async fn get_step(&self, thread_id: &Id, run_id: &Id, step_id: &Id) -> Result<StepObject> {
        let run = self.storage.get_run(thread_id, run_id).await?;
        Ok(self.storage.get_step(&run.id, step_id).await?.into())
    }

    // --- Recovery ---

    /// Give every `queued` run without a live job a fresh one.
    ///
    /// Covers a crash between a store commit and the following enqueue.
    /// Does nothing under the poll policy, where the worker finds queued
    /// runs by itself.
    pub async fn recover_queued_runs(&self) -> Result<usize> {
        if self.resume_policy == ResumePolicy::Poll {
            return Ok(0);
        }

        let mut recovered = 0;
        for run in self.storage.list_runs_with_status(RunStatus::Queued).await? {
            match self.queue.state(run.id.as_ref()).await? {
                Some(JobState::Pending | JobState::Active) => {}
                Some(JobState::Done) | None => {
                    self.enqueue(&run.id).await?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "re-enqueued queued runs without a job");
        }
        Ok(recovered)
    }

    // --- Internals ---

    async fn enqueue(&self, run_id: &Id) -> Result<()> {
        let outcome = self
            .queue
            .enqueue(NewJob::for_run(&self.job_name, run_id))
            .await
            .inspect_err(|err| error!(run_id = %run_id, "failed to enqueue run: {err}"))?;
        match outcome {
            EnqueueOutcome::Enqueued => debug!(run_id = %run_id, job = %self.job_name, "job enqueued"),
            EnqueueOutcome::AlreadyPending => debug!(run_id = %run_id, "job already pending"),
            EnqueueOutcome::AlreadyActive => {
                warn!(run_id = %run_id, "job still held by a worker");
            }
        }
        Ok(())
    }

    /// Attach the `required_action` projection to a run.
    async fn project(&self, run: Run) -> Result<RunObject> {
        if run.status != RunStatus::RequiresAction {
            return Ok(run_object(run, None));
        }
        let required_action = self
            .storage
            .latest_tool_step(&run.id)
            .await?
            .as_ref()
            .and_then(RequiredAction::from_step);
        Ok(run_object(run, required_action))
    }
}

fn run_object(run: Run, required_action: Option<RequiredAction>) -> RunObject {
    RunObject {
        object: "thread.run",
        run,
        required_action,
    }
}

fn build_thread(params: CreateThreadParams) -> (Thread, Vec<Message>) {
    let thread = Thread {
        id: Id::new(prefix::THREAD),
        created_at: Utc::now(),
        metadata: params.metadata,
    };
    let messages = params
        .messages
        .into_iter()
        .map(|message| Message {
            id: Id::new(prefix::MESSAGE),
            thread_id: thread.id.clone(),
            created_at: thread.created_at,
            role: message.role,
            content: message.content,
            file_ids: message.file_ids,
            assistant_id: None,
            run_id: None,
            metadata: message.metadata,
        })
        .collect();
    (thread, messages)
}

fn build_run(thread_id: &Id, assistant: &Assistant, params: CreateRunParams) -> Run {
    Run {
        id: Id::new(prefix::RUN),
        created_at: Utc::now(),
        thread_id: thread_id.clone(),
        assistant_id: assistant.id.clone(),
        status: RunStatus::Queued,
        started_at: None,
        expires_at: None,
        cancelled_at: None,
        failed_at: None,
        completed_at: None,
        last_error: None,
        model: params.model.unwrap_or_else(|| assistant.model.clone()),
        instructions: params.instructions.or_else(|| assistant.instructions.clone()),
        tools: params.tools.unwrap_or_else(|| assistant.tools.clone()),
        file_ids: params.file_ids.unwrap_or_else(|| assistant.file_ids.clone()),
        metadata: params.metadata,
    }
}

/// Apply submitted outputs to a copy of the step details.
///
/// Every pending function call must receive exactly one output.
fn apply_tool_outputs(details: &StepDetails, outputs: &[ToolOutput]) -> Result<StepDetails> {
    let mut details = details.clone();
    let tool_calls = details
        .tool_calls
        .as_mut()
        .ok_or_else(|| ControllerError::Internal("tool call step has no tool calls".to_string()))?;

    let mut seen = HashSet::new();
    for output in outputs {
        let id = output.tool_call_id.as_str();
        if !seen.insert(id) {
            return Err(ControllerError::InvalidInput(format!(
                "Duplicate output for tool call '{id}'"
            )));
        }

        let call = tool_calls
            .iter_mut()
            .find(|call| call.id == id)
            .ok_or_else(|| ControllerError::InvalidInput(format!("Invalid tool call '{id}'")))?;

        match call.kind {
            ToolCallKind::Function => {
                let function = call.function.as_mut().ok_or_else(|| {
                    ControllerError::Internal(format!("function tool call '{id}' has no payload"))
                })?;
                if function.output.is_some() {
                    return Err(ControllerError::InvalidInput(format!(
                        "Tool call '{id}' already has an output"
                    )));
                }
                function.output = Some(output.output.clone());
            }
            ToolCallKind::CodeInterpreter | ToolCallKind::Retrieval => {
                return Err(ControllerError::InvalidInput(format!(
                    "Invalid third-party {} tool calls are not supported at this time",
                    call.kind.as_str()
                )));
            }
            ToolCallKind::Unknown => {
                return Err(ControllerError::Internal(format!(
                    "Invalid tool call type for tool call '{id}'"
                )));
            }
        }
    }

    let missing: Vec<&str> = tool_calls
        .iter()
        .filter(|call| call.is_pending_function())
        .map(|call| call.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(ControllerError::InvalidInput(format!(
            "Missing tool outputs for tool calls: {}",
            missing.join(", ")
        )));
    }

    Ok(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, SqliteQueue};
    use crate::storage::tests::{create_test_storage, test_run, test_tool_step, TestStorage};
    use crate::worker::Worker;
    use assist_core::{RunStepStatus, ToolCall};

    const JOB: &str = "thread-run";

    struct TestController {
        controller: RunController,
        queue: Arc<dyn TaskQueue>,
        worker: Worker,
        _ts: TestStorage,
    }

    async fn create_test_controller(policy: ResumePolicy) -> TestController {
        let ts = create_test_storage().await;
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteQueue::new(ts.storage.pool().clone()));
        let controller = RunController::new(ts.storage.clone(), Arc::clone(&queue), JOB, policy);
        let worker = Worker::new(ts.storage.clone(), Arc::clone(&queue), JOB);
        TestController {
            controller,
            queue,
            worker,
            _ts: ts,
        }
    }

    async fn seed(tc: &TestController) -> (Assistant, Thread) {
        let assistant = tc
            .controller
            .create_assistant(CreateAssistantParams {
                model: "gpt-4-1106-preview".to_string(),
                name: Some("math".to_string()),
                instructions: Some("Answer with numbers.".to_string()),
                tools: vec![serde_json::json!({"type": "function", "function": {"name": "multiply"}})],
                file_ids: Vec::new(),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        let thread = tc
            .controller
            .create_thread(CreateThreadParams::default())
            .await
            .unwrap();
        (assistant, thread)
    }

    fn run_params(assistant: &Assistant) -> CreateRunParams {
        CreateRunParams {
            assistant_id: assistant.id.clone(),
            model: None,
            instructions: None,
            tools: None,
            file_ids: None,
            metadata: Metadata::new(),
        }
    }

    /// Drive a run to `requires_action` with the given tool calls.
    async fn run_waiting_on(tc: &TestController, tool_calls: Vec<ToolCall>) -> (Run, RunStep) {
        let (assistant, thread) = seed(tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();
        let claimed = tc.worker.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.run.id, created.run.id);
        let step = tc
            .worker
            .require_action(&created.run.id, tool_calls)
            .await
            .unwrap();
        let run = tc
            .controller
            .storage()
            .get_run(&thread.id, &created.run.id)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction);
        (run, step)
    }

    fn output(id: &str, value: &str) -> ToolOutput {
        ToolOutput {
            tool_call_id: id.to_string(),
            output: value.to_string(),
        }
    }

    fn code_interpreter_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            kind: ToolCallKind::CodeInterpreter,
            function: None,
            code_interpreter: Some(serde_json::json!({"input": "print(1)", "outputs": []})),
            retrieval: None,
        }
    }

    #[tokio::test]
    async fn create_run_defaults_from_assistant_and_enqueues() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;

        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();

        assert_eq!(created.object, "thread.run");
        assert_eq!(created.run.status, RunStatus::Queued);
        assert_eq!(created.run.model, assistant.model);
        assert_eq!(created.run.instructions, assistant.instructions);
        assert_eq!(created.run.tools, assistant.tools);
        assert!(created.required_action.is_none());
        assert_eq!(
            tc.queue.state(created.run.id.as_ref()).await.unwrap(),
            Some(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn create_run_overrides_assistant_defaults() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let mut params = run_params(&assistant);
        params.model = Some("gpt-3.5-turbo".to_string());
        params.instructions = Some("Show your work.".to_string());
        params.tools = Some(Vec::new());

        let created = tc.controller.create_run(&thread.id, params).await.unwrap();
        assert_eq!(created.run.model, "gpt-3.5-turbo");
        assert_eq!(created.run.instructions.as_deref(), Some("Show your work."));
        assert!(created.run.tools.is_empty());
    }

    #[tokio::test]
    async fn create_run_with_missing_assistant_persists_nothing() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (_, thread) = seed(&tc).await;
        let params = CreateRunParams {
            assistant_id: Id::new(prefix::ASSISTANT),
            model: None,
            instructions: None,
            tools: None,
            file_ids: None,
            metadata: Metadata::new(),
        };

        let err = tc.controller.create_run(&thread.id, params).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { kind: "assistant", .. }));

        let page = tc
            .controller
            .list_runs(&thread.id, &ListParams::default())
            .await
            .unwrap();
        assert!(page.data.is_empty());
        assert!(tc.queue.claim(JOB).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_run_with_missing_thread_is_not_found() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, _) = seed(&tc).await;

        let err = tc
            .controller
            .create_run(&Id::new(prefix::THREAD), run_params(&assistant))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { kind: "thread", .. }));
    }

    #[tokio::test]
    async fn create_thread_and_run_writes_everything() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, _) = seed(&tc).await;

        let created = tc
            .controller
            .create_thread_and_run(CreateThreadAndRunParams {
                run: run_params(&assistant),
                thread: CreateThreadParams {
                    messages: vec![NewMessage {
                        role: MessageRole::User,
                        content: "What is 6 * 7?".to_string(),
                        file_ids: Vec::new(),
                        metadata: Metadata::new(),
                    }],
                    metadata: Metadata::new(),
                },
            })
            .await
            .unwrap();

        let thread_id = &created.run.thread_id;
        tc.controller.get_thread(thread_id).await.unwrap();
        let messages = tc.controller.storage().list_messages(thread_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            tc.queue.state(created.run.id.as_ref()).await.unwrap(),
            Some(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn create_thread_and_run_with_missing_assistant_creates_no_thread() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let params = CreateThreadAndRunParams {
            run: CreateRunParams {
                assistant_id: Id::new(prefix::ASSISTANT),
                model: None,
                instructions: None,
                tools: None,
                file_ids: None,
                metadata: Metadata::new(),
            },
            thread: CreateThreadParams::default(),
        };

        let err = tc.controller.create_thread_and_run(params).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { .. }));
        assert!(tc
            .controller
            .storage()
            .list_runs_with_status(RunStatus::Queued)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn submit_rejected_unless_requires_action() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();
        tc.worker.claim_next().await.unwrap().unwrap();

        // An in-progress run with a resolved step from an earlier round.
        let mut call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        call.function.as_mut().unwrap().output = Some("42".to_string());
        let mut step = test_tool_step(&created.run, vec![call]);
        step.status = RunStepStatus::Completed;
        tc.controller.storage().insert_step(&step).await.unwrap();

        let err = tc
            .controller
            .submit_tool_outputs(&thread.id, &created.run.id, &[output("call_x", "1")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidState {
                status: RunStatus::InProgress,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "Run status is \"in_progress\", cannot submit tool outputs"
        );

        let run = tc.controller.get_run(&thread.id, &created.run.id).await.unwrap();
        assert_eq!(run.run.status, RunStatus::InProgress);
        let stored = tc
            .controller
            .storage()
            .get_step(&created.run.id, &step.id)
            .await
            .unwrap();
        assert_eq!(stored.step_details, step.step_details);
    }

    #[tokio::test]
    async fn submit_rejected_for_every_status_but_requires_action() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let storage = tc.controller.storage();

        for status in [
            RunStatus::Queued,
            RunStatus::Cancelling,
            RunStatus::Cancelled,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Expired,
        ] {
            let run = test_run(&thread, &assistant, status);
            storage.insert_run(&run).await.unwrap();
            let call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
            let step = test_tool_step(&run, vec![call.clone()]);
            storage.insert_step(&step).await.unwrap();

            let err = tc
                .controller
                .submit_tool_outputs(&thread.id, &run.id, &[output(&call.id, "42")])
                .await
                .unwrap_err();
            match &err {
                ControllerError::InvalidState { status: found, .. } => {
                    assert_eq!(*found, status, "{status}")
                }
                other => panic!("{status}: unexpected error {other:?}"),
            }
            assert_eq!(
                err.to_string(),
                format!("Run status is \"{status}\", cannot submit tool outputs")
            );

            let current = storage.get_run_by_id(&run.id).await.unwrap();
            assert_eq!(current.status, status);
            let stored = storage.get_step(&run.id, &step.id).await.unwrap();
            assert_eq!(stored.status, RunStepStatus::InProgress, "{status}");
            assert_eq!(stored.step_details, step.step_details, "{status}");
            assert_eq!(tc.queue.state(run.id.as_ref()).await.unwrap(), None, "{status}");
        }
    }

    #[tokio::test]
    async fn submit_without_tool_step_is_not_found() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();

        let err = tc
            .controller
            .submit_tool_outputs(&thread.id, &created.run.id, &[output("call_x", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn submit_for_unknown_run_is_not_found() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (_, thread) = seed(&tc).await;

        let err = tc
            .controller
            .submit_tool_outputs(&thread.id, &Id::new(prefix::RUN), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { kind: "run", .. }));
    }

    #[tokio::test]
    async fn submit_with_unknown_call_writes_nothing() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let first = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        let second = ToolCall::function("lookup", r#"{"q":"answer"}"#);
        let (run, step) = run_waiting_on(&tc, vec![first.clone(), second]).await;

        let err = tc
            .controller
            .submit_tool_outputs(
                &run.thread_id,
                &run.id,
                &[output(&first.id, "42"), output("call_missing", "x")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));

        let stored = tc
            .controller
            .storage()
            .get_step(&run.id, &step.id)
            .await
            .unwrap();
        assert_eq!(stored.status, RunStepStatus::InProgress);
        assert_eq!(stored.step_details, step.step_details);
        let current = tc.controller.get_run(&run.thread_id, &run.id).await.unwrap();
        assert_eq!(current.run.status, RunStatus::RequiresAction);
    }

    #[tokio::test]
    async fn submit_resumes_run_and_records_outputs() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let mut call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        call.id = "tc1".to_string();
        let (run, step) = run_waiting_on(&tc, vec![call]).await;

        let waiting = tc.controller.get_run(&run.thread_id, &run.id).await.unwrap();
        let action = waiting.required_action.unwrap();
        assert_eq!(action.kind, "submit_tool_outputs");
        assert_eq!(action.submit_tool_outputs.tool_calls[0].id, "tc1");

        let receipt = tc
            .controller
            .submit_tool_outputs(&run.thread_id, &run.id, &[output("tc1", "42")])
            .await
            .unwrap();
        assert_eq!(
            receipt,
            SubmitReceipt {
                run_id: run.id.clone(),
                thread_id: run.thread_id.clone(),
            }
        );

        let resumed = tc.controller.get_run(&run.thread_id, &run.id).await.unwrap();
        assert_eq!(resumed.run.status, RunStatus::Queued);
        assert!(resumed.required_action.is_none());

        let stored = tc
            .controller
            .storage()
            .get_step(&run.id, &step.id)
            .await
            .unwrap();
        assert_eq!(stored.status, RunStepStatus::Completed);
        let calls = stored.step_details.tool_calls.unwrap();
        assert_eq!(
            calls[0].function.as_ref().unwrap().output.as_deref(),
            Some("42")
        );

        // Enqueue policy revives the finished job.
        assert_eq!(
            tc.queue.state(run.id.as_ref()).await.unwrap(),
            Some(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn resumed_run_is_claimed_again() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        let (run, _) = run_waiting_on(&tc, vec![call.clone()]).await;

        tc.controller
            .submit_tool_outputs(&run.thread_id, &run.id, &[output(&call.id, "42")])
            .await
            .unwrap();

        let claimed = tc.worker.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.run.id, run.id);
        assert_eq!(claimed.run.status, RunStatus::InProgress);
        assert_eq!(claimed.job.state, JobState::Active);
    }

    #[tokio::test]
    async fn submit_under_poll_policy_does_not_enqueue() {
        let tc = create_test_controller(ResumePolicy::Poll).await;
        let call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        let (run, _) = run_waiting_on(&tc, vec![call.clone()]).await;

        tc.controller
            .submit_tool_outputs(&run.thread_id, &run.id, &[output(&call.id, "42")])
            .await
            .unwrap();

        assert_eq!(
            tc.queue.state(run.id.as_ref()).await.unwrap(),
            Some(JobState::Done)
        );
        let polled = tc.worker.poll_queued().await.unwrap().unwrap();
        assert_eq!(polled.id, run.id);
        assert_eq!(polled.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn second_submission_is_invalid_state() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        let (run, _) = run_waiting_on(&tc, vec![call.clone()]).await;

        tc.controller
            .submit_tool_outputs(&run.thread_id, &run.id, &[output(&call.id, "42")])
            .await
            .unwrap();
        let err = tc
            .controller
            .submit_tool_outputs(&run.thread_id, &run.id, &[output(&call.id, "43")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidState {
                status: RunStatus::Queued,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancel_before_claim_settles_and_is_idempotent() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();

        let cancelled = tc
            .controller
            .cancel_run(&thread.id, &created.run.id)
            .await
            .unwrap();
        assert_eq!(cancelled.run.status, RunStatus::Cancelled);
        assert!(cancelled.run.cancelled_at.is_some());
        assert_eq!(tc.queue.state(created.run.id.as_ref()).await.unwrap(), None);

        let again = tc
            .controller
            .cancel_run(&thread.id, &created.run.id)
            .await
            .unwrap();
        assert_eq!(again.run.status, RunStatus::Cancelled);
        assert_eq!(again.run.cancelled_at, cancelled.run.cancelled_at);
    }

    #[tokio::test]
    async fn cancel_after_claim_stays_cancelling() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();
        tc.worker.claim_next().await.unwrap().unwrap();

        let cancelling = tc
            .controller
            .cancel_run(&thread.id, &created.run.id)
            .await
            .unwrap();
        assert_eq!(cancelling.run.status, RunStatus::Cancelling);
        assert_eq!(
            tc.queue.state(created.run.id.as_ref()).await.unwrap(),
            Some(JobState::Active)
        );
    }

    #[tokio::test]
    async fn cancel_of_finished_run_is_rejected() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();
        tc.worker.claim_next().await.unwrap().unwrap();
        tc.worker
            .finish(&created.run.id, crate::worker::RunOutcome::Completed)
            .await
            .unwrap();

        let err = tc
            .controller
            .cancel_run(&thread.id, &created.run.id)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Run status is \"completed\", cannot cancel run"
        );
    }

    #[tokio::test]
    async fn cancel_while_waiting_on_tools_is_settled_by_worker_sweep() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let call = ToolCall::function("multiply", r#"{"a":6,"b":7}"#);
        let (run, step) = run_waiting_on(&tc, vec![call]).await;

        let cancelling = tc.controller.cancel_run(&run.thread_id, &run.id).await.unwrap();
        assert_eq!(cancelling.run.status, RunStatus::Cancelling);

        assert_eq!(tc.worker.settle_cancelling().await.unwrap(), 1);
        let settled = tc.controller.get_run(&run.thread_id, &run.id).await.unwrap();
        assert_eq!(settled.run.status, RunStatus::Cancelled);
        let stored = tc
            .controller
            .storage()
            .get_step(&run.id, &step.id)
            .await
            .unwrap();
        assert_eq!(stored.status, RunStepStatus::Cancelled);
    }

    #[tokio::test]
    async fn modify_run_updates_metadata_only() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();

        let params: ModifyRunParams =
            serde_json::from_value(serde_json::json!({"metadata": {"user": "u-1"}})).unwrap();
        let modified = tc
            .controller
            .modify_run(&thread.id, &created.run.id, params)
            .await
            .unwrap();
        assert_eq!(modified.run.metadata["user"], "u-1");
        assert_eq!(modified.run.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn modify_run_rejects_status_and_other_fields() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();

        let params: ModifyRunParams = serde_json::from_value(
            serde_json::json!({"status": "completed", "metadata": {"k": "v"}}),
        )
        .unwrap();
        let err = tc
            .controller
            .modify_run(&thread.id, &created.run.id, params)
            .await
            .unwrap_err();
        assert!(matches!(&err, ControllerError::InvalidInput(msg) if msg.contains("`status`")));

        let params: ModifyRunParams =
            serde_json::from_value(serde_json::json!({"assistant_id": "asst_other"})).unwrap();
        let err = tc
            .controller
            .modify_run(&thread.id, &created.run.id, params)
            .await
            .unwrap_err();
        assert!(matches!(&err, ControllerError::InvalidInput(msg) if msg.contains("`assistant_id`")));

        let run = tc.controller.get_run(&thread.id, &created.run.id).await.unwrap();
        assert_eq!(run.run.status, RunStatus::Queued);
        assert!(run.run.metadata.is_empty());
    }

    #[tokio::test]
    async fn list_runs_rejects_bad_limit() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (_, thread) = seed(&tc).await;
        let params = ListParams {
            limit: Some(500),
            ..Default::default()
        };
        let err = tc.controller.list_runs(&thread.id, &params).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn recover_enqueues_orphaned_queued_runs() {
        let tc = create_test_controller(ResumePolicy::Enqueue).await;
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();
        // Simulate a crash between commit and enqueue.
        assert!(tc.queue.cancel_if_pending(created.run.id.as_ref()).await.unwrap());

        assert_eq!(tc.controller.recover_queued_runs().await.unwrap(), 1);
        assert_eq!(
            tc.queue.state(created.run.id.as_ref()).await.unwrap(),
            Some(JobState::Pending)
        );
        assert_eq!(tc.controller.recover_queued_runs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn controller_works_over_memory_queue() {
        let ts = create_test_storage().await;
        let queue: Arc<dyn TaskQueue> = Arc::new(MemoryQueue::new());
        let controller =
            RunController::new(ts.storage.clone(), Arc::clone(&queue), JOB, ResumePolicy::Enqueue);
        let tc = TestController {
            worker: Worker::new(ts.storage.clone(), Arc::clone(&queue), JOB),
            controller,
            queue,
            _ts: ts,
        };
        let (assistant, thread) = seed(&tc).await;
        let created = tc
            .controller
            .create_run(&thread.id, run_params(&assistant))
            .await
            .unwrap();

        let cancelled = tc
            .controller
            .cancel_run(&thread.id, &created.run.id)
            .await
            .unwrap();
        assert_eq!(cancelled.run.status, RunStatus::Cancelled);
    }

    #[test]
    fn apply_rejects_duplicate_ids() {
        let call = ToolCall::function("multiply", "{}");
        let details = StepDetails::tool_calls(vec![call.clone()]);
        let err = apply_tool_outputs(&details, &[output(&call.id, "1"), output(&call.id, "2")])
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(msg) if msg.contains("Duplicate")));
    }

    #[test]
    fn apply_rejects_filled_output() {
        let mut call = ToolCall::function("multiply", "{}");
        call.function.as_mut().unwrap().output = Some("done".to_string());
        let pending = ToolCall::function("lookup", "{}");
        let details = StepDetails::tool_calls(vec![call.clone(), pending]);
        let err = apply_tool_outputs(&details, &[output(&call.id, "again")]).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(msg) if msg.contains("already")));
    }

    #[test]
    fn apply_rejects_third_party_calls() {
        let details = StepDetails::tool_calls(vec![code_interpreter_call("ci_1")]);
        let err = apply_tool_outputs(&details, &[output("ci_1", "1")]).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidInput(msg) if msg.contains("code_interpreter")
        ));
    }

    #[test]
    fn apply_treats_unknown_kind_as_internal() {
        let mut call = ToolCall::function("multiply", "{}");
        call.kind = ToolCallKind::Unknown;
        let details = StepDetails::tool_calls(vec![call.clone()]);
        let err = apply_tool_outputs(&details, &[output(&call.id, "1")]).unwrap_err();
        assert!(matches!(err, ControllerError::Internal(_)));
    }

    #[test]
    fn apply_treats_missing_payload_as_internal() {
        let mut call = ToolCall::function("multiply", "{}");
        call.function = None;
        let details = StepDetails::tool_calls(vec![call.clone()]);
        let err = apply_tool_outputs(&details, &[output(&call.id, "1")]).unwrap_err();
        assert!(matches!(err, ControllerError::Internal(_)));

        let mut details = StepDetails::tool_calls(Vec::new());
        details.tool_calls = None;
        let err = apply_tool_outputs(&details, &[]).unwrap_err();
        assert!(matches!(err, ControllerError::Internal(_)));
    }

    #[test]
    fn apply_requires_every_pending_call() {
        let first = ToolCall::function("multiply", "{}");
        let second = ToolCall::function("lookup", "{}");
        let details = StepDetails::tool_calls(vec![first.clone(), second.clone()]);
        let err = apply_tool_outputs(&details, &[output(&first.id, "42")]).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(msg) if msg.contains(&second.id)));
    }

    #[test]
    fn apply_leaves_input_untouched() {
        let call = ToolCall::function("multiply", "{}");
        let details = StepDetails::tool_calls(vec![call.clone()]);
        let applied = apply_tool_outputs(&details, &[output(&call.id, "42")]).unwrap();

        assert!(details.tool_calls.as_ref().unwrap()[0].is_pending_function());
        assert_eq!(
            applied.tool_calls.unwrap()[0]
                .function
                .as_ref()
                .unwrap()
                .output
                .as_deref(),
            Some("42")
        );
    }
}
