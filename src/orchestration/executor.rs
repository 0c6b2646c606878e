//! # Task Executor
//!
//! Runs pipelines either inline on the caller's task or in the background on a bounded
//! worker pool. Background runs are tracked by task id; their status (including the
//! per-step progress messages) can be polled or awaited.
//!
//! The executor owns retry and resume: [`Pipeline::execute`] re-runs retryable step
//! failures with the policy built from [`ExecutorConfig`], and a context re-submitted
//! with `next_step > 0` resumes at that step.
//!
//! Finished task statuses are kept for `task_retention_seconds` and swept on submit.

use super::context::OperationContext;
use super::pipeline::{Pipeline, RetryPolicy};
use crate::config::ExecutorConfig;
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Live status of a background task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    /// Pipeline name
    pub name: String,
    pub state: TaskState,
    pub progress: Vec<String>,
    /// `OperationContext::result` of a successful run
    pub result: Option<Value>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    fn pending(task_id: &str, name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: name.to_string(),
            state: TaskState::Pending,
            progress: Vec::new(),
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Issue an id for a task that is about to be submitted
    fn new_task_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Queue a pipeline for background execution and return its task id. A context that
    /// already carries a `task_id` keeps it.
    async fn submit(&self, pipeline: Arc<Pipeline>, ctx: OperationContext) -> CoreResult<String>;

    /// Run a pipeline on the caller's task
    async fn run_inline(&self, pipeline: &Pipeline, ctx: OperationContext) -> CoreResult<OperationContext>;

    fn status(&self, task_id: &str) -> Option<TaskStatus>;

    /// Wait until the task has finished
    async fn wait(&self, task_id: &str) -> CoreResult<TaskStatus>;
}

/// Background executor bounded by a semaphore of `workers` permits
pub struct WorkerPoolExecutor {
    permits: Arc<Semaphore>,
    tasks: Arc<DashMap<String, Arc<watch::Sender<TaskStatus>>>>,
    retry: RetryPolicy,
    retention: Duration,
}

impl WorkerPoolExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            tasks: Arc::new(DashMap::new()),
            retry: RetryPolicy::from_config(config),
            retention: Duration::from_secs(config.task_retention_seconds),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Number of tasks not yet finished
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().borrow().state.is_finished())
            .count()
    }

    /// Drop the statuses of tasks that finished more than the retention window ago.
    /// Returns how many were dropped.
    pub fn sweep_finished(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let before = self.tasks.len();
        self.tasks.retain(|_, sender| {
            let status = sender.borrow();
            match (status.finished_at, cutoff) {
                (Some(finished_at), Some(cutoff)) => finished_at > cutoff,
                _ => true,
            }
        });
        let swept = before.saturating_sub(self.tasks.len());
        if swept > 0 {
            debug!(swept, "Dropped finished task statuses");
        }
        swept
    }
}

#[async_trait]
impl TaskExecutor for WorkerPoolExecutor {
    #[instrument(skip(self, pipeline, ctx), fields(pipeline = pipeline.name()))]
    async fn submit(&self, pipeline: Arc<Pipeline>, mut ctx: OperationContext) -> CoreResult<String> {
        self.sweep_finished();
        let task_id = match &ctx.task_id {
            Some(task_id) => task_id.clone(),
            None => self.new_task_id(),
        };
        ctx.task_id = Some(task_id.clone());

        let sender = Arc::new(watch::channel(TaskStatus::pending(&task_id, pipeline.name())).0);
        match self.tasks.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                return Err(CoreError::conflict("task", &task_id, "task id is already in use"));
            }
            Entry::Vacant(slot) => {
                slot.insert(sender.clone());
            }
        }

        let permits = self.permits.clone();
        let retry = self.retry;
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    sender.send_modify(|status| {
                        status.state = TaskState::Failed;
                        status.error = Some(format!("worker pool closed: {err}"));
                        status.finished_at = Some(Utc::now());
                    });
                    return;
                }
            };
            sender.send_modify(|status| {
                status.state = TaskState::Running;
                status.started_at = Some(Utc::now());
            });

            let progress_sender = sender.clone();
            let on_progress = move |ctx: &OperationContext| {
                progress_sender.send_modify(|status| status.progress = ctx.progress.clone());
            };
            let outcome = pipeline.execute(ctx, &retry, &on_progress).await;

            sender.send_modify(|status| {
                status.finished_at = Some(Utc::now());
                match &outcome {
                    Ok(ctx) => {
                        status.state = TaskState::Succeeded;
                        status.progress = ctx.progress.clone();
                        status.result = Some(ctx.result.clone());
                    }
                    Err(err) => {
                        status.state = TaskState::Failed;
                        status.error = Some(err.to_string());
                    }
                }
            });
            match outcome {
                Ok(_) => info!(task_id = %spawned_id, pipeline = pipeline.name(), "Task succeeded"),
                Err(err) => error!(
                    task_id = %spawned_id,
                    pipeline = pipeline.name(),
                    error = %err,
                    "Task failed"
                ),
            }
        });

        Ok(task_id)
    }

    #[instrument(skip(self, pipeline, ctx), fields(pipeline = pipeline.name()))]
    async fn run_inline(&self, pipeline: &Pipeline, ctx: OperationContext) -> CoreResult<OperationContext> {
        pipeline.execute(ctx, &self.retry, &|_| {}).await
    }

    fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().borrow().clone())
    }

    async fn wait(&self, task_id: &str) -> CoreResult<TaskStatus> {
        let mut receiver = self
            .tasks
            .get(task_id)
            .map(|entry| entry.value().subscribe())
            .ok_or_else(|| CoreError::not_found("task", task_id))?;

        let status = receiver
            .wait_for(|status| status.state.is_finished())
            .await
            .map_err(|err| CoreError::Internal(format!("task {task_id} status channel closed: {err}")))?;
        Ok(status.clone())
    }
}
