//! # Step Pipeline
//!
//! Every lifecycle operation is the same three-phase template:
//!
//! ```text
//! pre-step ──▶ business step(s) ──▶ post-step
//!     │               │                 │
//!     └───────────────┴──── failure ────┴──▶ failure handler
//! ```
//!
//! The pre-step takes the state lock (`BUILDING`, `UPDATING`, `DELETING`, `EXPUNGING`),
//! business steps are supplied by the resource-type plugin, and the post-step persists the
//! outcome. Steps only talk to each other through the [`OperationContext`] they receive
//! and return.
//!
//! [`Pipeline::execute`] owns ordering, retry and resume. A step that fails with a
//! retryable error is re-run with a fresh copy of the context it was first handed, so
//! steps must tolerate being executed more than once. The failure handler runs once,
//! after retries are exhausted, and the post-step is never reached on failure.

use super::context::OperationContext;
use crate::config::ExecutorConfig;
use crate::error::{CoreError, CoreResult};
use crate::state_machine::{ContainerState, ContainerStateMachine, ResourceState, ResourceStateMachine};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A named, idempotent unit of work
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: OperationContext) -> CoreResult<OperationContext>;
}

/// Invoked once when a step fails for good
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(&self, ctx: &OperationContext, error: &CoreError);
}

/// Per-step retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_step_attempts.max(1),
            backoff_unit: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_unit: Duration::ZERO,
        }
    }

    /// Linear backoff after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// Ordered step list plus its failure handler
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("has_failure_handler", &self.failure_handler.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            pre: None,
            business: Vec::new(),
            post: None,
            failure_handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the steps from `ctx.next_step` onward.
    ///
    /// `on_progress` is called with the updated context after every completed step.
    pub async fn execute(
        &self,
        mut ctx: OperationContext,
        retry: &RetryPolicy,
        on_progress: &(dyn Fn(&OperationContext) + Send + Sync),
    ) -> CoreResult<OperationContext> {
        while let Some(step) = self.steps.get(ctx.next_step) {
            let index = ctx.next_step;
            match self.run_step(step.as_ref(), &ctx, retry).await {
                Ok(mut next) => {
                    next.next_step = index + 1;
                    next.record_progress(format!("{} completed", step.name()));
                    debug!(
                        pipeline = %self.name,
                        step = step.name(),
                        index,
                        "Step completed"
                    );
                    on_progress(&next);
                    ctx = next;
                }
                Err(err) => {
                    error!(
                        pipeline = %self.name,
                        step = step.name(),
                        index,
                        error = %err,
                        "Step failed"
                    );
                    if let Some(handler) = &self.failure_handler {
                        handler.on_failure(&ctx, &err).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(ctx)
    }

    async fn run_step(
        &self,
        step: &dyn Step,
        ctx: &OperationContext,
        retry: &RetryPolicy,
    ) -> CoreResult<OperationContext> {
        let mut attempt = 1;
        loop {
            match step.run(ctx.clone()).await {
                Ok(next) => return Ok(next),
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        pipeline = %self.name,
                        step = step.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying step"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct PipelineBuilder {
    name: String,
    pre: Option<Arc<dyn Step>>,
    business: Vec<Arc<dyn Step>>,
    post: Option<Arc<dyn Step>>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
}

impl PipelineBuilder {
    pub fn pre(mut self, step: Arc<dyn Step>) -> Self {
        self.pre = Some(step);
        self
    }

    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.business.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.business.extend(steps);
        self
    }

    pub fn post(mut self, step: Arc<dyn Step>) -> Self {
        self.post = Some(step);
        self
    }

    pub fn on_failure(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn build(self) -> Pipeline {
        let steps = self
            .pre
            .into_iter()
            .chain(self.business)
            .chain(self.post)
            .collect();
        Pipeline {
            name: self.name,
            steps,
            failure_handler: self.failure_handler,
        }
    }
}

/// Whether a failure must be recorded on the entity: always once the lock is held,
/// otherwise only for errors raised after something may have been written.
fn should_record_failure(ctx: &OperationContext, error: &CoreError) -> bool {
    ctx.lock_held || !error.is_pre_mutation()
}

/// Moves the resource to `ERROR` with `last_error` populated
pub struct ResourceFailureHandler {
    resources: ResourceStateMachine,
}

impl ResourceFailureHandler {
    pub fn new(resources: ResourceStateMachine) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl FailureHandler for ResourceFailureHandler {
    async fn on_failure(&self, ctx: &OperationContext, error: &CoreError) {
        let Some(resource_id) = ctx.resource_id else {
            return;
        };
        if !should_record_failure(ctx, error) {
            debug!(resource_id, error = %error, "Failure raised before any mutation");
            return;
        }
        if let Err(record_err) = self
            .resources
            .update_state(resource_id, ResourceState::Error, Some(error.to_string()))
            .await
        {
            error!(
                resource_id,
                error = %record_err,
                original_error = %error,
                "Failed to record resource failure"
            );
        }
    }
}

/// Moves the container to `ERROR`, used by container-level runs
pub struct ContainerFailureHandler {
    containers: ContainerStateMachine,
}

impl ContainerFailureHandler {
    pub fn new(containers: ContainerStateMachine) -> Self {
        Self { containers }
    }
}

#[async_trait]
impl FailureHandler for ContainerFailureHandler {
    async fn on_failure(&self, ctx: &OperationContext, error: &CoreError) {
        if !should_record_failure(ctx, error) {
            return;
        }
        if let Err(record_err) = self
            .containers
            .update_state(ctx.container_id, ContainerState::Error, Some(error.to_string()))
            .await
        {
            error!(
                container_id = ctx.container_id,
                error = %record_err,
                original_error = %error,
                "Failed to record container failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::context::Operation;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingStep {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        failures_before_success: AtomicU32,
        error: Option<CoreError>,
    }

    impl RecordingStep {
        fn ok(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Step> {
            Arc::new(Self {
                name: name.to_string(),
                log: log.clone(),
                failures_before_success: AtomicU32::new(0),
                error: None,
            })
        }

        fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>, times: u32, error: CoreError) -> Arc<dyn Step> {
            Arc::new(Self {
                name: name.to_string(),
                log: log.clone(),
                failures_before_success: AtomicU32::new(times),
                error: Some(error),
            })
        }
    }

    #[async_trait]
    impl Step for RecordingStep {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
            self.log.lock().push(self.name.clone());
            if let Some(error) = &self.error {
                let remaining = self.failures_before_success.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
                    return Err(error.clone());
                }
            }
            ctx.lock_held = true;
            Ok(ctx)
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: Mutex<Vec<(bool, String)>>,
    }

    #[async_trait]
    impl FailureHandler for CountingHandler {
        async fn on_failure(&self, ctx: &OperationContext, error: &CoreError) {
            self.calls.lock().push((ctx.lock_held, error.to_string()));
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(Operation::Create, "Fake.Server", 1)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_unit: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder("create")
            .post(RecordingStep::ok("post", &log))
            .step(RecordingStep::ok("business", &log))
            .pre(RecordingStep::ok("pre", &log))
            .build();

        let result = pipeline.execute(ctx(), &fast_retry(1), &|_| {}).await.unwrap();

        assert_eq!(*log.lock(), vec!["pre", "business", "post"]);
        assert_eq!(result.next_step, 3);
        assert_eq!(result.progress.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_post_step_and_calls_handler_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(CountingHandler::default());
        let pipeline = Pipeline::builder("create")
            .pre(RecordingStep::ok("pre", &log))
            .step(RecordingStep::failing(
                "business",
                &log,
                u32::MAX,
                CoreError::remote("Fake.Server", "quota exceeded"),
            ))
            .post(RecordingStep::ok("post", &log))
            .on_failure(handler.clone())
            .build();

        let err = pipeline.execute(ctx(), &fast_retry(3), &|_| {}).await.unwrap_err();

        assert!(matches!(err, CoreError::RemoteProvisioningFailure { .. }));
        // remote failures are not retried
        assert_eq!(*log.lock(), vec!["pre", "business"]);
        let calls = handler.calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0, "lock flag from the pre-step reaches the handler");
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder("update")
            .step(RecordingStep::failing(
                "flaky",
                &log,
                2,
                CoreError::transaction("update", "deadlock"),
            ))
            .build();

        pipeline.execute(ctx(), &fast_retry(3), &|_| {}).await.unwrap();
        assert_eq!(log.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder("update")
            .step(RecordingStep::failing(
                "flaky",
                &log,
                u32::MAX,
                CoreError::transaction("update", "deadlock"),
            ))
            .build();

        assert!(pipeline.execute(ctx(), &fast_retry(2), &|_| {}).await.is_err());
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder("create")
            .pre(RecordingStep::ok("pre", &log))
            .step(RecordingStep::ok("business", &log))
            .post(RecordingStep::ok("post", &log))
            .build();

        let mut resumed = ctx();
        resumed.next_step = 2;
        pipeline.execute(resumed, &fast_retry(1), &|_| {}).await.unwrap();
        assert_eq!(*log.lock(), vec!["post"]);
    }

    #[test]
    fn test_failure_recording_rule() {
        let mut context = ctx();
        assert!(!should_record_failure(
            &context,
            &CoreError::conflict("resource", 1, "busy")
        ));
        assert!(should_record_failure(
            &context,
            &CoreError::transaction("insert", "disk full")
        ));
        context.lock_held = true;
        assert!(should_record_failure(
            &context,
            &CoreError::conflict("resource", 1, "busy")
        ));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(200),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }
}
