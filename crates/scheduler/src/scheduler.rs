//! The top-level `Scheduler`: one named queue per `JobKind::queue_name()`
//! (spec.md §5), a retry/backoff wrapper around task execution, and a
//! cancellation-token registry keyed by job id so cancelling a job (or,
//! transitively, a pipeline root's descendants) reaches whatever task is
//! currently running it.

use std::collections::HashMap;
use std::sync::Mutex;

use config::QueueConcurrency;
use job_registry::JobRegistry;
use scan_core::{CoreError, CoreResult, JobId, JobState};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::queue::{NamedQueue, DEFAULT_SOFT_CAP};

pub struct Scheduler {
    queues: HashMap<&'static str, NamedQueue>,
    backoff: BackoffPolicy,
    cancel_tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(concurrency: &QueueConcurrency) -> Self {
        let mut queues = HashMap::new();
        queues.insert("scans", NamedQueue::new("scans", concurrency.scans, DEFAULT_SOFT_CAP));
        queues.insert("pipeline", NamedQueue::new("pipeline", concurrency.pipeline, DEFAULT_SOFT_CAP));
        queues.insert("generate", NamedQueue::new("generate", concurrency.generate, DEFAULT_SOFT_CAP));
        queues.insert("validate", NamedQueue::new("validate", concurrency.validate, DEFAULT_SOFT_CAP));
        queues.insert("refine", NamedQueue::new("refine", concurrency.refine, DEFAULT_SOFT_CAP));
        Self { queues, backoff: BackoffPolicy::default(), cancel_tokens: Mutex::new(HashMap::new()) }
    }

    /// # Errors
    /// Returns [`CoreError::InvalidInput`] if `name` isn't one of the five
    /// known queue names.
    pub fn queue(&self, name: &str) -> CoreResult<&NamedQueue> {
        self.queues.get(name).ok_or_else(|| CoreError::InvalidInput(format!("unknown queue '{name}'")))
    }

    /// Register a fresh cancellation token for `job_id`, replacing and
    /// dropping any prior one. Call this right before a job enters `running`.
    pub fn register_cancel_token(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel_tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(job_id, token.clone());
        token
    }

    pub fn forget_cancel_token(&self, job_id: JobId) {
        self.cancel_tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&job_id);
    }

    /// Signal cancellation for a running job. Returns `false` if the job has
    /// no registered token (not running, or already finished).
    pub fn cancel(&self, job_id: JobId) -> bool {
        let tokens = self.cancel_tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `task` with the job's retry/backoff policy (spec.md §5/§7):
    /// a retryable error transitions the job `failure -> retrying -> queued`
    /// and waits the backoff delay before the next attempt; `task` itself is
    /// responsible for transitioning the job to `running` before it starts
    /// doing work (so the prior attempt's terminal states stay accurate).
    ///
    /// # Errors
    /// Returns the task's error once attempts are exhausted or the error is
    /// not retryable.
    pub async fn run_with_retry<F, Fut, T>(
        &self,
        registry: &JobRegistry,
        job_id: JobId,
        max_attempts: u32,
        mut task: F,
    ) -> CoreResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match task(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(job_id = %job_id, attempt, error = %e, "retrying after transient failure");
                    let next_attempt = attempt + 1;
                    registry
                        .transition(job_id, JobState::Failure, |j| j.error = Some(e.to_string()))
                        .await?;
                    registry
                        .transition(job_id, JobState::Retrying, |j| j.attempt = next_attempt)
                        .await?;
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    registry.transition(job_id, JobState::Queued, |_| {}).await?;
                    attempt = next_attempt;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
