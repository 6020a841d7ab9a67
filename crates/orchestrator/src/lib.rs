//! Orchestrator facade (spec.md §6): the nine external operations, each a
//! method on [`OrchestratorCore`], wired over C1 (container runner), C3
//! (job registry), C4 (scheduler), C5 (synthesis pipeline), and the
//! template library. Constructed by dependency injection of the four
//! collaborator trait objects so tests substitute fakes and no collaborator
//! is ever reached through a module-level singleton.

mod commands;
mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::Settings;
use container_runtime::{validate_target, ContainerRuntime, LogChunk, LogSource};
use job_registry::JobRegistry;
use kv_store::KeyValueStore;
use llm_client::{CveFeedClient, LlmClient, SamplingParams};
use scan_core::{
    AiScanPayload, CoreError, CoreResult, CustomScanPayload, Job, JobId, JobKind, JobState,
    PipelineMetrics, PipelineRunId, ScanPayload, Template, TemplateId, TemplateSelector, TriggerKind,
};
use scheduler::{run_scan, spawn_heartbeat, ScanRequest, Scheduler, HEARTBEAT_INTERVAL};
use synthesis_pipeline::{PipelineContext, PipelineRunner};
use template_library::TemplateLibrary;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use metrics::queue_depths;

/// How long `submit_*` waits for the background scan task to reach
/// `running` (and thus learn its `container_name`) before giving up.
const CONTAINER_NAME_RENDEZVOUS: Duration = Duration::from_millis(20);
const CONTAINER_NAME_ATTEMPTS: u32 = 150;

pub struct OrchestratorCore {
    runtime: Arc<dyn ContainerRuntime>,
    kv: Arc<dyn KeyValueStore>,
    llm: Arc<dyn LlmClient>,
    registry: Arc<JobRegistry>,
    library: Arc<TemplateLibrary>,
    scheduler: Arc<Scheduler>,
    pipeline: PipelineRunner,
    scan_image: String,
    scan_timeout: Duration,
    container_template_mount_root: String,
    _heartbeat_token: CancellationToken,
}

impl OrchestratorCore {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        kv: Arc<dyn KeyValueStore>,
        llm: Arc<dyn LlmClient>,
        cve_feed: Arc<dyn CveFeedClient>,
        settings: &Settings,
    ) -> Self {
        let worker_id = uuid::Uuid::new_v4().to_string();
        let registry = Arc::new(
            JobRegistry::new(Arc::clone(&kv), settings.scan_log_cap_bytes as u64).with_worker_id(worker_id.clone()),
        );
        let (_heartbeat_handle, _heartbeat_token) = spawn_heartbeat(Arc::clone(&registry), worker_id.clone(), HEARTBEAT_INTERVAL);
        info!(worker_id = %worker_id, "worker started");
        let library = Arc::new(TemplateLibrary::new(settings.template_library_root.clone()));
        let scheduler = Arc::new(Scheduler::new(&settings.queue_concurrency));
        let container_template_mount_root = "/root/nuclei-templates/ai".to_string();

        let ctx = PipelineContext {
            registry: Arc::clone(&registry),
            kv: Arc::clone(&kv),
            llm: Arc::clone(&llm),
            library: Arc::clone(&library),
            runtime: Arc::clone(&runtime),
            scheduler: Arc::clone(&scheduler),
            scan_image: settings.scan_image.clone(),
            reference_target: settings.reference_targets.first().cloned().unwrap_or_default(),
            container_template_mount_root: container_template_mount_root.clone(),
            max_refinement_attempts: settings.max_refinement_attempts,
        };
        let pipeline = PipelineRunner::new(ctx, cve_feed);

        Self {
            runtime,
            kv,
            llm,
            registry,
            library,
            scheduler,
            pipeline,
            scan_image: settings.scan_image.clone(),
            scan_timeout: Duration::from_secs(30 * 60),
            container_template_mount_root,
            _heartbeat_token,
        }
    }

    /// Recover jobs abandoned by a worker whose heartbeat has expired. Call
    /// once at process startup (spec.md §4.3 durability).
    pub async fn recover_lost_jobs(&self) -> CoreResult<usize> {
        self.registry.recover_lost_jobs().await
    }

    #[must_use]
    pub fn queue_depths(&self) -> HashMap<&'static str, usize> {
        metrics::queue_depths(&self.scheduler)
    }

    /// `SubmitScan` (spec.md §6): run the shipped template corpus, or a
    /// caller-selected subset of it, against `target`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTarget`] before any job is persisted if
    /// `target` fails validation (spec.md §8 scenario 2).
    pub async fn submit_scan(&self, target: String, template_selector: TemplateSelector) -> CoreResult<(JobId, String)> {
        validate_target(&target)?;
        let scan_id = uuid::Uuid::new_v4().to_string();
        let command = commands::scan_command(&template_selector);
        let job = self
            .registry
            .create(JobKind::Scan(ScanPayload { scan_id, target: target.clone(), template_selector }), None)
            .await?;
        self.dispatch_scan(job, target, command).await
    }

    /// `SubmitCustomScan` (spec.md §6): run a caller-supplied template body
    /// against `target`. The body is persisted to the template library
    /// first (content-addressed, so a repeat upload of the same body is
    /// idempotent) and mounted the same way a synthesis-pipeline validation
    /// run mounts a freshly generated template.
    pub async fn submit_custom_scan(&self, target: String, template_body: Vec<u8>, filename: String) -> CoreResult<(JobId, String)> {
        validate_target(&target)?;
        let template_id = self.library.store_uploaded(&template_body).await?;
        let mounted = self.mounted_path(&template_id).await?;
        let job = self
            .registry
            .create(JobKind::CustomScan(CustomScanPayload { target: target.clone(), template_body, filename }), None)
            .await?;
        self.dispatch_scan(job, target, vec!["-t".to_string(), mounted]).await
    }

    /// `SubmitAIScan` (spec.md §6): synthesize a one-off template from a
    /// natural-language description, validate it the same way the synthesis
    /// pipeline validates a generated template, then scan `target` with it.
    pub async fn submit_ai_scan(&self, target: String, nl_description: String) -> CoreResult<(JobId, String)> {
        validate_target(&target)?;
        let body = self.llm.generate_template("ad-hoc", &nl_description, SamplingParams::default()).await?;
        Template::parse_and_validate(&body, None).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
        let template_id = self.library.store_uploaded(body.as_bytes()).await?;
        let mounted = self.mounted_path(&template_id).await?;
        let job = self
            .registry
            .create(JobKind::AiScan(AiScanPayload { target: target.clone(), nl_description }), None)
            .await?;
        self.dispatch_scan(job, target, vec!["-t".to_string(), mounted]).await
    }

    async fn mounted_path(&self, template_id: &TemplateId) -> CoreResult<String> {
        let template = self.library.get(template_id).await?;
        Ok(format!("{}/{}", self.container_template_mount_root, template.filename))
    }

    /// Hand a scan-kind job to its named queue and drive it to completion in
    /// the background, returning as soon as the scan's container has been
    /// launched and its name is known (spec.md §6: `SubmitScan` et al.
    /// return `(job_id, container_name)`, not the scan's eventual result).
    async fn dispatch_scan(&self, job: Job, target: String, command: Vec<String>) -> CoreResult<(JobId, String)> {
        let job_id = job.id;
        let max_attempts = job.max_attempts;
        let queue_name = job.kind.queue_name();
        let ticket = self.scheduler.queue(queue_name)?.try_reserve()?;

        let runtime = Arc::clone(&self.runtime);
        let registry = Arc::clone(&self.registry);
        let scheduler = Arc::clone(&self.scheduler);
        let image = self.scan_image.clone();
        let timeout = self.scan_timeout;

        tokio::spawn(async move {
            let _ticket = ticket;
            let Ok(queue) = scheduler.queue(queue_name) else { return };
            let _permit = queue.acquire_slot().await;
            let cancel = scheduler.register_cancel_token(job_id);

            let result = scheduler
                .run_with_retry(&registry, job_id, max_attempts, |_attempt| {
                    let runtime = Arc::clone(&runtime);
                    let registry = Arc::clone(&registry);
                    let request = ScanRequest { job_id, image: image.clone(), target: target.clone(), command: command.clone(), timeout };
                    let cancel = cancel.clone();
                    async move { run_scan(runtime, registry, request, cancel).await }
                })
                .await;

            scheduler.forget_cancel_token(job_id);

            let outcome = match result {
                Ok(outcome) => {
                    registry
                        .transition(job_id, JobState::Success, |j| {
                            j.result = Some(serde_json::json!({
                                "findings": outcome.findings.len(),
                                "exit_code": outcome.exit_code,
                                "loop_detected": outcome.loop_detected,
                            }));
                        })
                        .await
                }
                Err(CoreError::Cancelled) => registry.transition(job_id, JobState::Cancelled, |_| {}).await,
                Err(e) => registry.transition(job_id, JobState::Failure, |j| j.error = Some(e.to_string())).await,
            };
            if let Err(e) = outcome {
                warn!(job_id = %job_id, error = %e, "failed to persist scan job's terminal state");
            }
        });

        let container_name = self.await_container_name(job_id).await?;
        self.kv.set(&commands::container_index_key(&container_name), job_id.to_string().into_bytes()).await?;
        Ok((job_id, container_name))
    }

    async fn await_container_name(&self, job_id: JobId) -> CoreResult<String> {
        for _ in 0..CONTAINER_NAME_ATTEMPTS {
            let job = self.registry.get(job_id).await?;
            if let Some(name) = job.container_name {
                return Ok(name);
            }
            if job.state.is_terminal() {
                return Err(CoreError::RuntimeUnavailable(format!("job {job_id} finished before its container was launched")));
            }
            tokio::time::sleep(CONTAINER_NAME_RENDEZVOUS).await;
        }
        Err(CoreError::Timeout(CONTAINER_NAME_RENDEZVOUS * CONTAINER_NAME_ATTEMPTS))
    }

    /// `StreamScanLog` (spec.md §6): replay a scan's persisted log from
    /// `from_offset`, then keep polling for new pages until the job reaches
    /// a terminal state (spec.md §9 "resumable streaming by high-water-mark
    /// suppression"). The job registry's ring buffer does not retain which
    /// stream (`stdout`/`stderr`) each byte came from, so every chunk is
    /// surfaced as [`LogSource::Stdout`].
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `container_name` has no indexed
    /// job (never submitted through this facade, or evicted by a reap).
    pub async fn stream_scan_log(&self, container_name: String, from_offset: u64) -> CoreResult<mpsc::Receiver<LogChunk>> {
        let job_id = self.lookup_job_by_container(&container_name).await?;
        let (tx, rx) = mpsc::channel(256);
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let mut offset = from_offset;
            loop {
                let (bytes, next_offset) = match registry.read_log(job_id, offset).await {
                    Ok(page) => page,
                    Err(_) => return,
                };
                if bytes.is_empty() {
                    match registry.get(job_id).await {
                        Ok(job) if job.state.is_terminal() => return,
                        Ok(_) => {}
                        Err(_) => return,
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                let chunk = LogChunk { source: LogSource::Stdout, offset, data: bytes };
                offset = next_offset;
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn lookup_job_by_container(&self, container_name: &str) -> CoreResult<JobId> {
        let bytes = self
            .kv
            .get(&commands::container_index_key(container_name))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("container {container_name}")))?;
        let raw = String::from_utf8(bytes).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
        raw.parse::<JobId>().map_err(|e| CoreError::InvalidOutput(e.to_string()))
    }

    /// `GetJob` (spec.md §6).
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `job_id` is unknown.
    pub async fn get_job(&self, job_id: JobId) -> CoreResult<Job> {
        self.registry.get(job_id).await
    }

    /// `CancelJob` (spec.md §6). Idempotent: cancelling an already-terminal
    /// or already-cancelled job is a no-op ack, not an error. A queued job
    /// is cancelled immediately; a running job is signalled and transitions
    /// to `cancelled` once its task observes the token (spec.md §8 scenario
    /// 5, `grace=5s`).
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `job_id` is unknown.
    pub async fn cancel_job(&self, job_id: JobId) -> CoreResult<()> {
        let job = self.registry.get(job_id).await?;
        match job.state {
            JobState::Queued | JobState::Retrying => {
                self.registry.transition(job_id, JobState::Cancelled, |_| {}).await?;
            }
            JobState::Running => {
                if !self.scheduler.cancel(job_id) {
                    warn!(job_id = %job_id, "cancel requested but no cancellation token was registered");
                }
            }
            JobState::Success | JobState::Failure | JobState::Cancelled => {}
        }
        Ok(())
    }

    /// `TriggerPipeline` (spec.md §6, §4.5). Calling this twice with the
    /// same `filters` returns the same `run_id` (spec.md §8 idempotence
    /// law), whether the first run is still executing or already finished.
    pub async fn trigger_pipeline(&self, trigger_kind: TriggerKind, filters: Option<String>) -> CoreResult<PipelineRunId> {
        self.pipeline.trigger(trigger_kind, filters).await
    }

    /// `GetPipelineMetrics` (spec.md §6).
    pub async fn get_pipeline_metrics(&self, run_id: PipelineRunId) -> CoreResult<Option<PipelineMetrics>> {
        self.pipeline.metrics(run_id).await
    }

    /// `UploadTemplate` (spec.md §6): content-addressed, so uploading the
    /// same body twice yields the same `template_id` (spec.md §8
    /// idempotence law). `filename` is accepted for API symmetry with
    /// `SubmitCustomScan` but the library derives its own on-disk name from
    /// the body's content hash.
    pub async fn upload_template(&self, body: Vec<u8>, _filename: String) -> CoreResult<TemplateId> {
        self.library.store_uploaded(&body).await
    }
}
