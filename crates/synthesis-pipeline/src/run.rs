//! `PipelineRunner`: ties the five synthesis stages together behind
//! `TriggerPipeline` (spec.md §4.5, §7).

use std::sync::Arc;

use llm_client::{CveFeedClient, SamplingParams};
use scan_core::{
    CoreResult, JobKind, JobState, PipelineMetrics, PipelineRootPayload, PipelineRun, PipelineRunId, TriggerKind,
};
use tracing::info;

use crate::context::PipelineContext;
use crate::generate::generate_template;
use crate::novelty::partition_by_novelty;
use crate::store::store_templates;
use crate::validate::validate_and_refine;
use scheduler::run_group;

pub struct PipelineRunner {
    ctx: PipelineContext,
    cve_feed: Arc<dyn CveFeedClient>,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(ctx: PipelineContext, cve_feed: Arc<dyn CveFeedClient>) -> Self {
        Self { ctx, cve_feed }
    }

    async fn load_run(&self, run_id: PipelineRunId) -> CoreResult<Option<PipelineRun>> {
        let key = format!("pipeline_run:{run_id}");
        match self.ctx.kv.get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| scan_core::CoreError::InvalidOutput(e.to_string()))?)),
            None => Ok(None),
        }
    }

    async fn save_run(&self, run: &PipelineRun) -> CoreResult<()> {
        let bytes = serde_json::to_vec(run).map_err(|e| scan_core::CoreError::InvalidOutput(e.to_string()))?;
        self.ctx.kv.set(&run.kv_key(), bytes).await
    }

    /// Start (or rejoin) a pipeline run. Calling this twice with the same
    /// `filters` idempotency key returns the same `run_id` whether the
    /// first run is still executing or has already finished (spec.md §4.5
    /// Idempotency law).
    pub async fn trigger(&self, trigger_kind: TriggerKind, filters: Option<String>) -> CoreResult<PipelineRunId> {
        let idempotency_key = filters.clone().unwrap_or_else(|| "__unfiltered__".to_string());
        let run_id = PipelineRunId::from_trigger_key(&idempotency_key);

        if let Some(existing) = self.load_run(run_id).await? {
            info!(run_id = %existing.run_id, "pipeline trigger is idempotent, returning existing run");
            return Ok(existing.run_id);
        }

        let mut run = PipelineRun::new(trigger_kind, Vec::new());
        run.run_id = run_id;
        self.save_run(&run).await?;

        let ctx = self.ctx.clone();
        let cve_feed = Arc::clone(&self.cve_feed);
        tokio::spawn(async move {
            if let Err(e) = execute(ctx, cve_feed, run_id, filters).await {
                tracing::error!(run_id = %run_id, error = %e, "pipeline run failed");
            }
        });

        Ok(run_id)
    }

    pub async fn metrics(&self, run_id: PipelineRunId) -> CoreResult<Option<PipelineMetrics>> {
        Ok(self.load_run(run_id).await?.map(|r| r.metrics))
    }
}

async fn execute(
    ctx: PipelineContext,
    cve_feed: Arc<dyn CveFeedClient>,
    run_id: PipelineRunId,
    filters: Option<String>,
) -> CoreResult<()> {
    let root = ctx.registry.create(JobKind::PipelineRoot(PipelineRootPayload { filters }), None).await?;
    ctx.registry.transition(root.id, JobState::Running, |j| j.pipeline_run_id = Some(run_id)).await?;

    let fetch_job = ctx
        .registry
        .create(JobKind::FetchCves(scan_core::FetchCvesPayload { since: None }), Some(root.id))
        .await?;
    ctx.registry.transition(fetch_job.id, JobState::Running, |_| {}).await?;

    let fetched = match cve_feed.fetch_since(None).await {
        Ok(records) => {
            ctx.registry.transition(fetch_job.id, JobState::Success, |j| j.result = Some(serde_json::json!({"count": records.len()}))).await?;
            records
        }
        Err(e) => {
            ctx.registry.transition(fetch_job.id, JobState::Failure, |j| j.error = Some(e.to_string())).await?;
            ctx.registry.transition(root.id, JobState::Failure, |j| j.error = Some(e.to_string())).await?;
            return Err(e);
        }
    };

    let novel = partition_by_novelty(ctx.kv.as_ref(), fetched).await?;
    info!(run_id = %run_id, novel_count = novel.len(), "novel CVEs admitted into this run");

    let mut run = match load_run_or_fail(&ctx, run_id).await? {
        Some(r) => r,
        None => return Ok(()),
    };
    run.cve_batch = novel.iter().map(|c| c.cve_id.clone()).collect();
    save_run(&ctx, &run).await?;

    let sampling = SamplingParams::default();
    let tasks: Vec<_> = novel
        .iter()
        .map(|cve| {
            let ctx = ctx.clone();
            let cve = cve.clone();
            move || async move { generate_template(ctx.llm.as_ref(), ctx.registry.as_ref(), root.id, run_id, &cve, sampling).await }
        })
        .collect();
    let generated = run_group(tasks).await;

    let mut templates = Vec::new();
    for result in generated {
        match result? {
            Some(t) => {
                run.metrics.record_generated();
                templates.push(t);
            }
            None => {}
        }
    }
    save_run(&ctx, &run).await?;

    let root_id = root.id;
    let stored = store_templates(ctx.library.as_ref(), ctx.registry.as_ref(), root_id, templates).await?;

    let tasks: Vec<_> = stored
        .into_iter()
        .map(|(_, template_id)| {
            let ctx = ctx.clone();
            move || async move {
                let template = ctx.library.get(&template_id).await?;
                validate_and_refine(&ctx, root_id, template).await
            }
        })
        .collect();
    let summaries = run_group(tasks).await;

    for summary in summaries {
        let summary = summary?;
        if summary.final_state == scan_core::ValidationState::Valid {
            run.metrics.record_validated();
        }
        for _ in 0..summary.validation_failures {
            run.metrics.record_validation_failed();
        }
        for _ in 0..summary.refinements_attempted {
            run.metrics.record_refinement_attempted();
        }
        if summary.refinements_exhausted {
            run.metrics.record_refinement_exhausted();
        }
    }

    run.finish();
    save_run(&ctx, &run).await?;
    ctx.registry.transition(root.id, JobState::Success, |j| j.result = Some(serde_json::json!({"run_id": run_id.to_string()}))).await?;

    Ok(())
}

async fn load_run_or_fail(ctx: &PipelineContext, run_id: PipelineRunId) -> CoreResult<Option<PipelineRun>> {
    let key = format!("pipeline_run:{run_id}");
    match ctx.kv.get(&key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| scan_core::CoreError::InvalidOutput(e.to_string()))?)),
        None => Ok(None),
    }
}

async fn save_run(ctx: &PipelineContext, run: &PipelineRun) -> CoreResult<()> {
    let bytes = serde_json::to_vec(run).map_err(|e| scan_core::CoreError::InvalidOutput(e.to_string()))?;
    ctx.kv.set(&run.kv_key(), bytes).await
}
