//! Stage 2: `generate_template` (spec.md §4.5).

use job_registry::JobRegistry;
use llm_client::{LlmClient, SamplingParams};
use scan_core::{
    CoreError, CoreResult, CveRecord, GenerateTemplatePayload, JobId, JobKind, JobState, PipelineRunId, Template,
};
use tracing::warn;

pub struct GeneratedTemplate {
    pub cve_id: String,
    pub body: String,
}

async fn render_and_validate(llm: &dyn LlmClient, cve_id: &str, description: &str, sampling: SamplingParams) -> CoreResult<String> {
    let body = llm.generate_template(cve_id, description, sampling).await?;
    Template::parse_and_validate(&body, Some(cve_id)).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
    Ok(body)
}

/// Render, call the LLM, and parse-validate a template for one CVE, retrying
/// up to the job's `max_attempts` (default 3) regardless of whether the
/// failure was a transient LLM error or a validation error — this stage's
/// retry budget is per spec.md §4.5 stage 2, distinct from
/// [`scheduler::Scheduler::run_with_retry`]'s transient-only policy.
///
/// Returns `Ok(None)` (a `SkippedTemplate` marker) once attempts are
/// exhausted; the pipeline continues with the remaining CVEs in the batch.
pub async fn generate_template(
    llm: &dyn LlmClient,
    registry: &JobRegistry,
    parent_id: JobId,
    pipeline_run_id: PipelineRunId,
    cve: &CveRecord,
    sampling: SamplingParams,
) -> CoreResult<Option<GeneratedTemplate>> {
    let job = registry
        .create(
            JobKind::GenerateTemplate(GenerateTemplatePayload {
                cve_id: cve.cve_id.clone(),
                description: cve.description.clone(),
            }),
            Some(parent_id),
        )
        .await?;
    registry.transition(job.id, JobState::Running, |j| j.pipeline_run_id = Some(pipeline_run_id)).await?;

    let max_attempts = job.max_attempts;
    let mut attempt = 1;
    loop {
        match render_and_validate(llm, &cve.cve_id, &cve.description, sampling).await {
            Ok(body) => {
                registry
                    .transition(job.id, JobState::Success, |j| {
                        j.result = Some(serde_json::json!({"cve_id": cve.cve_id}));
                    })
                    .await?;
                return Ok(Some(GeneratedTemplate { cve_id: cve.cve_id.clone(), body }));
            }
            Err(e) if attempt < max_attempts => {
                warn!(cve_id = %cve.cve_id, attempt, error = %e, "template generation attempt failed, retrying");
                attempt += 1;
            }
            Err(e) => {
                registry.transition(job.id, JobState::Failure, |j| j.error = Some(e.to_string())).await?;
                warn!(cve_id = %cve.cve_id, "template generation exhausted retries, skipping CVE");
                return Ok(None);
            }
        }
    }
}
