//! Stages 4-5: `validate_template` and its refinement loop (spec.md §4.5).
//!
//! A template is valid once a scan against the reference target reports a
//! finding whose `template_id` matches the CVE id and whose severity meets
//! or exceeds the template's declared severity. Otherwise the diagnostic
//! (parser output or scanner failure) drives up to `R` refinement attempts
//! before the template is marked `invalid_max_retries`.

use std::time::Duration;

use llm_client::{LlmClient as _, SamplingParams};
use scan_core::{
    CoreResult, JobId, JobKind, JobState, RefineTemplatePayload, Severity, Template, TemplateId,
    ValidateTemplatePayload, ValidationState,
};
use scheduler::ScanRequest;
use tracing::{info, warn};

use crate::context::PipelineContext;

#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub template_id: TemplateId,
    pub final_state: ValidationState,
    pub validations: u32,
    pub validation_failures: u32,
    pub refinements_attempted: u32,
    pub refinements_exhausted: bool,
}

impl ValidationSummary {
    fn new(template_id: TemplateId) -> Self {
        Self {
            template_id,
            final_state: ValidationState::Unvalidated,
            validations: 0,
            validation_failures: 0,
            refinements_attempted: 0,
            refinements_exhausted: false,
        }
    }
}

struct ValidationOutcome {
    success: bool,
    diagnostic: Option<String>,
}

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(120);

fn declared_severity(doc: &scan_core::TemplateDocument) -> Severity {
    Severity::normalize(&doc.info.severity).0
}

async fn run_validation(ctx: &PipelineContext, parent_id: JobId, template: &Template) -> CoreResult<ValidationOutcome> {
    let declared = match Template::parse_and_validate(&template.body, None) {
        Ok(doc) => declared_severity(&doc),
        Err(e) => return Ok(ValidationOutcome { success: false, diagnostic: Some(e.to_string()) }),
    };

    let job = ctx
        .registry
        .create(
            JobKind::ValidateTemplate(ValidateTemplatePayload {
                template_id: template.template_id.clone(),
                reference_target: ctx.reference_target.clone(),
            }),
            Some(parent_id),
        )
        .await?;

    let mounted_path = format!("{}/{}", ctx.container_template_mount_root, template.filename);
    let cancel = ctx.scheduler.register_cancel_token(job.id);
    let request = ScanRequest {
        job_id: job.id,
        image: ctx.scan_image.clone(),
        target: ctx.reference_target.clone(),
        command: vec!["-t".to_string(), mounted_path, "-target".to_string(), ctx.reference_target.clone()],
        timeout: VALIDATE_TIMEOUT,
    };

    let result = scheduler::run_scan(ctx.runtime.clone(), ctx.registry.clone(), request, cancel).await;
    ctx.scheduler.forget_cancel_token(job.id);

    match result {
        Ok(outcome) => {
            let cve_id = template.cve_id.as_deref().unwrap_or_default();
            let matched = outcome
                .findings
                .iter()
                .any(|f| f.template_id.eq_ignore_ascii_case(cve_id) && f.severity >= declared);

            if matched {
                ctx.registry.transition(job.id, JobState::Success, |_| {}).await?;
                Ok(ValidationOutcome { success: true, diagnostic: None })
            } else {
                let diagnostic = format!("no finding matched CVE '{cve_id}' at or above severity {declared:?} (exit code {})", outcome.exit_code);
                ctx.registry.transition(job.id, JobState::Failure, |j| j.error = Some(diagnostic.clone())).await?;
                Ok(ValidationOutcome { success: false, diagnostic: Some(diagnostic) })
            }
        }
        Err(e) => {
            ctx.registry.transition(job.id, JobState::Failure, |j| j.error = Some(e.to_string())).await?;
            Ok(ValidationOutcome { success: false, diagnostic: Some(e.to_string()) })
        }
    }
}

async fn refine_once(
    ctx: &PipelineContext,
    parent_id: JobId,
    template_id: &TemplateId,
    cve_id: &str,
    prior_body: &str,
    diagnostic: &str,
    attempt: u32,
) -> CoreResult<Option<Template>> {
    let job = ctx
        .registry
        .create(
            JobKind::RefineTemplate(RefineTemplatePayload {
                template_id: template_id.clone(),
                failure_diagnostic: diagnostic.to_string(),
                refinement_attempt: attempt,
            }),
            Some(parent_id),
        )
        .await?;
    ctx.registry.transition(job.id, JobState::Running, |_| {}).await?;

    let refined = match ctx.llm.refine_template(cve_id, prior_body, diagnostic, SamplingParams::default()).await {
        Ok(body) => body,
        Err(e) => {
            ctx.registry.transition(job.id, JobState::Failure, |j| j.error = Some(e.to_string())).await?;
            warn!(cve_id, attempt, error = %e, "refinement call failed");
            return Ok(None);
        }
    };

    if let Err(e) = Template::parse_and_validate(&refined, Some(cve_id)) {
        ctx.registry.transition(job.id, JobState::Failure, |j| j.error = Some(e.to_string())).await?;
        warn!(cve_id, attempt, error = %e, "refined template still fails to parse");
        return Ok(None);
    }

    let template_id = ctx.library.store_refined(cve_id, attempt, &refined).await?;
    ctx.registry.transition(job.id, JobState::Success, |_| {}).await?;
    let template = ctx.library.get(&template_id).await?;
    Ok(Some(template))
}

/// Validate a stored template, driving up to `ctx.max_refinement_attempts`
/// refinement rounds on failure, and return a summary for the caller to
/// aggregate into the run's metrics.
pub async fn validate_and_refine(ctx: &PipelineContext, parent_id: JobId, mut template: Template) -> CoreResult<ValidationSummary> {
    let mut summary = ValidationSummary::new(template.template_id.clone());

    loop {
        let outcome = run_validation(ctx, parent_id, &template).await?;
        summary.validations += 1;

        if outcome.success {
            ctx.library.set_validation_state(&template.template_id, ValidationState::Valid)?;
            summary.final_state = ValidationState::Valid;
            info!(cve_id = ?template.cve_id, "template validated");
            return Ok(summary);
        }

        summary.validation_failures += 1;
        let Some(diagnostic) = outcome.diagnostic else {
            ctx.library.set_validation_state(&template.template_id, ValidationState::InvalidMaxRetries)?;
            summary.final_state = ValidationState::InvalidMaxRetries;
            return Ok(summary);
        };

        if summary.refinements_attempted >= ctx.max_refinement_attempts {
            ctx.library.set_validation_state(&template.template_id, ValidationState::InvalidMaxRetries)?;
            summary.final_state = ValidationState::InvalidMaxRetries;
            summary.refinements_exhausted = true;
            return Ok(summary);
        }

        let Some(cve_id) = template.cve_id.clone() else {
            ctx.library.set_validation_state(&template.template_id, ValidationState::InvalidMaxRetries)?;
            summary.final_state = ValidationState::InvalidMaxRetries;
            return Ok(summary);
        };

        summary.refinements_attempted += 1;
        let next_attempt = template.generation_attempt + 1;
        match refine_once(ctx, parent_id, &template.template_id, &cve_id, &template.body, &diagnostic, next_attempt).await? {
            Some(refined) => template = refined,
            None => {
                ctx.library.set_validation_state(&template.template_id, ValidationState::InvalidMaxRetries)?;
                summary.final_state = ValidationState::InvalidMaxRetries;
                summary.refinements_exhausted = true;
                return Ok(summary);
            }
        }
    }
}
