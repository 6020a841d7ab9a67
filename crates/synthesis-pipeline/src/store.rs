//! Stage 3: `store_templates` (spec.md §4.5).

use job_registry::JobRegistry;
use scan_core::{CoreResult, JobId, JobKind, JobState, StoreTemplatesPayload, TemplateId};
use template_library::TemplateLibrary;

use crate::generate::GeneratedTemplate;

/// Atomically write every generated template to the library and record the
/// batch in a single `store_templates` job.
pub async fn store_templates(
    library: &TemplateLibrary,
    registry: &JobRegistry,
    parent_id: JobId,
    generated: Vec<GeneratedTemplate>,
) -> CoreResult<Vec<(String, TemplateId)>> {
    if generated.is_empty() {
        return Ok(Vec::new());
    }

    let job = registry.create(JobKind::StoreTemplates(StoreTemplatesPayload { template_ids: Vec::new() }), Some(parent_id)).await?;
    registry.transition(job.id, JobState::Running, |_| {}).await?;

    let mut stored = Vec::with_capacity(generated.len());
    for template in &generated {
        let template_id = library.store_generated(&template.cve_id, &template.body).await?;
        stored.push((template.cve_id.clone(), template_id));
    }

    let ids: Vec<TemplateId> = stored.iter().map(|(_, id)| id.clone()).collect();
    registry
        .transition(job.id, JobState::Success, |j| {
            j.result = Some(serde_json::json!({"count": stored.len()}));
            if let JobKind::StoreTemplates(payload) = &mut j.kind {
                payload.template_ids = ids;
            }
        })
        .await?;

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_registry::DEFAULT_CAP_BYTES;
    use kv_store::InMemoryStore;
    use scan_core::PipelineRootPayload;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stores_every_generated_template_and_records_the_batch() {
        let reg = JobRegistry::new(Arc::new(InMemoryStore::new()), DEFAULT_CAP_BYTES);
        let root = reg.create(JobKind::PipelineRoot(PipelineRootPayload { filters: None }), None).await.unwrap();
        let dir = TempDir::new().unwrap();
        let library = TemplateLibrary::new(dir.path());

        let generated = vec![
            GeneratedTemplate { cve_id: "CVE-2024-0001".into(), body: "id: CVE-2024-0001\n".into() },
            GeneratedTemplate { cve_id: "CVE-2024-0002".into(), body: "id: CVE-2024-0002\n".into() },
        ];

        let stored = store_templates(&library, &reg, root.id, generated).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(library.list().len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_stores_nothing() {
        let reg = JobRegistry::new(Arc::new(InMemoryStore::new()), DEFAULT_CAP_BYTES);
        let root = reg.create(JobKind::PipelineRoot(PipelineRootPayload { filters: None }), None).await.unwrap();
        let dir = TempDir::new().unwrap();
        let library = TemplateLibrary::new(dir.path());

        let stored = store_templates(&library, &reg, root.id, vec![]).await.unwrap();
        assert!(stored.is_empty());
    }
}
