//! Collaborators shared by every stage of one pipeline instance.

use std::sync::Arc;

use container_runtime::ContainerRuntime;
use job_registry::JobRegistry;
use kv_store::KeyValueStore;
use llm_client::LlmClient;
use template_library::TemplateLibrary;

use scheduler::Scheduler;

#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Arc<JobRegistry>,
    pub kv: Arc<dyn KeyValueStore>,
    pub llm: Arc<dyn LlmClient>,
    pub library: Arc<TemplateLibrary>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub scheduler: Arc<Scheduler>,
    pub scan_image: String,
    pub reference_target: String,
    /// Path under which the template library root is mounted inside scan
    /// containers (spec.md §4.5 stage 4 needs the validated template file
    /// visible to the scanner binary).
    pub container_template_mount_root: String,
    /// `R` in spec.md §4.5 stage 5.
    pub max_refinement_attempts: u32,
}
