//! Shared domain types and error taxonomy for the scan orchestration core.
//!
//! This crate has no I/O dependencies: it defines the entities every other
//! crate in the workspace passes around (`Job`, `Template`, `ScanFinding`,
//! `CveRecord`, `PipelineRun`) plus the `CoreError` taxonomy they all return.

pub mod cve;
pub mod error;
pub mod finding;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod template;

pub use cve::{CveRecord, CveValidationError};
pub use error::{CoreError, CoreResult};
pub use finding::{ScanFinding, Severity};
pub use ids::{FindingId, JobId, PipelineRunId, TemplateId};
pub use job::{
    AiScanPayload, CustomScanPayload, FetchCvesPayload, GenerateTemplatePayload, Job, JobKind,
    JobState, PipelineRootPayload, RefineTemplatePayload, ScanPayload, StoreTemplatesPayload,
    TemplateSelector, ValidateTemplatePayload,
};
pub use pipeline::{PipelineMetrics, PipelineRun, TriggerKind};
pub use template::{
    Template, TemplateDocument, TemplateInfo, TemplateOrigin, TemplateValidationError,
    ValidationState,
};
