//! The `Job` entity and its legal state transitions (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{JobId, PipelineRunId, TemplateId};

/// Identifies which target a scan should run templates against, and which
/// templates to select. Modeled as a tagged enum per spec.md §9's resolution
/// of the "`full_audit` vs explicit list" ambiguity in the source system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TemplateSelector {
    /// Run the full template corpus shipped with the scanner image.
    All,
    /// Run only the named template directories (e.g. `["http/", "cves/"]`).
    Dirs(Vec<String>),
    /// Run a single user-supplied template body.
    File(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanPayload {
    /// Client-supplied correlation id. Distinct from `Job::container_name`
    /// (spec.md §9 open question): this is caller-chosen and opaque to us,
    /// the container name is scheduler-allocated and runtime-unique.
    pub scan_id: String,
    pub target: String,
    pub template_selector: TemplateSelector,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomScanPayload {
    pub target: String,
    pub template_body: Vec<u8>,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiScanPayload {
    pub target: String,
    pub nl_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchCvesPayload {
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateTemplatePayload {
    pub cve_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreTemplatesPayload {
    pub template_ids: Vec<TemplateId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateTemplatePayload {
    pub template_id: TemplateId,
    pub reference_target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefineTemplatePayload {
    pub template_id: TemplateId,
    pub failure_diagnostic: String,
    pub refinement_attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRootPayload {
    pub filters: Option<String>,
}

/// Tagged dispatch on `kind`, each variant carrying its own payload schema
/// (spec.md §9: avoid inheritance hierarchies for handler lookup).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobKind {
    Scan(ScanPayload),
    CustomScan(CustomScanPayload),
    AiScan(AiScanPayload),
    FetchCves(FetchCvesPayload),
    GenerateTemplate(GenerateTemplatePayload),
    StoreTemplates(StoreTemplatesPayload),
    ValidateTemplate(ValidateTemplatePayload),
    RefineTemplate(RefineTemplatePayload),
    PipelineRoot(PipelineRootPayload),
}

impl JobKind {
    #[must_use]
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::Scan(_) | JobKind::CustomScan(_) | JobKind::AiScan(_) => "scans",
            JobKind::FetchCves(_) | JobKind::PipelineRoot(_) => "pipeline",
            JobKind::GenerateTemplate(_) | JobKind::StoreTemplates(_) => "generate",
            JobKind::ValidateTemplate(_) => "validate",
            JobKind::RefineTemplate(_) => "refine",
        }
    }

    #[must_use]
    pub fn default_max_attempts(&self) -> u32 {
        match self {
            JobKind::Scan(_) | JobKind::CustomScan(_) | JobKind::AiScan(_) => 1,
            JobKind::GenerateTemplate(_) => 3,
            JobKind::ValidateTemplate(_) => 1,
            JobKind::RefineTemplate(_) => 3,
            JobKind::FetchCves(_) | JobKind::StoreTemplates(_) | JobKind::PipelineRoot(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failure,
    Retrying,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Cancelled)
    }

    /// Legal transition table (spec.md §3: monotonic except `retrying -> running`).
    ///
    /// `Queued -> Failure` covers a task failing before it ever reaches
    /// `running` (launch-time errors: image missing, resources exhausted,
    /// container name allocation exhausted) — still a forward move from the
    /// start state to a terminal one, so it doesn't violate monotonicity.
    #[must_use]
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::{Cancelled, Failure, Queued, Retrying, Running, Success};
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failure)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Cancelled)
                | (Failure, Retrying)
                | (Retrying, Queued)
                | (Retrying, Running)
                | (Retrying, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub parent_id: Option<JobId>,
    pub pipeline_run_id: Option<PipelineRunId>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub container_name: Option<String>,
    /// Id of the worker currently holding this job, set when it transitions
    /// to `running`. Used to detect `WorkerLost` on registry startup.
    pub owner_worker_id: Option<String>,
}

impl Job {
    #[must_use]
    pub fn new(kind: JobKind, parent_id: Option<JobId>) -> Self {
        let max_attempts = kind.default_max_attempts();
        Self {
            id: JobId::new(),
            kind,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            parent_id,
            pipeline_run_id: None,
            attempt: 1,
            max_attempts,
            result: None,
            error: None,
            container_name: None,
            owner_worker_id: None,
        }
    }

    /// Attempt a state transition, enforcing the legal-transition table and
    /// the `finished_at`-iff-terminal invariant (spec.md §8 invariant 1).
    ///
    /// # Errors
    /// Returns [`CoreError::IllegalTransition`] without mutating `self` if
    /// the transition is not legal from the current state.
    pub fn transition(&mut self, to: JobState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::IllegalTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }

        let now = Utc::now();
        match to {
            JobState::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            JobState::Success | JobState::Failure | JobState::Cancelled => {
                self.finished_at = Some(now);
            }
            JobState::Queued | JobState::Retrying => {}
        }

        self.state = to;
        Ok(())
    }
}
