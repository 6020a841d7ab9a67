//! Template synthesis pipeline runs and their metrics (spec.md §3, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::PipelineRunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

/// Monotonic counters accumulated over the lifetime of a pipeline run
/// (spec.md §4.5: surfaced via `GetPipelineMetrics`, never decremented).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub templates_generated: u64,
    pub templates_validated: u64,
    pub validations_failed: u64,
    pub refinements_attempted: u64,
    pub refinements_exhausted: u64,
}

impl PipelineMetrics {
    pub fn record_generated(&mut self) {
        self.templates_generated += 1;
    }

    pub fn record_validated(&mut self) {
        self.templates_validated += 1;
    }

    pub fn record_validation_failed(&mut self) {
        self.validations_failed += 1;
    }

    pub fn record_refinement_attempted(&mut self) {
        self.refinements_attempted += 1;
    }

    pub fn record_refinement_exhausted(&mut self) {
        self.refinements_exhausted += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: PipelineRunId,
    pub trigger_kind: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cve_batch: Vec<String>,
    pub metrics: PipelineMetrics,
}

impl PipelineRun {
    #[must_use]
    pub fn new(trigger_kind: TriggerKind, cve_batch: Vec<String>) -> Self {
        Self {
            run_id: PipelineRunId::new(),
            trigger_kind,
            started_at: Utc::now(),
            finished_at: None,
            cve_batch,
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    #[must_use]
    pub fn kv_key(&self) -> String {
        format!("pipeline_run:{}", self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_run_has_zeroed_metrics_and_is_unfinished() {
        let run = PipelineRun::new(TriggerKind::Scheduled, vec!["CVE-2024-0001".into()]);
        assert_eq!(run.metrics, PipelineMetrics::default());
        assert!(!run.is_finished());
    }

    #[test]
    fn metrics_accumulate_monotonically() {
        let mut m = PipelineMetrics::default();
        m.record_generated();
        m.record_validated();
        m.record_refinement_attempted();
        m.record_refinement_exhausted();
        assert_eq!(m.templates_generated, 1);
        assert_eq!(m.templates_validated, 1);
        assert_eq!(m.refinements_attempted, 1);
        assert_eq!(m.refinements_exhausted, 1);
        assert_eq!(m.validations_failed, 0);
    }

    #[test]
    fn finish_sets_finished_at() {
        let mut run = PipelineRun::new(TriggerKind::Manual, vec![]);
        run.finish();
        assert!(run.is_finished());
    }
}
