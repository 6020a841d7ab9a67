//! Scan findings and severity normalization (spec.md §3, §4.2).

use serde::{Deserialize, Serialize};

use crate::ids::{FindingId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Normalize a scanner-reported severity string (spec.md §4.2).
    ///
    /// `info` maps to `informational`; `low`/`medium`/`high`/`critical` pass
    /// through case-insensitively; anything else normalizes to
    /// `informational` and the caller is told via the returned flag.
    #[must_use]
    pub fn normalize(raw: &str) -> (Self, bool) {
        match raw.to_ascii_lowercase().as_str() {
            "info" | "informational" => (Severity::Informational, false),
            "low" => (Severity::Low, false),
            "medium" => (Severity::Medium, false),
            "high" => (Severity::High, false),
            "critical" => (Severity::Critical, false),
            _ => (Severity::Informational, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFinding {
    pub finding_id: FindingId,
    pub job_id: JobId,
    pub template_id: String,
    pub protocol: String,
    pub severity: Severity,
    pub unknown_severity: bool,
    pub target: String,
    pub matched_at: String,
    pub details: Vec<String>,
}

impl ScanFinding {
    #[must_use]
    pub fn new(
        job_id: JobId,
        template_id: impl Into<String>,
        protocol: impl Into<String>,
        raw_severity: &str,
        target: impl Into<String>,
        matched_at: impl Into<String>,
        details: Vec<String>,
    ) -> Self {
        let template_id = template_id.into();
        let protocol = protocol.into();
        let target = target.into();
        let matched_at = matched_at.into();
        let (severity, unknown_severity) = Severity::normalize(raw_severity);

        let finding_id = FindingId::derive(&template_id, &protocol, raw_severity, &target, &matched_at);

        Self {
            finding_id,
            job_id,
            template_id,
            protocol,
            severity,
            unknown_severity,
            target,
            matched_at,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_normalization_boundary_cases() {
        assert_eq!(Severity::normalize("info"), (Severity::Informational, false));
        assert_eq!(Severity::normalize("critical"), (Severity::Critical, false));
        assert_eq!(Severity::normalize("CRITICAL"), (Severity::Critical, false));
        assert_eq!(Severity::normalize("bogus"), (Severity::Informational, true));
    }

    #[test]
    fn severity_ordering_allows_threshold_comparisons() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Informational < Severity::Low);
    }
}
