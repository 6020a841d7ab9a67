//! Detection templates consumed by the scanner (spec.md §3).

use serde::{Deserialize, Serialize};

use crate::ids::TemplateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateOrigin {
    Curated,
    AiGenerated,
    AiRefined,
    UserUploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Unvalidated,
    Validating,
    Valid,
    InvalidMaxRetries,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: TemplateId,
    pub cve_id: Option<String>,
    pub filename: String,
    pub body: String,
    pub origin: TemplateOrigin,
    pub generation_attempt: u32,
    pub validation_state: ValidationState,
}

/// The minimal required structure of a template body, used both to validate
/// LLM-generated templates (spec.md §4.5 stage 2) and user uploads.
#[derive(Debug, Deserialize)]
pub struct TemplateDocument {
    pub id: String,
    pub info: TemplateInfo,
    #[serde(default)]
    pub requests: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub http: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub network: Vec<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub severity: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateValidationError {
    #[error("template body is not well-formed YAML: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("template is missing a request/http/network block")]
    NoRequestBlocks,

    #[error("template id '{actual}' does not match expected CVE id '{expected}'")]
    IdMismatch { expected: String, actual: String },
}

impl Template {
    /// Parse and validate a template body, optionally checking that its
    /// declared `id` matches an expected CVE id (spec.md §4.5 stage 2).
    ///
    /// # Errors
    /// Returns [`TemplateValidationError`] if the body isn't well-formed
    /// YAML, required fields are missing, or the id doesn't match.
    pub fn parse_and_validate(
        body: &str,
        expected_cve_id: Option<&str>,
    ) -> Result<TemplateDocument, TemplateValidationError> {
        let doc: TemplateDocument = serde_yaml::from_str(body)?;

        if doc.requests.is_empty() && doc.http.is_empty() && doc.network.is_empty() {
            return Err(TemplateValidationError::NoRequestBlocks);
        }

        if let Some(expected) = expected_cve_id {
            if !doc.id.eq_ignore_ascii_case(expected) {
                return Err(TemplateValidationError::IdMismatch {
                    expected: expected.to_string(),
                    actual: doc.id,
                });
            }
        }

        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
id: CVE-2024-0001
info:
  name: Example detector
  severity: high
http:
  - method: GET
    path:
      - "{{BaseURL}}/"
"#;

    #[test]
    fn valid_template_parses() {
        let doc = Template::parse_and_validate(VALID, Some("CVE-2024-0001")).unwrap();
        assert_eq!(doc.info.severity, "high");
    }

    #[test]
    fn id_mismatch_is_rejected() {
        let err = Template::parse_and_validate(VALID, Some("CVE-2024-9999")).unwrap_err();
        assert!(matches!(err, TemplateValidationError::IdMismatch { .. }));
    }

    #[test]
    fn missing_request_blocks_is_rejected() {
        let body = "id: CVE-2024-0001\ninfo:\n  name: x\n  severity: low\n";
        let err = Template::parse_and_validate(body, None).unwrap_err();
        assert!(matches!(err, TemplateValidationError::NoRequestBlocks));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = Template::parse_and_validate("not: [valid yaml", None).unwrap_err();
        assert!(matches!(err, TemplateValidationError::Malformed(_)));
    }
}
