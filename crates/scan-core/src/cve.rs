//! CVE records ingested from the external feed (spec.md §3, §4.5 stage 1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CveRecord {
    pub cve_id: String,
    pub published_at: DateTime<Utc>,
    pub description: String,
    pub references: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CveValidationError {
    #[error("CVE id must start with 'CVE-', got '{0}'")]
    BadIdPrefix(String),

    #[error("CVE description cannot be empty")]
    EmptyDescription,
}

impl CveRecord {
    /// Validate a CVE record pulled from the feed before it enters the
    /// dedup/generation pipeline.
    ///
    /// # Errors
    /// Returns [`CveValidationError`] if the id doesn't carry the `CVE-`
    /// prefix or the description is empty.
    pub fn validate(&self) -> Result<(), CveValidationError> {
        if !self.cve_id.starts_with("CVE-") {
            return Err(CveValidationError::BadIdPrefix(self.cve_id.clone()));
        }
        if self.description.trim().is_empty() {
            return Err(CveValidationError::EmptyDescription);
        }
        Ok(())
    }

    #[must_use]
    pub fn kv_key(&self) -> String {
        format!("cve:{}", self.cve_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, desc: &str) -> CveRecord {
        CveRecord {
            cve_id: id.to_string(),
            published_at: Utc::now(),
            description: desc.to_string(),
            references: vec![],
        }
    }

    #[test]
    fn rejects_missing_cve_prefix() {
        let err = sample("2024-0001", "desc").validate().unwrap_err();
        assert_eq!(err, CveValidationError::BadIdPrefix("2024-0001".into()));
    }

    #[test]
    fn rejects_empty_description() {
        let err = sample("CVE-2024-0001", "   ").validate().unwrap_err();
        assert_eq!(err, CveValidationError::EmptyDescription);
    }

    #[test]
    fn accepts_well_formed_record() {
        assert!(sample("CVE-2024-0001", "a real description").validate().is_ok());
    }

    #[test]
    fn kv_key_is_namespaced() {
        assert_eq!(sample("CVE-2024-0001", "d").kv_key(), "cve:CVE-2024-0001");
    }
}
