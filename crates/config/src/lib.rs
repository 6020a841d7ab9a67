//! Runtime settings for the scan orchestration core.
//!
//! Every field is overridable by an environment variable of the same name
//! (via clap's `env` attribute) so the service can be configured identically
//! whether launched from a shell or a container orchestrator, with CLI flags
//! taking precedence for local runs.

use std::path::PathBuf;

use clap::Parser;

/// Per-queue worker concurrency (spec.md §5: bounded by queue, not global).
#[derive(Debug, Clone, Parser)]
pub struct QueueConcurrency {
    #[arg(long, env = "SCAN_QUEUE_CONCURRENCY", default_value_t = 2)]
    pub scans: usize,

    #[arg(long, env = "PIPELINE_QUEUE_CONCURRENCY", default_value_t = 1)]
    pub pipeline: usize,

    #[arg(long, env = "GENERATE_QUEUE_CONCURRENCY", default_value_t = 4)]
    pub generate: usize,

    #[arg(long, env = "VALIDATE_QUEUE_CONCURRENCY", default_value_t = 2)]
    pub validate: usize,

    #[arg(long, env = "REFINE_QUEUE_CONCURRENCY", default_value_t = 2)]
    pub refine: usize,
}

impl Default for QueueConcurrency {
    fn default() -> Self {
        Self {
            scans: 2,
            pipeline: 1,
            generate: 4,
            validate: 2,
            refine: 2,
        }
    }
}

/// Top-level settings for the orchestration service.
#[derive(Debug, Clone, Parser)]
#[command(name = "scan-orchestrator")]
#[command(about = "Automated vulnerability-scan orchestration core")]
#[command(version)]
pub struct Settings {
    /// Redis connection string backing the job registry and KV store.
    #[arg(long, env = "KV_URL", default_value = "redis://127.0.0.1:6379")]
    pub kv_url: String,

    /// Docker Engine API endpoint used to launch scan containers.
    #[arg(
        long,
        env = "CONTAINER_RUNTIME_ENDPOINT",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub container_runtime_endpoint: String,

    /// Image reference for scan containers.
    #[arg(long, env = "SCAN_IMAGE", default_value = "projectdiscovery/nuclei:latest")]
    pub scan_image: String,

    /// Base URL of the LLM endpoint used for template generation/refinement.
    #[arg(long, env = "LLM_ENDPOINT")]
    pub llm_endpoint: String,

    /// API key for the LLM endpoint. Never logged.
    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: String,

    /// Model identifier sent with every generate/refine completion request.
    #[arg(long, env = "LLM_MODEL", default_value = "claude-3-5-sonnet-20241022")]
    pub llm_model: String,

    /// Base URL of the external CVE feed polled by the synthesis pipeline.
    #[arg(long, env = "CVE_FEED_ENDPOINT")]
    pub cve_feed_endpoint: String,

    /// Root directory the template library persists curated and
    /// AI-generated templates under (spec.md §6).
    #[arg(long, env = "TEMPLATE_LIBRARY_ROOT", default_value = "/var/lib/scan-orchestrator/templates")]
    pub template_library_root: PathBuf,

    /// Sandboxed targets the validation stage is permitted to probe with a
    /// freshly generated template (spec.md §4.5 stage 3). Comma-separated.
    #[arg(long, env = "REFERENCE_TARGETS", value_delimiter = ',')]
    pub reference_targets: Vec<String>,

    /// Maximum refinement attempts before a template is marked
    /// `invalid_max_retries` (spec.md §4.5 stage 4, R in the spec's notation).
    #[arg(long, env = "MAX_REFINEMENT_ATTEMPTS", default_value_t = 3)]
    pub max_refinement_attempts: u32,

    /// Cap on buffered scan-log bytes per job before the oldest pages are
    /// evicted (spec.md §4.3 ring buffer).
    #[arg(long, env = "SCAN_LOG_CAP_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub scan_log_cap_bytes: usize,

    #[command(flatten)]
    pub queue_concurrency: QueueConcurrency,

    /// `tracing_subscriber::EnvFilter` directive string.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Settings {
    /// Parse settings from CLI args and environment, per clap's normal
    /// precedence (explicit flag wins over `env`, `env` wins over default).
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }

    /// Validate cross-field invariants that clap's attributes can't express
    /// on their own.
    ///
    /// # Errors
    /// Returns [`SettingsError`] if a required endpoint is empty or the
    /// reference-target allowlist is empty (the validation stage would have
    /// nothing to validate against).
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.llm_endpoint.trim().is_empty() {
            return Err(SettingsError::MissingField("llm_endpoint"));
        }
        if self.cve_feed_endpoint.trim().is_empty() {
            return Err(SettingsError::MissingField("cve_feed_endpoint"));
        }
        if self.reference_targets.is_empty() {
            return Err(SettingsError::EmptyReferenceTargets);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("required setting '{0}' is empty")]
    MissingField(&'static str),

    #[error("reference_targets must list at least one sandboxed validation target")]
    EmptyReferenceTargets,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            kv_url: "redis://127.0.0.1:6379".into(),
            container_runtime_endpoint: "unix:///var/run/docker.sock".into(),
            scan_image: "projectdiscovery/nuclei:latest".into(),
            llm_endpoint: "https://llm.internal".into(),
            llm_api_key: "secret".into(),
            llm_model: "claude-3-5-sonnet-20241022".into(),
            cve_feed_endpoint: "https://cve.internal".into(),
            template_library_root: "/tmp/templates".into(),
            reference_targets: vec!["https://sandbox.internal".into()],
            max_refinement_attempts: 3,
            scan_log_cap_bytes: 8 * 1024 * 1024,
            queue_concurrency: QueueConcurrency::default(),
            log_filter: "info".into(),
            log_json: false,
        }
    }

    #[test]
    fn well_formed_settings_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn missing_llm_endpoint_is_rejected() {
        let mut s = base();
        s.llm_endpoint.clear();
        assert_eq!(s.validate().unwrap_err(), SettingsError::MissingField("llm_endpoint"));
    }

    #[test]
    fn empty_reference_targets_is_rejected() {
        let mut s = base();
        s.reference_targets.clear();
        assert_eq!(s.validate().unwrap_err(), SettingsError::EmptyReferenceTargets);
    }
}
