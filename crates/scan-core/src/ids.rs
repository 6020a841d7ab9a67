//! Opaque, URL-safe identifiers for the entities tracked by the core.
//!
//! Each id is a distinct newtype around a UUID so call sites can't transpose
//! a `JobId` for a `TemplateId` by accident — the compiler catches it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(JobId);
uuid_id!(PipelineRunId);

impl PipelineRunId {
    /// Derive a run id from a trigger idempotency key so calling
    /// `TriggerPipeline` twice with the same key yields the same run id
    /// (spec.md §4.5 Idempotency).
    #[must_use]
    pub fn from_trigger_key(key: &str) -> Self {
        let hash = blake3::hash(key.as_bytes());
        let bytes: [u8; 16] = hash.as_bytes()[..16].try_into().expect("blake3 hash is at least 16 bytes");
        Self(Uuid::from_bytes(bytes))
    }
}

/// `TemplateId` is not always a random UUID — user-uploaded templates derive
/// it from content so re-uploading the same body is idempotent (spec.md §8).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(String);

impl TemplateId {
    #[must_use]
    pub fn from_content(body: &[u8]) -> Self {
        Self(blake3::hash(body).to_hex().to_string())
    }

    #[must_use]
    pub fn from_cve(cve_id: &str) -> Self {
        Self(cve_id.to_string())
    }

    /// Reconstruct an id from its stable string form (e.g. a filename stem
    /// read back from the template library index).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `FindingId` is derived deterministically so replaying the same log
/// produces the same id (spec.md §3 / §8 invariant 3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FindingId(String);

impl FindingId {
    #[must_use]
    pub fn derive(template_id: &str, protocol: &str, severity: &str, target: &str, matched_at: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(template_id.as_bytes());
        hasher.update(b"|");
        hasher.update(protocol.as_bytes());
        hasher.update(b"|");
        hasher.update(severity.as_bytes());
        hasher.update(b"|");
        hasher.update(target.as_bytes());
        hasher.update(b"|");
        hasher.update(matched_at.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
