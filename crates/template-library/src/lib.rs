//! Template Library: filesystem-backed storage for curated, AI-generated,
//! and user-uploaded Nuclei templates (spec.md §4.5 stage 3, §6, §9).
//!
//! Writers use write-to-temp + rename so readers never observe a partial
//! write (grounded on the file-backed storage layer's directory-plus-file
//! layout, generalized from a single JSON document to many small YAML
//! files under a path convention).

mod index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use scan_core::{CoreError, CoreResult, Template, TemplateId, TemplateOrigin, ValidationState};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{info, warn};

use index::IndexEntry;
pub use index::IndexEntry as TemplateIndexEntry;

pub struct TemplateLibrary {
    root: PathBuf,
    index: RwLock<HashMap<TemplateId, IndexEntry>>,
}

impl TemplateLibrary {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), index: RwLock::new(HashMap::new()) }
    }

    fn ai_dir(&self) -> PathBuf {
        self.root.join("ai")
    }

    fn uploaded_dir(&self) -> PathBuf {
        self.root.join("uploaded")
    }

    /// Rebuild the in-memory index from the filesystem. Call once at
    /// startup before serving any library reads.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidOutput`] if the library root can't be
    /// walked.
    pub async fn rebuild_index(&self) -> CoreResult<usize> {
        fs::create_dir_all(&self.root).await.map_err(|e| CoreError::InvalidOutput(e.to_string()))?;

        let (mut entries, curated_paths) =
            index::walk(&self.root).await.map_err(|e| CoreError::InvalidOutput(e.to_string()))?;

        for path in curated_paths {
            let body = match fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable curated template");
                    continue;
                }
            };
            entries.push(IndexEntry {
                template_id: TemplateId::from_content(&body),
                path,
                cve_id: None,
                origin: TemplateOrigin::Curated,
                generation_attempt: 1,
                validation_state: ValidationState::Unvalidated,
            });
        }

        let count = entries.len();
        let mut index = self.index.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        index.clear();
        for entry in entries {
            index.insert(entry.template_id.clone(), entry);
        }
        info!(count, root = %self.root.display(), "template library index rebuilt");
        Ok(count)
    }

    async fn write_atomic(&self, path: &Path, body: &[u8]) -> CoreResult<()> {
        let parent = path.parent().ok_or_else(|| CoreError::InvalidInput("template path has no parent".into()))?;
        fs::create_dir_all(parent).await.map_err(|e| CoreError::InvalidOutput(e.to_string()))?;

        let parent = parent.to_path_buf();
        let body = body.to_vec();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> CoreResult<()> {
            let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
            std::io::Write::write_all(&mut tmp, &body).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
            tmp.persist(&path).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::InvalidOutput(e.to_string()))??;
        Ok(())
    }

    fn insert_index(&self, entry: IndexEntry) {
        let mut index = self.index.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        index.insert(entry.template_id.clone(), entry);
    }

    /// Store a curated template under `{root}/{category}/{name}.yaml`.
    /// `template_id` is derived from content, so re-storing the same body
    /// is idempotent.
    pub async fn store_curated(&self, category: &str, name: &str, body: &str) -> CoreResult<TemplateId> {
        let path = self.root.join(category).join(format!("{name}.yaml"));
        self.write_atomic(&path, body.as_bytes()).await?;
        let template_id = TemplateId::from_content(body.as_bytes());
        self.insert_index(IndexEntry {
            template_id: template_id.clone(),
            path,
            cve_id: None,
            origin: TemplateOrigin::Curated,
            generation_attempt: 1,
            validation_state: ValidationState::Unvalidated,
        });
        Ok(template_id)
    }

    /// Store an LLM-generated template under `{root}/ai/{cve_id}.yaml`
    /// (spec.md §4.5 stage 3).
    pub async fn store_generated(&self, cve_id: &str, body: &str) -> CoreResult<TemplateId> {
        let path = self.ai_dir().join(format!("{cve_id}.yaml"));
        self.write_atomic(&path, body.as_bytes()).await?;
        let template_id = TemplateId::from_cve(cve_id);
        self.insert_index(IndexEntry {
            template_id: template_id.clone(),
            path,
            cve_id: Some(cve_id.to_string()),
            origin: TemplateOrigin::AiGenerated,
            generation_attempt: 1,
            validation_state: ValidationState::Unvalidated,
        });
        Ok(template_id)
    }

    /// Store a refinement attempt under `{root}/ai/{cve_id}.r{n}.yaml`,
    /// replacing the index entry for the same `template_id` (the CVE's
    /// template identity doesn't change across refinements, only its body
    /// and `generation_attempt`).
    pub async fn store_refined(&self, cve_id: &str, attempt: u32, body: &str) -> CoreResult<TemplateId> {
        let path = self.ai_dir().join(format!("{cve_id}.r{attempt}.yaml"));
        self.write_atomic(&path, body.as_bytes()).await?;
        let template_id = TemplateId::from_cve(cve_id);
        self.insert_index(IndexEntry {
            template_id: template_id.clone(),
            path,
            cve_id: Some(cve_id.to_string()),
            origin: TemplateOrigin::AiRefined,
            generation_attempt: attempt,
            validation_state: ValidationState::Unvalidated,
        });
        Ok(template_id)
    }

    /// Store a user-uploaded template under `{root}/uploaded/{template_id}.yaml`.
    /// Re-uploading the same body yields the same `template_id` and
    /// overwrites the same path (spec.md §8 idempotence law).
    pub async fn store_uploaded(&self, body: &[u8]) -> CoreResult<TemplateId> {
        let template_id = TemplateId::from_content(body);
        let path = self.uploaded_dir().join(format!("{}.yaml", template_id.as_str()));
        self.write_atomic(&path, body).await?;
        self.insert_index(IndexEntry {
            template_id: template_id.clone(),
            path,
            cve_id: None,
            origin: TemplateOrigin::UserUploaded,
            generation_attempt: 1,
            validation_state: ValidationState::Unvalidated,
        });
        Ok(template_id)
    }

    /// Record the outcome of a validation run against a stored template.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `template_id` isn't indexed.
    pub fn set_validation_state(&self, template_id: &TemplateId, state: ValidationState) -> CoreResult<()> {
        let mut index = self.index.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = index
            .get_mut(template_id)
            .ok_or_else(|| CoreError::NotFound(format!("template {template_id}")))?;
        entry.validation_state = state;
        Ok(())
    }

    /// Read a template's body from disk and assemble the full entity.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `template_id` isn't indexed, or
    /// [`CoreError::InvalidOutput`] if the file can't be read.
    pub async fn get(&self, template_id: &TemplateId) -> CoreResult<Template> {
        let entry = {
            let index = self.index.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            index.get(template_id).cloned().ok_or_else(|| CoreError::NotFound(format!("template {template_id}")))?
        };
        let body = fs::read_to_string(&entry.path).await.map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
        let filename = entry.path.file_name().and_then(|f| f.to_str()).unwrap_or_default().to_string();
        Ok(Template {
            template_id: entry.template_id,
            cve_id: entry.cve_id,
            filename,
            body,
            origin: entry.origin,
            generation_attempt: entry.generation_attempt,
            validation_state: entry.validation_state,
        })
    }

    #[must_use]
    pub fn list(&self) -> Vec<IndexEntry> {
        let index = self.index.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        index.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::ValidationState;
    use tempfile::TempDir;

    fn library() -> (TempDir, TemplateLibrary) {
        let dir = TempDir::new().unwrap();
        let lib = TemplateLibrary::new(dir.path());
        (dir, lib)
    }

    #[tokio::test]
    async fn store_and_get_generated_template_round_trips() {
        let (_dir, lib) = library();
        let id = lib.store_generated("CVE-2024-0001", "id: CVE-2024-0001\n").await.unwrap();
        let template = lib.get(&id).await.unwrap();
        assert_eq!(template.origin, TemplateOrigin::AiGenerated);
        assert_eq!(template.body, "id: CVE-2024-0001\n");
    }

    #[tokio::test]
    async fn refinement_keeps_the_same_template_id_and_bumps_attempt() {
        let (_dir, lib) = library();
        let id1 = lib.store_generated("CVE-2024-0001", "id: CVE-2024-0001\nv: 1\n").await.unwrap();
        let id2 = lib.store_refined("CVE-2024-0001", 2, "id: CVE-2024-0001\nv: 2\n").await.unwrap();
        assert_eq!(id1, id2);
        let template = lib.get(&id2).await.unwrap();
        assert_eq!(template.generation_attempt, 2);
        assert_eq!(template.origin, TemplateOrigin::AiRefined);
    }

    #[tokio::test]
    async fn reuploading_identical_body_yields_same_template_id() {
        let (_dir, lib) = library();
        let id1 = lib.store_uploaded(b"id: foo\n").await.unwrap();
        let id2 = lib.store_uploaded(b"id: foo\n").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn rebuild_index_discovers_templates_written_by_a_prior_instance() {
        let dir = TempDir::new().unwrap();
        {
            let lib = TemplateLibrary::new(dir.path());
            lib.store_curated("http", "example", "id: example\n").await.unwrap();
            lib.store_generated("CVE-2024-0002", "id: CVE-2024-0002\n").await.unwrap();
        }

        let lib = TemplateLibrary::new(dir.path());
        let count = lib.rebuild_index().await.unwrap();
        assert_eq!(count, 2);
        assert!(lib.list().iter().any(|e| e.origin == TemplateOrigin::Curated));
        assert!(lib.list().iter().any(|e| e.origin == TemplateOrigin::AiGenerated));
    }

    #[tokio::test]
    async fn set_validation_state_updates_the_index() {
        let (_dir, lib) = library();
        let id = lib.store_generated("CVE-2024-0003", "id: CVE-2024-0003\n").await.unwrap();
        lib.set_validation_state(&id, ValidationState::Valid).unwrap();
        let template = lib.get(&id).await.unwrap();
        assert_eq!(template.validation_state, ValidationState::Valid);
    }

    #[tokio::test]
    async fn set_validation_state_on_unknown_id_is_not_found() {
        let (_dir, lib) = library();
        let err = lib.set_validation_state(&TemplateId::from_cve("CVE-9999-0000"), ValidationState::Valid).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
