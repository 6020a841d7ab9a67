//! In-memory `(template_id -> path, validation_state)` index, rebuilt from
//! the filesystem at startup and kept consistent with writes (spec.md §5,
//! §9 "Template library concurrency").

use std::path::{Path, PathBuf};

use scan_core::{TemplateId, TemplateOrigin, ValidationState};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub template_id: TemplateId,
    pub path: PathBuf,
    pub cve_id: Option<String>,
    pub origin: TemplateOrigin,
    pub generation_attempt: u32,
    pub validation_state: ValidationState,
}

/// Classify a path under `root` into the entry it represents, or `None` if
/// it doesn't match the library's layout (spec.md §6 "Persisted state
/// layout").
fn classify(root: &Path, path: &Path) -> Option<IndexEntry> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?.as_os_str().to_str()?.to_string();
    let rest: PathBuf = components.as_path().to_path_buf();

    if first == "ai" {
        let stem = rest.file_stem()?.to_str()?;
        if let Some((cve_id, n)) = stem.split_once(".r") {
            let generation_attempt: u32 = n.parse().ok()?;
            return Some(IndexEntry {
                template_id: TemplateId::from_cve(cve_id),
                path: path.to_path_buf(),
                cve_id: Some(cve_id.to_string()),
                origin: TemplateOrigin::AiRefined,
                generation_attempt,
                validation_state: ValidationState::Unvalidated,
            });
        }
        return Some(IndexEntry {
            template_id: TemplateId::from_cve(stem),
            path: path.to_path_buf(),
            cve_id: Some(stem.to_string()),
            origin: TemplateOrigin::AiGenerated,
            generation_attempt: 1,
            validation_state: ValidationState::Unvalidated,
        });
    }

    if first == "uploaded" {
        let stem = rest.file_stem()?.to_str()?.to_string();
        return Some(IndexEntry {
            template_id: TemplateId::from_raw(stem),
            path: path.to_path_buf(),
            cve_id: None,
            origin: TemplateOrigin::UserUploaded,
            generation_attempt: 1,
            validation_state: ValidationState::Unvalidated,
        });
    }

    // Curated: `{category}/{name}.yaml`. template_id is derived from content
    // at insertion time by the caller, so the walker here only stages the
    // path; the caller re-derives the id once it has read the body.
    None
}

/// Walk `root` recursively and return every file the layout recognizes as a
/// generated or uploaded template, plus the raw paths of curated templates
/// (whose id must be derived from content, read by the caller).
pub async fn walk(root: &Path) -> std::io::Result<(Vec<IndexEntry>, Vec<PathBuf>)> {
    let mut entries = Vec::new();
    let mut curated_paths = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match classify(root, &path) {
                Some(entry) => entries.push(entry),
                None => curated_paths.push(path),
            }
        }
    }

    Ok((entries, curated_paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ai_generated_path() {
        let root = Path::new("/lib");
        let entry = classify(root, Path::new("/lib/ai/CVE-2024-0001.yaml")).unwrap();
        assert_eq!(entry.origin, TemplateOrigin::AiGenerated);
        assert_eq!(entry.cve_id.as_deref(), Some("CVE-2024-0001"));
        assert_eq!(entry.generation_attempt, 1);
    }

    #[test]
    fn classifies_ai_refined_path_with_attempt_number() {
        let root = Path::new("/lib");
        let entry = classify(root, Path::new("/lib/ai/CVE-2024-0001.r2.yaml")).unwrap();
        assert_eq!(entry.origin, TemplateOrigin::AiRefined);
        assert_eq!(entry.generation_attempt, 2);
    }

    #[test]
    fn classifies_uploaded_path() {
        let root = Path::new("/lib");
        let entry = classify(root, Path::new("/lib/uploaded/abc123.yaml")).unwrap();
        assert_eq!(entry.origin, TemplateOrigin::UserUploaded);
    }

    #[test]
    fn curated_paths_are_not_classified_here() {
        let root = Path::new("/lib");
        assert!(classify(root, Path::new("/lib/http/cves/example.yaml")).is_none());
    }
}
