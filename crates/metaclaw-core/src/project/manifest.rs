//! The template manifest: which files MetaClaw manages across upgrades.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ProjectError;

/// Manifest file name inside a template directory.
pub const MANIFEST_FILENAME: &str = "metaclaw.template.json";

/// Template manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateManifest {
    /// Always 1.
    #[serde(default)]
    pub schema_version: u32,
    /// Template identifier recorded into the project lock.
    pub id: String,
    /// Glob patterns for files upgrades may overwrite.
    pub managed: Vec<String>,
    /// Glob patterns for user-owned files upgrades must never touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user: Vec<String>,
}

/// Loads and validates the manifest of a template directory.
///
/// # Errors
///
/// Missing file, decode, schema-version, and emptiness errors.
pub fn load_manifest(template_dir: &Path) -> Result<TemplateManifest, ProjectError> {
    let path = template_dir.join(MANIFEST_FILENAME);
    let bytes = fs::read(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProjectError::ManifestMissing(path.display().to_string())
        } else {
            ProjectError::Io {
                path: path.display().to_string(),
                source,
            }
        }
    })?;
    let mut manifest: TemplateManifest =
        serde_json::from_slice(&bytes).map_err(|source| ProjectError::ManifestParse {
            path: path.display().to_string(),
            source,
        })?;
    if manifest.schema_version == 0 {
        manifest.schema_version = 1;
    }
    if manifest.schema_version != 1 {
        return Err(ProjectError::ManifestSchemaVersion(manifest.schema_version));
    }
    if manifest.id.is_empty() {
        return Err(ProjectError::ManifestIdRequired(path.display().to_string()));
    }
    if manifest.managed.is_empty() {
        return Err(ProjectError::ManifestManagedEmpty(
            path.display().to_string(),
        ));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILENAME),
            r#"{"id": "starter", "managed": ["README.md", "bot/**"]}"#,
        )
        .unwrap();
        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.id, "starter");
        assert_eq!(manifest.schema_version, 1);
        assert_eq!(manifest.managed.len(), 2);
    }

    #[test]
    fn missing_manifest_is_its_own_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ProjectError::ManifestMissing(_))
        ));
    }

    #[test]
    fn empty_managed_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILENAME),
            r#"{"id": "starter", "managed": []}"#,
        )
        .unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ProjectError::ManifestManagedEmpty(_))
        ));
    }
}
