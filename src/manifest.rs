//! The ecosystem manifest: the persistent, human-edited inventory of every
//! package in the fleet (spec §3, §6).

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::{FleetError, Result};

pub const MANIFEST_RELATIVE_PATH: &str = "ecosystem/ecosystem.manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub repo: String,
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectTemplate {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dirs: Vec<String>,
}

impl ProjectTemplate {
    /// A sensible default used by `new`/`audit` when the manifest doesn't
    /// declare one (spec §4.8 "New").
    pub fn default_template() -> Self {
        ProjectTemplate {
            files: vec!["package.json".to_string(), "src/index.ts".to_string()],
            dirs: vec!["src".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub root: String,
    pub packages: BTreeMap<String, ManifestEntry>,
    #[serde(default)]
    pub project_template: ProjectTemplate,
}

impl Manifest {
    /// Expand a leading `~` in `root` against the user's home directory, the
    /// way the teacher resolves filesystem paths via `camino::Utf8PathBuf`.
    pub fn resolved_root(&self) -> Result<Utf8PathBuf> {
        expand_home(&self.root)
    }

    pub fn package_path(&self, entry: &ManifestEntry) -> Result<Utf8PathBuf> {
        Ok(self.resolved_root()?.join(&entry.path))
    }
}

pub fn expand_home(path: &str) -> Result<Utf8PathBuf> {
    if let Some(rest) = path.strip_prefix('~') {
        let home = directories::UserDirs::new()
            .ok_or_else(|| FleetError::Other(anyhow::anyhow!("could not determine home directory")))?
            .home_dir()
            .to_path_buf();
        let home = Utf8PathBuf::from_path_buf(home)
            .map_err(|p| FleetError::Other(anyhow::anyhow!("home directory {p:?} is not UTF-8")))?;
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        Ok(home.join(rest))
    } else {
        Ok(Utf8PathBuf::from(path))
    }
}

pub fn manifest_path(root: &Utf8Path) -> Utf8PathBuf {
    root.join(MANIFEST_RELATIVE_PATH)
}

pub async fn read(root: &Utf8Path) -> Result<Manifest> {
    let path = manifest_path(root);
    let contents = fs::read_to_string(&path)
        .await
        .map_err(|_| FleetError::ManifestMissing(path.clone()))?;
    serde_json::from_str(&contents).map_err(|e| FleetError::ManifestInvalid {
        path,
        cause: e.to_string(),
    })
}

/// Read-modify-write, atomically: write to a sibling temp file, then rename
/// over the target (spec §5, "Writers MUST read-modify-write atomically").
pub async fn write(root: &Utf8Path, manifest: &Manifest) -> Result<()> {
    let path = manifest_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("json.tmp-{}", Uuid::new_v4()));
    let contents = serde_json::to_string_pretty(manifest)?;
    fs::write(&tmp_path, contents).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_manifest(root: &str) -> Manifest {
        let mut packages = BTreeMap::new();
        packages.insert(
            "widgets".to_string(),
            ManifestEntry {
                repo: "github:ecosystem/widgets#main".to_string(),
                path: Utf8PathBuf::from("widgets"),
            },
        );
        Manifest {
            version: "1.0".to_string(),
            root: root.to_string(),
            packages,
            project_template: ProjectTemplate::default_template(),
        }
    }

    #[tokio::test]
    async fn round_trips_through_write_and_read() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let manifest = sample_manifest(root.as_str());

        write(&root, &manifest).await.unwrap();
        let read_back = read(&root).await.unwrap();

        assert_eq!(read_back.version, manifest.version);
        assert_eq!(read_back.packages.len(), 1);
        assert!(read_back.packages.contains_key("widgets"));
    }

    #[tokio::test]
    async fn missing_manifest_is_a_typed_error() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let result = read(&root).await;
        assert!(matches!(result, Err(FleetError::ManifestMissing(_))));
    }

    #[test]
    fn expands_home_sentinel() {
        let expanded = expand_home("~/ecosystems/main").unwrap();
        assert!(!expanded.as_str().starts_with('~'));
        assert!(expanded.as_str().ends_with("ecosystems/main"));
    }
}
