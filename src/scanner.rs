//! Scanner (C5): turns the persistent manifest into fresh [`PackageDescriptor`]s
//! by reading each package's `package.json` and probing its git state. Manifest
//! driven only — no directory walking (spec §4.5, §9 Open Question 1).

use camino::Utf8Path;
use serde_json::Value;

use crate::error::Result;
use crate::git_ref::is_internal_ref;
use crate::manifest::{self, Manifest};
use crate::package::PackageDescriptor;
use crate::ports::{FsPort, GitPort};

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub descriptors: Vec<PackageDescriptor>,
    pub warnings: Vec<String>,
}

/// Read the manifest at `root` and scan every listed package. Missing
/// directories, missing/unparseable `package.json`, and missing `.git`
/// metadata are all warn-and-skip (or warn-and-degrade) conditions, never
/// hard failures — only a missing/invalid manifest itself is fatal.
pub async fn scan(root: &Utf8Path, fs: &dyn FsPort, git: &dyn GitPort) -> Result<ScanResult> {
    let manifest = manifest::read(root).await?;
    scan_with_manifest(&manifest, fs, git).await
}

pub async fn scan_with_manifest(
    manifest: &Manifest,
    fs: &dyn FsPort,
    git: &dyn GitPort,
) -> Result<ScanResult> {
    let mut result = ScanResult::default();

    for (name, entry) in &manifest.packages {
        let path = match manifest.package_path(entry) {
            Ok(path) => path,
            Err(e) => {
                result
                    .warnings
                    .push(format!("package {name}: could not resolve path: {e}"));
                continue;
            }
        };

        if !fs.exists(&path).await {
            result
                .warnings
                .push(format!("package {name}: directory {path} does not exist, skipping"));
            continue;
        }

        let package_json_path = path.join("package.json");
        if !fs.exists(&package_json_path).await {
            result.warnings.push(format!(
                "package {name}: no package.json at {package_json_path}, skipping"
            ));
            continue;
        }

        let package_json = match fs.read_json(&package_json_path).await {
            Ok(value) => value,
            Err(e) => {
                result.warnings.push(format!(
                    "package {name}: package.json at {package_json_path} is unparseable: {e}, skipping"
                ));
                continue;
            }
        };

        let declared_name = package_json
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());

        let internal_deps = collect_internal_deps(&package_json);

        let git_dir = path.join(".git");
        let (current_branch, git_remote) = if fs.exists(&git_dir).await {
            probe_git(&path, git, &mut result.warnings, &declared_name).await
        } else {
            result.warnings.push(format!(
                "package {declared_name}: no .git directory at {path}, scanning without branch/remote"
            ));
            (None, None)
        };

        result.descriptors.push(PackageDescriptor {
            name: declared_name,
            repo_path: path,
            git_remote,
            current_branch,
            internal_deps,
        });
    }

    Ok(result)
}

async fn probe_git(
    path: &Utf8Path,
    git: &dyn GitPort,
    warnings: &mut Vec<String>,
    name: &str,
) -> (Option<String>, Option<String>) {
    let branch = match git.status(path).await {
        Ok(status) => Some(status.branch),
        Err(e) => {
            warnings.push(format!("package {name}: could not read git status: {e}"));
            None
        }
    };

    let remote = match git.remote(path, "origin").await {
        Ok(url) => url,
        Err(e) => {
            warnings.push(format!("package {name}: could not read git remote: {e}"));
            None
        }
    };

    (branch, remote)
}

/// Dependency keys from `dependencies` and `devDependencies` whose version
/// string is an ecosystem-internal git ref (spec §4.5, §6).
fn collect_internal_deps(package_json: &Value) -> Vec<String> {
    let mut deps = Vec::new();
    for field in ["dependencies", "devDependencies"] {
        let Some(map) = package_json.get(field).and_then(Value::as_object) else {
            continue;
        };
        for (dep_name, version) in map {
            if let Some(version) = version.as_str() {
                if is_internal_ref(version) {
                    deps.push(dep_name.clone());
                }
            }
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::ports::{GitPullResult, GitStatus, MockFsPort, MockGitPort};
    use camino::Utf8PathBuf;
    use std::collections::BTreeMap;

    fn manifest_with_one_package() -> Manifest {
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
            root: "/ecosystems/main".to_string(),
            packages,
            project_template: Default::default(),
        }
    }

    #[tokio::test]
    async fn skips_missing_directory_with_warning() {
        let manifest = manifest_with_one_package();
        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|_| false);
        let git = MockGitPort::new();

        let result = scan_with_manifest(&manifest, &fs, &git).await.unwrap();
        assert!(result.descriptors.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("does not exist"));
    }

    #[tokio::test]
    async fn extracts_internal_deps_and_degrades_without_git() {
        let manifest = manifest_with_one_package();
        let mut fs = MockFsPort::new();
        fs.expect_exists()
            .withf(|p: &Utf8Path| p.as_str().ends_with(".git"))
            .returning(|_| false);
        fs.expect_exists().returning(|_| true);
        fs.expect_read_json().returning(|_| {
            Ok(serde_json::json!({
                "name": "widgets",
                "dependencies": {
                    "left-pad": "^1.0.0",
                    "other-widget": "github:ecosystem/other-widget#main"
                }
            }))
        });
        let git = MockGitPort::new();

        let result = scan_with_manifest(&manifest, &fs, &git).await.unwrap();
        assert_eq!(result.descriptors.len(), 1);
        let descriptor = &result.descriptors[0];
        assert_eq!(descriptor.name, "widgets");
        assert_eq!(descriptor.internal_deps, vec!["other-widget".to_string()]);
        assert!(descriptor.current_branch.is_none());
        assert!(descriptor.git_remote.is_none());
        assert!(result.warnings.iter().any(|w| w.contains("no .git directory")));
    }

    #[tokio::test]
    async fn probes_branch_and_remote_when_git_present() {
        let manifest = manifest_with_one_package();
        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_read_json()
            .returning(|_| Ok(serde_json::json!({"name": "widgets"})));
        let mut git = MockGitPort::new();
        git.expect_status().returning(|_| {
            Ok(GitStatus {
                branch: "main".to_string(),
                ahead: 0,
                behind: 0,
                files: vec![],
                clean: true,
            })
        });
        git.expect_remote()
            .returning(|_, _| Ok(Some("git@github.com:ecosystem/widgets.git".to_string())));

        let result = scan_with_manifest(&manifest, &fs, &git).await.unwrap();
        let descriptor = &result.descriptors[0];
        assert_eq!(descriptor.current_branch.as_deref(), Some("main"));
        assert_eq!(
            descriptor.git_remote.as_deref(),
            Some("git@github.com:ecosystem/widgets.git")
        );
        let _ = GitPullResult {
            commits: 0,
            fast_forward: false,
        };
    }
}
