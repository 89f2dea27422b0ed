//! Rename Engine (C9): renames a package across the manifest, every
//! dependency map that references it, and source-text import specifiers
//! (spec §4.9).
//!
//! Source-text rewriting is the one external contract the distilled spec
//! calls out-of-scope (AST-based refactoring); this implementation stands in
//! a regex-based rewriter rather than a real TypeScript AST edit, since no
//! such parser is part of the dependency stack.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::manifest::{self, Manifest};
use crate::ports::FsPort;

const DEPENDENCY_FIELDS: [&str; 4] = [
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    ManifestEntry,
    PackageJsonName,
    DependencySpecifier { field: String },
    ImportSpecifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub path: Utf8PathBuf,
    pub kind: ChangeKind,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default)]
pub struct RenamePlan {
    pub changes: Vec<ChangeRecord>,
}

impl RenamePlan {
    fn push(&mut self, path: Utf8PathBuf, kind: ChangeKind, before: impl Into<String>, after: impl Into<String>) {
        self.changes.push(ChangeRecord {
            path,
            kind,
            before: before.into(),
            after: after.into(),
        });
    }
}

static STATIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:from\s+|import\s+)['"]([^'"]+)['"]"#).unwrap()
});
static DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:import|require)\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap());

/// Rename `old_name` to `new_name` across the ecosystem rooted at `manifest`.
/// In `dry_run` mode, returns the plan without touching any file (spec §4.9,
/// §6 "dryRun results never side-effect").
pub async fn rename(
    manifest: &Manifest,
    root: &camino::Utf8Path,
    old_name: &str,
    new_name: &str,
    fs: &dyn FsPort,
    dry_run: bool,
) -> Result<RenamePlan> {
    let mut plan = RenamePlan::default();

    // Pass 1: manifest entry + that package's own package.json `name`.
    let mut manifest = manifest.clone();
    if let Some(entry) = manifest.packages.remove(old_name) {
        plan.push(
            manifest::manifest_path(root),
            ChangeKind::ManifestEntry,
            old_name,
            new_name,
        );
        manifest.packages.insert(new_name.to_string(), entry);
    }

    if !dry_run {
        manifest::write(root, &manifest).await?;
    }

    // Pass 2: dependency specifiers across every scanned package's
    // package.json (all 4 dependency-map kinds), including repo-name
    // rewrites inside internal git-ref version strings.
    for entry in manifest.packages.values() {
        let package_dir = manifest.package_path(entry)?;
        let package_json_path = package_dir.join("package.json");
        if !fs.exists(&package_json_path).await {
            continue;
        }
        let mut package_json = fs.read_json(&package_json_path).await?;
        let mut changed = false;

        if package_json.get("name").and_then(Value::as_str) == Some(old_name) {
            package_json["name"] = Value::String(new_name.to_string());
            plan.push(
                package_json_path.clone(),
                ChangeKind::PackageJsonName,
                old_name,
                new_name,
            );
            changed = true;
        }

        for field in DEPENDENCY_FIELDS {
            let Some(map) = package_json.get_mut(field).and_then(Value::as_object_mut) else {
                continue;
            };
            if let Some(mut version) = map.remove(old_name) {
                if let Some(v) = version.as_str() {
                    let rewritten = rewrite_repo_in_ref(v, old_name, new_name);
                    version = Value::String(rewritten);
                }
                map.insert(new_name.to_string(), version);
                plan.push(
                    package_json_path.clone(),
                    ChangeKind::DependencySpecifier {
                        field: field.to_string(),
                    },
                    old_name,
                    new_name,
                );
                changed = true;
            } else {
                for (_, version) in map.iter_mut() {
                    if let Some(v) = version.as_str() {
                        let rewritten = rewrite_repo_in_ref(v, old_name, new_name);
                        if rewritten != v {
                            plan.push(
                                package_json_path.clone(),
                                ChangeKind::DependencySpecifier {
                                    field: field.to_string(),
                                },
                                v,
                                rewritten.clone(),
                            );
                            *version = Value::String(rewritten);
                            changed = true;
                        }
                    }
                }
            }
        }

        if changed && !dry_run {
            let pretty = serde_json::to_string_pretty(&package_json)?;
            fs.write(&package_json_path, pretty).await?;
        }
    }

    // Pass 3: source-text import specifiers, `**/*.{ts,tsx}` excluding the
    // usual noise directories (spec §4.9).
    let ignore = vec![
        "node_modules".to_string(),
        "/dist/".to_string(),
        "/.git/".to_string(),
    ];
    for entry in manifest.packages.values() {
        let package_dir = manifest.package_path(entry)?;
        for extension_pattern in ["**/*.ts", "**/*.tsx"] {
            let files = fs.glob(extension_pattern, Some(&package_dir), &ignore).await?;
            for file in files {
                let contents = fs.read_to_string(&file).await?;
                let rewritten = rewrite_import_specifiers(&contents, old_name, new_name);
                if rewritten != contents {
                    plan.push(file.clone(), ChangeKind::ImportSpecifier, &contents, &rewritten);
                    if !dry_run {
                        fs.write(&file, rewritten).await?;
                    }
                }
            }
        }
    }

    Ok(plan)
}

/// Rewrite `old_name/sub/path` -> `new_name/sub/path` in every static and
/// dynamic import specifier, preserving any subpath after the package name.
fn rewrite_import_specifiers(source: &str, old_name: &str, new_name: &str) -> String {
    let rewrite_match = |caps: &regex::Captures| -> String {
        let specifier = &caps[1];
        let rewritten = rewrite_specifier(specifier, old_name, new_name);
        if rewritten == *specifier {
            caps[0].to_string()
        } else {
            caps[0].replacen(specifier, &rewritten, 1)
        }
    };

    let after_static = STATIC_IMPORT.replace_all(source, rewrite_match);
    DYNAMIC_IMPORT.replace_all(&after_static, rewrite_match).into_owned()
}

fn rewrite_specifier(specifier: &str, old_name: &str, new_name: &str) -> String {
    if specifier == old_name {
        return new_name.to_string();
    }
    if let Some(subpath) = specifier.strip_prefix(&format!("{old_name}/")) {
        return format!("{new_name}/{subpath}");
    }
    specifier.to_string()
}

/// Internal git-ref version strings (`host:owner/repo#ref`) carry the repo
/// name in their `repo` segment; rewrite it there too (spec §4.9).
fn rewrite_repo_in_ref(version: &str, old_name: &str, new_name: &str) -> String {
    match crate::git_ref::GitRef::parse(version) {
        Some(parsed) if parsed.repo == old_name => {
            crate::git_ref::GitRef::synthesize(&parsed.host, &parsed.owner, new_name, &parsed.ref_).raw
        }
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::ports::MockFsPort;
    use camino::Utf8Path;

    fn sample_manifest() -> Manifest {
        let mut packages = BTreeMap::new();
        packages.insert(
            "widgets".to_string(),
            ManifestEntry {
                repo: "github:ecosystem/widgets#main".to_string(),
                path: Utf8PathBuf::from("widgets"),
            },
        );
        packages.insert(
            "consumer".to_string(),
            ManifestEntry {
                repo: "github:ecosystem/consumer#main".to_string(),
                path: Utf8PathBuf::from("consumer"),
            },
        );
        Manifest {
            version: "1.0".to_string(),
            root: "/ecosystems/main".to_string(),
            packages,
            project_template: Default::default(),
        }
    }

    #[test]
    fn static_and_dynamic_import_specifiers_preserve_subpaths() {
        let source = r#"
            import { Widget } from 'widgets/src/widget';
            import 'widgets';
            const lazy = import('widgets/lazy');
            const req = require('widgets');
            import { Other } from 'unrelated';
        "#;
        let rewritten = rewrite_import_specifiers(source, "widgets", "gadgets");
        assert!(rewritten.contains("from 'gadgets/src/widget'"));
        assert!(rewritten.contains("import 'gadgets'"));
        assert!(rewritten.contains("import('gadgets/lazy')"));
        assert!(rewritten.contains("require('gadgets')"));
        assert!(rewritten.contains("from 'unrelated'"));
    }

    #[test]
    fn repo_rewrite_only_touches_matching_repo_segment() {
        let rewritten = rewrite_repo_in_ref("github:ecosystem/widgets#main", "widgets", "gadgets");
        assert_eq!(rewritten, "github:ecosystem/gadgets#main");
        let untouched = rewrite_repo_in_ref("github:ecosystem/other#main", "widgets", "gadgets");
        assert_eq!(untouched, "github:ecosystem/other#main");
    }

    #[tokio::test]
    async fn dry_run_collects_changes_without_side_effects() {
        let manifest = sample_manifest();
        let root = Utf8Path::new("/ecosystems/main");
        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_read_json().returning(|path| {
            if path.as_str().contains("consumer") {
                Ok(serde_json::json!({
                    "name": "consumer",
                    "dependencies": {"widgets": "github:ecosystem/widgets#main"}
                }))
            } else {
                Ok(serde_json::json!({"name": "widgets"}))
            }
        });
        fs.expect_glob().returning(|_, _, _| Ok(vec![]));
        // No write/read_to_string expectations set: a dry run must never call them.

        let plan = rename(&manifest, root, "widgets", "gadgets", &fs, true)
            .await
            .unwrap();

        assert!(plan
            .changes
            .iter()
            .any(|c| c.kind == ChangeKind::ManifestEntry));
        assert!(plan.changes.iter().any(|c| matches!(
            &c.kind,
            ChangeKind::DependencySpecifier { field } if field == "dependencies"
        )));
    }
}
