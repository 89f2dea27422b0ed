//! Workflow Library (C8): the concrete workflows — install, refresh, pull,
//! new, audit — and their shared primitives (spec §4.8).
//!
//! The primitives the spec lists under §4.8 ("cleanup.force", `fs.ensureDir`,
//! `pnpm.installAndBuild`, `git.commitAndPush`, `git.initWorkflow`) are
//! registered as [`AggregationValue`] fixtures (spec §3: "Implementers should
//! treat these definitions as fixtures, not as code in the core") composed
//! from the `fs.*`/`git.*`/`pnpm.*` contracts in [`super::contracts`]. The
//! higher-level, graph-shaped workflows (refresh/install/pull) are native
//! Rust: they drive Scanner → Graph Builder → Leveler → Graph Executor
//! (spec §2 flow) and need the typed [`FleetError`] phase tagging (spec §7)
//! that a generic `client.throw` message can't carry structurally.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregation::model::{inverted_reference, reference, step, AggregationValue, Step};
use crate::error::{FleetError, Result};
use crate::executor::{self, ExecutorOptions, GraphResult, NodeProcessor, NodeResult};
use crate::git_ref::{GitRef, ECOSYSTEM_OWNER};
use crate::graph::{self, DagNode, DEFAULT_PRIMARY_BRANCH};
use crate::leveler;
use crate::manifest::{self, Manifest, ManifestEntry, ProjectTemplate};
use crate::ports::Ports;
use crate::registry::{ProcedureBody, Registry};
use crate::scanner;
use crate::workflows::{contracts, primitives};

fn proc_path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

fn mapping(pairs: Vec<(&str, AggregationValue)>) -> AggregationValue {
    AggregationValue::Mapping(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn sequence(items: Vec<AggregationValue>) -> AggregationValue {
    AggregationValue::Sequence(items)
}

fn named(mut s: Step, name: &str) -> AggregationValue {
    s.name = Some(name.to_string());
    AggregationValue::Step(Box::new(s))
}

/// The four paths `cleanup.force` removes, tolerating absence (spec §4.8).
const CLEANUP_TARGETS: [&str; 4] = ["node_modules", "dist", "pnpm-lock.yaml", "tsconfig.tsbuildinfo"];

/// Register the §4.8 "Primitives" as aggregation fixtures on top of the
/// contract procedures, plus every `fs.*`/`git.*`/`pnpm.*` contract itself.
pub fn register(ports: Ports) -> Arc<Registry> {
    let registry = Registry::new();
    contracts::register_contracts(&registry, ports);
    register_primitives(&registry);
    registry
}

fn register_primitives(registry: &Arc<Registry>) {
    // fs.ensureDir: { path } -> probe, then mkdir only if absent.
    let ensure_dir = step(
        &["client", "chain"],
        sequence(vec![
            named_check_exists(),
            step(
                &["client", "conditional"],
                mapping(vec![("condition", reference("probe.exists")), ("else", mkdir_step())]),
            ),
        ]),
    );
    registry
        .register(proc_path(&["fs", "ensureDir"]), ProcedureBody::Aggregation(ensure_dir), BTreeMap::new(), false)
        .expect("primitive registered exactly once at startup");

    // cleanup.force: { cwd } -> tolerant removal of the four build artifacts.
    let cleanup_force = step(
        &["client", "map"],
        mapping(vec![
            ("items", AggregationValue::literal(serde_json::json!(CLEANUP_TARGETS))),
            (
                "mapper",
                step(
                    &["client", "tryCatch"],
                    mapping(vec![
                        (
                            "try",
                            step(
                                &["fs", "rm"],
                                mapping(vec![
                                    ("path", AggregationValue::template("{{input.cwd}}/{{item}}")),
                                    ("recursive", AggregationValue::literal(true)),
                                    ("force", AggregationValue::literal(true)),
                                ]),
                            ),
                        ),
                        ("catch", AggregationValue::literal(Value::Null)),
                    ]),
                ),
            ),
        ]),
    );
    registry
        .register(proc_path(&["cleanup", "force"]), ProcedureBody::Aggregation(cleanup_force), BTreeMap::new(), false)
        .expect("primitive registered exactly once at startup");

    // pnpm.installAndBuild: { cwd } -> install, throw on failure, run build,
    // throw on failure, return the build step's result.
    let install_and_build = step(
        &["client", "chain"],
        sequence(vec![
            named(
                Step::new(
                    &["pnpm", "install"],
                    mapping(vec![("cwd", reference("input.cwd"))]),
                ),
                "install",
            ),
            throw_unless("install.success", "install failed: {{install.stderr}}"),
            named(
                Step::new(
                    &["pnpm", "run"],
                    mapping(vec![("cwd", reference("input.cwd")), ("script", AggregationValue::literal("build"))]),
                ),
                "build",
            ),
            throw_unless("build.success", "build failed: {{build.stderr}}"),
            step(&["client", "identity"], reference("build")),
        ]),
    );
    registry
        .register(
            proc_path(&["pnpm", "installAndBuild"]),
            ProcedureBody::Aggregation(install_and_build),
            BTreeMap::new(),
            false,
        )
        .expect("primitive registered exactly once at startup");

    // git.commitAndPush: { cwd, message } -> add, commit, push.
    let commit_and_push = step(
        &["client", "chain"],
        sequence(vec![
            step(&["git", "add"], mapping(vec![("cwd", reference("input.cwd")), ("all", AggregationValue::literal(true))])),
            step(
                &["git", "commit"],
                mapping(vec![("cwd", reference("input.cwd")), ("message", reference("input.message"))]),
            ),
            step(&["git", "push"], mapping(vec![("cwd", reference("input.cwd"))])),
        ]),
    );
    registry
        .register(
            proc_path(&["git", "commitAndPush"]),
            ProcedureBody::Aggregation(commit_and_push),
            BTreeMap::new(),
            false,
        )
        .expect("primitive registered exactly once at startup");

    // git.initWorkflow: { cwd } -> init, add, commit "Initial commit".
    let init_workflow = step(
        &["client", "chain"],
        sequence(vec![
            step(&["git", "init"], mapping(vec![("cwd", reference("input.cwd"))])),
            step(&["git", "add"], mapping(vec![("cwd", reference("input.cwd")), ("all", AggregationValue::literal(true))])),
            step(
                &["git", "commit"],
                mapping(vec![("cwd", reference("input.cwd")), ("message", AggregationValue::literal("Initial commit"))]),
            ),
        ]),
    );
    registry
        .register(
            proc_path(&["git", "initWorkflow"]),
            ProcedureBody::Aggregation(init_workflow),
            BTreeMap::new(),
            false,
        )
        .expect("primitive registered exactly once at startup");
}

fn named_check_exists() -> AggregationValue {
    named(
        Step::new(&["fs", "exists"], mapping(vec![("path", reference("input.path"))])),
        "probe",
    )
}

fn mkdir_step() -> AggregationValue {
    step(
        &["fs", "mkdir"],
        mapping(vec![("path", reference("input.path")), ("recursive", AggregationValue::literal(true))]),
    )
}

/// Throw `message` (template-substituted) unless `success_path` resolves
/// truthy — built on the `{ ref, invert: true }` shape [`inverted_reference`]
/// produces, so no evaluation happens beyond a reference lookup.
fn throw_unless(success_path: &str, message: &str) -> AggregationValue {
    step(
        &["client", "conditional"],
        mapping(vec![
            ("condition", inverted_reference(success_path)),
            (
                "then",
                step(
                    &["client", "throw"],
                    mapping(vec![("message", AggregationValue::template(message))]),
                ),
            ),
        ]),
    )
}

// ---------------------------------------------------------------------
// refresh.single (spec §4.8 "Refresh (single package)")
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSingleInput {
    pub cwd: Utf8PathBuf,
    pub package_name: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub skip_git: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSingleResult {
    pub success: bool,
    pub name: String,
    pub path: Utf8PathBuf,
    pub operations: Vec<String>,
}

/// Refresh one package: optional forced cleanup, install+build, optional
/// commit+push. `dryRun` returns the planned operation list with no side
/// effects (spec §4.8, §8 invariant 8).
///
/// Dispatches every non-dry-run phase through `registry` against the
/// `cleanup.force`/`pnpm.installAndBuild`/`git.commitAndPush` aggregation
/// fixtures registered by [`register`] (spec §2: "An aggregation is
/// executed by the Interpreter, which makes procedure calls through the
/// Dispatcher"), rather than calling the native primitives directly.
pub async fn refresh_single(registry: &Arc<Registry>, input: RefreshSingleInput) -> Result<RefreshSingleResult> {
    if input.dry_run {
        let mut planned = Vec::new();
        if input.force {
            planned.push(format!("cleanup.force {}", input.cwd));
        }
        planned.push(format!("pnpm.installAndBuild {}", input.cwd));
        if !input.skip_git {
            planned.push("git.commitAndPush".to_string());
        }
        return Ok(RefreshSingleResult {
            success: true,
            name: input.package_name,
            path: input.cwd,
            operations: planned,
        });
    }

    let mut operations = Vec::new();

    if input.force {
        registry
            .clone()
            .call(&proc_path(&["cleanup", "force"]), serde_json::json!({ "cwd": input.cwd }))
            .await?;
        operations.push(format!("cleaned {}", CLEANUP_TARGETS.join(", ")));
    }

    let install_and_build = registry
        .clone()
        .call(
            &proc_path(&["pnpm", "installAndBuild"]),
            serde_json::json!({ "cwd": input.cwd }),
        )
        .await?;
    operations.push(format!(
        "installed and built ({}ms)",
        install_and_build.get("duration").and_then(Value::as_u64).unwrap_or_default()
    ));

    if !input.skip_git {
        let message = format!("chore(refresh): refresh {}", input.package_name);
        registry
            .clone()
            .call(
                &proc_path(&["git", "commitAndPush"]),
                serde_json::json!({ "cwd": input.cwd, "message": message }),
            )
            .await?;
        operations.push("committed and pushed".to_string());
    }

    Ok(RefreshSingleResult {
        success: true,
        name: input.package_name,
        path: input.cwd,
        operations,
    })
}

// ---------------------------------------------------------------------
// refresh (ecosystem / subtree / single) (spec §4.8 "Refresh (ecosystem or
// subtree)")
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum RefreshScope<'a> {
    All,
    Recursive(&'a str),
    Single(&'a str),
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub force: bool,
    pub skip_git: bool,
    pub dry_run: bool,
    pub concurrency: usize,
    /// `failFast = !autoConfirm` (spec §4.8).
    pub auto_confirm: bool,
}

pub async fn refresh(ports: &Ports, root: &Utf8Path, scope: RefreshScope<'_>, options: &RefreshOptions) -> Result<GraphResult> {
    let registry = register(ports.clone());
    match scope {
        RefreshScope::Single(name) => refresh_single_as_graph_result(ports, &registry, root, name, options).await,
        RefreshScope::All | RefreshScope::Recursive(_) => {
            let scan = scanner::scan(root, ports.fs.as_ref(), ports.git.as_ref()).await?;
            let full_graph = graph::build(&scan.descriptors, DEFAULT_PRIMARY_BRANCH);
            let scoped_graph = match scope {
                RefreshScope::Recursive(name) => full_graph.filter_from_root(name),
                _ => full_graph,
            };
            let leveled = leveler::level(&scoped_graph)?;
            let processor = refresh_processor(registry, options.clone());
            let exec_options = ExecutorOptions {
                concurrency: options.concurrency,
                fail_fast: !options.auto_confirm,
            };
            Ok(executor::execute(&leveled, processor, exec_options, None, None).await)
        }
    }
}

async fn refresh_single_as_graph_result(
    ports: &Ports,
    registry: &Arc<Registry>,
    root: &Utf8Path,
    name: &str,
    options: &RefreshOptions,
) -> Result<GraphResult> {
    let scan = scanner::scan(root, ports.fs.as_ref(), ports.git.as_ref()).await?;
    let descriptor = scan
        .descriptors
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| FleetError::PackageNotScanned(name.to_string()))?;

    let input = RefreshSingleInput {
        cwd: descriptor.repo_path.clone(),
        package_name: name.to_string(),
        force: options.force,
        skip_git: options.skip_git,
        dry_run: options.dry_run,
    };

    let started_at = Instant::now();
    let outcome = refresh_single(registry, input).await;
    let node_result = match outcome {
        Ok(r) => NodeResult {
            node: name.to_string(),
            success: true,
            error: None,
            duration: started_at.elapsed(),
            logs: r.operations,
            skipped: false,
        },
        Err(e) => NodeResult {
            node: name.to_string(),
            success: false,
            error: Some(e.to_string()),
            duration: started_at.elapsed(),
            logs: Vec::new(),
            skipped: false,
        },
    };

    let success = node_result.success;
    let mut results = HashMap::new();
    results.insert(name.to_string(), node_result);
    Ok(GraphResult {
        results,
        success,
        total_duration: started_at.elapsed(),
    })
}

fn refresh_processor(registry: Arc<Registry>, options: RefreshOptions) -> NodeProcessor {
    Arc::new(move |node: DagNode| {
        let registry = registry.clone();
        let options = options.clone();
        Box::pin(async move {
            let input = RefreshSingleInput {
                cwd: node.repo_path.clone(),
                package_name: node.name.clone(),
                force: options.force,
                skip_git: options.skip_git,
                dry_run: options.dry_run,
            };
            let result = refresh_single(&registry, input).await?;
            Ok(result.operations)
        })
    })
}

// ---------------------------------------------------------------------
// install (spec §4.8 "Install")
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub success: bool,
    pub cloned: Vec<String>,
    pub skipped: Vec<String>,
    pub results: Vec<NodeResult>,
    pub errors: Vec<String>,
}

pub async fn install(ports: &Ports, root: &Utf8Path, options: &InstallOptions) -> Result<InstallResult> {
    let (cloned, skipped, errors) = clone_missing(ports, root, options.dry_run, options.continue_on_error).await?;

    if options.dry_run {
        return Ok(InstallResult {
            success: errors.is_empty(),
            cloned,
            skipped,
            results: Vec::new(),
            errors,
        });
    }

    let graph_result = build(
        ports,
        root,
        &BuildOptions {
            dry_run: false,
            continue_on_error: options.continue_on_error,
            concurrency: options.concurrency,
        },
    )
    .await?;

    Ok(InstallResult {
        success: graph_result.success && errors.is_empty(),
        cloned,
        skipped,
        results: graph_result.results.into_values().collect(),
        errors,
    })
}

/// For each manifest entry missing from disk, clone it (unless `dry_run`).
/// Shared by [`install`] and the standalone `clone` workflow (spec.md §0).
async fn clone_missing(
    ports: &Ports,
    root: &Utf8Path,
    dry_run: bool,
    continue_on_error: bool,
) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let manifest = manifest::read(root).await?;
    let mut cloned = Vec::new();
    let mut skipped = Vec::new();
    let mut errors = Vec::new();

    for (name, entry) in &manifest.packages {
        let path = manifest.package_path(entry)?;
        if ports.fs.exists(&path).await {
            skipped.push(name.clone());
            continue;
        }
        if dry_run {
            cloned.push(name.clone());
            continue;
        }
        match clone_from_manifest_entry(ports, entry, &path).await {
            Ok(()) => cloned.push(name.clone()),
            Err(e) => {
                errors.push(format!("{name}: {e}"));
                if !continue_on_error {
                    return Err(e);
                }
            }
        }
    }

    Ok((cloned, skipped, errors))
}

#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub dry_run: bool,
    pub continue_on_error: bool,
}

/// Clone every manifest package missing from disk, without installing or
/// building anything (the standalone `clone` workflow).
pub async fn clone(ports: &Ports, root: &Utf8Path, options: &CloneOptions) -> Result<InstallResult> {
    let (cloned, skipped, errors) = clone_missing(ports, root, options.dry_run, options.continue_on_error).await?;
    Ok(InstallResult {
        success: errors.is_empty(),
        cloned,
        skipped,
        results: Vec::new(),
        errors,
    })
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub concurrency: usize,
}

/// Install dependencies and run the `build` script across the whole
/// dependency graph already present on disk, without cloning anything (the
/// standalone `build` workflow, and the second half of [`install`]).
pub async fn build(ports: &Ports, root: &Utf8Path, options: &BuildOptions) -> Result<GraphResult> {
    let scan = scanner::scan(root, ports.fs.as_ref(), ports.git.as_ref()).await?;
    let built_graph = graph::build(&scan.descriptors, DEFAULT_PRIMARY_BRANCH);
    let leveled = leveler::level(&built_graph)?;

    if options.dry_run {
        let results: HashMap<String, NodeResult> = leveled
            .nodes()
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    NodeResult {
                        node: name.clone(),
                        success: true,
                        error: None,
                        duration: Duration::ZERO,
                        logs: vec!["planned: pnpm.installAndBuild".to_string()],
                        skipped: false,
                    },
                )
            })
            .collect();
        return Ok(GraphResult {
            success: true,
            results,
            total_duration: Duration::ZERO,
        });
    }

    let ports_for_processor = ports.clone();
    let processor: NodeProcessor = Arc::new(move |node: DagNode| {
        let ports = ports_for_processor.clone();
        Box::pin(async move { Ok(primitives::pnpm_install_and_build(&ports, &node.repo_path).await?) })
    });

    let exec_options = ExecutorOptions {
        concurrency: options.concurrency,
        fail_fast: !options.continue_on_error,
    };
    Ok(executor::execute(&leveled, processor, exec_options, None, None).await)
}

async fn clone_from_manifest_entry(ports: &Ports, entry: &ManifestEntry, dest: &Utf8Path) -> Result<()> {
    let git_ref = GitRef::parse(&entry.repo);
    let url = match &git_ref {
        Some(r) => format!("https://{}/{}/{}.git", r.host, r.owner, r.repo),
        None => entry.repo.clone(),
    };
    let branch = git_ref.as_ref().map(|r| r.ref_.as_str());
    ports.git.clone(&url, dest, branch).await.map_err(|e| FleetError::CloneFailed {
        url,
        cause: e.to_string(),
    })
}

// ---------------------------------------------------------------------
// pull (spec §4.8 "Pull")
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub remote: Option<String>,
    pub rebase: bool,
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub concurrency: usize,
}

pub async fn pull(ports: &Ports, root: &Utf8Path, options: &PullOptions) -> Result<GraphResult> {
    let scan = scanner::scan(root, ports.fs.as_ref(), ports.git.as_ref()).await?;
    let built_graph = graph::build(&scan.descriptors, DEFAULT_PRIMARY_BRANCH);
    let leveled = leveler::level(&built_graph)?;

    if options.dry_run {
        let results: HashMap<String, NodeResult> = leveled
            .nodes()
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    NodeResult {
                        node: name.clone(),
                        success: true,
                        error: None,
                        duration: Duration::ZERO,
                        logs: vec!["planned: git.pull".to_string()],
                        skipped: false,
                    },
                )
            })
            .collect();
        return Ok(GraphResult {
            success: true,
            results,
            total_duration: Duration::ZERO,
        });
    }

    let ports_for_processor = ports.clone();
    let remote = options.remote.clone();
    let rebase = options.rebase;
    let processor: NodeProcessor = Arc::new(move |node: DagNode| {
        let ports = ports_for_processor.clone();
        let remote = remote.clone();
        Box::pin(async move {
            let result = ports
                .git
                .pull(&node.repo_path, remote.as_deref(), rebase)
                .await
                .map_err(|e| FleetError::GitFailed {
                    phase: "pull".to_string(),
                    cause: e.to_string(),
                })?;
            Ok(vec![format!(
                "pulled {} commit(s), fast_forward={}",
                result.commits, result.fast_forward
            )])
        })
    });

    let exec_options = ExecutorOptions {
        concurrency: options.concurrency,
        fail_fast: !options.continue_on_error,
    };
    Ok(executor::execute(&leveled, processor, exec_options, None, None).await)
}

// ---------------------------------------------------------------------
// new (spec §4.8 "New")
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewOptions {
    pub skip_git: bool,
    pub skip_manifest: bool,
    pub dry_run: bool,
    pub create_remote: bool,
    pub repo_owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResult {
    pub success: bool,
    pub path: Utf8PathBuf,
    pub planned_operations: Vec<String>,
}

pub async fn new_package(ports: &Ports, name: &str, preset: &str, root: &Utf8Path, options: &NewOptions) -> Result<NewResult> {
    let manifest = match manifest::read(root).await {
        Ok(m) => m,
        Err(FleetError::ManifestMissing(_)) => Manifest {
            version: "1.0".to_string(),
            root: root.as_str().to_string(),
            packages: BTreeMap::new(),
            project_template: ProjectTemplate::default_template(),
        },
        Err(e) => return Err(e),
    };

    let resolved_root = manifest.resolved_root().unwrap_or_else(|_| root.to_path_buf());
    let target = resolved_root.join(name);
    let full_name = format!("@{ECOSYSTEM_OWNER}/{name}");

    let mut planned = vec![
        format!("mkdir {target}"),
        format!("mkdir {}", target.join("src")),
        format!("write {}", target.join("src/index.ts")),
        format!("scaffold init --preset {preset}"),
        "scaffold generate".to_string(),
    ];
    if !options.skip_git {
        planned.push("git.initWorkflow".to_string());
        if options.create_remote {
            planned.push("create remote repository".to_string());
        }
    }
    if !options.skip_manifest {
        planned.push("manifest: register package".to_string());
    }

    if ports.fs.exists(&target).await {
        return Err(FleetError::TargetExists(target));
    }

    if options.dry_run {
        return Ok(NewResult {
            success: true,
            path: target,
            planned_operations: planned,
        });
    }

    ports.fs.mkdir(&target, true).await?;
    ports.fs.mkdir(&target.join("src"), true).await?;
    ports
        .fs
        .write(&target.join("src/index.ts"), format!("export const name = {full_name:?};\n"))
        .await?;

    ports
        .process
        .exec(&format!("scaffold init --preset {preset}"), &target, None)
        .await?;
    ports.process.exec("scaffold generate", &target, None).await?;

    if !options.skip_git {
        primitives::git_init_workflow(ports, &target).await?;
        if options.create_remote {
            let owner = options.repo_owner.clone().unwrap_or_else(|| ECOSYSTEM_OWNER.to_string());
            let create_remote_cmd = format!("gh repo create {owner}/{name} --private --source={target} --remote=origin --push");
            let output = ports.process.exec(&create_remote_cmd, &target, None).await?;
            if !output.success {
                return Err(FleetError::GitFailed {
                    phase: "create-remote".to_string(),
                    cause: output.stderr,
                });
            }
        }
    }

    if !options.skip_manifest {
        let mut manifest = manifest;
        manifest.packages.insert(
            name.to_string(),
            ManifestEntry {
                repo: GitRef::synthesize("github", ECOSYSTEM_OWNER, name, DEFAULT_PRIMARY_BRANCH).raw,
                path: Utf8PathBuf::from(name),
            },
        );
        manifest::write(root, &manifest).await?;
    }

    Ok(NewResult {
        success: true,
        path: target,
        planned_operations: planned,
    })
}

// ---------------------------------------------------------------------
// audit (spec §4.8 "Audit")
// ---------------------------------------------------------------------

/// The subset of template entries `audit --fix` is willing to create
/// (spec §4.8: "a small whitelisted subset").
const FIXABLE_DIRS: &[&str] = &["src"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageAudit {
    pub name: String,
    pub valid: bool,
    pub missing: Vec<String>,
    pub fixed: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub packages: Vec<PackageAudit>,
    pub success: bool,
}

pub async fn audit(ports: &Ports, root: &Utf8Path, fix: bool) -> Result<AuditResult> {
    let manifest = manifest::read(root).await?;
    let mut packages = Vec::new();

    for (name, entry) in &manifest.packages {
        let path = manifest.package_path(entry)?;
        let mut missing = Vec::new();
        let mut fixed = 0usize;
        let mut issues = Vec::new();

        for dir in &manifest.project_template.dirs {
            let dir_path = path.join(dir);
            if ports.fs.exists(&dir_path).await {
                continue;
            }
            if fix && FIXABLE_DIRS.contains(&dir.as_str()) {
                ports.fs.mkdir(&dir_path, true).await?;
                fixed += 1;
            } else {
                missing.push(dir.clone());
            }
        }

        for file in &manifest.project_template.files {
            if !ports.fs.exists(&path.join(file)).await {
                missing.push(file.clone());
            }
        }

        audit_package_json(ports, &path, &mut issues).await?;

        packages.push(PackageAudit {
            valid: missing.is_empty() && issues.is_empty(),
            name: name.clone(),
            missing,
            fixed,
            issues,
        });
    }

    let success = packages.iter().all(|p| p.valid);
    Ok(AuditResult { packages, success })
}

async fn audit_package_json(ports: &Ports, package_dir: &Utf8Path, issues: &mut Vec<String>) -> Result<()> {
    let package_json_path = package_dir.join("package.json");
    if !ports.fs.exists(&package_json_path).await {
        return Ok(());
    }
    let Ok(package_json) = ports.fs.read_json(&package_json_path).await else {
        return Ok(());
    };

    for lockfile in ["package-lock.json", "yarn.lock"] {
        if ports.fs.exists(&package_dir.join(lockfile)).await {
            issues.push(format!("foreign lockfile {lockfile} present alongside pnpm workflow"));
        }
    }

    let allow_listed: std::collections::HashSet<String> = package_json
        .get("pnpm")
        .and_then(|p| p.get("onlyBuiltDependencies"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    for field in ["dependencies", "devDependencies"] {
        let Some(map) = package_json.get(field).and_then(Value::as_object) else {
            continue;
        };
        for (dep_name, version) in map {
            let Some(version) = version.as_str() else { continue };
            let is_external_git_dep = GitRef::parse(version).is_some() && !crate::git_ref::is_internal_ref(version);
            if is_external_git_dep && !allow_listed.contains(dep_name) {
                issues.push(format!("{dep_name}: external git dependency missing from onlyBuiltDependencies"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MockFsPort, MockGitPort, MockPackagePort, MockProcessPort};

    fn ports_with(fs: MockFsPort, git: MockGitPort, package: MockPackagePort) -> Ports {
        Ports {
            fs: Arc::new(fs),
            process: Arc::new(MockProcessPort::new()),
            package: Arc::new(package),
            git: Arc::new(git),
        }
    }

    #[tokio::test]
    async fn pnpm_install_and_build_aggregation_mirrors_the_native_primitive() {
        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|_| true);
        let mut package = MockPackagePort::new();
        package.expect_install().returning(|_, _, _| {
            Ok(crate::ports::CommandOutput {
                success: true,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            })
        });
        package.expect_run().returning(|_, _| {
            Ok(crate::ports::CommandOutput {
                success: true,
                exit_code: 0,
                stdout: "built".to_string(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            })
        });

        let ports = ports_with(fs, MockGitPort::new(), package);
        let registry = register(ports);

        let result = registry
            .clone()
            .call(
                &proc_path(&["pnpm", "installAndBuild"]),
                serde_json::json!({ "cwd": "/repos/widgets" }),
            )
            .await
            .unwrap();
        assert_eq!(result["success"], serde_json::json!(true));
        assert_eq!(result["stdout"], serde_json::json!("built"));
    }

    #[tokio::test]
    async fn pnpm_install_and_build_aggregation_throws_on_install_failure() {
        let mut package = MockPackagePort::new();
        package.expect_install().returning(|_, _, _| {
            Ok(crate::ports::CommandOutput {
                success: false,
                exit_code: 1,
                stdout: String::new(),
                stderr: "ENOENT".to_string(),
                duration: Duration::from_millis(1),
            })
        });
        let ports = ports_with(MockFsPort::new(), MockGitPort::new(), package);
        let registry = register(ports);

        let err = registry
            .clone()
            .call(&proc_path(&["pnpm", "installAndBuild"]), serde_json::json!({ "cwd": "/repos/widgets" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("install failed"));
    }

    #[tokio::test]
    async fn cleanup_force_aggregation_tolerates_rm_failures() {
        let mut fs = MockFsPort::new();
        fs.expect_rm().returning(|_, _, _| Err(FleetError::Io(std::io::Error::other("denied"))));
        let ports = ports_with(fs, MockGitPort::new(), MockPackagePort::new());
        let registry = register(ports);

        let result = registry
            .clone()
            .call(&proc_path(&["cleanup", "force"]), serde_json::json!({ "cwd": "/repos/widgets" }))
            .await
            .unwrap();
        assert_eq!(result.as_array().unwrap().len(), CLEANUP_TARGETS.len());
    }

    #[tokio::test]
    async fn refresh_single_dry_run_performs_no_side_effects() {
        let ports = ports_with(MockFsPort::new(), MockGitPort::new(), MockPackagePort::new());
        let registry = register(ports);
        let result = refresh_single(
            &registry,
            RefreshSingleInput {
                cwd: Utf8PathBuf::from("/repos/widgets"),
                package_name: "widgets".to_string(),
                force: true,
                skip_git: false,
                dry_run: true,
            },
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(result.operations.iter().any(|op| op.contains("cleanup.force")));
        assert!(result.operations.iter().any(|op| op.contains("pnpm.installAndBuild")));
        assert!(result.operations.iter().any(|op| op.contains("git.commitAndPush")));
    }

    /// `refresh_single` dispatches through the registry, exercising the
    /// real Aggregation Interpreter (C7) and Dispatcher (C10) rather than
    /// calling the primitives module directly (spec §2 flow).
    #[tokio::test]
    async fn refresh_single_dispatches_through_the_registry() {
        let mut fs = MockFsPort::new();
        fs.expect_rm().returning(|_, _, _| Ok(()));
        let mut git = MockGitPort::new();
        git.expect_add().returning(|_, _| Ok(()));
        git.expect_commit().returning(|_, _| Ok("deadbeef".to_string()));
        git.expect_push().returning(|_| Ok(()));
        let mut package = MockPackagePort::new();
        package.expect_install().returning(|_, _, _| {
            Ok(crate::ports::CommandOutput {
                success: true,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            })
        });
        package.expect_run().returning(|_, _| {
            Ok(crate::ports::CommandOutput {
                success: true,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            })
        });

        let registry = register(ports_with(fs, git, package));
        let result = refresh_single(
            &registry,
            RefreshSingleInput {
                cwd: Utf8PathBuf::from("/repos/widgets"),
                package_name: "widgets".to_string(),
                force: true,
                skip_git: false,
                dry_run: false,
            },
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(result.operations.iter().any(|op| op.contains("cleaned")));
        assert!(result.operations.iter().any(|op| op.contains("installed and built")));
        assert!(result.operations.iter().any(|op| op.contains("committed and pushed")));
    }

    #[tokio::test]
    async fn new_package_fails_when_target_already_exists() {
        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|_| true);
        let ports = ports_with(fs, MockGitPort::new(), MockPackagePort::new());

        let err = new_package(
            &ports,
            "widgets",
            "default",
            Utf8Path::new("/ecosystems/main"),
            &NewOptions {
                skip_git: true,
                skip_manifest: true,
                dry_run: false,
                create_remote: false,
                repo_owner: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FleetError::TargetExists(_)));
    }

    #[tokio::test]
    async fn audit_flags_missing_allowlist_entry_for_external_git_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut packages = BTreeMap::new();
        packages.insert(
            "widgets".to_string(),
            ManifestEntry {
                repo: "github:ecosystem/widgets#main".to_string(),
                path: Utf8PathBuf::from("widgets"),
            },
        );
        let manifest = Manifest {
            version: "1.0".to_string(),
            root: root.as_str().to_string(),
            packages,
            project_template: ProjectTemplate::default_template(),
        };
        manifest::write(&root, &manifest).await.unwrap();

        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|path: &camino::Utf8Path| {
            !path.as_str().ends_with("package-lock.json") && !path.as_str().ends_with("yarn.lock")
        });
        fs.expect_read_json().returning(|_| {
            Ok(serde_json::json!({
                "dependencies": { "left-pad": "github:other-owner/left-pad#main" },
                "pnpm": { "onlyBuiltDependencies": [] }
            }))
        });
        let ports = ports_with(fs, MockGitPort::new(), MockPackagePort::new());

        let result = audit(&ports, &root, false).await.unwrap();
        assert_eq!(result.packages.len(), 1);
        assert!(!result.success);
        assert!(result.packages[0]
            .issues
            .iter()
            .any(|issue| issue.contains("left-pad")));
    }

    #[tokio::test]
    async fn audit_fix_creates_missing_whitelisted_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut packages = BTreeMap::new();
        packages.insert(
            "widgets".to_string(),
            ManifestEntry {
                repo: "github:ecosystem/widgets#main".to_string(),
                path: Utf8PathBuf::from("widgets"),
            },
        );
        let manifest = Manifest {
            version: "1.0".to_string(),
            root: root.as_str().to_string(),
            packages,
            project_template: ProjectTemplate::default_template(),
        };
        manifest::write(&root, &manifest).await.unwrap();

        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|path: &camino::Utf8Path| !path.as_str().ends_with("src"));
        fs.expect_mkdir().returning(|_, _| Ok(()));
        fs.expect_read_json().returning(|_| Ok(serde_json::json!({})));
        let ports = ports_with(fs, MockGitPort::new(), MockPackagePort::new());

        let result = audit(&ports, &root, true).await.unwrap();
        assert_eq!(result.packages[0].fixed, 1);
        assert!(result.packages[0].missing.is_empty());
    }
}
