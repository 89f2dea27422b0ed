//! External procedure contracts (spec §6): filesystem, process, package
//! manager, and git primitives. These are the only things the core depends
//! on outside itself — everything in §4.6–§4.9 is written against the
//! traits here, never against `tokio::fs`/`git2` directly, so tests can
//! substitute [`mockall`]-generated mocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
    Other,
}

#[derive(Debug, Clone)]
pub struct GitStatusFile {
    pub path: String,
    pub status: String,
    pub staged: bool,
}

#[derive(Debug, Clone)]
pub struct GitStatus {
    pub branch: String,
    pub ahead: u32,
    pub behind: u32,
    pub files: Vec<GitStatusFile>,
    pub clean: bool,
}

#[derive(Debug, Clone)]
pub struct GitPullResult {
    pub commits: u32,
    pub fast_forward: bool,
}

/// `fs.*` (spec §6). Failures are raised, except where the contract itself
/// is a yes/no question (`exists`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FsPort: Send + Sync {
    async fn exists(&self, path: &Utf8Path) -> bool;
    async fn mkdir(&self, path: &Utf8Path, recursive: bool) -> Result<()>;
    async fn read_json(&self, path: &Utf8Path) -> Result<Value>;
    async fn read_to_string(&self, path: &Utf8Path) -> Result<String>;
    async fn write(&self, path: &Utf8Path, content: String) -> Result<()>;
    async fn rm(&self, path: &Utf8Path, recursive: bool, force: bool) -> Result<()>;
    async fn glob(
        &self,
        pattern: &str,
        cwd: Option<&Utf8Path>,
        ignore: &[String],
    ) -> Result<Vec<Utf8PathBuf>>;
    async fn readdir(&self, path: &Utf8Path) -> Result<Vec<(String, EntryType)>>;
}

/// `shell.exec` (spec §6).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessPort: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        cwd: &Utf8Path,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;
}

/// `pnpm.*` (spec §6). Advertises a success boolean rather than raising, per
/// the exception carved out in spec §6.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackagePort: Send + Sync {
    async fn install(
        &self,
        cwd: &Utf8Path,
        packages: &[String],
        dev: bool,
    ) -> Result<CommandOutput>;
    async fn run(&self, cwd: &Utf8Path, script: &str) -> Result<CommandOutput>;
}

/// `git.*` (spec §6).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitPort: Send + Sync {
    async fn status(&self, cwd: &Utf8Path) -> Result<GitStatus>;
    async fn add(&self, cwd: &Utf8Path, all: bool) -> Result<()>;
    async fn commit(&self, cwd: &Utf8Path, message: &str) -> Result<String>;
    async fn push(&self, cwd: &Utf8Path) -> Result<()>;
    async fn pull(
        &self,
        cwd: &Utf8Path,
        remote: Option<&str>,
        rebase: bool,
    ) -> Result<GitPullResult>;
    async fn clone(&self, url: &str, dest: &Utf8Path, branch: Option<&str>) -> Result<()>;
    async fn checkout(&self, cwd: &Utf8Path, ref_: &str) -> Result<()>;
    async fn branch(&self, cwd: &Utf8Path) -> Result<Vec<String>>;
    async fn remote(&self, cwd: &Utf8Path, name: &str) -> Result<Option<String>>;
    async fn init(&self, cwd: &Utf8Path) -> Result<()>;
}

pub mod real {
    //! Concrete adapters: `tokio::fs`, `tokio::process::Command`, `git2`.
    //! Thin, in the sense the spec demands of these collaborators — no
    //! orchestration logic lives here.

    use super::*;
    use crate::error::FleetError;
    use git2::{build::RepoBuilder, Repository, Signature};
    use std::process::Stdio;
    use tokio::process::Command;

    pub struct RealFs;

    #[async_trait]
    impl FsPort for RealFs {
        async fn exists(&self, path: &Utf8Path) -> bool {
            tokio::fs::metadata(path).await.is_ok()
        }

        async fn mkdir(&self, path: &Utf8Path, recursive: bool) -> Result<()> {
            if recursive {
                tokio::fs::create_dir_all(path).await?;
            } else {
                tokio::fs::create_dir(path).await?;
            }
            Ok(())
        }

        async fn read_json(&self, path: &Utf8Path) -> Result<Value> {
            let contents = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&contents)?)
        }

        async fn read_to_string(&self, path: &Utf8Path) -> Result<String> {
            Ok(tokio::fs::read_to_string(path).await?)
        }

        /// Atomic: write to a sibling temp file, then rename over the target
        /// (same pattern as the manifest writer) so the Rename Engine's
        /// per-file writes can't leave a half-written file on a crash.
        async fn write(&self, path: &Utf8Path, content: String) -> Result<()> {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp_path = path.with_extension(format!(
                "{}.tmp-{}",
                path.extension().unwrap_or("tmp"),
                uuid::Uuid::new_v4()
            ));
            tokio::fs::write(&tmp_path, content).await?;
            tokio::fs::rename(&tmp_path, path).await?;
            Ok(())
        }

        async fn rm(&self, path: &Utf8Path, recursive: bool, force: bool) -> Result<()> {
            let metadata = match tokio::fs::metadata(path).await {
                Ok(m) => m,
                Err(e) if force && e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if metadata.is_dir() {
                if recursive {
                    tokio::fs::remove_dir_all(path).await?;
                } else {
                    tokio::fs::remove_dir(path).await?;
                }
            } else {
                tokio::fs::remove_file(path).await?;
            }
            Ok(())
        }

        async fn glob(
            &self,
            pattern: &str,
            cwd: Option<&Utf8Path>,
            ignore: &[String],
        ) -> Result<Vec<Utf8PathBuf>> {
            let base = cwd.map(|p| p.to_path_buf()).unwrap_or_default();
            let full_pattern = base.join(pattern);
            let ignore = ignore.to_vec();
            let matches = glob::glob(full_pattern.as_str())
                .map_err(|e| FleetError::Other(anyhow::anyhow!(e)))?
                .filter_map(|entry| entry.ok())
                .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
                .filter(|path| !ignore.iter().any(|skip| path.as_str().contains(skip.as_str())))
                .collect();
            Ok(matches)
        }

        async fn readdir(&self, path: &Utf8Path) -> Result<Vec<(String, EntryType)>> {
            let mut entries = tokio::fs::read_dir(path).await?;
            let mut out = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let kind = if file_type.is_dir() {
                    EntryType::Dir
                } else if file_type.is_file() {
                    EntryType::File
                } else {
                    EntryType::Other
                };
                out.push((entry.file_name().to_string_lossy().to_string(), kind));
            }
            Ok(out)
        }
    }

    pub struct RealProcess;

    #[async_trait]
    impl ProcessPort for RealProcess {
        async fn exec(
            &self,
            command: &str,
            cwd: &Utf8Path,
            timeout: Option<Duration>,
        ) -> Result<CommandOutput> {
            let started_at = std::time::Instant::now();
            let child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(cwd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;

            let output = match timeout {
                Some(duration) => tokio::time::timeout(duration, child.wait_with_output())
                    .await
                    .map_err(|_| FleetError::Timeout {
                        phase: command.to_string(),
                    })??,
                None => child.wait_with_output().await?,
            };

            Ok(CommandOutput {
                success: output.status.success(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: started_at.elapsed(),
            })
        }
    }

    /// Install/build timeouts from spec §5: install ~5 min, build ~2 min.
    pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const BUILD_TIMEOUT: Duration = Duration::from_secs(2 * 60);

    pub struct PnpmPackagePort<P: ProcessPort> {
        process: P,
    }

    impl<P: ProcessPort> PnpmPackagePort<P> {
        pub fn new(process: P) -> Self {
            PnpmPackagePort { process }
        }
    }

    #[async_trait]
    impl<P: ProcessPort + 'static> PackagePort for PnpmPackagePort<P> {
        async fn install(
            &self,
            cwd: &Utf8Path,
            packages: &[String],
            dev: bool,
        ) -> Result<CommandOutput> {
            let mut command = "pnpm install".to_string();
            if !packages.is_empty() {
                command.push_str(" --save");
                if dev {
                    command.push_str("-dev");
                }
                for package in packages {
                    command.push(' ');
                    command.push_str(package);
                }
            }
            self.process
                .exec(&command, cwd, Some(INSTALL_TIMEOUT))
                .await
        }

        async fn run(&self, cwd: &Utf8Path, script: &str) -> Result<CommandOutput> {
            self.process
                .exec(&format!("pnpm run {script}"), cwd, Some(BUILD_TIMEOUT))
                .await
        }
    }

    pub struct RealGit;

    impl RealGit {
        fn signature() -> Result<Signature<'static>> {
            Signature::now("fleetctl", "fleetctl@localhost")
                .map_err(|e| FleetError::GitFailed {
                    phase: "signature".to_string(),
                    cause: e.to_string(),
                })
        }
    }

    #[async_trait]
    impl GitPort for RealGit {
        async fn status(&self, cwd: &Utf8Path) -> Result<GitStatus> {
            let cwd = cwd.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("status"))?;
                let head = repo.head().ok();
                let branch = head
                    .as_ref()
                    .and_then(|h| h.shorthand())
                    .unwrap_or("HEAD")
                    .to_string();

                let mut files = Vec::new();
                let statuses = repo.statuses(None).map_err(git_err("status"))?;
                for entry in statuses.iter() {
                    let status = entry.status();
                    let path = entry.path().unwrap_or_default().to_string();
                    let staged = status.is_index_new()
                        || status.is_index_modified()
                        || status.is_index_deleted();
                    files.push(GitStatusFile {
                        path,
                        status: format!("{status:?}"),
                        staged,
                    });
                }

                Ok(GitStatus {
                    clean: files.is_empty(),
                    branch,
                    ahead: 0,
                    behind: 0,
                    files,
                })
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn add(&self, cwd: &Utf8Path, all: bool) -> Result<()> {
            let cwd = cwd.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("add"))?;
                let mut index = repo.index().map_err(git_err("add"))?;
                if all {
                    index
                        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                        .map_err(git_err("add"))?;
                }
                index.write().map_err(git_err("add"))?;
                Ok(())
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn commit(&self, cwd: &Utf8Path, message: &str) -> Result<String> {
            let cwd = cwd.to_path_buf();
            let message = message.to_string();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("commit"))?;
                let mut index = repo.index().map_err(git_err("commit"))?;
                let tree_id = index.write_tree().map_err(git_err("commit"))?;
                let tree = repo.find_tree(tree_id).map_err(git_err("commit"))?;
                let signature = RealGit::signature()?;
                let parent = repo
                    .head()
                    .ok()
                    .and_then(|h| h.peel_to_commit().ok());
                let parents: Vec<_> = parent.iter().collect();
                let commit_id = repo
                    .commit(Some("HEAD"), &signature, &signature, &message, &tree, &parents)
                    .map_err(git_err("commit"))?;
                Ok(commit_id.to_string())
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn push(&self, cwd: &Utf8Path) -> Result<()> {
            let cwd = cwd.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("push"))?;
                let mut remote = repo.find_remote("origin").map_err(git_err("push"))?;
                let head = repo.head().map_err(git_err("push"))?;
                let refspec = head.name().ok_or_else(|| FleetError::GitFailed {
                    phase: "push".to_string(),
                    cause: "detached HEAD has no ref to push".to_string(),
                })?;
                remote
                    .push(&[format!("{refspec}:{refspec}")], None)
                    .map_err(git_err("push"))?;
                Ok(())
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn pull(
            &self,
            cwd: &Utf8Path,
            remote: Option<&str>,
            rebase: bool,
        ) -> Result<GitPullResult> {
            let cwd = cwd.to_path_buf();
            let remote_name = remote.unwrap_or("origin").to_string();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("pull"))?;
                let mut remote = repo.find_remote(&remote_name).map_err(git_err("pull"))?;
                remote.fetch(&[] as &[&str], None, None).map_err(git_err("pull"))?;

                let fetch_head = repo.find_reference("FETCH_HEAD").map_err(git_err("pull"))?;
                let fetch_commit = repo
                    .reference_to_annotated_commit(&fetch_head)
                    .map_err(git_err("pull"))?;
                let analysis = repo.merge_analysis(&[&fetch_commit]).map_err(git_err("pull"))?;

                if analysis.0.is_up_to_date() {
                    return Ok(GitPullResult {
                        commits: 0,
                        fast_forward: false,
                    });
                }
                if analysis.0.is_fast_forward() && !rebase {
                    let mut head_ref = repo.head().map_err(git_err("pull"))?;
                    head_ref
                        .set_target(fetch_commit.id(), "fast-forward pull")
                        .map_err(git_err("pull"))?;
                    repo.set_head(head_ref.name().unwrap_or("HEAD"))
                        .map_err(git_err("pull"))?;
                    repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))
                        .map_err(git_err("pull"))?;
                    return Ok(GitPullResult {
                        commits: 1,
                        fast_forward: true,
                    });
                }

                // Rebase/merge-required cases are deliberately not implemented beyond
                // fast-forward: refresh/pull workflows only assume a clean linear history.
                Err(FleetError::GitFailed {
                    phase: "pull".to_string(),
                    cause: "non-fast-forward pulls are not supported".to_string(),
                })
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn clone(&self, url: &str, dest: &Utf8Path, branch: Option<&str>) -> Result<()> {
            let url = url.to_string();
            let dest = dest.to_path_buf();
            let branch = branch.map(str::to_string);
            tokio::task::spawn_blocking(move || {
                let mut builder = RepoBuilder::new();
                if let Some(branch) = &branch {
                    builder.branch(branch);
                }
                builder
                    .clone(&url, dest.as_std_path())
                    .map_err(|e| FleetError::CloneFailed {
                        url: url.clone(),
                        cause: e.to_string(),
                    })?;
                Ok(())
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn checkout(&self, cwd: &Utf8Path, ref_: &str) -> Result<()> {
            let cwd = cwd.to_path_buf();
            let ref_ = ref_.to_string();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("checkout"))?;
                let (object, reference) =
                    repo.revparse_ext(&ref_).map_err(git_err("checkout"))?;
                repo.checkout_tree(&object, None).map_err(git_err("checkout"))?;
                match reference {
                    Some(reference) => repo.set_head(reference.name().unwrap_or("HEAD")),
                    None => repo.set_head_detached(object.id()),
                }
                .map_err(git_err("checkout"))?;
                Ok(())
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn branch(&self, cwd: &Utf8Path) -> Result<Vec<String>> {
            let cwd = cwd.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("branch"))?;
                let branches = repo
                    .branches(Some(git2::BranchType::Local))
                    .map_err(git_err("branch"))?;
                let mut names = Vec::new();
                for branch in branches {
                    let (branch, _) = branch.map_err(git_err("branch"))?;
                    if let Some(name) = branch.name().map_err(git_err("branch"))? {
                        names.push(name.to_string());
                    }
                }
                Ok(names)
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn remote(&self, cwd: &Utf8Path, name: &str) -> Result<Option<String>> {
            let cwd = cwd.to_path_buf();
            let name = name.to_string();
            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&cwd).map_err(git_err("remote"))?;
                match repo.find_remote(&name) {
                    Ok(remote) => Ok(remote.url().map(str::to_string)),
                    Err(_) => Ok(None),
                }
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }

        async fn init(&self, cwd: &Utf8Path) -> Result<()> {
            let cwd = cwd.to_path_buf();
            tokio::task::spawn_blocking(move || {
                Repository::init(&cwd).map_err(git_err("init"))?;
                Ok(())
            })
            .await
            .map_err(|e| FleetError::Other(e.into()))?
        }
    }

    fn git_err(phase: &'static str) -> impl Fn(git2::Error) -> FleetError {
        move |e| FleetError::GitFailed {
            phase: phase.to_string(),
            cause: e.to_string(),
        }
    }
}

/// A bundle of every external-procedure port, cloned cheaply into the
/// closures the Graph Executor runs per node (spec §6).
#[derive(Clone)]
pub struct Ports {
    pub fs: Arc<dyn FsPort>,
    pub process: Arc<dyn ProcessPort>,
    pub package: Arc<dyn PackagePort>,
    pub git: Arc<dyn GitPort>,
}

impl Ports {
    pub fn real() -> Ports {
        let process = Arc::new(real::RealProcess);
        Ports {
            fs: Arc::new(real::RealFs),
            package: Arc::new(real::PnpmPackagePort::new(real::RealProcess)),
            process,
            git: Arc::new(real::RealGit),
        }
    }
}
