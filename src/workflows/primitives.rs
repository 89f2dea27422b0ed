//! Workflow primitives (C8): the small, single-purpose steps workflows
//! compose — one per external side effect named in spec §4.8.

use camino::Utf8Path;

use crate::error::{FleetError, Result};
use crate::ports::Ports;

/// `cleanup.force`: remove a path, tolerating it already being gone.
pub async fn cleanup_force(ports: &Ports, path: &Utf8Path) -> Result<()> {
    ports
        .fs
        .rm(path, true, true)
        .await
        .map_err(|e| FleetError::CleanupFailed {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })
}

/// `fs.ensureDir`: idempotent directory creation (spec §8 invariant 6).
pub async fn ensure_dir(ports: &Ports, path: &Utf8Path) -> Result<()> {
    if ports.fs.exists(path).await {
        return Ok(());
    }
    ports.fs.mkdir(path, true).await
}

/// `pnpm.install`.
pub async fn pnpm_install(ports: &Ports, cwd: &Utf8Path) -> Result<()> {
    let output = ports.package.install(cwd, &[], false).await?;
    if output.success {
        Ok(())
    } else {
        Err(FleetError::InstallFailed(output.stderr))
    }
}

/// `pnpm.installAndBuild`: install then run the `build` script.
pub async fn pnpm_install_and_build(ports: &Ports, cwd: &Utf8Path) -> Result<Vec<String>> {
    let install = ports.package.install(cwd, &[], false).await?;
    if !install.success {
        return Err(FleetError::InstallFailed(install.stderr));
    }
    let build = ports.package.run(cwd, "build").await?;
    if !build.success {
        return Err(FleetError::BuildFailed(build.stderr));
    }
    Ok(vec![
        format!("installed in {:?}", install.duration),
        format!("built in {:?}", build.duration),
    ])
}

/// `git.commitAndPush`.
pub async fn git_commit_and_push(ports: &Ports, cwd: &Utf8Path, message: &str) -> Result<()> {
    ports.git.add(cwd, true).await.map_err(as_git_failure("add"))?;
    ports
        .git
        .commit(cwd, message)
        .await
        .map_err(as_git_failure("commit"))?;
    ports.git.push(cwd).await.map_err(as_git_failure("push"))
}

/// `git.initWorkflow`: init a fresh repo and make the initial commit.
pub async fn git_init_workflow(ports: &Ports, cwd: &Utf8Path) -> Result<()> {
    ports.git.init(cwd).await.map_err(as_git_failure("init"))?;
    ports
        .git
        .add(cwd, true)
        .await
        .map_err(as_git_failure("add"))?;
    ports
        .git
        .commit(cwd, "Initial commit")
        .await
        .map(|_| ())
        .map_err(as_git_failure("commit"))
}

/// `git.pull`.
pub async fn git_pull(ports: &Ports, cwd: &Utf8Path) -> Result<crate::ports::GitPullResult> {
    ports.git.pull(cwd, None, false).await.map_err(as_git_failure("pull"))
}

fn as_git_failure(phase: &'static str) -> impl Fn(FleetError) -> FleetError {
    move |e| match e {
        FleetError::GitFailed { .. } => e,
        other => FleetError::GitFailed {
            phase: phase.to_string(),
            cause: other.to_string(),
        },
    }
}
