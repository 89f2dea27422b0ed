//! Registers the external-procedure contracts of spec §6 (`fs.*`, `git.*`,
//! `pnpm.*`) as native [`Registry`] handlers bound to a concrete [`Ports`]
//! bundle, so that aggregation steps (`proc: ["fs", "mkdir"]`, etc.) have
//! something real to dispatch to. `client.*` needs no registration — the
//! interpreter handles that namespace inline (spec §4.7.2).

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::ports::Ports;
use crate::registry::{NativeHandler, ProcedureBody, Registry};

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

fn field<T: serde::de::DeserializeOwned>(input: &Value, key: &str) -> Result<T> {
    let raw = input.get(key).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw)
        .map_err(|e| FleetError::Other(anyhow::anyhow!("field {key:?}: {e}")))
}

fn optional_field<T: serde::de::DeserializeOwned + Default>(input: &Value, key: &str) -> T {
    input
        .get(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

macro_rules! register {
    ($registry:expr, $path:expr, $body:expr) => {
        $registry
            .register($path, ProcedureBody::Native($body), BTreeMap::new(), false)
            .expect("contract procedures are registered exactly once at startup")
    };
}

/// Register every `fs.*`, `git.*`, `pnpm.install`/`pnpm.run` contract named
/// in spec §6, closing each handler over `ports`.
pub fn register_contracts(registry: &Arc<Registry>, ports: Ports) {
    register_fs(registry, ports.clone());
    register_git(registry, ports.clone());
    register_pnpm(registry, ports);
}

fn register_fs(registry: &Arc<Registry>, ports: Ports) {
    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let path: Utf8PathBuf = field(&input, "path")?;
            Ok(serde_json::json!({ "exists": p.fs.exists(&path).await }))
        })
    });
    register!(registry, path(&["fs", "exists"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let path: Utf8PathBuf = field(&input, "path")?;
            let recursive: bool = optional_field(&input, "recursive");
            p.fs.mkdir(&path, recursive).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["fs", "mkdir"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let path: Utf8PathBuf = field(&input, "path")?;
            Ok(serde_json::json!({ "data": p.fs.read_json(&path).await? }))
        })
    });
    register!(registry, path(&["fs", "read", "json"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let path: Utf8PathBuf = field(&input, "path")?;
            let content: String = field(&input, "content")?;
            p.fs.write(&path, content).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["fs", "write"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let path: Utf8PathBuf = field(&input, "path")?;
            let recursive: bool = optional_field(&input, "recursive");
            let force: bool = optional_field(&input, "force");
            p.fs.rm(&path, recursive, force).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["fs", "rm"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let pattern: String = field(&input, "pattern")?;
            let cwd: Option<Utf8PathBuf> = input.get("cwd").cloned().and_then(|v| serde_json::from_value(v).ok());
            let ignore: Vec<String> = optional_field(&input, "ignore");
            let files = p.fs.glob(&pattern, cwd.as_deref(), &ignore).await?;
            Ok(serde_json::json!({ "files": files }))
        })
    });
    register!(registry, path(&["fs", "glob"]), handler);

    let p = ports;
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let path: Utf8PathBuf = field(&input, "path")?;
            let entries = p.fs.readdir(&path).await?;
            let entries: Vec<Value> = entries
                .into_iter()
                .map(|(name, kind)| serde_json::json!({ "name": name, "type": format!("{kind:?}") }))
                .collect();
            Ok(serde_json::json!({ "entries": entries }))
        })
    });
    register!(registry, path(&["fs", "readdir"]), handler);
}

fn register_git(registry: &Arc<Registry>, ports: Ports) {
    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let all: bool = optional_field(&input, "all");
            p.git.add(&cwd, all).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["git", "add"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let message: String = field(&input, "message")?;
            let hash = p.git.commit(&cwd, &message).await?;
            Ok(serde_json::json!({ "hash": hash }))
        })
    });
    register!(registry, path(&["git", "commit"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            p.git.push(&cwd).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["git", "push"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let remote: Option<String> = input.get("remote").and_then(Value::as_str).map(str::to_string);
            let rebase: bool = optional_field(&input, "rebase");
            let result = p.git.pull(&cwd, remote.as_deref(), rebase).await?;
            Ok(serde_json::json!({ "commits": result.commits, "fastForward": result.fast_forward }))
        })
    });
    register!(registry, path(&["git", "pull"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let url: String = field(&input, "url")?;
            let dest: Utf8PathBuf = field(&input, "dest")?;
            let branch: Option<String> = input.get("branch").and_then(Value::as_str).map(str::to_string);
            p.git.clone(&url, &dest, branch.as_deref()).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["git", "clone"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            p.git.init(&cwd).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["git", "init"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let ref_: String = field(&input, "ref")?;
            p.git.checkout(&cwd, &ref_).await?;
            Ok(Value::Null)
        })
    });
    register!(registry, path(&["git", "checkout"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let branches = p.git.branch(&cwd).await?;
            let branches: Vec<Value> = branches.into_iter().map(|name| serde_json::json!({ "name": name })).collect();
            Ok(serde_json::json!({ "branches": branches }))
        })
    });
    register!(registry, path(&["git", "branch"]), handler);

    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let name: String = optional_field(&input, "name");
            let name = if name.is_empty() { "origin".to_string() } else { name };
            let url = p.git.remote(&cwd, &name).await?;
            Ok(serde_json::json!({ "url": url }))
        })
    });
    register!(registry, path(&["git", "remote"]), handler);

    let p = ports;
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let status = p.git.status(&cwd).await?;
            let files: Vec<Value> = status
                .files
                .into_iter()
                .map(|f| serde_json::json!({ "path": f.path, "status": f.status, "staged": f.staged }))
                .collect();
            Ok(serde_json::json!({
                "branch": status.branch,
                "ahead": status.ahead,
                "behind": status.behind,
                "files": files,
                "clean": status.clean,
            }))
        })
    });
    register!(registry, path(&["git", "status"]), handler);
}

fn register_pnpm(registry: &Arc<Registry>, ports: Ports) {
    let p = ports.clone();
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let packages: Vec<String> = optional_field(&input, "packages");
            let dev: bool = optional_field(&input, "dev");
            let output = p.package.install(&cwd, &packages, dev).await?;
            Ok(command_output_to_value(&output))
        })
    });
    register!(registry, path(&["pnpm", "install"]), handler);

    let p = ports;
    let handler: NativeHandler = Arc::new(move |_h, input| {
        let p = p.clone();
        Box::pin(async move {
            let cwd: Utf8PathBuf = field(&input, "cwd")?;
            let script: String = field(&input, "script")?;
            let output = p.package.run(&cwd, &script).await?;
            Ok(command_output_to_value(&output))
        })
    });
    register!(registry, path(&["pnpm", "run"]), handler);
}

fn command_output_to_value(output: &crate::ports::CommandOutput) -> Value {
    serde_json::json!({
        "success": output.success,
        "exitCode": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
        "duration": output.duration.as_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MockFsPort, MockGitPort, MockPackagePort, MockProcessPort};

    #[tokio::test]
    async fn fs_exists_contract_dispatches_to_the_bound_port() {
        let mut fs = MockFsPort::new();
        fs.expect_exists().returning(|_| true);
        let ports = Ports {
            fs: Arc::new(fs),
            process: Arc::new(MockProcessPort::new()),
            package: Arc::new(MockPackagePort::new()),
            git: Arc::new(MockGitPort::new()),
        };

        let registry = Registry::new();
        register_contracts(&registry, ports);

        let result = registry
            .clone()
            .call(&path(&["fs", "exists"]), serde_json::json!({ "path": "/tmp/widgets" }))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({ "exists": true }));
    }

    #[tokio::test]
    async fn pnpm_install_contract_round_trips_command_output() {
        let mut package = MockPackagePort::new();
        package.expect_install().returning(|_, _, _| {
            Ok(crate::ports::CommandOutput {
                success: true,
                exit_code: 0,
                stdout: "done".to_string(),
                stderr: String::new(),
                duration: std::time::Duration::from_millis(5),
            })
        });
        let ports = Ports {
            fs: Arc::new(MockFsPort::new()),
            process: Arc::new(MockProcessPort::new()),
            package: Arc::new(package),
            git: Arc::new(MockGitPort::new()),
        };

        let registry = Registry::new();
        register_contracts(&registry, ports);

        let result = registry
            .clone()
            .call(&path(&["pnpm", "install"]), serde_json::json!({ "cwd": "/repos/widgets" }))
            .await
            .unwrap();
        assert_eq!(result["success"], serde_json::json!(true));
        assert_eq!(result["stdout"], serde_json::json!("done"));
    }
}
