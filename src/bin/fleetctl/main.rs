use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use fleetctl::manifest;
use fleetctl::ports::Ports;
use fleetctl::rename;
use fleetctl::workflows::library::{
    self, BuildOptions, CloneOptions, InstallOptions, NewOptions, PullOptions, RefreshOptions, RefreshScope,
};

use crate::args::{Args, Command};

mod args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fleetctl::tracing_init::init(args.verbose);

    let root = match args.root {
        Some(root) => root,
        None => Utf8PathBuf::from_path_buf(std::env::current_dir().context("reading current directory")?)
            .map_err(|path| anyhow::anyhow!("current directory {path:?} is not valid UTF-8"))?,
    };

    let ports = Ports::real();

    match args.command {
        Command::Install {
            dry_run,
            continue_on_error,
            concurrency,
        } => {
            let result = library::install(
                &ports,
                &root,
                &InstallOptions {
                    dry_run,
                    continue_on_error,
                    concurrency,
                },
            )
            .await?;
            println!("cloned: {:?}", result.cloned);
            println!("skipped (already present): {:?}", result.skipped);
            if !result.errors.is_empty() {
                println!("errors: {:?}", result.errors);
            }
            if !result.success {
                anyhow::bail!("install failed");
            }
        }

        Command::Clone {
            dry_run,
            continue_on_error,
        } => {
            let result = library::clone(
                &ports,
                &root,
                &CloneOptions {
                    dry_run,
                    continue_on_error,
                },
            )
            .await?;
            println!("cloned: {:?}", result.cloned);
            println!("skipped (already present): {:?}", result.skipped);
            if !result.errors.is_empty() {
                println!("errors: {:?}", result.errors);
            }
            if !result.success {
                anyhow::bail!("clone failed");
            }
        }

        Command::Build {
            dry_run,
            continue_on_error,
            concurrency,
        } => {
            let result = library::build(
                &ports,
                &root,
                &BuildOptions {
                    dry_run,
                    continue_on_error,
                    concurrency,
                },
            )
            .await?;
            for node_result in result.results.values() {
                println!(
                    "{}: {}",
                    node_result.node,
                    if node_result.success { "ok" } else { "failed" }
                );
            }
            if !result.success {
                anyhow::bail!("build failed");
            }
        }

        Command::Refresh {
            recursive,
            package,
            force,
            skip_git,
            dry_run,
            concurrency,
            auto_confirm,
        } => {
            let scope = match (&recursive, &package) {
                (Some(name), None) => RefreshScope::Recursive(name),
                (None, Some(name)) => RefreshScope::Single(name),
                (None, None) => RefreshScope::All,
                (Some(_), Some(_)) => unreachable!("clap enforces --recursive and --package are mutually exclusive"),
            };
            let result = library::refresh(
                &ports,
                &root,
                scope,
                &RefreshOptions {
                    force,
                    skip_git,
                    dry_run,
                    concurrency,
                    auto_confirm,
                },
            )
            .await?;
            for node_result in result.results.values() {
                println!(
                    "{}: {}",
                    node_result.node,
                    if node_result.success { "ok" } else { "failed" }
                );
            }
            if !result.success {
                anyhow::bail!("refresh failed");
            }
        }

        Command::Pull {
            remote,
            rebase,
            dry_run,
            continue_on_error,
            concurrency,
        } => {
            let result = library::pull(
                &ports,
                &root,
                &PullOptions {
                    remote,
                    rebase,
                    dry_run,
                    continue_on_error,
                    concurrency,
                },
            )
            .await?;
            for node_result in result.results.values() {
                println!(
                    "{}: {}",
                    node_result.node,
                    if node_result.success { "ok" } else { "failed" }
                );
            }
            if !result.success {
                anyhow::bail!("pull failed");
            }
        }

        Command::New {
            name,
            preset,
            skip_git,
            skip_manifest,
            dry_run,
            create_remote,
            repo_owner,
        } => {
            let result = library::new_package(
                &ports,
                &name,
                &preset,
                &root,
                &NewOptions {
                    skip_git,
                    skip_manifest,
                    dry_run,
                    create_remote,
                    repo_owner,
                },
            )
            .await?;
            println!("path: {}", result.path);
            for op in &result.planned_operations {
                println!("  {op}");
            }
            if !result.success {
                anyhow::bail!("new failed");
            }
        }

        Command::Rename {
            old_name,
            new_name,
            dry_run,
        } => {
            let manifest = manifest::read(&root).await.context("reading manifest")?;
            let plan = rename::rename(&manifest, &root, &old_name, &new_name, ports.fs.as_ref(), dry_run).await?;
            for change in &plan.changes {
                println!("{}: {:?} {:?} -> {:?}", change.path, change.kind, change.before, change.after);
            }
            if dry_run {
                println!("(dry run, no files were changed)");
            }
        }

        Command::Audit { fix } => {
            let result = library::audit(&ports, &root, fix).await?;
            for package in &result.packages {
                println!(
                    "{}: {}{}",
                    package.name,
                    if package.valid { "ok" } else { "invalid" },
                    if package.fixed > 0 {
                        format!(" ({} fixed)", package.fixed)
                    } else {
                        String::new()
                    }
                );
                for issue in &package.issues {
                    println!("  {issue}");
                }
                for missing in &package.missing {
                    println!("  missing: {missing}");
                }
            }
            if !result.success {
                anyhow::bail!("audit found unresolved issues");
            }
        }
    }

    Ok(())
}
