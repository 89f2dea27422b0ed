use camino::Utf8PathBuf;
use clap::{command, Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "fleetctl", author, about, version)]
pub struct Args {
    /// Be verbose. Given twice for debug output, three times for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Root of the ecosystem (directory containing `fleet.json`). Defaults
    /// to the current directory.
    #[arg(long, global = true)]
    pub root: Option<Utf8PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Clone every package listed in the manifest that isn't already on
    /// disk, then install and build the whole dependency graph in order.
    Install {
        /// Plan the operations without cloning or installing anything.
        #[arg(long)]
        dry_run: bool,
        /// Keep going after a package fails instead of stopping the run.
        #[arg(long)]
        continue_on_error: bool,
        /// Maximum number of packages to process concurrently per level.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Clone every package listed in the manifest that isn't already on
    /// disk, without installing or building anything.
    Clone {
        /// Plan the operations without cloning anything.
        #[arg(long)]
        dry_run: bool,
        /// Keep going after a package fails instead of stopping the run.
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Install dependencies and run the `build` script across the whole
    /// dependency graph already present on disk, without cloning anything.
    Build {
        /// Plan the operations without installing or building anything.
        #[arg(long)]
        dry_run: bool,
        /// Keep going after a package fails instead of stopping the run.
        #[arg(long)]
        continue_on_error: bool,
        /// Maximum number of packages to process concurrently per level.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Refresh one package, a subtree rooted at a package, or the whole
    /// ecosystem: reinstall, rebuild, and (unless skipped) commit and push.
    Refresh {
        /// Limit the refresh to this package and its dependents.
        #[arg(long, conflicts_with = "package")]
        recursive: Option<String>,
        /// Refresh only this single package.
        #[arg(long, conflicts_with = "recursive")]
        package: Option<String>,
        /// Wipe build artifacts (node_modules, dist, lockfile) before
        /// reinstalling.
        #[arg(long)]
        force: bool,
        /// Skip the commit-and-push step.
        #[arg(long)]
        skip_git: bool,
        /// Plan the operations without touching any file.
        #[arg(long)]
        dry_run: bool,
        /// Maximum number of packages to process concurrently per level.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Keep going after a package fails instead of stopping the run.
        #[arg(long)]
        auto_confirm: bool,
    },

    /// Pull the latest changes for every package in dependency order.
    Pull {
        /// Remote to pull from (defaults to the branch's configured remote).
        #[arg(long)]
        remote: Option<String>,
        /// Rebase local commits onto the pulled branch instead of merging.
        #[arg(long)]
        rebase: bool,
        /// Plan the operations without pulling anything.
        #[arg(long)]
        dry_run: bool,
        /// Keep going after a package fails instead of stopping the run.
        #[arg(long)]
        continue_on_error: bool,
        /// Maximum number of packages to process concurrently per level.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Scaffold a new package from a preset and register it in the
    /// manifest.
    New {
        /// Name of the new package.
        name: String,
        /// Scaffold preset to generate from.
        #[arg(long, default_value = "default")]
        preset: String,
        /// Skip `git init` and the initial commit.
        #[arg(long)]
        skip_git: bool,
        /// Don't register the package in the manifest.
        #[arg(long)]
        skip_manifest: bool,
        /// Plan the operations without creating anything.
        #[arg(long)]
        dry_run: bool,
        /// Also create a remote repository for the new package.
        #[arg(long)]
        create_remote: bool,
        /// Owner/org to create the remote repository under, required when
        /// `--create-remote` is set.
        #[arg(long, requires = "create_remote")]
        repo_owner: Option<String>,
    },

    /// Rename a package across the manifest, every dependency map that
    /// references it, and source-text import specifiers.
    Rename {
        /// Current package name.
        old_name: String,
        /// New package name.
        new_name: String,
        /// Plan the changes without writing any file.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check every manifest package against its project template and
    /// flag external git-ref dependencies missing from the
    /// `pnpm.onlyBuiltDependencies` allowlist.
    Audit {
        /// Create missing whitelisted directories instead of only
        /// reporting them.
        #[arg(long)]
        fix: bool,
    },
}
