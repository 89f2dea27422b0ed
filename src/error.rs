//! Typed error taxonomy for the orchestration core (spec §7).
//!
//! Every C1–C10 function returns `Result<T, FleetError>`. The CLI binary
//! converts these into `anyhow::Error` at the edge via `?`, the way the
//! teacher's binaries wrap library errors with `anyhow::Context`.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::graph::PackageName;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("ecosystem manifest not found at {0}")]
    ManifestMissing(Utf8PathBuf),

    #[error("ecosystem manifest at {path} is invalid: {cause}")]
    ManifestInvalid { path: Utf8PathBuf, cause: String },

    #[error("package {0:?} is referenced but was not scanned from disk")]
    PackageNotScanned(PackageName),

    #[error("dependency cycle detected among packages: {0:?}")]
    CycleDetected(Vec<PackageName>),

    #[error("cleanup of {path} failed: {cause}")]
    CleanupFailed { path: Utf8PathBuf, cause: String },

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("git {phase} failed: {cause}")]
    GitFailed { phase: String, cause: String },

    #[error("cloning {url} failed: {cause}")]
    CloneFailed { url: String, cause: String },

    #[error("invalid reference rule: {0}")]
    RefRuleViolation(String),

    #[error("no procedure registered at path {0:?}")]
    ProcedureNotFound(Vec<String>),

    #[error("{phase} timed out")]
    Timeout { phase: String },

    #[error("aggregation nesting exceeded the maximum depth ({0})")]
    AggregationTooDeep(usize),

    #[error("target path already exists: {0}")]
    TargetExists(Utf8PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
