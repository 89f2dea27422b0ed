//! Package descriptors: discovered metadata for one repository (spec §3).

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Discovered metadata for one repository, produced by the Scanner (C5) for
/// each listed package. Not persisted — rebuilt fresh every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub repo_path: Utf8PathBuf,
    pub git_remote: Option<String>,
    pub current_branch: Option<String>,
    /// Names of other packages this one depends on via an ecosystem-owned
    /// git ref (i.e. the `package.json` dependency keys whose version string
    /// passed [`crate::git_ref::is_internal_ref`]), in declaration order.
    pub internal_deps: Vec<String>,
}
