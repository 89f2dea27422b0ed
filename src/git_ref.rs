//! Parsing and classification of `host:owner/repo#ref` dependency strings
//! (spec §4.1, §6).

use std::sync::LazyLock;

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The owner prefix that marks a dependency as belonging to this ecosystem.
/// Only refs whose `owner` matches this are followed for graph edges; all
/// other git-specified deps are opaque to the orchestrator (spec §4.1).
pub const ECOSYSTEM_OWNER: &str = "ecosystem";

static GIT_REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<host>\w+):(?P<owner>[^/]+)/(?P<repo>[^#]+)#(?P<ref_>.+)$").unwrap());

/// A parsed `host:owner/repo#ref` dependency specifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display("{raw}")]
pub struct GitRef {
    pub raw: String,
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub ref_: String,
}

impl GitRef {
    /// Parse a dependency version string. Returns `None` for anything that
    /// doesn't match the grammar; a non-match is not an error, it just means
    /// the dependency isn't ecosystem-internal (spec §4.1).
    pub fn parse(raw: &str) -> Option<GitRef> {
        let captures = GIT_REF_PATTERN.captures(raw)?;
        Some(GitRef {
            raw: raw.to_string(),
            host: captures["host"].to_string(),
            owner: captures["owner"].to_string(),
            repo: captures["repo"].to_string(),
            ref_: captures["ref_"].to_string(),
        })
    }

    /// Synthesize a canonical ref string from parts, used when no git remote
    /// is available to read one from (spec §4.2).
    pub fn synthesize(host: &str, owner: &str, repo: &str, ref_: &str) -> GitRef {
        GitRef {
            raw: format!("{host}:{owner}/{repo}#{ref_}"),
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            ref_: ref_.to_string(),
        }
    }
}

/// True if `dep` is a ref string whose owner identifies it as belonging to
/// this ecosystem (and therefore should induce a graph edge).
pub fn is_internal_ref(dep: &str) -> bool {
    GitRef::parse(dep)
        .map(|parsed| parsed.owner == ECOSYSTEM_OWNER)
        .unwrap_or(false)
}
