//! Graph Builder (C2): turns scanned packages into a dependency graph of
//! ecosystem-internal edges (spec §4.2).

use std::collections::{HashMap, HashSet, VecDeque};

use camino::Utf8PathBuf;
use petgraph::{graph::NodeIndex, prelude::StableGraph, Directed};
use serde::{Deserialize, Serialize};

use crate::git_ref::GitRef;
use crate::package::PackageDescriptor;

pub type PackageName = String;

pub const DEFAULT_PRIMARY_BRANCH: &str = "main";

/// A graph vertex built from one package descriptor (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub name: PackageName,
    pub repo_path: Utf8PathBuf,
    pub git_ref: GitRef,
    pub required_branch: String,
    /// Only dependency names that also appear in the graph; out-of-ecosystem
    /// deps are silently dropped here (spec §3 invariants).
    pub dependencies: Vec<PackageName>,
    /// Assigned by the Topological Leveler (C3); `None` before leveling.
    pub level: Option<usize>,
}

/// A `name -> DAGNode` mapping plus the `petgraph` structure used for
/// auxiliary traversals (`filterFromRoot`, `ancestors`, `descendants`).
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<PackageName, DagNode>,
    graph: StableGraph<PackageName, (), Directed>,
    index_by_name: HashMap<PackageName, NodeIndex>,
}

impl DependencyGraph {
    pub fn nodes(&self) -> &HashMap<PackageName, DagNode> {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&DagNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// DFS forward over `dependencies` edges starting at `name`, returning
    /// only reachable nodes (including `name` itself). Used to scope an
    /// operation to one target and its prerequisites (spec §4.2).
    pub fn filter_from_root(&self, name: &str) -> DependencyGraph {
        let mut reachable = HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for dep in &node.dependencies {
                    stack.push(dep.clone());
                }
            }
        }
        self.subgraph(&reachable)
    }

    /// Transitive dependencies of `name` (not including `name` itself).
    pub fn ancestors(&self, name: &str) -> HashSet<PackageName> {
        let mut visited = HashSet::new();
        let mut stack: Vec<PackageName> = self
            .nodes
            .get(name)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if visited.insert(current.clone()) {
                if let Some(node) = self.nodes.get(&current) {
                    stack.extend(node.dependencies.clone());
                }
            }
        }
        visited
    }

    /// Transitive dependents of `name`, using the reverse-edge index built
    /// on demand (spec §4.2).
    pub fn descendants(&self, name: &str) -> HashSet<PackageName> {
        let reverse = self.reverse_edges();
        let mut visited = HashSet::new();
        let mut stack: Vec<PackageName> = reverse.get(name).cloned().unwrap_or_default();
        while let Some(current) = stack.pop() {
            if visited.insert(current.clone()) {
                stack.extend(reverse.get(&current).cloned().unwrap_or_default());
            }
        }
        visited
    }

    pub(crate) fn reverse_edges(&self) -> HashMap<PackageName, Vec<PackageName>> {
        let mut reverse: HashMap<PackageName, Vec<PackageName>> = HashMap::new();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                reverse.entry(dep.clone()).or_default().push(node.name.clone());
            }
        }
        reverse
    }

    fn subgraph(&self, keep: &HashSet<PackageName>) -> DependencyGraph {
        let nodes: HashMap<PackageName, DagNode> = self
            .nodes
            .iter()
            .filter(|(name, _)| keep.contains(*name))
            .map(|(name, node)| {
                let mut node = node.clone();
                node.dependencies.retain(|dep| keep.contains(dep));
                (name.clone(), node)
            })
            .collect();
        build_petgraph(nodes)
    }
}

fn build_petgraph(nodes: HashMap<PackageName, DagNode>) -> DependencyGraph {
    let mut graph = StableGraph::new();
    let mut index_by_name = HashMap::new();
    for name in nodes.keys() {
        index_by_name.insert(name.clone(), graph.add_node(name.clone()));
    }
    for node in nodes.values() {
        let from = index_by_name[&node.name];
        for dep in &node.dependencies {
            if let Some(&to) = index_by_name.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }
    DependencyGraph {
        nodes,
        graph,
        index_by_name,
    }
}

/// Build a [`DependencyGraph`] from scanned descriptors. Dependencies that
/// aren't among the scanned packages are dropped silently — they're
/// out-of-ecosystem and not orchestrated (spec §3 invariants).
pub fn build(descriptors: &[PackageDescriptor], primary_branch: &str) -> DependencyGraph {
    let scanned_names: HashSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();

    let nodes = descriptors
        .iter()
        .map(|descriptor| {
            let dependencies: Vec<PackageName> = descriptor
                .internal_deps
                .iter()
                .filter(|dep| scanned_names.contains(dep.as_str()))
                .cloned()
                .collect();

            let required_branch = descriptor
                .current_branch
                .clone()
                .unwrap_or_else(|| primary_branch.to_string());

            let git_ref = synthesize_git_ref(descriptor, &required_branch);

            let node = DagNode {
                name: descriptor.name.clone(),
                repo_path: descriptor.repo_path.clone(),
                git_ref,
                required_branch,
                dependencies,
                level: None,
            };
            (descriptor.name.clone(), node)
        })
        .collect::<HashMap<_, _>>();

    build_petgraph(nodes)
}

/// Synthesize `gitRef` from the remote URL if present, else fabricate a
/// canonical string from owner/name/branch (spec §4.2).
fn synthesize_git_ref(descriptor: &PackageDescriptor, required_branch: &str) -> GitRef {
    if let Some(remote) = &descriptor.git_remote {
        if let Some((host, owner)) = split_remote(remote) {
            return GitRef::synthesize(&host, &owner, &descriptor.name, required_branch);
        }
    }
    GitRef::synthesize(
        "local",
        crate::git_ref::ECOSYSTEM_OWNER,
        &descriptor.name,
        required_branch,
    )
}

/// Best-effort `host:owner` extraction from a git remote URL
/// (`git@host:owner/repo.git` or `https://host/owner/repo.git`).
fn split_remote(remote: &str) -> Option<(String, String)> {
    let without_scheme = remote
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git@");
    let without_scheme = without_scheme.replacen(':', "/", 1);
    let mut parts = without_scheme.trim_end_matches(".git").splitn(3, '/');
    let host = parts.next()?.to_string();
    let owner = parts.next()?.to_string();
    Some((host, owner))
}

/// A handful of unconnected-dependency removals, forward-only traversal
/// that doesn't require the DAG to be acyclic (used before leveling has run
/// to validate what the graph will contain).
pub fn names_reachable_from(graph: &DependencyGraph, roots: &[PackageName]) -> HashSet<PackageName> {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<PackageName> = roots.iter().cloned().collect();
    while let Some(name) = queue.pop_front() {
        if visited.insert(name.clone()) {
            if let Some(node) = graph.get(&name) {
                queue.extend(node.dependencies.clone());
            }
        }
    }
    visited
}
