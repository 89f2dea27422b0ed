//! Topological Leveler (C3): Kahn-style level assignment with cycle
//! detection (spec §4.3, §8 invariants 1–3).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FleetError, Result};
use crate::graph::{DagNode, DependencyGraph, PackageName};

/// The leveled execution plan (spec §3 "Leveled graph").
#[derive(Debug, Clone)]
pub struct LeveledGraph {
    nodes: HashMap<PackageName, DagNode>,
    levels: Vec<HashSet<PackageName>>,
    roots: HashSet<PackageName>,
    leaves: HashSet<PackageName>,
}

impl LeveledGraph {
    pub fn nodes(&self) -> &HashMap<PackageName, DagNode> {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&DagNode> {
        self.nodes.get(name)
    }

    pub fn levels(&self) -> &[HashSet<PackageName>] {
        &self.levels
    }

    pub fn roots(&self) -> &HashSet<PackageName> {
        &self.roots
    }

    pub fn leaves(&self) -> &HashSet<PackageName> {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Assign levels to every node in `graph`. Fails with
/// [`FleetError::CycleDetected`] (payload: every node with a non-zero
/// residual in-degree) if the graph isn't acyclic.
pub fn level(graph: &DependencyGraph) -> Result<LeveledGraph> {
    let nodes = graph.nodes();
    let reverse = graph.reverse_edges();

    let mut in_degree: HashMap<PackageName, usize> = nodes
        .values()
        .map(|node| (node.name.clone(), node.dependencies.len()))
        .collect();

    let mut frontier: VecDeque<PackageName> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(name, _)| name.clone())
        .collect();

    let mut levels: Vec<HashSet<PackageName>> = Vec::new();
    while !frontier.is_empty() {
        let current_level: HashSet<PackageName> = frontier.drain(..).collect();

        let mut next_frontier = Vec::new();
        for name in &current_level {
            for dependent in reverse.get(name).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent listed in reverse edges must be a known node");
                *degree -= 1;
                if *degree == 0 {
                    next_frontier.push(dependent.clone());
                }
            }
        }
        levels.push(current_level);
        frontier.extend(next_frontier);
    }

    let emitted: usize = levels.iter().map(|l| l.len()).sum();
    if emitted < nodes.len() {
        let mut stuck: Vec<PackageName> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name)
            .collect();
        stuck.sort();
        return Err(FleetError::CycleDetected(stuck));
    }

    let mut leveled_nodes = nodes.clone();
    for (level_index, names) in levels.iter().enumerate() {
        for name in names {
            if let Some(node) = leveled_nodes.get_mut(name) {
                node.level = Some(level_index);
            }
        }
    }

    let roots: HashSet<PackageName> = nodes
        .keys()
        .filter(|name| reverse.get(*name).map(|d| d.is_empty()).unwrap_or(true))
        .cloned()
        .collect();
    let leaves: HashSet<PackageName> = nodes
        .values()
        .filter(|node| node.dependencies.is_empty())
        .map(|node| node.name.clone())
        .collect();

    Ok(LeveledGraph {
        nodes: leveled_nodes,
        levels,
        roots,
        leaves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{self, DEFAULT_PRIMARY_BRANCH};
    use crate::package::PackageDescriptor;
    use camino::Utf8PathBuf;

    fn descriptor(name: &str, deps: &[&str]) -> PackageDescriptor {
        PackageDescriptor {
            name: name.to_string(),
            repo_path: Utf8PathBuf::from(format!("/repos/{name}")),
            git_remote: None,
            current_branch: Some("main".to_string()),
            internal_deps: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    /// Scenario 1 — Trivial level assignment (spec §8).
    #[test]
    fn trivial_level_assignment() {
        let descriptors = vec![
            descriptor("a", &[]),
            descriptor("b", &["a"]),
            descriptor("c", &["a", "b"]),
        ];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let leveled = level(&graph).unwrap();

        assert_eq!(leveled.levels().len(), 3);
        assert_eq!(leveled.levels()[0], ["a".to_string()].into_iter().collect());
        assert_eq!(leveled.levels()[1], ["b".to_string()].into_iter().collect());
        assert_eq!(leveled.levels()[2], ["c".to_string()].into_iter().collect());
        assert_eq!(leveled.roots(), &["c".to_string()].into_iter().collect());
        assert_eq!(leveled.leaves(), &["a".to_string()].into_iter().collect());
    }

    /// Scenario 2 — Cycle (spec §8).
    #[test]
    fn cycle_is_detected() {
        let descriptors = vec![
            descriptor("a", &["c"]),
            descriptor("b", &["a"]),
            descriptor("c", &["b"]),
        ];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let err = level(&graph).unwrap_err();
        match err {
            FleetError::CycleDetected(mut names) => {
                names.sort();
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    /// Invariant 1/2: topological ordering + coverage, for a diamond graph.
    #[test]
    fn diamond_dependency_respects_ordering_and_coverage() {
        let descriptors = vec![
            descriptor("base", &[]),
            descriptor("left", &["base"]),
            descriptor("right", &["base"]),
            descriptor("top", &["left", "right"]),
        ];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let leveled = level(&graph).unwrap();

        let level_of = |name: &str| leveled.get(name).unwrap().level.unwrap();
        assert!(level_of("base") < level_of("left"));
        assert!(level_of("base") < level_of("right"));
        assert!(level_of("left") < level_of("top"));
        assert!(level_of("right") < level_of("top"));

        let covered: usize = leveled.levels().iter().map(|l| l.len()).sum();
        assert_eq!(covered, 4);
    }
}
