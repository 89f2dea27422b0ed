//! Graph Executor (C4): runs a per-node processor across a leveled plan with
//! bounded concurrency, fail-fast/continue policies (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::graph::{DagNode, PackageName};
use crate::leveler::LeveledGraph;

/// A per-node processor: given a node, perform whatever work the workflow
/// requires and return its log lines, or a failure.
pub type NodeProcessor =
    Arc<dyn Fn(DagNode) -> BoxFuture<'static, anyhow::Result<Vec<String>>> + Send + Sync>;

pub type NodeCallback = Arc<dyn Fn(&PackageName) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum per-node processor invocations in flight within one level.
    pub concurrency: usize,
    /// On the first per-node failure, stop starting new nodes; in-flight
    /// nodes complete normally (spec §4.4).
    pub fail_fast: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            concurrency: 4,
            fail_fast: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node: PackageName,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub logs: Vec<String>,
    pub skipped: bool,
}

impl NodeResult {
    fn skipped(node: PackageName) -> Self {
        NodeResult {
            node,
            success: false,
            error: Some("skipped: fail-fast halted further scheduling".to_string()),
            duration: Duration::ZERO,
            logs: Vec::new(),
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphResult {
    pub results: HashMap<PackageName, NodeResult>,
    pub success: bool,
    pub total_duration: Duration,
}

/// Run `processor` over every node of `graph`, level by level, honoring
/// `options.concurrency` within each level and `options.fail_fast` across
/// the whole run.
pub async fn execute(
    graph: &LeveledGraph,
    processor: NodeProcessor,
    options: ExecutorOptions,
    on_node_start: Option<NodeCallback>,
    on_node_complete: Option<NodeCallback>,
) -> GraphResult {
    let started_at = Instant::now();
    let failed = Arc::new(AtomicBool::new(false));
    let mut results: HashMap<PackageName, NodeResult> = HashMap::new();

    for level_names in graph.levels() {
        if failed.load(Ordering::SeqCst) && options.fail_fast {
            for name in level_names {
                results.insert(name.clone(), NodeResult::skipped(name.clone()));
            }
            continue;
        }

        let level_results = run_level(
            level_names.iter().cloned().collect(),
            graph,
            processor.clone(),
            &options,
            failed.clone(),
            on_node_start.clone(),
            on_node_complete.clone(),
        )
        .await;
        results.extend(level_results);
    }

    let success = results.values().all(|r| r.success);
    GraphResult {
        results,
        success,
        total_duration: started_at.elapsed(),
    }
}

async fn run_level(
    names: Vec<PackageName>,
    graph: &LeveledGraph,
    processor: NodeProcessor,
    options: &ExecutorOptions,
    failed: Arc<AtomicBool>,
    on_node_start: Option<NodeCallback>,
    on_node_complete: Option<NodeCallback>,
) -> HashMap<PackageName, NodeResult> {
    let concurrency = options.concurrency.max(1);
    let fail_fast = options.fail_fast;

    stream::iter(names.into_iter().filter_map(|name| {
        graph.get(&name).cloned().map(|node| (name, node))
    }))
    .map(|(name, node)| {
        let processor = processor.clone();
        let failed = failed.clone();
        let on_start = on_node_start.clone();
        let on_complete = on_node_complete.clone();
        async move {
            if fail_fast && failed.load(Ordering::SeqCst) {
                return (name.clone(), NodeResult::skipped(name));
            }

            if let Some(cb) = &on_start {
                cb(&name);
            }

            let started_at = Instant::now();
            let outcome = processor(node).await;
            let duration = started_at.elapsed();

            let result = match outcome {
                Ok(logs) => NodeResult {
                    node: name.clone(),
                    success: true,
                    error: None,
                    duration,
                    logs,
                    skipped: false,
                },
                Err(e) => {
                    failed.store(true, Ordering::SeqCst);
                    NodeResult {
                        node: name.clone(),
                        success: false,
                        error: Some(format!("{e:#}")),
                        duration,
                        logs: Vec::new(),
                        skipped: false,
                    }
                }
            };

            if let Some(cb) = &on_complete {
                cb(&name);
            }

            (name, result)
        }
    })
    .buffer_unordered(concurrency)
    .collect::<HashMap<_, _>>()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{self, DEFAULT_PRIMARY_BRANCH};
    use crate::leveler;
    use crate::package::PackageDescriptor;
    use camino::Utf8PathBuf;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    fn descriptor(name: &str, deps: &[&str]) -> PackageDescriptor {
        PackageDescriptor {
            name: name.to_string(),
            repo_path: Utf8PathBuf::from(format!("/repos/{name}")),
            git_remote: None,
            current_branch: Some("main".to_string()),
            internal_deps: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn processor_from(
        behavior: HashMap<&'static str, (StdDuration, bool)>,
    ) -> NodeProcessor {
        let behavior: HashMap<String, (StdDuration, bool)> = behavior
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Arc::new(move |node: DagNode| {
            let behavior = behavior.clone();
            Box::pin(async move {
                let (delay, should_succeed) = behavior
                    .get(&node.name)
                    .cloned()
                    .unwrap_or((StdDuration::from_millis(1), true));
                tokio::time::sleep(delay).await;
                if should_succeed {
                    Ok(vec![format!("ran {}", node.name)])
                } else {
                    Err(anyhow::anyhow!("boom in {}", node.name))
                }
            })
        })
    }

    /// Scenario 3a — Fail-fast refresh, independent nodes in one level: all
    /// three start because they were already submitted (spec §8).
    #[tokio::test]
    async fn independent_level_runs_all_submitted_nodes() {
        let descriptors = vec![
            descriptor("a", &[]),
            descriptor("b", &[]),
            descriptor("c", &[]),
        ];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let leveled = leveler::level(&graph).unwrap();

        let mut behavior = HashMap::new();
        behavior.insert("a", (StdDuration::from_millis(10), true));
        behavior.insert("b", (StdDuration::from_millis(5), false));
        behavior.insert("c", (StdDuration::from_millis(20), true));

        let result = execute(
            &leveled,
            processor_from(behavior),
            ExecutorOptions {
                concurrency: 3,
                fail_fast: true,
            },
            None,
            None,
        )
        .await;

        assert!(!result.success);
        assert!(result.results["a"].success);
        assert!(!result.results["b"].success);
        assert!(result.results["c"].success);
        assert!(!result.results["c"].skipped);
    }

    /// Scenario 3b — chained nodes: failure at B prevents C from starting.
    #[tokio::test]
    async fn fail_fast_skips_downstream_nodes() {
        let descriptors = vec![
            descriptor("a", &[]),
            descriptor("b", &["a"]),
            descriptor("c", &["b"]),
        ];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let leveled = leveler::level(&graph).unwrap();

        let mut behavior = HashMap::new();
        behavior.insert("a", (StdDuration::from_millis(1), true));
        behavior.insert("b", (StdDuration::from_millis(1), false));

        let result = execute(
            &leveled,
            processor_from(behavior),
            ExecutorOptions {
                concurrency: 4,
                fail_fast: true,
            },
            None,
            None,
        )
        .await;

        assert!(!result.success);
        assert!(result.results["a"].success);
        assert!(!result.results["b"].success);
        assert!(result.results["c"].skipped);
    }

    /// Invariant 5: success iff every node succeeded.
    #[tokio::test]
    async fn success_flag_matches_all_node_results() {
        let descriptors = vec![descriptor("a", &[]), descriptor("b", &[])];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let leveled = leveler::level(&graph).unwrap();

        let behavior = HashMap::new();
        let result = execute(
            &leveled,
            processor_from(behavior),
            ExecutorOptions::default(),
            None,
            None,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn observation_callbacks_fire_per_node() {
        let descriptors = vec![descriptor("a", &[])];
        let graph = graph::build(&descriptors, DEFAULT_PRIMARY_BRANCH);
        let leveled = leveler::level(&graph).unwrap();

        let started: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let completed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let started_clone = started.clone();
        let completed_clone = completed.clone();

        let result = execute(
            &leveled,
            processor_from(HashMap::new()),
            ExecutorOptions::default(),
            Some(Arc::new(move |name: &PackageName| {
                started_clone.lock().unwrap().push(name.clone());
            })),
            Some(Arc::new(move |name: &PackageName| {
                completed_clone.lock().unwrap().push(name.clone());
            })),
        )
        .await;

        assert!(result.success);
        assert_eq!(*started.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(*completed.lock().unwrap(), vec!["a".to_string()]);
    }
}
