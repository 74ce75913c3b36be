//! Rebuild planner: turns a directly-affected artifact set into a persisted
//! forest of PLANNED builds.
//!
//! Planning runs in three steps:
//! 1. Discover the dependency graph breadth-first from the directly-affected
//!    artifacts, asking the metadata service for each artifact's dependents.
//!    Artifacts are identified by NVR, so one reached twice is one node.
//! 2. Reject cycles. The result must be a forest.
//! 3. Attach every node under the parent that places it shallowest,
//!    measured from the nodes nothing depends on. Ties go to the parent
//!    discovered first.
//!
//! The whole forest is inserted in one store transaction before anything is
//! submitted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::clients::MetadataService;
use crate::config::RebuildConfig;
use crate::error::PlanError;
use crate::models::artifact::ArtifactRef;
use crate::models::build::{ArtifactBuild, NewArtifactBuild, RebuildReason};
use crate::models::event::Event;
use crate::models::tree::waves_from;
use crate::store::Store;

#[derive(Clone)]
pub struct Planner {
    store: Arc<dyn Store>,
    metadata: Arc<dyn MetadataService>,
    config: Arc<RebuildConfig>,
}

struct Node {
    artifact: ArtifactRef,
    direct: bool,
}

impl Planner {
    pub fn new(
        store: Arc<dyn Store>,
        metadata: Arc<dyn MetadataService>,
        config: Arc<RebuildConfig>,
    ) -> Self {
        Self {
            store,
            metadata,
            config,
        }
    }

    /// Compute the rebuild forest without persisting it. The result is in
    /// breadth-first order, so every `dep_on_index` points backwards.
    pub async fn resolve(
        &self,
        handler: &str,
        event: &Event,
        directly_affected: Vec<ArtifactRef>,
    ) -> Result<Vec<NewArtifactBuild>, PlanError> {
        let mut graph: DiGraph<Node, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        for artifact in directly_affected {
            if index.contains_key(&artifact.nvr) {
                continue;
            }
            if !self.config.policy.is_allowed(handler, &artifact, event) {
                tracing::info!(
                    event_id = event.id,
                    handler,
                    nvr = %artifact.nvr,
                    "Skipping artifact not allowed by policy"
                );
                continue;
            }
            let nvr = artifact.nvr.clone();
            let idx = graph.add_node(Node {
                artifact,
                direct: true,
            });
            index.insert(nvr, idx);
        }

        // 1. Discovery. Edges point from an artifact to its dependents.
        let mut queue: VecDeque<NodeIndex> = graph.node_indices().collect();
        while let Some(i) = queue.pop_front() {
            let dependents = self
                .metadata
                .find_affected_artifacts(&graph[i].artifact)
                .await?;

            for dependent in dependents {
                if dependent.nvr == graph[i].artifact.nvr {
                    return Err(PlanError::Structural(format!(
                        "{} depends on itself",
                        dependent.nvr
                    )));
                }
                let j = match index.get(&dependent.nvr) {
                    Some(&j) => j,
                    None => {
                        if !self.config.policy.is_allowed(handler, &dependent, event) {
                            tracing::info!(
                                event_id = event.id,
                                handler,
                                nvr = %dependent.nvr,
                                "Skipping dependent not allowed by policy"
                            );
                            continue;
                        }
                        let nvr = dependent.nvr.clone();
                        let j = graph.add_node(Node {
                            artifact: dependent,
                            direct: false,
                        });
                        index.insert(nvr, j);
                        queue.push_back(j);
                        j
                    }
                };
                graph.update_edge(i, j, ());
            }
        }

        // 2. Cycle check.
        if let Err(cycle) = toposort(&graph, None) {
            return Err(PlanError::Structural(format!(
                "dependency cycle through {}",
                graph[cycle.node_id()].artifact.nvr
            )));
        }

        // 3. Shallowest attachment via multi-source BFS from the roots.
        let mut parent: Vec<Option<NodeIndex>> = vec![None; graph.node_count()];
        let mut placed = vec![false; graph.node_count()];
        let mut order: Vec<NodeIndex> = Vec::with_capacity(graph.node_count());
        let mut frontier: VecDeque<NodeIndex> = graph.externals(Direction::Incoming).collect();
        for r in &frontier {
            placed[r.index()] = true;
        }
        while let Some(i) = frontier.pop_front() {
            order.push(i);
            for j in dependents_in_discovery_order(&graph, i) {
                if !placed[j.index()] {
                    placed[j.index()] = true;
                    parent[j.index()] = Some(i);
                    frontier.push_back(j);
                }
            }
        }

        let mut position = vec![0usize; graph.node_count()];
        for (pos, i) in order.iter().enumerate() {
            position[i.index()] = pos;
        }

        Ok(order
            .iter()
            .map(|&i| {
                let node = &graph[i];
                let parent = parent[i.index()];
                let dep_on_index = parent.map(|p| position[p.index()]);
                let rebuild_reason = if node.direct {
                    RebuildReason::DirectlyAffected
                } else {
                    RebuildReason::Dependency
                };
                let state_reason = match parent {
                    Some(p) if !node.direct => format!(
                        "Pulled in because it depends on {}.",
                        graph[p].artifact.nvr
                    ),
                    _ => format!("Directly affected by {}.", event.search_key),
                };
                let build_args = if node.artifact.build_args.is_null() {
                    serde_json::json!({})
                } else {
                    node.artifact.build_args.clone()
                };
                NewArtifactBuild {
                    name: node.artifact.name.clone(),
                    artifact_type: node.artifact.artifact_type,
                    original_nvr: node.artifact.nvr.clone(),
                    rebuild_reason,
                    dep_on_index,
                    build_args,
                    state_reason,
                }
            })
            .collect())
    }

    /// Resolve and persist the forest under `event`. Records a dependency on
    /// every other event still rebuilding one of the same artifacts.
    pub async fn plan(
        &self,
        handler: &str,
        event: &Event,
        directly_affected: Vec<ArtifactRef>,
    ) -> Result<Vec<ArtifactBuild>, PlanError> {
        let planned = self.resolve(handler, event, directly_affected).await?;
        if planned.is_empty() {
            return Ok(Vec::new());
        }

        let mut blockers: Vec<i64> = Vec::new();
        for build in &planned {
            for other in self.store.active_builds_by_nvr(&build.original_nvr).await? {
                if other.event_id != event.id && !blockers.contains(&other.event_id) {
                    blockers.push(other.event_id);
                }
            }
        }

        let builds = self.store.insert_builds(event.id, planned).await?;
        for blocker in &blockers {
            self.store.add_event_dependency(event.id, *blocker).await?;
            tracing::info!(
                event_id = event.id,
                depends_on = blocker,
                "Event waits for another event rebuilding the same artifacts"
            );
        }

        log_waves(event, &builds);
        Ok(builds)
    }
}

/// Outgoing neighbors in the order their edges were added. petgraph walks
/// adjacency lists newest first.
fn dependents_in_discovery_order(graph: &DiGraph<Node, ()>, idx: NodeIndex) -> Vec<NodeIndex> {
    let mut edges: Vec<_> = graph.edges_directed(idx, Direction::Outgoing).collect();
    edges.sort_by_key(|e| e.id());
    edges.into_iter().map(|e| e.target()).collect()
}

fn log_waves(event: &Event, builds: &[ArtifactBuild]) {
    let ids: HashSet<i64> = builds.iter().map(|b| b.id).collect();
    let mut children: std::collections::BTreeMap<i64, Vec<i64>> = Default::default();
    let mut roots = Vec::new();
    for build in builds {
        match build.dep_on.filter(|p| ids.contains(p)) {
            Some(p) => children.entry(p).or_default().push(build.id),
            None => roots.push(build.id),
        }
    }
    let by_id: HashMap<i64, &ArtifactBuild> = builds.iter().map(|b| (b.id, b)).collect();

    tracing::info!(
        event_id = event.id,
        builds = builds.len(),
        "Planned rebuild order"
    );
    for (n, wave) in waves_from(&roots, &children).iter().enumerate() {
        let nvrs: Vec<&str> = wave
            .iter()
            .filter_map(|id| by_id.get(id))
            .map(|b| b.original_nvr.as_str())
            .collect();
        tracing::info!(event_id = event.id, "Batch {}: {}", n, nvrs.join(", "));
    }
}
