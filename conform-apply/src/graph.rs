use std::collections::{HashMap, VecDeque};

use itertools::Itertools;
use log::trace;
use thiserror::Error;

use conform_catalog::{Catalog, Resource, ResourceId};

/// A structural error in a catalog, detected before anything is applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// A resource carries the reserved id 0.
    #[error("resource id 0 is reserved ({comment:?})")]
    ReservedId {
        /// The comment of the offending resource.
        comment: String,
    },
    /// Two resources share an id.
    #[error("duplicate resource id {id}")]
    DuplicateId {
        /// The duplicated id.
        id: ResourceId,
    },
    /// A dependency points at an id not present in the catalog.
    #[error("resource {id} depends on unknown resource {dependency}")]
    DanglingDependency {
        /// The resource carrying the dangling edge.
        id: ResourceId,
        /// The id the edge points at.
        dependency: ResourceId,
    },
    /// The dependencies do not form a DAG.
    #[error("dependency cycle detected involving resources [{}]", .ids.iter().join(", "))]
    CycleDetected {
        /// The ids participating in one cycle, in ascending order.
        ids: Vec<ResourceId>,
    },
}

/// Completion outcome the scheduler reports back to the graph.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome {
    /// The applier returned successfully; `changed` tells whether it mutated
    /// the host.
    Success {
        /// Whether the host was mutated.
        changed: bool,
    },
    /// The applier failed; every transitive descendant will be skipped.
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Waiting,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

impl NodeState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Done | NodeState::Failed | NodeState::Skipped
        )
    }
}

#[derive(Debug)]
struct Node {
    resource: Resource,
    /// Indices of the dependencies, deduplicated.
    deps: Vec<usize>,
    /// Dependencies not yet done.
    missing_deps: usize,
    /// Indices of the nodes that depend on this one.
    dependents: Vec<usize>,
    state: NodeState,
    /// Whether the applier mutated the host; meaningful once `Done`.
    changed: bool,
}

/// The dependency graph of one catalog.
///
/// Nodes live in a flat array indexed by a compact internal index, with a
/// side map from resource id to index; reverse edges are index lists. The
/// graph is owned and mutated by the scheduler alone, workers never see it.
#[derive(Debug)]
pub(crate) struct Graph {
    nodes: Vec<Node>,
    index: HashMap<ResourceId, usize>,
    /// Ready and not yet handed out by [`take_ready`](Graph::take_ready).
    ready: Vec<usize>,
    /// Nodes in a terminal state.
    terminal: usize,
}

impl Graph {
    /// Build the graph for a catalog, validating its structure: unique
    /// nonzero ids, no dangling dependencies, no cycles.
    pub fn build(catalog: &Catalog) -> Result<Graph, CatalogError> {
        let mut nodes: Vec<Node> = Vec::with_capacity(catalog.len());
        let mut index = HashMap::with_capacity(catalog.len());
        for resource in catalog.iter() {
            if resource.id.0 == 0 {
                return Err(CatalogError::ReservedId {
                    comment: resource.comment.clone(),
                });
            }
            if index.insert(resource.id, nodes.len()).is_some() {
                return Err(CatalogError::DuplicateId { id: resource.id });
            }
            nodes.push(Node {
                resource: resource.clone(),
                deps: vec![],
                missing_deps: 0,
                dependents: vec![],
                state: NodeState::Waiting,
                changed: false,
            });
        }

        for idx in 0..nodes.len() {
            let id = nodes[idx].resource.id;
            // the catalog producer is not required to sort or deduplicate
            let mut dependencies = nodes[idx].resource.dependencies.clone();
            dependencies.sort_unstable();
            dependencies.dedup();
            for dependency in dependencies {
                let dep_idx = *index
                    .get(&dependency)
                    .ok_or(CatalogError::DanglingDependency { id, dependency })?;
                if dep_idx == idx {
                    return Err(CatalogError::CycleDetected { ids: vec![id] });
                }
                nodes[idx].deps.push(dep_idx);
                nodes[idx].missing_deps += 1;
                nodes[dep_idx].dependents.push(idx);
            }
        }

        let ready: Vec<usize> = nodes
            .iter_mut()
            .enumerate()
            .filter(|(_, node)| node.missing_deps == 0)
            .map(|(idx, node)| {
                node.state = NodeState::Ready;
                idx
            })
            .collect();

        // a reverse-topological walk from the initial ready set must cover
        // every node, otherwise the leftover contains a cycle
        let mut counts: Vec<usize> = nodes.iter().map(|node| node.missing_deps).collect();
        let mut queue: VecDeque<usize> = ready.iter().copied().collect();
        let mut covered = queue.len();
        while let Some(idx) = queue.pop_front() {
            for &succ in &nodes[idx].dependents {
                counts[succ] -= 1;
                if counts[succ] == 0 {
                    covered += 1;
                    queue.push_back(succ);
                }
            }
        }
        if covered < nodes.len() {
            return Err(CatalogError::CycleDetected {
                ids: find_cycle(&nodes, &counts),
            });
        }

        Ok(Graph {
            nodes,
            index,
            ready,
            terminal: 0,
        })
    }

    /// Drain the resources that are ready to run, in ascending id order, and
    /// mark them running.
    pub fn take_ready(&mut self) -> Vec<ResourceId> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.sort_unstable_by_key(|&idx| self.nodes[idx].resource.id);
        ready
            .into_iter()
            .map(|idx| {
                let node = &mut self.nodes[idx];
                debug_assert_eq!(node.state, NodeState::Ready);
                node.state = NodeState::Running;
                node.resource.id
            })
            .collect()
    }

    /// The resource of a node handed out by [`take_ready`](Graph::take_ready).
    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.nodes[self.index[&id]].resource
    }

    /// Whether any dependency of this resource reported a host mutation.
    pub fn deps_changed(&self, id: ResourceId) -> bool {
        self.nodes[self.index[&id]]
            .deps
            .iter()
            .any(|&dep| self.nodes[dep].changed)
    }

    /// Record the outcome of a running resource. On success the dependents
    /// get closer to readiness; on failure every transitive descendant is
    /// skipped.
    pub fn mark(&mut self, id: ResourceId, outcome: Outcome) {
        let idx = self.index[&id];
        debug_assert_eq!(self.nodes[idx].state, NodeState::Running);
        match outcome {
            Outcome::Success { changed } => {
                let node = &mut self.nodes[idx];
                node.state = NodeState::Done;
                node.changed = changed;
                self.terminal += 1;
                for succ in self.nodes[idx].dependents.clone() {
                    let succ_node = &mut self.nodes[succ];
                    succ_node.missing_deps -= 1;
                    if succ_node.missing_deps == 0 && succ_node.state == NodeState::Waiting {
                        trace!("resource {} is now ready", succ_node.resource.id);
                        succ_node.state = NodeState::Ready;
                        self.ready.push(succ);
                    }
                }
            }
            Outcome::Failure => {
                self.nodes[idx].state = NodeState::Failed;
                self.terminal += 1;
                let mut queue: VecDeque<usize> = self.nodes[idx].dependents.iter().copied().collect();
                while let Some(succ) = queue.pop_front() {
                    // descendants always still wait on the failed ancestor,
                    // so only waiting nodes can show up here
                    if self.nodes[succ].state == NodeState::Waiting {
                        trace!(
                            "resource {} skipped because of {}",
                            self.nodes[succ].resource.id,
                            id
                        );
                        self.nodes[succ].state = NodeState::Skipped;
                        self.terminal += 1;
                        queue.extend(self.nodes[succ].dependents.iter().copied());
                    }
                }
            }
        }
    }

    /// True when every node reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.terminal == self.nodes.len()
    }

    /// Number of nodes not yet in a terminal state.
    pub fn pending(&self) -> usize {
        self.nodes.len() - self.terminal
    }

    /// Ids of the nodes skipped because an ancestor failed, ascending.
    pub fn skipped(&self) -> Vec<ResourceId> {
        self.nodes
            .iter()
            .filter(|node| node.state == NodeState::Skipped)
            .map(|node| node.resource.id)
            .sorted()
            .collect()
    }
}

/// Extract one cycle from the nodes a coverage walk could not reach: follow
/// unsatisfied dependency edges until a node repeats.
fn find_cycle(nodes: &[Node], counts: &[usize]) -> Vec<ResourceId> {
    let start = (0..nodes.len())
        .filter(|&idx| counts[idx] > 0)
        .min_by_key(|&idx| nodes[idx].resource.id)
        .expect("no uncovered node in a graph with a cycle");
    let mut seen_at: HashMap<usize, usize> = HashMap::new();
    let mut path: Vec<usize> = vec![];
    let mut current = start;
    loop {
        if let Some(&pos) = seen_at.get(&current) {
            let mut ids: Vec<ResourceId> = path[pos..]
                .iter()
                .map(|&idx| nodes[idx].resource.id)
                .collect();
            ids.sort_unstable();
            return ids;
        }
        seen_at.insert(current, path.len());
        path.push(current);
        current = nodes[current]
            .deps
            .iter()
            .copied()
            .find(|&dep| counts[dep] > 0)
            .expect("uncovered node with every dependency covered");
    }
}
