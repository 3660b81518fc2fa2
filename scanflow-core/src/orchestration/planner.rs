//! Dependency planning: builds the stage DAG, rejects cycles, and derives a
//! deterministic execution order plus a critical-path estimate.
//!
//! Ordering is by dependency depth (longest chain from a root) and then by
//! declaration order, so two stages at the same depth always start in the
//! order the request listed them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use petgraph::Direction;
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::request::{ExecutionMode, OrchestrationRequest};
use super::stage::StageDefinition;
use crate::error::ValidationError;
use crate::types::ids::OrchestrationId;

/// Parses an `"A->B"` edge into `(A, B)`.
pub fn parse_edge(raw: &str) -> Result<(String, String), ValidationError> {
    let mut parts = raw.split("->");
    let (Some(from), Some(to), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ValidationError::MalformedEdge(raw.to_string()));
    };
    let (from, to) = (from.trim(), to.trim());
    if from.is_empty() || to.is_empty() {
        return Err(ValidationError::MalformedEdge(raw.to_string()));
    }
    Ok((from.to_string(), to.to_string()))
}

/// Directed graph of stage ids; an edge `a -> b` means `a` precedes `b`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    declared: HashSet<String>,
}

impl DependencyGraph {
    pub fn build(stages: &[StageDefinition], edges: &[String]) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut declared = HashSet::new();

        for stage in stages {
            if !declared.insert(stage.id.clone()) {
                return Err(ValidationError::DuplicateStage(stage.id.clone()));
            }
            let node = graph.add_node(stage.id.clone());
            index.insert(stage.id.clone(), node);
        }

        let mut this = Self {
            graph,
            index,
            declared,
        };

        for stage in stages {
            for pred in &stage.depends_on {
                this.add_edge(pred, &stage.id);
            }
        }
        for raw in edges {
            let (from, to) = parse_edge(raw)?;
            this.add_edge(&from, &to);
        }

        if let Some(cycle) = this.find_cycle() {
            return Err(ValidationError::CircularDependency { cycle });
        }

        // Unknown ids only matter once we know the graph is acyclic.
        if let Some(unknown) = this
            .graph
            .node_weights()
            .find(|id| !this.declared.contains(*id))
        {
            return Err(ValidationError::UnknownStage(unknown.clone()));
        }

        Ok(this)
    }

    fn node(&mut self, id: &str) -> NodeIndex {
        if let Some(node) = self.index.get(id) {
            return *node;
        }
        let node = self.graph.add_node(id.to_string());
        self.index.insert(id.to_string(), node);
        node
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let a = self.node(from);
        let b = self.node(to);
        self.graph.update_edge(a, b, ());
    }

    /// Members of the first strongly connected component that forms a cycle,
    /// in declaration order.
    fn find_cycle(&self) -> Option<Vec<String>> {
        kosaraju_scc(&self.graph)
            .into_iter()
            .find(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|node| self.graph.contains_edge(*node, *node))
            })
            .map(|mut component| {
                component.sort();
                component
                    .into_iter()
                    .map(|node| self.graph[node].clone())
                    .collect()
            })
    }

    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn successors(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        let Some(node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(*node, direction).collect();
        out.sort();
        out.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Longest chain length from any root to each node.
    fn depths(&self) -> HashMap<NodeIndex, usize> {
        let mut depth = HashMap::new();
        // Acyclic by construction, so toposort cannot fail here.
        let order = toposort(&self.graph, None).unwrap_or_default();
        for node in order {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|pred| depth.get(&pred).map(|d: &usize| d + 1))
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }
        depth
    }

    /// Topological order, stable by declaration among equal depths.
    pub fn execution_order(&self) -> Vec<(String, usize)> {
        let depth = self.depths();
        let mut nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        nodes.sort_by_key(|node| (depth.get(node).copied().unwrap_or(0), *node));
        nodes
            .into_iter()
            .map(|node| (self.graph[node].clone(), depth.get(&node).copied().unwrap_or(0)))
            .collect()
    }

    /// Longest weighted path using `weight` per stage.
    pub fn critical_path<F>(&self, weight: F) -> CriticalPath
    where
        F: Fn(&str) -> u64,
    {
        let order = toposort(&self.graph, None).unwrap_or_default();
        let mut dist: HashMap<NodeIndex, u64> = HashMap::new();
        let mut via: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for node in order {
            let mut best: Option<(u64, NodeIndex)> = None;
            let mut preds: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .collect();
            preds.sort();
            for pred in preds {
                let d = dist.get(&pred).copied().unwrap_or(0);
                if best.is_none_or(|(current, _)| d > current) {
                    best = Some((d, pred));
                }
            }
            let base = best.map(|(d, _)| d).unwrap_or(0);
            if let Some((_, pred)) = best {
                via.insert(node, pred);
            }
            dist.insert(node, base.saturating_add(weight(&self.graph[node])));
        }

        let mut end: Option<(u64, NodeIndex)> = None;
        for node in self.graph.node_indices() {
            let d = dist.get(&node).copied().unwrap_or(0);
            if end.is_none_or(|(current, _)| d > current) {
                end = Some((d, node));
            }
        }

        let Some((total, mut cursor)) = end else {
            return CriticalPath::default();
        };
        let mut stages = vec![self.graph[cursor].clone()];
        while let Some(prev) = via.get(&cursor) {
            stages.push(self.graph[*prev].clone());
            cursor = *prev;
        }
        stages.reverse();
        CriticalPath {
            stages,
            estimated_duration_secs: total,
        }
    }

    /// Every stage reachable from `id` through successor edges.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(start) = self.index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([*start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(self.graph[next].clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPath {
    pub stages: Vec<String>,
    pub estimated_duration_secs: u64,
}

/// A stage positioned in the execution order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub stage: StageDefinition,
    pub depth: usize,
    pub predecessors: Vec<String>,
}

/// Output of planning: ordered stages plus the derived estimates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<PlannedStage>,
    pub critical_path: CriticalPath,
    /// Largest number of stages sharing one depth.
    pub max_width: usize,
    #[serde(skip)]
    graph: Option<DependencyGraph>,
}

impl ExecutionPlan {
    pub fn order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&PlannedStage> {
        self.stages.iter().find(|s| s.stage.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.stage.id == id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        self.graph
            .as_ref()
            .map(|graph| graph.transitive_dependents(id))
            .unwrap_or_default()
    }

    /// ETA hint: the critical path when stages overlap, the sum otherwise.
    pub fn estimated_duration(&self, mode: ExecutionMode) -> Duration {
        let secs = match mode {
            ExecutionMode::Parallel => self.critical_path.estimated_duration_secs,
            ExecutionMode::Sequential => self
                .stages
                .iter()
                .map(|s| s.stage.estimated_duration_secs)
                .sum(),
        };
        Duration::from_secs(secs)
    }
}

/// Stateless planner consulted by admission and the executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyPlanner;

impl DependencyPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, request: &OrchestrationRequest) -> Result<ExecutionPlan, ValidationError> {
        let graph = DependencyGraph::build(&request.stages, &request.dependency_edges)?;
        if request.stages.is_empty() {
            return Err(ValidationError::EmptyPlan);
        }

        let by_id: HashMap<&str, &StageDefinition> = request
            .stages
            .iter()
            .map(|stage| (stage.id.as_str(), stage))
            .collect();

        let mut width: HashMap<usize, usize> = HashMap::new();
        let stages: Vec<PlannedStage> = graph
            .execution_order()
            .into_iter()
            .filter_map(|(id, depth)| {
                let stage = by_id.get(id.as_str())?;
                *width.entry(depth).or_default() += 1;
                Some(PlannedStage {
                    stage: (*stage).clone(),
                    depth,
                    predecessors: graph.predecessors(&id),
                })
            })
            .collect();

        let critical_path = graph.critical_path(|id| {
            by_id
                .get(id)
                .map(|stage| stage.estimated_duration_secs)
                .unwrap_or(0)
        });

        Ok(ExecutionPlan {
            stages,
            critical_path,
            max_width: width.values().copied().max().unwrap_or(0),
            graph: Some(graph),
        })
    }
}

/// Where a prerequisite orchestration currently stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrerequisiteState {
    Terminal,
    InProgress,
    Unknown,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PrerequisiteCheck {
    Satisfied,
    Waiting(Vec<OrchestrationId>),
    Unknown(OrchestrationId),
}

pub fn check_prerequisites<F>(prerequisites: &[OrchestrationId], state_of: F) -> PrerequisiteCheck
where
    F: Fn(&OrchestrationId) -> PrerequisiteState,
{
    let mut waiting = Vec::new();
    for id in prerequisites {
        match state_of(id) {
            PrerequisiteState::Terminal => {}
            PrerequisiteState::InProgress => waiting.push(*id),
            PrerequisiteState::Unknown => return PrerequisiteCheck::Unknown(*id),
        }
    }
    if waiting.is_empty() {
        PrerequisiteCheck::Satisfied
    } else {
        PrerequisiteCheck::Waiting(waiting)
    }
}

/// Returns an orchestration on a prerequisite chain that leads back to
/// `candidate`, using the prerequisites of work that is still waiting.
pub fn detect_prerequisite_cycle(
    candidate: OrchestrationId,
    prerequisites: &[OrchestrationId],
    waiting: &HashMap<OrchestrationId, Vec<OrchestrationId>>,
) -> Option<OrchestrationId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<OrchestrationId> = prerequisites.to_vec();
    while let Some(id) = stack.pop() {
        if id == candidate {
            return Some(id);
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(next) = waiting.get(&id) {
            stack.extend(next.iter().copied());
        }
    }
    None
}
