use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::plan::Plan;
use super::step::Step;
use crate::error::{EngineError, Result};

/// DFS state for cycle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    /// On the current DFS path
    Visiting,
    Done,
}

/// Validated, read-only dependency graph of a plan's steps
///
/// Edges point from a dependency to its dependent. Construction fails with
/// `InvalidPlan` on unknown dependency ids or cycles, so every graph that
/// exists is acyclic.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    /// Step ids in plan order
    order: Vec<String>,
}

impl DependencyGraph {
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        Self::build(&plan.steps)
    }

    pub fn build(steps: &[Step]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let mut order = Vec::with_capacity(steps.len());

        for step in steps {
            if indices.contains_key(&step.id) {
                return Err(EngineError::invalid_plan(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            let idx = graph.add_node(step.id.clone());
            indices.insert(step.id.clone(), idx);
            order.push(step.id.clone());
        }

        for step in steps {
            let to = indices[&step.id];
            for dep in &step.depends_on {
                let from = indices.get(dep).ok_or_else(|| {
                    EngineError::invalid_plan(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        let dag = Self {
            graph,
            indices,
            order,
        };

        if let Some(cycle) = dag.find_cycle() {
            return Err(EngineError::invalid_plan(format!(
                "cycle detected: {}",
                cycle.join(" -> ")
            )));
        }

        Ok(dag)
    }

    /// Depth-first search; reaching a node still marked `Visiting` closes a cycle
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut path = Vec::new();

        for id in &self.order {
            let idx = self.indices[id];
            if marks[idx.index()] == Mark::Unvisited {
                if let Some(cycle) = self.visit(idx, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        marks: &mut [Mark],
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        marks[node.index()] = Mark::Visiting;
        path.push(node);

        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            match marks[next.index()] {
                Mark::Visiting => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| self.graph[*n].clone()).collect();
                    cycle.push(self.graph[next].clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node.index()] = Mark::Done;
        None
    }

    /// Steps neither completed nor failed whose dependencies are all completed,
    /// in plan order
    pub fn runnable(&self, completed: &BTreeSet<String>, failed: &BTreeSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id) && !failed.contains(*id))
            .filter(|id| {
                let idx = self.indices[*id];
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep]))
            })
            .cloned()
            .collect()
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, step_id: &str) -> Vec<&str> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Steps that directly depend on this one
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    fn neighbors(&self, step_id: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.indices.get(step_id) else {
            return vec![];
        };

        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Topologically sorted execution order
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None)
            .map_err(|_| EngineError::invalid_plan("cycle detected in step graph"))?;

        Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    /// Steps grouped by generation: level N holds the steps whose longest
    /// dependency chain has length N
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();

        for id in self.execution_order()? {
            let idx = self.indices[&id];
            let d = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| depth.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(idx, d);
        }

        let max_depth = depth.values().copied().max();
        let mut levels = vec![Vec::new(); max_depth.map(|d| d + 1).unwrap_or(0)];
        for id in &self.order {
            let d = depth[&self.indices[id]];
            levels[d].push(id.clone());
        }

        Ok(levels)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.indices.contains_key(step_id)
    }

    /// Step ids in plan order
    pub fn step_ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
