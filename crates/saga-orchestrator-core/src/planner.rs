// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The planner: builds a dependency DAG from a step set, detects
//! cycles, and supports idempotent incremental re-planning.
//!
//! Built on `petgraph::graph::DiGraph` plus a stable step-name/`NodeIndex`
//! table: an integer-indexed adjacency list keyed by a stable step-id,
//! avoiding pointer cycles between step nodes.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Map;

use crate::error::{OrchestratorError, Result};
use crate::step::{Step, StepName};
use crate::template::{Argument, Template};

/// The dependency DAG.
#[derive(Debug, Default)]
pub struct Plan {
    graph: DiGraph<StepName, ()>,
    index_of: HashMap<StepName, NodeIndex>,
}

impl Plan {
    pub fn empty() -> Self {
        Self {
            graph: DiGraph::new(),
            index_of: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of.contains_key(name)
    }

    /// Every step name still in the plan, completed or not.
    pub fn names(&self) -> impl Iterator<Item = &StepName> {
        self.index_of.keys()
    }

    /// Steps with zero remaining incoming edges.
    pub fn ready(&self) -> Vec<StepName> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Removes a completed step's vertex.
    pub fn remove(&mut self, name: &str) {
        if let Some(idx) = self.index_of.remove(name) {
            self.graph.remove_node(idx);
            // `remove_node` swaps the last index into `idx`'s slot; refresh
            // the table for whichever step (if any) moved.
            self.reindex();
        }
    }

    fn reindex(&mut self) {
        self.index_of.clear();
        for idx in self.graph.node_indices() {
            self.index_of.insert(self.graph[idx].clone(), idx);
        }
    }

    fn ensure_node(&mut self, name: &StepName) -> NodeIndex {
        if let Some(&idx) = self.index_of.get(name) {
            idx
        } else {
            let idx = self.graph.add_node(name.clone());
            self.index_of.insert(name.clone(), idx);
            idx
        }
    }

    /// Adds `steps` to the plan, wiring dependency edges derived from each
    /// step's arguments, without re-sorting already-planned vertices.
    /// Cycle-checks the whole resulting graph before committing.
    pub fn merge(&mut self, steps: &[Step]) -> Result<()> {
        let mut snapshot = Snapshot::capture(self);

        for step in steps {
            snapshot.plan.ensure_node(&step.name);
        }
        for step in steps {
            for argument in &step.arguments {
                if let Some(dep) = argument.source.dependency() {
                    if !snapshot.plan.index_of.contains_key(dep) {
                        return Err(OrchestratorError::UnknownStepReference {
                            step: step.name.clone(),
                            reference: dep.clone(),
                        });
                    }
                    let from = snapshot.plan.index_of[dep];
                    let to = snapshot.plan.index_of[&step.name];
                    snapshot.plan.graph.add_edge(from, to, ());
                }
            }
        }

        if let Some(cycle) = snapshot.plan.find_cycle() {
            return Err(OrchestratorError::PlanError { cycle });
        }

        snapshot.commit();
        Ok(())
    }

    /// Builds a fresh plan from a complete step set. `plan ∘ plan = plan`: calling this twice on the same step
    /// set with an already-empty `Plan` produces an identical graph.
    pub fn build(steps: &[Step]) -> Result<Plan> {
        let mut plan = Plan::empty();
        plan.merge(steps)?;
        Ok(plan)
    }

    fn find_cycle(&self) -> Option<Vec<StepName>> {
        match toposort(&self.graph, None) {
            Ok(_) => None,
            Err(cyc) => {
                let start = cyc.node_id();
                Some(self.trace_cycle(start))
            }
        }
    }

    /// DFS from `start` looking for a path back to itself, to report a
    /// concrete cycle (`toposort` only reports one offending node).
    fn trace_cycle(&self, start: NodeIndex) -> Vec<StepName> {
        let mut stack = vec![start];
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut visited = std::collections::HashSet::new();
        visited.insert(start);

        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if next == start {
                    let mut path = vec![start];
                    let mut cur = node;
                    while cur != start {
                        path.push(cur);
                        cur = parent[&cur];
                    }
                    path.push(start);
                    path.reverse();
                    return path.into_iter().map(|idx| self.graph[idx].clone()).collect();
                }
                if visited.insert(next) {
                    parent.insert(next, node);
                    stack.push(next);
                }
            }
        }
        vec![self.graph[start].clone()]
    }
}

/// Rolls back a failed `merge` so a cycle detected mid-merge doesn't leave
/// the plan partially mutated.
struct Snapshot<'a> {
    plan: &'a mut Plan,
    original_graph: DiGraph<StepName, ()>,
    original_index: HashMap<StepName, NodeIndex>,
}

impl<'a> Snapshot<'a> {
    fn capture(plan: &'a mut Plan) -> Self {
        let original_graph = plan.graph.clone();
        let original_index = plan.index_of.clone();
        Self {
            plan,
            original_graph,
            original_index,
        }
    }

    fn commit(self) {
        std::mem::forget(self);
    }
}

impl<'a> Drop for Snapshot<'a> {
    fn drop(&mut self) {
        self.plan.graph = std::mem::take(&mut self.original_graph);
        self.plan.index_of = std::mem::take(&mut self.original_index);
    }
}

/// Pre-processing pass: rewrites any `Argument` carrying a
/// `transform` into a dependency on a synthetic, synchronous, non-undoable
/// transform step with `max_retries = 0`, whose single argument resolves the
/// argument's original source.
pub fn lower_argument_transforms(steps: Vec<Step>) -> Vec<Step> {
    let mut lowered = Vec::with_capacity(steps.len());
    let mut synthetic = Vec::new();

    for mut step in steps {
        let mut new_arguments = Vec::with_capacity(step.arguments.len());
        for argument in step.arguments.drain(..) {
            if let Some(transform) = argument.transform {
                let synthetic_name = format!("__transform::{}::{}", step.name, argument.name);
                let synthetic_step = Step::new(
                    synthetic_name.clone(),
                    Arc::new(crate::step::InlineTransformStep { transform }),
                )
                .with_arguments(vec![Argument::new("value", argument.source)])
                .with_max_retries(crate::step::MaxRetries::Count(0));
                synthetic.push(synthetic_step);

                new_arguments.push(Argument::new(argument.name, Template::result(synthetic_name)));
            } else {
                new_arguments.push(Argument {
                    name: argument.name,
                    source: argument.source,
                    transform: None,
                });
            }
        }
        step.arguments = new_arguments;
        lowered.push(step);
    }

    lowered.extend(synthetic);
    lowered
}

/// Applies a step's whole-arguments `transform`, if any, to the resolved
/// argument map.
pub fn apply_whole_transform(step: &Step, args: Map<String, serde_json::Value>) -> Result<Map<String, serde_json::Value>> {
    match &step.transform {
        Some(transform) => transform(args).map_err(|cause| OrchestratorError::TransformError {
            input: step.name.clone(),
            output: None,
            cause,
        }),
        None => Ok(args),
    }
}
