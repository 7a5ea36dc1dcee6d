// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step graph
//!
//! Instantiates a step object for every configured step, resolves declared
//! dependencies into a DAG and produces a deterministic topological order:
//! repeatedly select the steps whose parents are already placed, natural-
//! sorted by name, with source controllers forced first among their tie.
//! Steps are finalized exactly once after ordering and never mutated
//! afterwards.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::ConfigModel;
use crate::errors::{StepflowError, StepflowResult};
use crate::steps::{StepKind, StepRegistry, StepType};
use crate::utils::natural_cmp;

/// A finalized step node. Parent/child links are index sets into the
/// graph's arena, not owning references.
pub struct StepNode {
    pub name: String,
    pub module: String,
    pub kind: StepKind,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    pub cores: u32,
    pub volatile: bool,
    pub options: BTreeMap<String, serde_yaml::Value>,

    /// Tool ids the step requires, resolved at finalization.
    pub tools: BTreeSet<String>,

    pub imp: Arc<dyn StepType>,
}

impl std::fmt::Debug for StepNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepNode")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("kind", &self.kind)
            .field("parents", &self.parents)
            .field("children", &self.children)
            .field("cores", &self.cores)
            .field("volatile", &self.volatile)
            .field("options", &self.options)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

/// The resolved, ordered step DAG.
pub struct StepGraph {
    nodes: Vec<StepNode>,
    by_name: BTreeMap<String, usize>,
    order: Vec<usize>,
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("nodes", &self.nodes)
            .field("by_name", &self.by_name)
            .field("order", &self.order)
            .finish()
    }
}

impl StepGraph {
    /// Build the graph from the configuration and a step registry.
    pub fn build(config: &ConfigModel, registry: &StepRegistry) -> StepflowResult<Self> {
        // Instantiate one node per configured step.
        let mut nodes = Vec::with_capacity(config.steps.len());
        let mut by_name = BTreeMap::new();
        for raw in &config.steps {
            let imp = registry.get(&raw.module).ok_or_else(|| {
                StepflowError::UnknownStepModule {
                    step: raw.name.clone(),
                    module: raw.module.clone(),
                }
            })?;
            let index = nodes.len();
            if by_name.insert(raw.name.clone(), index).is_some() {
                return Err(StepflowError::InvalidConfig {
                    reason: format!("duplicate step name '{}'", raw.name),
                    help: None,
                });
            }
            nodes.push(StepNode {
                name: raw.name.clone(),
                module: raw.module.clone(),
                kind: imp.kind(),
                parents: Vec::new(),
                children: Vec::new(),
                cores: raw.cores,
                volatile: raw.volatile,
                options: raw.options.clone(),
                tools: BTreeSet::new(),
                imp,
            });
        }

        // Resolve declared dependencies.
        for raw in &config.steps {
            let index = by_name[&raw.name];
            for dep in &raw.depends {
                let parent = *by_name.get(dep).ok_or_else(|| {
                    StepflowError::UnknownDependency {
                        step: raw.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                nodes[index].parents.push(parent);
                nodes[parent].children.push(index);
            }
        }

        // Mirror the structure into a petgraph DiGraph for cycle
        // detection; the deterministic order itself comes from the layered
        // selection below.
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
        for (index, node) in nodes.iter().enumerate() {
            for &parent in &node.parents {
                graph.add_edge(indices[parent], indices[index], ());
            }
        }
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            let start = graph[cycle.node_id()];
            let members = cycle_members(&graph, cycle.node_id())
                .into_iter()
                .map(|i| nodes[i].name.clone())
                .collect();
            return Err(StepflowError::DependencyCycle {
                step: nodes[start].name.clone(),
                members,
            });
        }

        let order = layered_order(&nodes)?;

        let mut built = Self {
            nodes,
            by_name,
            order,
        };
        built.finalize(config)?;
        Ok(built)
    }

    /// Resolve each step's effective tool set exactly once.
    fn finalize(&mut self, config: &ConfigModel) -> StepflowResult<()> {
        for node in &mut self.nodes {
            let tools = node.imp.required_tools(&node.options);
            for tool in &tools {
                if !config.tools.contains_key(tool) {
                    return Err(StepflowError::ToolNotConfigured {
                        step: node.name.clone(),
                        tool: tool.clone(),
                    });
                }
            }
            node.tools = tools;
        }
        Ok(())
    }

    pub fn node(&self, index: usize) -> &StepNode {
        &self.nodes[index]
    }

    pub fn get(&self, name: &str) -> Option<&StepNode> {
        self.by_name.get(name).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Step indices in topological order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tool ids required by any step.
    pub fn used_tools(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.tools.iter().cloned())
            .collect()
    }
}

/// Steps reachable from a node known to sit on a cycle.
fn cycle_members(graph: &DiGraph<usize, ()>, start: NodeIndex) -> Vec<usize> {
    use petgraph::visit::{depth_first_search, Control, DfsEvent};

    let mut members = vec![graph[start]];
    depth_first_search(graph, Some(start), |event| {
        match event {
            DfsEvent::Discover(node, _) if node != start => members.push(graph[node]),
            DfsEvent::BackEdge(_, to) if to == start => return Control::Break(()),
            _ => {}
        }
        Control::<()>::Continue
    });
    members
}

/// Layered Kahn selection: repeatedly place the set of steps whose parents
/// are all placed, natural-sorted by name; a ready source controller
/// preempts its whole tie. No placeable step with steps remaining means a
/// dependency cycle.
fn layered_order(nodes: &[StepNode]) -> StepflowResult<Vec<usize>> {
    let mut unassigned: BTreeSet<usize> = (0..nodes.len()).collect();
    let mut assigned: BTreeSet<usize> = BTreeSet::new();
    let mut order = Vec::with_capacity(nodes.len());

    while !unassigned.is_empty() {
        let mut ready: Vec<usize> = Vec::new();
        let mut controller: Option<usize> = None;
        for &index in &unassigned {
            let is_ready = nodes[index]
                .parents
                .iter()
                .all(|parent| assigned.contains(parent));
            if !is_ready {
                continue;
            }
            if nodes[index].kind == StepKind::SourceController {
                controller = Some(index);
                break;
            }
            ready.push(index);
        }

        if let Some(index) = controller {
            ready = vec![index];
        } else if ready.is_empty() {
            let member = *unassigned.iter().next().expect("non-empty remainder");
            let members = unassigned
                .iter()
                .map(|&i| nodes[i].name.clone())
                .collect();
            return Err(StepflowError::DependencyCycle {
                step: nodes[member].name.clone(),
                members,
            });
        }

        ready.sort_by(|&a, &b| natural_cmp(&nodes[a].name, &nodes[b].name));
        for index in ready {
            order.push(index);
            assigned.insert(index);
            unassigned.remove(&index);
        }
    }

    Ok(order)
}
