//! Pipeline graph construction
//!
//! Builds the DAG representation of a manifest: endpoint resolution,
//! topological ordering (Kahn's algorithm), cycle detection with a witness,
//! and per-node fan-in/fan-out sets consumed by the runner.

use crate::data::DataTypeHint;
use crate::manifest::{Endpoint, Manifest, NodeManifest};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Declared port data types for a node type, used for build-time edge
/// type checking. `Any` on either side disables the check.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortHints {
    /// What the node accepts on its input ports
    pub input: DataTypeHint,
    /// What the node produces on its output ports
    pub output: DataTypeHint,
}

/// One directed edge between two resolved ports
#[derive(Debug, Clone)]
pub struct GraphEdge {
    /// Index into [`PipelineGraph::edges`]
    pub id: usize,
    /// Producing endpoint
    pub from: Endpoint,
    /// Consuming endpoint
    pub to: Endpoint,
}

/// A node with its resolved neighborhood
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The manifest entry
    pub spec: NodeManifest,
    /// Upstream node ids (deduplicated)
    pub fan_in: Vec<String>,
    /// Downstream node ids (deduplicated)
    pub fan_out: Vec<String>,
    /// Incoming edge ids, in manifest order
    pub in_edges: Vec<usize>,
    /// Outgoing edge ids, in manifest order
    pub out_edges: Vec<usize>,
}

/// Validated pipeline DAG
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// Nodes keyed by id
    pub nodes: HashMap<String, GraphNode>,
    /// All edges; `GraphEdge::id` indexes this vec
    pub edges: Vec<GraphEdge>,
    /// Topological execution order
    pub execution_order: Vec<String>,
    /// Nodes with no incoming edges (fed by ingestion or the caller)
    pub sources: Vec<String>,
    /// Nodes with no outgoing edges (their outputs go to the caller)
    pub sinks: Vec<String>,
}

impl PipelineGraph {
    /// Build and validate the graph from a manifest.
    ///
    /// Equivalent to [`PipelineGraph::build`] without port-type hints.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        Self::build(manifest, &HashMap::new())
    }

    /// Build and validate the graph, checking declared port types where
    /// `hints` has an entry for both endpoint node types.
    pub fn build(manifest: &Manifest, hints: &HashMap<String, PortHints>) -> Result<Self> {
        crate::manifest::validate(manifest)?;

        let mut nodes: HashMap<String, GraphNode> = manifest
            .nodes
            .iter()
            .map(|spec| {
                (
                    spec.id.clone(),
                    GraphNode {
                        spec: spec.clone(),
                        fan_in: Vec::new(),
                        fan_out: Vec::new(),
                        in_edges: Vec::new(),
                        out_edges: Vec::new(),
                    },
                )
            })
            .collect();

        let mut edges = Vec::with_capacity(manifest.connections.len());
        // (from endpoint, to node) pairs: one output port may not feed two
        // inputs of the same downstream node
        let mut seen_pairs: HashSet<(Endpoint, String)> = HashSet::new();

        for conn in &manifest.connections {
            let from = Endpoint::parse(&conn.from, "out")?;
            let to = Endpoint::parse(&conn.to, "in")?;

            let dangling = |reason: String| Error::DanglingEdge {
                from: conn.from.clone(),
                to: conn.to.clone(),
                reason,
            };

            let from_node = nodes
                .get(&from.node)
                .ok_or_else(|| dangling(format!("unknown source node '{}'", from.node)))?;
            if !from_node.spec.output_port_names().contains(&from.port) {
                return Err(dangling(format!(
                    "node '{}' has no output port '{}'",
                    from.node, from.port
                )));
            }

            let to_node = nodes
                .get(&to.node)
                .ok_or_else(|| dangling(format!("unknown target node '{}'", to.node)))?;
            if !to_node
                .spec
                .input_port_specs()
                .iter()
                .any(|(name, _)| *name == to.port)
            {
                return Err(dangling(format!(
                    "node '{}' has no input port '{}'",
                    to.node, to.port
                )));
            }

            if !seen_pairs.insert((from.clone(), to.node.clone())) {
                return Err(Error::manifest(format!(
                    "output port {} feeds node '{}' more than once",
                    from, to.node
                )));
            }

            if let (Some(src), Some(dst)) = (
                hints.get(&from_node.spec.node_type),
                hints.get(&to_node.spec.node_type),
            ) {
                if !src.output.compatible_with(&dst.input) {
                    return Err(Error::PortTypeMismatch {
                        from: from.to_string(),
                        to: to.to_string(),
                        produced: src.output.to_string(),
                        accepted: dst.input.to_string(),
                    });
                }
            }

            let id = edges.len();
            edges.push(GraphEdge {
                id,
                from: from.clone(),
                to: to.clone(),
            });

            let from_entry = nodes.get_mut(&from.node).unwrap();
            from_entry.out_edges.push(id);
            if !from_entry.fan_out.contains(&to.node) {
                from_entry.fan_out.push(to.node.clone());
            }
            let to_entry = nodes.get_mut(&to.node).unwrap();
            to_entry.in_edges.push(id);
            if !to_entry.fan_in.contains(&from.node) {
                to_entry.fan_in.push(from.node.clone());
            }
        }

        // Required input ports on any node that is not a source must be
        // connected; source nodes (no incoming edges) receive the session
        // input on their ports instead.
        for node in nodes.values() {
            if node.in_edges.is_empty() {
                continue;
            }
            let connected: HashSet<&str> = node
                .in_edges
                .iter()
                .map(|&e| edges[e].to.port.as_str())
                .collect();
            for (port, required) in node.spec.input_port_specs() {
                if required && !connected.contains(port.as_str()) {
                    return Err(Error::MissingRequiredPort {
                        node_id: node.spec.id.clone(),
                        port,
                    });
                }
            }
        }

        let execution_order = topological_order(&nodes, &edges)?;

        let mut sources: Vec<String> = execution_order
            .iter()
            .filter(|id| nodes[*id].in_edges.is_empty())
            .cloned()
            .collect();
        let mut sinks: Vec<String> = execution_order
            .iter()
            .filter(|id| nodes[*id].out_edges.is_empty())
            .cloned()
            .collect();
        sources.sort();
        sinks.sort();

        Ok(Self {
            nodes,
            edges,
            execution_order,
            sources,
            sinks,
        })
    }

    /// Number of nodes in the graph
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }
}

/// Kahn's algorithm. If not all nodes drain, the leftover subgraph holds a
/// cycle; a DFS over it produces the witness for the error.
fn topological_order(
    nodes: &HashMap<String, GraphNode>,
    edges: &[GraphEdge],
) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = nodes
        .keys()
        .map(|id| (id.as_str(), 0))
        .collect();
    for edge in edges {
        *in_degree.get_mut(edge.to.node.as_str()).unwrap() += 1;
    }

    // Deterministic order: seed queue sorted by id
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    ready.sort();
    let mut queue: VecDeque<&str> = ready.into();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        let mut unlocked = Vec::new();
        for &e in &nodes[id].out_edges {
            let target = edges[e].to.node.as_str();
            let degree = in_degree.get_mut(target).unwrap();
            *degree -= 1;
            if *degree == 0 {
                unlocked.push(target);
            }
        }
        unlocked.sort();
        queue.extend(unlocked);
    }

    if order.len() != nodes.len() {
        let witness = find_cycle(nodes, edges)
            .unwrap_or_else(|| {
                // Unreachable when Kahn leaves nodes behind, but never panic
                // in the builder
                in_degree
                    .iter()
                    .filter(|(_, &d)| d > 0)
                    .map(|(&id, _)| id.to_string())
                    .collect()
            });
        return Err(Error::Cycle { nodes: witness });
    }

    Ok(order)
}

/// DFS cycle search returning the node ids on the first cycle found
fn find_cycle(nodes: &HashMap<String, GraphNode>, edges: &[GraphEdge]) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();

    let mut roots: Vec<&str> = nodes.keys().map(String::as_str).collect();
    roots.sort();

    for root in roots {
        if !visited.contains(root) {
            if let Some(cycle) = dfs(root, nodes, edges, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs<'a>(
    id: &'a str,
    nodes: &'a HashMap<String, GraphNode>,
    edges: &'a [GraphEdge],
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(id);
    on_stack.insert(id);
    path.push(id);

    for &e in &nodes[id].out_edges {
        let next = edges[e].to.node.as_str();
        if !visited.contains(next) {
            if let Some(cycle) = dfs(next, nodes, edges, visited, on_stack, path) {
                return Some(cycle);
            }
        } else if on_stack.contains(next) {
            let start = path.iter().position(|&n| n == next).unwrap();
            return Some(path[start..].iter().map(|s| s.to_string()).collect());
        }
    }

    path.pop();
    on_stack.remove(id);
    None
}
