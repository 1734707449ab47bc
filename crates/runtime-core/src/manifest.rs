//! Pipeline manifest parsing and validation
//!
//! This module handles JSON manifest parsing, structural validation, and the
//! declarative node/connection model the graph builder consumes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Pipeline manifest structure (v1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version
    pub version: String,

    /// Pipeline metadata
    #[serde(default)]
    pub metadata: ManifestMetadata,

    /// List of nodes in the pipeline
    pub nodes: Vec<NodeManifest>,

    /// Connections between node ports
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// Pipeline metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Pipeline name
    #[serde(default)]
    pub name: String,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Creation timestamp (ISO-8601)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Node manifest entry
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeManifest {
    /// Unique node ID within the pipeline
    pub id: String,

    /// Node type resolved against the registry (e.g. "AudioResample")
    pub node_type: String,

    /// Node-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,

    /// Whether the node keeps per-stream state and exposes a stream handle
    #[serde(default)]
    pub is_streaming: bool,

    /// Input port names. A trailing `?` marks the port optional: it may be
    /// left unconnected. Defaults to a single required port "in".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_ports: Vec<String>,

    /// Output port names. Defaults to a single port "out".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_ports: Vec<String>,

    /// Which executor backend runs this node
    #[serde(default)]
    pub execution_hint: ExecutionHint,

    /// Which worker runtime a subprocess/container node uses
    #[serde(default)]
    pub runtime_hint: RuntimeHint,

    /// Container configuration (container executor only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerNodeConfig>,
}

impl NodeManifest {
    /// Input port names with the optional marker stripped.
    ///
    /// Returns (name, required) pairs; an empty declaration means one
    /// required port named "in".
    pub fn input_port_specs(&self) -> Vec<(String, bool)> {
        if self.input_ports.is_empty() {
            return vec![("in".to_string(), true)];
        }
        self.input_ports
            .iter()
            .map(|p| match p.strip_suffix('?') {
                Some(name) => (name.to_string(), false),
                None => (p.clone(), true),
            })
            .collect()
    }

    /// Output port names; an empty declaration means one port named "out".
    pub fn output_port_names(&self) -> Vec<String> {
        if self.output_ports.is_empty() {
            return vec!["out".to_string()];
        }
        self.output_ports.clone()
    }

    /// Whether `params.lossy` opts this node's input edges into
    /// drop-oldest overflow handling.
    pub fn is_lossy(&self) -> bool {
        self.params
            .get("lossy")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Executor backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionHint {
    /// In-process, direct dispatch
    #[default]
    Native,
    /// Separate worker process over shared-memory IPC
    Subprocess,
    /// Worker process inside a container
    Docker,
    /// Dispatched to a remote endpoint via a transport
    Remote,
}

/// Worker runtime for subprocess/container nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHint {
    /// Pick based on node params (`python_entry` present → python)
    #[default]
    Auto,
    /// Bundled pipeline-worker binary hosting a native node
    Rust,
    /// External Python interpreter speaking the same ring protocol
    Python,
}

/// Container configuration for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerNodeConfig {
    /// Base image, e.g. "python:3.10-slim"
    #[serde(default = "default_image")]
    pub image: String,

    /// Python version for generated images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,

    /// Packages installed into the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub python_packages: Vec<String>,

    /// Resource limits applied to the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
}

fn default_image() -> String {
    "python:3.10-slim".to_string()
}

/// Container resource limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// CPU quota in cores (fractional allowed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,

    /// Number of GPUs requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
}

/// Connection between an output port and an input port.
///
/// Endpoints are written `"node_id.port"`; the port defaults to
/// "out"/"in" respectively when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Source endpoint
    pub from: String,

    /// Target endpoint
    pub to: String,
}

/// A resolved connection endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Node id
    pub node: String,
    /// Port name on that node
    pub port: String,
}

impl Endpoint {
    /// Parse `"node.port"`, applying `default_port` when the port is
    /// omitted. A node id may not contain '.'.
    pub fn parse(raw: &str, default_port: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::manifest("empty connection endpoint"));
        }
        match raw.split_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok(Self {
                node: node.to_string(),
                port: port.to_string(),
            }),
            Some(_) => Err(Error::manifest(format!("malformed endpoint '{raw}'"))),
            None => Ok(Self {
                node: raw.to_string(),
                port: default_port.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Parse a JSON manifest string into a Manifest struct
pub fn parse(json: &str) -> Result<Manifest> {
    serde_json::from_str(json)
        .map_err(|e| Error::manifest(format!("failed to parse manifest: {e}")))
}

/// Validate a manifest's structure.
///
/// Graph-level checks (endpoint resolution, DAG-ness, required ports) live
/// in the graph builder; this catches what can be rejected before a
/// registry is even consulted.
pub fn validate(manifest: &Manifest) -> Result<()> {
    if manifest.version != "v1" {
        return Err(Error::manifest(format!(
            "unsupported manifest version: {}",
            manifest.version
        )));
    }

    if manifest.nodes.is_empty() {
        return Err(Error::manifest("manifest must contain at least one node"));
    }

    let mut seen_ids = HashSet::new();
    for node in &manifest.nodes {
        if node.id.is_empty() {
            return Err(Error::manifest("node id must not be empty"));
        }
        if node.id.contains('.') {
            return Err(Error::manifest(format!(
                "node id '{}' must not contain '.'",
                node.id
            )));
        }
        if !seen_ids.insert(&node.id) {
            return Err(Error::manifest(format!("duplicate node ID: {}", node.id)));
        }
        if node.node_type.is_empty() {
            return Err(Error::manifest(format!(
                "node '{}' has an empty node_type",
                node.id
            )));
        }

        let mut port_names = HashSet::new();
        for (port, _) in node.input_port_specs() {
            if !port_names.insert(port.clone()) {
                return Err(Error::manifest(format!(
                    "node '{}' declares input port '{}' twice",
                    node.id, port
                )));
            }
        }
        let mut out_names = HashSet::new();
        for port in node.output_port_names() {
            if !out_names.insert(port.clone()) {
                return Err(Error::manifest(format!(
                    "node '{}' declares output port '{}' twice",
                    node.id, port
                )));
            }
        }
    }

    Ok(())
}
