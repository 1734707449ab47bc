//! Node type registry
//!
//! Process-wide map from manifest `node_type` names to factories. Set up at
//! startup, read-only during execution. Name clashes fail loudly at
//! registration; unknown types fail pipeline builds.

use super::PipelineNode;
use crate::graph::PortHints;
use crate::data::DataTypeHint;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Which backend family a registered type belongs to.
///
/// All categories share the same registration surface; the executor layer
/// combines the category with the manifest's `execution_hint` to pick a
/// backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCategory {
    /// In-process Rust node (also hostable in the rust worker)
    Native,
    /// Python node run in a worker process
    SubprocessPython,
    /// Python node run in a container
    DockerPython,
    /// Node resolved and executed by a remote endpoint
    Remote,
}

/// Constructor for native node instances
pub type NativeCtor =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<Box<dyn PipelineNode>> + Send + Sync>;

/// One registered node type
#[derive(Clone)]
pub struct NodeRegistration {
    /// Manifest type name
    pub node_type: String,
    /// Backend family
    pub category: NodeCategory,
    /// Declared port data types for build-time edge checking
    pub hints: PortHints,
    /// Native constructor; present only for [`NodeCategory::Native`]
    pub constructor: Option<NativeCtor>,
}

impl std::fmt::Debug for NodeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistration")
            .field("node_type", &self.node_type)
            .field("category", &self.category)
            .finish()
    }
}

/// Registry mapping node type names to factories
#[derive(Default)]
pub struct NodeRegistry {
    entries: RwLock<HashMap<String, NodeRegistration>>,
}

impl NodeRegistry {
    /// New empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native node type.
    ///
    /// Fails if the name is already taken.
    pub fn register_native<F>(&self, node_type: &str, hints: PortHints, ctor: F) -> Result<()>
    where
        F: Fn(&str, &serde_json::Value) -> Result<Box<dyn PipelineNode>> + Send + Sync + 'static,
    {
        self.insert(NodeRegistration {
            node_type: node_type.to_string(),
            category: NodeCategory::Native,
            hints,
            constructor: Some(Arc::new(ctor)),
        })
    }

    /// Register a Python node type run via the subprocess executor
    pub fn register_python(&self, node_type: &str, hints: PortHints) -> Result<()> {
        self.insert(NodeRegistration {
            node_type: node_type.to_string(),
            category: NodeCategory::SubprocessPython,
            hints,
            constructor: None,
        })
    }

    /// Register a Python node type run via the container executor
    pub fn register_docker_python(&self, node_type: &str, hints: PortHints) -> Result<()> {
        self.insert(NodeRegistration {
            node_type: node_type.to_string(),
            category: NodeCategory::DockerPython,
            hints,
            constructor: None,
        })
    }

    /// Register a node type resolved by a remote endpoint
    pub fn register_remote(&self, node_type: &str, hints: PortHints) -> Result<()> {
        self.insert(NodeRegistration {
            node_type: node_type.to_string(),
            category: NodeCategory::Remote,
            hints,
            constructor: None,
        })
    }

    fn insert(&self, registration: NodeRegistration) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&registration.node_type) {
            return Err(Error::Config(format!(
                "node type '{}' is already registered",
                registration.node_type
            )));
        }
        tracing::debug!(node_type = %registration.node_type, category = ?registration.category, "registered node type");
        entries.insert(registration.node_type.clone(), registration);
        Ok(())
    }

    /// Look up a registration
    pub fn get(&self, node_type: &str) -> Option<NodeRegistration> {
        self.entries.read().get(node_type).cloned()
    }

    /// Whether a type name is registered
    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.read().contains_key(node_type)
    }

    /// All registered type names, sorted
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Port hints for every registered type (consumed by the graph builder)
    pub fn port_hints(&self) -> HashMap<String, PortHints> {
        self.entries
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.hints))
            .collect()
    }

    /// Instantiate a native node.
    ///
    /// Fails for unknown types and for types whose category has no native
    /// constructor.
    pub fn create_native(
        &self,
        node_type: &str,
        node_id: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn PipelineNode>> {
        let registration = self.get(node_type).ok_or_else(|| Error::UnknownNodeType {
            name: node_type.to_string(),
        })?;
        let ctor = registration.constructor.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "node type '{node_type}' ({:?}) has no native constructor",
                registration.category
            ))
        })?;
        ctor(node_id, params)
    }

    /// Resolve every node type in a manifest, rejecting unknown names
    pub fn resolve_manifest(&self, manifest: &crate::manifest::Manifest) -> Result<()> {
        for node in &manifest.nodes {
            if !self.contains(&node.node_type) {
                return Err(Error::UnknownNodeType {
                    name: node.node_type.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Register the built-in native nodes into `registry`.
///
/// The bulk-registration surface: callers embedding the runtime add their
/// own types next to these.
pub fn register_builtin_nodes(registry: &NodeRegistry) -> Result<()> {
    use super::audio::{AudioFormatConvertNode, AudioResampleNode, EnergyVadNode};
    use super::passthrough::{EchoNode, PassthroughNode};
    use super::text::TextCollectorNode;

    registry.register_native("Passthrough", PortHints::default(), |id, params| {
        Ok(Box::new(PassthroughNode::new(id, params)))
    })?;
    registry.register_native("Echo", PortHints::default(), |id, params| {
        Ok(Box::new(EchoNode::new(id, params)))
    })?;
    registry.register_native(
        "AudioResample",
        PortHints {
            input: DataTypeHint::Audio,
            output: DataTypeHint::Audio,
        },
        |id, params| Ok(Box::new(AudioResampleNode::new(id, params)?)),
    )?;
    registry.register_native(
        "EnergyVad",
        PortHints {
            input: DataTypeHint::Audio,
            output: DataTypeHint::Any,
        },
        |id, params| Ok(Box::new(EnergyVadNode::new(id, params)?)),
    )?;
    registry.register_native(
        "AudioFormatConvert",
        PortHints {
            input: DataTypeHint::Audio,
            output: DataTypeHint::Audio,
        },
        |id, params| Ok(Box::new(AudioFormatConvertNode::new(id, params)?)),
    )?;
    registry.register_native(
        "TextCollector",
        PortHints {
            input: DataTypeHint::Text,
            output: DataTypeHint::Text,
        },
        |id, params| Ok(Box::new(TextCollectorNode::new(id, params))),
    )?;
    Ok(())
}

/// Create a fresh registry with all built-in nodes registered
pub fn default_registry() -> NodeRegistry {
    let registry = NodeRegistry::new();
    register_builtin_nodes(&registry).expect("builtin registrations cannot clash in a fresh registry");
    registry
}

/// Process-wide registry, initialized with the built-ins on first access
pub fn global_registry() -> &'static NodeRegistry {
    static GLOBAL: OnceLock<NodeRegistry> = OnceLock::new();
    GLOBAL.get_or_init(default_registry)
}
