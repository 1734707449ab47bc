//! Node executor backends
//!
//! Four backends implement the one [`NodeExecutor`](crate::nodes::NodeExecutor)
//! contract: in-process native dispatch, a worker subprocess over
//! shared-memory rings, the same worker inside a container, and remote
//! dispatch through a [`PipelineTransport`](crate::transport::PipelineTransport).
//! [`build_executor`] combines the registry category with the manifest's
//! `execution_hint` to pick one.

use crate::ipc::IpcConfig;
use crate::manifest::{ExecutionHint, NodeManifest, RuntimeHint};
use crate::nodes::registry::{NodeCategory, NodeRegistry};
use crate::nodes::NodeExecutor;
use crate::transport::TransportMap;
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

pub mod native;
pub mod remote;
pub mod subprocess;

#[cfg(feature = "docker")]
pub mod container;

pub use native::NativeExecutor;
pub use remote::RemoteExecutor;
pub use subprocess::{SubprocessConfig, SubprocessExecutor};

#[cfg(feature = "docker")]
pub use container::{ContainerExecutor, ContainerRegistry};

/// Shared inputs for executor construction
#[derive(Clone)]
pub struct BuildContext {
    /// Node type registry
    pub registry: Arc<NodeRegistry>,
    /// Transport clients available for remote nodes, by name
    pub transports: Arc<TransportMap>,
    /// Ring sizing for subprocess/container channels
    pub ipc: IpcConfig,
    /// Override for the bundled worker binary location
    pub worker_bin: Option<PathBuf>,
    /// Shared container bookkeeping (image pulls, ref counts)
    #[cfg(feature = "docker")]
    pub containers: Arc<ContainerRegistry>,
}

impl BuildContext {
    /// Context over a registry with no transports and default IPC sizing
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            transports: Arc::new(TransportMap::new()),
            ipc: IpcConfig::default(),
            worker_bin: None,
            #[cfg(feature = "docker")]
            containers: Arc::new(ContainerRegistry::new()),
        }
    }

    /// Builder: register transport clients for remote dispatch
    pub fn with_transports(mut self, transports: TransportMap) -> Self {
        self.transports = Arc::new(transports);
        self
    }
}

/// Build the executor for one manifest node.
///
/// The registry category fixes what the node *is*; the manifest's
/// `execution_hint` picks where it runs. Combinations that make no sense
/// (a Python node forced native, an unregistered type) fail here, before
/// any resources are acquired.
pub fn build_executor(spec: &NodeManifest, ctx: &BuildContext) -> Result<Box<dyn NodeExecutor>> {
    let registration = ctx
        .registry
        .get(&spec.node_type)
        .ok_or_else(|| Error::UnknownNodeType {
            name: spec.node_type.clone(),
        })?;

    // Remote and container placement win over the category default; a
    // Python-category node always needs a worker process.
    if registration.category == NodeCategory::Remote
        || spec.execution_hint == ExecutionHint::Remote
    {
        return Ok(Box::new(RemoteExecutor::from_spec(spec, &ctx.transports)?));
    }

    if registration.category == NodeCategory::DockerPython
        || spec.execution_hint == ExecutionHint::Docker
    {
        #[cfg(feature = "docker")]
        {
            return Ok(Box::new(ContainerExecutor::new(
                spec,
                ctx.ipc.clone(),
                Arc::clone(&ctx.containers),
            )?));
        }
        #[cfg(not(feature = "docker"))]
        {
            return Err(Error::Config(format!(
                "node '{}' requires the docker feature",
                spec.id
            )));
        }
    }

    if registration.category == NodeCategory::SubprocessPython {
        let config = SubprocessConfig::for_python_worker(spec, ctx)?;
        return Ok(Box::new(SubprocessExecutor::new(spec, config)));
    }

    // Native category
    match spec.execution_hint {
        ExecutionHint::Native => {
            let node = ctx
                .registry
                .create_native(&spec.node_type, &spec.id, &spec.params)?;
            Ok(Box::new(NativeExecutor::new(&spec.id, node)))
        }
        ExecutionHint::Subprocess => {
            let config = if spec.runtime_hint == RuntimeHint::Python {
                SubprocessConfig::for_python_worker(spec, ctx)?
            } else {
                SubprocessConfig::for_rust_worker(spec, ctx)?
            };
            Ok(Box::new(SubprocessExecutor::new(spec, config)))
        }
        ExecutionHint::Docker | ExecutionHint::Remote => {
            unreachable!("handled above")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::registry::default_registry;

    fn spec(node_type: &str, hint: ExecutionHint) -> NodeManifest {
        NodeManifest {
            id: "n1".into(),
            node_type: node_type.into(),
            execution_hint: hint,
            ..Default::default()
        }
    }

    #[test]
    fn test_native_dispatch() {
        let ctx = BuildContext::new(Arc::new(default_registry()));
        let executor = build_executor(&spec("Echo", ExecutionHint::Native), &ctx).unwrap();
        assert_eq!(executor.node_id(), "n1");
    }

    #[test]
    fn test_unknown_type_fails_before_resources() {
        let ctx = BuildContext::new(Arc::new(default_registry()));
        let err = match build_executor(&spec("Mystery", ExecutionHint::Native), &ctx) {
            Err(e) => e,
            Ok(_) => panic!("expected unknown node type to fail"),
        };
        assert!(matches!(err, Error::UnknownNodeType { .. }));
    }

    #[test]
    fn test_remote_requires_transport() {
        let ctx = BuildContext::new(Arc::new(default_registry()));
        let err = match build_executor(&spec("Echo", ExecutionHint::Remote), &ctx) {
            Err(e) => e,
            Ok(_) => panic!("expected remote without transport to fail"),
        };
        assert!(matches!(err, Error::Config(_)), "{err}");
    }
}
