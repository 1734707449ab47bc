//! Error types for the mediagraph runtime core
//!
//! Build-time errors (manifest/graph) are never retried. Runtime errors
//! carry the failing node id and a retryable flag that the retry layer and
//! circuit breaker consult.

use thiserror::Error;

/// Result type alias for runtime-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime-core
#[derive(Debug, Error)]
pub enum Error {
    /// Manifest parsing or structural validation error
    #[error("Invalid manifest: {reason}")]
    InvalidManifest {
        /// Why the manifest was rejected
        reason: String,
    },

    /// Manifest references a node type not present in the registry
    #[error("Unknown node type: {name}")]
    UnknownNodeType {
        /// The unresolved type name
        name: String,
    },

    /// Connection endpoint does not resolve to an existing node/port
    #[error("Dangling edge: {from} -> {to}: {reason}")]
    DanglingEdge {
        /// Source endpoint as written in the manifest
        from: String,
        /// Target endpoint as written in the manifest
        to: String,
        /// Which side failed to resolve and why
        reason: String,
    },

    /// The pipeline graph contains a cycle
    #[error("Pipeline graph contains a cycle: {}", nodes.join(" -> "))]
    Cycle {
        /// Witness: node ids on the cycle, in edge order
        nodes: Vec<String>,
    },

    /// Declared port data types of a connection disagree
    #[error("Port type mismatch on {from} -> {to}: producer emits {produced}, consumer accepts {accepted}")]
    PortTypeMismatch {
        /// Source endpoint
        from: String,
        /// Target endpoint
        to: String,
        /// Declared output type of the producer
        produced: String,
        /// Declared input type of the consumer
        accepted: String,
    },

    /// A required input port has no incoming connection
    #[error("Node '{node_id}' input port '{port}' is required but unconnected")]
    MissingRequiredPort {
        /// Node owning the port
        node_id: String,
        /// Port name
        port: String,
    },

    /// Node initialization failed
    #[error("Node '{node_id}' failed to initialize: {cause}")]
    NodeInit {
        /// Failing node
        node_id: String,
        /// Underlying cause
        cause: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// Node processing failed
    #[error("Node '{node_id}' failed while processing: {cause}")]
    NodeProcess {
        /// Failing node
        node_id: String,
        /// Underlying cause
        cause: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// Node cleanup failed (logged, normally not propagated)
    #[error("Node '{node_id}' failed during cleanup: {cause}")]
    NodeCleanup {
        /// Failing node
        node_id: String,
        /// Underlying cause
        cause: String,
    },

    /// Transient condition (network blip, ring briefly full, reconnect)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Deadline or per-read timeout expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The session was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// A resource limit was hit (container OOM, GPU unavailable)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Shared-memory IPC failure
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Invalid or malformed data buffer
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Session lookup failure in the router
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Ingestion source failure
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// Transport-level failure reported by a remote endpoint
    #[error("Transport error: {0}")]
    Transport(String),

    /// Registry misconfiguration (duplicate names, missing plugins)
    #[error("Configuration error: {0}")]
    Config(String),

    /// General execution error
    #[error("Execution error: {0}")]
    Execution(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a non-retryable process failure scoped to a node
    pub fn node_process(node_id: impl Into<String>, cause: impl ToString) -> Self {
        Error::NodeProcess {
            node_id: node_id.into(),
            cause: cause.to_string(),
            retryable: false,
        }
    }

    /// Shorthand for a retryable process failure scoped to a node
    pub fn node_process_retryable(node_id: impl Into<String>, cause: impl ToString) -> Self {
        Error::NodeProcess {
            node_id: node_id.into(),
            cause: cause.to_string(),
            retryable: true,
        }
    }

    /// Shorthand for an initialization failure scoped to a node
    pub fn node_init(node_id: impl Into<String>, cause: impl ToString) -> Self {
        Error::NodeInit {
            node_id: node_id.into(),
            cause: cause.to_string(),
            retryable: false,
        }
    }

    /// Shorthand for a manifest rejection
    pub fn manifest(reason: impl Into<String>) -> Self {
        Error::InvalidManifest {
            reason: reason.into(),
        }
    }

    /// Whether the retry layer may re-attempt the failed operation.
    ///
    /// Build errors are never retryable. `Transient` and `Timeout` always
    /// are; node errors carry their own flag.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Timeout(_) => true,
            Error::NodeInit { retryable, .. } | Error::NodeProcess { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this error terminates the whole session when it surfaces
    /// outside the retry loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NodeCleanup { .. })
    }

    /// The node this error is scoped to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Error::NodeInit { node_id, .. }
            | Error::NodeProcess { node_id, .. }
            | Error::NodeCleanup { node_id, .. }
            | Error::MissingRequiredPort { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Short kind name for logging and transport status mapping
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidManifest { .. } => "invalid_manifest",
            Error::UnknownNodeType { .. } => "unknown_node_type",
            Error::DanglingEdge { .. } => "dangling_edge",
            Error::Cycle { .. } => "cycle",
            Error::PortTypeMismatch { .. } => "port_type_mismatch",
            Error::MissingRequiredPort { .. } => "missing_required_port",
            Error::NodeInit { .. } => "node_init",
            Error::NodeProcess { .. } => "node_process",
            Error::NodeCleanup { .. } => "node_cleanup",
            Error::Transient(_) => "transient",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Ipc(_) => "ipc",
            Error::InvalidData(_) => "invalid_data",
            Error::SessionNotFound(_) => "session_not_found",
            Error::Ingestion(_) => "ingestion",
            Error::Transport(_) => "transport",
            Error::Config(_) => "config",
            Error::Execution(_) => "execution",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_errors_are_not_retryable() {
        assert!(!Error::manifest("bad version").is_retryable());
        assert!(!Error::Cycle {
            nodes: vec!["a".into(), "b".into()]
        }
        .is_retryable());
        assert!(!Error::UnknownNodeType { name: "X".into() }.is_retryable());
    }

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(Error::Transient("blip".into()).is_retryable());
        assert!(Error::Timeout("read".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn node_errors_carry_their_flag() {
        assert!(Error::node_process_retryable("n1", "oops").is_retryable());
        assert!(!Error::node_process("n1", "oops").is_retryable());
        assert_eq!(Error::node_process("n1", "oops").node_id(), Some("n1"));
    }

    #[test]
    fn cycle_error_lists_witness() {
        let err = Error::Cycle {
            nodes: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Pipeline graph contains a cycle: a -> b -> a");
    }
}
