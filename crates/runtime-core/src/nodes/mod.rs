//! Node execution contract
//!
//! Every backend (native, subprocess, container, remote) sits behind the
//! same [`NodeExecutor`] contract: initialize once per session, process
//! zero or more inputs, clean up exactly once on every exit path.
//! Streaming nodes additionally expose a [`StreamHandle`].
//!
//! Native node implementations live here too; they implement the simpler
//! [`PipelineNode`] trait and are adapted by the native executor.

use crate::data::{ControlMessage, RuntimeData};
use crate::metrics::SessionMetrics;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub mod audio;
pub mod passthrough;
pub mod registry;
pub mod text;

pub use registry::{default_registry, NodeCategory, NodeRegistry};

/// Per-session state shared with executors at initialize/open_stream time
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Session identifier (UUID for streaming sessions)
    pub session_id: String,
    /// Absolute session deadline, if any
    pub deadline: Option<Instant>,
    /// Shared session counters
    pub metrics: Arc<SessionMetrics>,
}

impl SessionContext {
    /// Context for the given session id with no deadline
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            deadline: None,
            metrics: Arc::new(SessionMetrics::new()),
        }
    }

    /// Attach a deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Remaining session budget; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Bound a per-operation timeout by the remaining session budget
    pub fn bound_timeout(&self, op_timeout: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => op_timeout.min(remaining),
            None => op_timeout,
        }
    }
}

/// Uniform execution contract over all node backends.
///
/// Lifecycle: created by a registry factory → `initialize` once →
/// `process_unary` / `open_stream` → `cleanup` exactly once, on every exit
/// path including failure and cancellation.
#[async_trait]
pub trait NodeExecutor: Send {
    /// Node id this executor runs (unique within the pipeline)
    fn node_id(&self) -> &str;

    /// Acquire resources: load models, spawn the worker, dial the remote
    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()>;

    /// Process one input, producing zero, one, or many outputs
    async fn process_unary(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>>;

    /// Open a long-lived stream through this node.
    ///
    /// Only meaningful when the manifest marks the node `is_streaming`;
    /// the default rejects the call.
    async fn open_stream(&mut self, ctx: &SessionContext) -> Result<StreamHandle> {
        let _ = ctx;
        Err(crate::Error::node_process(
            self.node_id(),
            "node does not support streaming",
        ))
    }

    /// Release all resources. Invoked exactly once; errors are logged by
    /// the runner, not propagated.
    async fn cleanup(&mut self) -> Result<()>;
}

/// Bidirectional handle over a streaming node.
///
/// `recv` returning `Ok(None)` means the stream closed cleanly; an `Err`
/// surfaces a structured node failure. Control messages passed through
/// `send` as `RuntimeData::Control` are routed out-of-band by the backend
/// so large media payloads cannot head-of-line block a cancel.
///
/// Every backend returns this channel-backed struct from `open_stream`
/// and drives its own side (node task, ring pump, remote session) from
/// the matching [`StreamBackend`]. The handle splits into independent
/// send/receive halves so both directions can be pumped concurrently.
pub struct StreamHandle {
    sender: StreamSender,
    receiver: StreamReceiver,
}

/// Sending half of a [`StreamHandle`]
pub struct StreamSender {
    data_tx: Option<mpsc::Sender<RuntimeData>>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

/// Receiving half of a [`StreamHandle`]
pub struct StreamReceiver {
    out_rx: mpsc::Receiver<Result<RuntimeData>>,
}

/// Backend-side endpoints of a [`StreamHandle`]
pub struct StreamBackend {
    /// Data inputs in arrival order
    pub data_rx: mpsc::Receiver<RuntimeData>,
    /// Control messages; poll before data so they can overtake
    pub control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    /// Outputs and failures back to the handle
    pub out_tx: mpsc::Sender<Result<RuntimeData>>,
}

impl StreamHandle {
    /// Create a handle/backend pair.
    ///
    /// `data_capacity` bounds in-flight inputs (the backpressure point);
    /// the control channel is unbounded so it never blocks behind data.
    pub fn channel(data_capacity: usize) -> (StreamHandle, StreamBackend) {
        let (data_tx, data_rx) = mpsc::channel(data_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(data_capacity.max(1));
        (
            StreamHandle {
                sender: StreamSender {
                    data_tx: Some(data_tx),
                    control_tx,
                },
                receiver: StreamReceiver { out_rx },
            },
            StreamBackend {
                data_rx,
                control_rx,
                out_tx,
            },
        )
    }

    /// Feed one input into the stream
    pub async fn send(&mut self, input: RuntimeData) -> Result<()> {
        self.sender.send(input).await
    }

    /// Await the next output; `None` = end of stream
    pub async fn recv(&mut self) -> Result<Option<RuntimeData>> {
        self.receiver.recv().await
    }

    /// Signal that no more inputs will be sent. Remaining outputs stay
    /// readable until `recv` returns `None`.
    pub fn close(&mut self) {
        self.sender.close();
    }

    /// Split into independently owned halves
    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

impl StreamSender {
    /// Feed one input; control variants take the side channel
    pub async fn send(&mut self, input: RuntimeData) -> Result<()> {
        if let RuntimeData::Control(msg) = input {
            return self
                .control_tx
                .send(msg)
                .map_err(|_| crate::Error::Execution("stream backend ended".into()));
        }
        match &self.data_tx {
            Some(tx) => tx
                .send(input)
                .await
                .map_err(|_| crate::Error::Execution("stream backend ended".into())),
            None => Err(crate::Error::Execution("stream already closed".into())),
        }
    }

    /// Close the input side (backend sees end-of-input and flushes)
    pub fn close(&mut self) {
        self.data_tx.take();
    }
}

impl StreamReceiver {
    /// Await the next output; `None` = end of stream
    pub async fn recv(&mut self) -> Result<Option<RuntimeData>> {
        match self.out_rx.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// In-process node implementation.
///
/// The native executor adapts this to the [`NodeExecutor`] contract; the
/// worker binary hosts it behind the shm rings for subprocess execution.
#[async_trait]
pub trait PipelineNode: Send {
    /// Type name as registered (e.g. "AudioResample")
    fn node_type(&self) -> &'static str;

    /// One-time setup before the first `process` call
    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Process one input into zero or more outputs
    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>>;

    /// Emit any buffered tail when the stream closes
    async fn flush(&mut self) -> Result<Vec<RuntimeData>> {
        Ok(Vec::new())
    }

    /// Handle an out-of-band control message. Must be idempotent under
    /// repeated cancels.
    async fn on_control(&mut self, msg: &ControlMessage) -> Result<()> {
        let _ = msg;
        Ok(())
    }

    /// Release node-held resources
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}
