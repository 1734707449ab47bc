//! Pipeline execution engine
//!
//! The runner drives validated pipeline graphs in two modes. Unary walks
//! the topological order once, feeding each node's outputs to its
//! dependents. Streaming gives every node its own task, connects them with
//! bounded per-edge channels (per-edge FIFO, backpressure by blocking),
//! fans control messages out on a broadcast side channel that bypasses
//! data ordering, and guarantees exactly-once cleanup of every executor on
//! every exit path.

use crate::data::{ControlDisposition, ControlMessage, DataTypeHint, RuntimeData};
use crate::executor::{build_executor, BuildContext};
use crate::graph::PipelineGraph;
use crate::ipc::IpcConfig;
use crate::manifest::Manifest;
use crate::metrics::SessionMetrics;
use crate::nodes::registry::{default_registry, NodeRegistry};
use crate::nodes::{NodeExecutor, SessionContext};
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::transport::{PipelineTransport, StreamSessionHandle, TransportData, TransportMap};
use crate::{Error, Result};
use futures::Stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamMap;
use uuid::Uuid;

pub mod edge;

use edge::EdgeSender;

type InputStream = Pin<Box<dyn Stream<Item = RuntimeData> + Send>>;

/// Runner-wide configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-edge channel capacity (items)
    pub edge_capacity: usize,
    /// Default bound on a node's wait for its next input; `None` waits
    /// until the session deadline (nodes may override with
    /// `params.read_timeout_ms`)
    pub node_read_timeout: Option<Duration>,
    /// Ring sizing for subprocess/container channels
    pub ipc: IpcConfig,
    /// Override for the bundled worker binary location
    pub worker_bin: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            edge_capacity: 32,
            node_read_timeout: None,
            ipc: IpcConfig::default(),
            worker_bin: None,
        }
    }
}

/// Per-session knobs
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Wall-clock budget for the whole session
    pub deadline: Option<Duration>,
}

/// Core pipeline execution engine exposed to transports.
///
/// Thread-safe; one runner hosts many concurrent sessions. Cheap to clone.
#[derive(Clone)]
pub struct PipelineRunner {
    registry: Arc<NodeRegistry>,
    transports: Arc<TransportMap>,
    config: RunnerConfig,
    #[cfg(feature = "docker")]
    containers: Arc<crate::executor::ContainerRegistry>,
}

impl PipelineRunner {
    /// Runner over the built-in node registry with default configuration
    pub fn new() -> Self {
        Self::with_registry(Arc::new(default_registry()), RunnerConfig::default())
    }

    /// Runner over a caller-provided registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RunnerConfig) -> Self {
        Self {
            registry,
            transports: Arc::new(TransportMap::new()),
            config,
            #[cfg(feature = "docker")]
            containers: Arc::new(crate::executor::ContainerRegistry::new()),
        }
    }

    /// Register transport clients for `execution_hint: remote` nodes.
    ///
    /// Call before executing; the set is read-only afterwards.
    pub fn with_transports(
        mut self,
        transports: HashMap<String, Arc<dyn PipelineTransport>>,
    ) -> Self {
        self.transports = Arc::new(transports);
        self
    }

    /// Node registry in use
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Validate a manifest and build its graph without executing.
    ///
    /// Resolves node types against the registry, checks connection
    /// endpoints and declared port types, and computes the topological
    /// order (rejecting cycles with a witness).
    pub fn validate(&self, manifest: &Manifest) -> Result<PipelineGraph> {
        self.registry.resolve_manifest(manifest)?;
        PipelineGraph::build(manifest, &self.registry.port_hints())
    }

    fn build_context(&self) -> BuildContext {
        BuildContext {
            registry: Arc::clone(&self.registry),
            transports: Arc::clone(&self.transports),
            ipc: self.config.ipc.clone(),
            worker_bin: self.config.worker_bin.clone(),
            #[cfg(feature = "docker")]
            containers: Arc::clone(&self.containers),
        }
    }

    /// Execute a pipeline with unary semantics: drive the graph to
    /// completion over one input and return the first sink output, with
    /// the input's envelope preserved.
    pub async fn execute_unary(
        &self,
        manifest: Arc<Manifest>,
        input: TransportData,
    ) -> Result<TransportData> {
        let graph = self.validate(&manifest)?;
        let session_id = format!("unary-{}", Uuid::new_v4());
        let ctx = SessionContext::new(&session_id);
        let build_ctx = self.build_context();

        // Build every executor before acquiring any heavier resources
        let mut executors: HashMap<String, Box<dyn NodeExecutor>> = HashMap::new();
        for node_id in &graph.execution_order {
            let spec = &graph.nodes[node_id].spec;
            executors.insert(node_id.clone(), build_executor(spec, &build_ctx)?);
        }

        // Initialize in topological order; any failure still cleans up
        // everything that was built
        let mut init_error = None;
        for node_id in &graph.execution_order {
            let executor = executors.get_mut(node_id).expect("executor built above");
            if let Err(e) = executor.initialize(&ctx).await {
                init_error = Some(e);
                break;
            }
        }

        let result = match init_error {
            Some(e) => Err(e),
            None => run_unary_graph(&graph, &mut executors, &ctx, input.data.clone()).await,
        };

        // Exactly-once cleanup on every path; failures are logged, not
        // propagated over a successful run
        for (node_id, mut executor) in executors {
            if let Err(e) = executor.cleanup().await {
                tracing::warn!(node_id = %node_id, error = %e, "cleanup failed");
            }
        }

        let mut outputs = result?;
        if outputs.is_empty() {
            return Err(Error::Execution("pipeline produced no output".into()));
        }
        Ok(input.envelope_onto(outputs.remove(0)))
    }

    /// Open a streaming session over the pipeline
    pub async fn create_stream_session(
        &self,
        manifest: Arc<Manifest>,
    ) -> Result<StreamSessionHandle> {
        self.create_stream_session_with(manifest, SessionConfig::default())
            .await
    }

    /// Open a streaming session with explicit per-session configuration
    pub async fn create_stream_session_with(
        &self,
        manifest: Arc<Manifest>,
        session_config: SessionConfig,
    ) -> Result<StreamSessionHandle> {
        let graph = self.validate(&manifest)?;
        let session_id = Uuid::new_v4().to_string();
        let deadline = session_config.deadline.map(|d| Instant::now() + d);
        let metrics = Arc::new(SessionMetrics::new());
        let ctx = {
            let mut ctx = SessionContext::new(&session_id);
            ctx.deadline = deadline;
            ctx.metrics = Arc::clone(&metrics);
            ctx
        };
        let build_ctx = self.build_context();
        let capacity = self.config.edge_capacity;

        // Build all executors up front so a bad manifest fails before any
        // task is spawned
        let mut executors: HashMap<String, Box<dyn NodeExecutor>> = HashMap::new();
        for node_id in &graph.execution_order {
            let spec = &graph.nodes[node_id].spec;
            executors.insert(node_id.clone(), build_executor(spec, &build_ctx)?);
        }

        // Session plumbing
        let (input_tx, input_rx) = mpsc::channel::<TransportData>(capacity);
        let (output_tx, output_rx) = mpsc::channel::<Result<TransportData>>(capacity.max(4));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (control_tx, _) = broadcast::channel::<ControlMessage>(64);
        let output_seq = Arc::new(AtomicU64::new(0));

        // Per-edge channels, keyed by edge id
        let mut edge_senders: HashMap<usize, EdgeSender> = HashMap::new();
        let mut edge_receivers: HashMap<usize, edge::EdgeReceiver> = HashMap::new();
        for e in &graph.edges {
            let lossy = graph.nodes[&e.to.node].spec.is_lossy();
            let (tx, rx) = edge::edge(capacity, lossy, Arc::clone(&metrics));
            edge_senders.insert(e.id, tx);
            edge_receivers.insert(e.id, rx);
        }

        // Session input fans out to every source node
        let mut source_txs = Vec::new();
        let mut source_rxs: HashMap<String, mpsc::Receiver<RuntimeData>> = HashMap::new();
        for source in &graph.sources {
            let (tx, rx) = mpsc::channel::<RuntimeData>(capacity);
            source_txs.push(tx);
            source_rxs.insert(source.clone(), rx);
        }

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        // Input dispatcher: session inputs to source nodes, control to the
        // broadcast plane
        tasks.spawn(dispatch_inputs(
            input_rx,
            source_txs,
            control_tx.clone(),
            cancel_rx.clone(),
            session_id.clone(),
            Arc::clone(&metrics),
        ));

        // One task per node
        let hints = self.registry.port_hints();
        for node_id in &graph.execution_order {
            let node = &graph.nodes[node_id];
            let executor = executors.remove(node_id).expect("executor built above");

            // Fan-in: the node's incoming edges, or the session input for
            // sources
            let mut inputs: Vec<(String, InputStream)> = Vec::new();
            if node.in_edges.is_empty() {
                let rx = source_rxs.remove(node_id).expect("source channel");
                inputs.push((
                    "session".to_string(),
                    tokio_stream::wrappers::ReceiverStream::new(rx).boxed(),
                ));
            } else {
                for &e in &node.in_edges {
                    let rx = edge_receivers.remove(&e).expect("edge receiver");
                    inputs.push((graph.edges[e].from.to_string(), rx.into_stream()));
                }
            }

            // Fan-out: outgoing edges with the consumer's declared hint
            let mut outputs = Vec::new();
            for &e in &node.out_edges {
                let tx = edge_senders.remove(&e).expect("edge sender");
                let consumer_type = &graph.nodes[&graph.edges[e].to.node].spec.node_type;
                let hint = hints.get(consumer_type).map(|h| h.input).unwrap_or_default();
                outputs.push(OutEdge {
                    sender: tx,
                    consumer_hint: hint,
                    label: graph.edges[e].to.to_string(),
                });
            }

            let router = OutputRouter {
                node_id: node_id.clone(),
                ctx: ctx.clone(),
                outputs,
                to_session: node.out_edges.is_empty().then(|| output_tx.clone()),
                control_tx: control_tx.clone(),
                cancel_rx: cancel_rx.clone(),
                output_seq: Arc::clone(&output_seq),
            };

            let read_timeout = node
                .spec
                .params
                .get("read_timeout_ms")
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis)
                .or(self.config.node_read_timeout);

            tasks.spawn(run_node(NodeTask {
                node_id: node_id.clone(),
                is_streaming: node.spec.is_streaming,
                retry: RetryPolicy::from_params(&node.spec.params),
                executor,
                ctx: ctx.clone(),
                inputs,
                router,
                control_rx: control_tx.subscribe(),
                cancel_rx: cancel_rx.clone(),
                read_timeout,
            }));
        }

        // Supervisor: session deadline, first-failure propagation, session
        // teardown
        tokio::spawn(supervise(
            tasks,
            output_tx,
            cancel_tx.clone(),
            deadline,
            session_id.clone(),
        ));

        tracing::info!(
            session_id = %session_id,
            nodes = graph.node_count(),
            edges = graph.edges.len(),
            "stream session started"
        );

        Ok(StreamSessionHandle::new(
            session_id, input_tx, output_rx, cancel_tx,
        ))
    }
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Unary walk of the graph in topological order
async fn run_unary_graph(
    graph: &PipelineGraph,
    executors: &mut HashMap<String, Box<dyn NodeExecutor>>,
    ctx: &SessionContext,
    input: RuntimeData,
) -> Result<Vec<RuntimeData>> {
    let mut node_outputs: HashMap<String, Vec<RuntimeData>> = HashMap::new();
    let mut sink_outputs = Vec::new();

    for node_id in &graph.execution_order {
        let node = &graph.nodes[node_id];
        let inputs: Vec<RuntimeData> = if node.in_edges.is_empty() {
            vec![input.clone()]
        } else {
            node.in_edges
                .iter()
                .flat_map(|&e| {
                    node_outputs
                        .get(&graph.edges[e].from.node)
                        .cloned()
                        .unwrap_or_default()
                })
                .collect()
        };

        let executor = executors.get_mut(node_id).expect("executor exists");
        let policy = RetryPolicy::from_params(&node.spec.params);
        let mut produced = Vec::new();
        for item in inputs {
            let outputs =
                process_with_retry(executor.as_mut(), policy, ctx.deadline, &ctx.metrics, &item)
                    .await?;
            produced.extend(outputs);
        }

        if node.out_edges.is_empty() {
            // Control directives are not caller-facing results
            sink_outputs.extend(produced.iter().filter(|d| !d.is_control()).cloned());
        }
        node_outputs.insert(node_id.clone(), produced);
    }

    Ok(sink_outputs)
}

/// `process_unary` under the node's retry policy, bounded by the session
/// deadline. Only retryable errors re-attempt; a backoff that would cross
/// the deadline converts into `Timeout`.
async fn process_with_retry(
    executor: &mut dyn NodeExecutor,
    policy: RetryPolicy,
    deadline: Option<Instant>,
    metrics: &SessionMetrics,
    item: &RuntimeData,
) -> Result<Vec<RuntimeData>> {
    let mut retry = 0u32;
    loop {
        match executor.process_unary(item.clone()).await {
            Ok(outputs) => return Ok(outputs),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let Some(delay) = policy.backoff(retry) else {
                    return Err(e);
                };
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        return Err(Error::Timeout(format!(
                            "retry budget exceeded session deadline: {e}"
                        )));
                    }
                }
                retry += 1;
                metrics.record_retry();
                tracing::warn!(
                    node_id = executor.node_id(),
                    retry,
                    ?delay,
                    error = %e,
                    "retrying node after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Session input dispatcher
async fn dispatch_inputs(
    mut input_rx: mpsc::Receiver<TransportData>,
    source_txs: Vec<mpsc::Sender<RuntimeData>>,
    control_tx: broadcast::Sender<ControlMessage>,
    mut cancel_rx: watch::Receiver<bool>,
    session_id: String,
    metrics: Arc<SessionMetrics>,
) -> Result<()> {
    // Monotonicity watch per stream id (warn only)
    let mut last_ts: HashMap<String, u64> = HashMap::new();

    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel_rx.changed() => return Ok(()),
            packet = input_rx.recv() => match packet {
                Some(packet) => packet,
                // Caller dropped the handle: end of input, sources drain
                None => return Ok(()),
            },
        };

        if let RuntimeData::Control(msg) = packet.data {
            publish_control(&control_tx, msg, &session_id, &metrics);
            continue;
        }

        if let (Some(stream), Some(ts)) = (packet.data.stream_id(), packet.data.timestamp_us()) {
            let last = last_ts.entry(stream.to_string()).or_insert(ts);
            if ts < *last {
                tracing::warn!(
                    session_id = %session_id,
                    stream_id = %stream,
                    ts,
                    last = *last,
                    "non-monotone timestamp on session input"
                );
            } else {
                *last = ts;
            }
        }

        for tx in &source_txs {
            let item = packet.data.clone();
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => return Ok(()),
                sent = tx.send(item) => {
                    if sent.is_err() {
                        // Source task gone; session is tearing down
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Validate, warn, and fan a control message out on the side channel
fn publish_control(
    control_tx: &broadcast::Sender<ControlMessage>,
    msg: ControlMessage,
    session_id: &str,
    metrics: &SessionMetrics,
) {
    match msg.disposition(session_id) {
        ControlDisposition::Reject(reason) => {
            tracing::warn!(session_id = %session_id, %reason, "rejecting control message");
            return;
        }
        ControlDisposition::ProcessWithWarning(reason) => {
            tracing::warn!(session_id = %session_id, %reason, "delivering control message with warning");
        }
        ControlDisposition::Process => {}
    }
    let latency = crate::data::control::now_us().saturating_sub(msg.timestamp_us);
    metrics.record_control_delivery(latency);
    // No subscribers is fine (single-node pipelines mid-teardown)
    let _ = control_tx.send(msg);
}

/// One outgoing edge from a node task's perspective
struct OutEdge {
    sender: EdgeSender,
    consumer_hint: DataTypeHint,
    label: String,
}

/// Routes one node's produced items: control to the side channel, data to
/// every accepting downstream edge (fan-out duplicates), sink outputs to
/// the session
struct OutputRouter {
    node_id: String,
    ctx: SessionContext,
    outputs: Vec<OutEdge>,
    to_session: Option<mpsc::Sender<Result<TransportData>>>,
    control_tx: broadcast::Sender<ControlMessage>,
    cancel_rx: watch::Receiver<bool>,
    output_seq: Arc<AtomicU64>,
}

impl OutputRouter {
    async fn route(&mut self, item: RuntimeData) -> Result<()> {
        if let RuntimeData::Control(msg) = item {
            publish_control(&self.control_tx, msg, &self.ctx.session_id, &self.ctx.metrics);
            return Ok(());
        }

        if let Some(out) = &self.to_session {
            let seq = self.output_seq.fetch_add(1, Ordering::Relaxed);
            let packet = TransportData::new(item)
                .with_session(self.ctx.session_id.clone())
                .with_sequence(seq);
            // A closed output side means the caller went away
            let _ = out.send(Ok(packet)).await;
            self.ctx.metrics.record_item_routed();
            return Ok(());
        }

        let accepting: Vec<usize> = self
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, e)| e.consumer_hint.accepts(&item))
            .map(|(i, _)| i)
            .collect();
        if accepting.is_empty() {
            tracing::warn!(
                node_id = %self.node_id,
                data_type = item.data_type(),
                "output matched no downstream edge"
            );
            return Ok(());
        }

        for &i in &accepting {
            let edge = &self.outputs[i];
            tokio::select! {
                biased;
                _ = self.cancel_rx.changed() => return Ok(()),
                sent = edge.sender.send(item.clone()) => {
                    if sent.is_err() {
                        tracing::debug!(node_id = %self.node_id, edge = %edge.label, "downstream edge closed");
                        return Ok(());
                    }
                    self.ctx.metrics.record_item_routed();
                }
            }
        }
        Ok(())
    }
}

/// Everything one node task owns
struct NodeTask {
    node_id: String,
    is_streaming: bool,
    retry: RetryPolicy,
    executor: Box<dyn NodeExecutor>,
    ctx: SessionContext,
    inputs: Vec<(String, InputStream)>,
    router: OutputRouter,
    control_rx: broadcast::Receiver<ControlMessage>,
    cancel_rx: watch::Receiver<bool>,
    read_timeout: Option<Duration>,
}

/// Run one node for the lifetime of the session.
///
/// Cleanup runs exactly once on every exit path: success, node failure,
/// cancellation, or timeout.
async fn run_node(mut task: NodeTask) -> Result<()> {
    let node_id = task.node_id.clone();

    let result = match task.executor.initialize(&task.ctx).await {
        Ok(()) => {
            if task.is_streaming {
                drive_streaming(&mut task).await
            } else {
                drive_one_shot(&mut task).await
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = task.executor.cleanup().await {
        tracing::warn!(node_id = %node_id, error = %e, "cleanup failed");
    }

    match &result {
        Ok(()) => tracing::debug!(node_id = %node_id, "node task finished"),
        Err(e) => tracing::error!(node_id = %node_id, error = %e, "node task failed"),
    }
    result
}

/// Merge a node's input streams; per-edge order is preserved, cross-edge
/// order is arbitrary
fn merge_inputs(inputs: Vec<(String, InputStream)>) -> StreamMap<String, InputStream> {
    let mut map = StreamMap::new();
    for (label, stream) in inputs {
        map.insert(label, stream);
    }
    map
}

/// Await the next input, bounded by the node read timeout and the session
/// deadline
async fn next_input(
    merged: &mut StreamMap<String, InputStream>,
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
    node_id: &str,
) -> Result<Option<RuntimeData>> {
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    let bound = match (read_timeout, remaining) {
        (Some(t), Some(r)) => Some(t.min(r)),
        (Some(t), None) => Some(t),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    };
    let next = merged.next();
    let item = match bound {
        Some(bound) => tokio::time::timeout(bound, next).await.map_err(|_| {
            Error::Timeout(format!("node '{node_id}' timed out waiting for input"))
        })?,
        None => next.await,
    };
    Ok(item.map(|(_, data)| data))
}

/// Drive a non-streaming node: one `process_unary` per input item, with
/// retry and circuit breaking
async fn drive_one_shot(task: &mut NodeTask) -> Result<()> {
    let mut merged = merge_inputs(std::mem::take(&mut task.inputs));
    let mut breaker = CircuitBreaker::default();
    let mut cancel_rx = task.cancel_rx.clone();
    let node_id = task.node_id.clone();
    let deadline = task.ctx.deadline;
    let read_timeout = task.read_timeout;

    loop {
        tokio::select! {
            biased;

            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return Ok(());
                }
            }

            ctrl = task.control_rx.recv() => match ctrl {
                Ok(msg) => {
                    let latency = crate::data::control::now_us().saturating_sub(msg.timestamp_us);
                    task.ctx.metrics.record_control_delivery(latency);
                    if let Err(e) = task.executor.process_unary(RuntimeData::Control(msg)).await {
                        tracing::warn!(node_id = %node_id, error = %e, "control delivery failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(node_id = %node_id, missed = n, "control channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Session plumbing gone; the data path decides when to
                    // end
                }
            },

            item = next_input(&mut merged, read_timeout, deadline, &node_id) => {
                let Some(item) = item? else {
                    // All inputs closed: done
                    return Ok(());
                };

                let outputs = process_with_retry(
                    task.executor.as_mut(),
                    task.retry,
                    deadline,
                    &task.ctx.metrics,
                    &item,
                )
                .await;

                match outputs {
                    Ok(outputs) => {
                        breaker.record_success();
                        for output in outputs {
                            task.router.route(output).await?;
                        }
                    }
                    // A non-retryable failure is session-fatal immediately
                    Err(e) if !e.is_retryable() => {
                        breaker.record_failure();
                        return Err(e);
                    }
                    // Exhausted retries on a transient failure: degrade by
                    // dropping the item until the breaker trips
                    Err(e) => {
                        tracing::warn!(
                            node_id = %node_id,
                            error = %e,
                            "dropping item after exhausted retries"
                        );
                        if breaker.record_failure() {
                            task.ctx.metrics.record_breaker_trip();
                            return Err(Error::NodeProcess {
                                node_id: node_id.clone(),
                                cause: format!(
                                    "circuit breaker opened after {} consecutive failures: {e}",
                                    breaker.consecutive_failures()
                                ),
                                retryable: false,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Drive a streaming node through its stream handle; the receive side
/// pumps in a separate task so output backpressure cannot deadlock input
async fn drive_streaming(task: &mut NodeTask) -> Result<()> {
    let handle = task.executor.open_stream(&task.ctx).await?;
    let (mut sender, mut receiver) = handle.split();

    let mut merged = merge_inputs(std::mem::take(&mut task.inputs));
    let mut cancel_rx = task.cancel_rx.clone();
    let node_id = task.node_id.clone();
    let deadline = task.ctx.deadline;
    let read_timeout = task.read_timeout;

    // Output pump: owns the router until the node closes its stream or the
    // session cancels
    let placeholder = OutputRouter {
        node_id: node_id.clone(),
        ctx: task.ctx.clone(),
        outputs: Vec::new(),
        to_session: None,
        control_tx: task.router.control_tx.clone(),
        cancel_rx: task.cancel_rx.clone(),
        output_seq: Arc::clone(&task.router.output_seq),
    };
    let mut router = std::mem::replace(&mut task.router, placeholder);
    let mut pump_cancel = task.cancel_rx.clone();
    let mut pump = tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                biased;
                changed = pump_cancel.changed() => {
                    if changed.is_err() || *pump_cancel.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                item = receiver.recv() => item,
            };
            match item {
                Ok(Some(item)) => router.route(item).await?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    });

    // Input side. The pump handle is polled too: a node that fails while
    // the input side is idle must still end the task promptly.
    let mut early_pump_result: Option<Result<()>> = None;
    let in_result: Result<()> = loop {
        tokio::select! {
            biased;

            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break Ok(());
                }
            }

            joined = &mut pump => {
                early_pump_result = Some(joined.unwrap_or_else(|e| {
                    Err(Error::Execution(format!("output pump panicked: {e}")))
                }));
                break Ok(());
            }

            ctrl = task.control_rx.recv() => match ctrl {
                Ok(msg) => {
                    let latency = crate::data::control::now_us().saturating_sub(msg.timestamp_us);
                    task.ctx.metrics.record_control_delivery(latency);
                    if let Err(e) = sender.send(RuntimeData::Control(msg)).await {
                        tracing::warn!(node_id = %node_id, error = %e, "control delivery failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(node_id = %node_id, missed = n, "control channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },

            item = next_input(&mut merged, read_timeout, deadline, &node_id) => {
                match item? {
                    Some(item) => {
                        if sender.send(item).await.is_err() {
                            // Backend ended; the pump carries the real error
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    // End of input (or cancel): close the stream so the node flushes,
    // then wait for the output pump to drain
    sender.close();
    drop(sender);
    let pump_result = match early_pump_result {
        Some(result) => result,
        None => pump
            .await
            .unwrap_or_else(|e| Err(Error::Execution(format!("output pump panicked: {e}")))),
    };

    in_result.and(pump_result)
}

/// Session supervisor: propagates the first failure, enforces the
/// deadline, and closes the output stream when every task has exited
async fn supervise(
    mut tasks: JoinSet<Result<()>>,
    output_tx: mpsc::Sender<Result<TransportData>>,
    cancel_tx: watch::Sender<bool>,
    deadline: Option<Instant>,
    session_id: String,
) {
    let mut failed = false;
    let deadline_sleep = async {
        match deadline {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline_sleep);

    loop {
        tokio::select! {
            _ = &mut deadline_sleep, if deadline.is_some() && !failed => {
                tracing::warn!(session_id = %session_id, "session deadline expired");
                failed = true;
                // Cancel first so teardown is not gated on the caller
                // draining its output channel
                let _ = cancel_tx.send(true);
                let err = Error::Timeout(format!("session {session_id} exceeded its deadline"));
                let _ = output_tx.send(Err(err)).await;
            }

            joined = tasks.join_next() => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    if !failed {
                        tracing::error!(session_id = %session_id, error = %e, "session failing on first node error");
                        failed = true;
                        let _ = cancel_tx.send(true);
                        let _ = output_tx.send(Err(e)).await;
                    } else {
                        tracing::debug!(session_id = %session_id, error = %e, "follow-on node error suppressed");
                    }
                }
                Some(Err(join_err)) => {
                    if !failed {
                        failed = true;
                        let _ = cancel_tx.send(true);
                        let err = Error::Execution(format!("node task panicked: {join_err}"));
                        let _ = output_tx.send(Err(err)).await;
                    }
                }
                // All tasks done: dropping output_tx ends the stream
                None => break,
            }
        }
    }

    tracing::info!(session_id = %session_id, "stream session ended");
}
