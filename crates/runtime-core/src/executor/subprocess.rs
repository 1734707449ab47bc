//! Worker-process executor
//!
//! Spawns the node into a separate process and speaks the shared-memory
//! ring channel to it. The executor owns the whole process lifecycle:
//! spawn + READY handshake on `initialize`, heartbeat supervision while
//! running (a beat every 250 ms, three missed beats = unhealthy), and
//! graceful shutdown on `cleanup` (SHUTDOWN frame, then SIGTERM, then
//! SIGKILL after the grace period). Loss of the worker is a fatal,
//! non-retryable node error.

use crate::data::{ControlMessage, RuntimeData};
use crate::ipc::channel::{DataFrame, ENV_SHM_NAME};
use crate::ipc::{HostIpcChannel, IpcConfig, WorkerEvent};
use crate::manifest::NodeManifest;
use crate::nodes::{NodeExecutor, SessionContext, StreamBackend, StreamHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

/// Environment variable: node type for the worker to instantiate
pub const ENV_NODE_TYPE: &str = "MEDIAGRAPH_NODE_TYPE";
/// Environment variable: node id within the pipeline
pub const ENV_NODE_ID: &str = "MEDIAGRAPH_NODE_ID";
/// Environment variable: node params as JSON
pub const ENV_NODE_PARAMS: &str = "MEDIAGRAPH_NODE_PARAMS";
/// Environment variable: owning session id
pub const ENV_SESSION_ID: &str = "MEDIAGRAPH_SESSION_ID";
/// Environment variable: override for the bundled worker binary
pub const ENV_WORKER_BIN: &str = "MEDIAGRAPH_WORKER_BIN";

/// Worker heartbeat period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);
/// Consecutive missed beats before the worker counts as unhealthy
pub const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// How a subprocess executor launches and supervises its worker
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// argv of the worker command
    pub command: Vec<String>,
    /// Ring sizing
    pub ipc: IpcConfig,
    /// How long to wait for the READY handshake
    pub ready_timeout: Duration,
    /// Grace period between SHUTDOWN, SIGTERM, and SIGKILL
    pub grace: Duration,
}

impl SubprocessConfig {
    /// Configuration for the bundled rust worker hosting a native node
    pub fn for_rust_worker(spec: &NodeManifest, ctx: &super::BuildContext) -> Result<Self> {
        let bin = resolve_worker_bin(ctx.worker_bin.as_ref()).ok_or_else(|| {
            Error::Config(format!(
                "node '{}': pipeline-worker binary not found (set {ENV_WORKER_BIN})",
                spec.id
            ))
        })?;
        Ok(Self {
            command: vec![bin.to_string_lossy().into_owned()],
            ipc: ctx.ipc.clone(),
            ready_timeout: Duration::from_secs(10),
            grace: Duration::from_secs(3),
        })
    }

    /// Configuration for a Python interpreter worker.
    ///
    /// `params.python_entry` is the command, either a string or an argv
    /// array; the interpreter is expected to attach to the rings named in
    /// its environment and speak the same frame protocol.
    pub fn for_python_worker(spec: &NodeManifest, ctx: &super::BuildContext) -> Result<Self> {
        let entry = spec.params.get("python_entry").ok_or_else(|| {
            Error::Config(format!(
                "python node '{}' requires param 'python_entry'",
                spec.id
            ))
        })?;
        let command = match entry {
            serde_json::Value::String(s) => {
                s.split_whitespace().map(str::to_string).collect::<Vec<_>>()
            }
            serde_json::Value::Array(parts) => parts
                .iter()
                .map(|p| {
                    p.as_str().map(str::to_string).ok_or_else(|| {
                        Error::Config(format!(
                            "python node '{}': python_entry must be strings",
                            spec.id
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => {
                return Err(Error::Config(format!(
                    "python node '{}': python_entry must be a string or array",
                    spec.id
                )))
            }
        };
        if command.is_empty() {
            return Err(Error::Config(format!(
                "python node '{}': python_entry is empty",
                spec.id
            )));
        }
        Ok(Self {
            command,
            ipc: ctx.ipc.clone(),
            // Interpreter + model load can be slow
            ready_timeout: Duration::from_secs(60),
            grace: Duration::from_secs(3),
        })
    }
}

fn resolve_worker_bin(override_path: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return Some(path.clone());
    }
    if let Ok(path) = std::env::var(ENV_WORKER_BIN) {
        return Some(PathBuf::from(path));
    }
    // Sibling of the current executable (cargo layout)
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let candidate = dir.join("pipeline-worker");
    if candidate.exists() {
        return Some(candidate);
    }
    // Tests run from target/debug/deps; the bin lives one level up
    let candidate = dir.parent()?.join("pipeline-worker");
    candidate.exists().then_some(candidate)
}

/// Host-side supervision of one worker: the event pump consuming the
/// worker's control ring and the liveness monitor watching its beats
pub(crate) struct WorkerSupervision {
    /// Set once the worker misses its heartbeat budget or exits
    pub unhealthy: Arc<AtomicBool>,
    /// Control messages the worker's node emitted, in arrival order
    pub control_events: mpsc::UnboundedReceiver<ControlMessage>,
    /// Pump + monitor handles (aborted on cleanup)
    pub tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Start supervising a worker channel.
///
/// The control-out ring has exactly one consumer: a blocking event pump
/// that counts heartbeats and forwards node-emitted control the moment it
/// is published (the ring's futex wake, not a poll tick, drives latency).
/// A separate monitor task flags the worker unhealthy after
/// [`MISSED_HEARTBEAT_LIMIT`] silent intervals or on process exit. The
/// pump exits when either side closes the channel.
pub(crate) fn supervise_worker(
    channel: Arc<HostIpcChannel>,
    node_id: String,
    child: Option<Arc<Mutex<Child>>>,
) -> WorkerSupervision {
    let unhealthy = Arc::new(AtomicBool::new(false));
    let beat_count = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let (control_tx, control_events) = mpsc::unbounded_channel();

    let pump = {
        let channel = Arc::clone(&channel);
        let beat_count = Arc::clone(&beat_count);
        let node_id = node_id.clone();
        tokio::task::spawn_blocking(move || loop {
            match channel.recv_event(Some(Instant::now() + HEARTBEAT_INTERVAL)) {
                Ok(Some(WorkerEvent::Ready | WorkerEvent::Heartbeat)) => {
                    beat_count.fetch_add(1, Ordering::Release);
                }
                Ok(Some(WorkerEvent::Control(msg))) => {
                    // Receiver gone means the executor is shutting down
                    if control_tx.send(msg).is_err() {
                        return;
                    }
                }
                // Channel closed from either side
                Ok(None) => return,
                Err(Error::Timeout(_)) => continue,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "event pump failed");
                    return;
                }
            }
        })
    };

    let monitor = {
        let unhealthy = Arc::clone(&unhealthy);
        tokio::spawn(async move {
            let mut last_count = 0u64;
            let mut silent_ticks = 0u32;
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let count = beat_count.load(Ordering::Acquire);
                if count != last_count {
                    last_count = count;
                    silent_ticks = 0;
                } else {
                    silent_ticks += 1;
                }

                if let Some(child) = &child {
                    let exited = child.lock().await.try_wait().ok().flatten();
                    if let Some(status) = exited {
                        if status.success() {
                            tracing::debug!(node_id = %node_id, "worker exited cleanly");
                        } else {
                            tracing::error!(node_id = %node_id, %status, "worker exited");
                        }
                        unhealthy.store(true, Ordering::Release);
                        return;
                    }
                }
                if silent_ticks >= MISSED_HEARTBEAT_LIMIT {
                    tracing::error!(
                        node_id = %node_id,
                        silent_ticks,
                        "worker missed heartbeats, marking unhealthy"
                    );
                    unhealthy.store(true, Ordering::Release);
                    return;
                }
            }
        })
    };

    WorkerSupervision {
        unhealthy,
        control_events,
        tasks: vec![pump, monitor],
    }
}

struct RunningWorker {
    channel: Arc<HostIpcChannel>,
    child: Arc<Mutex<Child>>,
    supervision_tasks: Vec<tokio::task::JoinHandle<()>>,
    unhealthy: Arc<AtomicBool>,
    /// Taken by `open_stream`; drained by `process_unary` otherwise
    emitted_control: Option<mpsc::UnboundedReceiver<ControlMessage>>,
}

/// Executor that runs its node in a worker process over shm rings
pub struct SubprocessExecutor {
    node_id: String,
    node_type: String,
    params: serde_json::Value,
    config: SubprocessConfig,
    worker: Option<RunningWorker>,
    stream_tasks: Vec<tokio::task::JoinHandle<()>>,
    session_deadline: Option<Instant>,
}

impl SubprocessExecutor {
    /// Create (nothing is spawned until `initialize`)
    pub fn new(spec: &NodeManifest, config: SubprocessConfig) -> Self {
        Self {
            node_id: spec.id.clone(),
            node_type: spec.node_type.clone(),
            params: spec.params.clone(),
            config,
            worker: None,
            stream_tasks: Vec::new(),
            session_deadline: None,
        }
    }

    fn worker(&self) -> Result<&RunningWorker> {
        self.worker.as_ref().ok_or_else(|| {
            Error::node_process(&self.node_id, "worker not initialized")
        })
    }

    /// PID of the running worker process, if any
    pub async fn worker_pid(&self) -> Option<u32> {
        match &self.worker {
            Some(worker) => worker.child.lock().await.id(),
            None => None,
        }
    }

    /// Drain control messages the worker's node has emitted.
    ///
    /// Empty once `open_stream` has taken the receiver; in stream mode
    /// the handle delivers worker control as `RuntimeData::Control`
    /// outputs instead.
    pub fn take_emitted_control(&mut self) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        if let Some(receiver) = self
            .worker
            .as_mut()
            .and_then(|w| w.emitted_control.as_mut())
        {
            while let Ok(msg) = receiver.try_recv() {
                out.push(msg);
            }
        }
        out
    }
}

#[async_trait]
impl NodeExecutor for SubprocessExecutor {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.session_deadline = ctx.deadline;

        let suffix = format!("{}-{}", &ctx.session_id, &self.node_id);
        let channel = Arc::new(
            HostIpcChannel::create(&suffix, &self.config.ipc).map_err(|e| Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: e.to_string(),
                retryable: false,
            })?,
        );

        let mut command = Command::new(&self.config.command[0]);
        command
            .args(&self.config.command[1..])
            .env(ENV_SHM_NAME, channel.shm_name())
            .env(ENV_NODE_TYPE, &self.node_type)
            .env(ENV_NODE_ID, &self.node_id)
            .env(ENV_NODE_PARAMS, self.params.to_string())
            .env(ENV_SESSION_ID, &ctx.session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| Error::NodeInit {
            node_id: self.node_id.clone(),
            cause: format!("failed to spawn worker '{}': {e}", self.config.command[0]),
            retryable: false,
        })?;
        tracing::info!(
            node_id = %self.node_id,
            pid = child.id(),
            command = %self.config.command.join(" "),
            "spawned worker process"
        );

        // READY handshake, bounded by the session budget
        let ready_deadline =
            Instant::now() + ctx.bound_timeout(self.config.ready_timeout);
        let handshake = {
            let channel = Arc::clone(&channel);
            tokio::task::spawn_blocking(move || channel.wait_ready(ready_deadline))
        };
        handshake
            .await
            .map_err(|e| Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: format!("handshake task failed: {e}"),
                retryable: false,
            })?
            .map_err(|e| Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: format!("worker did not become ready: {e}"),
                retryable: false,
            })?;

        let child = Arc::new(Mutex::new(child));
        let supervision = supervise_worker(
            Arc::clone(&channel),
            self.node_id.clone(),
            Some(Arc::clone(&child)),
        );

        self.worker = Some(RunningWorker {
            channel,
            child,
            supervision_tasks: supervision.tasks,
            unhealthy: supervision.unhealthy,
            emitted_control: Some(supervision.control_events),
        });
        Ok(())
    }

    async fn process_unary(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        let deadline = self.session_deadline;
        let worker = self.worker()?;
        let channel = Arc::clone(&worker.channel);
        let unhealthy = Arc::clone(&worker.unhealthy);

        if let RuntimeData::Control(msg) = input {
            let send_deadline = Some(Instant::now() + Duration::from_millis(100));
            channel.send_control(&msg, send_deadline)?;
            return Ok(Vec::new());
        }

        let node_id = self.node_id.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<Vec<RuntimeData>> {
            channel.send_data(&input, deadline)?;
            let mut outputs = Vec::new();
            loop {
                let step = Instant::now() + HEARTBEAT_INTERVAL;
                let step_deadline = deadline.map_or(step, |d| d.min(step));
                match channel.recv_frame(Some(step_deadline)) {
                    Ok(Some(DataFrame::Item(data))) => outputs.push(data),
                    Ok(Some(DataFrame::BatchEnd)) => return Ok(outputs),
                    Ok(None) => {
                        return Err(Error::NodeProcess {
                            node_id: node_id.clone(),
                            cause: "worker closed its output ring mid-request".into(),
                            retryable: false,
                        })
                    }
                    Err(Error::Timeout(_)) => {
                        // Pending frames win over the health flag; only an
                        // idle ring consults it
                        if unhealthy.load(Ordering::Acquire) {
                            return Err(Error::NodeProcess {
                                node_id: node_id.clone(),
                                cause: "worker process lost (missed heartbeats or exit)".into(),
                                retryable: false,
                            });
                        }
                        if let Some(d) = deadline {
                            if Instant::now() >= d {
                                return Err(Error::Timeout(format!(
                                    "node '{node_id}' exceeded session deadline"
                                )));
                            }
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        });

        let mut outputs = task
            .await
            .map_err(|e| Error::node_process(&self.node_id, format!("io task failed: {e}")))??;

        // Control the worker's node emitted rides the control ring; hand
        // it back as outputs so the caller routes it downstream
        outputs.extend(
            self.take_emitted_control()
                .into_iter()
                .map(RuntimeData::Control),
        );
        Ok(outputs)
    }

    async fn open_stream(&mut self, ctx: &SessionContext) -> Result<StreamHandle> {
        let control_events = self
            .worker
            .as_mut()
            .and_then(|w| w.emitted_control.take());
        let (handle, tasks) = {
            let worker = self.worker()?;
            spawn_ipc_stream(
                &self.node_id,
                Arc::clone(&worker.channel),
                Arc::clone(&worker.unhealthy),
                ctx.deadline,
                control_events,
            )
        };
        self.stream_tasks = tasks;
        Ok(handle)
    }

    async fn cleanup(&mut self) -> Result<()> {
        for task in self.stream_tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // Ask nicely first
        let _ = worker.channel.send_shutdown();
        worker.channel.close_input();

        let grace = self.config.grace;
        let mut child = worker.child.lock().await;

        let exited = tokio::time::timeout(grace, child.wait()).await;
        if exited.is_err() {
            // SIGTERM, then force-kill after another grace period
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::warn!(node_id = %self.node_id, "worker ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
        drop(child);

        // Closing the rings releases the blocking event pump; the monitor
        // is aborted directly
        worker.channel.close();
        for task in worker.supervision_tasks {
            task.abort();
            let _ = task.await;
        }
        // Dropping the channel unmaps and unlinks the segment
        Ok(())
    }
}

/// Spawn the pump tasks bridging a [`StreamHandle`] to an shm channel.
///
/// Shared by the subprocess and container executors (their ring protocol
/// is identical). Inbound and outbound directions run as independent
/// tasks, so a node deep in output backpressure can still accept a
/// control frame and the host keeps draining outputs while an input push
/// is blocked on a full ring. Worker-emitted control (drained off the
/// control ring by the supervision pump) surfaces through the handle as
/// `RuntimeData::Control` outputs.
pub(crate) fn spawn_ipc_stream(
    node_id: &str,
    channel: Arc<HostIpcChannel>,
    unhealthy: Arc<AtomicBool>,
    deadline: Option<Instant>,
    control_events: Option<mpsc::UnboundedReceiver<ControlMessage>>,
) -> (StreamHandle, Vec<tokio::task::JoinHandle<()>>) {
    let (handle, backend) = StreamHandle::channel(4);
    let StreamBackend {
        mut data_rx,
        mut control_rx,
        out_tx,
    } = backend;

    let mut tasks = Vec::new();
    if let Some(mut events) = control_events {
        let out_tx = out_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = events.recv().await {
                if out_tx.send(Ok(RuntimeData::Control(msg))).await.is_err() {
                    return;
                }
            }
        }));
    }

    let pump_in = {
        let channel = Arc::clone(&channel);
        let out_tx = out_tx.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    Some(msg) = control_rx.recv() => {
                        // Control ring: immune to data backpressure
                        let channel = Arc::clone(&channel);
                        let send_deadline = Some(Instant::now() + Duration::from_millis(100));
                        let result = tokio::task::spawn_blocking(move || {
                            channel.send_control(&msg, send_deadline)
                        })
                        .await;
                        if let Ok(Err(e)) = result {
                            tracing::warn!(node_id = %node_id, error = %e, "control send failed");
                        }
                    }

                    item = data_rx.recv() => match item {
                        Some(data) => {
                            let channel = Arc::clone(&channel);
                            let result = tokio::task::spawn_blocking(move || {
                                channel.send_data(&data, deadline)
                            })
                            .await;
                            match result {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    let _ = out_tx.send(Err(e)).await;
                                    return;
                                }
                                Err(e) => {
                                    let _ = out_tx
                                        .send(Err(Error::Ipc(format!("io task failed: {e}"))))
                                        .await;
                                    return;
                                }
                            }
                        }
                        None => {
                            channel.close_input();
                            return;
                        }
                    },
                }
            }
        })
    };

    let pump_out = {
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            loop {
                let channel = Arc::clone(&channel);
                let step = Instant::now() + HEARTBEAT_INTERVAL;
                let step_deadline = deadline.map_or(step, |d| d.min(step));
                let result =
                    tokio::task::spawn_blocking(move || channel.recv_data(Some(step_deadline)))
                        .await;
                match result {
                    Ok(Ok(Some(item))) => {
                        if out_tx.send(Ok(item)).await.is_err() {
                            return;
                        }
                    }
                    // Worker closed its output ring: clean end of stream.
                    // Checked before the health flag so a worker that
                    // finishes and exits is not misreported as lost.
                    Ok(Ok(None)) => return,
                    Ok(Err(Error::Timeout(_))) => {
                        if unhealthy.load(Ordering::Acquire) {
                            let _ = out_tx
                                .send(Err(Error::NodeProcess {
                                    node_id: node_id.clone(),
                                    cause: "worker process lost (missed heartbeats or exit)"
                                        .into(),
                                    retryable: false,
                                }))
                                .await;
                            return;
                        }
                        if let Some(d) = deadline {
                            if Instant::now() >= d {
                                let _ = out_tx
                                    .send(Err(Error::Timeout(format!(
                                        "node '{node_id}' exceeded session deadline"
                                    ))))
                                    .await;
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        let _ = out_tx.send(Err(e)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = out_tx
                            .send(Err(Error::Ipc(format!("io task failed: {e}"))))
                            .await;
                        return;
                    }
                }
            }
        })
    };

    tasks.push(pump_in);
    tasks.push(pump_out);
    (handle, tasks)
}
