//! Container executor
//!
//! The subprocess path with environment isolation: the worker runs inside
//! a Docker container that shares the host IPC namespace, so the
//! shared-memory rings work unchanged. Containers are reference-counted
//! per image: nodes declaring the same image share one container and
//! workers are exec'd into it; the container stops when the last node
//! releases it.

use crate::data::RuntimeData;
use crate::ipc::channel::ENV_SHM_NAME;
use crate::ipc::{HostIpcChannel, IpcConfig};
use crate::manifest::{DockerNodeConfig, NodeManifest, ResourceLimits};
use crate::nodes::{NodeExecutor, SessionContext, StreamHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::subprocess::{
    ENV_NODE_ID, ENV_NODE_PARAMS, ENV_NODE_TYPE, ENV_SESSION_ID, HEARTBEAT_INTERVAL,
};

/// Default worker entrypoint inside the container
const DEFAULT_CONTAINER_ENTRY: &str = "python3 -m mediagraph_worker";

struct SharedContainer {
    container_id: String,
    ref_count: u32,
}

/// Reference-counted containers keyed by image.
///
/// Lifecycle is idempotent: acquiring an image that is already running
/// bumps the count; releasing to zero stops and removes the container.
pub struct ContainerRegistry {
    containers: Mutex<HashMap<String, SharedContainer>>,
}

impl ContainerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a running container for `image`, pulling the image if absent
    pub async fn acquire(
        &self,
        docker: &Docker,
        image: &str,
        limits: Option<&ResourceLimits>,
    ) -> Result<String> {
        // Fast path: already running
        {
            let mut containers = self.containers.lock();
            if let Some(shared) = containers.get_mut(image) {
                shared.ref_count += 1;
                return Ok(shared.container_id.clone());
            }
        }

        ensure_image(docker, image).await?;

        let host_config = HostConfig {
            // Host IPC namespace: the shm rings are visible inside
            ipc_mode: Some("host".to_string()),
            memory: limits
                .and_then(|l| l.memory_mb)
                .map(|mb| (mb * 1024 * 1024) as i64),
            nano_cpus: limits
                .and_then(|l| l.cpu_cores)
                .map(|cores| (cores * 1e9) as i64),
            device_requests: limits.and_then(|l| l.gpus).map(|count| {
                vec![DeviceRequest {
                    driver: Some("nvidia".to_string()),
                    count: Some(count as i64),
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };

        let name = format!(
            "mediagraph-{}-{}",
            std::process::id(),
            image.replace(['/', ':', '.'], "-")
        );
        let config = Config {
            image: Some(image.to_string()),
            // Keep the container alive; workers are exec'd into it
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::Execution(format!("failed to create container: {e}")))?;

        docker
            .start_container(&created.id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| Error::Execution(format!("failed to start container: {e}")))?;

        tracing::info!(image, container_id = %created.id, "started shared container");

        let mut containers = self.containers.lock();
        containers.insert(
            image.to_string(),
            SharedContainer {
                container_id: created.id.clone(),
                ref_count: 1,
            },
        );
        Ok(created.id)
    }

    /// Drop one reference; stops and removes the container at zero
    pub async fn release(&self, docker: &Docker, image: &str) {
        let to_stop = {
            let mut containers = self.containers.lock();
            match containers.get_mut(image) {
                Some(shared) => {
                    shared.ref_count -= 1;
                    if shared.ref_count == 0 {
                        containers.remove(image).map(|s| s.container_id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(container_id) = to_stop {
            let _ = docker
                .stop_container(&container_id, Some(StopContainerOptions { t: 3 }))
                .await;
            let _ = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            tracing::info!(image, container_id = %container_id, "removed shared container");
        }
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    tracing::info!(image, "pulling container image");
    let mut pull = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(progress) = pull.next().await {
        progress.map_err(|e| Error::Execution(format!("image pull failed: {e}")))?;
    }
    Ok(())
}

struct RunningContainerWorker {
    channel: Arc<HostIpcChannel>,
    docker: Docker,
    image: String,
    supervision_tasks: Vec<tokio::task::JoinHandle<()>>,
    unhealthy: Arc<AtomicBool>,
    /// Taken by `open_stream`; drained by `process_unary` otherwise
    emitted_control: Option<mpsc::UnboundedReceiver<crate::data::ControlMessage>>,
    stream_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Executor running its worker inside a shared container
pub struct ContainerExecutor {
    node_id: String,
    node_type: String,
    params: serde_json::Value,
    docker_config: DockerNodeConfig,
    ipc: IpcConfig,
    registry: Arc<ContainerRegistry>,
    worker: Option<RunningContainerWorker>,
    session_deadline: Option<Instant>,
}

impl ContainerExecutor {
    /// Create from a manifest node carrying a `docker` block
    pub fn new(
        spec: &NodeManifest,
        ipc: IpcConfig,
        registry: Arc<ContainerRegistry>,
    ) -> Result<Self> {
        let docker_config = spec.docker.clone().ok_or_else(|| {
            Error::Config(format!(
                "container node '{}' requires a docker configuration block",
                spec.id
            ))
        })?;
        Ok(Self {
            node_id: spec.id.clone(),
            node_type: spec.node_type.clone(),
            params: spec.params.clone(),
            docker_config,
            ipc,
            registry,
            worker: None,
            session_deadline: None,
        })
    }

    fn worker(&self) -> Result<&RunningContainerWorker> {
        self.worker
            .as_ref()
            .ok_or_else(|| Error::node_process(&self.node_id, "container worker not initialized"))
    }

    /// Drain control messages the container worker's node has emitted.
    ///
    /// Empty once `open_stream` has taken the receiver.
    pub fn take_emitted_control(&mut self) -> Vec<crate::data::ControlMessage> {
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
impl NodeExecutor for ContainerExecutor {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.session_deadline = ctx.deadline;

        let docker = Docker::connect_with_local_defaults().map_err(|e| Error::NodeInit {
            node_id: self.node_id.clone(),
            cause: format!("cannot reach docker daemon: {e}"),
            retryable: false,
        })?;

        let image = self.docker_config.image.clone();
        let container_id = self
            .registry
            .acquire(&docker, &image, self.docker_config.resource_limits.as_ref())
            .await
            .map_err(|e| Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: e.to_string(),
                retryable: false,
            })?;

        let suffix = format!("{}-{}", &ctx.session_id, &self.node_id);
        let channel = Arc::new(HostIpcChannel::create(&suffix, &self.ipc).map_err(|e| {
            Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: e.to_string(),
                retryable: false,
            }
        })?);

        let entry = self
            .params
            .get("python_entry")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_CONTAINER_ENTRY);
        let cmd: Vec<String> = entry.split_whitespace().map(str::to_string).collect();
        let env = vec![
            format!("{ENV_SHM_NAME}={}", channel.shm_name()),
            format!("{ENV_NODE_TYPE}={}", self.node_type),
            format!("{ENV_NODE_ID}={}", self.node_id),
            format!("{ENV_NODE_PARAMS}={}", self.params),
            format!("{ENV_SESSION_ID}={}", ctx.session_id),
        ];

        let exec = docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: format!("failed to create exec: {e}"),
                retryable: false,
            })?;
        docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::NodeInit {
                node_id: self.node_id.clone(),
                cause: format!("failed to start exec: {e}"),
                retryable: false,
            })?;

        // READY handshake
        let ready_deadline = Instant::now() + ctx.bound_timeout(Duration::from_secs(60));
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
                cause: format!("container worker did not become ready: {e}"),
                retryable: false,
            })?;

        // No Child handle here; liveness rides on heartbeats alone
        let supervision =
            super::subprocess::supervise_worker(Arc::clone(&channel), self.node_id.clone(), None);

        self.worker = Some(RunningContainerWorker {
            channel,
            docker,
            image,
            supervision_tasks: supervision.tasks,
            unhealthy: supervision.unhealthy,
            emitted_control: Some(supervision.control_events),
            stream_tasks: Vec::new(),
        });
        Ok(())
    }

    async fn process_unary(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        use crate::ipc::channel::DataFrame;
        let deadline = self.session_deadline;
        let worker = self.worker()?;
        let channel = Arc::clone(&worker.channel);
        let unhealthy = Arc::clone(&worker.unhealthy);
        let node_id = self.node_id.clone();

        if let RuntimeData::Control(msg) = input {
            channel.send_control(&msg, Some(Instant::now() + Duration::from_millis(100)))?;
            return Ok(Vec::new());
        }

        let task = tokio::task::spawn_blocking(move || -> Result<Vec<RuntimeData>> {
            channel.send_data(&input, deadline)?;
            let mut outputs = Vec::new();
            loop {
                let step_deadline = Instant::now() + HEARTBEAT_INTERVAL;
                let step_deadline = deadline.map_or(step_deadline, |d| d.min(step_deadline));
                match channel.recv_frame(Some(step_deadline)) {
                    Ok(Some(DataFrame::Item(data))) => outputs.push(data),
                    Ok(Some(DataFrame::BatchEnd)) => return Ok(outputs),
                    Ok(None) => {
                        return Err(Error::node_process(
                            &node_id,
                            "container worker closed its output ring",
                        ))
                    }
                    Err(Error::Timeout(_)) => {
                        if unhealthy.load(Ordering::Acquire) {
                            // Container OOM kills land here as lost workers
                            return Err(Error::ResourceExhausted(format!(
                                "container worker for node '{node_id}' stopped responding"
                            )));
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
        // The shm channel protocol is identical to the subprocess one
        let control_events = self
            .worker
            .as_mut()
            .and_then(|w| w.emitted_control.take());
        let (handle, tasks) = {
            let worker = self.worker()?;
            super::subprocess::spawn_ipc_stream(
                &self.node_id,
                Arc::clone(&worker.channel),
                Arc::clone(&worker.unhealthy),
                ctx.deadline,
                control_events,
            )
        };
        if let Some(worker) = self.worker.as_mut() {
            worker.stream_tasks = tasks;
        }
        Ok(handle)
    }

    async fn cleanup(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        for task in worker.stream_tasks {
            task.abort();
        }
        let _ = worker.channel.send_shutdown();
        worker.channel.close_input();
        // Closing the rings releases the blocking event pump
        worker.channel.close();
        for task in worker.supervision_tasks {
            task.abort();
            let _ = task.await;
        }
        self.registry.release(&worker.docker, &worker.image).await;
        Ok(())
    }
}
