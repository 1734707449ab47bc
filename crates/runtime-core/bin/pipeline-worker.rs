//! Subprocess worker
//!
//! Hosts one native node behind the shared-memory ring channel. The
//! subprocess executor spawns this binary with the segment name and node
//! description in the environment; the loop is: attach → instantiate →
//! READY → (recv → process → send outputs → batch-end)* → flush on input
//! close. Heartbeats go out every 250 ms from a side task; a SHUTDOWN
//! frame or closed input ring ends the worker.

use anyhow::{Context, Result};
use mediagraph_runtime_core::data::RuntimeData;
use mediagraph_runtime_core::executor::subprocess::{
    ENV_NODE_ID, ENV_NODE_PARAMS, ENV_NODE_TYPE, ENV_SESSION_ID, HEARTBEAT_INTERVAL,
};
use mediagraph_runtime_core::ipc::channel::HostDirective;
use mediagraph_runtime_core::ipc::WorkerIpcChannel;
use mediagraph_runtime_core::nodes::registry::global_registry;
use mediagraph_runtime_core::nodes::{PipelineNode, SessionContext};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;
    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let node_type = std::env::var(ENV_NODE_TYPE).context("MEDIAGRAPH_NODE_TYPE not set")?;
    let node_id = std::env::var(ENV_NODE_ID).unwrap_or_else(|_| node_type.clone());
    let session_id = std::env::var(ENV_SESSION_ID).unwrap_or_default();
    let params: serde_json::Value = std::env::var(ENV_NODE_PARAMS)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(serde_json::Value::Null);

    let channel = Arc::new(WorkerIpcChannel::from_env().context("failed to attach shm channel")?);
    let mut node = global_registry()
        .create_native(&node_type, &node_id, &params)
        .with_context(|| format!("cannot instantiate node type '{node_type}'"))?;

    let ctx = SessionContext::new(&session_id);
    node.initialize(&ctx)
        .await
        .with_context(|| format!("node '{node_id}' failed to initialize"))?;

    channel.send_ready().context("READY handshake failed")?;
    tracing::info!(node_id = %node_id, node_type = %node_type, "worker ready");

    // Heartbeat beacon
    let beat_channel = Arc::clone(&channel);
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            if beat_channel.send_heartbeat().is_err() {
                return;
            }
        }
    });

    let result = worker_loop(&channel, node.as_mut(), &node_id).await;

    heartbeat.abort();
    if let Err(e) = node.cleanup().await {
        tracing::warn!(node_id = %node_id, error = %e, "node cleanup failed");
    }
    channel.close();
    result
}

async fn worker_loop(
    channel: &Arc<WorkerIpcChannel>,
    node: &mut dyn PipelineNode,
    node_id: &str,
) -> Result<()> {
    loop {
        // Control first: cancels must not wait behind a long recv
        for directive in channel.poll_directives().unwrap_or_default() {
            match directive {
                HostDirective::Shutdown => {
                    tracing::info!(node_id = %node_id, "shutdown requested");
                    return Ok(());
                }
                HostDirective::Control(msg) => {
                    if let Err(e) = node.on_control(&msg).await {
                        tracing::warn!(node_id = %node_id, error = %e, "control handler failed");
                    }
                }
            }
        }

        // Short recv window keeps the directive poll responsive
        let deadline = Instant::now() + Duration::from_millis(50);
        let item = {
            let channel = Arc::clone(channel);
            tokio::task::spawn_blocking(move || channel.recv_data(Some(deadline)))
                .await
                .context("recv task failed")?
        };

        match item {
            Ok(Some(input)) => {
                match node.process(input).await {
                    Ok(outputs) => {
                        publish_outputs(channel, outputs)
                            .context("failed to publish outputs")?;
                        channel
                            .send_batch_end(None)
                            .context("failed to publish batch end")?;
                    }
                    Err(e) => {
                        // A failed item is fatal for the worker; the host
                        // surfaces it as a node error
                        tracing::error!(node_id = %node_id, error = %e, "process failed");
                        return Err(anyhow::anyhow!(e));
                    }
                }
            }
            Ok(None) => {
                // Input closed: flush the tail and end the stream
                match node.flush().await {
                    Ok(outputs) => {
                        let _ = publish_outputs(channel, outputs);
                        let _ = channel.send_batch_end(None);
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "flush failed");
                    }
                }
                tracing::info!(node_id = %node_id, "input closed, worker exiting");
                return Ok(());
            }
            Err(mediagraph_runtime_core::Error::Timeout(_)) => continue,
            Err(e) => {
                tracing::error!(node_id = %node_id, error = %e, "recv failed");
                return Err(anyhow::anyhow!(e));
            }
        }
    }
}

/// Publish node outputs: data on the data ring, control on the control
/// ring so a cancel is never queued behind a large media payload.
fn publish_outputs(
    channel: &WorkerIpcChannel,
    outputs: Vec<RuntimeData>,
) -> mediagraph_runtime_core::Result<()> {
    for output in outputs {
        match output {
            RuntimeData::Control(msg) => channel.send_control(&msg)?,
            other => channel.send_data(&other, None)?,
        }
    }
    Ok(())
}
