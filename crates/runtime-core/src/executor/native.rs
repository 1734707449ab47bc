//! In-process executor
//!
//! Adapts a [`PipelineNode`] to the [`NodeExecutor`] contract with direct
//! function dispatch; no serialization anywhere on this path. Streaming
//! runs the node inside its own task driven from a [`StreamBackend`];
//! control messages arrive on their own channel and are polled before
//! data so they overtake queued inputs.

use crate::data::RuntimeData;
use crate::nodes::{NodeExecutor, PipelineNode, SessionContext, StreamBackend, StreamHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Executor for native (in-process) nodes
pub struct NativeExecutor {
    node_id: String,
    node: Arc<Mutex<Box<dyn PipelineNode>>>,
    stream_task: Option<tokio::task::JoinHandle<()>>,
}

impl NativeExecutor {
    /// Wrap a node instance
    pub fn new(node_id: &str, node: Box<dyn PipelineNode>) -> Self {
        Self {
            node_id: node_id.to_string(),
            node: Arc::new(Mutex::new(node)),
            stream_task: None,
        }
    }
}

async fn drive_node(
    node: Arc<Mutex<Box<dyn PipelineNode>>>,
    node_id: String,
    mut backend: StreamBackend,
) {
    loop {
        tokio::select! {
            biased;

            Some(msg) = backend.control_rx.recv() => {
                let mut node = node.lock().await;
                if let Err(e) = node.on_control(&msg).await {
                    tracing::warn!(node_id = %node_id, error = %e, "control handler failed");
                }
            }

            item = backend.data_rx.recv() => match item {
                Some(data) => {
                    let result = {
                        let mut node = node.lock().await;
                        node.process(data).await
                    };
                    match result {
                        Ok(outputs) => {
                            for output in outputs {
                                if backend.out_tx.send(Ok(output)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let err = Error::NodeProcess {
                                node_id: node_id.clone(),
                                cause: e.to_string(),
                                retryable: e.is_retryable(),
                            };
                            let _ = backend.out_tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
                None => {
                    // Input closed: emit the buffered tail and end
                    let result = {
                        let mut node = node.lock().await;
                        node.flush().await
                    };
                    match result {
                        Ok(outputs) => {
                            for output in outputs {
                                if backend.out_tx.send(Ok(output)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = backend
                                .out_tx
                                .send(Err(Error::node_process(&node_id, e)))
                                .await;
                        }
                    }
                    return;
                }
            },
        }
    }
}

#[async_trait]
impl NodeExecutor for NativeExecutor {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        let mut node = self.node.lock().await;
        node.initialize(ctx).await.map_err(|e| Error::NodeInit {
            node_id: self.node_id.clone(),
            cause: e.to_string(),
            retryable: e.is_retryable(),
        })
    }

    async fn process_unary(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        let mut node = self.node.lock().await;
        if let RuntimeData::Control(msg) = &input {
            node.on_control(msg).await?;
            return Ok(Vec::new());
        }
        // Unary drives the node to completion: process, then drain any
        // buffered tail
        let mut outputs = node.process(input).await?;
        outputs.extend(node.flush().await?);
        Ok(outputs)
    }

    async fn open_stream(&mut self, _ctx: &SessionContext) -> Result<StreamHandle> {
        if self.stream_task.is_some() {
            return Err(Error::node_process(&self.node_id, "stream already open"));
        }

        // Capacity 1: backpressure reaches the caller as soon as the node
        // falls behind
        let (handle, backend) = StreamHandle::channel(1);
        let task = tokio::spawn(drive_node(
            Arc::clone(&self.node),
            self.node_id.clone(),
            backend,
        ));
        self.stream_task = Some(task);
        Ok(handle)
    }

    async fn cleanup(&mut self) -> Result<()> {
        if let Some(task) = self.stream_task.take() {
            // The task ends when the handle closes; abort covers callers
            // that dropped the handle mid-stream.
            task.abort();
            let _ = task.await;
        }
        let mut node = self.node.lock().await;
        node.cleanup().await.map_err(|e| Error::NodeCleanup {
            node_id: self.node_id.clone(),
            cause: e.to_string(),
        })
    }
}
