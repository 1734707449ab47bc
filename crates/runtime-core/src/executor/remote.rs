//! Remote executor
//!
//! Routes a node's work to a remote endpoint through a registered
//! [`PipelineTransport`] client, carrying a single-node sub-manifest. The
//! remote side instantiates the corresponding executor tree; from the
//! pipeline's perspective the node is indistinguishable from a local one.

use crate::data::RuntimeData;
use crate::manifest::{Connection, Manifest, ManifestMetadata, NodeManifest};
use crate::nodes::{NodeExecutor, SessionContext, StreamBackend, StreamHandle};
use crate::transport::{PipelineTransport, StreamSession, TransportData, TransportMap};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Executor that forwards work to a remote endpoint
pub struct RemoteExecutor {
    node_id: String,
    transport: Arc<dyn PipelineTransport>,
    sub_manifest: Arc<Manifest>,
    session_id: String,
    stream: Option<Arc<dyn StreamSession>>,
    stream_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RemoteExecutor {
    /// Build from a manifest node.
    ///
    /// `params.transport` names the client in the runner's transport map;
    /// the sub-manifest sent to the remote is the node itself with its
    /// remote placement stripped (the remote runs it with its own hints).
    pub fn from_spec(spec: &NodeManifest, transports: &TransportMap) -> Result<Self> {
        let transport_name = spec
            .params
            .get("transport")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Config(format!(
                    "remote node '{}' requires param 'transport'",
                    spec.id
                ))
            })?;
        let transport = transports.get(transport_name).cloned().ok_or_else(|| {
            Error::Config(format!(
                "remote node '{}': no transport named '{transport_name}' is registered",
                spec.id
            ))
        })?;

        let mut remote_spec = spec.clone();
        remote_spec.execution_hint = Default::default();
        if let Some(obj) = remote_spec.params.as_object_mut() {
            obj.remove("transport");
        }

        let sub_manifest = Arc::new(Manifest {
            version: "v1".to_string(),
            metadata: ManifestMetadata {
                name: format!("remote-{}", spec.id),
                ..Default::default()
            },
            nodes: vec![remote_spec],
            connections: Vec::<Connection>::new(),
        });

        Ok(Self {
            node_id: spec.id.clone(),
            transport,
            sub_manifest,
            session_id: String::new(),
            stream: None,
            stream_tasks: Vec::new(),
        })
    }

    fn remote_err(&self, e: Error) -> Error {
        match e {
            // Transport-level trouble is worth a retry; remote node errors
            // surface as-is
            Error::Transport(msg) => Error::NodeProcess {
                node_id: self.node_id.clone(),
                cause: msg,
                retryable: true,
            },
            other => other,
        }
    }
}

#[async_trait]
impl NodeExecutor for RemoteExecutor {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        self.session_id = ctx.session_id.clone();
        Ok(())
    }

    async fn process_unary(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        let packet = TransportData::new(input).with_session(self.session_id.clone());
        let output = self
            .transport
            .execute(Arc::clone(&self.sub_manifest), packet)
            .await
            .map_err(|e| self.remote_err(e))?;
        Ok(vec![output.data])
    }

    async fn open_stream(&mut self, _ctx: &SessionContext) -> Result<StreamHandle> {
        let session: Arc<dyn StreamSession> = Arc::from(
            self.transport
                .stream(Arc::clone(&self.sub_manifest))
                .await
                .map_err(|e| self.remote_err(e))?,
        );
        self.stream = Some(Arc::clone(&session));

        let (handle, backend) = StreamHandle::channel(4);
        let StreamBackend {
            mut data_rx,
            mut control_rx,
            out_tx,
        } = backend;

        // Inbound pump: inputs and control toward the remote. The remote
        // side fans control out on its own side channel.
        let pump_in = {
            let session = Arc::clone(&session);
            let node_id = self.node_id.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let remote_id = session.session_id().to_string();
                loop {
                    let item = tokio::select! {
                        biased;
                        Some(msg) = control_rx.recv() => RuntimeData::Control(msg),
                        item = data_rx.recv() => match item {
                            Some(item) => item,
                            None => {
                                let _ = session.close().await;
                                return;
                            }
                        },
                    };
                    let packet = TransportData::new(item).with_session(remote_id.clone());
                    if let Err(e) = session.send_input(packet).await {
                        let _ = out_tx
                            .send(Err(Error::NodeProcess {
                                node_id: node_id.clone(),
                                cause: e.to_string(),
                                retryable: e.is_retryable(),
                            }))
                            .await;
                        return;
                    }
                }
            })
        };

        // Outbound pump: remote outputs back into the handle
        let pump_out = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                loop {
                    match session.recv_output().await {
                        Ok(Some(packet)) => {
                            if out_tx.send(Ok(packet.data)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            let _ = out_tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            })
        };

        self.stream_tasks = vec![pump_in, pump_out];
        Ok(handle)
    }

    async fn cleanup(&mut self) -> Result<()> {
        for task in self.stream_tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.close().await;
        }
        Ok(())
    }
}
