//! Session router
//!
//! Tracks live streaming sessions and routes inbound packets to them so a
//! transport can multiplex many sessions over one connection. Pipelines
//! whose manifests place every node remotely are dispatched through a
//! registered transport client instead of being run locally.

use crate::manifest::{ExecutionHint, Manifest};
use crate::runner::{PipelineRunner, SessionConfig};
use crate::transport::{PipelineTransport, StreamSession, TransportData};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Routes packets to live sessions and dispatches remote pipelines
pub struct SessionRouter {
    runner: PipelineRunner,
    sessions: DashMap<String, Arc<dyn StreamSession>>,
    remotes: DashMap<String, Arc<dyn PipelineTransport>>,
}

impl SessionRouter {
    /// Router over a runner
    pub fn new(runner: PipelineRunner) -> Self {
        Self {
            runner,
            sessions: DashMap::new(),
            remotes: DashMap::new(),
        }
    }

    /// Register a transport client for fully-remote manifests
    pub fn register_remote(&self, name: &str, transport: Arc<dyn PipelineTransport>) {
        self.remotes.insert(name.to_string(), transport);
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session id is live
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Where a manifest should run: locally, or through the named remote
    /// transport when every node carries `execution_hint: remote` and a
    /// common `transport` param.
    fn remote_target(manifest: &Manifest) -> Option<String> {
        let mut target: Option<String> = None;
        for node in &manifest.nodes {
            if node.execution_hint != ExecutionHint::Remote {
                return None;
            }
            let name = node.params.get("transport").and_then(|v| v.as_str())?;
            match &target {
                Some(existing) if existing != name => return None,
                _ => target = Some(name.to_string()),
            }
        }
        target
    }

    /// Execute a unary pipeline, locally or via a remote transport
    pub async fn execute(
        &self,
        manifest: Arc<Manifest>,
        input: TransportData,
    ) -> Result<TransportData> {
        if let Some(remote) = Self::remote_target(&manifest) {
            let transport = self.remotes.get(&remote).map(|t| Arc::clone(t.value())).ok_or_else(|| {
                Error::Config(format!("no remote transport '{remote}' registered"))
            })?;
            return transport.execute(manifest, input).await;
        }
        self.runner.execute_unary(manifest, input).await
    }

    /// Open a streaming session and register it for packet routing
    pub async fn open_session(
        &self,
        manifest: Arc<Manifest>,
        config: SessionConfig,
    ) -> Result<Arc<dyn StreamSession>> {
        let session: Arc<dyn StreamSession> = if let Some(remote) = Self::remote_target(&manifest)
        {
            let transport = self.remotes.get(&remote).map(|t| Arc::clone(t.value())).ok_or_else(|| {
                Error::Config(format!("no remote transport '{remote}' registered"))
            })?;
            Arc::from(transport.stream(manifest).await?)
        } else {
            Arc::new(
                self.runner
                    .create_stream_session_with(manifest, config)
                    .await?,
            )
        };

        self.sessions
            .insert(session.session_id().to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Route one inbound packet to its session by `session_id`
    pub async fn route_input(&self, packet: TransportData) -> Result<()> {
        if packet.session_id.is_empty() {
            return Err(Error::SessionNotFound(
                "packet carries no session id".into(),
            ));
        }
        let session = self
            .sessions
            .get(&packet.session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::SessionNotFound(packet.session_id.clone()))?;
        session.send_input(packet).await
    }

    /// Receive the next output of a session
    pub async fn recv_output(&self, session_id: &str) -> Result<Option<TransportData>> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let output = session.recv_output().await;
        if matches!(output, Ok(None) | Err(_)) && !session.is_active() {
            // Ended: stop routing to it
            self.sessions.remove(session_id);
        }
        output
    }

    /// Close and deregister one session
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Err(Error::SessionNotFound(session_id.to_string()));
        };
        session.close().await
    }

    /// Close every live session (process shutdown path)
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                if let Err(e) = session.close().await {
                    tracing::warn!(session_id = %id, error = %e, "failed to close session");
                }
            }
        }
    }
}
