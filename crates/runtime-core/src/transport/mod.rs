//! Transport abstraction layer
//!
//! The core knows nothing about concrete transports. Implementations
//! (gRPC, WebRTC, FFI, in-process test doubles) depend on this crate and
//! implement [`PipelineTransport`]; the remote executor and the session
//! router call through the same trait, so a remote node is
//! indistinguishable from a local one to the rest of the pipeline.

use crate::manifest::Manifest;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub mod data;
pub mod session;
pub mod session_router;

pub use data::TransportData;
pub use session::{StreamSession, StreamSessionHandle};
pub use session_router::SessionRouter;

/// Named transport clients available for remote dispatch
pub type TransportMap = HashMap<String, Arc<dyn PipelineTransport>>;

/// Transport-agnostic pipeline execution interface.
///
/// Implementations must be `Send + Sync`; methods must respect
/// cancellation and clean up their resources when dropped mid-call.
#[async_trait]
pub trait PipelineTransport: Send + Sync {
    /// Execute a pipeline with unary semantics: one input, one output.
    async fn execute(&self, manifest: Arc<Manifest>, input: TransportData)
        -> Result<TransportData>;

    /// Open a long-lived streaming session for the pipeline.
    async fn stream(&self, manifest: Arc<Manifest>) -> Result<Box<dyn StreamSession>>;
}
