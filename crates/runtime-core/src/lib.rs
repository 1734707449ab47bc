//! mediagraph runtime core - transport-agnostic pipeline execution engine
//!
//! This crate is the heart of the mediagraph runtime: it parses declarative
//! pipeline manifests, builds and validates the processing DAG, executes
//! nodes behind four interchangeable backends (native, subprocess over
//! shared-memory rings, container, remote), and streams typed media
//! buffers between them with bounded buffering, backpressure, and an
//! out-of-band control plane.
//!
//! # Architecture
//!
//! ```text
//! Transport → PipelineRunner → node tasks ⇄ executors (native/subprocess/docker/remote)
//!                  │                │
//!                  │                └── bounded edges (per-edge FIFO, backpressure)
//!                  └── control plane (cancel / batch hint / deadline, overtakes data)
//! ```
//!
//! Transports (gRPC, WebRTC, FFI, …) are separate crates implementing
//! [`transport::PipelineTransport`]; the core has zero dependencies on any
//! of them.
//!
//! # Example
//!
//! ```no_run
//! use mediagraph_runtime_core::runner::PipelineRunner;
//! use mediagraph_runtime_core::transport::TransportData;
//! use mediagraph_runtime_core::data::RuntimeData;
//! use std::sync::Arc;
//!
//! # async fn run() -> mediagraph_runtime_core::Result<()> {
//! let manifest = Arc::new(mediagraph_runtime_core::manifest::parse(r#"{
//!     "version": "v1",
//!     "nodes": [ { "id": "echo", "node_type": "Echo" } ]
//! }"#)?);
//!
//! let runner = PipelineRunner::new();
//! let output = runner
//!     .execute_unary(manifest, TransportData::new(RuntimeData::text("hello", "t")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod data;
pub mod executor;
pub mod graph;
pub mod ingestion;
pub mod ipc;
pub mod manifest;
pub mod metrics;
pub mod nodes;
pub mod retry;
pub mod runner;
pub mod transport;

mod error;
pub use error::{Error, Result};

// Convenience re-exports for the common entry points
pub use graph::PipelineGraph;
pub use manifest::Manifest;
pub use runner::{PipelineRunner, RunnerConfig, SessionConfig};
pub use transport::{PipelineTransport, StreamSession, TransportData};

/// Initialize logging for binaries embedding the runtime.
///
/// Respects `RUST_LOG`; library users typically install their own
/// subscriber instead.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;
    tracing::info!("mediagraph runtime core initialized");
    Ok(())
}
