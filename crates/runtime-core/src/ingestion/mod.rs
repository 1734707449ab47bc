//! Pluggable media ingestion
//!
//! An [`IngestPlugin`] is a factory matched by URI scheme; it creates
//! [`IngestSource`]s whose [`IngestStream`]s feed `RuntimeData` into a
//! pipeline's source nodes. File and stdin sources are built in; live
//! protocol sources (RTMP/RTSP/UDP/SRT) register the same trait at
//! startup. Backpressure propagates through the stream's bounded channel.
//!
//! Multi-track sources tag their chunks with `stream_id`s of the form
//! `audio:N`, `video:N`, `subtitle:N`; [`TrackSelection`] controls which
//! tracks are produced.

use crate::Error;
use async_trait::async_trait;

pub mod config;
pub mod file;
pub mod registry;
pub mod stream;

pub use config::{IngestConfig, TrackSelection};
pub use file::FileIngestPlugin;
pub use registry::{global_ingest_registry, IngestRegistry};
pub use stream::{IngestMetadata, IngestStream, TrackInfo};

/// Connection state of an ingest source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// Created, not started
    Idle,
    /// Start in progress
    Connecting,
    /// Producing data
    Connected,
    /// Stopped cleanly
    Disconnected,
    /// Failed
    Error,
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Audio samples
    Audio,
    /// Video frames
    Video,
    /// Subtitle/caption text
    Subtitle,
    /// Anything else (raw bytes)
    Data,
}

/// Factory for ingest sources, matched against URI schemes
pub trait IngestPlugin: Send + Sync {
    /// Unique plugin name (e.g. "file", "rtmp")
    fn name(&self) -> &'static str;

    /// URI schemes handled. `""` matches bare paths, `"-"` matches stdin.
    fn schemes(&self) -> &'static [&'static str];

    /// Create a source in `Idle` state
    fn create(&self, config: &IngestConfig) -> Result<Box<dyn IngestSource>, Error>;

    /// Validate configuration before creation
    fn validate(&self, config: &IngestConfig) -> Result<(), Error> {
        let _ = config;
        Ok(())
    }
}

/// Active connection to a media origin
#[async_trait]
pub trait IngestSource: Send + Sync {
    /// Connect and begin producing chunks
    async fn start(&mut self) -> Result<IngestStream, Error>;

    /// Disconnect cleanly; pending chunks may still be delivered
    async fn stop(&mut self) -> Result<(), Error>;

    /// Current connection state
    fn status(&self) -> IngestStatus;

    /// Discovered track metadata (`None` until connected)
    fn metadata(&self) -> Option<&IngestMetadata>;
}
