//! Ingest stream and discovered metadata

use super::MediaType;
use crate::data::RuntimeData;
use tokio::sync::mpsc;

/// One discovered track
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Stream id chunks of this track carry (e.g. "audio:0")
    pub stream_id: String,
    /// Media kind
    pub media: MediaType,
    /// Sample rate for audio tracks
    pub sample_rate_hz: Option<u32>,
    /// Channel count for audio tracks
    pub channels: Option<u16>,
}

/// Metadata discovered when a source connects
#[derive(Debug, Clone, Default)]
pub struct IngestMetadata {
    /// All discovered tracks (before selection)
    pub tracks: Vec<TrackInfo>,
    /// Total duration when known, microseconds
    pub duration_us: Option<u64>,
}

/// Async stream of `RuntimeData` chunks from a connected source.
///
/// The channel is bounded; a slow pipeline blocks the producer, which is
/// how ingestion backpressure works.
pub struct IngestStream {
    rx: mpsc::Receiver<RuntimeData>,
}

impl IngestStream {
    /// Wrap the receiving half; sources keep the sender
    pub fn new(rx: mpsc::Receiver<RuntimeData>) -> Self {
        Self { rx }
    }

    /// Await the next chunk; `None` = source finished or stopped
    pub async fn recv(&mut self) -> Option<RuntimeData> {
        self.rx.recv().await
    }

    /// Drain the stream into a vec (test helper; unbounded memory)
    pub async fn collect(mut self) -> Vec<RuntimeData> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }
}
