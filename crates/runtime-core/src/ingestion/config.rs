//! Ingest source configuration

use serde::{Deserialize, Serialize};

/// Which tracks of a multi-track source are produced
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSelection {
    /// First audio and first video track (the default)
    #[default]
    FirstAudioVideo,
    /// Every discovered track
    All,
    /// Exactly the named stream ids (e.g. `["audio:1", "subtitle:0"]`)
    Specific(Vec<String>),
}

impl TrackSelection {
    /// Whether a track with this stream id should be produced
    pub fn selects(&self, stream_id: &str) -> bool {
        match self {
            TrackSelection::FirstAudioVideo => {
                stream_id == "audio:0" || stream_id == "video:0"
            }
            TrackSelection::All => true,
            TrackSelection::Specific(ids) => ids.iter().any(|id| id == stream_id),
        }
    }
}

/// Configuration for creating an ingest source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Source URI: `file://…`, a bare path, `-` for stdin, or a protocol
    /// URL handled by a registered plugin
    pub url: String,

    /// Track selection policy
    #[serde(default)]
    pub track_selection: TrackSelection,

    /// Audio chunk duration produced by decoding sources, milliseconds
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,

    /// Chunk size for byte-oriented sources
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
}

fn default_chunk_ms() -> u64 {
    100
}

fn default_chunk_bytes() -> usize {
    64 * 1024
}

impl IngestConfig {
    /// Config for a URI with default policies
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            track_selection: TrackSelection::default(),
            chunk_ms: default_chunk_ms(),
            chunk_bytes: default_chunk_bytes(),
        }
    }

    /// Builder: set the track selection policy
    pub fn with_tracks(mut self, selection: TrackSelection) -> Self {
        self.track_selection = selection;
        self
    }
}
