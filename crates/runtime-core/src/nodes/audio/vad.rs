//! Energy-based voice activity detection
//!
//! Frames the incoming audio, compares per-frame RMS energy against a dB
//! threshold, and emits one Json segment per detected active region
//! alongside the unmodified audio. Segment boundaries are media timestamps
//! in microseconds.
//!
//! With `speculative: true` the node also emits `CancelSpeculation`
//! control messages for stretches of confirmed silence, telling downstream
//! nodes that forwarded that audio speculatively to abandon the work.

use crate::data::{ControlKind, ControlMessage, RuntimeData};
use crate::nodes::{PipelineNode, SessionContext};
use crate::{Error, Result};
use async_trait::async_trait;

/// Schema tag attached to emitted segment payloads
pub const VAD_SEGMENT_SCHEMA: &str = "vad.segment.v1";

/// Energy-gate VAD emitting `{start_us, end_us}` Json segments
pub struct EnergyVadNode {
    node_id: String,
    threshold_db: f64,
    frame_ms: u64,
    /// Hang time before an active segment closes, in frames
    hangover_frames: u32,
    /// Emit cancels for confirmed-silent stretches
    speculative: bool,
    /// Silence must last this long before a cancel is emitted
    min_silence_us: u64,

    session_id: String,

    // Segment state machine
    active_since_us: Option<u64>,
    last_active_end_us: u64,
    inactive_run: u32,
    // Speculation state
    silent_since_us: Option<u64>,
    last_cancel_end_us: u64,
    cancelled_ranges: Vec<(u64, u64)>,
}

impl EnergyVadNode {
    /// Create from manifest params (`threshold_db` default -30,
    /// `frame_ms` default 20, `hangover_frames` default 2,
    /// `speculative` default false, `min_silence_ms` default 200)
    pub fn new(node_id: &str, params: &serde_json::Value) -> Result<Self> {
        let threshold_db = params
            .get("threshold_db")
            .and_then(|v| v.as_f64())
            .unwrap_or(-30.0);
        let frame_ms = params.get("frame_ms").and_then(|v| v.as_u64()).unwrap_or(20);
        if frame_ms == 0 {
            return Err(Error::Config(format!(
                "EnergyVad node '{node_id}': frame_ms must be > 0"
            )));
        }
        let hangover_frames = params
            .get("hangover_frames")
            .and_then(|v| v.as_u64())
            .unwrap_or(2) as u32;
        let speculative = params
            .get("speculative")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let min_silence_us = params
            .get("min_silence_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(200)
            * 1000;
        Ok(Self {
            node_id: node_id.to_string(),
            threshold_db,
            frame_ms,
            hangover_frames,
            speculative,
            min_silence_us,
            session_id: String::new(),
            active_since_us: None,
            last_active_end_us: 0,
            inactive_run: 0,
            silent_since_us: None,
            last_cancel_end_us: 0,
            cancelled_ranges: Vec::new(),
        })
    }

    fn segment(&self, start_us: u64, end_us: u64, stream_id: &str) -> RuntimeData {
        RuntimeData::Json {
            payload: serde_json::json!({
                "start_us": start_us,
                "end_us": end_us,
                "stream_id": stream_id,
            }),
            schema_tag: Some(VAD_SEGMENT_SCHEMA.to_string()),
        }
    }

    fn is_cancelled(&self, start_us: u64, end_us: u64) -> bool {
        // Inclusive ranges: touching counts as overlap
        self.cancelled_ranges
            .iter()
            .any(|&(from, to)| start_us <= to && end_us >= from)
    }
}

#[async_trait]
impl PipelineNode for EnergyVadNode {
    fn node_type(&self) -> &'static str {
        "EnergyVad"
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        self.session_id = ctx.session_id.clone();
        Ok(())
    }

    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        let (sample_rate_hz, channels, stream_id, base_ts_us) = match &input {
            RuntimeData::Audio {
                sample_rate_hz,
                channels,
                stream_id,
                timestamp_us,
                ..
            } => (
                *sample_rate_hz,
                *channels as usize,
                stream_id.clone(),
                *timestamp_us,
            ),
            other => {
                return Err(Error::node_process(
                    &self.node_id,
                    format!("expected audio input, got {}", other.data_type()),
                ))
            }
        };

        let samples = input.audio_samples_f32().expect("audio variant");
        let frame_len = (sample_rate_hz as u64 * self.frame_ms / 1000) as usize * channels;
        if frame_len == 0 {
            return Ok(vec![input]);
        }

        let mut outputs = Vec::new();
        let frame_us = self.frame_ms * 1000;
        let mut buffer_end_us = base_ts_us;

        for (i, frame) in samples.chunks(frame_len).enumerate() {
            let frame_start_us = base_ts_us + i as u64 * frame_us;
            let frame_end_us = frame_start_us + frame_us;
            buffer_end_us = frame_end_us;

            let rms = (frame.iter().map(|s| (*s as f64).powi(2)).sum::<f64>()
                / frame.len() as f64)
                .sqrt();
            let db = if rms > 0.0 { 20.0 * rms.log10() } else { f64::NEG_INFINITY };
            let active = db > self.threshold_db;

            if active {
                if self.active_since_us.is_none() {
                    self.active_since_us = Some(frame_start_us);
                }
                self.last_active_end_us = frame_end_us;
                self.inactive_run = 0;
                self.silent_since_us = None;
            } else {
                if self.silent_since_us.is_none() {
                    self.silent_since_us = Some(frame_start_us);
                }
                if let Some(start) = self.active_since_us {
                    self.inactive_run += 1;
                    if self.inactive_run > self.hangover_frames {
                        let end = self.last_active_end_us;
                        if !self.is_cancelled(start, end) {
                            outputs.push(self.segment(start, end, &stream_id));
                        }
                        self.active_since_us = None;
                        self.inactive_run = 0;
                    }
                }
            }
        }

        // A silent stretch past the threshold is confirmed non-speech:
        // downstream speculation on it can be abandoned
        if self.speculative {
            if let Some(since) = self.silent_since_us {
                if buffer_end_us.saturating_sub(since) >= self.min_silence_us {
                    let from = since.max(self.last_cancel_end_us);
                    if buffer_end_us > from {
                        outputs.insert(
                            0,
                            RuntimeData::Control(ControlMessage::cancel_speculation(
                                self.session_id.clone(),
                                from,
                                buffer_end_us,
                            )),
                        );
                        self.last_cancel_end_us = buffer_end_us;
                    }
                }
            }
        }

        // Audio always passes through behind any segments
        outputs.push(input);
        Ok(outputs)
    }

    async fn flush(&mut self) -> Result<Vec<RuntimeData>> {
        // Close a segment still open at end of stream
        if let Some(start) = self.active_since_us.take() {
            let end = self.last_active_end_us;
            if !self.is_cancelled(start, end) {
                return Ok(vec![self.segment(start, end, "")]);
            }
        }
        Ok(Vec::new())
    }

    async fn on_control(&mut self, msg: &ControlMessage) -> Result<()> {
        if let ControlKind::CancelSpeculation {
            from_timestamp_us,
            to_timestamp_us,
        } = msg.kind
        {
            let range = (from_timestamp_us, to_timestamp_us);
            if !self.cancelled_ranges.contains(&range) {
                self.cancelled_ranges.push(range);
            }
            // Abandon an in-flight segment the cancel covers (inclusive)
            if let Some(start) = self.active_since_us {
                if start <= to_timestamp_us
                    && self.last_active_end_us.max(start) >= from_timestamp_us
                {
                    self.active_since_us = None;
                    self.inactive_run = 0;
                }
            }
        }
        Ok(())
    }
}
