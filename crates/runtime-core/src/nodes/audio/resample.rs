//! Sample-rate conversion node
//!
//! Each input buffer is resampled as a complete unit: the sinc filter's
//! group delay is trimmed and the output is sized to
//! `round(frames_in * target / source)`, so a 1-second 48 kHz buffer
//! resampled to 16 kHz yields exactly 16000 samples in one output buffer.

use crate::data::RuntimeData;
use crate::nodes::PipelineNode;
use crate::{Error, Result};
use async_trait::async_trait;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

const CHUNK_FRAMES: usize = 1024;

/// Resamples audio buffers to `params.target_rate`
pub struct AudioResampleNode {
    node_id: String,
    target_rate: u32,
    // Cached resampler, rebuilt when the input geometry changes
    resampler: Option<SincFixedIn<f32>>,
    resampler_key: (u32, u16),
}

impl AudioResampleNode {
    /// Create from manifest params (`target_rate` required)
    pub fn new(node_id: &str, params: &serde_json::Value) -> Result<Self> {
        let target_rate = params
            .get("target_rate")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                Error::Config(format!(
                    "AudioResample node '{node_id}' requires integer param 'target_rate'"
                ))
            })? as u32;
        if target_rate == 0 {
            return Err(Error::Config(format!(
                "AudioResample node '{node_id}': target_rate must be > 0"
            )));
        }
        Ok(Self {
            node_id: node_id.to_string(),
            target_rate,
            resampler: None,
            resampler_key: (0, 0),
        })
    }

    fn resampler_for(&mut self, source_rate: u32, channels: u16) -> Result<&mut SincFixedIn<f32>> {
        let key = (source_rate, channels);
        if self.resampler.is_none() || self.resampler_key != key {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::new(
                self.target_rate as f64 / source_rate as f64,
                1.0,
                params,
                CHUNK_FRAMES,
                channels as usize,
            )
            .map_err(|e| {
                Error::node_process(&self.node_id, format!("failed to create resampler: {e}"))
            })?;
            self.resampler = Some(resampler);
            self.resampler_key = key;
        } else if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        Ok(self.resampler.as_mut().unwrap())
    }

    /// Resample one complete deinterleaved buffer, trimming filter delay
    /// and sizing the output exactly.
    fn resample_exact(
        &mut self,
        planar: &[Vec<f32>],
        source_rate: u32,
    ) -> Result<Vec<Vec<f32>>> {
        let channels = planar.len();
        let frames_in = planar[0].len();
        let expected =
            (frames_in as f64 * self.target_rate as f64 / source_rate as f64).round() as usize;

        let node_id = self.node_id.clone();
        let resampler = self.resampler_for(source_rate, channels as u16)?;
        let skip = resampler.output_delay();

        let mut collected: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + skip); channels];
        let mut consumed = 0usize;

        let fail = |e: rubato::ResampleError| {
            Error::node_process(&node_id, format!("resampler error: {e}"))
        };

        while consumed + CHUNK_FRAMES <= frames_in {
            let chunk: Vec<&[f32]> = planar
                .iter()
                .map(|ch| &ch[consumed..consumed + CHUNK_FRAMES])
                .collect();
            let out = resampler.process(&chunk, None).map_err(fail)?;
            for (dst, src) in collected.iter_mut().zip(out) {
                dst.extend(src);
            }
            consumed += CHUNK_FRAMES;
        }

        // Tail shorter than one chunk
        if consumed < frames_in {
            let chunk: Vec<&[f32]> = planar.iter().map(|ch| &ch[consumed..]).collect();
            let out = resampler.process_partial(Some(&chunk), None).map_err(fail)?;
            for (dst, src) in collected.iter_mut().zip(out) {
                dst.extend(src);
            }
        }

        // Drain the filter until delay compensation leaves enough samples
        while collected[0].len() < skip + expected {
            let out = resampler
                .process_partial::<&[f32]>(None, None)
                .map_err(fail)?;
            if out[0].is_empty() {
                break;
            }
            for (dst, src) in collected.iter_mut().zip(out) {
                dst.extend(src);
            }
        }

        let trimmed = collected
            .into_iter()
            .map(|ch| {
                let mut ch: Vec<f32> = ch.into_iter().skip(skip).take(expected).collect();
                ch.resize(expected, 0.0);
                ch
            })
            .collect();
        Ok(trimmed)
    }
}

#[async_trait]
impl PipelineNode for AudioResampleNode {
    fn node_type(&self) -> &'static str {
        "AudioResample"
    }

    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        input.validate()?;
        let (sample_rate_hz, channels, stream_id, timestamp_us) = match &input {
            RuntimeData::Audio {
                sample_rate_hz,
                channels,
                stream_id,
                timestamp_us,
                ..
            } => (
                *sample_rate_hz,
                *channels,
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

        if sample_rate_hz == self.target_rate {
            return Ok(vec![input]);
        }

        let interleaved = input
            .audio_samples_f32()
            .expect("audio variant checked above");
        let frames = interleaved.len() / channels as usize;
        if frames == 0 {
            return Ok(Vec::new());
        }

        // Deinterleave
        let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels as usize];
        for frame in interleaved.chunks_exact(channels as usize) {
            for (ch, &sample) in frame.iter().enumerate() {
                planar[ch].push(sample);
            }
        }

        let resampled = self.resample_exact(&planar, sample_rate_hz)?;

        // Re-interleave
        let out_frames = resampled[0].len();
        let mut out = Vec::with_capacity(out_frames * channels as usize);
        for i in 0..out_frames {
            for ch in &resampled {
                out.push(ch[i]);
            }
        }

        Ok(vec![RuntimeData::audio_f32(
            &out,
            self.target_rate,
            channels,
            stream_id,
            timestamp_us,
        )])
    }
}
