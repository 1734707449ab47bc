//! PCM sample format conversion node

use crate::data::{RuntimeData, SampleFormat};
use crate::nodes::PipelineNode;
use crate::{Error, Result};
use async_trait::async_trait;

/// Converts audio buffers between f32 and i16 PCM.
///
/// `params.target_format` is `"f32"` or `"i16"`; buffers already in the
/// target format pass through untouched.
pub struct AudioFormatConvertNode {
    node_id: String,
    target: SampleFormat,
}

impl AudioFormatConvertNode {
    /// Create from manifest params
    pub fn new(node_id: &str, params: &serde_json::Value) -> Result<Self> {
        let target = match params.get("target_format").and_then(|v| v.as_str()) {
            Some("f32") | None => SampleFormat::F32,
            Some("i16") => SampleFormat::I16,
            Some(other) => {
                return Err(Error::Config(format!(
                    "AudioFormatConvert node '{node_id}': unknown target_format '{other}'"
                )))
            }
        };
        Ok(Self {
            node_id: node_id.to_string(),
            target,
        })
    }
}

#[async_trait]
impl PipelineNode for AudioFormatConvertNode {
    fn node_type(&self) -> &'static str {
        "AudioFormatConvert"
    }

    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        let RuntimeData::Audio {
            samples,
            sample_rate_hz,
            channels,
            format,
            stream_id,
            timestamp_us,
        } = input
        else {
            return Err(Error::node_process(
                &self.node_id,
                format!("expected audio input, got {}", input.data_type()),
            ));
        };

        if format == self.target {
            return Ok(vec![RuntimeData::Audio {
                samples,
                sample_rate_hz,
                channels,
                format,
                stream_id,
                timestamp_us,
            }]);
        }

        let converted = match (format, self.target) {
            (SampleFormat::I16, SampleFormat::F32) => {
                let ints: &[i16] = bytemuck::cast_slice(&samples);
                let floats: Vec<f32> = ints.iter().map(|&s| s as f32 / 32768.0).collect();
                bytemuck::cast_slice(&floats).to_vec()
            }
            (SampleFormat::F32, SampleFormat::I16) => {
                let floats: &[f32] = bytemuck::cast_slice(&samples);
                let ints: Vec<i16> = floats
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .collect();
                bytemuck::cast_slice(&ints).to_vec()
            }
            _ => unreachable!("identical formats handled above"),
        };

        Ok(vec![RuntimeData::Audio {
            samples: converted,
            sample_rate_hz,
            channels,
            format: self.target,
            stream_id,
            timestamp_us,
        }])
    }
}
