//! Core data types
//!
//! `RuntimeData` is the typed media buffer that flows along pipeline edges.
//! It never serializes while routed inside the core; the binary IPC form in
//! [`wire`] is produced exactly once per transport/process boundary.

use serde::{Deserialize, Serialize};

pub mod control;
pub mod wire;

pub use control::{ControlDisposition, ControlKind, ControlMessage};

/// PCM sample encoding for audio buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit float (little-endian)
    F32 = 1,
    /// 16-bit signed integer (little-endian)
    I16 = 2,
}

impl SampleFormat {
    /// Bytes per single sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }

    /// Wire tag value
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Parse a wire tag value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SampleFormat::F32),
            2 => Some(SampleFormat::I16),
            _ => None,
        }
    }
}

/// Pixel layout for video frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB
    Rgb24 = 1,
    /// Packed 8-bit BGR
    Bgr24 = 2,
    /// Planar YUV 4:2:0
    Yuv420p = 3,
    /// Semi-planar YUV 4:2:0 (UV interleaved)
    Nv12 = 4,
    /// Packed 8-bit RGBA
    Rgba32 = 5,
}

impl PixelFormat {
    /// Expected buffer size for a frame of the given dimensions
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => w * h * 3,
            PixelFormat::Rgba32 => w * h * 4,
            PixelFormat::Yuv420p | PixelFormat::Nv12 => w * h * 3 / 2,
        }
    }

    /// 4:2:0 formats subsample chroma and need even dimensions
    pub fn requires_even_dimensions(&self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }

    /// Wire tag value
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Parse a wire tag value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PixelFormat::Rgb24),
            2 => Some(PixelFormat::Bgr24),
            3 => Some(PixelFormat::Yuv420p),
            4 => Some(PixelFormat::Nv12),
            5 => Some(PixelFormat::Rgba32),
            _ => None,
        }
    }
}

/// Data type hint for routing and port typing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTypeHint {
    /// Accepts/produces any variant
    #[default]
    Any,
    /// Audio buffers
    Audio,
    /// Video frames
    Video,
    /// UTF-8 text
    Text,
    /// JSON payloads
    Json,
    /// Raw bytes
    Binary,
    /// N-dimensional arrays
    Numpy,
}

impl DataTypeHint {
    /// Whether a concrete buffer satisfies this hint.
    ///
    /// Control messages match every hint: they flow on the side channel and
    /// must never be rejected by port typing.
    pub fn accepts(&self, data: &RuntimeData) -> bool {
        match (self, data) {
            (DataTypeHint::Any, _) => true,
            (_, RuntimeData::Control(_)) => true,
            (DataTypeHint::Audio, RuntimeData::Audio { .. }) => true,
            (DataTypeHint::Video, RuntimeData::Video { .. }) => true,
            (DataTypeHint::Text, RuntimeData::Text { .. }) => true,
            (DataTypeHint::Json, RuntimeData::Json { .. }) => true,
            (DataTypeHint::Binary, RuntimeData::Binary { .. }) => true,
            (DataTypeHint::Numpy, RuntimeData::Numpy { .. }) => true,
            _ => false,
        }
    }

    /// Whether two declared port hints can legally be connected
    pub fn compatible_with(&self, other: &DataTypeHint) -> bool {
        *self == DataTypeHint::Any || *other == DataTypeHint::Any || self == other
    }
}

impl std::fmt::Display for DataTypeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataTypeHint::Any => "any",
            DataTypeHint::Audio => "audio",
            DataTypeHint::Video => "video",
            DataTypeHint::Text => "text",
            DataTypeHint::Json => "json",
            DataTypeHint::Binary => "binary",
            DataTypeHint::Numpy => "numpy",
        };
        f.write_str(s)
    }
}

/// Typed media buffer flowing along pipeline edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuntimeData {
    /// PCM audio samples
    Audio {
        /// Raw sample bytes in `format` encoding, channel-interleaved
        samples: Vec<u8>,
        /// Sample rate in Hz
        sample_rate_hz: u32,
        /// Channel count (1 = mono)
        channels: u16,
        /// Sample encoding
        format: SampleFormat,
        /// Stream/track identifier (e.g. "audio:0")
        stream_id: String,
        /// Presentation timestamp in microseconds
        timestamp_us: u64,
    },
    /// Video frame
    Video {
        /// Raw pixel bytes in `format` layout
        pixel_data: Vec<u8>,
        /// Frame width in pixels
        width: u32,
        /// Frame height in pixels
        height: u32,
        /// Pixel layout
        format: PixelFormat,
        /// Monotonic frame counter
        frame_number: u64,
        /// Presentation timestamp in microseconds
        timestamp_us: u64,
        /// Stream/track identifier (e.g. "video:0")
        stream_id: String,
    },
    /// UTF-8 text
    Text {
        /// Text content
        content: String,
        /// Stream/track identifier
        stream_id: String,
    },
    /// JSON payload
    Json {
        /// Parsed JSON value
        payload: serde_json::Value,
        /// Optional schema identifier for consumers
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_tag: Option<String>,
    },
    /// Raw binary data
    Binary {
        /// The bytes
        bytes: Vec<u8>,
        /// Optional MIME-style content type
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    /// N-dimensional array preserving full memory layout for zero-copy
    /// passthrough between array-aware runtimes
    Numpy {
        /// Raw array bytes
        data: Vec<u8>,
        /// Dimensions
        shape: Vec<usize>,
        /// Element dtype string (e.g. "float32", "int16")
        dtype: String,
        /// Byte stride per dimension
        strides: Vec<isize>,
        /// C-contiguous flag
        c_contiguous: bool,
        /// Fortran-contiguous flag
        f_contiguous: bool,
    },
    /// Out-of-band control directive (cancel/hint/deadline)
    Control(ControlMessage),
}

impl RuntimeData {
    /// Build an audio buffer from f32 samples
    pub fn audio_f32(
        samples: &[f32],
        sample_rate_hz: u32,
        channels: u16,
        stream_id: impl Into<String>,
        timestamp_us: u64,
    ) -> Self {
        RuntimeData::Audio {
            samples: bytemuck::cast_slice(samples).to_vec(),
            sample_rate_hz,
            channels,
            format: SampleFormat::F32,
            stream_id: stream_id.into(),
            timestamp_us,
        }
    }

    /// Build an audio buffer from i16 samples
    pub fn audio_i16(
        samples: &[i16],
        sample_rate_hz: u32,
        channels: u16,
        stream_id: impl Into<String>,
        timestamp_us: u64,
    ) -> Self {
        RuntimeData::Audio {
            samples: bytemuck::cast_slice(samples).to_vec(),
            sample_rate_hz,
            channels,
            format: SampleFormat::I16,
            stream_id: stream_id.into(),
            timestamp_us,
        }
    }

    /// Build a text buffer
    pub fn text(content: impl Into<String>, stream_id: impl Into<String>) -> Self {
        RuntimeData::Text {
            content: content.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Build a JSON buffer
    pub fn json(payload: serde_json::Value) -> Self {
        RuntimeData::Json {
            payload,
            schema_tag: None,
        }
    }

    /// Variant name as string (for metrics and logging)
    pub fn data_type(&self) -> &'static str {
        match self {
            RuntimeData::Audio { .. } => "audio",
            RuntimeData::Video { .. } => "video",
            RuntimeData::Text { .. } => "text",
            RuntimeData::Json { .. } => "json",
            RuntimeData::Binary { .. } => "binary",
            RuntimeData::Numpy { .. } => "numpy",
            RuntimeData::Control(_) => "control_message",
        }
    }

    /// Corresponding routing hint
    pub fn type_hint(&self) -> DataTypeHint {
        match self {
            RuntimeData::Audio { .. } => DataTypeHint::Audio,
            RuntimeData::Video { .. } => DataTypeHint::Video,
            RuntimeData::Text { .. } => DataTypeHint::Text,
            RuntimeData::Json { .. } => DataTypeHint::Json,
            RuntimeData::Binary { .. } => DataTypeHint::Binary,
            RuntimeData::Numpy { .. } => DataTypeHint::Numpy,
            RuntimeData::Control(_) => DataTypeHint::Any,
        }
    }

    /// Whether this is the control-message variant
    pub fn is_control(&self) -> bool {
        matches!(self, RuntimeData::Control(_))
    }

    /// Stream identifier, if the variant carries one
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            RuntimeData::Audio { stream_id, .. }
            | RuntimeData::Video { stream_id, .. }
            | RuntimeData::Text { stream_id, .. } => Some(stream_id),
            _ => None,
        }
    }

    /// Presentation timestamp in microseconds, if the variant carries one
    pub fn timestamp_us(&self) -> Option<u64> {
        match self {
            RuntimeData::Audio { timestamp_us, .. }
            | RuntimeData::Video { timestamp_us, .. } => Some(*timestamp_us),
            RuntimeData::Control(msg) => Some(msg.timestamp_us),
            _ => None,
        }
    }

    /// Count of logical items (samples, frames, characters, …)
    pub fn item_count(&self) -> usize {
        match self {
            RuntimeData::Audio {
                samples, format, ..
            } => samples.len() / format.bytes_per_sample(),
            RuntimeData::Video { .. } => 1,
            RuntimeData::Text { content, .. } => content.chars().count(),
            RuntimeData::Json { payload, .. } => match payload {
                serde_json::Value::Array(arr) => arr.len(),
                serde_json::Value::Object(obj) => obj.len(),
                _ => 1,
            },
            RuntimeData::Binary { bytes, .. } => bytes.len(),
            RuntimeData::Numpy { shape, .. } => shape.iter().product(),
            RuntimeData::Control(_) => 1,
        }
    }

    /// Payload memory footprint in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            RuntimeData::Audio { samples, .. } => samples.len(),
            RuntimeData::Video { pixel_data, .. } => pixel_data.len(),
            RuntimeData::Text { content, .. } => content.len(),
            RuntimeData::Json { payload, .. } => serde_json::to_string(payload)
                .map(|s| s.len())
                .unwrap_or(0),
            RuntimeData::Binary { bytes, .. } => bytes.len(),
            RuntimeData::Numpy { data, .. } => data.len(),
            RuntimeData::Control(msg) => msg.approximate_size(),
        }
    }

    /// Audio samples decoded to f32, converting from i16 when needed.
    ///
    /// Returns `None` for non-audio variants.
    pub fn audio_samples_f32(&self) -> Option<Vec<f32>> {
        match self {
            RuntimeData::Audio {
                samples,
                format: SampleFormat::F32,
                ..
            } => Some(bytemuck::cast_slice(samples).to_vec()),
            RuntimeData::Audio {
                samples,
                format: SampleFormat::I16,
                ..
            } => {
                let ints: &[i16] = bytemuck::cast_slice(samples);
                Some(ints.iter().map(|&s| s as f32 / 32768.0).collect())
            }
            _ => None,
        }
    }

    /// Validate the variant's structural invariants.
    ///
    /// Checks sample alignment against channels × sample size, pixel buffer
    /// sizing against width/height/format, and numpy shape/stride
    /// consistency.
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            RuntimeData::Audio {
                samples,
                channels,
                format,
                ..
            } => {
                if *channels == 0 {
                    return Err(crate::Error::InvalidData(
                        "audio buffer with zero channels".into(),
                    ));
                }
                let frame = *channels as usize * format.bytes_per_sample();
                if samples.len() % frame != 0 {
                    return Err(crate::Error::InvalidData(format!(
                        "audio buffer of {} bytes is not a multiple of frame size {} ({} channels x {} bytes)",
                        samples.len(),
                        frame,
                        channels,
                        format.bytes_per_sample()
                    )));
                }
                Ok(())
            }
            RuntimeData::Video {
                pixel_data,
                width,
                height,
                format,
                ..
            } => {
                if *width == 0 || *height == 0 {
                    return Err(crate::Error::InvalidData(
                        "video frame with zero width or height".into(),
                    ));
                }
                if format.requires_even_dimensions() && (*width % 2 != 0 || *height % 2 != 0) {
                    return Err(crate::Error::InvalidData(format!(
                        "{format:?} requires even dimensions, got {width}x{height}"
                    )));
                }
                let expected = format.buffer_size(*width, *height);
                if pixel_data.len() != expected {
                    return Err(crate::Error::InvalidData(format!(
                        "pixel buffer size mismatch: expected {expected}, got {}",
                        pixel_data.len()
                    )));
                }
                Ok(())
            }
            RuntimeData::Numpy {
                data,
                shape,
                dtype,
                strides,
                ..
            } => {
                if strides.len() != shape.len() {
                    return Err(crate::Error::InvalidData(format!(
                        "numpy strides rank {} does not match shape rank {}",
                        strides.len(),
                        shape.len()
                    )));
                }
                let itemsize = numpy_itemsize(dtype).ok_or_else(|| {
                    crate::Error::InvalidData(format!("unknown numpy dtype '{dtype}'"))
                })?;
                let elements: usize = shape.iter().product();
                if elements * itemsize > data.len() {
                    return Err(crate::Error::InvalidData(format!(
                        "numpy buffer of {} bytes too small for shape {:?} of {dtype}",
                        data.len(),
                        shape
                    )));
                }
                Ok(())
            }
            RuntimeData::Control(msg) => msg
                .check_range()
                .map_err(crate::Error::InvalidData),
            _ => Ok(()),
        }
    }
}

/// Element size in bytes for common numpy dtype strings
pub fn numpy_itemsize(dtype: &str) -> Option<usize> {
    match dtype {
        "bool" | "int8" | "uint8" => Some(1),
        "int16" | "uint16" | "float16" => Some(2),
        "int32" | "uint32" | "float32" => Some(4),
        "int64" | "uint64" | "float64" | "complex64" => Some(8),
        "complex128" => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_accessors() {
        let audio = RuntimeData::audio_f32(&[0.1, 0.2, 0.3, 0.4], 16000, 1, "audio:0", 42);
        assert_eq!(audio.data_type(), "audio");
        assert_eq!(audio.item_count(), 4);
        assert_eq!(audio.size_bytes(), 16);
        assert_eq!(audio.stream_id(), Some("audio:0"));
        assert_eq!(audio.timestamp_us(), Some(42));
        assert!(audio.validate().is_ok());
    }

    #[test]
    fn test_audio_alignment_invariant() {
        let bad = RuntimeData::Audio {
            samples: vec![0u8; 7], // not a multiple of 4 (mono f32)
            sample_rate_hz: 16000,
            channels: 1,
            format: SampleFormat::F32,
            stream_id: "audio:0".into(),
            timestamp_us: 0,
        };
        assert!(bad.validate().is_err());

        let stereo_i16 = RuntimeData::Audio {
            samples: vec![0u8; 8], // 2 frames of stereo i16
            sample_rate_hz: 16000,
            channels: 2,
            format: SampleFormat::I16,
            stream_id: "audio:0".into(),
            timestamp_us: 0,
        };
        assert!(stereo_i16.validate().is_ok());
        assert_eq!(stereo_i16.item_count(), 4);
    }

    #[test]
    fn test_i16_to_f32_conversion() {
        let audio = RuntimeData::audio_i16(&[0, 16384, -32768], 8000, 1, "audio:0", 0);
        let f = audio.audio_samples_f32().unwrap();
        assert_eq!(f.len(), 3);
        assert!((f[0]).abs() < 1e-6);
        assert!((f[1] - 0.5).abs() < 1e-6);
        assert!((f[2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_video_buffer_sizing() {
        let frame = RuntimeData::Video {
            pixel_data: vec![0u8; 64 * 48 * 3],
            width: 64,
            height: 48,
            format: PixelFormat::Rgb24,
            frame_number: 0,
            timestamp_us: 0,
            stream_id: "video:0".into(),
        };
        assert!(frame.validate().is_ok());

        let wrong = RuntimeData::Video {
            pixel_data: vec![0u8; 100],
            width: 64,
            height: 48,
            format: PixelFormat::Rgb24,
            frame_number: 0,
            timestamp_us: 0,
            stream_id: "video:0".into(),
        };
        assert!(wrong.validate().is_err());
    }

    #[test]
    fn test_yuv_even_dimensions() {
        let odd = RuntimeData::Video {
            pixel_data: vec![0u8; 63 * 48 * 3 / 2],
            width: 63,
            height: 48,
            format: PixelFormat::Yuv420p,
            frame_number: 0,
            timestamp_us: 0,
            stream_id: "video:0".into(),
        };
        assert!(odd.validate().is_err());

        let nv12 = RuntimeData::Video {
            pixel_data: vec![0u8; 64 * 48 * 3 / 2],
            width: 64,
            height: 48,
            format: PixelFormat::Nv12,
            frame_number: 1,
            timestamp_us: 33_333,
            stream_id: "video:0".into(),
        };
        assert!(nv12.validate().is_ok());
    }

    #[test]
    fn test_numpy_consistency() {
        let ok = RuntimeData::Numpy {
            data: vec![0u8; 24],
            shape: vec![2, 3],
            dtype: "float32".into(),
            strides: vec![12, 4],
            c_contiguous: true,
            f_contiguous: false,
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.item_count(), 6);

        let rank_mismatch = RuntimeData::Numpy {
            data: vec![0u8; 24],
            shape: vec![2, 3],
            dtype: "float32".into(),
            strides: vec![4],
            c_contiguous: true,
            f_contiguous: false,
        };
        assert!(rank_mismatch.validate().is_err());

        let short_buffer = RuntimeData::Numpy {
            data: vec![0u8; 8],
            shape: vec![2, 3],
            dtype: "float32".into(),
            strides: vec![12, 4],
            c_contiguous: true,
            f_contiguous: false,
        };
        assert!(short_buffer.validate().is_err());
    }

    #[test]
    fn test_json_item_count() {
        assert_eq!(RuntimeData::json(serde_json::json!([1, 2, 3])).item_count(), 3);
        assert_eq!(
            RuntimeData::json(serde_json::json!({"a": 1, "b": 2})).item_count(),
            2
        );
        assert_eq!(RuntimeData::json(serde_json::json!(42)).item_count(), 1);
    }

    #[test]
    fn test_hint_accepts() {
        let audio = RuntimeData::audio_f32(&[0.0], 16000, 1, "audio:0", 0);
        assert!(DataTypeHint::Audio.accepts(&audio));
        assert!(DataTypeHint::Any.accepts(&audio));
        assert!(!DataTypeHint::Text.accepts(&audio));

        // Control messages pass any port hint
        let ctrl = RuntimeData::Control(ControlMessage::batch_hint("s", 4));
        assert!(DataTypeHint::Audio.accepts(&ctrl));
    }

    #[test]
    fn test_hint_compatibility() {
        assert!(DataTypeHint::Audio.compatible_with(&DataTypeHint::Audio));
        assert!(DataTypeHint::Any.compatible_with(&DataTypeHint::Video));
        assert!(!DataTypeHint::Audio.compatible_with(&DataTypeHint::Text));
    }
}
