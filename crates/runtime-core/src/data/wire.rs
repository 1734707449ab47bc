//! Binary IPC form of [`RuntimeData`]
//!
//! `[1-byte tag][variant-specific header][variable-length body]`, all
//! integers little-endian. This encoding is produced exactly once per
//! process/transport boundary; in-memory routing never serializes.
//!
//! Tags: 1 Audio, 2 Video, 3 Text, 4 Numpy, 5 ControlMessage, 6 Json,
//! 7 Binary. Tags `0xF0..` are reserved for IPC lifecycle frames that never
//! leave the ring layer (see `ipc::channel`).

use super::{ControlMessage, PixelFormat, RuntimeData, SampleFormat};
use crate::{Error, Result};

/// Wire tag: audio buffer
pub const TAG_AUDIO: u8 = 1;
/// Wire tag: video frame
pub const TAG_VIDEO: u8 = 2;
/// Wire tag: text
pub const TAG_TEXT: u8 = 3;
/// Wire tag: numpy array
pub const TAG_NUMPY: u8 = 4;
/// Wire tag: control message
pub const TAG_CONTROL: u8 = 5;
/// Wire tag: json payload
pub const TAG_JSON: u8 = 6;
/// Wire tag: raw binary
pub const TAG_BINARY: u8 = 7;

/// Encode a buffer into its IPC binary form
pub fn encode(data: &RuntimeData) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(data.size_bytes() + 64);
    match data {
        RuntimeData::Audio {
            samples,
            sample_rate_hz,
            channels,
            format,
            stream_id,
            timestamp_us,
        } => {
            buf.push(TAG_AUDIO);
            buf.extend_from_slice(&sample_rate_hz.to_le_bytes());
            buf.extend_from_slice(&channels.to_le_bytes());
            buf.push(format.as_u8());
            put_str16(&mut buf, stream_id)?;
            buf.extend_from_slice(&timestamp_us.to_le_bytes());
            put_bytes32(&mut buf, samples)?;
        }
        RuntimeData::Video {
            pixel_data,
            width,
            height,
            format,
            frame_number,
            timestamp_us,
            stream_id,
        } => {
            buf.push(TAG_VIDEO);
            buf.extend_from_slice(&width.to_le_bytes());
            buf.extend_from_slice(&height.to_le_bytes());
            buf.push(format.as_u8());
            buf.extend_from_slice(&frame_number.to_le_bytes());
            buf.extend_from_slice(&timestamp_us.to_le_bytes());
            put_str16(&mut buf, stream_id)?;
            put_bytes32(&mut buf, pixel_data)?;
        }
        RuntimeData::Text { content, stream_id } => {
            buf.push(TAG_TEXT);
            put_str16(&mut buf, stream_id)?;
            put_bytes32(&mut buf, content.as_bytes())?;
        }
        RuntimeData::Numpy {
            data,
            shape,
            dtype,
            strides,
            c_contiguous,
            f_contiguous,
        } => {
            if shape.len() != strides.len() {
                return Err(Error::InvalidData(
                    "numpy shape/strides rank mismatch".into(),
                ));
            }
            if shape.len() > u8::MAX as usize {
                return Err(Error::InvalidData("numpy rank exceeds 255".into()));
            }
            buf.push(TAG_NUMPY);
            buf.push(shape.len() as u8);
            put_str16(&mut buf, dtype)?;
            for dim in shape {
                buf.extend_from_slice(&(*dim as u64).to_le_bytes());
            }
            for stride in strides {
                buf.extend_from_slice(&(*stride as i64).to_le_bytes());
            }
            let mut flags = 0u8;
            if *c_contiguous {
                flags |= 0b01;
            }
            if *f_contiguous {
                flags |= 0b10;
            }
            buf.push(flags);
            put_bytes32(&mut buf, data)?;
        }
        RuntimeData::Control(msg) => {
            buf.push(TAG_CONTROL);
            put_str16(&mut buf, &msg.session_id)?;
            buf.extend_from_slice(&msg.timestamp_us.to_le_bytes());
            let payload = serde_json::to_vec(msg)?;
            put_bytes32(&mut buf, &payload)?;
        }
        RuntimeData::Json {
            payload,
            schema_tag,
        } => {
            buf.push(TAG_JSON);
            put_str16(&mut buf, schema_tag.as_deref().unwrap_or(""))?;
            let payload = serde_json::to_vec(payload)?;
            put_bytes32(&mut buf, &payload)?;
        }
        RuntimeData::Binary {
            bytes,
            content_type,
        } => {
            buf.push(TAG_BINARY);
            put_str16(&mut buf, content_type.as_deref().unwrap_or(""))?;
            put_bytes32(&mut buf, bytes)?;
        }
    }
    Ok(buf)
}

/// Decode a buffer from its IPC binary form
pub fn decode(bytes: &[u8]) -> Result<RuntimeData> {
    let mut cur = Cursor::new(bytes);
    let tag = cur.u8()?;
    match tag {
        TAG_AUDIO => {
            let sample_rate_hz = cur.u32()?;
            let channels = cur.u16()?;
            let format = SampleFormat::from_u8(cur.u8()?)
                .ok_or_else(|| Error::InvalidData("unknown sample format".into()))?;
            let stream_id = cur.str16()?;
            let timestamp_us = cur.u64()?;
            let samples = cur.bytes32()?.to_vec();
            Ok(RuntimeData::Audio {
                samples,
                sample_rate_hz,
                channels,
                format,
                stream_id,
                timestamp_us,
            })
        }
        TAG_VIDEO => {
            let width = cur.u32()?;
            let height = cur.u32()?;
            let format = PixelFormat::from_u8(cur.u8()?)
                .ok_or_else(|| Error::InvalidData("unknown pixel format".into()))?;
            let frame_number = cur.u64()?;
            let timestamp_us = cur.u64()?;
            let stream_id = cur.str16()?;
            let pixel_data = cur.bytes32()?.to_vec();
            Ok(RuntimeData::Video {
                pixel_data,
                width,
                height,
                format,
                frame_number,
                timestamp_us,
                stream_id,
            })
        }
        TAG_TEXT => {
            let stream_id = cur.str16()?;
            let content = String::from_utf8(cur.bytes32()?.to_vec())
                .map_err(|e| Error::InvalidData(format!("text body is not UTF-8: {e}")))?;
            Ok(RuntimeData::Text { content, stream_id })
        }
        TAG_NUMPY => {
            let ndim = cur.u8()? as usize;
            let dtype = cur.str16()?;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                shape.push(cur.u64()? as usize);
            }
            let mut strides = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                strides.push(cur.i64()? as isize);
            }
            let flags = cur.u8()?;
            let data = cur.bytes32()?.to_vec();
            Ok(RuntimeData::Numpy {
                data,
                shape,
                dtype,
                strides,
                c_contiguous: flags & 0b01 != 0,
                f_contiguous: flags & 0b10 != 0,
            })
        }
        TAG_CONTROL => {
            let _session_id = cur.str16()?;
            let _timestamp_us = cur.u64()?;
            let payload = cur.bytes32()?;
            let msg: ControlMessage = serde_json::from_slice(payload)?;
            Ok(RuntimeData::Control(msg))
        }
        TAG_JSON => {
            let schema_tag = cur.str16()?;
            let payload = serde_json::from_slice(cur.bytes32()?)?;
            Ok(RuntimeData::Json {
                payload,
                schema_tag: (!schema_tag.is_empty()).then_some(schema_tag),
            })
        }
        TAG_BINARY => {
            let content_type = cur.str16()?;
            let bytes = cur.bytes32()?.to_vec();
            Ok(RuntimeData::Binary {
                bytes,
                content_type: (!content_type.is_empty()).then_some(content_type),
            })
        }
        other => Err(Error::InvalidData(format!("unknown wire tag {other}"))),
    }
}

fn put_str16(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::InvalidData(format!(
            "string of {} bytes exceeds u16 length prefix",
            bytes.len()
        )));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_bytes32(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u32::MAX as usize {
        return Err(Error::InvalidData(format!(
            "payload of {} bytes exceeds u32 length prefix",
            bytes.len()
        )));
    }
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked little-endian reader
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::InvalidData("truncated wire payload".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str16(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|e| Error::InvalidData(format!("string field is not UTF-8: {e}")))
    }

    fn bytes32(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
