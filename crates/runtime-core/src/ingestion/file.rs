//! File and stdin ingestion
//!
//! WAV files decode into timestamped audio chunks on track `audio:0`;
//! everything else (including stdin) is produced as `Binary` chunks. The
//! producer task blocks on the stream's bounded channel, so a slow
//! pipeline naturally pauses file reading.

use super::{IngestConfig, IngestMetadata, IngestPlugin, IngestSource, IngestStatus, IngestStream, MediaType, TrackInfo};
use crate::data::RuntimeData;
use crate::Error;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Channel capacity between the reader task and the pipeline
const STREAM_CAPACITY: usize = 32;

/// Built-in plugin for `file://`, bare paths, and stdin
pub struct FileIngestPlugin;

impl IngestPlugin for FileIngestPlugin {
    fn name(&self) -> &'static str {
        "file"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["file", "", "-"]
    }

    fn create(&self, config: &IngestConfig) -> Result<Box<dyn IngestSource>, Error> {
        Ok(Box::new(FileIngestSource::new(config)))
    }

    fn validate(&self, config: &IngestConfig) -> Result<(), Error> {
        if config.url == "-" {
            return Ok(());
        }
        let path = url_to_path(&config.url);
        if !path.exists() {
            return Err(Error::Ingestion(format!(
                "file not found: {}",
                path.display()
            )));
        }
        Ok(())
    }
}

/// Strip a `file://` prefix down to a filesystem path
pub fn url_to_path(url: &str) -> PathBuf {
    match url.strip_prefix("file://") {
        Some(rest) => PathBuf::from(rest),
        None => PathBuf::from(url),
    }
}

/// Source produced by [`FileIngestPlugin`]
pub struct FileIngestSource {
    config: IngestConfig,
    status: IngestStatus,
    metadata: Option<IngestMetadata>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl FileIngestSource {
    fn new(config: &IngestConfig) -> Self {
        Self {
            config: config.clone(),
            status: IngestStatus::Idle,
            metadata: None,
            reader_task: None,
        }
    }
}

#[async_trait]
impl IngestSource for FileIngestSource {
    async fn start(&mut self) -> Result<IngestStream, Error> {
        self.status = IngestStatus::Connecting;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

        if self.config.url == "-" {
            self.metadata = Some(IngestMetadata {
                tracks: vec![TrackInfo {
                    stream_id: "binary:0".to_string(),
                    media: MediaType::Data,
                    sample_rate_hz: None,
                    channels: None,
                }],
                duration_us: None,
            });
            let chunk_bytes = self.config.chunk_bytes;
            self.reader_task = Some(tokio::spawn(async move {
                let mut stdin = tokio::io::stdin();
                loop {
                    let mut buf = vec![0u8; chunk_bytes];
                    match stdin.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            buf.truncate(n);
                            let chunk = RuntimeData::Binary {
                                bytes: buf,
                                content_type: None,
                            };
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "stdin read failed");
                            break;
                        }
                    }
                }
            }));
            self.status = IngestStatus::Connected;
            return Ok(IngestStream::new(rx));
        }

        let path = url_to_path(&self.config.url);
        if is_wav(&path) {
            let (metadata, task) = start_wav_reader(path, self.config.clone(), tx)?;
            self.metadata = Some(metadata);
            self.reader_task = Some(task);
        } else {
            self.metadata = Some(IngestMetadata {
                tracks: vec![TrackInfo {
                    stream_id: "binary:0".to_string(),
                    media: MediaType::Data,
                    sample_rate_hz: None,
                    channels: None,
                }],
                duration_us: None,
            });
            let chunk_bytes = self.config.chunk_bytes;
            self.reader_task = Some(tokio::spawn(async move {
                let mut file = match tokio::fs::File::open(&path).await {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "open failed");
                        return;
                    }
                };
                loop {
                    let mut buf = vec![0u8; chunk_bytes];
                    match file.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            buf.truncate(n);
                            let chunk = RuntimeData::Binary {
                                bytes: buf,
                                content_type: None,
                            };
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "file read failed");
                            break;
                        }
                    }
                }
            }));
        }

        self.status = IngestStatus::Connected;
        Ok(IngestStream::new(rx))
    }

    async fn stop(&mut self) -> Result<(), Error> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.status = IngestStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> IngestStatus {
        self.status
    }

    fn metadata(&self) -> Option<&IngestMetadata> {
        self.metadata.as_ref()
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Decode a WAV file into timestamped f32 audio chunks on `audio:0`
fn start_wav_reader(
    path: PathBuf,
    config: IngestConfig,
    tx: mpsc::Sender<RuntimeData>,
) -> Result<(IngestMetadata, tokio::task::JoinHandle<()>), Error> {
    let reader = hound::WavReader::open(&path)
        .map_err(|e| Error::Ingestion(format!("cannot open {}: {e}", path.display())))?;
    let spec = reader.spec();
    let total_frames = reader.duration() as u64;
    let duration_us = total_frames * 1_000_000 / spec.sample_rate as u64;

    let metadata = IngestMetadata {
        tracks: vec![TrackInfo {
            stream_id: "audio:0".to_string(),
            media: MediaType::Audio,
            sample_rate_hz: Some(spec.sample_rate),
            channels: Some(spec.channels),
        }],
        duration_us: Some(duration_us),
    };

    if !config.track_selection.selects("audio:0") {
        // Nothing selected: produce an empty stream
        drop(tx);
        return Ok((metadata, tokio::spawn(async {})));
    }

    let task = tokio::spawn(async move {
        // hound is synchronous; decode off the async threads and forward
        // in bounded chunks
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<RuntimeData>(4);
        let decode = tokio::task::spawn_blocking(move || {
            let mut reader = match hound::WavReader::open(&path) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "wav reopen failed");
                    return;
                }
            };
            let spec = reader.spec();
            let frames_per_chunk =
                (spec.sample_rate as u64 * config.chunk_ms / 1000).max(1) as usize;
            let samples_per_chunk = frames_per_chunk * spec.channels as usize;

            let mut buffer: Vec<f32> = Vec::with_capacity(samples_per_chunk);
            let mut frame_cursor = 0u64;
            let mut emit = |buffer: &mut Vec<f32>, frame_cursor: &mut u64| -> bool {
                if buffer.is_empty() {
                    return true;
                }
                let frames = buffer.len() / spec.channels as usize;
                let timestamp_us = *frame_cursor * 1_000_000 / spec.sample_rate as u64;
                let chunk = RuntimeData::audio_f32(
                    buffer,
                    spec.sample_rate,
                    spec.channels,
                    "audio:0",
                    timestamp_us,
                );
                *frame_cursor += frames as u64;
                buffer.clear();
                chunk_tx.blocking_send(chunk).is_ok()
            };

            let mut push = |sample: f32, buffer: &mut Vec<f32>, cursor: &mut u64| -> bool {
                buffer.push(sample);
                if buffer.len() >= samples_per_chunk {
                    return emit(buffer, cursor);
                }
                true
            };

            match spec.sample_format {
                hound::SampleFormat::Float => {
                    for sample in reader.samples::<f32>() {
                        match sample {
                            Ok(s) => {
                                if !push(s, &mut buffer, &mut frame_cursor) {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "wav decode failed");
                                return;
                            }
                        }
                    }
                }
                hound::SampleFormat::Int => {
                    let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                    for sample in reader.samples::<i32>() {
                        match sample {
                            Ok(s) => {
                                if !push(s as f32 / scale, &mut buffer, &mut frame_cursor) {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "wav decode failed");
                                return;
                            }
                        }
                    }
                }
            }
            let _ = emit(&mut buffer, &mut frame_cursor);
        });

        while let Some(chunk) = chunk_rx.recv().await {
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
        let _ = decode.await;
    });

    Ok((metadata, task))
}
