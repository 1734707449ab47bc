//! Ingestion driving a pipeline: file source through the runner

use mediagraph_runtime_core::data::RuntimeData;
use mediagraph_runtime_core::ingestion::{
    global_ingest_registry, IngestConfig, IngestStatus, TrackSelection,
};
use mediagraph_runtime_core::manifest::{Connection, Manifest, ManifestMetadata, NodeManifest};
use mediagraph_runtime_core::runner::PipelineRunner;
use mediagraph_runtime_core::transport::{StreamSession, TransportData};
use std::path::Path;
use std::sync::Arc;

fn write_wav(path: &Path, rate: u32, samples: &[f32]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
}

fn sine(rate: u32, seconds: f32) -> Vec<f32> {
    let n = (rate as f32 * seconds) as usize;
    (0..n)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
        .collect()
}

/// Audio resample chain fed from a real file: a 1-second 48 kHz WAV comes
/// out of the pipeline as exactly 16000 samples of 16 kHz audio
#[tokio::test]
async fn wav_ingest_resample_chain() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("sample_48k.wav");
    write_wav(&wav, 48_000, &sine(48_000, 1.0));

    // Open the source through the registry like a host CLI would
    let config = IngestConfig::from_url(wav.to_str().unwrap());
    let mut source = global_ingest_registry().create_from_uri(&config).unwrap();
    let mut stream = source.start().await.unwrap();
    assert_eq!(source.status(), IngestStatus::Connected);

    let runner = PipelineRunner::new();
    let manifest = Arc::new(Manifest {
        version: "v1".into(),
        metadata: ManifestMetadata {
            name: "resample-chain".into(),
            ..Default::default()
        },
        nodes: vec![
            NodeManifest {
                id: "resample".into(),
                node_type: "AudioResample".into(),
                params: serde_json::json!({"target_rate": 16000}),
                ..Default::default()
            },
            NodeManifest {
                id: "sink".into(),
                node_type: "Passthrough".into(),
                ..Default::default()
            },
        ],
        connections: vec![Connection {
            from: "resample.out".into(),
            to: "sink.in".into(),
        }],
    });

    let session = runner.create_stream_session(manifest).await.unwrap();

    // Feed the ingest stream into the session; natural recv blocking is
    // the backpressure path
    while let Some(chunk) = stream.recv().await {
        session.send_input(TransportData::new(chunk)).await.unwrap();
    }
    source.stop().await.unwrap();
    session.finish_input();

    let mut total_samples = 0usize;
    let mut rates = Vec::new();
    loop {
        match session.recv_output().await {
            Ok(Some(out)) => match out.data {
                RuntimeData::Audio {
                    ref samples,
                    sample_rate_hz,
                    ..
                } => {
                    rates.push(sample_rate_hz);
                    total_samples += samples.len() / 4;
                }
                ref other => panic!("expected audio, got {}", other.data_type()),
            },
            Ok(None) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(rates.iter().all(|&r| r == 16_000));
    assert_eq!(total_samples, 16_000, "1 s at 16 kHz end to end");
}

/// Track selection excludes tracks the policy does not name
#[tokio::test]
async fn track_selection_filters_audio() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    write_wav(&wav, 16_000, &sine(16_000, 0.2));

    let config = IngestConfig::from_url(wav.to_str().unwrap())
        .with_tracks(TrackSelection::Specific(vec!["audio:7".into()]));
    let mut source = global_ingest_registry().create_from_uri(&config).unwrap();
    let stream = source.start().await.unwrap();

    // audio:0 is not selected, so the stream is empty
    assert!(stream.collect().await.is_empty());
}

/// Protocol URIs without a registered plugin are rejected; file URIs are
/// always accepted
#[tokio::test]
async fn live_protocols_require_registration() {
    let registry = global_ingest_registry();
    for uri in ["rtmp://host/live", "rtsp://host/cam", "udp://0.0.0.0:5000", "srt://host:4000"] {
        let err = match registry.create_from_uri(&IngestConfig::from_url(uri)) {
            Err(e) => e,
            Ok(_) => panic!("expected {uri} to be rejected"),
        };
        assert!(
            err.to_string().contains("no ingest plugin"),
            "{uri}: {err}"
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ok.bin");
    std::fs::write(&file, b"data").unwrap();
    let uri = format!("file://{}", file.display());
    assert!(registry.create_from_uri(&IngestConfig::from_url(uri)).is_ok());
}

/// Binary files stream through a passthrough pipeline unchanged
#[tokio::test]
async fn binary_ingest_through_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("blob.bin");
    let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, &payload).unwrap();

    let mut config = IngestConfig::from_url(file.to_str().unwrap());
    config.chunk_bytes = 64 * 1024;
    let mut source = global_ingest_registry().create_from_uri(&config).unwrap();
    let mut stream = source.start().await.unwrap();

    let runner = PipelineRunner::new();
    let manifest = Arc::new(Manifest {
        version: "v1".into(),
        metadata: ManifestMetadata::default(),
        nodes: vec![NodeManifest {
            id: "pass".into(),
            node_type: "Passthrough".into(),
            ..Default::default()
        }],
        connections: vec![],
    });
    let session = runner.create_stream_session(manifest).await.unwrap();

    while let Some(chunk) = stream.recv().await {
        session.send_input(TransportData::new(chunk)).await.unwrap();
    }
    session.finish_input();

    let mut reassembled = Vec::new();
    loop {
        match session.recv_output().await {
            Ok(Some(out)) => match out.data {
                RuntimeData::Binary { bytes, .. } => reassembled.extend(bytes),
                other => panic!("expected binary, got {}", other.data_type()),
            },
            Ok(None) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(reassembled, payload);
}
