//! Unary execution end to end: single nodes, chains, and build rejection

use mediagraph_runtime_core::data::RuntimeData;
use mediagraph_runtime_core::manifest::{Connection, Manifest, ManifestMetadata, NodeManifest};
use mediagraph_runtime_core::runner::PipelineRunner;
use mediagraph_runtime_core::transport::TransportData;
use mediagraph_runtime_core::Error;
use std::sync::Arc;

fn manifest(nodes: Vec<NodeManifest>, connections: Vec<(&str, &str)>) -> Arc<Manifest> {
    Arc::new(Manifest {
        version: "v1".to_string(),
        metadata: ManifestMetadata {
            name: "test".to_string(),
            ..Default::default()
        },
        nodes,
        connections: connections
            .into_iter()
            .map(|(from, to)| Connection {
                from: from.to_string(),
                to: to.to_string(),
            })
            .collect(),
    })
}

fn node(id: &str, node_type: &str, params: serde_json::Value) -> NodeManifest {
    NodeManifest {
        id: id.to_string(),
        node_type: node_type.to_string(),
        params,
        ..Default::default()
    }
}

fn sine_48k_1s() -> Vec<f32> {
    (0..48_000)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
        .collect()
}

/// Single Echo node: Text("hello") in, Text("hello") out, exactly
#[tokio::test]
async fn unary_echo_exact() {
    let runner = PipelineRunner::new();
    let m = manifest(vec![node("echo", "Echo", serde_json::json!({}))], vec![]);
    let out = runner
        .execute_unary(m, TransportData::new(RuntimeData::text("hello", "t")))
        .await
        .unwrap();
    assert_eq!(out.data, RuntimeData::text("hello", "t"));
}

/// src(passthrough) -> AudioResample(16k) -> sink(passthrough): one input
/// second of 48 kHz mono becomes exactly one 16000-sample f32 buffer
#[tokio::test]
async fn unary_resample_chain() {
    let runner = PipelineRunner::new();
    let m = manifest(
        vec![
            node("src", "Passthrough", serde_json::json!({})),
            node(
                "resample",
                "AudioResample",
                serde_json::json!({"target_rate": 16000}),
            ),
            node("sink", "Passthrough", serde_json::json!({})),
        ],
        vec![("src.out", "resample.in"), ("resample.out", "sink.in")],
    );

    let input = RuntimeData::audio_f32(&sine_48k_1s(), 48_000, 1, "audio:0", 0);
    let out = runner
        .execute_unary(m, TransportData::new(input))
        .await
        .unwrap();

    match out.data {
        RuntimeData::Audio {
            samples,
            sample_rate_hz,
            channels,
            ..
        } => {
            assert_eq!(sample_rate_hz, 16_000);
            assert_eq!(channels, 1);
            assert_eq!(samples.len() / 4, 16_000);
        }
        other => panic!("expected audio, got {}", other.data_type()),
    }
}

/// Fan-out then fan-in: the diamond delivers both branches' outputs
#[tokio::test]
async fn unary_diamond_collects_both_branches() {
    let runner = PipelineRunner::new();
    let m = manifest(
        vec![
            node("a", "Passthrough", serde_json::json!({})),
            node("b", "Passthrough", serde_json::json!({})),
            node("c", "Passthrough", serde_json::json!({})),
            node("d", "Passthrough", serde_json::json!({})),
        ],
        vec![
            ("a.out", "b.in"),
            ("a.out", "c.in"),
            ("b.out", "d.in"),
            ("c.out", "d.in"),
        ],
    );
    // d receives the item once per branch; the first is returned, and the
    // run completes without error
    let out = runner
        .execute_unary(m, TransportData::new(RuntimeData::text("x", "t")))
        .await
        .unwrap();
    assert_eq!(out.data, RuntimeData::text("x", "t"));
}

/// Manifest with A.out -> B.in, B.out -> A.in must be rejected with a
/// cycle witness naming both nodes
#[tokio::test]
async fn cycle_rejected_with_witness() {
    let runner = PipelineRunner::new();
    let m = manifest(
        vec![
            node("A", "Passthrough", serde_json::json!({})),
            node("B", "Passthrough", serde_json::json!({})),
        ],
        vec![("A.out", "B.in"), ("B.out", "A.in")],
    );
    let err = runner
        .execute_unary(m, TransportData::new(RuntimeData::text("x", "t")))
        .await
        .unwrap_err();
    match err {
        Error::Cycle { nodes } => {
            assert_eq!(nodes.len(), 2);
            assert!(nodes.contains(&"A".to_string()));
            assert!(nodes.contains(&"B".to_string()));
        }
        other => panic!("expected Cycle, got {other:?}"),
    }
}

/// Dangling connections and unknown node types are build-time failures
#[tokio::test]
async fn build_errors_are_fatal() {
    let runner = PipelineRunner::new();

    let m = manifest(
        vec![node("a", "Passthrough", serde_json::json!({}))],
        vec![("a.out", "ghost.in")],
    );
    assert!(matches!(
        runner
            .execute_unary(m, TransportData::new(RuntimeData::text("x", "t")))
            .await
            .unwrap_err(),
        Error::DanglingEdge { .. }
    ));

    let m = manifest(vec![node("a", "Quantizer9000", serde_json::json!({}))], vec![]);
    assert!(matches!(
        runner
            .execute_unary(m, TransportData::new(RuntimeData::text("x", "t")))
            .await
            .unwrap_err(),
        Error::UnknownNodeType { .. }
    ));
}

/// Declared port types are checked at build: a text producer cannot feed
/// an audio consumer
#[tokio::test]
async fn port_type_mismatch_at_build() {
    let runner = PipelineRunner::new();
    let m = manifest(
        vec![
            node("collect", "TextCollector", serde_json::json!({})),
            node(
                "resample",
                "AudioResample",
                serde_json::json!({"target_rate": 16000}),
            ),
        ],
        vec![("collect.out", "resample.in")],
    );
    let err = runner.validate(&m).unwrap_err();
    assert!(matches!(err, Error::PortTypeMismatch { .. }), "{err}");
}

/// i16 input converts, resamples, and returns f32
#[tokio::test]
async fn unary_format_convert_then_resample() {
    let runner = PipelineRunner::new();
    let m = manifest(
        vec![
            node(
                "convert",
                "AudioFormatConvert",
                serde_json::json!({"target_format": "f32"}),
            ),
            node(
                "resample",
                "AudioResample",
                serde_json::json!({"target_rate": 8000}),
            ),
        ],
        vec![("convert.out", "resample.in")],
    );

    let samples: Vec<i16> = (0..16_000)
        .map(|i| ((2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin() * 16384.0) as i16)
        .collect();
    let input = RuntimeData::audio_i16(&samples, 16_000, 1, "audio:0", 0);
    let out = runner
        .execute_unary(m, TransportData::new(input))
        .await
        .unwrap();
    match out.data {
        RuntimeData::Audio {
            samples,
            sample_rate_hz,
            format,
            ..
        } => {
            assert_eq!(sample_rate_hz, 8_000);
            assert_eq!(format, mediagraph_runtime_core::data::SampleFormat::F32);
            assert_eq!(samples.len() / 4, 8_000);
        }
        other => panic!("expected audio, got {}", other.data_type()),
    }
}
