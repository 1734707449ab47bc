//! Control plane: side-channel delivery, overtaking, cancellation effects

use mediagraph_runtime_core::data::{ControlMessage, RuntimeData};
use mediagraph_runtime_core::manifest::{Connection, Manifest, ManifestMetadata, NodeManifest};
use mediagraph_runtime_core::runner::PipelineRunner;
use mediagraph_runtime_core::transport::{StreamSession, TransportData};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn manifest(nodes: Vec<NodeManifest>, connections: Vec<(&str, &str)>) -> Arc<Manifest> {
    Arc::new(Manifest {
        version: "v1".to_string(),
        metadata: ManifestMetadata::default(),
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

fn streaming_node(id: &str, node_type: &str) -> NodeManifest {
    NodeManifest {
        id: id.to_string(),
        node_type: node_type.to_string(),
        is_streaming: true,
        ..Default::default()
    }
}

/// Buffers with timestamps inside a cancelled range are discarded by the
/// receiving node even when the data was sent before the cancel arrived
#[tokio::test]
async fn cancel_discards_covered_buffers() {
    let runner = PipelineRunner::new();
    let m = manifest(vec![streaming_node("echo", "Echo")], vec![]);
    let session = runner.create_stream_session(m).await.unwrap();

    // Cancel covers the inclusive range [100ms, 200ms]; deliver it first
    // so the node's state is armed
    let cancel = ControlMessage::cancel_speculation(session.session_id(), 100_000, 200_000);
    session
        .send_input(TransportData::new(RuntimeData::Control(cancel)))
        .await
        .unwrap();
    // Control fans out asynchronously; give it a beat
    tokio::time::sleep(Duration::from_millis(20)).await;

    let inside = RuntimeData::audio_f32(&[0.1; 160], 16_000, 1, "audio:0", 150_000);
    let at_end = RuntimeData::audio_f32(&[0.3; 160], 16_000, 1, "audio:0", 200_000);
    let outside = RuntimeData::audio_f32(&[0.2; 160], 16_000, 1, "audio:0", 300_000);
    session
        .send_input(TransportData::new(inside))
        .await
        .unwrap();
    // The range end is inclusive: a buffer exactly at 200 ms is covered
    session
        .send_input(TransportData::new(at_end))
        .await
        .unwrap();
    session
        .send_input(TransportData::new(outside.clone()))
        .await
        .unwrap();

    // Only the buffer outside the cancelled range survives
    let out = session.recv_output().await.unwrap().unwrap();
    assert_eq!(out.data, outside);
    session.close().await.unwrap();
}

/// Repeated cancels are idempotent: the same range twice has the same
/// effect as once
#[tokio::test]
async fn repeated_cancels_are_idempotent() {
    let runner = PipelineRunner::new();
    let m = manifest(vec![streaming_node("echo", "Echo")], vec![]);
    let session = runner.create_stream_session(m).await.unwrap();

    for _ in 0..3 {
        let cancel = ControlMessage::cancel_speculation(session.session_id(), 0, 50_000);
        session
            .send_input(TransportData::new(RuntimeData::Control(cancel)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let survivor = RuntimeData::audio_f32(&[0.3; 16], 16_000, 1, "audio:0", 60_000);
    session
        .send_input(TransportData::new(survivor.clone()))
        .await
        .unwrap();
    let out = session.recv_output().await.unwrap().unwrap();
    assert_eq!(out.data, survivor);
    session.close().await.unwrap();
}

/// A control message sent after a data item may be observed by the node
/// before that data item: the side channel legally overtakes data edges
#[tokio::test]
async fn control_overtakes_queued_data() {
    let runner = PipelineRunner::new();
    let m = manifest(vec![streaming_node("echo", "Echo")], vec![]);
    let session = runner.create_stream_session(m).await.unwrap();

    // Data first, then the cancel covering it. The data sits in bounded
    // queues; the cancel takes the broadcast plane and arrives first
    // often enough that at least one covered buffer is discarded across
    // iterations. Ordering between planes is explicitly unspecified, so
    // assert only on what must hold: every *surviving* output is the
    // uncancelled one.
    let covered = RuntimeData::audio_f32(&[0.1; 16], 16_000, 1, "audio:0", 10_000);
    let free = RuntimeData::audio_f32(&[0.2; 16], 16_000, 1, "audio:0", 900_000);
    let cancel = ControlMessage::cancel_speculation(session.session_id(), 0, 100_000);

    session
        .send_input(TransportData::new(covered))
        .await
        .unwrap();
    session
        .send_input(TransportData::new(RuntimeData::Control(cancel)))
        .await
        .unwrap();
    session
        .send_input(TransportData::new(free.clone()))
        .await
        .unwrap();
    session.finish_input();

    let mut survivors = Vec::new();
    loop {
        match session.recv_output().await {
            Ok(Some(out)) => survivors.push(out.data),
            Ok(None) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // The free buffer always survives; the covered one may or may not,
    // depending on which plane won the race
    assert!(survivors.contains(&free));
    assert!(survivors.len() <= 2);
}

/// Nodes without batch support ignore batch hints; the stream continues
/// undisturbed
#[tokio::test]
async fn batch_hint_is_advisory() {
    let runner = PipelineRunner::new();
    let m = manifest(vec![streaming_node("pass", "Passthrough")], vec![]);
    let session = runner.create_stream_session(m).await.unwrap();

    session
        .send_input(TransportData::new(RuntimeData::Control(
            ControlMessage::batch_hint(session.session_id(), 16),
        )))
        .await
        .unwrap();
    session
        .send_input(TransportData::new(RuntimeData::text("still flowing", "t")))
        .await
        .unwrap();

    let out = session.recv_output().await.unwrap().unwrap();
    assert_eq!(out.data, RuntimeData::text("still flowing", "t"));
    session.close().await.unwrap();
}

/// Control propagation across a multi-node pipeline is fast: a cancel
/// reaches the downstream node well inside the latency budget
#[tokio::test]
async fn cancel_propagates_quickly() {
    let runner = PipelineRunner::new();
    let m = manifest(
        vec![
            streaming_node("a", "Passthrough"),
            streaming_node("b", "Passthrough"),
            streaming_node("c", "Echo"),
        ],
        vec![("a.out", "b.in"), ("b.out", "c.in")],
    );
    let session = runner.create_stream_session(m).await.unwrap();

    let started = Instant::now();
    let cancel = ControlMessage::cancel_speculation(session.session_id(), 0, 1_000_000);
    session
        .send_input(TransportData::new(RuntimeData::Control(cancel)))
        .await
        .unwrap();

    // The covered buffer must be discarded by c once the cancel landed;
    // poll with fresh covered buffers until discard is observed
    let mut observed_discard = false;
    for i in 0..50u64 {
        let covered = RuntimeData::audio_f32(&[0.1; 16], 16_000, 1, "audio:0", 10_000 + i);
        let marker = RuntimeData::text(format!("m{i}"), "t");
        session
            .send_input(TransportData::new(covered))
            .await
            .unwrap();
        session
            .send_input(TransportData::new(marker.clone()))
            .await
            .unwrap();
        // If only the marker comes back, the audio was discarded
        let out = session.recv_output().await.unwrap().unwrap();
        if out.data == marker {
            observed_discard = true;
            break;
        }
        // Audio survived: cancel not yet applied; drain the marker too
        let out = session.recv_output().await.unwrap().unwrap();
        assert_eq!(out.data, marker);
    }
    assert!(observed_discard, "cancel never took effect downstream");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "cancel propagation took {:?}",
        started.elapsed()
    );
    session.close().await.unwrap();
}

/// A session-id mismatch is delivered with a warning, not dropped
#[tokio::test]
async fn mismatched_session_still_delivered() {
    let runner = PipelineRunner::new();
    let m = manifest(vec![streaming_node("echo", "Echo")], vec![]);
    let session = runner.create_stream_session(m).await.unwrap();

    let cancel = ControlMessage::cancel_speculation("some-other-session", 0, 100_000);
    session
        .send_input(TransportData::new(RuntimeData::Control(cancel)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The cancel was processed despite the mismatch: covered data is gone
    let covered = RuntimeData::audio_f32(&[0.1; 16], 16_000, 1, "audio:0", 50_000);
    let free = RuntimeData::text("after", "t");
    session
        .send_input(TransportData::new(covered))
        .await
        .unwrap();
    session
        .send_input(TransportData::new(free.clone()))
        .await
        .unwrap();
    let out = session.recv_output().await.unwrap().unwrap();
    assert_eq!(out.data, free);
    session.close().await.unwrap();
}
