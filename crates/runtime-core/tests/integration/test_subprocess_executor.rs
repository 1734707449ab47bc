//! Subprocess executor against the real pipeline-worker binary
#![cfg(unix)]

use mediagraph_runtime_core::data::RuntimeData;
use mediagraph_runtime_core::executor::subprocess::{SubprocessConfig, SubprocessExecutor};
use mediagraph_runtime_core::ipc::IpcConfig;
use mediagraph_runtime_core::manifest::{ExecutionHint, Manifest, ManifestMetadata, NodeManifest};
use mediagraph_runtime_core::nodes::{NodeExecutor, SessionContext};
use mediagraph_runtime_core::runner::{PipelineRunner, RunnerConfig};
use mediagraph_runtime_core::transport::TransportData;
use mediagraph_runtime_core::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pipeline-worker"))
}

fn worker_config(node_type: &str) -> (NodeManifest, SubprocessConfig) {
    let spec = NodeManifest {
        id: format!("{node_type}-sub"),
        node_type: node_type.to_string(),
        execution_hint: ExecutionHint::Subprocess,
        ..Default::default()
    };
    let config = SubprocessConfig {
        command: vec![worker_bin().to_string_lossy().into_owned()],
        ipc: IpcConfig {
            max_payload: 1024 * 1024,
            data_slots: 8,
            control_payload: 64 * 1024,
            control_slots: 32,
        },
        ready_timeout: Duration::from_secs(15),
        grace: Duration::from_secs(2),
    };
    (spec, config)
}

fn shm_leftovers(session: &str) -> Vec<String> {
    // Segment names are scoped by pid and session, so parallel tests in
    // this binary do not see each other's live segments
    let prefix = format!("mediagraph-{}-{}", std::process::id(), session);
    std::fs::read_dir("/dev/shm")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(&prefix))
                .collect()
        })
        .unwrap_or_default()
}

/// Echo through a real worker process: spawn, READY, process, clean exit
#[tokio::test]
async fn unary_echo_through_worker() {
    let (spec, config) = worker_config("Echo");
    let mut executor = SubprocessExecutor::new(&spec, config);
    let ctx = SessionContext::new("sub-unary");

    executor.initialize(&ctx).await.unwrap();
    let out = executor
        .process_unary(RuntimeData::text("over the wall", "t"))
        .await
        .unwrap();
    assert_eq!(out, vec![RuntimeData::text("over the wall", "t")]);

    // Audio survives the wire format both ways
    let audio = RuntimeData::audio_f32(&[0.5, -0.5, 0.25], 48_000, 1, "audio:0", 77);
    let out = executor.process_unary(audio.clone()).await.unwrap();
    assert_eq!(out, vec![audio]);

    executor.cleanup().await.unwrap();
    assert!(
        shm_leftovers("sub-unary").is_empty(),
        "leaked segments: {:?}",
        shm_leftovers("sub-unary")
    );
}

/// Resample inside the worker: the node's semantics are identical to the
/// in-process path
#[tokio::test]
async fn resample_through_worker() {
    let (mut spec, config) = worker_config("AudioResample");
    spec.params = serde_json::json!({"target_rate": 16000});
    let mut executor = SubprocessExecutor::new(&spec, config);
    let ctx = SessionContext::new("sub-resample");

    executor.initialize(&ctx).await.unwrap();
    let samples: Vec<f32> = (0..48_000)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
        .collect();
    let out = executor
        .process_unary(RuntimeData::audio_f32(&samples, 48_000, 1, "audio:0", 0))
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].item_count(), 16_000);
    executor.cleanup().await.unwrap();
}

/// Streaming through the worker rings
#[tokio::test]
async fn streaming_through_worker() {
    let (spec, config) = worker_config("Passthrough");
    let mut executor = SubprocessExecutor::new(&spec, config);
    let ctx = SessionContext::new("sub-stream");

    executor.initialize(&ctx).await.unwrap();
    let mut handle = executor.open_stream(&ctx).await.unwrap();

    for i in 0..20u32 {
        handle
            .send(RuntimeData::text(i.to_string(), "t"))
            .await
            .unwrap();
    }
    for i in 0..20u32 {
        let out = handle.recv().await.unwrap().expect("stream open");
        assert_eq!(out, RuntimeData::text(i.to_string(), "t"));
    }

    handle.close();
    assert_eq!(handle.recv().await.unwrap(), None);
    executor.cleanup().await.unwrap();
}

/// Control emitted by the worker's node arrives at the host through the
/// control ring, surfaced by the stream handle as a Control output
#[tokio::test]
async fn worker_emitted_control_uses_control_ring() {
    let (mut spec, config) = worker_config("EnergyVad");
    spec.params = serde_json::json!({"speculative": true, "min_silence_ms": 100});
    let mut executor = SubprocessExecutor::new(&spec, config);
    let ctx = SessionContext::new("sub-spec");

    executor.initialize(&ctx).await.unwrap();
    let mut handle = executor.open_stream(&ctx).await.unwrap();

    // Half a second of silence: the speculative VAD in the worker emits a
    // cancel covering it
    handle
        .send(RuntimeData::audio_f32(&vec![0.0; 8_000], 16_000, 1, "audio:0", 0))
        .await
        .unwrap();

    let mut saw_cancel = false;
    let mut saw_audio = false;
    for _ in 0..10 {
        match handle.recv().await.unwrap() {
            Some(RuntimeData::Control(msg)) => {
                assert!(msg.is_cancellation());
                assert!(msg.cancels_timestamp(250_000));
                assert_eq!(msg.session_id, "sub-spec");
                saw_cancel = true;
            }
            Some(RuntimeData::Audio { .. }) => saw_audio = true,
            Some(other) => panic!("unexpected output: {}", other.data_type()),
            None => break,
        }
        if saw_cancel && saw_audio {
            break;
        }
    }
    assert!(saw_cancel, "cancel must cross on the control ring");
    assert!(saw_audio, "audio still passes through on the data ring");

    handle.close();
    executor.cleanup().await.unwrap();
}

/// In unary mode, worker-emitted control is drained off the control ring
/// and returned alongside the data outputs
#[tokio::test]
async fn worker_emitted_control_in_unary_mode() {
    let (mut spec, config) = worker_config("EnergyVad");
    spec.params = serde_json::json!({"speculative": true, "min_silence_ms": 100});
    let mut executor = SubprocessExecutor::new(&spec, config);
    let ctx = SessionContext::new("sub-spec-unary");

    executor.initialize(&ctx).await.unwrap();
    let outputs = executor
        .process_unary(RuntimeData::audio_f32(&vec![0.0; 8_000], 16_000, 1, "audio:0", 0))
        .await
        .unwrap();

    // The control ring races the data ring; a cancel may land just after
    // the batch completes
    if !outputs.iter().any(|d| d.is_control()) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !executor.take_emitted_control().is_empty(),
            "expected a cancel for the silent span"
        );
    }

    executor.cleanup().await.unwrap();
}

/// Killing the worker mid-stream is a fatal, non-retryable node error,
/// and no shared-memory segments leak
#[tokio::test]
async fn worker_kill_is_fatal_and_leak_free() {
    let (spec, config) = worker_config("Passthrough");
    let mut executor = SubprocessExecutor::new(&spec, config);
    let ctx = SessionContext::new("sub-kill");

    executor.initialize(&ctx).await.unwrap();
    let mut handle = executor.open_stream(&ctx).await.unwrap();
    handle.send(RuntimeData::text("one", "t")).await.unwrap();
    assert!(handle.recv().await.unwrap().is_some());

    // Hard-kill the worker out from under the executor
    let pid = executor.worker_pid().await.expect("worker running");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    // The health monitor flags the loss within a few heartbeat periods
    let err = loop {
        match handle.recv().await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("expected a node error, got clean end-of-stream"),
            Err(e) => break e,
        }
    };
    match err {
        Error::NodeProcess {
            node_id, retryable, ..
        } => {
            assert_eq!(node_id, "Passthrough-sub");
            assert!(!retryable, "worker loss must not be retryable");
        }
        other => panic!("expected NodeProcess, got {other:?}"),
    }

    executor.cleanup().await.unwrap();
    assert!(
        shm_leftovers("sub-kill").is_empty(),
        "leaked segments after kill: {:?}",
        shm_leftovers("sub-kill")
    );
}

/// The runner drives a subprocess-hinted node transparently
#[tokio::test]
async fn runner_unary_with_subprocess_hint() {
    let config = RunnerConfig {
        worker_bin: Some(worker_bin()),
        ..Default::default()
    };
    let runner = PipelineRunner::with_registry(
        Arc::new(mediagraph_runtime_core::nodes::registry::default_registry()),
        config,
    );
    let manifest = Arc::new(Manifest {
        version: "v1".into(),
        metadata: ManifestMetadata::default(),
        nodes: vec![NodeManifest {
            id: "echo".into(),
            node_type: "Echo".into(),
            execution_hint: ExecutionHint::Subprocess,
            ..Default::default()
        }],
        connections: vec![],
    });

    let out = runner
        .execute_unary(
            manifest,
            TransportData::new(RuntimeData::text("cross-process", "t")),
        )
        .await
        .unwrap();
    assert_eq!(out.data, RuntimeData::text("cross-process", "t"));
    assert!(shm_leftovers("unary-").is_empty());
}

/// A worker that cannot spawn fails initialization without leaking
#[tokio::test]
async fn spawn_failure_is_node_init_error() {
    let (spec, mut config) = worker_config("Echo");
    config.command = vec!["/no/such/worker/binary".to_string()];
    let mut executor = SubprocessExecutor::new(&spec, config);
    let err = executor
        .initialize(&SessionContext::new("sub-nospawn"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NodeInit { .. }));
    executor.cleanup().await.unwrap();
    assert!(shm_leftovers("sub-nospawn").is_empty());
}
