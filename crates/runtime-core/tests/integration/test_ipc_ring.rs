//! Shared-memory channel integration: volume, backpressure, teardown
#![cfg(unix)]

use mediagraph_runtime_core::data::{ControlMessage, RuntimeData};
use mediagraph_runtime_core::ipc::{HostIpcChannel, IpcConfig, WorkerIpcChannel};
use std::time::{Duration, Instant};

fn config() -> IpcConfig {
    IpcConfig {
        max_payload: 256 * 1024,
        data_slots: 4,
        control_payload: 4 * 1024,
        control_slots: 16,
    }
}

/// Push a few thousand audio buffers through both data rings from
/// separate threads; order and content must survive
#[test]
fn high_volume_bidirectional_traffic() {
    let host = HostIpcChannel::create("it-volume", &config()).unwrap();
    let worker = WorkerIpcChannel::attach(host.shm_name()).unwrap();

    let count = 2_000u32;
    std::thread::scope(|scope| {
        // Worker: echo every input back with its payload intact
        scope.spawn(|| {
            let mut received = 0u32;
            while let Some(item) = worker.recv_data(None).unwrap() {
                worker.send_data(&item, None).unwrap();
                received += 1;
                if received == count {
                    break;
                }
            }
        });

        // Host: keep a few items in flight, verify the echo in order
        scope.spawn(|| {
            let mut pending = 0usize;
            let mut next_send = 0u32;
            let mut next_recv = 0u32;
            while next_recv < count {
                while next_send < count && pending < 3 {
                    let item = RuntimeData::audio_f32(
                        &[next_send as f32; 64],
                        16_000,
                        1,
                        "audio:0",
                        next_send as u64,
                    );
                    host.send_data(&item, None).unwrap();
                    next_send += 1;
                    pending += 1;
                }
                let got = host.recv_data(None).unwrap().expect("echo open");
                assert_eq!(got.timestamp_us(), Some(next_recv as u64));
                next_recv += 1;
                pending -= 1;
            }
        });
    });
}

/// The data ring blocks a producer at capacity until the consumer drains
#[test]
fn data_ring_backpressure() {
    let host = HostIpcChannel::create("it-backpressure", &config()).unwrap();
    let worker = WorkerIpcChannel::attach(host.shm_name()).unwrap();

    let item = RuntimeData::Binary {
        bytes: vec![1u8; 1024],
        content_type: None,
    };
    for _ in 0..4 {
        host.send_data(&item, None).unwrap();
    }
    // Fifth send blocks until the deadline
    let deadline = Some(Instant::now() + Duration::from_millis(30));
    assert!(host.send_data(&item, deadline).is_err());

    // Draining one slot unblocks exactly one more send
    worker.recv_data(None).unwrap().unwrap();
    host.send_data(&item, Some(Instant::now() + Duration::from_millis(200)))
        .unwrap();
}

/// Control messages keep flowing while the data ring is saturated
#[test]
fn control_immune_to_data_backpressure() {
    let host = HostIpcChannel::create("it-control", &config()).unwrap();
    let worker = WorkerIpcChannel::attach(host.shm_name()).unwrap();

    let big = RuntimeData::Binary {
        bytes: vec![0u8; 128 * 1024],
        content_type: None,
    };
    for _ in 0..4 {
        host.send_data(&big, None).unwrap();
    }

    let started = Instant::now();
    for i in 0..8u64 {
        let cancel = ControlMessage::cancel_speculation("s", i * 10, i * 10 + 5);
        host.send_control(&cancel, Some(Instant::now() + Duration::from_millis(100)))
            .unwrap();
    }
    let directives = worker.poll_directives().unwrap();
    assert_eq!(directives.len(), 8);
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "control delivery stalled behind data"
    );
}

/// Worker-to-host lifecycle frames arrive interleaved with node control
#[test]
fn worker_events_interleave() {
    let host = HostIpcChannel::create("it-events", &config()).unwrap();
    let worker = WorkerIpcChannel::attach(host.shm_name()).unwrap();

    worker.send_heartbeat().unwrap();
    worker
        .send_control(&ControlMessage::batch_hint("s", 4))
        .unwrap();
    worker.send_heartbeat().unwrap();

    let events = host.poll_events().unwrap();
    assert_eq!(events.len(), 3);
    assert!(matches!(
        events[1],
        mediagraph_runtime_core::ipc::WorkerEvent::Control(_)
    ));
}

/// Dropping the host channel unlinks the segment: no shared-memory leak
#[test]
fn segment_removed_on_drop() {
    let name;
    {
        let host = HostIpcChannel::create("it-teardown", &config()).unwrap();
        name = host.shm_name().to_string();
        assert!(WorkerIpcChannel::attach(&name).is_ok());
    }
    assert!(
        WorkerIpcChannel::attach(&name).is_err(),
        "segment {name} must be unlinked when the host drops"
    );
}

/// Numpy layout survives the wire across the ring byte-for-byte
#[test]
fn numpy_roundtrip_through_rings() {
    let host = HostIpcChannel::create("it-numpy", &config()).unwrap();
    let worker = WorkerIpcChannel::attach(host.shm_name()).unwrap();

    let array = RuntimeData::Numpy {
        data: (0..96u8).collect(),
        shape: vec![4, 2, 3],
        dtype: "float32".into(),
        strides: vec![24, 12, 4],
        c_contiguous: true,
        f_contiguous: false,
    };
    host.send_data(&array, None).unwrap();
    let got = worker.recv_data(None).unwrap().unwrap();
    assert_eq!(got, array);
}
