//! Host/worker IPC channel
//!
//! One shared-memory segment carries four SPSC rings:
//!
//! | ring | producer | consumer | payload |
//! |---|---|---|---|
//! | data in | host | worker | wire-encoded RuntimeData |
//! | data out | worker | host | wire-encoded RuntimeData |
//! | control in | host | worker | control + lifecycle frames |
//! | control out | worker | host | control + lifecycle frames |
//!
//! Control rings carry wire frames (tag 5) plus reserved lifecycle tags
//! that never leave this layer: READY, HEARTBEAT, SHUTDOWN. Keeping control
//! separate guarantees a cancel is not head-of-line blocked behind a large
//! media payload sitting in a data slot.

use super::ring::{self, ring_region_size, RingConsumer, RingProducer};
use super::shm::ShmSegment;
use crate::data::{wire, ControlMessage, RuntimeData};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle frame: worker finished initialization
pub const FRAME_READY: u8 = 0xF0;
/// Lifecycle frame: worker liveness beacon
pub const FRAME_HEARTBEAT: u8 = 0xF1;
/// Lifecycle frame: host requests graceful worker shutdown
pub const FRAME_SHUTDOWN: u8 = 0xF2;
/// Data-ring frame: worker finished all outputs for one input
pub const FRAME_BATCH_END: u8 = 0xF3;

/// Environment variable naming the segment for a spawned worker
pub const ENV_SHM_NAME: &str = "MEDIAGRAPH_IPC_SHM";

/// Ring sizing for one channel
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Largest data payload a slot can hold (default 8 MiB)
    pub max_payload: usize,
    /// Data ring slot count
    pub data_slots: u32,
    /// Largest control payload (default 64 KiB)
    pub control_payload: usize,
    /// Control ring slot count
    pub control_slots: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_payload: 8 * 1024 * 1024,
            data_slots: 8,
            control_payload: 64 * 1024,
            control_slots: 32,
        }
    }
}

/// Fixed header at offset 0 describing ring geometry for attachers
#[repr(C)]
struct SegmentHeader {
    magic: u64,
    max_payload: u64,
    data_slots: u32,
    control_payload: u32,
    control_slots: u32,
    _reserved: u32,
}

const SEGMENT_MAGIC: u64 = 0x4d47_5250_4321_0001; // "MGRPC!" + version

const HEADER_REGION: usize = 64;

struct Layout {
    data_in: usize,
    data_out: usize,
    control_in: usize,
    control_out: usize,
    total: usize,
}

fn layout(config: &IpcConfig) -> Layout {
    let align = |n: usize| (n + 63) & !63;
    let data_size = align(ring_region_size(config.data_slots, config.max_payload));
    let control_size = align(ring_region_size(config.control_slots, config.control_payload));
    let data_in = HEADER_REGION;
    let data_out = data_in + data_size;
    let control_in = data_out + data_size;
    let control_out = control_in + control_size;
    Layout {
        data_in,
        data_out,
        control_in,
        control_out,
        total: control_out + control_size,
    }
}

fn read_config(seg: &ShmSegment) -> Result<IpcConfig> {
    let header = unsafe { &*(seg.ptr_at(0, std::mem::size_of::<SegmentHeader>()) as *const SegmentHeader) };
    if header.magic != SEGMENT_MAGIC {
        return Err(Error::Ipc(format!(
            "segment {} has wrong magic: {:#x}",
            seg.name(),
            header.magic
        )));
    }
    Ok(IpcConfig {
        max_payload: header.max_payload as usize,
        data_slots: header.data_slots,
        control_payload: header.control_payload as usize,
        control_slots: header.control_slots,
    })
}

/// One frame received on the host's data-out ring
#[derive(Debug, Clone, PartialEq)]
pub enum DataFrame {
    /// A pipeline buffer
    Item(RuntimeData),
    /// The worker finished all outputs for one input
    BatchEnd,
}

/// Events the host observes from the worker's control ring
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker initialized and is accepting data
    Ready,
    /// Liveness beacon
    Heartbeat,
    /// Control message emitted by the worker's node
    Control(ControlMessage),
}

/// Host side of the channel (owns the segment)
pub struct HostIpcChannel {
    seg: Arc<ShmSegment>,
    data_in: RingProducer,
    data_out: RingConsumer,
    control_in: RingProducer,
    control_out: RingConsumer,
}

impl HostIpcChannel {
    /// Create the segment and all four rings. `suffix` scopes the name to
    /// the session and node.
    pub fn create(suffix: &str, config: &IpcConfig) -> Result<Self> {
        let name = ShmSegment::scoped_name(suffix);
        let lay = layout(config);
        let seg = Arc::new(ShmSegment::create(&name, lay.total)?);

        let header_ptr = seg.ptr_at(0, std::mem::size_of::<SegmentHeader>()) as *mut SegmentHeader;
        unsafe {
            (*header_ptr).max_payload = config.max_payload as u64;
            (*header_ptr).data_slots = config.data_slots;
            (*header_ptr).control_payload = config.control_payload as u32;
            (*header_ptr).control_slots = config.control_slots;
            // Magic last: attachers seeing it may trust the geometry
            (*header_ptr).magic = SEGMENT_MAGIC;
        }

        ring::init_ring(&seg, lay.data_in, config.data_slots, config.max_payload);
        ring::init_ring(&seg, lay.data_out, config.data_slots, config.max_payload);
        ring::init_ring(&seg, lay.control_in, config.control_slots, config.control_payload);
        ring::init_ring(&seg, lay.control_out, config.control_slots, config.control_payload);

        Ok(Self {
            data_in: ring::producer(Arc::clone(&seg), lay.data_in),
            data_out: ring::consumer(Arc::clone(&seg), lay.data_out),
            control_in: ring::producer(Arc::clone(&seg), lay.control_in),
            control_out: ring::consumer(Arc::clone(&seg), lay.control_out),
            seg,
        })
    }

    /// Segment name to hand the worker via [`ENV_SHM_NAME`]
    pub fn shm_name(&self) -> &str {
        self.seg.name()
    }

    /// Send one buffer to the worker. Blocks (bounded by `deadline`) while
    /// the ring is full; this is the backpressure path.
    pub fn send_data(&self, data: &RuntimeData, deadline: Option<Instant>) -> Result<()> {
        let encoded = wire::encode(data)?;
        self.data_in.push(&encoded, deadline)
    }

    /// Receive one output frame from the worker; `Ok(None)` = worker closed
    pub fn recv_frame(&self, deadline: Option<Instant>) -> Result<Option<DataFrame>> {
        match self.data_out.pop(deadline)? {
            Some(payload) if payload.first() == Some(&FRAME_BATCH_END) => {
                Ok(Some(DataFrame::BatchEnd))
            }
            Some(payload) => Ok(Some(DataFrame::Item(wire::decode(&payload)?))),
            None => Ok(None),
        }
    }

    /// Receive one output item, skipping batch markers; `Ok(None)` =
    /// worker closed
    pub fn recv_data(&self, deadline: Option<Instant>) -> Result<Option<RuntimeData>> {
        loop {
            match self.recv_frame(deadline)? {
                Some(DataFrame::Item(data)) => return Ok(Some(data)),
                Some(DataFrame::BatchEnd) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Send a control message on the control ring (never blocked by data)
    pub fn send_control(&self, msg: &ControlMessage, deadline: Option<Instant>) -> Result<()> {
        let encoded = wire::encode(&RuntimeData::Control(msg.clone()))?;
        self.control_in.push(&encoded, deadline)
    }

    /// Request a graceful worker shutdown
    pub fn send_shutdown(&self) -> Result<()> {
        self.control_in
            .push(&[FRAME_SHUTDOWN], Some(Instant::now() + std::time::Duration::from_millis(100)))
    }

    /// Drain pending worker events without blocking
    pub fn poll_events(&self) -> Result<Vec<WorkerEvent>> {
        let mut events = Vec::new();
        while let Some(frame) = self.control_out.try_pop()? {
            if let Some(event) = decode_event(&frame)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Receive the next worker event, blocking until `deadline`.
    ///
    /// `Ok(None)` means the worker closed its control ring. Unknown frames
    /// are skipped. The futex wake on publish makes this the low-latency
    /// path for worker-emitted control; a polling consumer would add up to
    /// a poll interval of delay.
    pub fn recv_event(&self, deadline: Option<Instant>) -> Result<Option<WorkerEvent>> {
        loop {
            match self.control_out.pop(deadline)? {
                Some(frame) => {
                    if let Some(event) = decode_event(&frame)? {
                        return Ok(Some(event));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Block until the worker reports ready (or `deadline`)
    pub fn wait_ready(&self, deadline: Instant) -> Result<()> {
        loop {
            match self.recv_event(Some(deadline))? {
                Some(WorkerEvent::Ready) => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(Error::Ipc("control ring closed before READY".into()));
                }
            }
        }
    }

    /// Signal end-of-input to the worker (data ring close)
    pub fn close_input(&self) {
        self.data_in.close();
    }

    /// Tear down all rings; unblocks both sides
    pub fn close(&self) {
        self.data_in.close();
        self.data_out.close();
        self.control_in.close();
        self.control_out.close();
    }
}

fn decode_event(frame: &[u8]) -> Result<Option<WorkerEvent>> {
    match frame.first() {
        Some(&FRAME_READY) => Ok(Some(WorkerEvent::Ready)),
        Some(&FRAME_HEARTBEAT) => Ok(Some(WorkerEvent::Heartbeat)),
        Some(&wire::TAG_CONTROL) => match wire::decode(frame)? {
            RuntimeData::Control(msg) => Ok(Some(WorkerEvent::Control(msg))),
            _ => Ok(None),
        },
        Some(other) => {
            tracing::warn!(tag = other, "ignoring unknown control frame");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Directives the worker observes from the host's control ring
#[derive(Debug, Clone, PartialEq)]
pub enum HostDirective {
    /// Control message for the node
    Control(ControlMessage),
    /// Stop after the current item
    Shutdown,
}

/// Worker side of the channel (attaches to the host's segment)
pub struct WorkerIpcChannel {
    _seg: Arc<ShmSegment>,
    data_in: RingConsumer,
    data_out: RingProducer,
    control_in: RingConsumer,
    control_out: RingProducer,
}

impl WorkerIpcChannel {
    /// Attach using the segment name from the environment
    pub fn from_env() -> Result<Self> {
        let name = std::env::var(ENV_SHM_NAME)
            .map_err(|_| Error::Ipc(format!("{ENV_SHM_NAME} not set")))?;
        Self::attach(&name)
    }

    /// Attach to an existing channel segment by name
    pub fn attach(name: &str) -> Result<Self> {
        let seg = Arc::new(ShmSegment::attach(name)?);
        let config = read_config(&seg)?;
        let lay = layout(&config);
        if seg.len() < lay.total {
            return Err(Error::Ipc(format!(
                "segment {} too small: {} < {}",
                name,
                seg.len(),
                lay.total
            )));
        }
        Ok(Self {
            data_in: ring::consumer(Arc::clone(&seg), lay.data_in),
            data_out: ring::producer(Arc::clone(&seg), lay.data_out),
            control_in: ring::consumer(Arc::clone(&seg), lay.control_in),
            control_out: ring::producer(Arc::clone(&seg), lay.control_out),
            _seg: seg,
        })
    }

    /// Receive the next input; `Ok(None)` = host closed the input ring
    pub fn recv_data(&self, deadline: Option<Instant>) -> Result<Option<RuntimeData>> {
        match self.data_in.pop(deadline)? {
            Some(payload) => Ok(Some(wire::decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Publish one output back to the host
    pub fn send_data(&self, data: &RuntimeData, deadline: Option<Instant>) -> Result<()> {
        let encoded = wire::encode(data)?;
        self.data_out.push(&encoded, deadline)
    }

    /// Report successful initialization
    pub fn send_ready(&self) -> Result<()> {
        self.control_out.push(&[FRAME_READY], None)
    }

    /// Publish a liveness beacon
    pub fn send_heartbeat(&self) -> Result<()> {
        // Never block the worker loop on heartbeats; a full control ring
        // just drops the beacon
        match self.control_out.push(&[FRAME_HEARTBEAT], Some(Instant::now())) {
            Ok(()) => Ok(()),
            Err(Error::Timeout(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Emit a control message from the node to the host
    pub fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        let encoded = wire::encode(&RuntimeData::Control(msg.clone()))?;
        self.control_out.push(&encoded, None)
    }

    /// Mark the end of the outputs for one input
    pub fn send_batch_end(&self, deadline: Option<Instant>) -> Result<()> {
        self.data_out.push(&[FRAME_BATCH_END], deadline)
    }

    /// Drain pending host directives without blocking
    pub fn poll_directives(&self) -> Result<Vec<HostDirective>> {
        let mut directives = Vec::new();
        while let Some(frame) = self.control_in.try_pop()? {
            match frame.first() {
                Some(&FRAME_SHUTDOWN) => directives.push(HostDirective::Shutdown),
                Some(&wire::TAG_CONTROL) => {
                    if let RuntimeData::Control(msg) = wire::decode(&frame)? {
                        directives.push(HostDirective::Control(msg));
                    }
                }
                Some(other) => {
                    tracing::warn!(tag = other, "ignoring unknown host frame");
                }
                None => {}
            }
        }
        Ok(directives)
    }

    /// Close the output rings (end-of-stream toward the host)
    pub fn close(&self) {
        self.data_out.close();
        self.control_out.close();
    }
}
