//! Zero-copy shared-memory IPC
//!
//! The subprocess and container executors share this module: a POSIX
//! shared-memory segment holding two pairs of single-producer /
//! single-consumer rings (data in each direction, control in each
//! direction). Control gets its own rings so a cancel is never head-of-line
//! blocked behind a large media payload.
//!
//! Slot layout is `[sequence:u64le][payload_len:u32le][payload…]`;
//! publication is a release-store of the sequence, observation an
//! acquire-load, and waits go through a futex on Linux (spin-yield
//! elsewhere).

pub mod channel;
pub mod ring;
pub mod shm;

pub use channel::{DataFrame, HostDirective, HostIpcChannel, IpcConfig, WorkerEvent, WorkerIpcChannel};
pub use ring::{RingConsumer, RingProducer};
pub use shm::ShmSegment;
