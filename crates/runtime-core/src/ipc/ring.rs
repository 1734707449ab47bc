//! Single-producer/single-consumer ring over shared memory
//!
//! Each slot is `[sequence:u64le][payload_len:u32le][payload…]`. The
//! producer writes the payload, release-stores `sequence = index + 1`, and
//! wakes the consumer's futex; the consumer acquire-loads the sequence it
//! expects, copies the payload out, and release-stores the tail to free the
//! slot. Exactly one producer task and one consumer task may use a ring.

use super::shm::ShmSegment;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Padded ring header placed at the ring's base offset
#[repr(C, align(64))]
struct RingHeader {
    /// Count of published slots (producer-owned)
    head: AtomicU64,
    _pad1: [u8; 56],
    /// Count of consumed slots (consumer-owned)
    tail: AtomicU64,
    _pad2: [u8; 56],
    /// Bumped on publish; consumers futex-wait on it
    data_futex: AtomicU32,
    /// Bumped on consume; producers futex-wait on it
    space_futex: AtomicU32,
    /// Non-zero once either side closed the ring
    closed: AtomicU32,
    /// Slot count (immutable after init)
    capacity: u32,
    /// Slot stride in bytes (immutable after init)
    slot_stride: u32,
    _pad3: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == 192);

/// Byte offset of the sequence field within a slot
const SLOT_SEQ: usize = 0;
/// Byte offset of the payload length within a slot
const SLOT_LEN: usize = 8;
/// Byte offset of the payload within a slot
const SLOT_PAYLOAD: usize = 12;

/// Bytes a ring with `capacity` slots of `max_payload` occupies
pub fn ring_region_size(capacity: u32, max_payload: usize) -> usize {
    std::mem::size_of::<RingHeader>() + capacity as usize * slot_stride(max_payload)
}

fn slot_stride(max_payload: usize) -> usize {
    // Payload offset plus payload, rounded up to 8 so slot bases stay aligned
    (SLOT_PAYLOAD + max_payload + 7) & !7
}

/// Shared state for one ring inside a segment
struct RingShared {
    seg: Arc<ShmSegment>,
    base: usize,
}

impl RingShared {
    fn header(&self) -> &RingHeader {
        let ptr = self.seg.ptr_at(self.base, std::mem::size_of::<RingHeader>());
        unsafe { &*(ptr as *const RingHeader) }
    }

    fn slot_base(&self, index: u64) -> usize {
        let header = self.header();
        let stride = header.slot_stride as usize;
        self.base
            + std::mem::size_of::<RingHeader>()
            + (index % header.capacity as u64) as usize * stride
    }

    fn slot_seq(&self, index: u64) -> &AtomicU64 {
        let ptr = self.seg.ptr_at(self.slot_base(index) + SLOT_SEQ, 8);
        unsafe { AtomicU64::from_ptr(ptr as *mut u64) }
    }

    fn max_payload(&self) -> usize {
        self.header().slot_stride as usize - SLOT_PAYLOAD
    }

    fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    fn close(&self) {
        let header = self.header();
        header.closed.store(1, Ordering::Release);
        // Unblock both sides
        header.data_futex.fetch_add(1, Ordering::Release);
        header.space_futex.fetch_add(1, Ordering::Release);
        futex_wake(&header.data_futex);
        futex_wake(&header.space_futex);
    }
}

/// Initialize a ring's header inside a freshly created segment
pub fn init_ring(seg: &Arc<ShmSegment>, base: usize, capacity: u32, max_payload: usize) {
    assert!(capacity > 0, "ring capacity must be > 0");
    assert!(base % 64 == 0, "ring base must be 64-byte aligned");
    let shared = RingShared {
        seg: Arc::clone(seg),
        base,
    };
    // Segment memory is zeroed; only the geometry fields need storing.
    let header_ptr = seg.ptr_at(base, std::mem::size_of::<RingHeader>()) as *mut RingHeader;
    unsafe {
        (*header_ptr).capacity = capacity;
        (*header_ptr).slot_stride = slot_stride(max_payload) as u32;
    }
    debug_assert_eq!(shared.header().capacity, capacity);
}

/// Producer half of a ring. Exactly one per ring.
pub struct RingProducer {
    shared: RingShared,
}

/// Consumer half of a ring. Exactly one per ring.
pub struct RingConsumer {
    shared: RingShared,
}

/// Create the producer handle for the ring at `base`
pub fn producer(seg: Arc<ShmSegment>, base: usize) -> RingProducer {
    RingProducer {
        shared: RingShared { seg, base },
    }
}

/// Create the consumer handle for the ring at `base`
pub fn consumer(seg: Arc<ShmSegment>, base: usize) -> RingConsumer {
    RingConsumer {
        shared: RingShared { seg, base },
    }
}

impl RingProducer {
    /// Publish one payload, blocking while the ring is full.
    ///
    /// Returns `Timeout` when the ring stays full past `deadline` and
    /// `Ipc` when the ring is closed or the payload exceeds the slot size.
    pub fn push(&self, payload: &[u8], deadline: Option<Instant>) -> Result<()> {
        let header = self.shared.header();
        if payload.len() > self.shared.max_payload() {
            return Err(Error::Ipc(format!(
                "payload of {} bytes exceeds ring slot capacity {}",
                payload.len(),
                self.shared.max_payload()
            )));
        }

        let head = header.head.load(Ordering::Relaxed);

        // Backpressure: wait for the consumer to free a slot
        loop {
            if self.shared.is_closed() {
                return Err(Error::Ipc("ring closed".into()));
            }
            let tail = header.tail.load(Ordering::Acquire);
            if head - tail < header.capacity as u64 {
                break;
            }
            let wait_token = header.space_futex.load(Ordering::Acquire);
            // Re-check after reading the token so a wake between the check
            // and the wait is not lost
            let tail = header.tail.load(Ordering::Acquire);
            if head - tail < header.capacity as u64 || self.shared.is_closed() {
                continue;
            }
            wait_until(&header.space_futex, wait_token, deadline, "ring full")?;
        }

        let base = self.shared.slot_base(head);
        unsafe {
            let len_ptr = self.shared.seg.ptr_at(base + SLOT_LEN, 4) as *mut u8;
            len_ptr.copy_from_nonoverlapping((payload.len() as u32).to_le_bytes().as_ptr(), 4);
            let payload_ptr = self.shared.seg.ptr_at(base + SLOT_PAYLOAD, payload.len().max(1));
            payload_ptr.copy_from_nonoverlapping(payload.as_ptr(), payload.len());
        }

        // Publication point: sequence release-store, then wake the consumer
        self.shared.slot_seq(head).store(head + 1, Ordering::Release);
        header.head.store(head + 1, Ordering::Release);
        header.data_futex.fetch_add(1, Ordering::Release);
        futex_wake(&header.data_futex);
        Ok(())
    }

    /// Close the ring; the consumer drains what is published and then sees
    /// end-of-stream
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the other side closed the ring
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl RingConsumer {
    /// Receive the next payload.
    ///
    /// `Ok(None)` means the ring was closed and fully drained; `Timeout`
    /// means nothing was published before `deadline`.
    pub fn pop(&self, deadline: Option<Instant>) -> Result<Option<Vec<u8>>> {
        let header = self.shared.header();
        let tail = header.tail.load(Ordering::Relaxed);

        loop {
            // Observation point: acquire-load of the slot sequence
            let seq = self.shared.slot_seq(tail).load(Ordering::Acquire);
            if seq == tail + 1 {
                break;
            }
            if self.shared.is_closed() && header.head.load(Ordering::Acquire) == tail {
                return Ok(None);
            }
            let wait_token = header.data_futex.load(Ordering::Acquire);
            let seq = self.shared.slot_seq(tail).load(Ordering::Acquire);
            if seq == tail + 1 || self.shared.is_closed() {
                continue;
            }
            wait_until(&header.data_futex, wait_token, deadline, "ring empty")?;
        }

        let base = self.shared.slot_base(tail);
        let payload = unsafe {
            let mut len_bytes = [0u8; 4];
            let len_ptr = self.shared.seg.ptr_at(base + SLOT_LEN, 4);
            len_ptr.copy_to_nonoverlapping(len_bytes.as_mut_ptr(), 4);
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > self.shared.max_payload() {
                return Err(Error::Ipc(format!(
                    "corrupt slot: payload length {len} exceeds slot capacity"
                )));
            }
            let mut buf = vec![0u8; len];
            if len > 0 {
                let payload_ptr = self.shared.seg.ptr_at(base + SLOT_PAYLOAD, len);
                payload_ptr.copy_to_nonoverlapping(buf.as_mut_ptr(), len);
            }
            buf
        };

        header.tail.store(tail + 1, Ordering::Release);
        header.space_futex.fetch_add(1, Ordering::Release);
        futex_wake(&header.space_futex);
        Ok(Some(payload))
    }

    /// Non-blocking receive; `Ok(None)` when nothing is ready (closed or
    /// empty; check [`RingConsumer::is_closed`] to distinguish)
    pub fn try_pop(&self) -> Result<Option<Vec<u8>>> {
        let header = self.shared.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let seq = self.shared.slot_seq(tail).load(Ordering::Acquire);
        if seq != tail + 1 {
            return Ok(None);
        }
        self.pop(Some(Instant::now()))
    }

    /// Close the ring from the consuming side (unblocks the producer)
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the ring has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Futex wait bounded by an optional deadline
fn wait_until(
    futex: &AtomicU32,
    expected: u32,
    deadline: Option<Instant>,
    what: &str,
) -> Result<()> {
    let timeout = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!("{what} past deadline")));
            }
            Some(deadline - now)
        }
        None => None,
    };
    futex_wait(futex, expected, timeout);
    Ok(())
}

#[cfg(target_os = "linux")]
fn futex_wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map(|ts| ts as *const libc::timespec)
        .unwrap_or(std::ptr::null());
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(futex: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    // Bounded spin-then-sleep fallback for platforms without futexes
    let start = Instant::now();
    let limit = timeout.unwrap_or(Duration::from_millis(1));
    while futex.load(Ordering::Acquire) == expected && start.elapsed() < limit {
        std::thread::yield_now();
        std::thread::sleep(Duration::from_micros(50));
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_futex: &AtomicU32) {}
