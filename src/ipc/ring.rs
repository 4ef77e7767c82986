//! Shared-memory ring buffer backing one direction of the framed channel.
//!
//! The ring stores absolute (never wrapping in value) producer and consumer
//! cursors plus the two one-shot notification-request flags in a `repr(C)`
//! header at the start of the region; the power-of-two data area follows.
//! Exactly one side mutates each cursor: cursor movement is staged locally
//! and published with [`RingProducer::commit`] / [`RingConsumer::commit`],
//! which issue the release fence that synchronizes the two processes.

use crate::error::IpcError;
use shared_memory::{Shmem, ShmemConf};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Ring metadata shared between the two peers.
#[repr(C)]
pub struct RingHeader {
    producer_cursor: AtomicU64,
    consumer_cursor: AtomicU64,
    /// Set by the consumer when it wants a wakeup on new data.
    readable_request: AtomicU32,
    /// Set by the producer when it wants a wakeup on freed space.
    writable_request: AtomicU32,
}

impl RingHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Heap-allocated ring region for loopback channels and tests.
struct HeapRegion {
    bytes: Box<[UnsafeCell<u8>]>,
}

// Access is coordinated through the cursor protocol, same as for the
// shared-memory mapping.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    fn new(total: usize) -> Arc<Self> {
        let bytes: Vec<UnsafeCell<u8>> = (0..total).map(|_| UnsafeCell::new(0)).collect();
        Arc::new(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    fn base_ptr(&self) -> *mut u8 {
        self.bytes.as_ptr() as *mut u8
    }
}

#[derive(Clone)]
enum RingBacking {
    Heap(Arc<HeapRegion>),
    Shared(Arc<Shmem>),
}

impl RingBacking {
    fn base_ptr(&self) -> *mut u8 {
        match self {
            RingBacking::Heap(region) => region.base_ptr(),
            RingBacking::Shared(shmem) => shmem.as_ptr(),
        }
    }
}

/// One direction of the channel: header plus data region.
///
/// Clones share the same backing region; wrap one clone in a
/// [`RingProducer`] and the other in a [`RingConsumer`].
#[derive(Clone)]
pub struct RingBuffer {
    backing: RingBacking,
    capacity: usize,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a heap-backed ring. `capacity` must be a power of two.
    pub fn new_heap(capacity: usize) -> Result<Self, IpcError> {
        Self::check_capacity(capacity)?;
        let region = HeapRegion::new(RingHeader::SIZE + capacity);
        let ring = Self {
            backing: RingBacking::Heap(region),
            capacity,
        };
        unsafe { ring.init_header() };
        Ok(ring)
    }

    /// Create a fresh shared-memory segment for this ring.
    pub fn create_shared(name: &str, capacity: usize) -> Result<Self, IpcError> {
        Self::check_capacity(capacity)?;
        let shmem = ShmemConf::new()
            .size(RingHeader::SIZE + capacity)
            .os_id(name)
            .create()
            .map_err(|e| IpcError::SharedMemory(e.to_string()))?;
        let ring = Self {
            backing: RingBacking::Shared(Arc::new(shmem)),
            capacity,
        };
        unsafe { ring.init_header() };
        Ok(ring)
    }

    /// Map an existing segment created by the peer.
    pub fn open_shared(name: &str, capacity: usize) -> Result<Self, IpcError> {
        Self::check_capacity(capacity)?;
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| IpcError::SharedMemory(e.to_string()))?;
        if shmem.len() < RingHeader::SIZE + capacity {
            return Err(IpcError::SharedMemory(format!(
                "segment {} is smaller than the configured ring",
                name
            )));
        }
        Ok(Self {
            backing: RingBacking::Shared(Arc::new(shmem)),
            capacity,
        })
    }

    fn check_capacity(capacity: usize) -> Result<(), IpcError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(IpcError::InvalidConfig(
                "ring capacity must be a non-zero power of two",
            ));
        }
        Ok(())
    }

    unsafe fn init_header(&self) {
        ptr::write(
            self.backing.base_ptr() as *mut RingHeader,
            RingHeader {
                producer_cursor: AtomicU64::new(0),
                consumer_cursor: AtomicU64::new(0),
                readable_request: AtomicU32::new(0),
                writable_request: AtomicU32::new(0),
            },
        );
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.backing.base_ptr() as *const RingHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.backing.base_ptr().add(RingHeader::SIZE) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `src` into the data region at the index derived from `cursor`,
    /// wrapping once if the slice crosses the end of the region.
    unsafe fn copy_in(&self, cursor: u64, src: &[u8]) {
        let index = (cursor as usize) & (self.capacity - 1);
        let first = src.len().min(self.capacity - index);
        ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(index), first);
        if first < src.len() {
            ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data_ptr(), src.len() - first);
        }
    }

    unsafe fn copy_out(&self, cursor: u64, dst: &mut [u8]) {
        let index = (cursor as usize) & (self.capacity - 1);
        let first = dst.len().min(self.capacity - index);
        ptr::copy_nonoverlapping(self.data_ptr().add(index), dst.as_mut_ptr(), first);
        if first < dst.len() {
            ptr::copy_nonoverlapping(self.data_ptr(), dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

/// Producing side of a ring. Writes are staged against a local cursor and
/// become visible to the peer at [`RingProducer::commit`].
pub struct RingProducer {
    ring: RingBuffer,
    staged: u64,
}

impl RingProducer {
    pub fn new(ring: RingBuffer) -> Self {
        let staged = ring.header().producer_cursor.load(Ordering::Acquire);
        Self { ring, staged }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes that can be produced before the ring is full, including bytes
    /// staged but not yet committed.
    pub fn available_write(&self) -> Result<usize, IpcError> {
        let consumer = self.ring.header().consumer_cursor.load(Ordering::Acquire);
        let used = self.staged.wrapping_sub(consumer);
        if used > self.ring.capacity() as u64 {
            return Err(IpcError::ProtocolViolation(
                "consumer cursor ran ahead of the producer",
            ));
        }
        Ok(self.ring.capacity() - used as usize)
    }

    /// Stage `src` into the ring. The caller must have checked
    /// [`available_write`](Self::available_write) first.
    pub fn write(&mut self, src: &[u8]) {
        unsafe { self.ring.copy_in(self.staged, src) };
        self.staged += src.len() as u64;
    }

    /// Publish all staged writes to the peer.
    pub fn commit(&mut self) {
        fence(Ordering::Release);
        self.ring
            .header()
            .producer_cursor
            .store(self.staged, Ordering::Release);
    }

    /// True when the peer currently sees an empty ring. Sampled before a
    /// commit this decides whether the commit transitions the receive side
    /// from empty to non-empty.
    pub fn published_empty(&self) -> bool {
        let header = self.ring.header();
        header.producer_cursor.load(Ordering::Relaxed)
            == header.consumer_cursor.load(Ordering::Acquire)
    }

    /// Ask the peer to wake this side once space frees up. One-shot.
    pub fn request_writable(&self) {
        self.ring
            .header()
            .writable_request
            .store(1, Ordering::Release);
    }

    /// Consume the peer's pending readable-notification request, if any.
    pub fn take_readable_request(&self) -> bool {
        self.ring
            .header()
            .readable_request
            .swap(0, Ordering::AcqRel)
            == 1
    }
}

/// Consuming side of a ring, dual of [`RingProducer`].
pub struct RingConsumer {
    ring: RingBuffer,
    staged: u64,
}

impl RingConsumer {
    pub fn new(ring: RingBuffer) -> Self {
        let staged = ring.header().consumer_cursor.load(Ordering::Acquire);
        Self { ring, staged }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes ready to consume, excluding bytes already staged as read.
    pub fn available_read(&self) -> Result<usize, IpcError> {
        let producer = self.ring.header().producer_cursor.load(Ordering::Acquire);
        let filled = producer.wrapping_sub(self.staged);
        if filled > self.ring.capacity() as u64 {
            return Err(IpcError::ProtocolViolation(
                "producer cursor overran the ring capacity",
            ));
        }
        Ok(filled as usize)
    }

    /// Copy the next `dst.len()` bytes out of the ring. The caller must
    /// have checked [`available_read`](Self::available_read) first.
    pub fn read(&mut self, dst: &mut [u8]) {
        unsafe { self.ring.copy_out(self.staged, dst) };
        self.staged += dst.len() as u64;
    }

    /// Publish all staged reads, freeing the space for the producer.
    pub fn commit(&mut self) {
        fence(Ordering::Release);
        self.ring
            .header()
            .consumer_cursor
            .store(self.staged, Ordering::Release);
    }

    /// Ask the peer to wake this side once data arrives. One-shot.
    pub fn request_readable(&self) {
        self.ring
            .header()
            .readable_request
            .store(1, Ordering::Release);
    }

    /// Consume the peer's pending writable-notification request, if any.
    pub fn take_writable_request(&self) -> bool {
        self.ring
            .header()
            .writable_request
            .swap(0, Ordering::AcqRel)
            == 1
    }
}
