//! Buffer arenas for queue entries and message bodies.
//!
//! The send queue draws its entries from two pools so the data and command
//! admission classes can be bounded independently. A pool in steady mode
//! refuses to grow past its reservation; with steady mode off it falls back
//! to the global allocator. Released buffers keep their capacity and are
//! handed out again.

use tracing::error;

/// Arena of `(header, payload)` buffer pairs for send-queue entries.
pub struct EntryPool {
    free: Vec<(Vec<u8>, Vec<u8>)>,
    outstanding: usize,
    capacity: usize,
    steady: bool,
}

impl EntryPool {
    /// Unbounded pool: acquisition never fails.
    pub fn unbounded() -> Self {
        Self {
            free: Vec::new(),
            outstanding: 0,
            capacity: 0,
            steady: false,
        }
    }

    /// Pool reserved for `capacity` entries. Steady mode starts enabled
    /// when a real bound is given; `capacity == 0` means unlimited.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity.min(64)),
            outstanding: 0,
            capacity,
            steady: capacity != 0,
        }
    }

    /// Toggle steady mode. With steady mode off the pool may grow beyond
    /// its reservation.
    pub fn set_steady_mode(&mut self, on: bool) {
        self.steady = on;
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Take a buffer pair, or `None` when the pool is exhausted in steady
    /// mode.
    pub fn try_acquire(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.steady && self.capacity != 0 && self.outstanding >= self.capacity {
            return None;
        }
        self.outstanding += 1;
        Some(self.free.pop().unwrap_or_default())
    }

    /// Return a pair to the free list, keeping its capacity for reuse.
    pub fn release(&mut self, (mut header, mut payload): (Vec<u8>, Vec<u8>)) {
        header.clear();
        payload.clear();
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push((header, payload));
    }
}

/// Allocate a zeroed message-body buffer of exactly `len` bytes.
///
/// Body allocation happens on the reactor while a message is mid-reception;
/// there is no way to recover the stream position if it fails, so failure
/// aborts the process.
pub fn allocate_body(len: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    if buf.try_reserve_exact(len).is_err() {
        error!(bytes = len, "message body allocation failed");
        std::process::abort();
    }
    buf.resize(len, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_pool_enforces_capacity() {
        let mut pool = EntryPool::bounded(2);
        let first = pool.try_acquire().unwrap();
        let _second = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        pool.release(first);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_zero_capacity_means_unlimited() {
        let mut pool = EntryPool::bounded(0);
        for _ in 0..100 {
            assert!(pool.try_acquire().is_some());
        }
    }

    #[test]
    fn test_steady_mode_toggle() {
        let mut pool = EntryPool::bounded(1);
        let _held = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        pool.set_steady_mode(false);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_release_recycles_buffers() {
        let mut pool = EntryPool::unbounded();
        let (mut header, payload) = pool.try_acquire().unwrap();
        header.extend_from_slice(&[1, 2, 3]);
        pool.release((header, payload));

        let (header, _) = pool.try_acquire().unwrap();
        assert!(header.is_empty());
        assert!(header.capacity() >= 3);
    }

    #[test]
    fn test_allocate_body_exact_len() {
        let body = allocate_body(1024);
        assert_eq!(body.len(), 1024);
        assert!(body.iter().all(|&b| b == 0));
    }
}
