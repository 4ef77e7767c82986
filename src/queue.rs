//! # Send Queue
//!
//! Bounded, ordered FIFO of outgoing messages. Entries are split into two
//! admission classes with distinct capacity policies: *data* entries
//! (routed SOME/IP frames and PDUs) draw from a pool that may be capped by
//! `ipc_max_queue_size`, *command* entries (control traffic) from an
//! unbounded pool. Both classes feed the same queue, so the order observed
//! by repeated `front` + `pop_front` is exactly the enqueue order.
//!
//! The queue is not thread-safe; the send engine serializes access behind
//! its own mutex.

use crate::error::IpcError;
use crate::pool::EntryPool;
use std::collections::VecDeque;

/// Category deciding which pool an entry is allocated from and which
/// capacity bound applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionClass {
    Data,
    Command,
}

/// One queued message: the serialized IPC header block plus the payload.
pub struct QueueEntry {
    pub class: AdmissionClass,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

pub struct SendQueue {
    entries: VecDeque<QueueEntry>,
    data_pool: EntryPool,
    command_pool: EntryPool,
}

impl SendQueue {
    /// `max_data_entries` caps the data class; `0` means unlimited.
    pub fn new(max_data_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            data_pool: EntryPool::bounded(max_data_entries),
            command_pool: EntryPool::unbounded(),
        }
    }

    /// Enqueue a data-class message. Fails with
    /// [`IpcError::ResourceExhausted`] when the data pool is at capacity.
    pub fn push_back_data(&mut self, header: &[u8], payload: &[u8]) -> Result<(), IpcError> {
        let buffers = self
            .data_pool
            .try_acquire()
            .ok_or(IpcError::ResourceExhausted)?;
        self.push_entry(AdmissionClass::Data, buffers, header, payload);
        Ok(())
    }

    /// Enqueue a command-class message. The command pool is unbounded in
    /// steady-state operation.
    pub fn push_back_command(&mut self, header: &[u8], payload: &[u8]) -> Result<(), IpcError> {
        let buffers = self
            .command_pool
            .try_acquire()
            .ok_or(IpcError::ResourceExhausted)?;
        self.push_entry(AdmissionClass::Command, buffers, header, payload);
        Ok(())
    }

    fn push_entry(
        &mut self,
        class: AdmissionClass,
        (mut header_buf, mut payload_buf): (Vec<u8>, Vec<u8>),
        header: &[u8],
        payload: &[u8],
    ) {
        header_buf.extend_from_slice(header);
        payload_buf.extend_from_slice(payload);
        self.entries.push_back(QueueEntry {
            class,
            header: header_buf,
            payload: payload_buf,
        });
    }

    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Remove the head entry and return its buffers to the owning pool.
    /// No-op on an empty queue.
    pub fn pop_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            let pool = match entry.class {
                AdmissionClass::Data => &mut self.data_pool,
                AdmissionClass::Command => &mut self.command_pool,
            };
            pool.release((entry.header, entry.payload));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_data_steady_mode(&mut self, on: bool) {
        self.data_pool.set_steady_mode(on);
    }

    pub fn set_command_steady_mode(&mut self, on: bool) {
        self.command_pool.set_steady_mode(on);
    }
}
