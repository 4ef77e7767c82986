//! # Message Writer
//!
//! Serializes one framed message into the send ring, either in *stream*
//! mode (the write may suspend on a full ring and resume after a writable
//! notification) or in *datagram* mode (all-or-nothing).
//!
//! A stream write progresses through its regions in strict order:
//!
//! ```text
//!   writing-common-header -> writing-format-b-header -> writing-data -> finished
//! ```
//!
//! The format-B stage is skipped when no specific header is supplied, and
//! the data stage when the payload is empty. Partial writes stay in the
//! same state with an advanced offset.
//!
//! The writer owns the per-direction sequence number and stamps it, along
//! with a redundant copy of the message length, into the integrity
//! preamble ahead of the common header. Receivers enforce strict +1
//! sequencing (with wrap at the u32 boundary) and compare the redundant
//! length against the header's length field.

use crate::error::{fatal, IpcError};
use crate::ipc::channel::SendChannel;
use crate::ipc::protocol::{
    CommonHeader, FramePreamble, SpecificHeader, COMMON_HEADER_SIZE, FRAME_PREAMBLE_SIZE,
    SPECIFIC_HEADER_SIZE,
};
use tracing::trace;

const HEADER_BLOCK_SIZE: usize = FRAME_PREAMBLE_SIZE + COMMON_HEADER_SIZE;

/// Result of arming an asynchronous stream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAsyncStream {
    /// At least one byte can be written immediately.
    SpaceAvailable,
    /// The ring is full; a writable notification has been requested.
    NoFreeSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamWriteStatus {
    /// The ring filled up mid-message; a writable notification has been
    /// requested.
    OngoingNoSpace,
    /// Progress was made and more free space is already available; call
    /// again.
    OngoingMoreSpace,
    /// The whole message has been committed.
    Completed,
}

/// Status of one stream-write step plus whether the peer needs a readable
/// notification for the bytes committed by this step.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub status: StreamWriteStatus,
    pub readable_notification_needed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    CommonHeader,
    FormatBHeader,
    Data,
    Finished,
}

pub struct MessageWriter {
    max_message_size: usize,
    sequence: u32,
    state: WriteState,
    /// Preamble plus common header, serialized at prepare time.
    header_block: [u8; HEADER_BLOCK_SIZE],
    specific: Option<[u8; SPECIFIC_HEADER_SIZE]>,
    region_offset: usize,
    payload_len: usize,
    payload_written: usize,
}

impl MessageWriter {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            sequence: 0,
            state: WriteState::Idle,
            header_block: [0; HEADER_BLOCK_SIZE],
            specific: None,
            region_offset: 0,
            payload_len: 0,
            payload_written: 0,
        }
    }

    /// True when no stream write is in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, WriteState::Idle | WriteState::Finished)
    }

    fn framed_len(&self, specific: bool, payload_len: usize) -> usize {
        HEADER_BLOCK_SIZE + if specific { SPECIFIC_HEADER_SIZE } else { 0 } + payload_len
    }

    fn check_size(&self, channel: &SendChannel, framed: usize) -> Result<(), IpcError> {
        let max = self.max_message_size.min(channel.capacity());
        if framed > max {
            return Err(IpcError::SizeTooLarge { len: framed, max });
        }
        Ok(())
    }

    /// Initialize a stream write. The payload buffers themselves are passed
    /// to each [`stream_write_message`](Self::stream_write_message) call and
    /// must stay identical until the write completes.
    pub fn prepare_stream(
        &mut self,
        channel: &SendChannel,
        common: CommonHeader,
        specific: Option<SpecificHeader>,
        payload_len: usize,
    ) -> Result<(), IpcError> {
        if !self.is_idle() {
            fatal("stream write prepared while a previous write is in progress");
        }
        debug_assert_eq!(
            common.length as usize,
            payload_len + specific.map_or(0, |_| SPECIFIC_HEADER_SIZE)
        );

        let framed = self.framed_len(specific.is_some(), payload_len);
        self.check_size(channel, framed)?;

        let preamble = FramePreamble {
            sequence: self.sequence,
            length_check: common.length,
        };
        self.sequence = self.sequence.wrapping_add(1);

        self.header_block[..FRAME_PREAMBLE_SIZE].copy_from_slice(&preamble.encode());
        self.header_block[FRAME_PREAMBLE_SIZE..].copy_from_slice(&common.encode());
        self.specific = specific.map(|s| s.encode());
        self.state = WriteState::CommonHeader;
        self.region_offset = 0;
        self.payload_len = payload_len;
        self.payload_written = 0;

        trace!(
            sequence = preamble.sequence,
            message_type = common.message_type,
            length = common.length,
            "stream write prepared"
        );
        Ok(())
    }

    /// Check for free space or arm a writable notification.
    pub fn start_async_stream(
        &mut self,
        channel: &mut SendChannel,
    ) -> Result<StartAsyncStream, IpcError> {
        if channel.available_write()? > 0 {
            return Ok(StartAsyncStream::SpaceAvailable);
        }
        channel.request_writable();
        // the peer may have drained the ring between the check and the
        // request; a later spurious wakeup is tolerated
        if channel.available_write()? > 0 {
            Ok(StartAsyncStream::SpaceAvailable)
        } else {
            Ok(StartAsyncStream::NoFreeSpace)
        }
    }

    /// Advance the current stream write as far as the ring allows, then
    /// commit. `payload` must be the scatter passed since `prepare_stream`.
    pub fn stream_write_message(
        &mut self,
        channel: &mut SendChannel,
        payload: &[&[u8]],
    ) -> Result<WriteOutcome, IpcError> {
        if matches!(self.state, WriteState::Idle) {
            fatal("stream write driven without a prepared message");
        }
        debug_assert_eq!(
            payload.iter().map(|s| s.len()).sum::<usize>(),
            self.payload_len
        );

        let mut wrote_any = false;
        while !matches!(self.state, WriteState::Finished) {
            let free = channel.available_write()?;
            if free == 0 {
                break;
            }
            match self.state {
                WriteState::CommonHeader => {
                    let remaining = &self.header_block[self.region_offset..];
                    let n = remaining.len().min(free);
                    channel.write(&remaining[..n]);
                    self.region_offset += n;
                    if self.region_offset == HEADER_BLOCK_SIZE {
                        self.region_offset = 0;
                        self.state = self.next_state_after_headers(true);
                    }
                }
                WriteState::FormatBHeader => {
                    let specific = match &self.specific {
                        Some(bytes) => bytes,
                        None => fatal("format-B stage without a specific header"),
                    };
                    let remaining = &specific[self.region_offset..];
                    let n = remaining.len().min(free);
                    channel.write(&remaining[..n]);
                    self.region_offset += n;
                    if self.region_offset == SPECIFIC_HEADER_SIZE {
                        self.region_offset = 0;
                        self.state = self.next_state_after_headers(false);
                    }
                }
                WriteState::Data => {
                    let (slice, offset) = locate(payload, self.payload_written);
                    let n = (slice.len() - offset).min(free);
                    channel.write(&slice[offset..offset + n]);
                    self.payload_written += n;
                    if self.payload_written == self.payload_len {
                        self.state = WriteState::Finished;
                    }
                }
                WriteState::Idle | WriteState::Finished => unreachable!(),
            }
            wrote_any = true;
        }

        let readable_notification_needed = if wrote_any {
            let was_empty = channel.peer_sees_empty();
            channel.commit();
            channel.take_readable_request() || was_empty
        } else {
            false
        };

        if matches!(self.state, WriteState::Finished) {
            return Ok(WriteOutcome {
                status: StreamWriteStatus::Completed,
                readable_notification_needed,
            });
        }

        // ring is full mid-message: decide whether to suspend
        let status = if channel.available_write()? > 0 {
            StreamWriteStatus::OngoingMoreSpace
        } else {
            channel.request_writable();
            if channel.available_write()? > 0 {
                StreamWriteStatus::OngoingMoreSpace
            } else {
                StreamWriteStatus::OngoingNoSpace
            }
        };
        Ok(WriteOutcome {
            status,
            readable_notification_needed,
        })
    }

    fn next_state_after_headers(&self, specific_pending: bool) -> WriteState {
        if specific_pending && self.specific.is_some() {
            WriteState::FormatBHeader
        } else if self.payload_len > 0 {
            WriteState::Data
        } else {
            WriteState::Finished
        }
    }

    /// All-or-nothing write: succeeds only when the entire framed message
    /// fits into the currently free space. Returns whether the peer needs
    /// a readable notification.
    pub fn datagram_write(
        &mut self,
        channel: &mut SendChannel,
        common: CommonHeader,
        specific: Option<SpecificHeader>,
        payload: &[&[u8]],
    ) -> Result<bool, IpcError> {
        if !self.is_idle() {
            fatal("datagram write issued while a stream write is in progress");
        }
        let payload_len: usize = payload.iter().map(|s| s.len()).sum();
        let framed = self.framed_len(specific.is_some(), payload_len);
        self.check_size(channel, framed)?;
        if channel.available_write()? < framed {
            return Err(IpcError::Busy);
        }

        let preamble = FramePreamble {
            sequence: self.sequence,
            length_check: common.length,
        };
        self.sequence = self.sequence.wrapping_add(1);

        channel.write(&preamble.encode());
        channel.write(&common.encode());
        if let Some(specific) = specific {
            channel.write(&specific.encode());
        }
        for slice in payload {
            channel.write(slice);
        }

        let was_empty = channel.peer_sees_empty();
        channel.commit();
        Ok(channel.take_readable_request() || was_empty)
    }
}

/// Map a linear offset into a scatter list to `(slice, offset-in-slice)`.
/// Empty slices are skipped.
fn locate<'a>(payload: &[&'a [u8]], mut offset: usize) -> (&'a [u8], usize) {
    for slice in payload {
        if offset < slice.len() {
            return (slice, offset);
        }
        offset -= slice.len();
    }
    unreachable!("scatter offset beyond payload length");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::FramedChannel;
    use crate::ipc::protocol::{FramePreamble, MessageType};

    fn pair(capacity: usize) -> (crate::ipc::channel::SendChannel, crate::ipc::channel::ReceiveChannel) {
        let (a, b) = FramedChannel::loopback_pair(capacity).unwrap();
        let (send, _, _) = a.split();
        let (_, recv, _) = b.split();
        (send, recv)
    }

    fn drain(recv: &mut crate::ipc::channel::ReceiveChannel, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        recv.read_into(&mut buf);
        recv.commit_and_notify();
        buf
    }

    #[test]
    fn test_stream_write_completes_in_one_step() {
        let (mut send, mut recv) = pair(4096);
        let mut writer = MessageWriter::new(1 << 20);

        let payload = [0xABu8; 100];
        let common = CommonHeader::new(MessageType::RoutingSomeIp.raw(), payload.len());
        let specific = SpecificHeader::from_instance(7);
        writer
            .prepare_stream(&send, common, Some(specific), payload.len())
            .unwrap();
        assert_eq!(
            writer.start_async_stream(&mut send).unwrap(),
            StartAsyncStream::SpaceAvailable
        );

        let outcome = writer
            .stream_write_message(&mut send, &[&payload])
            .unwrap();
        assert_eq!(outcome.status, StreamWriteStatus::Completed);
        // ring was empty before, so the peer must be woken
        assert!(outcome.readable_notification_needed);

        let framed = recv.available_read().unwrap();
        assert_eq!(framed, 8 + 16 + payload.len());
        let bytes = drain(&mut recv, framed);
        let preamble = FramePreamble::decode(&bytes[..8]);
        assert_eq!(preamble.sequence, 0);
        assert_eq!(preamble.length_check, common.length);
        assert_eq!(CommonHeader::decode(&bytes[8..20]), common);
        assert_eq!(SpecificHeader::decode(&bytes[20..24]), specific);
        assert_eq!(&bytes[24..], &payload[..]);
    }

    #[test]
    fn test_prepare_rejects_oversized_message() {
        let (send, _recv) = pair(256);
        let mut writer = MessageWriter::new(1 << 20);

        // larger than the ring can ever hold
        let common = CommonHeader::new(MessageType::RoutingPdu.raw(), 300);
        let result = writer.prepare_stream(&send, common, Some(SpecificHeader::default()), 300);
        assert!(matches!(result, Err(IpcError::SizeTooLarge { .. })));
        assert!(writer.is_idle());
    }

    #[test]
    fn test_backpressure_and_resume() {
        let (mut send, mut recv) = pair(64);
        let mut writer = MessageWriter::new(1 << 20);

        // fill the ring completely with a datagram: 24 bytes of framing
        // plus 40 bytes of payload
        let filler = [0u8; 40];
        let common = CommonHeader::new(MessageType::RoutingPdu.raw(), filler.len());
        writer
            .datagram_write(&mut send, common, Some(SpecificHeader::default()), &[&filler])
            .unwrap();
        assert_eq!(send.available_write().unwrap(), 0);

        // a second message cannot start: no free space, notification armed
        let payload = [0x55u8; 20];
        let common = CommonHeader::new(MessageType::RoutingPdu.raw(), payload.len());
        writer
            .prepare_stream(&send, common, Some(SpecificHeader::default()), payload.len())
            .unwrap();
        assert_eq!(
            writer.start_async_stream(&mut send).unwrap(),
            StartAsyncStream::NoFreeSpace
        );
        assert!(recv.take_writable_request());

        // drain the filler in small steps; the stream write resumes after
        // each step and completes once enough space has freed up
        let mut stream_bytes = Vec::new();
        let mut filler_left = 64usize;
        let mut completed = false;
        while !completed {
            let drain_n = recv.available_read().unwrap().min(16);
            if drain_n > 0 {
                let bytes = drain(&mut recv, drain_n);
                let skip = filler_left.min(bytes.len());
                filler_left -= skip;
                stream_bytes.extend_from_slice(&bytes[skip..]);
            }
            let outcome = writer.stream_write_message(&mut send, &[&payload]).unwrap();
            completed = outcome.status == StreamWriteStatus::Completed;
        }
        let n = recv.available_read().unwrap();
        if n > 0 {
            let bytes = drain(&mut recv, n);
            let skip = filler_left.min(bytes.len());
            filler_left -= skip;
            stream_bytes.extend_from_slice(&bytes[skip..]);
        }

        assert_eq!(filler_left, 0);
        assert_eq!(stream_bytes.len(), 24 + payload.len());
        assert_eq!(CommonHeader::decode(&stream_bytes[8..20]), common);
        assert_eq!(&stream_bytes[24..], &payload[..]);
    }

    #[test]
    fn test_datagram_busy_when_it_does_not_fit() {
        let (mut send, _recv) = pair(64);
        let mut writer = MessageWriter::new(1 << 20);

        let filler = [0u8; 30];
        let common = CommonHeader::new(MessageType::RoutingPdu.raw(), filler.len());
        writer
            .datagram_write(&mut send, common, Some(SpecificHeader::default()), &[&filler])
            .unwrap();

        let second = [0u8; 20];
        let common = CommonHeader::new(MessageType::RoutingPdu.raw(), second.len());
        let result =
            writer.datagram_write(&mut send, common, Some(SpecificHeader::default()), &[&second]);
        assert!(matches!(result, Err(IpcError::Busy)));
    }

    #[test]
    fn test_sequence_increments_per_message() {
        let (mut send, mut recv) = pair(4096);
        let mut writer = MessageWriter::new(1 << 20);

        for expected in 0..3u32 {
            let common = CommonHeader::new(MessageType::RoutingPdu.raw(), 0);
            writer
                .datagram_write(&mut send, common, Some(SpecificHeader::default()), &[])
                .unwrap();
            let bytes = drain(&mut recv, 24);
            assert_eq!(FramePreamble::decode(&bytes[..8]).sequence, expected);
        }
    }

    #[test]
    fn test_scatter_payload_is_concatenated() {
        let (mut send, mut recv) = pair(4096);
        let mut writer = MessageWriter::new(1 << 20);

        let part_a = [1u8, 2, 3];
        let part_b = [4u8, 5, 6, 7];
        let total = part_a.len() + part_b.len();
        let common = CommonHeader::new(MessageType::RoutingSomeIp.raw(), total);
        writer
            .prepare_stream(&send, common, Some(SpecificHeader::from_instance(1)), total)
            .unwrap();
        let outcome = writer
            .stream_write_message(&mut send, &[&part_a, &part_b])
            .unwrap();
        assert_eq!(outcome.status, StreamWriteStatus::Completed);

        let bytes = drain(&mut recv, 24 + total);
        assert_eq!(&bytes[24..], &[1, 2, 3, 4, 5, 6, 7]);
    }
}
