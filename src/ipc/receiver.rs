//! # Message Receiver
//!
//! Chunked state machine turning the receive ring's byte stream into typed
//! messages. The ring may deliver any number of bytes per wakeup; the
//! receiver fills fixed scatter targets until the current chunk is
//! complete, then parses and advances:
//!
//! ```text
//!   reception-start
//!         |  new message begins
//!         v
//!   frame-header (8 B)  -> ipc-header (12 + 4 B)
//!         |
//!         +-- routing SOME/IP -> someip-header -> someip-payload -> complete
//!         +-- routing PDU     -> pdu-header    -> pdu-payload    -> complete
//!         +-- other           -> command-or-data                 -> complete
//! ```
//!
//! The message body is allocated just-in-time once the headers are known;
//! already-received header bytes are copied to its front and the remaining
//! bytes stream directly into it. Ownership of the body transfers to the
//! dispatch sink on completion.
//!
//! Recoverable failures (unknown message type, version mismatch, metadata
//! that does not fit the advertised length) drop the in-flight message:
//! its remaining payload bytes are drained through a fixed scratch buffer
//! so the stream stays framed, the reception buffer is reset and reception
//! continues. Sequence breaks and length-check mismatches are protocol
//! violations that poison the channel.

use crate::error::IpcError;
use crate::ipc::channel::ReceiveChannel;
use crate::ipc::protocol::{
    classify, validate_common_header, CommonHeader, FramePreamble, MessageClass, MessageType,
    SpecificHeader, COMMON_HEADER_SIZE, FRAME_PREAMBLE_SIZE, METADATA_SIZE, PDU_HEADER_SIZE,
    SOMEIP_HEADER_SIZE, SPECIFIC_HEADER_SIZE,
};
use crate::pool::allocate_body;
use crate::routing::Dispatcher;
use tracing::{debug, error, trace, warn};

const DISCARD_SCRATCH_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    /// Between messages.
    Idle,
    /// Reading the 8-byte integrity preamble.
    FrameHeader,
    /// Reading the common + specific header pair.
    IpcHeader,
    /// Reading a SOME/IP header, optionally preceded by metadata.
    SomeIpHeader { with_meta: bool },
    /// Reading a PDU header, optionally preceded by metadata.
    PduHeader { with_meta: bool },
    SomeIpPayload,
    PduPayload,
    /// Reading a control-response or metadata payload in one chunk.
    CommandOrData,
    /// Draining the payload of a message that is being dropped.
    Discard,
}

/// Scratch region targeted by one part of a chunk plan.
#[derive(Debug, Clone, Copy)]
enum Region {
    Frame,
    Generic,
    Specific,
    Metadata,
    SomeIpHeader,
    PduHeader,
    Body,
    DiscardScratch,
}

/// Scatter descriptor for the bytes the current state still needs: up to
/// two `(region, start, len)` parts filled strictly in order.
struct ChunkPlan {
    parts: [(Region, usize, usize); 2],
    part_count: usize,
    filled: usize,
    total: usize,
}

impl ChunkPlan {
    fn one(region: Region, start: usize, len: usize) -> Self {
        Self {
            parts: [(region, start, len), (Region::Frame, 0, 0)],
            part_count: 1,
            filled: 0,
            total: len,
        }
    }

    fn two(a: (Region, usize, usize), b: (Region, usize, usize)) -> Self {
        let total = a.2 + b.2;
        Self {
            parts: [a, b],
            part_count: 2,
            filled: 0,
            total,
        }
    }

    fn empty() -> Self {
        Self {
            parts: [(Region::Frame, 0, 0), (Region::Frame, 0, 0)],
            part_count: 0,
            filled: 0,
            total: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.total
    }

    /// Next contiguous gap as `(region, offset-in-region, remaining)`.
    fn gap(&self) -> (Region, usize, usize) {
        let mut skip = self.filled;
        for i in 0..self.part_count {
            let (region, start, len) = self.parts[i];
            if skip < len {
                return (region, start + skip, len - skip);
            }
            skip -= len;
        }
        unreachable!("gap() on a complete chunk plan");
    }
}

/// Pre-allocated scratch regions for the fixed-size headers plus the
/// per-message body buffer.
struct ReceptionBuffer {
    frame: [u8; FRAME_PREAMBLE_SIZE],
    generic: [u8; COMMON_HEADER_SIZE],
    specific: [u8; SPECIFIC_HEADER_SIZE],
    metadata: [u8; METADATA_SIZE],
    someip_header: [u8; SOMEIP_HEADER_SIZE],
    pdu_header: [u8; PDU_HEADER_SIZE],
    discard: [u8; DISCARD_SCRATCH_SIZE],
    body: Vec<u8>,
}

impl ReceptionBuffer {
    fn new() -> Self {
        Self {
            frame: [0; FRAME_PREAMBLE_SIZE],
            generic: [0; COMMON_HEADER_SIZE],
            specific: [0; SPECIFIC_HEADER_SIZE],
            metadata: [0; METADATA_SIZE],
            someip_header: [0; SOMEIP_HEADER_SIZE],
            pdu_header: [0; PDU_HEADER_SIZE],
            discard: [0; DISCARD_SCRATCH_SIZE],
            body: Vec::new(),
        }
    }

    fn region_slice_mut(&mut self, region: Region, start: usize, len: usize) -> &mut [u8] {
        match region {
            Region::Frame => &mut self.frame[start..start + len],
            Region::Generic => &mut self.generic[start..start + len],
            Region::Specific => &mut self.specific[start..start + len],
            Region::Metadata => &mut self.metadata[start..start + len],
            Region::SomeIpHeader => &mut self.someip_header[start..start + len],
            Region::PduHeader => &mut self.pdu_header[start..start + len],
            Region::Body => &mut self.body[start..start + len],
            Region::DiscardScratch => &mut self.discard[start..start + len],
        }
    }
}

/// Headers of the message currently being received.
struct InFlight {
    class: MessageClass,
    specific: SpecificHeader,
    /// Payload bytes not yet consumed from the ring.
    remaining: usize,
    timestamp: Option<u64>,
}

pub struct MessageReceiver {
    max_message_size: usize,
    state: RxState,
    plan: ChunkPlan,
    buf: ReceptionBuffer,
    in_flight: Option<InFlight>,
    expected_sequence: u32,
    pending_length_check: u32,
    discard_remaining: usize,
}

impl MessageReceiver {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: RxState::Idle,
            plan: ChunkPlan::empty(),
            buf: ReceptionBuffer::new(),
            in_flight: None,
            expected_sequence: 0,
            pending_length_check: 0,
            discard_remaining: 0,
        }
    }

    /// Consume everything currently readable from the channel, dispatching
    /// each completed message. Returns once the ring is drained. Errors
    /// are protocol violations; the channel must not be used afterwards.
    pub async fn drive(
        &mut self,
        channel: &mut ReceiveChannel,
        dispatcher: &Dispatcher,
    ) -> Result<(), IpcError> {
        loop {
            let available = channel.available_read()?;
            if available == 0 {
                channel.commit_and_notify();
                return Ok(());
            }
            if matches!(self.state, RxState::Idle) {
                self.on_message_available();
            }

            let (region, start, len) = self.plan.gap();
            let take = len.min(available);
            channel.read_into(self.buf.region_slice_mut(region, start, take));
            self.plan.filled += take;

            if self.plan.is_complete() {
                channel.commit_and_notify();
                self.on_chunk_available(dispatcher).await?;
            }
        }
    }

    /// A new message begins: target the integrity preamble first.
    fn on_message_available(&mut self) {
        self.state = RxState::FrameHeader;
        self.plan = ChunkPlan::one(Region::Frame, 0, FRAME_PREAMBLE_SIZE);
    }

    /// The current chunk is complete: parse it and install the next plan,
    /// dispatching the message when it is fully received.
    async fn on_chunk_available(&mut self, dispatcher: &Dispatcher) -> Result<(), IpcError> {
        match self.state {
            RxState::FrameHeader => self.parse_frame_header()?,
            RxState::IpcHeader => {
                if self.parse_ipc_header()? {
                    self.complete(dispatcher).await;
                }
            }
            RxState::SomeIpHeader { with_meta } => {
                if self.parse_payload_header(with_meta, false)? {
                    self.complete(dispatcher).await;
                }
            }
            RxState::PduHeader { with_meta } => {
                if self.parse_payload_header(with_meta, true)? {
                    self.complete(dispatcher).await;
                }
            }
            RxState::SomeIpPayload | RxState::PduPayload | RxState::CommandOrData => {
                self.complete(dispatcher).await;
            }
            RxState::Discard => {
                self.discard_remaining -= self.plan.total;
                if self.discard_remaining > 0 {
                    let step = self.discard_remaining.min(DISCARD_SCRATCH_SIZE);
                    self.plan = ChunkPlan::one(Region::DiscardScratch, 0, step);
                } else {
                    debug!("dropped message fully drained");
                    self.reset();
                }
            }
            RxState::Idle => unreachable!("chunk completion while idle"),
        }
        Ok(())
    }

    fn parse_frame_header(&mut self) -> Result<(), IpcError> {
        let preamble = FramePreamble::decode(&self.buf.frame);
        if preamble.sequence != self.expected_sequence {
            error!(
                received = preamble.sequence,
                expected = self.expected_sequence,
                "message sequence break"
            );
            return Err(IpcError::ProtocolViolation("message sequence break"));
        }
        self.expected_sequence = self.expected_sequence.wrapping_add(1);
        self.pending_length_check = preamble.length_check;
        self.state = RxState::IpcHeader;
        self.plan = ChunkPlan::two(
            (Region::Generic, 0, COMMON_HEADER_SIZE),
            (Region::Specific, 0, SPECIFIC_HEADER_SIZE),
        );
        Ok(())
    }

    /// Returns `true` when the message carries no payload at all and is
    /// complete as soon as its headers have been read.
    fn parse_ipc_header(&mut self) -> Result<bool, IpcError> {
        let common = CommonHeader::decode(&self.buf.generic);
        if common.length != self.pending_length_check {
            error!(
                header = common.length,
                check = self.pending_length_check,
                "redundant length check failed"
            );
            return Err(IpcError::ProtocolViolation("redundant length check failed"));
        }
        if (common.length as usize) < SPECIFIC_HEADER_SIZE {
            // the specific header has already been consumed; there is no
            // way to tell where the next message starts
            return Err(IpcError::ProtocolViolation(
                "message length shorter than the specific header",
            ));
        }

        let specific = SpecificHeader::decode(&self.buf.specific);
        let remaining = common.payload_len();
        trace!(
            message_type = common.message_type,
            length = common.length,
            "IPC header received"
        );

        if let Err(e) = validate_common_header(&common) {
            error!(version = common.version, "message rejected: {e}");
            return self.begin_discard(remaining);
        }
        if remaining > self.max_message_size {
            error!(
                length = common.length,
                "message rejected: larger than the maximum message size"
            );
            return self.begin_discard(remaining);
        }

        let class = match classify(common.message_type) {
            Some(class) => class,
            None => {
                error!(
                    message_type = common.message_type,
                    "message rejected: unknown message type"
                );
                return self.begin_discard(remaining);
            }
        };

        self.in_flight = Some(InFlight {
            class,
            specific,
            remaining,
            timestamp: None,
        });

        match class {
            MessageClass::Routing(MessageType::RoutingSomeIp)
            | MessageClass::Routing(MessageType::RoutingSomeIpWithMeta)
            | MessageClass::Routing(MessageType::InitialFieldNotification) => {
                let with_meta = matches!(
                    class,
                    MessageClass::Routing(MessageType::RoutingSomeIpWithMeta)
                );
                let header_len = SOMEIP_HEADER_SIZE + if with_meta { METADATA_SIZE } else { 0 };
                if remaining < header_len {
                    error!(remaining, "SOME/IP routing message shorter than its header");
                    return self.begin_discard(remaining);
                }
                self.state = RxState::SomeIpHeader { with_meta };
                self.plan = if with_meta {
                    ChunkPlan::two(
                        (Region::Metadata, 0, METADATA_SIZE),
                        (Region::SomeIpHeader, 0, SOMEIP_HEADER_SIZE),
                    )
                } else {
                    ChunkPlan::one(Region::SomeIpHeader, 0, SOMEIP_HEADER_SIZE)
                };
            }
            MessageClass::Routing(MessageType::RoutingPdu)
            | MessageClass::Routing(MessageType::RoutingPduWithMeta) => {
                let with_meta = matches!(
                    class,
                    MessageClass::Routing(MessageType::RoutingPduWithMeta)
                );
                let header_len = PDU_HEADER_SIZE + if with_meta { METADATA_SIZE } else { 0 };
                if remaining < header_len {
                    error!(remaining, "PDU routing message shorter than its header");
                    return self.begin_discard(remaining);
                }
                self.state = RxState::PduHeader { with_meta };
                self.plan = if with_meta {
                    ChunkPlan::two(
                        (Region::Metadata, 0, METADATA_SIZE),
                        (Region::PduHeader, 0, PDU_HEADER_SIZE),
                    )
                } else {
                    ChunkPlan::one(Region::PduHeader, 0, PDU_HEADER_SIZE)
                };
            }
            MessageClass::ControlRequest(_) => {
                warn!(
                    message_type = common.message_type,
                    "control request from the daemon dropped"
                );
                return self.begin_discard(remaining);
            }
            _ => {
                // control responses and metadata-only routing updates
                if remaining == 0 {
                    return Ok(true);
                }
                self.state = RxState::CommandOrData;
                self.buf.body = allocate_body(remaining);
                self.plan = ChunkPlan::one(Region::Body, 0, remaining);
            }
        }
        Ok(false)
    }

    /// Parse a SOME/IP or PDU header (plus optional metadata), allocate the
    /// body and seed it with the header bytes. Returns `true` when the
    /// message has no further payload and is complete as-is.
    fn parse_payload_header(&mut self, with_meta: bool, pdu: bool) -> Result<bool, IpcError> {
        let timestamp = with_meta.then(|| u64::from_le_bytes(self.buf.metadata));
        let header_len = if pdu { PDU_HEADER_SIZE } else { SOMEIP_HEADER_SIZE };
        let consumed = header_len + if with_meta { METADATA_SIZE } else { 0 };

        let message = self
            .in_flight
            .as_mut()
            .ok_or(IpcError::ProtocolViolation("payload header without a message"))?;
        let rest = message.remaining - consumed;
        message.timestamp = timestamp;
        message.remaining = rest;

        self.buf.body = allocate_body(header_len + rest);
        if pdu {
            self.buf.body[..header_len].copy_from_slice(&self.buf.pdu_header);
        } else {
            self.buf.body[..header_len].copy_from_slice(&self.buf.someip_header);
        }

        if rest == 0 {
            return Ok(true);
        }
        self.state = if pdu {
            RxState::PduPayload
        } else {
            RxState::SomeIpPayload
        };
        self.plan = ChunkPlan::one(Region::Body, header_len, rest);
        Ok(false)
    }

    /// Reception complete: hand the message off and reset the buffer.
    async fn complete(&mut self, dispatcher: &Dispatcher) {
        let body = std::mem::take(&mut self.buf.body);
        if let Some(message) = self.in_flight.take() {
            trace!(?message.class, body_len = body.len(), "message dispatched");
            dispatcher
                .dispatch(message.class, message.specific, message.timestamp, body)
                .await;
        }
        self.reset();
    }

    /// Drop the in-flight message, draining `remaining` payload bytes so
    /// the stream stays framed. Always returns `Ok(false)`: a dropped
    /// message is never dispatched.
    fn begin_discard(&mut self, remaining: usize) -> Result<bool, IpcError> {
        self.in_flight = None;
        if remaining == 0 {
            self.reset();
            return Ok(false);
        }
        self.state = RxState::Discard;
        self.discard_remaining = remaining;
        let step = remaining.min(DISCARD_SCRATCH_SIZE);
        self.plan = ChunkPlan::one(Region::DiscardScratch, 0, step);
        Ok(false)
    }

    fn reset(&mut self) {
        self.state = RxState::Idle;
        self.plan = ChunkPlan::empty();
        self.in_flight = None;
        self.buf.body = Vec::new();
        self.discard_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControllerRegistry;
    use crate::ipc::channel::{FramedChannel, SendChannel};
    use crate::ipc::protocol::SOMEIP_MESSAGE_TYPE_OFFSET;
    use crate::routing::{RoutingSink, RoutingSinks};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Delivery {
        SomeIp(u16, Option<u64>, Vec<u8>),
        Pdu(u16, Option<u64>, Vec<u8>),
        InitialField(u16, u16, Vec<u8>),
        NonSomeIp(MessageType, u16),
    }

    struct CaptureSink(StdMutex<Vec<Delivery>>);

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }
        fn deliveries(&self) -> Vec<Delivery> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RoutingSink for CaptureSink {
        async fn deliver_someip(&self, instance_id: u16, timestamp: Option<u64>, body: Vec<u8>) {
            self.0
                .lock()
                .unwrap()
                .push(Delivery::SomeIp(instance_id, timestamp, body));
        }
        async fn deliver_pdu(&self, instance_id: u16, timestamp: Option<u64>, body: Vec<u8>) {
            self.0
                .lock()
                .unwrap()
                .push(Delivery::Pdu(instance_id, timestamp, body));
        }
        async fn deliver_initial_field(&self, instance_id: u16, client_id: u16, body: Vec<u8>) {
            self.0
                .lock()
                .unwrap()
                .push(Delivery::InitialField(instance_id, client_id, body));
        }
        async fn deliver_non_someip(&self, message_type: MessageType, header: SpecificHeader) {
            self.0
                .lock()
                .unwrap()
                .push(Delivery::NonSomeIp(message_type, header.instance_id()));
        }
    }

    struct Harness {
        send: SendChannel,
        recv: crate::ipc::channel::ReceiveChannel,
        receiver: MessageReceiver,
        dispatcher: Dispatcher,
        sink: Arc<CaptureSink>,
        sequence: u32,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            let (a, b) = FramedChannel::loopback_pair(capacity).unwrap();
            let (send, _, _) = a.split();
            let (_, recv, _) = b.split();
            let sink = CaptureSink::new();
            let sinks = Arc::new(RoutingSinks::new());
            sinks.bind_client_manager(sink.clone());
            sinks.bind_server_manager(sink.clone());
            let dispatcher = Dispatcher::new(Arc::new(ControllerRegistry::new()), sinks);
            Self {
                send,
                recv,
                receiver: MessageReceiver::new(1 << 20),
                dispatcher,
                sink,
                sequence: 0,
            }
        }

        /// Frame one message the way the daemon would.
        fn frame(&mut self, message_type: u32, specific: SpecificHeader, payload: &[u8]) -> Vec<u8> {
            let common = CommonHeader::new(message_type, payload.len());
            let preamble = FramePreamble {
                sequence: self.sequence,
                length_check: common.length,
            };
            self.sequence = self.sequence.wrapping_add(1);
            let mut out = Vec::new();
            out.extend_from_slice(&preamble.encode());
            out.extend_from_slice(&common.encode());
            out.extend_from_slice(&specific.encode());
            out.extend_from_slice(payload);
            out
        }

        async fn feed_in_chunks(&mut self, bytes: &[u8], chunk_sizes: &[usize]) {
            let mut offset = 0;
            let mut sizes = chunk_sizes.iter().copied().cycle();
            while offset < bytes.len() {
                let n = sizes.next().unwrap().min(bytes.len() - offset);
                self.send.write(&bytes[offset..offset + n]);
                self.send.commit();
                offset += n;
                self.receiver
                    .drive(&mut self.recv, &self.dispatcher)
                    .await
                    .unwrap();
            }
        }
    }

    fn someip_payload(body_len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; SOMEIP_HEADER_SIZE + body_len];
        payload[SOMEIP_MESSAGE_TYPE_OFFSET] = 0x02;
        for (i, byte) in payload[SOMEIP_HEADER_SIZE..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        payload
    }

    #[tokio::test]
    async fn test_someip_message_reassembled_from_spec_chunks() {
        let mut harness = Harness::new(1 << 16);
        let payload = someip_payload(1024);
        let frame = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(0x0005),
            &payload,
        );
        harness
            .feed_in_chunks(&frame, &[4, 4, 8, 16, 100, 500, 412])
            .await;

        assert_eq!(
            harness.sink.deliveries(),
            vec![Delivery::SomeIp(0x0005, None, payload)]
        );
    }

    #[tokio::test]
    async fn test_chunk_partition_does_not_change_messages() {
        for chunks in [&[1usize][..], &[3, 5][..], &[4096][..], &[7, 1, 2][..]] {
            let mut harness = Harness::new(1 << 16);
            let someip = someip_payload(64);
            let frame_a = harness.frame(
                MessageType::RoutingSomeIp.raw(),
                SpecificHeader::from_instance(1),
                &someip,
            );
            let mut pdu = vec![0u8; PDU_HEADER_SIZE + 32];
            pdu[0] = 0x42;
            let frame_b = harness.frame(
                MessageType::RoutingPdu.raw(),
                SpecificHeader::from_instance(2),
                &pdu,
            );
            let mut stream = frame_a;
            stream.extend_from_slice(&frame_b);
            harness.feed_in_chunks(&stream, chunks).await;

            assert_eq!(
                harness.sink.deliveries(),
                vec![
                    Delivery::SomeIp(1, None, someip.clone()),
                    Delivery::Pdu(2, None, pdu.clone()),
                ],
                "chunk sizes {:?}",
                chunks
            );
        }
    }

    #[tokio::test]
    async fn test_metadata_prefix_becomes_timestamp() {
        let mut harness = Harness::new(1 << 16);
        let someip = someip_payload(16);
        let mut payload = 0x1122_3344_5566_7788u64.to_le_bytes().to_vec();
        payload.extend_from_slice(&someip);
        let frame = harness.frame(
            MessageType::RoutingSomeIpWithMeta.raw(),
            SpecificHeader::from_instance(3),
            &payload,
        );
        harness.feed_in_chunks(&frame, &[16]).await;

        assert_eq!(
            harness.sink.deliveries(),
            vec![Delivery::SomeIp(3, Some(0x1122_3344_5566_7788), someip)]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_dropped_and_reception_continues() {
        let mut harness = Harness::new(1 << 16);
        let bad = harness.frame(
            0x1000_0000,
            SpecificHeader::default(),
            &[0xEE; 700],
        );
        let someip = someip_payload(8);
        let good = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(9),
            &someip,
        );
        let mut stream = bad;
        stream.extend_from_slice(&good);
        harness.feed_in_chunks(&stream, &[64]).await;

        assert_eq!(
            harness.sink.deliveries(),
            vec![Delivery::SomeIp(9, None, someip)]
        );
    }

    #[tokio::test]
    async fn test_version_mismatch_dropped() {
        let mut harness = Harness::new(1 << 16);
        let mut frame = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(9),
            &someip_payload(4),
        );
        // corrupt the version field (bytes 8..12 of the framed message)
        frame[8] = 9;
        let good_payload = someip_payload(4);
        let good = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(10),
            &good_payload,
        );
        let mut stream = frame;
        stream.extend_from_slice(&good);
        harness.feed_in_chunks(&stream, &[32]).await;

        assert_eq!(
            harness.sink.deliveries(),
            vec![Delivery::SomeIp(10, None, good_payload)]
        );
    }

    #[tokio::test]
    async fn test_sequence_break_poisons_the_channel() {
        let mut harness = Harness::new(1 << 16);
        harness.sequence = 5;
        let frame = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(1),
            &someip_payload(0),
        );
        harness.send.write(&frame);
        harness.send.commit();
        let result = harness
            .receiver
            .drive(&mut harness.recv, &harness.dispatcher)
            .await;
        assert!(matches!(result, Err(IpcError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_length_check_mismatch_poisons_the_channel() {
        let mut harness = Harness::new(1 << 16);
        let mut frame = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(1),
            &someip_payload(4),
        );
        // corrupt the redundant length (bytes 4..8 of the framed message)
        frame[4] ^= 0xFF;
        harness.send.write(&frame);
        harness.send.commit();
        let result = harness
            .receiver
            .drive(&mut harness.recv, &harness.dispatcher)
            .await;
        assert!(matches!(result, Err(IpcError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_short_someip_message_dropped() {
        let mut harness = Harness::new(1 << 16);
        // advertises SOME/IP but carries fewer bytes than one header
        let bad = harness.frame(
            MessageType::RoutingSomeIp.raw(),
            SpecificHeader::from_instance(1),
            &[1, 2, 3],
        );
        let good = harness.frame(
            MessageType::RoutingPdu.raw(),
            SpecificHeader::from_instance(4),
            &vec![0u8; PDU_HEADER_SIZE],
        );
        let mut stream = bad;
        stream.extend_from_slice(&good);
        harness.feed_in_chunks(&stream, &[16]).await;

        assert_eq!(
            harness.sink.deliveries(),
            vec![Delivery::Pdu(4, None, vec![0u8; PDU_HEADER_SIZE])]
        );
    }

    #[tokio::test]
    async fn test_subscription_state_reaches_non_someip_sink() {
        let mut harness = Harness::new(1 << 16);
        let frame = harness.frame(
            MessageType::SubscriptionState.raw(),
            SpecificHeader::from_instance(0x0077),
            &[],
        );
        harness.feed_in_chunks(&frame, &[8]).await;

        // both managers are the same capture sink here, so the update
        // appears once per bound manager
        assert_eq!(
            harness.sink.deliveries(),
            vec![
                Delivery::NonSomeIp(MessageType::SubscriptionState, 0x0077),
                Delivery::NonSomeIp(MessageType::SubscriptionState, 0x0077),
            ]
        );
    }

    #[tokio::test]
    async fn test_initial_field_notification_dispatch() {
        let mut harness = Harness::new(1 << 16);
        let someip = someip_payload(12);
        let frame = harness.frame(
            MessageType::InitialFieldNotification.raw(),
            SpecificHeader::from_notification(0x0005, 0x00AB),
            &someip,
        );
        harness.feed_in_chunks(&frame, &[10]).await;

        assert_eq!(
            harness.sink.deliveries(),
            vec![Delivery::InitialField(0x0005, 0x00AB, someip)]
        );
    }

    #[tokio::test]
    async fn test_sequence_wraps_at_u32_boundary() {
        let mut harness = Harness::new(1 << 16);
        harness.sequence = u32::MAX;
        harness.receiver.expected_sequence = u32::MAX;

        let first = harness.frame(
            MessageType::RoutingPdu.raw(),
            SpecificHeader::from_instance(1),
            &vec![0u8; PDU_HEADER_SIZE],
        );
        let second = harness.frame(
            MessageType::RoutingPdu.raw(),
            SpecificHeader::from_instance(2),
            &vec![0u8; PDU_HEADER_SIZE],
        );
        let mut stream = first;
        stream.extend_from_slice(&second);
        harness.feed_in_chunks(&stream, &[64]).await;

        assert_eq!(harness.sink.deliveries().len(), 2);
    }
}
