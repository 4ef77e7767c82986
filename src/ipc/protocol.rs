//! # IPC Wire Protocol
//!
//! Definitions for the framed message format exchanged with the co-located
//! SOME/IP daemon. Every logical message carries three parts on the wire:
//!
//! 1. A *common header* (12 bytes): protocol version, message type, and the
//!    total message length in bytes after this header.
//! 2. A *specific header* (4 bytes) whose interpretation depends on the
//!    message type: control messages carry a 32-bit return code, routing
//!    and notification messages carry `(instance_id, reserved-or-client_id)`.
//! 3. A payload of `length - 4` bytes.
//!
//! Ahead of the common header each framed message additionally carries an
//! 8-byte integrity preamble written by the message writer: a per-direction
//! sequence number and a redundant copy of the message length. The receiver
//! verifies both before it parses the headers; a mismatch means the stream
//! framing has diverged and the channel is poisoned.
//!
//! All fields are little-endian. Peers always run on the same machine, so
//! no cross-endianness handling is required.

use crate::error::IpcError;

/// Protocol version stamped into every common header.
pub const PROTOCOL_VERSION: u32 = 2;

/// Size of the integrity preamble (sequence + redundant length).
pub const FRAME_PREAMBLE_SIZE: usize = 8;

/// Size of the common header on the wire.
pub const COMMON_HEADER_SIZE: usize = 12;

/// Size of the type-specific header on the wire.
pub const SPECIFIC_HEADER_SIZE: usize = 4;

/// Common plus specific header, read in one chunk by the receiver.
pub const IPC_HEADER_SIZE: usize = COMMON_HEADER_SIZE + SPECIFIC_HEADER_SIZE;

/// Bytes a message occupies on the ring in excess of its payload.
pub const FRAME_OVERHEAD: usize = FRAME_PREAMBLE_SIZE + IPC_HEADER_SIZE;

/// Size of a SOME/IP message header inside a routing payload.
pub const SOMEIP_HEADER_SIZE: usize = 16;

/// Size of a PDU header inside a routing payload.
pub const PDU_HEADER_SIZE: usize = 8;

/// Size of the timestamp metadata prefix on `*WithMeta` routing messages.
pub const METADATA_SIZE: usize = 8;

/// Offset of the SOME/IP message-type byte within a SOME/IP header.
pub const SOMEIP_MESSAGE_TYPE_OFFSET: usize = 14;

/// XOR-offset a positive control response adds to its request type.
pub const POSITIVE_RESPONSE_OFFSET: u32 = 0x8000_0000;

/// XOR-offset a negative control response adds to its request type.
pub const NEGATIVE_RESPONSE_OFFSET: u32 = 0x4000_0000;

const ROUTING_RANGE_START: u32 = 0x2000_0000;
const ROUTING_RANGE_END: u32 = 0x4000_0000;

// The header pair is a hard wire invariant; the receiver's scatter layout
// depends on it.
const _: () = assert!(COMMON_HEADER_SIZE + SPECIFIC_HEADER_SIZE == 16);
const _: () = assert!(SPECIFIC_HEADER_SIZE == std::mem::size_of::<u32>());

/// Return codes the daemon places in the specific header of a control
/// response.
pub mod return_code {
    pub const OK: u32 = 0x0000_0000;
    pub const REQUEST_SERVICE_ACCESS_DENIED: u32 = 0x8000_0002;
    pub const REQUEST_SERVICE_CLIENT_IDS_OVERFLOW: u32 = 0x8000_0003;
    pub const REMOTE_SERVER_NOT_FOUND: u32 = 0x8000_0004;
    pub const REQUIRED_SERVICE_INSTANCE_NOT_FOUND: u32 = 0x8000_0005;
}

/// Message type catalog.
///
/// Control requests occupy `[0x0000_0000, 0x2000_0000)`, routing messages
/// `[0x2000_0000, 0x4000_0000)`. Control responses are formed by OR-ing a
/// request type with [`POSITIVE_RESPONSE_OFFSET`] or
/// [`NEGATIVE_RESPONSE_OFFSET`] and are therefore not listed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    ReleaseService = 0x0000_0000,
    OfferService = 0x0000_0001,
    StopOfferService = 0x0000_0002,
    SubscribeEvent = 0x0000_0003,
    UnsubscribeEvent = 0x0000_0004,
    StartServiceDiscovery = 0x0000_0005,
    StopServiceDiscovery = 0x0000_0006,
    RequestService = 0x0000_0007,
    RequestLocalServer = 0x0000_0008,
    RoutingSomeIp = 0x2000_0000,
    RoutingSomeIpWithMeta = 0x2000_0001,
    SubscriptionState = 0x2000_0002,
    RoutingPdu = 0x2000_0003,
    ServiceInstanceUp = 0x2000_0004,
    ServiceInstanceDown = 0x2000_0005,
    RoutingPduWithMeta = 0x2000_0006,
    InitialFieldNotification = 0x2000_0007,
}

impl MessageType {
    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x0000_0000 => MessageType::ReleaseService,
            0x0000_0001 => MessageType::OfferService,
            0x0000_0002 => MessageType::StopOfferService,
            0x0000_0003 => MessageType::SubscribeEvent,
            0x0000_0004 => MessageType::UnsubscribeEvent,
            0x0000_0005 => MessageType::StartServiceDiscovery,
            0x0000_0006 => MessageType::StopServiceDiscovery,
            0x0000_0007 => MessageType::RequestService,
            0x0000_0008 => MessageType::RequestLocalServer,
            0x2000_0000 => MessageType::RoutingSomeIp,
            0x2000_0001 => MessageType::RoutingSomeIpWithMeta,
            0x2000_0002 => MessageType::SubscriptionState,
            0x2000_0003 => MessageType::RoutingPdu,
            0x2000_0004 => MessageType::ServiceInstanceUp,
            0x2000_0005 => MessageType::ServiceInstanceDown,
            0x2000_0006 => MessageType::RoutingPduWithMeta,
            0x2000_0007 => MessageType::InitialFieldNotification,
            _ => return None,
        })
    }

    /// Wire value of the positive response to this request type.
    pub fn positive_response(self) -> u32 {
        self.raw() | POSITIVE_RESPONSE_OFFSET
    }

    /// Wire value of the negative response to this request type.
    pub fn negative_response(self) -> u32 {
        self.raw() | NEGATIVE_RESPONSE_OFFSET
    }

    /// Control requests that the daemon answers with a correlated response.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            MessageType::RequestService | MessageType::RequestLocalServer
        )
    }
}

/// Classification of a raw message-type value into its disjoint range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    ControlRequest(MessageType),
    ControlResponse { request: MessageType, positive: bool },
    Routing(MessageType),
}

/// Classify a raw message-type value. `None` means the value falls outside
/// every valid range and the message must be dropped.
pub fn classify(raw: u32) -> Option<MessageClass> {
    let positive = raw & POSITIVE_RESPONSE_OFFSET != 0;
    let negative = raw & NEGATIVE_RESPONSE_OFFSET != 0;
    match (positive, negative) {
        (true, true) => None,
        (false, false) => {
            let ty = MessageType::from_raw(raw)?;
            if raw < ROUTING_RANGE_START {
                Some(MessageClass::ControlRequest(ty))
            } else if raw < ROUTING_RANGE_END {
                Some(MessageClass::Routing(ty))
            } else {
                None
            }
        }
        _ => {
            let base = raw & !(POSITIVE_RESPONSE_OFFSET | NEGATIVE_RESPONSE_OFFSET);
            let request = MessageType::from_raw(base)?;
            if !request.expects_response() {
                return None;
            }
            Some(MessageClass::ControlResponse { request, positive })
        }
    }
}

/// The 12-byte fixed preamble of every IPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u32,
    pub message_type: u32,
    /// Bytes after this header: specific header plus payload.
    pub length: u32,
}

impl CommonHeader {
    /// Build a header for a message with the given payload length. The
    /// specific header width is always accounted for.
    pub fn new(message_type: u32, payload_len: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            length: (SPECIFIC_HEADER_SIZE + payload_len) as u32,
        }
    }

    pub fn encode(&self) -> [u8; COMMON_HEADER_SIZE] {
        let mut out = [0u8; COMMON_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.message_type.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= COMMON_HEADER_SIZE);
        Self {
            version: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            message_type: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            length: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }

    /// Payload bytes that follow the specific header. Only meaningful once
    /// `length >= 4` has been validated.
    pub fn payload_len(&self) -> usize {
        self.length as usize - SPECIFIC_HEADER_SIZE
    }
}

/// The 4-byte per-type header immediately after the common header.
///
/// Stored as the raw little-endian word; accessors provide the per-type
/// views (return code for control, `(instance_id, client_id)` for routing
/// and notification messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecificHeader(u32);

impl SpecificHeader {
    pub fn from_return_code(code: u32) -> Self {
        Self(code)
    }

    /// Routing view: instance id in the low half, reserved bits zero.
    pub fn from_instance(instance_id: u16) -> Self {
        Self(instance_id as u32)
    }

    /// Notification view: instance id plus client id.
    pub fn from_notification(instance_id: u16, client_id: u16) -> Self {
        Self(instance_id as u32 | ((client_id as u32) << 16))
    }

    pub fn return_code(&self) -> u32 {
        self.0
    }

    pub fn instance_id(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn client_id(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn encode(&self) -> [u8; SPECIFIC_HEADER_SIZE] {
        self.0.to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= SPECIFIC_HEADER_SIZE);
        Self(u32::from_le_bytes(bytes[0..4].try_into().unwrap()))
    }
}

/// The 8-byte integrity preamble ahead of every common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePreamble {
    /// Per-direction sequence number; wraps at the u32 boundary and must
    /// advance by exactly one per message.
    pub sequence: u32,
    /// Redundant copy of the common header's length field.
    pub length_check: u32,
}

impl FramePreamble {
    pub fn encode(&self) -> [u8; FRAME_PREAMBLE_SIZE] {
        let mut out = [0u8; FRAME_PREAMBLE_SIZE];
        out[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        out[4..8].copy_from_slice(&self.length_check.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= FRAME_PREAMBLE_SIZE);
        Self {
            sequence: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            length_check: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Validate a decoded common header against the local constants.
pub fn validate_common_header(header: &CommonHeader) -> Result<(), IpcError> {
    if header.version != PROTOCOL_VERSION {
        return Err(IpcError::ProtocolViolation("protocol version mismatch"));
    }
    if (header.length as usize) < SPECIFIC_HEADER_SIZE {
        return Err(IpcError::ProtocolViolation(
            "message length shorter than the specific header",
        ));
    }
    Ok(())
}

/// True when a SOME/IP header's message-type byte marks a request that
/// should be routed to the server-side manager (`REQUEST` or
/// `REQUEST_NO_RETURN`).
pub fn someip_is_request(header: &[u8]) -> bool {
    matches!(header.get(SOMEIP_MESSAGE_TYPE_OFFSET), Some(0x00) | Some(0x01))
}
