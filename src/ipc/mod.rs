//! # Framed IPC Message Engine
//!
//! The byte-level core of the client: wire protocol definitions, the
//! shared-memory ring buffer, the framed channel built on top of it, the
//! stream/datagram message writer and the chunked message receiver.
//!
//! Data flows leaf-first: the [`ring`] module knows nothing about
//! messages, [`channel`] adds notifications and disconnect state, and
//! [`writer`]/[`receiver`] implement the message framing on top of the
//! channel halves.

pub mod channel;
pub mod protocol;
pub mod receiver;
pub mod ring;
pub mod writer;

pub use channel::{FramedChannel, ReceiveChannel, SendChannel};
pub use protocol::{CommonHeader, MessageClass, MessageType, SpecificHeader};
pub use receiver::MessageReceiver;
pub use writer::{MessageWriter, StartAsyncStream, StreamWriteStatus, WriteOutcome};
