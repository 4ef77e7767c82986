//! # SOME/IP Daemon IPC Client
//!
//! Client-side library an application links against to communicate with a
//! co-located SOME/IP daemon over a local stream-oriented IPC channel. The
//! daemon multiplexes the vehicle network on behalf of many applications;
//! this crate provides the typed, asynchronous API to issue control
//! commands (register and release services, subscribe to events, request
//! client identifiers) and to carry routed payload traffic (SOME/IP
//! requests and responses, signal-based PDUs, field notifications) in both
//! directions.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------+     +--------------+     +-----------------+
//! |  SomeIpDaemonClient |---->|  Send Queue  |---->|  Message Writer |
//! |      (facade)       |     | (two classes)|     |  (stream mode)  |
//! +---------------------+     +--------------+     +--------+--------+
//!        |        ^                                         v
//!        |        |                              +-------------------+
//!        |   control promises                    |  Framed Channel   |
//!        |        |                              | (shared-mem ring) |
//!        v        |                              +-------------------+
//! +---------------------+     +------------------+        |
//! |  Routing Sinks      |<----| Message Receiver |<-------+
//! | (client/server mgr) |     | (state machine)  |
//! +---------------------+     +------------------+
//! ```
//!
//! The engine modules are public so embedders and test harnesses can drive
//! both ends of a channel; [`ipc::channel::FramedChannel::loopback_pair`]
//! creates an in-process pair for that purpose.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod routing;

pub use client::SomeIpDaemonClient;
pub use config::IpcConfig;
pub use control::{ClientId, EventgroupSubscription, ServiceInstance};
pub use error::IpcError;
pub use ipc::channel::FramedChannel;
pub use ipc::protocol::MessageType;
pub use routing::RoutingSink;

/// The current version of the client library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default byte capacity of each shared-memory ring
    pub const RING_CAPACITY: usize = 1 << 22;

    /// Smallest ring the engine accepts
    pub const MIN_RING_CAPACITY: usize = 4096;

    /// Default upper bound on the framed size of one IPC message
    pub const MAX_MESSAGE_SIZE: usize = 1 << 21;
}
