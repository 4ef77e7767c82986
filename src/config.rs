//! # Client Configuration
//!
//! Configuration record injected by the application when connecting to the
//! SOME/IP daemon. The record is serde-derived so integrators can load it
//! from whatever configuration source they already use; the crate itself
//! never touches the filesystem for configuration.

use crate::defaults;
use crate::error::IpcError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Connection parameters for the daemon's local IPC endpoint.
///
/// The well-known socket path is composed from `(domain, port)`; the two
/// shared-memory rings are sized by `ring_capacity`. `ipc_max_queue_size`
/// bounds the *data* admission class of the send queue; control commands
/// are never capped by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// IPC domain the daemon serves, e.g. `"local"`.
    pub someipd_ipc_domain: String,

    /// IPC port within the domain. Together with the domain it selects the
    /// daemon's well-known Unix socket path.
    pub someipd_ipc_port: u16,

    /// Maximum number of queued outgoing data messages. `0` = unlimited.
    pub ipc_max_queue_size: usize,

    /// Byte capacity of each shared-memory ring. Must be a power of two.
    pub ring_capacity: usize,

    /// Upper bound on the framed size of a single IPC message.
    pub max_message_size: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            someipd_ipc_domain: "local".to_string(),
            someipd_ipc_port: 30501,
            ipc_max_queue_size: 0,
            ring_capacity: defaults::RING_CAPACITY,
            max_message_size: defaults::MAX_MESSAGE_SIZE,
        }
    }
}

impl IpcConfig {
    /// The daemon's well-known Unix-domain socket path for this
    /// `(domain, port)` pair.
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/tmp/someipd-{}-{}.sock",
            self.someipd_ipc_domain, self.someipd_ipc_port
        ))
    }

    /// Validate the record before a connection attempt.
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.someipd_ipc_domain.is_empty() {
            return Err(IpcError::InvalidConfig("someipd_ipc_domain is empty"));
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(IpcError::InvalidConfig(
                "ring_capacity must be a power of two",
            ));
        }
        if self.ring_capacity < defaults::MIN_RING_CAPACITY {
            return Err(IpcError::InvalidConfig("ring_capacity below minimum"));
        }
        if self.max_message_size == 0 {
            return Err(IpcError::InvalidConfig("max_message_size is zero"));
        }
        Ok(())
    }
}
