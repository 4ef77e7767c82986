use thiserror::Error;

/// Errors produced by the framed IPC engine.
///
/// Errors that originate in I/O are recovered at the channel boundary where
/// possible (spurious wakeups are absorbed, partial writes resume). Errors
/// that indicate protocol divergence from the daemon poison the channel:
/// no further operations succeed after a [`IpcError::ProtocolViolation`].
#[derive(Debug, Error)]
pub enum IpcError {
    /// A cursor or length field implies an impossible ring state. The
    /// channel is unusable once this has been observed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The prepared message does not fit the maximum IPC message size or
    /// the ring capacity.
    #[error("message of {len} bytes exceeds the limit of {max} bytes")]
    SizeTooLarge { len: usize, max: usize },

    /// Datagram write: the full message does not fit into the currently
    /// free ring space. The caller may retry after draining.
    #[error("channel busy: not enough free space for a datagram write")]
    Busy,

    /// The peer closed the connection or a local disconnect was issued.
    #[error("disconnected from the daemon")]
    Disconnected,

    /// The data admission class of the send queue is at capacity.
    #[error("send queue capacity exhausted")]
    ResourceExhausted,

    /// The daemon rejected a service request for this application.
    #[error("daemon denied access to the requested service")]
    AccessDenied,

    /// No matching remote server or required service instance is known to
    /// the daemon.
    #[error("daemon configuration error: no matching server or service instance")]
    ConfigurationError,

    /// The daemon has run out of client identifiers to hand out.
    #[error("daemon has no free client identifiers")]
    ClientIdsOverflow,

    /// A control response body did not have the protocol-defined size.
    #[error("control response body has an unexpected length")]
    IncorrectResponseLength,

    /// The operation requires an established connection.
    #[error("not connected to the daemon")]
    NotConnected,

    /// Socket-level failure during connect or the notification handshake.
    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The shared-memory segment could not be created or mapped.
    #[error("shared memory: {0}")]
    SharedMemory(String),

    /// Rejected configuration record.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl IpcError {
    /// True for errors after which the channel must not be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ProtocolViolation(_) | IpcError::Disconnected
        )
    }
}

/// Abort on a violated programmer-error invariant. These are API misuses,
/// not recoverable conditions.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    std::process::abort();
}
