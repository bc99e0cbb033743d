use thiserror::Error;

use crate::types::PeerId;

#[derive(Error, Debug)]
pub enum LockstepError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Liveness probe failed for {peer}")]
    Liveness { peer: PeerId },

    #[error("Failed to connect to {endpoint} after {attempts} attempts")]
    RetryExhausted { endpoint: String, attempts: u32 },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockstepError {
    /// Whether the orchestration layer may carry on after this error.
    ///
    /// Only an exhausted retry budget and a bad configuration are terminal,
    /// and even those end a single peer's session, never the process.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::RetryExhausted { .. } | Self::ConfigurationInvalid { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("String frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("String of {len} bytes exceeds the {max}-byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unexpected token: expected {expected:?}, got {received:?}")]
    UnexpectedToken {
        expected: &'static str,
        received: String,
    },

    #[error("Negative {field} on the wire: {value}")]
    NegativeLength { field: &'static str, value: i64 },

    #[error("{state} index {index} out of range for {len} item(s)")]
    IndexOutOfRange {
        state: &'static str,
        index: usize,
        len: usize,
    },
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed to start: {0}")]
    DaemonFailed(String),

    #[error("Failed to browse service: {0}")]
    BrowseFailed(String),

    #[error("Failed to register service: {0}")]
    RegisterFailed(String),
}
