//! Crate-wide error type.
//!
//! Framing and link errors are recovered locally by the poll engine (retry,
//! reopen). Protocol errors surface on the originating transfer's result
//! event. Remote-store errors degrade to journaling. Ingress errors drop the
//! offending message. Only [`Error::Config`] and [`Error::JournalCorrupt`]
//! are fatal at startup.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Framing
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadCrc { expected: u16, actual: u16 },

    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("frame too long: {0} bytes")]
    FrameTooLong(usize),

    // Link
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("link fault: {0}")]
    LinkFault(String),

    #[error("serial device gone: {0}")]
    DeviceGone(String),

    #[error("serial port: {0}")]
    SerialPort(String),

    // Protocol
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("AFT transfer rejected, status {0:#04x}")]
    AftRejected(u8),

    #[error("machine not ready")]
    MachineNotReady,

    // Remote store
    #[error("remote store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("remote store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("journal full at {0} bytes")]
    JournalFull(u64),

    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),

    // Ingress
    #[error("signature mismatch")]
    SignatureInvalid,

    #[error("stale message: {0}s outside freshness window")]
    StaleMessage(i64),

    #[error("replayed nonce")]
    ReplayedNonce,

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("command mailbox full")]
    Busy,

    #[error("websocket: {0}")]
    WebSocket(String),

    // Fatal at startup
    #[error("invalid configuration: {0}")]
    Config(String),

    // Plumbing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl Error {
    /// Whether this error should abort startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::JournalCorrupt(_))
    }

    /// Whether this error is recoverable by retrying the frame on the link.
    pub fn is_link_retryable(&self) -> bool {
        matches!(
            self,
            Error::BadCrc { .. } | Error::ShortRead { .. } | Error::Timeout(_)
        )
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Error::SerialPort(err.to_string())
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Error::WebSocket(err.to_string())
    }
}
