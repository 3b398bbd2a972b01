use thiserror::Error;

/// Malformed-wire-data errors raised by the framing codec itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame buffer is empty")]
    Empty,
    #[error("truncated ack header: got {got} bytes, need 8")]
    TruncatedAckHeader { got: usize },
    #[error("truncated shakehand body: got {got} bytes, need 24")]
    TruncatedShakehand { got: usize },
    #[error("truncated proxy_who body: got {got} bytes, need 32")]
    TruncatedProxyWho { got: usize },
}

/// Behavior-level error kinds a caller observes through session/file
/// lifecycle callbacks rather than a `Result` return (§7). Per-file kinds
/// leave the session open; session-level kinds are always terminal.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("handshake failed: SHAKEHAND not confirmed in time")]
    HandshakeFailed,

    #[error("malformed file metadata payload")]
    InvalidMetadata,

    #[error("ack timeout for file {file_seq} after all retries")]
    AckTimeout { file_seq: u32 },

    #[error("packet sequence violation for file {file_seq}")]
    SequenceViolation { file_seq: u32 },

    #[error("stream terminated abnormally for file {file_seq}")]
    StreamAborted { file_seq: u32 },

    #[error("lack of buffer space for file {file_seq} (capacity {capacity})")]
    BufferExhausted { file_seq: u32, capacity: usize },

    #[error("ping timeout: no pong within the liveness window")]
    PingTimeout,

    #[error("relay reported abnormal peer closure")]
    RelayAbnormalClose,

    #[error("transport error: {0}")]
    Transport(String),
}
