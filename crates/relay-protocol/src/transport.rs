/// Uniform interface over the two transport variants (§4.2).
///
/// Ordering/reliability differences (datachannel is unreliable/unordered,
/// socket is reliable/ordered) are resolved once, at construction time, by
/// each variant's `enable_ack`/chunking defaults — higher layers (session,
/// sender, receiver) only ever see this trait.
use async_trait::async_trait;

use crate::error::EngineError;
use crate::framing::Frame;

/// Which transport variant backs a session. Drives the `enable_ack`
/// default per the open question recorded in SPEC_FULL.md §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    DataChannel,
    Socket,
}

impl TransportKind {
    /// Historical default for per-packet ACK, see SPEC_FULL.md §9 decision.
    pub fn default_enable_ack(self) -> bool {
        matches!(self, TransportKind::DataChannel)
    }
}

/// Capability set a transport adapter must provide (§4.2).
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Maximum payload bytes discoverable for this transport. Fixed after
    /// handshake (§3 invariant).
    fn max_payload(&self) -> usize;

    /// Enqueue one frame for sending.
    async fn send_frame(&self, frame: Frame) -> Result<(), EngineError>;

    /// Await the next inbound frame. Returns `Ok(None)` on clean transport
    /// closure.
    async fn recv(&self) -> Result<Option<Frame>, EngineError>;

    /// Block until the send buffer has drained below threshold, polling
    /// every 16 ms as specified in §4.2.
    async fn await_drain(&self);

    /// Tear down the transport. Idempotent.
    async fn close(&self);
}

pub const DRAIN_POLL_INTERVAL_MS: u64 = 16;
