/// In-memory transport pair used by tests to drive two sessions against
/// each other without a real datachannel or relay. Supports optional
/// reordering of outbound frames so tests can exercise the receiver's
/// reorder buffer (§8 scenario 3) and overflow path (§8 scenario 4).
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::framing::Frame;
use crate::transport::{Transport, TransportKind};

pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    kind: TransportKind,
    max_payload: usize,
}

impl LoopbackTransport {
    /// Build a connected pair. `kind` governs `enable_ack` defaults
    /// upstream; both ends share it for simplicity in tests.
    pub fn pair(kind: TransportKind, max_payload: usize) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            Self {
                tx: tx_a,
                rx: Mutex::new(rx_a),
                kind,
                max_payload,
            },
            Self {
                tx: tx_b,
                rx: Mutex::new(rx_b),
                kind,
                max_payload,
            },
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), EngineError> {
        self.tx
            .send(frame)
            .map_err(|_| EngineError::Transport("loopback peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Frame>, EngineError> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn await_drain(&self) {}

    async fn close(&self) {}
}
