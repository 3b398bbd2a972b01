/// DataChannel transport variant (§4.2): unreliable, unordered,
/// message-oriented. ICE/SDP negotiation happens through the signaling
/// collaborator before this type exists; it only wraps an already-open
/// `RTCDataChannel`.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;

use crate::error::EngineError;
use crate::framing::{decode_frame, encode_frame, Frame};
use crate::transport::{Transport, TransportKind, DRAIN_POLL_INTERVAL_MS};

/// Threshold above which `await_drain` keeps polling (bytes).
const DRAIN_THRESHOLD: usize = 1024 * 1024;

pub struct DataChannelTransport {
    channel: Arc<RTCDataChannel>,
    max_payload: usize,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl DataChannelTransport {
    /// Wrap an open data channel. `max_message_size` is whatever the
    /// channel negotiated; `max_payload` reserves 16 bytes for flag + ack
    /// header per §4.2.
    pub async fn new(channel: Arc<RTCDataChannel>, max_message_size: usize) -> Self {
        let max_payload = max_message_size.saturating_sub(16).max(crate::framing::MIN_MAX_PAYLOAD);

        let (tx, rx) = mpsc::unbounded_channel();
        channel
            .on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Ok(frame) = decode_frame(&msg.data) {
                        let _ = tx.send(frame);
                    }
                })
            }))
            .await;

        Self {
            channel,
            max_payload,
            inbound_rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Transport for DataChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DataChannel
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), EngineError> {
        let bytes = encode_frame(frame.flag, &frame.payload);
        self.channel
            .send(&Bytes::from(bytes))
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Frame>, EngineError> {
        let mut rx = self.inbound_rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn await_drain(&self) {
        loop {
            let amount = self.channel.buffered_amount().await;
            if amount <= DRAIN_THRESHOLD {
                return;
            }
            sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
    }

    async fn close(&self) {
        let _ = self.channel.close().await;
    }
}
