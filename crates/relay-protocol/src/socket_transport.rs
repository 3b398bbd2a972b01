/// Socket transport variant (§4.2): reliable, ordered, stream-oriented,
/// relayed through the relay binary (SPEC_FULL.md §2.2). After connecting,
/// the client sends PROXY_WHO and waits for PROXY_CONNECTION_ESTABLISHED
/// before the session's own handshake (§4.3) begins.
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::EngineError;
use crate::framing::{
    decode_frame, decode_proxy_who, encode_frame, encode_proxy_who, Frame,
    FLAG_PROXY_CONNECTION_CLOSE, FLAG_PROXY_CONNECTION_ESTABLISHED, FLAG_PROXY_WHO,
};
use crate::transport::{Transport, TransportKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Send and receive halves are split and independently locked (the way
/// `haven-gateway::connection::handle_connection` splits a socket into
/// `sender`/`receiver` before handing each to its own task), so a
/// `recv()` parked waiting on the next inbound frame never blocks a
/// concurrent `send_frame` — required for the full-duplex socket variant
/// (§1, §4.2).
pub struct SocketTransport {
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
    max_payload: usize,
}

impl SocketTransport {
    /// Connect to `relay_url`, perform the PROXY_WHO handshake, and block
    /// until PROXY_CONNECTION_ESTABLISHED (or PROXY_ERROR/close) arrives.
    pub async fn connect(
        relay_url: &str,
        request_id: Uuid,
        local_id: Uuid,
    ) -> Result<Self, EngineError> {
        let (mut stream, _response) = tokio_tungstenite::connect_async(relay_url)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let who = encode_frame(FLAG_PROXY_WHO, &encode_proxy_who(request_id, local_id));
        stream
            .send(Message::Binary(who.into()))
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    let frame = decode_frame(&bytes)
                        .map_err(|e| EngineError::Transport(e.to_string()))?;
                    if frame.flag == FLAG_PROXY_CONNECTION_ESTABLISHED {
                        break;
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EngineError::Transport(e.to_string())),
                None => return Err(EngineError::Transport("relay closed before pairing".into())),
            }
        }

        let (write, read) = stream.split();

        Ok(Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
            // Reliable/ordered relay: no WebRTC message-size ceiling, so the
            // session default applies verbatim.
            max_payload: crate::framing::DEFAULT_MAX_PAYLOAD,
        })
    }

    /// Verify the embedded request_id, used when decoding a received
    /// PROXY_WHO on the relay's own side (see `relay-server`).
    pub fn verify_proxy_who(body: &[u8], expected: Uuid) -> Option<Uuid> {
        let (request_id, local_id) = decode_proxy_who(body).ok()?;
        (request_id == expected).then_some(local_id)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), EngineError> {
        let bytes = encode_frame(frame.flag, &frame.payload);
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Frame>, EngineError> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    let frame = decode_frame(&bytes)
                        .map_err(|e| EngineError::Transport(e.to_string()))?;
                    if frame.flag == FLAG_PROXY_CONNECTION_CLOSE {
                        return Err(EngineError::RelayAbnormalClose);
                    }
                    return Ok(Some(frame));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EngineError::Transport(e.to_string())),
            }
        }
    }

    async fn await_drain(&self) {
        // The underlying TCP stream already backpressures through `send`
        // itself (it won't return until the OS socket buffer accepts the
        // write), so there is no separate buffered-amount to poll here.
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.close().await;
    }
}
