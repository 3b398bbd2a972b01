//! Pairing relay for the Socket transport variant (SPEC_FULL.md §2.2).
//!
//! Accepts WebSocket connections, waits for each to open with a PROXY_WHO
//! frame, pairs two connections sharing a `request_id`, and then forwards
//! every subsequent frame byte-for-byte between the pair until one side
//! disconnects. It never looks past the PROXY_WHO handshake: no users, no
//! requests, no push events — only paired sockets.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_protocol::framing::{
    decode_frame, decode_proxy_who, encode_frame, FLAG_PROXY_CONNECTION_CLOSE,
    FLAG_PROXY_CONNECTION_ESTABLISHED, FLAG_PROXY_WHO,
};

type WsStream = WebSocketStream<TcpStream>;

/// A connection that has announced itself via PROXY_WHO and is waiting for
/// its partner to do the same.
struct PendingPeer {
    local_id: Uuid,
    deliver: oneshot::Sender<(Uuid, WsStream)>,
}

pub struct RelayState {
    pending: RwLock<HashMap<Uuid, PendingPeer>>,
    pairing_timeout: Duration,
}

impl RelayState {
    pub fn new(pairing_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: RwLock::new(HashMap::new()),
            pairing_timeout,
        })
    }

    /// Drive one accepted TCP connection through the WebSocket upgrade,
    /// PROXY_WHO handshake, pairing, and — once paired — frame forwarding.
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("relay: websocket upgrade failed: {e}");
                return;
            }
        };

        let (request_id, local_id, ws) = match self.read_proxy_who(ws).await {
            Some(v) => v,
            None => return,
        };

        self.pair_and_relay(request_id, local_id, ws).await;
    }

    /// Read exactly one frame and require it to be PROXY_WHO (§4.2 Socket
    /// variant: "After opening, the client sends a PROXY_WHO frame").
    async fn read_proxy_who(&self, mut ws: WsStream) -> Option<(Uuid, Uuid, WsStream)> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    let frame = decode_frame(&bytes).ok()?;
                    if frame.flag != FLAG_PROXY_WHO {
                        debug!("relay: expected PROXY_WHO, got flag 0x{:02x}", frame.flag);
                        continue;
                    }
                    let (request_id, local_id) = decode_proxy_who(&frame.payload).ok()?;
                    return Some((request_id, local_id, ws));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("relay: error awaiting PROXY_WHO: {e}");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn pair_and_relay(self: Arc<Self>, request_id: Uuid, local_id: Uuid, ws: WsStream) {
        let existing = self.pending.write().await.remove(&request_id);

        let Some(peer) = existing else {
            // First of the pair: register and wait to be handed the peer's
            // stream, or time out if nobody else shows up.
            let (tx, rx) = oneshot::channel();
            self.pending.write().await.insert(
                request_id,
                PendingPeer {
                    local_id,
                    deliver: tx,
                },
            );

            match tokio::time::timeout(self.pairing_timeout, rx).await {
                Ok(Ok((peer_local_id, peer_ws))) => {
                    info!(
                        "relay: paired request {} ({} <-> {})",
                        request_id, local_id, peer_local_id
                    );
                    run_pair(ws, peer_ws).await;
                }
                Ok(Err(_)) => {
                    // Sender dropped without delivering; nothing to clean up.
                }
                Err(_) => {
                    self.pending.write().await.remove(&request_id);
                    warn!("relay: pairing timed out for request {}", request_id);
                }
            }
            return;
        };

        // Second of the pair: hand our stream to the peer's waiting task,
        // which owns the forwarding loop. Nothing left for us to do.
        if peer.deliver.send((local_id, ws)).is_err() {
            warn!(
                "relay: peer for request {} vanished before handoff",
                request_id
            );
        }
    }
}

/// Forward frames between two paired peers until one disconnects, then
/// best-effort notify the other with PROXY_CONNECTION_CLOSE (§4.2, §4.5
/// "Relay PROXY_CONNECTION_CLOSE while established").
async fn run_pair(mut a: WsStream, mut b: WsStream) {
    let established = Message::Binary(encode_frame(FLAG_PROXY_CONNECTION_ESTABLISHED, &[]).into());
    if a.send(established.clone()).await.is_err() || b.send(established).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = a.next() => {
                match msg {
                    Some(Ok(m)) if !m.is_close() => {
                        if b.send(m).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = b.next() => {
                match msg {
                    Some(Ok(m)) if !m.is_close() => {
                        if a.send(m).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    let close = Message::Binary(encode_frame(FLAG_PROXY_CONNECTION_CLOSE, &[]).into());
    let _ = a.send(close.clone()).await;
    let _ = b.send(close).await;
    let _ = a.close(None).await;
    let _ = b.close(None).await;
}
