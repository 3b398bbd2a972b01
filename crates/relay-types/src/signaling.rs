use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Push events delivered by the signaling service's event subscription (§6).
///
/// These are consumed by an application shell, not produced here; this crate
/// only carries the wire shape so a shell's HTTP/SSE client and the engine
/// agree on one vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerEvent {
    /// A peer client came online.
    UserConnected { client_id: Uuid },

    /// A peer client went offline.
    UserDisconnected { client_id: Uuid },

    /// Another client asked to open a transfer with us.
    P2pRequest { request_id: Uuid },

    /// The signaling service paired a request and picked a transport.
    P2pExchange {
        request_id: Uuid,
        protocol: TransportProtocol,
        participants: Vec<Uuid>,
    },

    /// SDP/ICE signaling payload relayed from the peer.
    P2pSignaling {
        request_id: Uuid,
        signal: SignalPayload,
    },

    /// The peer rejected our transfer request.
    P2pReject { request_id: Uuid },
}

/// Transport kind agreed during signaling exchange. Named distinctly from
/// `relay_protocol::TransportKind` so this crate has no engine dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Webrtc,
    Websocket,
}

/// SDP/ICE payload exchanged through `P2pSignaling` / `PostSignaling`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SignalPayload {
    Sdp { sdp: String },
    Ice {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}
