use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signaling::{SignalPayload, TransportProtocol};

/// Create a transfer request against the signaling service (§6).
#[derive(Debug, Serialize)]
pub struct CreateRequest {
    pub target_client_id: Uuid,
    pub supports_direct: bool,
    pub peer_pin: Option<String>,
    pub preferred_protocol: Option<TransportProtocol>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequestResponse {
    pub request_id: Uuid,
}

/// Accept a transfer request.
#[derive(Debug, Serialize)]
pub struct AcceptRequest {
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub supports_direct: bool,
}

/// Discard/reject a transfer request.
#[derive(Debug, Serialize)]
pub struct DiscardRequest {
    pub request_id: Uuid,
}

/// Post an SDP/ICE signaling payload to the peer via the signaling service.
#[derive(Debug, Serialize)]
pub struct PostSignaling {
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub payload: SignalPayload,
}

#[derive(Debug, Deserialize)]
pub struct PeerListResponse {
    pub peers: Vec<Uuid>,
}
