/// Wire contracts for the signaling service consumed by the transfer engine.
///
/// This crate carries no behavior: it is the shared vocabulary between the
/// engine's `SignalingClient` trait (see `relay_protocol::signaling`) and
/// whatever HTTP/SSE client an application shell supplies for it.
pub mod requests;
pub mod signaling;

pub use requests::{
    AcceptRequest, CreateRequest, CreateRequestResponse, DiscardRequest, PeerListResponse,
    PostSignaling,
};
pub use signaling::{PeerEvent, SignalPayload, TransportProtocol};
