/// Signaling collaborator contract (§4.8, §4.8.1).
///
/// The engine never performs HTTP/SSE I/O itself; it depends on this
/// trait plus a push-event stream so an application shell can plug in a
/// `reqwest`-based client (or anything else) without the engine knowing
/// the transport. Request/response/event payloads live in `relay-types`
/// so the engine and a shell's HTTP adapter share one vocabulary.
use async_trait::async_trait;
use futures_util::Stream;
use uuid::Uuid;

use relay_types::{
    AcceptRequest, CreateRequest, CreateRequestResponse, DiscardRequest, PeerEvent,
    PeerListResponse, PostSignaling,
};

/// Command verbs the engine issues against the signaling service (§6).
/// Implementations are expected to be thin HTTP adapters; errors are left
/// as `anyhow::Error` since the concrete failure modes (connection reset,
/// non-2xx status, malformed body) belong to the adapter, not the engine.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn create_request(&self, req: CreateRequest) -> anyhow::Result<CreateRequestResponse>;

    async fn accept_request(&self, req: AcceptRequest) -> anyhow::Result<()>;

    async fn discard_request(&self, req: DiscardRequest) -> anyhow::Result<()>;

    async fn post_signaling(&self, req: PostSignaling) -> anyhow::Result<()>;

    async fn list_peers(&self) -> anyhow::Result<PeerListResponse>;
}

/// A push-event source (server-sent events or equivalent, §6) delivering
/// `PeerEvent`s out of band from the data transport. Boxed so callers
/// don't need to name the concrete SSE/WebSocket stream type.
pub type PeerEventStream = std::pin::Pin<Box<dyn Stream<Item = PeerEvent> + Send>>;

/// Identifies the local client to the signaling service, kept alongside
/// (not inside) a `Session`: client id / PIN / push-subscription liveness
/// are signaling-adjacent state, injected by the application shell rather
/// than read from any global (SPEC_FULL.md §9 "Global state").
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub client_id: Uuid,
    pub peer_pin: Option<String>,
}
