//! Peer-to-peer file transfer engine core.
//!
//! Moves files between two end-user clients over one of two interchangeable
//! transports (a WebRTC data channel or a relayed WebSocket), multiplexing
//! multiple concurrent file transfers over a single logical session,
//! preserving per-file ordering, and reporting throughput/ETA to an
//! observer. Connection setup (signaling, ICE/SDP exchange) is consumed
//! through the `signaling` module's trait, not implemented here.

pub mod datachannel_transport;
pub mod error;
pub mod framing;
pub mod liveness;
pub mod logging;
pub mod loopback_transport;
pub mod metadata;
pub mod progress;
pub mod receiver;
pub mod receiver_manager;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod socket_transport;
pub mod transport;

pub use datachannel_transport::DataChannelTransport;
pub use error::{EngineError, FramingError};
pub use framing::{
    decode_ack_header, decode_data_payload, decode_frame, decode_liveness_body,
    decode_proxy_who, decode_shakehand, encode_ack_header, encode_data_payload, encode_frame,
    encode_ping, encode_pong, encode_proxy_who, encode_shakehand, Frame, ACK_HEADER_LEN,
    DEFAULT_MAX_PAYLOAD, MIN_MAX_PAYLOAD,
};
pub use liveness::{Liveness, PongOutcome};
pub use logging::{EngineEvent, EngineLog, EngineLogger, NullLogger, TracingLogger};
pub use loopback_transport::LoopbackTransport;
pub use metadata::FileMetadata;
pub use progress::{Progress, ProgressEstimator};
pub use receiver::receive_file;
pub use receiver_manager::{spawn_receiver_manager, ProgressCallback, SinkOpener};
pub use sender::send_file;
pub use session::{LifecycleEvent, Role, Session, SessionConfig, SessionState, SubscriptionHandle};
pub use signaling::{LocalIdentity, PeerEventStream, SignalingClient};
pub use socket_transport::SocketTransport;
pub use transport::{Transport, TransportKind, DRAIN_POLL_INTERVAL_MS};
