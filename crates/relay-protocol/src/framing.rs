/// Wire frame format for the peer-to-peer transfer protocol.
///
/// ```text
/// [0]    flag (1 byte)
/// [1..]  payload (0..max_payload-1 bytes)
/// ```
///
/// There is no length prefix: the transport already delimits messages
/// (a WebSocket/WebRTC message boundary, or a length-framed relay hop).
/// DATA and ACK payloads begin with an `AckHeader`.
use crate::error::FramingError;

/// Control and data flags, client range 0x01–0xEF.
pub const FLAG_PING: u8 = 0x01;
pub const FLAG_PONG: u8 = 0x02;
pub const FLAG_META: u8 = 0x03;
pub const FLAG_DATA: u8 = 0x04;
pub const FLAG_SHAKEHAND: u8 = 0x05;
pub const FLAG_ACK: u8 = 0x06;
pub const FLAG_PEER_CLOSE: u8 = 0x07;

/// Relay-reserved flags, 0xF0–0xFF. Only the socket transport variant and
/// the relay binary interpret these; they never reach the session's
/// subscription table.
pub const FLAG_PROXY_CONNECTION_READY: u8 = 0xF1;
pub const FLAG_PROXY_CONNECTION_ESTABLISHED: u8 = 0xF2;
pub const FLAG_PROXY_CONNECTION_CLOSE: u8 = 0xF3;
pub const FLAG_PROXY_WHO: u8 = 0xF4;
pub const FLAG_PROXY_HEARTBEAT: u8 = 0xFE;
pub const FLAG_PROXY_ERROR: u8 = 0xFF;

/// Length of the `AckHeader` prefix on DATA and ACK payloads.
pub const ACK_HEADER_LEN: usize = 8;

/// Minimum discoverable max payload (§3 Session.max_payload).
pub const MIN_MAX_PAYLOAD: usize = 1024;

/// Default max payload before handshake negotiates a real value.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// A single wire frame: one flag byte plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(flag: u8, payload: Vec<u8>) -> Self {
        Self { flag, payload }
    }
}

/// Encode a frame to its wire representation: `flag ‖ payload`.
pub fn encode_frame(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(flag);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a wire message into its flag and payload.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FramingError> {
    let (&flag, payload) = bytes.split_first().ok_or(FramingError::Empty)?;
    Ok(Frame {
        flag,
        payload: payload.to_vec(),
    })
}

/// The 8-byte `(file_seq, packet_seq)` prefix carried by DATA and ACK payloads.
/// Both fields are little-endian `u32`.
pub fn encode_ack_header(file_seq: u32, packet_seq: u32) -> [u8; ACK_HEADER_LEN] {
    let mut out = [0u8; ACK_HEADER_LEN];
    out[0..4].copy_from_slice(&file_seq.to_le_bytes());
    out[4..8].copy_from_slice(&packet_seq.to_le_bytes());
    out
}

/// Decode an `AckHeader` from the first 8 bytes of a slice.
pub fn decode_ack_header(bytes: &[u8]) -> Result<(u32, u32), FramingError> {
    if bytes.len() < ACK_HEADER_LEN {
        return Err(FramingError::TruncatedAckHeader { got: bytes.len() });
    }
    let file_seq = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let packet_seq = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    Ok((file_seq, packet_seq))
}

/// Build a DATA frame payload: `AckHeader(file_seq, packet_seq) ‖ chunk`.
pub fn encode_data_payload(file_seq: u32, packet_seq: u32, chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ACK_HEADER_LEN + chunk.len());
    buf.extend_from_slice(&encode_ack_header(file_seq, packet_seq));
    buf.extend_from_slice(chunk);
    buf
}

/// Split a DATA frame payload back into its header and body.
pub fn decode_data_payload(payload: &[u8]) -> Result<(u32, u32, &[u8]), FramingError> {
    let (file_seq, packet_seq) = decode_ack_header(payload)?;
    Ok((file_seq, packet_seq, &payload[ACK_HEADER_LEN..]))
}

/// PING/PONG body: `tag(4) ‖ seq:u16_LE ‖ timestamp_ms:u64_LE` (14 bytes).
pub const LIVENESS_BODY_LEN: usize = 14;

pub fn encode_ping(seq: u16, timestamp_ms: u64) -> Vec<u8> {
    encode_liveness_body(b"ping", seq, timestamp_ms)
}

pub fn encode_pong(seq: u16, timestamp_ms: u64) -> Vec<u8> {
    encode_liveness_body(b"pong", seq, timestamp_ms)
}

fn encode_liveness_body(tag: &[u8; 4], seq: u16, timestamp_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LIVENESS_BODY_LEN);
    buf.extend_from_slice(tag);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&timestamp_ms.to_le_bytes());
    buf
}

/// Decode a PING/PONG body, checking the 4-byte tag matches.
pub fn decode_liveness_body(tag: &[u8; 4], body: &[u8]) -> Option<(u16, u64)> {
    if body.len() != LIVENESS_BODY_LEN || &body[0..4] != tag {
        return None;
    }
    let seq = u16::from_le_bytes(body[4..6].try_into().unwrap());
    let ts = u64::from_le_bytes(body[6..14].try_into().unwrap());
    Some((seq, ts))
}

/// SHAKEHAND body: `uuid16(request_id) ‖ u64_LE(now_ms)`.
pub fn encode_shakehand(request_id: uuid::Uuid, now_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(request_id.as_bytes());
    buf.extend_from_slice(&now_ms.to_le_bytes());
    buf
}

pub fn decode_shakehand(body: &[u8]) -> Result<(uuid::Uuid, u64), FramingError> {
    if body.len() != 24 {
        return Err(FramingError::TruncatedShakehand { got: body.len() });
    }
    let request_id = uuid::Uuid::from_slice(&body[0..16]).unwrap();
    let now_ms = u64::from_le_bytes(body[16..24].try_into().unwrap());
    Ok((request_id, now_ms))
}

/// PROXY_WHO body: `uuid16(request_id) ‖ uuid16(local_id)`.
pub fn encode_proxy_who(request_id: uuid::Uuid, local_id: uuid::Uuid) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(request_id.as_bytes());
    buf.extend_from_slice(local_id.as_bytes());
    buf
}

pub fn decode_proxy_who(body: &[u8]) -> Result<(uuid::Uuid, uuid::Uuid), FramingError> {
    if body.len() != 32 {
        return Err(FramingError::TruncatedProxyWho { got: body.len() });
    }
    let request_id = uuid::Uuid::from_slice(&body[0..16]).unwrap();
    let local_id = uuid::Uuid::from_slice(&body[16..32]).unwrap();
    Ok((request_id, local_id))
}
