/// Structured logging for session and file lifecycle events.
///
/// The engine never calls `tracing` macros directly from its hot path;
/// instead it routes through this trait so an embedder can redirect
/// lifecycle logs to a UI console, discard them, or let them flow to
/// `tracing` as-is.
use std::fmt;

/// A single structured log entry emitted by the engine.
#[derive(Debug, Clone)]
pub struct EngineLog {
    pub component: &'static str,
    pub request_id: uuid::Uuid,
    pub event: EngineEvent,
}

/// Loggable engine lifecycle events.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionReady,
    ConnectionClose { code: u16, reason: String },
    ConnectionError { message: String },
    RttUpdated { rtt_ms: u64 },
    FileStarted { file_seq: u32, size: u64 },
    FileAborted { file_seq: u32, reason: String },
    FileCompleted { file_seq: u32, bytes: u64 },
    PacketRetransmitted { file_seq: u32, packet_seq: u32, attempt: u8 },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionReady => write!(f, "connection_ready"),
            Self::ConnectionClose { code, reason } => {
                write!(f, "connection_close code={code} reason={reason}")
            }
            Self::ConnectionError { message } => write!(f, "connection_error message={message}"),
            Self::RttUpdated { rtt_ms } => write!(f, "rtt_updated rtt_ms={rtt_ms}"),
            Self::FileStarted { file_seq, size } => {
                write!(f, "file_started file_seq={file_seq} size={size}")
            }
            Self::FileAborted { file_seq, reason } => {
                write!(f, "file_aborted file_seq={file_seq} reason={reason}")
            }
            Self::FileCompleted { file_seq, bytes } => {
                write!(f, "file_completed file_seq={file_seq} bytes={bytes}")
            }
            Self::PacketRetransmitted {
                file_seq,
                packet_seq,
                attempt,
            } => write!(
                f,
                "packet_retransmitted file_seq={file_seq} packet_seq={packet_seq} attempt={attempt}"
            ),
        }
    }
}

/// Trait for engine logging. Implementations can route logs to `tracing`,
/// forward them over a side channel, or discard them.
pub trait EngineLogger: Send + Sync {
    fn log(&self, entry: EngineLog);
}

/// Logger that routes lifecycle events to `info!` and per-packet noise to
/// `debug!`.
pub struct TracingLogger;

impl EngineLogger for TracingLogger {
    fn log(&self, entry: EngineLog) {
        match &entry.event {
            EngineEvent::PacketRetransmitted { .. } => {
                tracing::debug!(
                    component = entry.component,
                    request_id = %entry.request_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    request_id = %entry.request_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all entries.
pub struct NullLogger;

impl EngineLogger for NullLogger {
    fn log(&self, _entry: EngineLog) {}
}
