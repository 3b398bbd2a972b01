/// Per-file sender pipeline (§4.6). One call drives one `FileMetadata`
/// through META, META-ACK, chunked DATA, and optional per-packet ACK.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::EngineError;
use crate::framing::{decode_ack_header, encode_data_payload, Frame, FLAG_ACK, FLAG_DATA, FLAG_META};
use crate::logging::{EngineEvent, EngineLog, EngineLogger};
use crate::metadata::FileMetadata;
use crate::progress::{Progress, ProgressEstimator};
use crate::session::Session;
use crate::transport::TransportKind;

const META_ACK_TIMEOUT: Duration = Duration::from_millis(5000);
const DATA_ACK_TIMEOUT: Duration = Duration::from_millis(5000);
/// Total attempts per packet when `enable_ack` is set: 1 initial send plus
/// 3 retries (§4.6 step 6).
const MAX_SEND_ATTEMPTS: u8 = 4;

/// Waits for ACKs belonging to one file, fed by a subscription registered
/// for the lifetime of `send_file`.
struct AckWaiter {
    file_seq: u32,
    acked: std::sync::Mutex<HashSet<u32>>,
    notify: tokio::sync::Notify,
}

impl AckWaiter {
    fn new(file_seq: u32) -> Arc<Self> {
        Arc::new(Self {
            file_seq,
            acked: std::sync::Mutex::new(HashSet::new()),
            notify: tokio::sync::Notify::new(),
        })
    }

    fn on_frame(&self, frame: Frame) {
        if let Ok((file_seq, packet_seq)) = decode_ack_header(&frame.payload) {
            if file_seq == self.file_seq {
                self.acked.lock().unwrap().insert(packet_seq);
                self.notify.notify_waiters();
            }
        }
    }

    async fn wait_for(&self, packet_seq: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acked.lock().unwrap().contains(&packet_seq) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

/// Drive one file to completion or abort. `on_progress` receives throttled
/// snapshots (§4.6 step 7); pass a no-op closure to ignore them. Returns
/// `Ok(())` on a clean finish and an `EngineError` describing the abort
/// reason otherwise; either way the session itself remains open (§5
/// "cancellation").
pub async fn send_file(
    session: &Arc<Session>,
    mut metadata: FileMetadata,
    mut source: impl AsyncRead + Unpin,
    logger: &Arc<dyn EngineLogger>,
    mut on_progress: impl FnMut(Progress),
) -> Result<(), EngineError> {
    let file_seq = session.next_file_seq();
    metadata.seq = file_seq;
    let size = metadata.size;

    logger.log(EngineLog {
        component: "sender",
        request_id: session.request_id,
        event: EngineEvent::FileStarted { file_seq, size },
    });

    let waiter = AckWaiter::new(file_seq);
    let waiter_for_sub = Arc::clone(&waiter);
    let _ack_subscription = session.on(
        FLAG_ACK,
        Arc::new(move |frame| waiter_for_sub.on_frame(frame)),
    );

    let meta_json = serde_json::to_vec(&metadata).expect("FileMetadata always serializes");
    if session.send(Frame::new(FLAG_META, meta_json)).await.is_err() {
        return abort(logger, session.request_id, file_seq, "transport send failed");
    }

    if !waiter.wait_for(0, META_ACK_TIMEOUT).await {
        return abort(logger, session.request_id, file_seq, "meta-ack timeout");
    }

    let chunk_size = match session.transport_kind() {
        TransportKind::DataChannel => session.max_payload().saturating_sub(8),
        TransportKind::Socket => 64 * 1024,
    };

    let mut next_packet_seq: u32 = 0;
    let mut transmitted: u64 = 0;
    let mut estimator = ProgressEstimator::new(file_seq, size, Instant::now());
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let filled = match read_chunk(
            &mut source,
            &mut buf,
            matches!(session.transport_kind(), TransportKind::DataChannel),
        )
        .await
        {
            Ok(filled) => filled,
            Err(_) => {
                return abort(logger, session.request_id, file_seq, "source read error");
            }
        };
        if filled == 0 {
            break;
        }

        next_packet_seq += 1;
        let payload = encode_data_payload(file_seq, next_packet_seq, &buf[..filled]);

        if session.send(Frame::new(FLAG_DATA, payload)).await.is_err() {
            return abort(logger, session.request_id, file_seq, "transport send failed");
        }

        if session.enable_ack() {
            let mut delivered = waiter.wait_for(next_packet_seq, DATA_ACK_TIMEOUT).await;
            let mut attempt = 1;
            while !delivered && attempt < MAX_SEND_ATTEMPTS {
                attempt += 1;
                logger.log(EngineLog {
                    component: "sender",
                    request_id: session.request_id,
                    event: EngineEvent::PacketRetransmitted {
                        file_seq,
                        packet_seq: next_packet_seq,
                        attempt,
                    },
                });
                let retry = encode_data_payload(file_seq, next_packet_seq, &buf[..filled]);
                if session.send(Frame::new(FLAG_DATA, retry)).await.is_err() {
                    return abort(logger, session.request_id, file_seq, "transport send failed");
                }
                delivered = waiter.wait_for(next_packet_seq, DATA_ACK_TIMEOUT).await;
            }
            if !delivered {
                logger.log(EngineLog {
                    component: "sender",
                    request_id: session.request_id,
                    event: EngineEvent::FileAborted {
                        file_seq,
                        reason: "ack timeout after all retries".into(),
                    },
                });
                return Err(EngineError::AckTimeout { file_seq });
            }
        }

        transmitted += filled as u64;
        if let Some(progress) = estimator.record(filled as u64, Instant::now()) {
            on_progress(progress);
        }
    }

    logger.log(EngineLog {
        component: "sender",
        request_id: session.request_id,
        event: EngineEvent::FileCompleted {
            file_seq,
            bytes: transmitted,
        },
    });
    Ok(())
}

/// Fill `buf` as close to full as possible for the datachannel variant
/// (re-chunking, §4.6 step 4); for the socket variant, a single `read`
/// call's natural size is used as-is. Returns the number of valid bytes,
/// `0` on clean EOF.
async fn read_chunk(
    source: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
    fill_exact: bool,
) -> std::io::Result<usize> {
    if !fill_exact {
        return source.read(buf).await;
    }
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn abort(
    logger: &Arc<dyn EngineLogger>,
    request_id: uuid::Uuid,
    file_seq: u32,
    reason: &str,
) -> Result<(), EngineError> {
    logger.log(EngineLog {
        component: "sender",
        request_id,
        event: EngineEvent::FileAborted {
            file_seq,
            reason: reason.to_string(),
        },
    });
    Err(EngineError::StreamAborted { file_seq })
}
