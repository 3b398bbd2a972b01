/// Per-file receiver pipeline (§4.7). Subscribes to META/DATA, reassembles
/// one file in packet_seq order through a bounded reorder buffer, and
/// delivers bodies to a sink.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::framing::{decode_ack_header, encode_ack_header, Frame, FLAG_ACK, FLAG_DATA};
use crate::logging::{EngineEvent, EngineLog, EngineLogger};
use crate::metadata::FileMetadata;
use crate::progress::{Progress, ProgressEstimator};
use crate::session::Session;

/// Reorder buffer capacity; exceeding it aborts the file (§3 FileTransfer,
/// §5 "receiver overflow threshold").
const REORDER_CAPACITY: usize = 16;

/// Accept exactly one META frame for `expected_seq`, reply with its
/// META-ACK, then deliver DATA frames in order to `sink` until the file
/// completes or aborts. Multiple files interleave on the wire; run one
/// call of this function per file, each spawned as soon as its META
/// arrives.
pub async fn receive_file(
    session: &Arc<Session>,
    expected_seq: u32,
    metadata: FileMetadata,
    mut sink: impl AsyncWrite + Unpin,
    logger: &Arc<dyn EngineLogger>,
    mut on_progress: impl FnMut(Progress),
) -> Result<(), EngineError> {
    let size = metadata.size;
    logger.log(EngineLog {
        component: "receiver",
        request_id: session.request_id,
        event: EngineEvent::FileStarted {
            file_seq: expected_seq,
            size,
        },
    });

    let ack = encode_ack_header(expected_seq, 0).to_vec();
    if session.send(Frame::new(FLAG_ACK, ack)).await.is_err() {
        return abort(logger, session.request_id, expected_seq, "transport send failed");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _data_subscription = {
        let tx = tx.clone();
        session.on(
            FLAG_DATA,
            Arc::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
    };

    let aborted = Arc::new(AtomicBool::new(false));
    let out_of_order: Mutex<BTreeMap<u32, Vec<u8>>> = Mutex::new(BTreeMap::new());
    let mut next_expected_packet: u32 = 1;
    let mut received_bytes: u64 = 0;
    let mut estimator = ProgressEstimator::new(expected_seq, size, Instant::now());

    loop {
        if received_bytes >= size {
            break;
        }
        let Some(frame) = rx.recv().await else {
            return abort(
                logger,
                session.request_id,
                expected_seq,
                "stream terminated abnormally",
            );
        };

        let (file_seq, packet_seq, body) = match decode_ack_header(&frame.payload) {
            Ok((file_seq, packet_seq)) => {
                let header_len = crate::framing::ACK_HEADER_LEN;
                (file_seq, packet_seq, frame.payload[header_len..].to_vec())
            }
            Err(_) => continue,
        };
        if file_seq != expected_seq {
            // Belongs to another concurrent file's pipeline; ignore.
            continue;
        }

        if packet_seq > next_expected_packet {
            let mut buffer = out_of_order.lock().unwrap();
            if !buffer.contains_key(&packet_seq) && buffer.len() >= REORDER_CAPACITY {
                drop(buffer);
                aborted.store(true, Ordering::Relaxed);
                return abort_buffer_exhausted(logger, session.request_id, expected_seq);
            }
            buffer.insert(packet_seq, body);
            continue;
        }

        if packet_seq < next_expected_packet {
            // Duplicate delivery (e.g. a retransmit whose ACK was lost);
            // already delivered, nothing to do.
            continue;
        }

        deliver(
            &mut sink,
            &body,
            expected_seq,
            next_expected_packet,
            &mut received_bytes,
            session,
        )
        .await?;
        next_expected_packet += 1;

        loop {
            let next = {
                let mut buffer = out_of_order.lock().unwrap();
                buffer.remove(&next_expected_packet)
            };
            let Some(buffered_body) = next else { break };
            deliver(
                &mut sink,
                &buffered_body,
                expected_seq,
                next_expected_packet,
                &mut received_bytes,
                session,
            )
            .await?;
            next_expected_packet += 1;
        }

        if let Some(progress) = estimator.record(body_len_delta(&body), Instant::now()) {
            on_progress(progress);
        }
    }

    let _ = sink.flush().await;
    logger.log(EngineLog {
        component: "receiver",
        request_id: session.request_id,
        event: EngineEvent::FileCompleted {
            file_seq: expected_seq,
            bytes: received_bytes,
        },
    });
    Ok(())
}

fn body_len_delta(body: &[u8]) -> u64 {
    body.len() as u64
}

async fn deliver(
    sink: &mut (impl AsyncWrite + Unpin),
    body: &[u8],
    file_seq: u32,
    delivered_packet_seq: u32,
    received_bytes: &mut u64,
    session: &Arc<Session>,
) -> Result<(), EngineError> {
    if sink.write_all(body).await.is_err() {
        // §7 "Packet sequence violation": an unexpected gap that cannot be
        // filled from the reorder buffer, here because the sink itself
        // rejected a delivery.
        return Err(EngineError::SequenceViolation { file_seq });
    }
    *received_bytes += body.len() as u64;
    if session.enable_ack() {
        let ack = encode_ack_header(file_seq, delivered_packet_seq).to_vec();
        let _ = session.send(Frame::new(FLAG_ACK, ack)).await;
    }
    Ok(())
}

fn abort(
    logger: &Arc<dyn EngineLogger>,
    request_id: uuid::Uuid,
    file_seq: u32,
    reason: &str,
) -> Result<(), EngineError> {
    logger.log(EngineLog {
        component: "receiver",
        request_id,
        event: EngineEvent::FileAborted {
            file_seq,
            reason: reason.to_string(),
        },
    });
    Err(EngineError::StreamAborted { file_seq })
}

/// Reorder buffer overflow (§3 FileTransfer, §7 "buffer exhaustion") gets
/// its own typed variant rather than the generic `StreamAborted`, so
/// callers can match on it instead of the logged string.
fn abort_buffer_exhausted(
    logger: &Arc<dyn EngineLogger>,
    request_id: uuid::Uuid,
    file_seq: u32,
) -> Result<(), EngineError> {
    logger.log(EngineLog {
        component: "receiver",
        request_id,
        event: EngineEvent::FileAborted {
            file_seq,
            reason: "lack of buffer space".to_string(),
        },
    });
    Err(EngineError::BufferExhausted {
        file_seq,
        capacity: REORDER_CAPACITY,
    })
}

/// Parse an inbound META frame's JSON payload (§4.7 trigger step).
pub fn parse_meta(payload: &[u8]) -> Result<FileMetadata, EngineError> {
    serde_json::from_slice(payload).map_err(|_| EngineError::InvalidMetadata)
}
