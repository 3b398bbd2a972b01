//! Glue between the session's subscription table and the per-file receiver
//! pipeline (§4.7: "Triggered by receipt of a META frame"). Subscribes to
//! META once for the session's lifetime and spawns one `receive_file` task
//! per incoming file, so multiple files interleaving on the wire (§8
//! scenario 2) each get their own demultiplexed pipeline without the
//! caller having to wire up META handling by hand.
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::AsyncWrite;

use crate::logging::EngineLogger;
use crate::metadata::FileMetadata;
use crate::progress::Progress;
use crate::receiver::{parse_meta, receive_file};
use crate::session::{Session, SubscriptionHandle};

/// Opens a sink for a newly announced file. Called synchronously from the
/// session's dispatch path, so implementations should not block (e.g.
/// pre-create the file handle and hand back the already-open writer).
pub type SinkOpener =
    Box<dyn Fn(&FileMetadata) -> Pin<Box<dyn AsyncWrite + Unpin + Send>> + Send + Sync>;

/// Progress callback invoked with each file's throttled snapshot (§4.7
/// "Publication cadence mirrors the sender").
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Subscribe to META frames and spawn a `receive_file` task for each one.
/// Returns a handle that, when dropped, unregisters the META subscription
/// (in-flight per-file tasks already spawned keep running to completion or
/// abort on their own terms, per §5 "file send/recv is cancelled... but
/// leaves the session open").
pub fn spawn_receiver_manager(
    session: Arc<Session>,
    logger: Arc<dyn EngineLogger>,
    open_sink: SinkOpener,
    on_progress: ProgressCallback,
) -> SubscriptionHandle {
    let open_sink = Arc::new(open_sink);
    let session_for_sub = Arc::clone(&session);

    session_for_sub.on(
        crate::framing::FLAG_META,
        Arc::new(move |frame| {
            let Ok(metadata) = parse_meta(&frame.payload) else {
                return;
            };
            let sink = (open_sink)(&metadata);
            let session = Arc::clone(&session);
            let logger = Arc::clone(&logger);
            let on_progress = Arc::clone(&on_progress);
            let file_seq = metadata.seq;

            tokio::spawn(async move {
                let _ = receive_file(&session, file_seq, metadata, sink, &logger, move |p| {
                    on_progress(p)
                })
                .await;
            });
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;
    use crate::loopback_transport::LoopbackTransport;
    use crate::session::{Role, SessionConfig};
    use crate::transport::{Transport, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn spawns_one_receiver_per_incoming_file() {
        let (receiver_transport, peer_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (session, _lifecycle) = Session::new(
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
            Role::Receiver,
            Arc::new(receiver_transport),
            SessionConfig {
                enable_ack: Some(false),
            },
            Arc::new(NullLogger) as Arc<dyn EngineLogger>,
        );

        let completions: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let completions_for_sink = Arc::clone(&completions);
        let opened = Arc::new(AtomicUsize::new(0));
        let opened_for_open = Arc::clone(&opened);

        struct RecordingSink {
            store: Arc<Mutex<Vec<Vec<u8>>>>,
            buf: Vec<u8>,
        }
        impl AsyncWrite for RecordingSink {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                let this = self.get_mut();
                this.buf.extend_from_slice(buf);
                std::task::Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let this = self.get_mut();
                this.store.lock().unwrap().push(this.buf.clone());
                std::task::Poll::Ready(Ok(()))
            }
        }

        let open_sink: SinkOpener = Box::new(move |_meta| {
            opened_for_open.fetch_add(1, Ordering::Relaxed);
            Box::pin(RecordingSink {
                store: Arc::clone(&completions_for_sink),
                buf: Vec::new(),
            })
        });

        let _handle = spawn_receiver_manager(
            Arc::clone(&session),
            Arc::new(NullLogger),
            open_sink,
            Arc::new(|_p: Progress| {}),
        );

        let peer = Arc::new(peer_transport);
        {
            use crate::framing::{encode_data_payload, Frame, FLAG_DATA, FLAG_META};
            let meta = FileMetadata {
                seq: 0,
                name: "a.txt".into(),
                mime: "text/plain".into(),
                size: 3,
                mtime: 0,
                origin_ts: 0,
            };
            peer.send_frame(Frame::new(
                FLAG_META,
                serde_json::to_vec(&meta).unwrap(),
            ))
            .await
            .unwrap();
            let _ = peer.recv().await; // META-ACK
            peer.send_frame(Frame::new(FLAG_DATA, encode_data_payload(0, 1, b"abc")))
                .await
                .unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(opened.load(Ordering::Relaxed), 1);
        assert_eq!(completions.lock().unwrap().as_slice(), &[b"abc".to_vec()]);
    }

    /// §8 scenario 2: two files interleaved on the wire (META(0), META(1),
    /// DATA(0,1), DATA(1,1), DATA(0,2), DATA(1,2)) demultiplex into two
    /// independent sinks regardless of interleaving.
    #[tokio::test]
    async fn demultiplexes_two_interleaved_files() {
        let (receiver_transport, peer_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (session, _lifecycle) = Session::new(
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
            Role::Receiver,
            Arc::new(receiver_transport),
            SessionConfig {
                enable_ack: Some(false),
            },
            Arc::new(NullLogger) as Arc<dyn EngineLogger>,
        );

        struct RecordingSink {
            store: Arc<Mutex<std::collections::HashMap<u32, Vec<u8>>>>,
            file_seq: u32,
            buf: Vec<u8>,
        }
        impl AsyncWrite for RecordingSink {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                let this = self.get_mut();
                this.buf.extend_from_slice(buf);
                std::task::Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let this = self.get_mut();
                this.store
                    .lock()
                    .unwrap()
                    .insert(this.file_seq, this.buf.clone());
                std::task::Poll::Ready(Ok(()))
            }
        }

        let sinks: Arc<Mutex<std::collections::HashMap<u32, Vec<u8>>>> =
            Arc::new(Mutex::new(std::collections::HashMap::new()));
        let sinks_for_open = Arc::clone(&sinks);
        let open_sink: SinkOpener = Box::new(move |meta| {
            Box::pin(RecordingSink {
                store: Arc::clone(&sinks_for_open),
                file_seq: meta.seq,
                buf: Vec::new(),
            })
        });

        let _handle = spawn_receiver_manager(
            Arc::clone(&session),
            Arc::new(NullLogger),
            open_sink,
            Arc::new(|_p: Progress| {}),
        );

        let peer = Arc::new(peer_transport);
        {
            use crate::framing::{encode_data_payload, Frame, FLAG_DATA, FLAG_META};
            let meta_of = |seq: u32| FileMetadata {
                seq,
                name: format!("f{seq}.txt"),
                mime: "text/plain".into(),
                size: 2,
                mtime: 0,
                origin_ts: 0,
            };
            peer.send_frame(Frame::new(FLAG_META, serde_json::to_vec(&meta_of(0)).unwrap()))
                .await
                .unwrap();
            peer.send_frame(Frame::new(FLAG_META, serde_json::to_vec(&meta_of(1)).unwrap()))
                .await
                .unwrap();
            let _ = peer.recv().await; // META-ACK for file 0
            let _ = peer.recv().await; // META-ACK for file 1
            peer.send_frame(Frame::new(FLAG_DATA, encode_data_payload(0, 1, b"a")))
                .await
                .unwrap();
            peer.send_frame(Frame::new(FLAG_DATA, encode_data_payload(1, 1, b"x")))
                .await
                .unwrap();
            peer.send_frame(Frame::new(FLAG_DATA, encode_data_payload(0, 2, b"b")))
                .await
                .unwrap();
            peer.send_frame(Frame::new(FLAG_DATA, encode_data_payload(1, 2, b"y")))
                .await
                .unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sinks = sinks.lock().unwrap();
        assert_eq!(sinks.get(&0), Some(&b"ab".to_vec()));
        assert_eq!(sinks.get(&1), Some(&b"xy".to_vec()));
    }
}
