/// Session/control loop (§4.5): a single cooperative loop multiplexing
/// inbound frames by flag to subscribers, raising lifecycle events, and
/// mediating handshake/close.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::error::EngineError;
use crate::framing::{
    decode_liveness_body, decode_shakehand, encode_ping, encode_pong, encode_shakehand, Frame,
    FLAG_ACK, FLAG_DATA, FLAG_META, FLAG_PEER_CLOSE, FLAG_PING, FLAG_PONG, FLAG_SHAKEHAND,
};
use crate::liveness::{Liveness, PongOutcome, PING_TIMEOUT};
use crate::logging::{EngineEvent, EngineLog, EngineLogger};
use crate::transport::{Transport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// Lifecycle events raised by the control loop (§4.5).
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    ConnectionReady,
    ConnectionClose { code: u16, reason: &'static str },
    ConnectionError { message: String },
    RttUpdated { rtt_ms: u64 },
}

/// A synchronous callback invoked once per matching inbound frame, in
/// registration order (§4.5). Handlers should not block; they typically
/// forward the frame into a channel owned by a sender/receiver pipeline.
/// Stored as `Arc` rather than `Box` so dispatch can snapshot (clone) the
/// handler list before invoking it, avoiding reentrant locking if a
/// handler unregisters itself mid-dispatch (§9 "Avoid hash reentry during
/// dispatch by snapshotting handlers before invocation").
pub type Handler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Construction-time session configuration.
pub struct SessionConfig {
    /// Per-packet ACK policy (§4.6 step 6). `None` resolves to the
    /// transport-kind default recorded in SPEC_FULL.md §9.
    pub enable_ack: Option<bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { enable_ack: None }
    }
}

type SubscriptionTable = Arc<std::sync::Mutex<HashMap<u8, Vec<(u64, Handler)>>>>;

pub struct Session {
    pub request_id: Uuid,
    pub local_id: Uuid,
    pub role: Role,
    transport: Arc<dyn Transport>,
    state: std::sync::Mutex<SessionState>,
    established: AtomicBool,
    closing: AtomicBool,
    sent_peer_close: AtomicBool,
    rtt_ms: AtomicU64,
    max_payload: AtomicU64,
    enable_ack: bool,
    subscriptions: SubscriptionTable,
    next_sub_id: AtomicU64,
    next_file_seq: AtomicU32,
    liveness: AsyncMutex<Liveness>,
    /// Set while `seed_rtt` is waiting on a specific PING's real reply;
    /// fulfilled by the PONG arm of `dispatch` instead of a fixed sleep
    /// (§4.3 "averages the measured RTTs to seed `rtt_ms`").
    rtt_sample_waiter: AsyncMutex<Option<(u16, oneshot::Sender<Instant>)>>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    logger: Arc<dyn EngineLogger>,
    /// Lets `handle_shakehand` spawn `seed_rtt` as its own task instead of
    /// awaiting it inline: `seed_rtt` waits on real PONGs that only reach
    /// it through `dispatch`, and `dispatch` runs on `run`'s single select
    /// loop, so awaiting it there would deadlock the loop against itself.
    self_weak: Weak<Self>,
}

/// Dropping this handle unregisters the corresponding subscription.
pub struct SubscriptionHandle {
    table: SubscriptionTable,
    flag: u8,
    id: u64,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap();
        if let Some(handlers) = table.get_mut(&self.flag) {
            handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Session {
    pub fn new(
        request_id: Uuid,
        local_id: Uuid,
        role: Role,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        logger: Arc<dyn EngineLogger>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let enable_ack = config
            .enable_ack
            .unwrap_or_else(|| transport.kind().default_enable_ack());
        let max_payload = transport.max_payload() as u64;
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

        let session = Arc::new_cyclic(|weak_self| Self {
            request_id,
            local_id,
            role,
            transport,
            state: std::sync::Mutex::new(SessionState::Connecting),
            established: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            sent_peer_close: AtomicBool::new(false),
            rtt_ms: AtomicU64::new(0),
            max_payload: AtomicU64::new(max_payload),
            enable_ack,
            subscriptions: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_sub_id: AtomicU64::new(0),
            next_file_seq: AtomicU32::new(0),
            liveness: AsyncMutex::new(Liveness::new(Instant::now())),
            rtt_sample_waiter: AsyncMutex::new(None),
            lifecycle_tx,
            logger,
            self_weak: weak_self.clone(),
        });

        (session, lifecycle_rx)
    }

    pub fn enable_ack(&self) -> bool {
        self.enable_ack
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Relaxed) as usize
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Relaxed)
    }

    pub fn next_file_seq(&self) -> u32 {
        self.next_file_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a callback for one flag. Callbacks run in insertion order
    /// and are append-only during a dispatch (§5 "shared-resource policy").
    pub fn on(&self, flag: u8, handler: Handler) -> SubscriptionHandle {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.subscriptions.lock().unwrap();
        table.entry(flag).or_default().push((id, handler));
        SubscriptionHandle {
            table: Arc::clone(&self.subscriptions),
            flag,
            id,
        }
    }

    /// Like `on`, but the handler self-unregisters after its first
    /// invocation (§4.5 "`once` self-unregisters after first invocation").
    /// The returned handle still unregisters early on drop if the handler
    /// never fires.
    pub fn once(&self, flag: u8, handler: Handler) -> SubscriptionHandle {
        let table = Arc::clone(&self.subscriptions);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let fired = std::sync::atomic::AtomicBool::new(false);
        let wrapped: Handler = Arc::new(move |frame| {
            if fired.swap(true, Ordering::Relaxed) {
                return;
            }
            handler(frame);
            let mut table = table.lock().unwrap();
            if let Some(handlers) = table.get_mut(&flag) {
                handlers.retain(|(existing_id, _)| *existing_id != id);
            }
        });
        let mut table = self.subscriptions.lock().unwrap();
        table.entry(flag).or_default().push((id, wrapped));
        SubscriptionHandle {
            table: Arc::clone(&self.subscriptions),
            flag,
            id,
        }
    }

    /// Send a frame through the transport, applying backpressure and the
    /// opportunistic-ping policy from §4.2/§4.4. No-op once PEER_CLOSE has
    /// been sent (invariant 5).
    pub async fn send(&self, frame: Frame) -> Result<(), EngineError> {
        if self.sent_peer_close.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.transport.await_drain().await;
        self.transport.send_frame(frame).await?;

        let now = Instant::now();
        let mut liveness = self.liveness.lock().await;
        if let Some(seq) = liveness.poll_opportunistic_ping(now) {
            drop(liveness);
            let ts = now_ms();
            let _ = self
                .transport
                .send_frame(Frame::new(FLAG_PING, encode_ping(seq, ts)))
                .await;
        }
        Ok(())
    }

    /// Start the receiver-role (or socket-variant) side of the handshake
    /// proactively, per §4.3: "receiver sends first upon open". Call once
    /// the transport's own open/ready trigger has fired.
    pub async fn start_handshake(&self) {
        *self.state.lock().unwrap() = SessionState::Handshaking;
        let should_initiate =
            self.role == Role::Receiver || self.transport.kind() == TransportKind::Socket;
        if should_initiate {
            let body = encode_shakehand(self.request_id, now_ms());
            let _ = self.transport.send_frame(Frame::new(FLAG_SHAKEHAND, body)).await;
        }
    }

    /// Drive the control loop until the transport closes or a fatal error
    /// occurs. Intended to be spawned as one task per session.
    pub async fn run(&self) {
        let mut ping_timer = interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                frame = self.transport.recv() => {
                    match frame {
                        Ok(Some(frame)) => {
                            if !self.dispatch(frame).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            self.handle_transport_ended(None).await;
                            break;
                        }
                        Err(e) => {
                            self.handle_transport_ended(Some(e)).await;
                            break;
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if self.check_ping_timeout().await {
                        break;
                    }
                }
            }
        }
        *self.state.lock().unwrap() = SessionState::Closed;
    }

    async fn check_ping_timeout(&self) -> bool {
        let now = Instant::now();
        let timed_out = self.liveness.lock().await.is_timed_out(now);
        if timed_out {
            self.logger.log(EngineLog {
                component: "session",
                request_id: self.request_id,
                event: EngineEvent::ConnectionError {
                    message: "ping timeout".into(),
                },
            });
            self.close(true).await;
            true
        } else {
            false
        }
    }

    async fn handle_transport_ended(&self, err: Option<EngineError>) {
        if self.closing.load(Ordering::Relaxed) {
            // Expected: we initiated this close ourselves.
            return;
        }
        let established = self.established.load(Ordering::Relaxed);
        match err {
            Some(EngineError::RelayAbnormalClose) => {
                self.emit_close(1005, "abnormal closure");
            }
            Some(e) => {
                let _ = self.lifecycle_tx.send(LifecycleEvent::ConnectionError {
                    message: e.to_string(),
                });
                if established {
                    self.emit_close(1007, "channel closed unexpectedly");
                }
            }
            None => {
                if established {
                    self.emit_close(1007, "channel closed unexpectedly");
                }
            }
        }
        self.transport.close().await;
    }

    fn emit_close(&self, code: u16, reason: &'static str) {
        let _ = self
            .lifecycle_tx
            .send(LifecycleEvent::ConnectionClose { code, reason });
    }

    /// Dispatch one inbound frame. Returns `false` if the loop should stop.
    async fn dispatch(&self, frame: Frame) -> bool {
        let now = Instant::now();
        {
            let mut liveness = self.liveness.lock().await;
            liveness.note_activity(now);
        }

        match frame.flag {
            FLAG_PING => {
                if let Some((seq, _ts)) = decode_liveness_body(b"ping", &frame.payload) {
                    self.liveness.lock().await.on_ping_received(now);
                    let reply = encode_pong(seq, now_ms());
                    let _ = self.transport.send_frame(Frame::new(FLAG_PONG, reply)).await;
                }
                true
            }
            FLAG_PONG => {
                if let Some((seq, _ts)) = decode_liveness_body(b"pong", &frame.payload) {
                    // A `seed_rtt` sample in flight for this exact seq takes
                    // the reply instead of the normal smoothed-RTT path, so
                    // the three seed pings don't each fire their own
                    // `rtt_updated` ahead of the averaged one (§4.3 "the
                    // resulting value is reported once").
                    let awaited_by_seed = {
                        let waiter = self.rtt_sample_waiter.lock().await;
                        matches!(waiter.as_ref(), Some((waiting_seq, _)) if *waiting_seq == seq)
                    };
                    let outcome = self.liveness.lock().await.on_pong(seq, now);
                    if let PongOutcome::Accepted { rtt_ms } = outcome {
                        if awaited_by_seed {
                            let mut waiter = self.rtt_sample_waiter.lock().await;
                            if let Some((_, tx)) = waiter.take() {
                                let _ = tx.send(now);
                            }
                        } else {
                            self.rtt_ms.store(rtt_ms, Ordering::Relaxed);
                            let _ = self
                                .lifecycle_tx
                                .send(LifecycleEvent::RttUpdated { rtt_ms });
                        }
                    }
                }
                true
            }
            FLAG_SHAKEHAND => {
                self.handle_shakehand(&frame.payload).await;
                true
            }
            FLAG_PEER_CLOSE => {
                self.emit_close(1000, "closed cleanly");
                self.closing.store(true, Ordering::Relaxed);
                self.transport.close().await;
                false
            }
            FLAG_META | FLAG_DATA | FLAG_ACK => {
                self.invoke_subscribers(frame);
                true
            }
            _ => {
                // Relay-reserved and unrecognized flags are not dispatched
                // to subscribers; the socket transport already strips the
                // PROXY_* control flags before frames reach the session.
                true
            }
        }
    }

    async fn handle_shakehand(&self, body: &[u8]) {
        let Ok((request_id, _peer_now_ms)) = decode_shakehand(body) else {
            return;
        };
        if request_id != self.request_id {
            return;
        }
        if self.established.swap(true, Ordering::Relaxed) {
            // Duplicate SHAKEHAND, already established: ignore.
            return;
        }

        let already_initiated =
            self.role == Role::Receiver || self.transport.kind() == TransportKind::Socket;
        if !already_initiated {
            let reply = encode_shakehand(self.request_id, now_ms());
            let _ = self
                .transport
                .send_frame(Frame::new(FLAG_SHAKEHAND, reply))
                .await;
        }

        *self.state.lock().unwrap() = SessionState::Ready;
        let _ = self.lifecycle_tx.send(LifecycleEvent::ConnectionReady);
        self.logger.log(EngineLog {
            component: "session",
            request_id: self.request_id,
            event: EngineEvent::ConnectionReady,
        });

        if self.role == Role::Sender {
            // Spawned, not awaited: `seed_rtt` waits for real PONGs that
            // only arrive back through `dispatch`, and `dispatch` is
            // itself running inside `run`'s single select loop right now —
            // awaiting it inline here would deadlock that loop against
            // itself.
            if let Some(session) = self.self_weak.upgrade() {
                tokio::spawn(async move { session.seed_rtt().await });
            }
        }
    }

    /// §4.3: the sender performs three serial PINGs after ready and
    /// averages the measured RTTs to seed `rtt_ms`, reported once. Each
    /// sample is the real elapsed time until its matching PONG arrives
    /// through `dispatch`, not a fixed sleep.
    async fn seed_rtt(&self) {
        let mut samples = Vec::with_capacity(3);
        for _ in 0..3 {
            // `force_ping`, not `poll_opportunistic_ping`: these three
            // probes run back-to-back and must not be suppressed by the
            // 5s opportunistic-ping window the first reply would otherwise
            // open (§4.4).
            let seq = self.liveness.lock().await.force_ping(Instant::now());

            let (tx, rx) = oneshot::channel();
            *self.rtt_sample_waiter.lock().await = Some((seq, tx));

            let sent_at = Instant::now();
            let ts = now_ms();
            if self
                .transport
                .send_frame(Frame::new(FLAG_PING, encode_ping(seq, ts)))
                .await
                .is_err()
            {
                self.rtt_sample_waiter.lock().await.take();
                break;
            }

            match tokio::time::timeout(PING_TIMEOUT, rx).await {
                Ok(Ok(reply_at)) => {
                    samples.push(reply_at.duration_since(sent_at).as_millis() as u64);
                }
                _ => {
                    // No matching PONG within the liveness window; drop the
                    // stale waiter and stop trying further samples.
                    self.rtt_sample_waiter.lock().await.take();
                    break;
                }
            }
        }
        if !samples.is_empty() {
            let avg = samples.iter().sum::<u64>() / samples.len() as u64;
            self.rtt_ms.store(avg, Ordering::Relaxed);
            let _ = self
                .lifecycle_tx
                .send(LifecycleEvent::RttUpdated { rtt_ms: avg });
        }
    }

    fn invoke_subscribers(&self, frame: Frame) {
        let snapshot: Vec<Handler> = {
            let table = self.subscriptions.lock().unwrap();
            match table.get(&frame.flag) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            handler(frame.clone());
        }
    }

    /// Explicit close (§4.5). With `notify_peer`, sends PEER_CLOSE
    /// best-effort first; afterwards no further frames are ever sent
    /// (invariant 5) and no local `connection-close` event fires.
    pub async fn close(&self, notify_peer: bool) {
        self.closing.store(true, Ordering::Relaxed);
        if notify_peer {
            self.sent_peer_close.store(true, Ordering::Relaxed);
            let _ = self
                .transport
                .send_frame(Frame::new(FLAG_PEER_CLOSE, Vec::new()))
                .await;
        }
        self.transport.close().await;
    }
}

/// Wall-clock milliseconds since epoch, for cross-peer comparison in
/// SHAKEHAND/PING bodies only (§9 "Clock assumption"). All local timeouts
/// use `std::time::Instant` instead, never this.
fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;
    use crate::loopback_transport::LoopbackTransport;

    fn new_session(
        request_id: Uuid,
        role: Role,
        transport: LoopbackTransport,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        Session::new(
            request_id,
            Uuid::new_v4(),
            role,
            Arc::new(transport),
            SessionConfig { enable_ack: Some(false) },
            Arc::new(NullLogger) as Arc<dyn EngineLogger>,
        )
    }

    /// §4.3: both peers exchange SHAKEHAND and each emits `connection-ready`
    /// exactly once, even though the receiver (or socket-variant sender)
    /// initiates.
    #[tokio::test]
    async fn handshake_reaches_ready_on_both_ends() {
        let request_id = Uuid::new_v4();
        let (a_transport, b_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (sender, mut sender_events) = new_session(request_id, Role::Sender, a_transport);
        let (receiver, mut receiver_events) = new_session(request_id, Role::Receiver, b_transport);

        let sender_run = tokio::spawn({
            let sender = Arc::clone(&sender);
            async move { sender.run().await }
        });
        let receiver_run = tokio::spawn({
            let receiver = Arc::clone(&receiver);
            async move { receiver.run().await }
        });

        // Socket variant: both peers independently initiate once the relay
        // reports PROXY_CONNECTION_ESTABLISHED (§4.3); simulate that here
        // by triggering `start_handshake` on both ends.
        sender.start_handshake().await;
        receiver.start_handshake().await;

        let sender_ready = tokio::time::timeout(Duration::from_millis(200), sender_events.recv())
            .await
            .expect("sender should reach ready")
            .unwrap();
        assert!(matches!(sender_ready, LifecycleEvent::ConnectionReady));

        let receiver_ready =
            tokio::time::timeout(Duration::from_millis(200), receiver_events.recv())
                .await
                .expect("receiver should reach ready")
                .unwrap();
        assert!(matches!(receiver_ready, LifecycleEvent::ConnectionReady));

        assert!(sender.is_established());
        assert!(receiver.is_established());

        sender.close(false).await;
        receiver.close(false).await;
        let _ = tokio::time::timeout(Duration::from_millis(200), sender_run).await;
        let _ = tokio::time::timeout(Duration::from_millis(200), receiver_run).await;
    }

    /// §4.5: PEER_CLOSE delivery emits `connection-close{1000, "closed
    /// cleanly"}` exactly once and never again afterwards (invariant 5).
    #[tokio::test]
    async fn peer_close_emits_clean_close_once() {
        let request_id = Uuid::new_v4();
        let (a_transport, b_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (session, mut events) = new_session(request_id, Role::Receiver, a_transport);
        let peer = Arc::new(b_transport);

        let run = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run().await }
        });

        peer.send_frame(Frame::new(FLAG_PEER_CLOSE, Vec::new()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LifecycleEvent::ConnectionClose { code, reason } => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "closed cleanly");
            }
            other => panic!("expected clean close, got {other:?}"),
        }

        // No further lifecycle events fire after PEER_CLOSE.
        let second = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(second.is_err(), "no further lifecycle events should fire");

        let _ = tokio::time::timeout(Duration::from_millis(200), run).await;
    }

    /// Invariant 5: once PEER_CLOSE has been sent, `send` becomes a no-op.
    #[tokio::test]
    async fn send_is_noop_after_sending_peer_close() {
        let (transport, peer_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (session, _events) = new_session(Uuid::new_v4(), Role::Sender, transport);
        let peer = Arc::new(peer_transport);

        session.close(true).await;
        assert!(session
            .send(Frame::new(FLAG_PING, vec![0u8; 14]))
            .await
            .is_ok());

        // Only the PEER_CLOSE frame should have reached the peer.
        let first = peer.recv().await.unwrap().unwrap();
        assert_eq!(first.flag, FLAG_PEER_CLOSE);
        let second = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(second.is_err());
    }

    /// §4.5: `once` fires for exactly the first matching frame, then
    /// self-unregisters so later frames of the same flag reach no handler.
    #[tokio::test]
    async fn once_fires_exactly_once() {
        let (transport, peer_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (session, _events) = new_session(Uuid::new_v4(), Role::Receiver, transport);
        let peer = Arc::new(peer_transport);

        let run = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run().await }
        });

        let count = Arc::new(AtomicU32::new(0));
        let count_for_handler = Arc::clone(&count);
        let _handle = session.once(
            FLAG_ACK,
            Arc::new(move |_frame| {
                count_for_handler.fetch_add(1, Ordering::Relaxed);
            }),
        );

        for _ in 0..3 {
            peer.send_frame(Frame::new(
                FLAG_ACK,
                crate::framing::encode_ack_header(0, 0).to_vec(),
            ))
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);

        session.close(false).await;
        let _ = tokio::time::timeout(Duration::from_millis(200), run).await;
    }

    /// End-to-end: two full `Session`s handshake, then one file is driven
    /// through the real sender/receiver pipelines over a single in-memory
    /// transport pair, and the sender's post-handshake RTT seed (§4.3)
    /// lands from genuine PONGs rather than a stub.
    #[tokio::test]
    async fn full_session_transfers_one_file_and_seeds_rtt() {
        use crate::metadata::FileMetadata;
        use crate::progress::Progress;
        use crate::receiver_manager::{spawn_receiver_manager, SinkOpener};
        use crate::sender::send_file;
        use std::io::Cursor;
        use std::sync::Mutex as StdMutex;
        use tokio::io::AsyncWrite;

        let request_id = Uuid::new_v4();
        let (a_transport, b_transport) =
            LoopbackTransport::pair(TransportKind::Socket, crate::framing::DEFAULT_MAX_PAYLOAD);
        let (sender, mut sender_events) = new_session(request_id, Role::Sender, a_transport);
        let (receiver, _receiver_events) = new_session(request_id, Role::Receiver, b_transport);

        let sender_run = tokio::spawn({
            let sender = Arc::clone(&sender);
            async move { sender.run().await }
        });
        let receiver_run = tokio::spawn({
            let receiver = Arc::clone(&receiver);
            async move { receiver.run().await }
        });

        sender.start_handshake().await;
        receiver.start_handshake().await;

        loop {
            let event = tokio::time::timeout(Duration::from_millis(200), sender_events.recv())
                .await
                .expect("sender should reach ready")
                .unwrap();
            if matches!(event, LifecycleEvent::ConnectionReady) {
                break;
            }
        }

        struct RecordingSink {
            store: Arc<StdMutex<Vec<u8>>>,
        }
        impl AsyncWrite for RecordingSink {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                self.store.lock().unwrap().extend_from_slice(buf);
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
                std::task::Poll::Ready(Ok(()))
            }
        }

        let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_for_sink = Arc::clone(&received);
        let open_sink: SinkOpener = Box::new(move |_meta| {
            Box::pin(RecordingSink {
                store: Arc::clone(&received_for_sink),
            })
        });
        let _receiver_manager = spawn_receiver_manager(
            Arc::clone(&receiver),
            Arc::new(NullLogger),
            open_sink,
            Arc::new(|_p: Progress| {}),
        );

        let metadata = FileMetadata {
            seq: 0,
            name: "greeting.txt".into(),
            mime: "text/plain".into(),
            size: 13,
            mtime: 0,
            origin_ts: 0,
        };
        let logger: Arc<dyn EngineLogger> = Arc::new(NullLogger);
        let result = send_file(
            &sender,
            metadata,
            Cursor::new(b"hello, world!".to_vec()),
            &logger,
            |_| {},
        )
        .await;
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().as_slice(), b"hello, world!");

        // The sender's §4.3 RTT seed reports a real, non-fabricated sample
        // once its three serial PINGs have each been answered for real.
        let rtt_ms = tokio::time::timeout(Duration::from_millis(1000), async {
            loop {
                match sender_events.recv().await {
                    Some(LifecycleEvent::RttUpdated { rtt_ms }) => return rtt_ms,
                    Some(_) => continue,
                    None => panic!("lifecycle channel closed before rtt_updated"),
                }
            }
        })
        .await
        .expect("rtt_updated should fire from the real seed pings");
        assert_eq!(sender.rtt_ms(), rtt_ms);

        sender.close(false).await;
        receiver.close(false).await;
        let _ = tokio::time::timeout(Duration::from_millis(200), sender_run).await;
        let _ = tokio::time::timeout(Duration::from_millis(200), receiver_run).await;
    }
}
