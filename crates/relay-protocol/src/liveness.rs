/// PING/PONG liveness and smoothed RTT (§4.4).
use std::time::{Duration, Instant};

pub const PING_TIMEOUT: Duration = Duration::from_millis(5000);
pub const PING_SUPPRESSION: Duration = Duration::from_millis(5000);

/// Liveness state for one session (§3 "Liveness state").
pub struct Liveness {
    next_ping_due: Instant,
    inflight: Option<InflightPing>,
    next_seq: u16,
    rtt_ms: u64,
    last_seen: Instant,
}

struct InflightPing {
    seq: u16,
    sent_at: Instant,
}

/// Outcome of feeding a PONG into `Liveness::on_pong`.
#[derive(Debug, PartialEq, Eq)]
pub enum PongOutcome {
    /// Seq or timing didn't match the in-flight ping; frame is ignored.
    Ignored,
    /// Matched; RTT was (re)computed.
    Accepted { rtt_ms: u64 },
}

impl Liveness {
    pub fn new(now: Instant) -> Self {
        Self {
            next_ping_due: now,
            inflight: None,
            next_seq: 0,
            rtt_ms: 0,
            last_seen: now,
        }
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms
    }

    /// Record any inbound frame as evidence the peer is alive.
    pub fn note_activity(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// Called after every outbound send (§4.4 policy): if due, returns a
    /// seq to send as an opportunistic PING.
    pub fn poll_opportunistic_ping(&mut self, now: Instant) -> Option<u16> {
        if self.inflight.is_some() || now < self.next_ping_due {
            return None;
        }
        Some(self.force_ping(now))
    }

    /// Issue a PING regardless of the opportunistic due-time gate. Used by
    /// the sender's initial RTT seeding (§4.3), which fires three serial
    /// probes back-to-back and would otherwise have the first probe's own
    /// reply suppress the next two for 5s via `next_ping_due`.
    pub fn force_ping(&mut self, now: Instant) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.inflight = Some(InflightPing { seq, sent_at: now });
        seq
    }

    /// Feed a received PONG `(seq, peer_timestamp_ms)`. `reply_ms` is our
    /// monotonic-clock-equivalent wall time of receipt used for the RTT
    /// formula in §4.4 (`reply_ms - send_ms`); we use elapsed monotonic
    /// duration instead of wall clock to honor the "local timeouts use a
    /// monotonic clock" rule in §9, which is equivalent for RTT purposes.
    pub fn on_pong(&mut self, seq: u16, now: Instant) -> PongOutcome {
        let Some(inflight) = self.inflight.take() else {
            return PongOutcome::Ignored;
        };
        if inflight.seq != seq {
            // Not our ping; restore it, the real reply may still be in flight.
            self.inflight = Some(inflight);
            return PongOutcome::Ignored;
        }

        let elapsed_ms = now.duration_since(inflight.sent_at).as_millis() as u64;
        let rtt = ((elapsed_ms + self.rtt_ms) as f64 / 2.0).ceil() as u64;
        self.rtt_ms = rtt;
        self.next_ping_due = now + PING_SUPPRESSION;
        self.last_seen = now;
        PongOutcome::Accepted { rtt_ms: rtt }
    }

    /// Receiving a PING from the peer also suppresses our own opportunistic
    /// pinging for the same window (§4.4: "peer-driven suppression").
    pub fn on_ping_received(&mut self, now: Instant) {
        self.next_ping_due = now + PING_SUPPRESSION;
        self.last_seen = now;
    }

    /// True if the in-flight ping (if any) has exceeded `PING_TIMEOUT`.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        match &self.inflight {
            Some(inflight) => now.duration_since(inflight.sent_at) >= PING_TIMEOUT,
            None => false,
        }
    }
}
