//! Heart-beat negotiation and bookkeeping.
//!
//! Negotiation is a pure function of the two `heart-beat` headers exchanged
//! in CONNECT / CONNECTED. The [`HeartbeatMonitor`] is equally pure: it is fed
//! timestamps by the session's event loop and answers two questions, "should
//! a heart-beat go out now?" and "has the peer gone quiet for too long?".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::HeartbeatPolicy;
use crate::error::StompError;

/// One side's heart-beat capability, in milliseconds.
///
/// - `send_ms`: the smallest interval this side guarantees between its own
///   heart-beats (`0` = cannot send).
/// - `receive_ms`: the interval this side would like to receive heart-beats
///   at (`0` = does not want any).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl Heartbeat {
    pub const fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// `0,0`: neither sends nor expects heart-beats.
    pub const fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Symmetric heart-beat at `interval` in both directions.
    pub fn from_duration(interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self::new(ms, ms)
    }

    pub fn is_disabled(&self) -> bool {
        self.send_ms == 0 && self.receive_ms == 0
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

impl FromStr for Heartbeat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cx, cy) = parse_heartbeat_header(s);
        Ok(Heartbeat::new(cx, cy))
    }
}

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default to
/// `0`, which disables that direction; a garbled header must never make the
/// client stricter than the peer asked for.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Agreed heart-beat intervals; `None` means the direction is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// How often this side must show activity.
    pub outgoing: Option<Duration>,
    /// How often this side should see activity from the peer.
    pub incoming: Option<Duration>,
}

fn agree(sender_guarantee: u64, receiver_desire: u64) -> Option<Duration> {
    if sender_guarantee == 0 || receiver_desire == 0 {
        None
    } else {
        Some(Duration::from_millis(sender_guarantee.max(receiver_desire)))
    }
}

/// Negotiate heart-beats between the local side and the peer.
///
/// A direction is disabled when the sender cannot send or the receiver does
/// not want heart-beats; otherwise the interval is the larger of the two.
pub fn negotiate(local: Heartbeat, peer: Heartbeat) -> Negotiated {
    Negotiated {
        outgoing: agree(local.send_ms, peer.receive_ms),
        incoming: agree(peer.send_ms, local.receive_ms),
    }
}

/// Tuple form of [`negotiate`] for callers holding raw header values.
///
/// Returns `(outgoing, incoming)`.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let n = negotiate(
        Heartbeat::new(client_out, client_in),
        Heartbeat::new(server_out, server_in),
    );
    (n.outgoing, n.incoming)
}

/// Point-in-time view of heart-beat traffic in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatStats {
    pub sent: u64,
    pub received: u64,
    /// Time since the most recent heart-beat from the peer.
    pub since_last_received: Option<Duration>,
    /// Gap between the two most recent heart-beats from the peer.
    pub previous_received_interval: Option<Duration>,
    /// Time since this side last emitted a heart-beat.
    pub since_last_sent: Option<Duration>,
    /// Gap between the two most recent heart-beats emitted.
    pub previous_sent_interval: Option<Duration>,
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

#[derive(Debug, Default)]
struct Direction {
    count: u64,
    last_beat: Option<Instant>,
    previous_interval: Option<Duration>,
    last_activity: Option<Instant>,
}

impl Direction {
    fn activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    fn beat(&mut self, now: Instant) {
        self.count += 1;
        if let Some(prev) = self.last_beat {
            self.previous_interval = Some(now.saturating_duration_since(prev));
        }
        self.last_beat = Some(now);
        self.last_activity = Some(now);
    }
}

/// Tracks heart-beat timing for one session.
///
/// Any frame counts as activity for the liveness and suppression rules; only
/// real heart-beats move the counters and intervals in [`HeartbeatStats`].
#[derive(Debug)]
pub struct HeartbeatMonitor {
    negotiated: Negotiated,
    policy: HeartbeatPolicy,
    sent: Direction,
    received: Direction,
}

impl HeartbeatMonitor {
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self {
            negotiated: Negotiated::default(),
            policy,
            sent: Direction::default(),
            received: Direction::default(),
        }
    }

    /// Install the negotiated intervals. Activity clocks restart at `now` so
    /// the liveness window begins with the handshake.
    pub fn start(&mut self, negotiated: Negotiated, now: Instant) {
        self.negotiated = negotiated;
        self.sent.activity(now);
        self.received.activity(now);
    }

    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    pub fn record_frame_sent(&mut self, now: Instant) {
        self.sent.activity(now);
    }

    pub fn record_heartbeat_sent(&mut self, now: Instant) {
        self.sent.beat(now);
    }

    pub fn record_frame_received(&mut self, now: Instant) {
        self.received.activity(now);
    }

    pub fn record_heartbeat_received(&mut self, now: Instant) {
        self.received.beat(now);
    }

    /// Whether a heart-beat is due. Suppressed while outbound traffic is
    /// recent enough, measured against `send_threshold` of the interval.
    pub fn should_send_heartbeat(&self, now: Instant) -> bool {
        let Some(interval) = self.negotiated.outgoing else {
            return false;
        };
        match self.sent.last_activity {
            Some(last) => {
                now.saturating_duration_since(last) >= interval.mul_f64(self.policy.send_threshold)
            }
            None => true,
        }
    }

    /// Fails once the peer has been silent for longer than
    /// `liveness_grace` incoming intervals.
    pub fn check_liveness(&self, now: Instant) -> Result<(), StompError> {
        let (Some(interval), Some(last)) = (self.negotiated.incoming, self.received.last_activity)
        else {
            return Ok(());
        };
        let limit = interval * self.policy.liveness_grace.max(1);
        let silent = now.saturating_duration_since(last);
        if silent > limit {
            return Err(StompError::lost(format!(
                "no inbound activity for {}ms (limit {}ms)",
                silent.as_millis(),
                limit.as_millis()
            )));
        }
        Ok(())
    }

    pub fn stats(&self, now: Instant) -> HeartbeatStats {
        HeartbeatStats {
            sent: self.sent.count,
            received: self.received.count,
            since_last_received: self
                .received
                .last_beat
                .map(|t| now.saturating_duration_since(t)),
            previous_received_interval: self.received.previous_interval,
            since_last_sent: self.sent.last_beat.map(|t| now.saturating_duration_since(t)),
            previous_sent_interval: self.sent.previous_interval,
            outgoing: self.negotiated.outgoing,
            incoming: self.negotiated.incoming,
        }
    }
}
