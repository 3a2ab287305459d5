//! # Rate/Window Congestion Controller
//!
//! Hybrid rate- and window-based control. The sender consults the
//! controller on every pacing tick; acknowledgement and loss updates are
//! applied under the connection's small congestion lock so the controller
//! is always observed atomically.
//!
//! Numeric contract:
//! - initial inter-packet period 1 µs, initial window 16 packets;
//! - slow start grows the window by newly acknowledged packets and ends on
//!   the first loss or when the peer's advertised buffer is reached;
//! - after slow start the window follows `recv_rate × (rtt + syn) / 1e6 +
//!   16` and the sending rate is nudged by `bandwidth − recv_rate` packets
//!   per second every SYN tick;
//! - a loss event multiplies the period by 1.125, at most once per
//!   round-trip (NAKs for sequences older than the last decrease are
//!   ignored);
//! - the window is capped at `min(1000, peer advertised buffer)`.

use std::time::Duration;

use crate::seq::SeqNo;

/// Ceiling on the congestion window in packets.
const MAX_CWND: f64 = 1000.0;

/// Floor on the inter-packet period.
const MIN_PERIOD_US: f64 = 1.0;

/// Ceiling on the inter-packet period (one packet per second).
const MAX_PERIOD_US: f64 = 1_000_000.0;

/// Multiplicative back-off applied on a loss event.
const LOSS_BACKOFF: f64 = 1.125;

/// The per-connection congestion controller.
#[derive(Debug)]
pub struct RateController {
    period_us: f64,
    cwnd: f64,
    slow_start: bool,
    syn: Duration,
    /// Newest sequence covered by the last rate decrease; NAKs at or below
    /// it belong to the same loss event.
    last_dec_seq: Option<SeqNo>,
    peer_window: u32,
    bandwidth_pps: u32,
    recv_rate_pps: u32,
    rtt_us: u32,
}

impl RateController {
    /// Creates a controller with the protocol's initial state.
    pub fn new(syn: Duration) -> Self {
        RateController {
            period_us: MIN_PERIOD_US,
            cwnd: 16.0,
            slow_start: true,
            syn,
            last_dec_seq: None,
            peer_window: 16,
            bandwidth_pps: 0,
            recv_rate_pps: 0,
            rtt_us: 100_000,
        }
    }

    /// Current inter-packet period.
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us as u64)
    }

    /// Current inter-packet period in microseconds.
    pub fn period_us(&self) -> f64 {
        self.period_us
    }

    /// Current congestion window in packets.
    pub fn window(&self) -> u32 {
        self.cwnd as u32
    }

    /// Whether the controller is still in slow start.
    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Feeds the measurements carried by a full acknowledgement.
    pub fn on_ack(
        &mut self,
        newly_acked: u32,
        rtt_us: u32,
        recv_rate_pps: u32,
        bandwidth_pps: u32,
        peer_window: u32,
    ) {
        self.rtt_us = rtt_us;
        self.peer_window = peer_window;
        if recv_rate_pps > 0 {
            self.recv_rate_pps = recv_rate_pps;
        }
        if bandwidth_pps > 0 {
            self.bandwidth_pps = bandwidth_pps;
        }

        if self.slow_start {
            self.cwnd += newly_acked as f64;
            if self.cwnd >= self.window_cap() {
                self.end_slow_start();
            }
            return;
        }

        // Window tracks the delivery rate over one RTT plus one SYN.
        if self.recv_rate_pps > 0 {
            self.cwnd = self.recv_rate_pps as f64
                * (self.rtt_us as f64 + self.syn.as_micros() as f64)
                / 1e6
                + 16.0;
        }
        self.cwnd = self.cwnd.min(self.window_cap());
    }

    /// Periodic rate-control tick, once per SYN interval. Nudges the
    /// sending rate toward the reported link capacity; the gain shrinks by
    /// itself as the receive-rate estimate approaches the capacity
    /// estimate.
    pub fn on_rate_tick(&mut self) {
        if self.slow_start {
            return;
        }
        let b = self.bandwidth_pps as f64;
        let r = self.recv_rate_pps as f64;
        if b <= 0.0 || r <= 0.0 {
            return;
        }
        let rate = 1e6 / self.period_us + (b - r);
        self.period_us = (1e6 / rate.max(1.0)).clamp(MIN_PERIOD_US, MAX_PERIOD_US);
    }

    /// Reacts to a NAK whose smallest missing sequence is `loss_seq` while
    /// `curr_seq` is the newest sequence sent. Applies the multiplicative
    /// back-off once per loss event and returns whether it was applied.
    pub fn on_loss(&mut self, loss_seq: SeqNo, curr_seq: SeqNo) -> bool {
        if self.slow_start {
            self.end_slow_start();
        }
        if let Some(last) = self.last_dec_seq {
            // A NAK inside the window of the previous decrease is the same
            // loss event; one cut per round-trip.
            if loss_seq.cmp_to(last) <= 0 {
                return false;
            }
        }
        self.period_us = (self.period_us * LOSS_BACKOFF).clamp(MIN_PERIOD_US, MAX_PERIOD_US);
        self.last_dec_seq = Some(curr_seq);
        true
    }

    /// A congestion-warning control packet is a forced loss event.
    pub fn on_congestion_warning(&mut self, curr_seq: SeqNo) {
        if self.slow_start {
            self.end_slow_start();
        }
        self.period_us = (self.period_us * LOSS_BACKOFF).clamp(MIN_PERIOD_US, MAX_PERIOD_US);
        self.last_dec_seq = Some(curr_seq);
    }

    fn window_cap(&self) -> f64 {
        MAX_CWND.min(self.peer_window.max(1) as f64)
    }

    fn end_slow_start(&mut self) {
        self.slow_start = false;
        // Leave slow start at a period matching the measured delivery rate,
        // or at the window-derived rate when no measurement exists yet.
        if self.recv_rate_pps > 0 {
            self.period_us =
                (1e6 / self.recv_rate_pps as f64).clamp(MIN_PERIOD_US, MAX_PERIOD_US);
        } else {
            let rtt_syn = self.rtt_us as f64 + self.syn.as_micros() as f64;
            self.period_us = (rtt_syn / self.cwnd.max(1.0)).clamp(MIN_PERIOD_US, MAX_PERIOD_US);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u32) -> SeqNo {
        SeqNo::new(n)
    }

    fn controller() -> RateController {
        RateController::new(Duration::from_millis(10))
    }

    #[test]
    fn starts_fast_with_a_small_window() {
        let cc = controller();
        assert_eq!(cc.window(), 16);
        assert!(cc.in_slow_start());
        assert_eq!(cc.period_us(), 1.0);
    }

    #[test]
    fn slow_start_grows_by_acked_packets_and_respects_the_cap() {
        let mut cc = controller();
        cc.on_ack(100, 50_000, 0, 0, 8000);
        assert_eq!(cc.window(), 116);
        assert!(cc.in_slow_start());
        cc.on_ack(10_000, 50_000, 0, 0, 8000);
        assert!(!cc.in_slow_start());
        assert!(cc.window() <= 1000);
    }

    #[test]
    fn loss_backs_off_once_per_event() {
        let mut cc = controller();
        cc.on_ack(100, 50_000, 20_000, 25_000, 8000);
        cc.on_loss(seq(500), seq(600));
        let after_first = cc.period_us();
        // Repeated NAKs for the same (or older) losses within one RTT must
        // not cut again.
        assert!(!cc.on_loss(seq(500), seq(650)));
        assert!(!cc.on_loss(seq(400), seq(650)));
        assert_eq!(cc.period_us(), after_first);
        // A loss beyond the previous decrease window is a fresh event.
        assert!(cc.on_loss(seq(601), seq(700)));
        assert!(cc.period_us() > after_first);
    }

    #[test]
    fn loss_ends_slow_start() {
        let mut cc = controller();
        assert!(cc.in_slow_start());
        cc.on_loss(seq(5), seq(10));
        assert!(!cc.in_slow_start());
    }

    #[test]
    fn rate_tick_moves_toward_capacity() {
        let mut cc = controller();
        cc.on_ack(100, 50_000, 10_000, 50_000, 8000);
        cc.on_loss(seq(1), seq(2));
        let before = cc.period_us();
        // Capacity far above the delivery rate: the period shrinks.
        cc.on_rate_tick();
        assert!(cc.period_us() < before || cc.period_us() == MIN_PERIOD_US);

        // Delivery rate above capacity: the period grows.
        cc.on_ack(0, 50_000, 60_000, 50_000, 8000);
        let before = cc.period_us();
        cc.on_rate_tick();
        assert!(cc.period_us() > before);
    }

    #[test]
    fn congestion_warning_is_a_forced_loss() {
        let mut cc = controller();
        cc.on_ack(100, 50_000, 20_000, 25_000, 8000);
        cc.on_loss(seq(10), seq(20));
        let before = cc.period_us();
        cc.on_congestion_warning(seq(30));
        assert!(cc.period_us() > before);
    }
}
