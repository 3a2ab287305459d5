//! # Transport Statistics
//!
//! Per-connection counters and the snapshot returned by `perfmon`. The
//! engine's hot paths bump lock-free atomic counters; a snapshot combines
//! them with the pacing and RTT state sampled from the connection at call
//! time. Snapshots serialize to JSON so demo tooling can stream them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Lock-free counters maintained by the sender and receiver tasks.
#[derive(Debug, Default)]
pub struct PerfCounters {
    /// Data packets sent, including retransmissions.
    pub pkt_sent: AtomicU64,
    /// Data packets received, including duplicates.
    pub pkt_recv: AtomicU64,
    /// Data packets retransmitted.
    pub pkt_retrans: AtomicU64,
    /// Duplicate data packets discarded by the receiver.
    pub pkt_recv_dup: AtomicU64,
    /// Packets the receiver recorded as lost.
    pub pkt_rcv_loss: AtomicU64,
    /// ACK control packets sent (light and full).
    pub pkt_sent_ack: AtomicU64,
    /// Full ACKs sent (subset of `pkt_sent_ack`).
    pub pkt_sent_ack_full: AtomicU64,
    /// ACK control packets received.
    pub pkt_recv_ack: AtomicU64,
    /// Full ACKs received (subset of `pkt_recv_ack`).
    pub pkt_recv_ack_full: AtomicU64,
    /// ACK² echoes sent, one per full ACK received.
    pub pkt_sent_ack2: AtomicU64,
    /// ACK² echoes received.
    pub pkt_recv_ack2: AtomicU64,
    /// NAK control packets sent.
    pub pkt_sent_nak: AtomicU64,
    /// NAK control packets received.
    pub pkt_recv_nak: AtomicU64,
    /// Application payload bytes sent (first transmissions only).
    pub bytes_sent: AtomicU64,
    /// Application payload bytes received and accepted.
    pub bytes_recv: AtomicU64,
    /// Payload bytes retransmitted.
    pub bytes_retrans: AtomicU64,
}

impl PerfCounters {
    /// Adds `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increments a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// A point-in-time performance snapshot of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct TraceInfo {
    /// Milliseconds since the connection was established.
    pub ms_elapsed: u64,
    /// Estimated send rate in megabits per second since connection start.
    pub mbps_send_rate: f64,
    /// Estimated receive rate in megabits per second since connection start.
    pub mbps_recv_rate: f64,
    /// Smoothed round-trip time in milliseconds.
    pub ms_rtt: f64,
    /// Congestion window in packets.
    pub pkt_congestion_window: u32,
    /// Flow-control window advertised by the peer, in packets.
    pub pkt_flow_window: u32,
    /// Pacing period between packets in microseconds.
    pub us_pkt_snd_period: f64,
    /// Data packets sent, including retransmissions.
    pub pkt_sent: u64,
    /// Data packets received.
    pub pkt_recv: u64,
    /// Retransmitted packets.
    pub pkt_retrans: u64,
    /// Packets recorded lost by the receiver.
    pub pkt_rcv_loss: u64,
    /// Duplicates discarded by the receiver.
    pub pkt_recv_dup: u64,
    /// ACKs sent.
    pub pkt_sent_ack: u64,
    /// ACKs received.
    pub pkt_recv_ack: u64,
    /// NAKs sent.
    pub pkt_sent_nak: u64,
    /// NAKs received.
    pub pkt_recv_nak: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_recv: u64,
}

impl TraceInfo {
    /// Builds a snapshot from the counters plus engine state sampled by the
    /// caller.
    pub fn capture(
        counters: &PerfCounters,
        start: Instant,
        rtt_us: u32,
        cwnd: u32,
        flow_window: u32,
        period_us: f64,
    ) -> Self {
        let elapsed = start.elapsed();
        let secs = elapsed.as_secs_f64().max(1e-6);
        let bytes_sent = PerfCounters::get(&counters.bytes_sent);
        let bytes_recv = PerfCounters::get(&counters.bytes_recv);
        TraceInfo {
            ms_elapsed: elapsed.as_millis() as u64,
            mbps_send_rate: bytes_sent as f64 * 8.0 / secs / 1e6,
            mbps_recv_rate: bytes_recv as f64 * 8.0 / secs / 1e6,
            ms_rtt: rtt_us as f64 / 1000.0,
            pkt_congestion_window: cwnd,
            pkt_flow_window: flow_window,
            us_pkt_snd_period: period_us,
            pkt_sent: PerfCounters::get(&counters.pkt_sent),
            pkt_recv: PerfCounters::get(&counters.pkt_recv),
            pkt_retrans: PerfCounters::get(&counters.pkt_retrans),
            pkt_rcv_loss: PerfCounters::get(&counters.pkt_rcv_loss),
            pkt_recv_dup: PerfCounters::get(&counters.pkt_recv_dup),
            pkt_sent_ack: PerfCounters::get(&counters.pkt_sent_ack),
            pkt_recv_ack: PerfCounters::get(&counters.pkt_recv_ack),
            pkt_sent_nak: PerfCounters::get(&counters.pkt_sent_nak),
            pkt_recv_nak: PerfCounters::get(&counters.pkt_recv_nak),
            bytes_sent,
            bytes_recv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let counters = PerfCounters::default();
        PerfCounters::add(&counters.bytes_sent, 1_000_000);
        PerfCounters::bump(&counters.pkt_recv_nak);
        let start = Instant::now() - std::time::Duration::from_secs(1);
        let info = TraceInfo::capture(&counters, start, 25_000, 64, 8192, 10.0);
        assert_eq!(info.bytes_sent, 1_000_000);
        assert_eq!(info.pkt_recv_nak, 1);
        assert!((info.ms_rtt - 25.0).abs() < f64::EPSILON);
        // ~8 Mb transferred in ~1 s.
        assert!(info.mbps_send_rate > 6.0 && info.mbps_send_rate < 10.0);
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"pkt_recv_nak\":1"));
    }
}
