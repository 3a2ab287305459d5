//! # Loss Lists
//!
//! Ordered sets of sequence ranges, wrap-aware. The sender's list holds
//! sequences that must be retransmitted (served in strict priority over
//! fresh data); the receiver's list holds sequences believed missing, each
//! range remembering when it was last reported so NAKs are paced by the
//! round-trip time instead of firing on every timer tick.

use std::time::Instant;

use crate::packet::LossRange;
use crate::seq::SeqNo;

/// Sender-side loss list: sequences the peer reported missing.
#[derive(Debug, Default)]
pub struct SndLossList {
    // Sorted by wrap-aware order; ranges never overlap.
    ranges: Vec<LossRange>,
}

impl SndLossList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[first, last]`, merging with overlapping or adjacent
    /// ranges. Returns how many sequence numbers were newly added.
    pub fn insert(&mut self, first: SeqNo, last: SeqNo) -> usize {
        if first.offset_to(last) < 0 {
            return 0;
        }
        let before = self.total();
        let idx = self
            .ranges
            .partition_point(|r| r.last.cmp_to(first) < 0 && first.offset_to(r.last) != -1);
        // Gather every existing range that touches [first, last].
        let mut new_first = first;
        let mut new_last = last;
        let mut end = idx;
        while end < self.ranges.len() && self.ranges[end].first.cmp_to(last.next()) <= 0 {
            if self.ranges[end].first.cmp_to(new_first) < 0 {
                new_first = self.ranges[end].first;
            }
            if self.ranges[end].last.cmp_to(new_last) > 0 {
                new_last = self.ranges[end].last;
            }
            end += 1;
        }
        self.ranges.splice(idx..end, [LossRange { first: new_first, last: new_last }]);
        self.total().saturating_sub(before)
    }

    /// Removes and returns the smallest sequence number in the list.
    pub fn pop_first(&mut self) -> Option<SeqNo> {
        let head = self.ranges.first_mut()?;
        let seq = head.first;
        if head.first == head.last {
            self.ranges.remove(0);
        } else {
            head.first = head.first.next();
        }
        Some(seq)
    }

    /// Drops every sequence number strictly below `ack` (the peer has
    /// acknowledged everything up to, not including, `ack`).
    pub fn remove_below(&mut self, ack: SeqNo) {
        self.ranges.retain_mut(|r| {
            if r.last.cmp_to(ack) < 0 {
                return false;
            }
            if r.first.cmp_to(ack) < 0 {
                r.first = ack;
            }
            true
        });
    }

    /// Drops every sequence number inside `[first, last]` (used when a
    /// TTL-expired message is abandoned).
    pub fn remove_range(&mut self, first: SeqNo, last: SeqNo) {
        let mut out = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            let overlaps = r.first.cmp_to(last) <= 0 && first.cmp_to(r.last) <= 0;
            if !overlaps {
                out.push(r);
                continue;
            }
            if r.first.cmp_to(first) < 0 {
                out.push(LossRange { first: r.first, last: first.prev() });
            }
            if last.cmp_to(r.last) < 0 {
                out.push(LossRange { first: last.next(), last: r.last });
            }
        }
        self.ranges = out;
    }

    /// Number of sequence numbers currently queued for retransmission.
    pub fn total(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| r.first.len_to(r.last) as usize)
            .sum()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[derive(Debug)]
struct RcvLossEntry {
    range: LossRange,
    last_feedback: Instant,
}

/// Receiver-side loss list: sequences we believe are missing, with NAK
/// pacing state.
#[derive(Debug)]
pub struct RcvLossList {
    entries: Vec<RcvLossEntry>,
}

impl RcvLossList {
    /// Creates an empty list.
    pub fn new() -> Self {
        RcvLossList { entries: Vec::new() }
    }

    /// Records `[first, last]` as missing. `feedback` seeds the range's
    /// last-report time; passing an instant already one NAK delay in the
    /// past makes the range eligible for immediate reporting.
    pub fn insert(&mut self, first: SeqNo, last: SeqNo, feedback: Instant) {
        if first.offset_to(last) < 0 {
            return;
        }
        let idx = self
            .entries
            .partition_point(|e| e.range.last.cmp_to(first) < 0);
        self.entries.insert(
            idx,
            RcvLossEntry { range: LossRange { first, last }, last_feedback: feedback },
        );
    }

    /// Removes a single arrived sequence number, splitting its range if it
    /// fell in the middle. Returns whether the sequence was present.
    pub fn remove(&mut self, seq: SeqNo) -> bool {
        let idx = self
            .entries
            .partition_point(|e| e.range.last.cmp_to(seq) < 0);
        let Some(entry) = self.entries.get_mut(idx) else {
            return false;
        };
        if entry.range.first.cmp_to(seq) > 0 {
            return false;
        }
        let LossRange { first, last } = entry.range;
        let feedback = entry.last_feedback;
        if first == last {
            self.entries.remove(idx);
        } else if seq == first {
            entry.range.first = first.next();
        } else if seq == last {
            entry.range.last = last.prev();
        } else {
            entry.range.last = seq.prev();
            self.entries.insert(
                idx + 1,
                RcvLossEntry {
                    range: LossRange { first: seq.next(), last },
                    last_feedback: feedback,
                },
            );
        }
        true
    }

    /// Removes every sequence number inside `[first, last]` (message drop).
    pub fn remove_range(&mut self, first: SeqNo, last: SeqNo) {
        let mut out = Vec::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            let r = e.range;
            let overlaps = r.first.cmp_to(last) <= 0 && first.cmp_to(r.last) <= 0;
            if !overlaps {
                out.push(e);
                continue;
            }
            if r.first.cmp_to(first) < 0 {
                out.push(RcvLossEntry {
                    range: LossRange { first: r.first, last: first.prev() },
                    last_feedback: e.last_feedback,
                });
            }
            if last.cmp_to(r.last) < 0 {
                out.push(RcvLossEntry {
                    range: LossRange { first: last.next(), last: r.last },
                    last_feedback: e.last_feedback,
                });
            }
        }
        self.entries = out;
    }

    /// Collects every range whose last report is older than `nak_delay`,
    /// stamping them as reported `now`. The result is ready to be packed
    /// into a NAK body.
    pub fn ranges_due(&mut self, now: Instant, nak_delay: std::time::Duration) -> Vec<LossRange> {
        let mut due = Vec::new();
        for e in &mut self.entries {
            if now.duration_since(e.last_feedback) >= nak_delay {
                e.last_feedback = now;
                due.push(e.range);
            }
        }
        due
    }

    /// Number of sequence numbers currently believed missing.
    pub fn total(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.range.first.len_to(e.range.last) as usize)
            .sum()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RcvLossList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seq(n: u32) -> SeqNo {
        SeqNo::new(n)
    }

    #[test]
    fn snd_insert_merges_overlaps_and_counts_new() {
        let mut l = SndLossList::new();
        assert_eq!(l.insert(seq(4), seq(5)), 2);
        assert_eq!(l.insert(seq(4), seq(5)), 0);
        assert_eq!(l.insert(seq(6), seq(8)), 3);
        assert_eq!(l.total(), 5);
        assert_eq!(l.pop_first(), Some(seq(4)));
        assert_eq!(l.pop_first(), Some(seq(5)));
        assert_eq!(l.total(), 3);
    }

    #[test]
    fn snd_pop_serves_smallest_first() {
        let mut l = SndLossList::new();
        l.insert(seq(10), seq(11));
        l.insert(seq(2), seq(2));
        assert_eq!(l.pop_first(), Some(seq(2)));
        assert_eq!(l.pop_first(), Some(seq(10)));
        assert_eq!(l.pop_first(), Some(seq(11)));
        assert_eq!(l.pop_first(), None);
    }

    #[test]
    fn snd_remove_below_trims_acknowledged_prefix() {
        let mut l = SndLossList::new();
        l.insert(seq(4), seq(9));
        l.remove_below(seq(7));
        assert_eq!(l.pop_first(), Some(seq(7)));
        assert_eq!(l.total(), 2);
    }

    #[test]
    fn snd_handles_wrap_around_ranges() {
        let top = crate::seq::SEQ_MAX;
        let mut l = SndLossList::new();
        l.insert(seq(top - 1), seq(top - 1));
        l.insert(seq(top), seq(1));
        assert_eq!(l.total(), 4);
        assert_eq!(l.pop_first(), Some(seq(top - 1)));
        assert_eq!(l.pop_first(), Some(seq(top)));
        assert_eq!(l.pop_first(), Some(seq(0)));
        assert_eq!(l.pop_first(), Some(seq(1)));
    }

    #[test]
    fn rcv_remove_splits_ranges() {
        let now = Instant::now();
        let delay = Duration::from_millis(10);
        let mut l = RcvLossList::new();
        l.insert(seq(10), seq(14), now);
        assert!(l.remove(seq(12)));
        assert!(!l.remove(seq(12)));
        assert_eq!(l.total(), 4);
        // The split is reported as two ranges around the arrival.
        let due = l.ranges_due(now + delay, delay);
        assert_eq!(
            due,
            vec![
                LossRange { first: seq(10), last: seq(11) },
                LossRange { first: seq(13), last: seq(14) },
            ]
        );
        assert!(l.remove(seq(10)));
        assert_eq!(l.total(), 3);
    }

    #[test]
    fn rcv_feedback_pacing_gates_reports() {
        let now = Instant::now();
        let delay = Duration::from_millis(10);
        let mut l = RcvLossList::new();
        // Seeded one delay in the past: immediately due.
        l.insert(seq(4), seq(5), now - delay);
        let due = l.ranges_due(now, delay);
        assert_eq!(due, vec![LossRange { first: seq(4), last: seq(5) }]);
        // Just reported: not due again until the delay passes.
        assert!(l.ranges_due(now, delay).is_empty());
        assert_eq!(l.ranges_due(now + delay, delay).len(), 1);
    }

    #[test]
    fn rcv_remove_range_cuts_overlaps() {
        let now = Instant::now();
        let mut l = RcvLossList::new();
        l.insert(seq(10), seq(20), now);
        l.remove_range(seq(12), seq(18));
        assert_eq!(l.total(), 4);
        assert!(l.remove(seq(11)));
        assert!(!l.remove(seq(15)));
    }
}
