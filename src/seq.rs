//! # Sequence Number Arithmetic
//!
//! Data-packet sequence numbers live in a 31-bit modular space and message
//! numbers in a 29-bit one. Comparison, increment and distance are defined so
//! that wrap-around stays invisible as long as two live numbers are within
//! half the space (2^30) of each other. The engine relies on this for loss
//! lists, acknowledgement windows and probe scheduling.

use serde::Serialize;

/// Largest representable sequence number (31 bits).
pub const SEQ_MAX: u32 = 0x7FFF_FFFF;

/// Half-space threshold used to disambiguate wrapped comparisons.
const SEQ_TH: i64 = 0x4000_0000;

/// Size of the sequence space.
const SEQ_SPAN: i64 = SEQ_MAX as i64 + 1;

/// Largest representable message number (29 bits).
pub const MSG_MAX: u32 = 0x1FFF_FFFF;

/// A 31-bit modular data-packet sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SeqNo(u32);

impl SeqNo {
    /// Zero sequence number.
    pub const ZERO: SeqNo = SeqNo(0);

    /// Wraps `raw` into the 31-bit space.
    pub fn new(raw: u32) -> Self {
        SeqNo(raw & SEQ_MAX)
    }

    /// Draws a random initial sequence number.
    pub fn random() -> Self {
        SeqNo(rand::random::<u32>() & SEQ_MAX)
    }

    /// The raw 31-bit value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The next sequence number, wrapping at the top of the space.
    pub fn next(self) -> Self {
        if self.0 == SEQ_MAX {
            SeqNo(0)
        } else {
            SeqNo(self.0 + 1)
        }
    }

    /// The previous sequence number, wrapping at zero.
    pub fn prev(self) -> Self {
        if self.0 == 0 {
            SeqNo(SEQ_MAX)
        } else {
            SeqNo(self.0 - 1)
        }
    }

    /// `self` advanced by `n` positions (n may be negative).
    pub fn advance(self, n: i32) -> Self {
        let v = (self.0 as i64 + n as i64).rem_euclid(SEQ_SPAN);
        SeqNo(v as u32)
    }

    /// Wrap-aware comparison: negative when `self` precedes `other`,
    /// positive when it follows, zero when equal. Anti-symmetric whenever
    /// the circular distance between the two is below 2^30.
    pub fn cmp_to(self, other: SeqNo) -> i64 {
        let d = self.0 as i64 - other.0 as i64;
        if d.abs() < SEQ_TH {
            d
        } else {
            other.0 as i64 - self.0 as i64
        }
    }

    /// Signed offset from `self` to `to` (how many increments lead from
    /// `self` to `to`), valid while the circular distance is below 2^30.
    pub fn offset_to(self, to: SeqNo) -> i32 {
        let d = to.0 as i64 - self.0 as i64;
        if d.abs() < SEQ_TH {
            d as i32
        } else if d < 0 {
            (d + SEQ_SPAN) as i32
        } else {
            (d - SEQ_SPAN) as i32
        }
    }

    /// Inclusive length of the range `self..=to`.
    pub fn len_to(self, to: SeqNo) -> i32 {
        self.offset_to(to) + 1
    }
}

/// A 29-bit modular message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MsgNo(u32);

impl MsgNo {
    /// Wraps `raw` into the 29-bit space.
    pub fn new(raw: u32) -> Self {
        MsgNo(raw & MSG_MAX)
    }

    /// The raw 29-bit value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The next message number, wrapping at the top of the space.
    pub fn next(self) -> Self {
        if self.0 == MSG_MAX {
            MsgNo(1)
        } else {
            MsgNo(self.0 + 1)
        }
    }
}
