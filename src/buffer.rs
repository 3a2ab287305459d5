//! # Send and Receive Buffers
//!
//! The send buffer is a queue of packet-sized blocks. Payloads are cut to
//! the payload capacity at admission and each block receives its sequence
//! number right away; because blocks are only released by acknowledgement,
//! a retransmission can rebuild any in-flight packet by sequence offset
//! from the front of the queue. TTL-expired messages are marked dropped in
//! place (the queue must keep its offsets stable) and skipped by the
//! sender.
//!
//! The receive buffer is a slot ring keyed by sequence offset from the next
//! undelivered sequence. Slots are vacant, filled, or passed; a passed slot
//! marks a position consumed by out-of-order message delivery or a message
//! drop, so the in-order delivery pointer can slide over it later.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::packet::{Boundary, DataPacket};
use crate::seq::{MsgNo, SeqNo};

/// One packet's worth of buffered application data on the sender side.
#[derive(Debug)]
pub struct SndBlock {
    /// Sequence number assigned at admission.
    pub seq: SeqNo,
    /// Message this block belongs to.
    pub msg: MsgNo,
    /// Boundary flags for the packet built from this block.
    pub boundary: Boundary,
    /// In-order delivery flag inherited from the submitting call.
    pub in_order: bool,
    /// Optional time-to-live for the whole message.
    pub ttl: Option<Duration>,
    /// When the block was admitted.
    pub origin: Instant,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Abandoned by a TTL drop; the sender skips it.
    pub dropped: bool,
}

/// Ring of application bytes awaiting transmission or acknowledgement.
#[derive(Debug)]
pub struct SndBuffer {
    blocks: VecDeque<SndBlock>,
    next_seq: SeqNo,
    next_msg: MsgNo,
    capacity: usize,
    bytes: usize,
}

impl SndBuffer {
    /// Creates a buffer whose first admitted block takes sequence number
    /// `first_seq`, holding at most `capacity` packets.
    pub fn new(first_seq: SeqNo, capacity: usize) -> Self {
        SndBuffer {
            blocks: VecDeque::new(),
            next_seq: first_seq,
            next_msg: MsgNo::new(1),
            capacity,
            bytes: 0,
        }
    }

    /// Packets currently held.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the buffer holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Bytes currently held.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Packets that can still be admitted.
    pub fn free(&self) -> usize {
        self.capacity - self.blocks.len()
    }

    /// Total capacity in packets.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number the next admitted block will take.
    pub fn next_seq(&self) -> SeqNo {
        self.next_seq
    }

    /// Admits `data` as one message cut into blocks of at most
    /// `payload_size` bytes. The caller must have checked [`free`] first;
    /// the block count is returned.
    ///
    /// [`free`]: SndBuffer::free
    pub fn add(
        &mut self,
        data: &[u8],
        payload_size: usize,
        in_order: bool,
        ttl: Option<Duration>,
        now: Instant,
    ) -> usize {
        debug_assert!(payload_size > 0);
        let msg = self.next_msg;
        self.next_msg = self.next_msg.next();
        let count = data.len().div_ceil(payload_size).max(1);
        for (i, chunk) in data.chunks(payload_size).enumerate() {
            let boundary = match (i == 0, i == count - 1) {
                (true, true) => Boundary::Solo,
                (true, false) => Boundary::First,
                (false, true) => Boundary::Last,
                (false, false) => Boundary::Middle,
            };
            self.blocks.push_back(SndBlock {
                seq: self.next_seq,
                msg,
                boundary,
                in_order,
                ttl,
                origin: now,
                data: chunk.to_vec(),
                dropped: false,
            });
            self.next_seq = self.next_seq.next();
            self.bytes += chunk.len();
        }
        count
    }

    /// Looks up the block for `seq`, if it is still buffered.
    pub fn block_for(&self, seq: SeqNo) -> Option<&SndBlock> {
        let front = self.blocks.front()?;
        let off = front.seq.offset_to(seq);
        if off < 0 {
            return None;
        }
        self.blocks.get(off as usize)
    }

    /// Releases every block below `ack` (the peer's next expected
    /// sequence). Returns `(packets, bytes)` released.
    pub fn ack_up_to(&mut self, ack: SeqNo) -> (usize, usize) {
        let mut pkts = 0;
        let mut bytes = 0;
        while let Some(front) = self.blocks.front() {
            if front.seq.cmp_to(ack) >= 0 {
                break;
            }
            let b = self.blocks.pop_front().expect("front checked");
            pkts += 1;
            bytes += b.data.len();
            self.bytes -= b.data.len();
        }
        (pkts, bytes)
    }

    /// Finds the oldest live message whose TTL has expired, returning its
    /// message number and full sequence span.
    pub fn expired_message(&self, now: Instant) -> Option<(MsgNo, SeqNo, SeqNo)> {
        let hit = self.blocks.iter().find(|b| {
            !b.dropped
                && b.ttl
                    .map(|ttl| now.duration_since(b.origin) > ttl)
                    .unwrap_or(false)
        })?;
        let msg = hit.msg;
        let mut first = hit.seq;
        let mut last = hit.seq;
        for b in &self.blocks {
            if b.msg == msg {
                if b.seq.cmp_to(first) < 0 {
                    first = b.seq;
                }
                if b.seq.cmp_to(last) > 0 {
                    last = b.seq;
                }
            }
        }
        Some((msg, first, last))
    }

    /// Marks every block of `msg` dropped. The blocks stay queued so that
    /// sequence offsets remain valid; they are reclaimed by the normal
    /// acknowledgement path.
    pub fn drop_message(&mut self, msg: MsgNo) {
        for b in self.blocks.iter_mut() {
            if b.msg == msg {
                b.dropped = true;
            }
        }
    }
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Filled(DataPacket),
    Passed,
}

impl Slot {
    fn is_vacant(&self) -> bool {
        matches!(self, Slot::Vacant)
    }
}

/// Outcome of depositing an arrival into the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deposit {
    /// Stored in its slot.
    Stored,
    /// Already delivered or already buffered.
    Duplicate,
    /// Beyond the buffer's window; dropped.
    OutOfWindow,
}

/// Slotted ring receiving in-order and out-of-order arrivals.
#[derive(Debug)]
pub struct RcvBuffer {
    slots: Vec<Slot>,
    /// Sequence number of the slot at `head`, the next undelivered one.
    base: SeqNo,
    head: usize,
    /// Contiguous non-vacant run starting at `head`; `base + ack_len` is
    /// the cumulative acknowledgement sequence.
    ack_len: usize,
    /// One past the furthest non-vacant offset.
    horizon: usize,
    /// Bytes already consumed from the first filled slot (stream reads).
    front_taken: usize,
}

impl RcvBuffer {
    /// Creates a ring expecting `first_seq` next, with `capacity` slots.
    pub fn new(first_seq: SeqNo, capacity: usize) -> Self {
        RcvBuffer {
            slots: (0..capacity).map(|_| Slot::Vacant).collect(),
            base: first_seq,
            head: 0,
            ack_len: 0,
            horizon: 0,
            front_taken: 0,
        }
    }

    fn idx(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    /// Next sequence the buffer would acknowledge cumulatively.
    pub fn ack_seq(&self) -> SeqNo {
        self.base.advance(self.ack_len as i32)
    }

    /// Slots still free for new arrivals, for window advertisement.
    pub fn free_slots(&self) -> usize {
        self.slots.len() - self.horizon
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Deposits an arrival. The caller is responsible for loss-list
    /// bookkeeping; this only manages slots and the ack pointer.
    pub fn deposit(&mut self, pkt: DataPacket) -> Deposit {
        let off = self.base.offset_to(pkt.seq);
        if off < 0 {
            return Deposit::Duplicate;
        }
        let off = off as usize;
        if off >= self.slots.len() {
            return Deposit::OutOfWindow;
        }
        let idx = self.idx(off);
        if !self.slots[idx].is_vacant() {
            return Deposit::Duplicate;
        }
        self.slots[idx] = Slot::Filled(pkt);
        self.horizon = self.horizon.max(off + 1);
        if off == self.ack_len {
            self.advance_ack();
        }
        Deposit::Stored
    }

    fn advance_ack(&mut self) {
        while self.ack_len < self.slots.len() && !self.slots[self.idx(self.ack_len)].is_vacant() {
            self.ack_len += 1;
        }
    }

    fn slide_head(&mut self) {
        self.slots[self.head] = Slot::Vacant;
        self.head = (self.head + 1) % self.slots.len();
        self.base = self.base.next();
        self.ack_len = self.ack_len.saturating_sub(1);
        self.horizon = self.horizon.saturating_sub(1);
        self.front_taken = 0;
    }

    /// Drains in-order bytes into `out`, sliding the delivery pointer over
    /// passed slots. Returns the number of bytes copied.
    pub fn read_stream(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            match &self.slots[self.head] {
                Slot::Passed => self.slide_head(),
                Slot::Filled(pkt) => {
                    let avail = &pkt.payload[self.front_taken..];
                    let take = avail.len().min(out.len() - copied);
                    out[copied..copied + take].copy_from_slice(&avail[..take]);
                    copied += take;
                    self.front_taken += take;
                    if self.front_taken == pkt.payload.len() {
                        self.slide_head();
                    }
                }
                Slot::Vacant => break,
            }
        }
        copied
    }

    /// In-order bytes ready for a stream read.
    pub fn deliverable_bytes(&self) -> usize {
        let mut total = 0;
        for off in 0.. {
            match &self.slots[self.idx(off)] {
                Slot::Filled(pkt) => {
                    let taken = if off == 0 { self.front_taken } else { 0 };
                    total += pkt.payload.len() - taken;
                }
                Slot::Passed => {}
                Slot::Vacant => break,
            }
            if off + 1 >= self.slots.len() {
                break;
            }
        }
        total
    }

    fn find_message(&self, allow_out_of_order: bool) -> Option<(usize, usize)> {
        let mut off = 0;
        while off < self.horizon {
            let start = off;
            match &self.slots[self.idx(off)] {
                Slot::Vacant => {
                    // A hole: anything beyond it is only reachable for
                    // unordered delivery.
                    if !allow_out_of_order {
                        return None;
                    }
                    off += 1;
                }
                Slot::Passed => off += 1,
                Slot::Filled(first) => {
                    if !first.boundary.is_first() {
                        // Mid-message packet whose start was consumed or is
                        // still missing; skip the contiguous run.
                        off += 1;
                        continue;
                    }
                    let at_front = start == 0;
                    let unordered_ok = allow_out_of_order && !first.in_order;
                    if !at_front && !unordered_ok {
                        off += 1;
                        continue;
                    }
                    let msg = first.msg;
                    let mut end = start;
                    loop {
                        match &self.slots[self.idx(end)] {
                            Slot::Filled(p) if p.msg == msg => {
                                if p.boundary.is_last() {
                                    return Some((start, end));
                                }
                                end += 1;
                                if end >= self.horizon {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                    off = end.max(start + 1);
                }
            }
        }
        None
    }

    /// Whether a complete message is deliverable.
    pub fn message_ready(&self, allow_out_of_order: bool) -> bool {
        self.find_message(allow_out_of_order).is_some()
    }

    /// Extracts the next complete message, honouring ordering rules: the
    /// message at the delivery pointer is always eligible; a later message
    /// is eligible only when `allow_out_of_order` is set and it was sent
    /// unordered.
    pub fn read_message(&mut self, allow_out_of_order: bool) -> Option<Vec<u8>> {
        let (start, end) = self.find_message(allow_out_of_order)?;
        let mut data = Vec::new();
        for off in start..=end {
            let idx = self.idx(off);
            if let Slot::Filled(pkt) = std::mem::replace(&mut self.slots[idx], Slot::Passed) {
                data.extend_from_slice(&pkt.payload);
            }
        }
        while matches!(self.slots[self.head], Slot::Passed) {
            self.slide_head();
        }
        Some(data)
    }

    /// Discards every buffered packet inside `[first, last]` and advances
    /// the expected-next pointer past the drop.
    pub fn drop_message(&mut self, first: SeqNo, last: SeqNo) {
        let lo = self.base.offset_to(first).max(0) as usize;
        let hi = self.base.offset_to(last);
        if hi < 0 {
            return;
        }
        let hi = (hi as usize).min(self.slots.len() - 1);
        for off in lo..=hi {
            let idx = self.idx(off);
            self.slots[idx] = Slot::Passed;
        }
        self.horizon = self.horizon.max(hi + 1);
        self.advance_ack();
        while matches!(self.slots[self.head], Slot::Passed) {
            self.slide_head();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u32, msg: u32, boundary: Boundary, in_order: bool, payload: &[u8]) -> DataPacket {
        DataPacket {
            seq: SeqNo::new(seq),
            msg: MsgNo::new(msg),
            boundary,
            in_order,
            timestamp: 0,
            dst_id: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn snd_buffer_cuts_messages_and_assigns_sequences() {
        let now = Instant::now();
        let mut buf = SndBuffer::new(SeqNo::new(100), 64);
        let n = buf.add(&[7u8; 25], 10, true, None, now);
        assert_eq!(n, 3);
        assert_eq!(buf.len(), 3);
        let b = buf.block_for(SeqNo::new(100)).unwrap();
        assert_eq!(b.boundary, Boundary::First);
        assert_eq!(b.data.len(), 10);
        let b = buf.block_for(SeqNo::new(102)).unwrap();
        assert_eq!(b.boundary, Boundary::Last);
        assert_eq!(b.data.len(), 5);
        assert_eq!(buf.next_seq(), SeqNo::new(103));
    }

    #[test]
    fn snd_buffer_ack_releases_prefix() {
        let now = Instant::now();
        let mut buf = SndBuffer::new(SeqNo::new(0), 64);
        buf.add(&[1u8; 30], 10, true, None, now);
        let (pkts, bytes) = buf.ack_up_to(SeqNo::new(2));
        assert_eq!((pkts, bytes), (2, 20));
        assert!(buf.block_for(SeqNo::new(1)).is_none());
        assert!(buf.block_for(SeqNo::new(2)).is_some());
    }

    #[test]
    fn snd_buffer_ttl_expiry_names_the_whole_message() {
        let now = Instant::now();
        let mut buf = SndBuffer::new(SeqNo::new(10), 64);
        buf.add(&[1u8; 20], 10, true, Some(Duration::from_millis(5)), now);
        assert!(buf.expired_message(now).is_none());
        let later = now + Duration::from_millis(10);
        let (msg, first, last) = buf.expired_message(later).unwrap();
        assert_eq!((first, last), (SeqNo::new(10), SeqNo::new(11)));
        buf.drop_message(msg);
        assert!(buf.expired_message(later).is_none());
        assert!(buf.block_for(SeqNo::new(10)).unwrap().dropped);
    }

    #[test]
    fn rcv_buffer_in_order_path() {
        let mut buf = RcvBuffer::new(SeqNo::new(0), 16);
        assert_eq!(buf.deposit(pkt(0, 1, Boundary::Solo, true, b"abc")), Deposit::Stored);
        assert_eq!(buf.ack_seq(), SeqNo::new(1));
        let mut out = [0u8; 8];
        assert_eq!(buf.read_stream(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
        // Slot reusable after delivery.
        assert_eq!(buf.free_slots(), 16);
    }

    #[test]
    fn rcv_buffer_fills_gaps_and_advances_ack() {
        let mut buf = RcvBuffer::new(SeqNo::new(0), 16);
        buf.deposit(pkt(2, 1, Boundary::Middle, true, b"c"));
        assert_eq!(buf.ack_seq(), SeqNo::new(0));
        buf.deposit(pkt(0, 1, Boundary::First, true, b"a"));
        assert_eq!(buf.ack_seq(), SeqNo::new(1));
        assert_eq!(buf.deposit(pkt(0, 1, Boundary::First, true, b"a")), Deposit::Duplicate);
        buf.deposit(pkt(1, 1, Boundary::Middle, true, b"b"));
        assert_eq!(buf.ack_seq(), SeqNo::new(3));
        let mut out = [0u8; 8];
        assert_eq!(buf.read_stream(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn rcv_buffer_partial_stream_reads() {
        let mut buf = RcvBuffer::new(SeqNo::new(0), 8);
        buf.deposit(pkt(0, 1, Boundary::Solo, true, b"hello"));
        let mut out = [0u8; 2];
        assert_eq!(buf.read_stream(&mut out), 2);
        assert_eq!(&out, b"he");
        let mut rest = [0u8; 8];
        assert_eq!(buf.read_stream(&mut rest), 3);
        assert_eq!(&rest[..3], b"llo");
    }

    #[test]
    fn rcv_buffer_message_delivery_in_order() {
        let mut buf = RcvBuffer::new(SeqNo::new(0), 16);
        buf.deposit(pkt(0, 1, Boundary::First, true, b"ab"));
        assert!(buf.read_message(false).is_none());
        buf.deposit(pkt(1, 1, Boundary::Last, true, b"cd"));
        assert_eq!(buf.read_message(false).unwrap(), b"abcd");
        assert!(buf.read_message(false).is_none());
    }

    #[test]
    fn rcv_buffer_unordered_message_skips_gaps() {
        let mut buf = RcvBuffer::new(SeqNo::new(0), 16);
        // Sequence 0 missing; message 2 occupies 1..=2 and was sent
        // unordered.
        buf.deposit(pkt(1, 2, Boundary::First, false, b"xy"));
        buf.deposit(pkt(2, 2, Boundary::Last, false, b"z"));
        assert!(buf.read_message(false).is_none());
        assert_eq!(buf.read_message(true).unwrap(), b"xyz");
        // The late arrival of 0 still delivers normally.
        buf.deposit(pkt(0, 1, Boundary::Solo, true, b"a"));
        assert_eq!(buf.read_message(false).unwrap(), b"a");
        // Passed slots were slid over; buffer is empty again.
        assert_eq!(buf.free_slots(), 16);
    }

    #[test]
    fn rcv_buffer_drop_message_advances_past_hole() {
        let mut buf = RcvBuffer::new(SeqNo::new(0), 16);
        buf.deposit(pkt(3, 2, Boundary::Solo, true, b"later"));
        // Sender dropped message covering 0..=2.
        buf.drop_message(SeqNo::new(0), SeqNo::new(2));
        assert_eq!(buf.ack_seq(), SeqNo::new(4));
        assert_eq!(buf.read_message(false).unwrap(), b"later");
    }
}
