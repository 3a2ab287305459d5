//! # Packet Model and Wire Codec
//!
//! Every datagram on the wire is a 16-byte header of four 32-bit words
//! followed by an optional body, all words in network byte order. The top
//! bit of word 0 separates data packets (clear) from control packets (set).
//!
//! ```text
//! offset  data packet                      control packet
//! 0       0 | 31-bit sequence number       1 | type (15 bits) | reserved
//! 4       boundary(2) | order(1) | msg     additional info
//! 8       timestamp (us)                   timestamp (us)
//! 12      destination socket id            destination socket id
//! ```
//!
//! Encoding writes a fresh network-order image of the packet and decoding
//! parses one; the in-memory representation always stays in host order, so a
//! packet can be retransmitted without any restore step.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::TransportError;
use crate::seq::{MsgNo, SeqNo};

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Default maximum segment size (whole datagram incl. UDP/IP framing).
pub const DEFAULT_MSS: usize = 1500;

/// Overhead subtracted from the MSS to obtain the data payload capacity:
/// 28 bytes UDP/IPv4 framing plus the 16-byte packet header.
pub const PKT_OVERHEAD: usize = 28 + HEADER_SIZE;

const FLAG_BIT: u32 = 0x8000_0000;
const BOUNDARY_SHIFT: u32 = 30;
const ORDER_BIT: u32 = 1 << 29;

/// Position of a data packet inside its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Neither first nor last packet of the message.
    Middle,
    /// Last packet of a multi-packet message.
    Last,
    /// First packet of a multi-packet message.
    First,
    /// The message fits in a single packet.
    Solo,
}

impl Boundary {
    fn bits(self) -> u32 {
        match self {
            Boundary::Middle => 0b00,
            Boundary::Last => 0b01,
            Boundary::First => 0b10,
            Boundary::Solo => 0b11,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b01 => Boundary::Last,
            0b10 => Boundary::First,
            0b11 => Boundary::Solo,
            _ => Boundary::Middle,
        }
    }

    /// Whether this packet starts a message.
    pub fn is_first(self) -> bool {
        matches!(self, Boundary::First | Boundary::Solo)
    }

    /// Whether this packet ends a message.
    pub fn is_last(self) -> bool {
        matches!(self, Boundary::Last | Boundary::Solo)
    }
}

/// Socket type negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Ordered bytestream delivery.
    Stream,
    /// Message-oriented delivery.
    Dgram,
}

impl SocketType {
    fn to_wire(self) -> u32 {
        match self {
            SocketType::Stream => 1,
            SocketType::Dgram => 2,
        }
    }

    fn from_wire(v: u32) -> Result<Self, TransportError> {
        match v {
            1 => Ok(SocketType::Stream),
            2 => Ok(SocketType::Dgram),
            _ => Err(TransportError::MalformedPacket("socket type")),
        }
    }
}

/// An application data packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    /// 31-bit monotonic sequence number.
    pub seq: SeqNo,
    /// 29-bit message number.
    pub msg: MsgNo,
    /// Message-boundary flags.
    pub boundary: Boundary,
    /// Whether the message must be delivered in order.
    pub in_order: bool,
    /// Microseconds since connection start.
    pub timestamp: u32,
    /// Destination socket identifier.
    pub dst_id: u32,
    /// Application bytes.
    pub payload: Vec<u8>,
}

/// Handshake body exchanged while establishing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version (currently 4).
    pub version: u32,
    /// Requested socket type.
    pub sock_type: SocketType,
    /// Sender's initial sequence number.
    pub init_seq: SeqNo,
    /// Sender's maximum segment size.
    pub mss: u32,
    /// Sender's flow-control window (receive capacity in packets).
    pub flow_window: u32,
    /// Exchange step: 1 request, 0 rendezvous, -1 response, -2 final.
    pub req_type: i32,
    /// Sender's socket identifier.
    pub socket_id: u32,
    /// Syn cookie; zero in the initial request.
    pub cookie: u32,
    /// Peer IP as seen by the sender, IPv4-mapped into four words.
    pub peer_ip: [u32; 4],
}

/// Handshake `req_type` value for a caller-initiated request.
pub const HS_REQUEST: i32 = 1;
/// Handshake `req_type` value for a rendezvous request.
pub const HS_RENDEZVOUS: i32 = 0;
/// Handshake `req_type` value for the responder's reply.
pub const HS_RESPONSE: i32 = -1;
/// Handshake `req_type` value for the requester's cookie echo.
pub const HS_FINAL: i32 = -2;

/// Measurements carried in a full acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckInfo {
    /// Round-trip time in microseconds.
    pub rtt: u32,
    /// RTT variance in microseconds.
    pub rtt_var: u32,
    /// Available receive-buffer space in packets.
    pub avail_buf: u32,
    /// Estimated link capacity in packets per second.
    pub bandwidth: u32,
    /// Measured receive rate in packets per second.
    pub recv_rate: u32,
}

/// A contiguous range of lost sequence numbers, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    /// First missing sequence number.
    pub first: SeqNo,
    /// Last missing sequence number.
    pub last: SeqNo,
}

impl LossRange {
    /// A range covering a single sequence number.
    pub fn single(seq: SeqNo) -> Self {
        LossRange { first: seq, last: seq }
    }
}

/// Control packet bodies, one variant per wire type code.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Type 0: connection establishment.
    Handshake(Handshake),
    /// Type 1: liveness signal during idle periods.
    KeepAlive,
    /// Type 2: cumulative acknowledgement. A light ACK has `serial == 0`
    /// and no measurement body; a full ACK carries a nonzero serial that
    /// the peer echoes in an ACK².
    Ack {
        /// ACK serial number; zero for light ACKs.
        serial: u32,
        /// Next sequence number the receiver expects.
        ack_seq: SeqNo,
        /// Present on full ACKs only.
        info: Option<AckInfo>,
    },
    /// Type 3: negative acknowledgement naming missing ranges.
    Nak(Vec<LossRange>),
    /// Type 4: peer-initiated congestion notice; treated as a loss event.
    CongestionWarning,
    /// Type 5: orderly teardown notice.
    Shutdown,
    /// Type 6: echo of a full ACK's serial number.
    Ack2 {
        /// The echoed serial.
        serial: u32,
    },
    /// Type 7: drop an entire message that exceeded its time-to-live.
    MsgDrop {
        /// Message being dropped.
        msg: MsgNo,
        /// First sequence number of the message.
        first: SeqNo,
        /// Last sequence number of the message.
        last: SeqNo,
    },
    /// Type 8: peer signalled an unrecoverable error.
    Error {
        /// Implementation-defined error code.
        code: u32,
    },
}

impl Control {
    fn type_code(&self) -> u16 {
        match self {
            Control::Handshake(_) => 0,
            Control::KeepAlive => 1,
            Control::Ack { .. } => 2,
            Control::Nak(_) => 3,
            Control::CongestionWarning => 4,
            Control::Shutdown => 5,
            Control::Ack2 { .. } => 6,
            Control::MsgDrop { .. } => 7,
            Control::Error { .. } => 8,
        }
    }
}

/// A control packet: common trailer words plus a typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPacket {
    /// Microseconds since connection start.
    pub timestamp: u32,
    /// Destination socket identifier.
    pub dst_id: u32,
    /// Typed body.
    pub body: Control,
}

/// Any packet that can cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Application data.
    Data(DataPacket),
    /// Protocol control.
    Control(ControlPacket),
}

impl Packet {
    /// Destination socket identifier from the header.
    pub fn dst_id(&self) -> u32 {
        match self {
            Packet::Data(d) => d.dst_id,
            Packet::Control(c) => c.dst_id,
        }
    }

    /// Header timestamp in microseconds since connection start.
    pub fn timestamp(&self) -> u32 {
        match self {
            Packet::Data(d) => d.timestamp,
            Packet::Control(c) => c.timestamp,
        }
    }

    /// Length of the body in bytes (payload for data, words for control).
    pub fn body_len(&self) -> usize {
        match self {
            Packet::Data(d) => d.payload.len(),
            Packet::Control(c) => control_body_len(&c.body),
        }
    }

    /// Total encoded size in bytes.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// Encodes the packet into `buf` in network byte order. `buf` is
    /// cleared first; the in-memory packet is left untouched.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.reserve(self.wire_len());
        match self {
            Packet::Data(d) => {
                buf.write_u32::<BigEndian>(d.seq.raw()).expect("vec write");
                let word1 =
                    (d.boundary.bits() << BOUNDARY_SHIFT)
                        | if d.in_order { ORDER_BIT } else { 0 }
                        | d.msg.raw();
                buf.write_u32::<BigEndian>(word1).expect("vec write");
                buf.write_u32::<BigEndian>(d.timestamp).expect("vec write");
                buf.write_u32::<BigEndian>(d.dst_id).expect("vec write");
                buf.extend_from_slice(&d.payload);
            }
            Packet::Control(c) => {
                let word0 = FLAG_BIT | ((c.body.type_code() as u32) << 16);
                buf.write_u32::<BigEndian>(word0).expect("vec write");
                buf.write_u32::<BigEndian>(additional_info(&c.body)).expect("vec write");
                buf.write_u32::<BigEndian>(c.timestamp).expect("vec write");
                buf.write_u32::<BigEndian>(c.dst_id).expect("vec write");
                encode_control_body(&c.body, buf);
            }
        }
    }

    /// Parses one datagram. Control bodies are validated against their type
    /// code; anything shorter than a header or with a truncated body is
    /// rejected.
    pub fn decode(raw: &[u8]) -> Result<Packet, TransportError> {
        if raw.len() < HEADER_SIZE {
            return Err(TransportError::MalformedPacket("short header"));
        }
        let mut rd = Cursor::new(raw);
        let word0 = rd.read_u32::<BigEndian>().expect("bounds checked");
        let word1 = rd.read_u32::<BigEndian>().expect("bounds checked");
        let timestamp = rd.read_u32::<BigEndian>().expect("bounds checked");
        let dst_id = rd.read_u32::<BigEndian>().expect("bounds checked");
        let body = &raw[HEADER_SIZE..];

        if word0 & FLAG_BIT == 0 {
            return Ok(Packet::Data(DataPacket {
                seq: SeqNo::new(word0),
                msg: MsgNo::new(word1),
                boundary: Boundary::from_bits(word1 >> BOUNDARY_SHIFT),
                in_order: word1 & ORDER_BIT != 0,
                timestamp,
                dst_id,
                payload: body.to_vec(),
            }));
        }

        let type_code = ((word0 & !FLAG_BIT) >> 16) as u16;
        if body.len() % 4 != 0 {
            return Err(TransportError::MalformedPacket("ragged control body"));
        }
        let mut words = Vec::with_capacity(body.len() / 4);
        let mut rd = Cursor::new(body);
        for _ in 0..body.len() / 4 {
            words.push(rd.read_u32::<BigEndian>().expect("bounds checked"));
        }
        let body = decode_control_body(type_code, word1, &words)?;
        Ok(Packet::Control(ControlPacket { timestamp, dst_id, body }))
    }
}

fn additional_info(body: &Control) -> u32 {
    match body {
        Control::Ack { serial, ack_seq, info } => {
            // Light ACKs have no body, so the cumulative sequence rides in
            // the additional-info word instead of the serial.
            if info.is_some() {
                *serial
            } else {
                ack_seq.raw()
            }
        }
        Control::Ack2 { serial } => *serial,
        Control::MsgDrop { msg, .. } => msg.raw(),
        Control::Error { code } => *code,
        _ => 0,
    }
}

fn control_body_len(body: &Control) -> usize {
    match body {
        Control::Handshake(_) => 12 * 4,
        Control::Ack { info: Some(_), .. } => 6 * 4,
        Control::Nak(ranges) => ranges
            .iter()
            .map(|r| if r.first == r.last { 4 } else { 8 })
            .sum(),
        Control::MsgDrop { .. } => 2 * 4,
        _ => 0,
    }
}

fn encode_control_body(body: &Control, buf: &mut Vec<u8>) {
    match body {
        Control::Handshake(hs) => {
            for word in [
                hs.version,
                hs.sock_type.to_wire(),
                hs.init_seq.raw(),
                hs.mss,
                hs.flow_window,
                hs.req_type as u32,
                hs.socket_id,
                hs.cookie,
                hs.peer_ip[0],
                hs.peer_ip[1],
                hs.peer_ip[2],
                hs.peer_ip[3],
            ] {
                buf.write_u32::<BigEndian>(word).expect("vec write");
            }
        }
        Control::Ack { ack_seq, info: Some(info), .. } => {
            for word in [
                ack_seq.raw(),
                info.rtt,
                info.rtt_var,
                info.avail_buf,
                info.bandwidth,
                info.recv_rate,
            ] {
                buf.write_u32::<BigEndian>(word).expect("vec write");
            }
        }
        Control::Nak(ranges) => {
            for r in ranges {
                if r.first == r.last {
                    buf.write_u32::<BigEndian>(r.first.raw()).expect("vec write");
                } else {
                    buf.write_u32::<BigEndian>(r.first.raw() | FLAG_BIT).expect("vec write");
                    buf.write_u32::<BigEndian>(r.last.raw()).expect("vec write");
                }
            }
        }
        Control::MsgDrop { first, last, .. } => {
            buf.write_u32::<BigEndian>(first.raw()).expect("vec write");
            buf.write_u32::<BigEndian>(last.raw()).expect("vec write");
        }
        _ => {}
    }
}

fn decode_control_body(
    type_code: u16,
    info_word: u32,
    words: &[u32],
) -> Result<Control, TransportError> {
    match type_code {
        0 => {
            if words.len() < 12 {
                return Err(TransportError::MalformedPacket("short handshake"));
            }
            Ok(Control::Handshake(Handshake {
                version: words[0],
                sock_type: SocketType::from_wire(words[1])?,
                init_seq: SeqNo::new(words[2]),
                mss: words[3],
                flow_window: words[4],
                req_type: words[5] as i32,
                socket_id: words[6],
                cookie: words[7],
                peer_ip: [words[8], words[9], words[10], words[11]],
            }))
        }
        1 => Ok(Control::KeepAlive),
        2 => {
            if words.is_empty() {
                return Ok(Control::Ack {
                    serial: 0,
                    ack_seq: SeqNo::new(info_word),
                    info: None,
                });
            }
            if words.len() < 6 {
                return Err(TransportError::MalformedPacket("short ack"));
            }
            Ok(Control::Ack {
                serial: info_word,
                ack_seq: SeqNo::new(words[0]),
                info: Some(AckInfo {
                    rtt: words[1],
                    rtt_var: words[2],
                    avail_buf: words[3],
                    bandwidth: words[4],
                    recv_rate: words[5],
                }),
            })
        }
        3 => {
            let mut ranges = Vec::new();
            let mut i = 0;
            while i < words.len() {
                if words[i] & FLAG_BIT != 0 {
                    if i + 1 >= words.len() {
                        return Err(TransportError::MalformedPacket("dangling loss range"));
                    }
                    ranges.push(LossRange {
                        first: SeqNo::new(words[i] & !FLAG_BIT),
                        last: SeqNo::new(words[i + 1]),
                    });
                    i += 2;
                } else {
                    ranges.push(LossRange::single(SeqNo::new(words[i])));
                    i += 1;
                }
            }
            Ok(Control::Nak(ranges))
        }
        4 => Ok(Control::CongestionWarning),
        5 => Ok(Control::Shutdown),
        6 => Ok(Control::Ack2 { serial: info_word }),
        7 => {
            if words.len() < 2 {
                return Err(TransportError::MalformedPacket("short msg-drop"));
            }
            Ok(Control::MsgDrop {
                msg: MsgNo::new(info_word),
                first: SeqNo::new(words[0]),
                last: SeqNo::new(words[1]),
            })
        }
        8 => Ok(Control::Error { code: info_word }),
        _ => Err(TransportError::MalformedPacket("unknown control type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pkt: Packet) {
        let mut buf = Vec::new();
        pkt.encode(&mut buf);
        let back = Packet::decode(&buf).expect("decode");
        assert_eq!(pkt, back);
    }

    #[test]
    fn data_packet_roundtrip() {
        roundtrip(Packet::Data(DataPacket {
            seq: SeqNo::new(0x1234_5678),
            msg: MsgNo::new(77),
            boundary: Boundary::First,
            in_order: true,
            timestamp: 123_456,
            dst_id: 42,
            payload: b"hello world".to_vec(),
        }));
    }

    #[test]
    fn data_header_layout_is_network_order() {
        let pkt = Packet::Data(DataPacket {
            seq: SeqNo::new(1),
            msg: MsgNo::new(2),
            boundary: Boundary::Solo,
            in_order: false,
            timestamp: 3,
            dst_id: 4,
            payload: vec![0xAB],
        });
        let mut buf = Vec::new();
        pkt.encode(&mut buf);
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        // Solo boundary = 0b11 in the top two bits of word 1.
        assert_eq!(buf[4], 0b1100_0000);
        assert_eq!(&buf[12..16], &[0, 0, 0, 4]);
        assert_eq!(buf[16], 0xAB);
    }

    #[test]
    fn handshake_roundtrip() {
        roundtrip(Packet::Control(ControlPacket {
            timestamp: 10,
            dst_id: 0,
            body: Control::Handshake(Handshake {
                version: 4,
                sock_type: SocketType::Stream,
                init_seq: SeqNo::new(999),
                mss: 1500,
                flow_window: 8192,
                req_type: HS_RESPONSE,
                socket_id: 7,
                cookie: 0xDEAD_BEEF,
                peer_ip: [0x7F00_0001, 0, 0, 0],
            }),
        }));
    }

    #[test]
    fn light_and_full_acks_are_distinguished_by_body() {
        let light = Packet::Control(ControlPacket {
            timestamp: 0,
            dst_id: 9,
            body: Control::Ack { serial: 0, ack_seq: SeqNo::new(100), info: None },
        });
        let mut buf = Vec::new();
        light.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        roundtrip(light);

        roundtrip(Packet::Control(ControlPacket {
            timestamp: 0,
            dst_id: 9,
            body: Control::Ack {
                serial: 3,
                ack_seq: SeqNo::new(100),
                info: Some(AckInfo {
                    rtt: 1000,
                    rtt_var: 250,
                    avail_buf: 8000,
                    bandwidth: 50_000,
                    recv_rate: 40_000,
                }),
            },
        }));
    }

    #[test]
    fn nak_mixes_single_losses_and_ranges() {
        let pkt = Packet::Control(ControlPacket {
            timestamp: 0,
            dst_id: 1,
            body: Control::Nak(vec![
                LossRange::single(SeqNo::new(4)),
                LossRange { first: SeqNo::new(9), last: SeqNo::new(12) },
            ]),
        });
        let mut buf = Vec::new();
        pkt.encode(&mut buf);
        // One single word plus a two-word range.
        assert_eq!(buf.len(), HEADER_SIZE + 12);
        assert_eq!(buf[HEADER_SIZE + 4] & 0x80, 0x80);
        roundtrip(pkt);
    }

    #[test]
    fn remaining_control_types_roundtrip() {
        for body in [
            Control::KeepAlive,
            Control::CongestionWarning,
            Control::Shutdown,
            Control::Ack2 { serial: 55 },
            Control::MsgDrop {
                msg: MsgNo::new(5),
                first: SeqNo::new(20),
                last: SeqNo::new(24),
            },
            Control::Error { code: 2 },
        ] {
            roundtrip(Packet::Control(ControlPacket { timestamp: 77, dst_id: 3, body }));
        }
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        assert!(Packet::decode(&[0u8; 8]).is_err());
        // Handshake with an empty body.
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(FLAG_BIT).unwrap();
        buf.extend_from_slice(&[0u8; 12]);
        assert!(Packet::decode(&buf).is_err());
    }
}
