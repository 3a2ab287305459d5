//! # Demonstration Wire Formats
//!
//! The framing the demo tools speak over an established connection:
//!
//! - the **file-transfer header**: filename length (u32, network order),
//!   filename bytes, file size (u64, little-endian, matching the reference
//!   writer), then the raw bytes;
//! - the **screen-capture protocol**: a negotiation preamble of
//!   length-prefixed encoder name and caps string answered by a four-byte
//!   status, followed by frames of (length, presentation timestamp,
//!   duration, flags, payload) with all multi-byte fields in network order
//!   and an all-ones timestamp or duration meaning "none";
//! - the **ICE credential line**: a single line of length-prefixed
//!   `<n>:<bytes>` fields in the order ufrag, pwd, candidates.
//!
//! Pure encoders/parsers live next to the async helpers that run them over
//! a connection, so the byte layouts are testable without sockets.

use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::socket::Transport;

/// Upper bound accepted for a transmitted filename.
pub const MAX_NAME_LEN: usize = 1024 * 1024;

/// Upper bound accepted for negotiation strings.
pub const MAX_NEGOTIATION_LEN: usize = 1024 * 1024;

/// Upper bound accepted for a single media frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Sentinel meaning "no timestamp"/"no duration" in a frame header.
pub const TIME_NONE: u64 = u64::MAX;

/// Negotiation accepted; the frame loop follows.
pub const STATUS_ACCEPT: u32 = 0;
/// The caps string did not parse.
pub const STATUS_BAD_CAPS: u32 = 1;
/// No suitable sink is available on the receiver.
pub const STATUS_NO_SINK: u32 = 2;
/// The receiver failed to assemble its pipeline.
pub const STATUS_PIPELINE_SETUP: u32 = 3;
/// The receiver's pipeline refused to start.
pub const STATUS_PIPELINE_START: u32 = 4;

// ---------------------------------------------------------------------
// ICE credential line
// ---------------------------------------------------------------------

/// Encodes one length-prefixed field.
pub fn encode_field(value: &str) -> String {
    format!("{}:{}", value.len(), value)
}

/// Decodes one field at `*pos`, skipping leading whitespace. Returns
/// `None` on malformed length, missing colon or truncation.
fn decode_field(line: &str, pos: &mut usize) -> Option<String> {
    let bytes = line.as_bytes();
    while *pos < bytes.len() && bytes[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    if *pos >= bytes.len() {
        return None;
    }
    let colon = line[*pos..].find(':')? + *pos;
    if colon == *pos {
        return None;
    }
    let len: usize = line[*pos..colon].parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > bytes.len() {
        return None;
    }
    *pos = end;
    Some(line[start..end].to_string())
}

/// Formats credentials and candidates as one exchange line.
pub fn format_ice_line(ufrag: &str, pwd: &str, candidates: &[String]) -> String {
    let mut line = encode_field(ufrag);
    line.push_str(&encode_field(pwd));
    for cand in candidates {
        line.push_str(&encode_field(cand));
    }
    line
}

/// Parses an exchange line into `(ufrag, pwd, candidates)`. Surrounding
/// whitespace is tolerated; trailing garbage and truncated fields are not.
pub fn parse_ice_line(line: &str) -> Option<(String, String, Vec<String>)> {
    let mut pos = 0;
    let ufrag = decode_field(line, &mut pos)?;
    let pwd = decode_field(line, &mut pos)?;
    let mut candidates = Vec::new();
    loop {
        let mark = pos;
        match decode_field(line, &mut pos) {
            Some(cand) => candidates.push(cand),
            None => {
                pos = mark;
                break;
            }
        }
    }
    if !line[pos..].chars().all(|c| c.is_ascii_whitespace()) {
        return None;
    }
    Some((ufrag, pwd, candidates))
}

// ---------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------

/// Encodes the file-transfer header for `name` and `size`.
pub fn encode_file_header(name: &str, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + name.len());
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, name.len() as u32);
    out.extend_from_slice(&word);
    out.extend_from_slice(name.as_bytes());
    let mut size_bytes = [0u8; 8];
    LittleEndian::write_u64(&mut size_bytes, size);
    out.extend_from_slice(&size_bytes);
    out
}

/// Sends the file at `path` over the connection: header, then contents.
/// Returns the number of payload bytes streamed.
pub async fn send_file(transport: &Transport, id: u32, path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    let mut file = tokio::fs::File::open(path).await.map_err(TransportError::File)?;
    let size = file
        .metadata()
        .await
        .map_err(TransportError::File)?
        .len();

    transport.send_all(id, &encode_file_header(&name, size)).await?;
    let sent = transport.sendfile(id, &mut file, size).await?;
    info!("sent file {name:?} ({sent} bytes)");
    Ok(sent)
}

/// Receives one file transfer, writing the payload to `output`. Returns
/// the transmitted name and the byte count.
pub async fn recv_file(
    transport: &Transport,
    id: u32,
    output: &Path,
) -> Result<(String, u64)> {
    let mut word = [0u8; 4];
    transport.recv_all(id, &mut word).await?;
    let name_len = BigEndian::read_u32(&word) as usize;
    if name_len > MAX_NAME_LEN {
        return Err(TransportError::MalformedPacket("file name length"));
    }
    let mut name_bytes = vec![0u8; name_len];
    transport.recv_all(id, &mut name_bytes).await?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    let mut size_bytes = [0u8; 8];
    transport.recv_all(id, &mut size_bytes).await?;
    let size = LittleEndian::read_u64(&size_bytes);

    let mut file = tokio::fs::File::create(output)
        .await
        .map_err(TransportError::File)?;
    let received = transport.recvfile(id, &mut file, size).await?;
    if received != size {
        return Err(TransportError::ConnBroken);
    }
    info!("received file {name:?} ({received} bytes) into {output:?}");
    Ok((name, received))
}

// ---------------------------------------------------------------------
// Screen-capture framing
// ---------------------------------------------------------------------

/// Negotiation preamble sent by the capture side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Encoder element name, UTF-8.
    pub encoder: String,
    /// Caps string describing the bitstream.
    pub caps: String,
}

/// One encoded media frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Presentation timestamp, when known.
    pub pts: Option<u64>,
    /// Frame duration, when known.
    pub duration: Option<u64>,
    /// Substrate-defined buffer flags.
    pub flags: u32,
    /// Encoded bitstream bytes.
    pub payload: Vec<u8>,
}

/// Encodes the negotiation preamble.
pub fn encode_negotiation(neg: &Negotiation) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + neg.encoder.len() + neg.caps.len());
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, neg.encoder.len() as u32);
    out.extend_from_slice(&word);
    out.extend_from_slice(neg.encoder.as_bytes());
    BigEndian::write_u32(&mut word, neg.caps.len() as u32);
    out.extend_from_slice(&word);
    out.extend_from_slice(neg.caps.as_bytes());
    out
}

/// Encodes the four-byte status reply.
pub fn encode_status(status: u32) -> [u8; 4] {
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, status);
    word
}

/// Encodes a frame header plus payload.
pub fn encode_frame(frame: &MediaFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + frame.payload.len());
    let mut word = [0u8; 4];
    let mut dword = [0u8; 8];
    BigEndian::write_u32(&mut word, frame.payload.len() as u32);
    out.extend_from_slice(&word);
    BigEndian::write_u64(&mut dword, frame.pts.unwrap_or(TIME_NONE));
    out.extend_from_slice(&dword);
    BigEndian::write_u64(&mut dword, frame.duration.unwrap_or(TIME_NONE));
    out.extend_from_slice(&dword);
    BigEndian::write_u32(&mut word, frame.flags);
    out.extend_from_slice(&word);
    out.extend_from_slice(&frame.payload);
    out
}

/// Sends the negotiation preamble and waits for the status reply.
pub async fn negotiate(transport: &Transport, id: u32, neg: &Negotiation) -> Result<u32> {
    transport.send_all(id, &encode_negotiation(neg)).await?;
    let mut word = [0u8; 4];
    transport.recv_all(id, &mut word).await?;
    Ok(BigEndian::read_u32(&word))
}

/// Reads the negotiation preamble on the serving side.
pub async fn read_negotiation(transport: &Transport, id: u32) -> Result<Negotiation> {
    let mut word = [0u8; 4];
    transport.recv_all(id, &mut word).await?;
    let encoder_len = BigEndian::read_u32(&word) as usize;
    if encoder_len > MAX_NEGOTIATION_LEN {
        return Err(TransportError::MalformedPacket("encoder name length"));
    }
    let mut encoder = vec![0u8; encoder_len];
    transport.recv_all(id, &mut encoder).await?;

    transport.recv_all(id, &mut word).await?;
    let caps_len = BigEndian::read_u32(&word) as usize;
    if caps_len > MAX_NEGOTIATION_LEN {
        return Err(TransportError::MalformedPacket("caps length"));
    }
    let mut caps = vec![0u8; caps_len];
    transport.recv_all(id, &mut caps).await?;

    Ok(Negotiation {
        encoder: String::from_utf8_lossy(&encoder).into_owned(),
        caps: String::from_utf8_lossy(&caps).into_owned(),
    })
}

/// Answers a negotiation with a status word.
pub async fn send_status(transport: &Transport, id: u32, status: u32) -> Result<()> {
    debug!("answering negotiation with status {status}");
    transport.send_all(id, &encode_status(status)).await
}

/// Sends one media frame.
pub async fn send_frame(transport: &Transport, id: u32, frame: &MediaFrame) -> Result<()> {
    transport.send_all(id, &encode_frame(frame)).await
}

/// Reads one media frame.
pub async fn read_frame(transport: &Transport, id: u32) -> Result<MediaFrame> {
    let mut word = [0u8; 4];
    let mut dword = [0u8; 8];
    transport.recv_all(id, &mut word).await?;
    let len = BigEndian::read_u32(&word) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::MalformedPacket("frame length"));
    }
    transport.recv_all(id, &mut dword).await?;
    let pts = BigEndian::read_u64(&dword);
    transport.recv_all(id, &mut dword).await?;
    let duration = BigEndian::read_u64(&dword);
    transport.recv_all(id, &mut word).await?;
    let flags = BigEndian::read_u32(&word);
    let mut payload = vec![0u8; len];
    transport.recv_all(id, &mut payload).await?;
    Ok(MediaFrame {
        pts: (pts != TIME_NONE).then_some(pts),
        duration: (duration != TIME_NONE).then_some(duration),
        flags,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_line_round_trips() {
        let cands = vec!["candidate one".to_string(), "candidate two".to_string()];
        let line = format_ice_line("abcd", "s3cret", &cands);
        let (ufrag, pwd, parsed) = parse_ice_line(&line).unwrap();
        assert_eq!(ufrag, "abcd");
        assert_eq!(pwd, "s3cret");
        assert_eq!(parsed, cands);
    }

    #[test]
    fn ice_line_matches_the_reference_vector() {
        let line = "5:abcde8:passw0rd17:candidate:1 udp X";
        let (ufrag, pwd, cands) = parse_ice_line(line).unwrap();
        assert_eq!(ufrag, "abcde");
        assert_eq!(pwd, "passw0rd");
        assert_eq!(cands, vec!["candidate:1 udp X".to_string()]);
    }

    #[test]
    fn ice_line_tolerates_surrounding_whitespace() {
        let line = "  2:ab 3:pwd  5:cand1 ";
        let (ufrag, pwd, cands) = parse_ice_line(line).unwrap();
        assert_eq!(ufrag, "ab");
        assert_eq!(pwd, "pwd");
        assert_eq!(cands, vec!["cand1".to_string()]);
    }

    #[test]
    fn malformed_ice_lines_are_rejected() {
        // Only one field.
        assert!(parse_ice_line("3:abc").is_none());
        // Truncated value.
        assert!(parse_ice_line("5:abcde9:short").is_none());
        // Bad length digits.
        assert!(parse_ice_line("x:abc2:pw").is_none());
        // Trailing garbage after the last field.
        assert!(parse_ice_line("2:ab2:pw junk").is_none());
        assert!(parse_ice_line("").is_none());
    }

    #[test]
    fn file_header_layout() {
        let header = encode_file_header("x", 3);
        // Name length is big-endian, size is the reference writer's
        // little-endian.
        assert_eq!(&header[0..4], &[0, 0, 0, 1]);
        assert_eq!(header[4], b'x');
        assert_eq!(&header[5..13], &[3, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn negotiation_layout_matches_the_reference() {
        let neg = Negotiation { encoder: "h265x".into(), caps: String::new() };
        let bytes = encode_negotiation(&neg);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..9], b"h265x");
        assert_eq!(&bytes[9..13], &[0, 0, 0, 0]);
        // "No suitable sink" answer.
        assert_eq!(encode_status(STATUS_NO_SINK), [0, 0, 0, 2]);
    }

    #[test]
    fn frame_header_uses_all_ones_for_missing_times() {
        let frame = MediaFrame {
            pts: None,
            duration: Some(40_000_000),
            flags: 0x10,
            payload: vec![0xAA, 0xBB],
        };
        let bytes = encode_frame(&frame);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4..12], &[0xFF; 8]);
        assert_eq!(&bytes[12..20], &40_000_000u64.to_be_bytes());
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0x10]);
        assert_eq!(&bytes[24..], &[0xAA, 0xBB]);
    }
}
