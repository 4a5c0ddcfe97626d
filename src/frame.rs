//! MUP1 byte framing
//!
//! Wire format: `'>' TYPE DATA... '<' ['<'] HHHH`. DATA is byte-stuffed so
//! the markers never appear unescaped inside it, the end marker is doubled
//! when DATA has an even length, and `HHHH` is a 16-bit checksum over the
//! unescaped frame written as four hex digits.

use crate::error::{CoreconfError, Result};

/// Start-of-frame marker
pub const SOF: u8 = b'>';
/// End-of-frame marker
pub const EOF: u8 = b'<';
/// Escape prefix
pub const ESC: u8 = b'\\';

/// Largest unescaped payload accepted by the decoder
pub const MAX_PAYLOAD: usize = 4096;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Unsolicited boot/readiness announcement
    Announce,
    /// CoAP message, request or response
    Coap,
    /// Liveness check
    Ping,
    /// Device debug text
    Trace,
    /// Device status report
    Status,
    /// Any other type byte
    Other(u8),
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            b'A' => Self::Announce,
            b'C' => Self::Coap,
            b'P' => Self::Ping,
            b'T' => Self::Trace,
            b'S' => Self::Status,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Announce => b'A',
            Self::Coap => b'C',
            Self::Ping => b'P',
            Self::Trace => b'T',
            Self::Status => b'S',
            Self::Other(b) => b,
        }
    }
}

/// A decoded, checksum-verified frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let raw = unescaped_frame(self.frame_type.as_u8(), &self.payload);
        let sum = checksum(&raw);

        let mut out = Vec::with_capacity(raw.len() + self.payload.len() / 4 + 8);
        out.push(SOF);
        out.push(self.frame_type.as_u8());
        for &b in &self.payload {
            push_escaped(&mut out, b);
        }
        out.push(EOF);
        if self.payload.len() % 2 == 0 {
            out.push(EOF);
        }
        out.extend_from_slice(format!("{sum:04x}").as_bytes());
        out
    }

    /// Decode exactly one frame from a complete buffer (one UDP datagram).
    ///
    /// Leading noise is skipped; the first complete frame or framing error
    /// found wins.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let mut decoder = FrameDecoder::new();
        decoder
            .push(bytes)
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(CoreconfError::Framing("incomplete frame".into())))
    }
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    match b {
        SOF | EOF | ESC => {
            out.push(ESC);
            out.push(b);
        }
        0x00 => out.extend_from_slice(b"\\0"),
        0xFF => out.extend_from_slice(b"\\F"),
        _ => out.push(b),
    }
}

fn unescape(b: u8) -> Option<u8> {
    match b {
        SOF | EOF | ESC => Some(b),
        b'0' => Some(0x00),
        b'F' => Some(0xFF),
        _ => None,
    }
}

fn unescaped_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(payload.len() + 4);
    raw.push(SOF);
    raw.push(frame_type);
    raw.extend_from_slice(payload);
    raw.push(EOF);
    if payload.len() % 2 == 0 {
        raw.push(EOF);
    }
    raw
}

/// 16-bit one's-complement checksum over big-endian words
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| {
            let hi = u32::from(pair[0]) << 8;
            let lo = pair.get(1).copied().map(u32::from).unwrap_or(0);
            hi | lo
        })
        .sum();
    while sum > 0xFFFF {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Type,
    Data,
    Escape,
    SecondEof,
    Checksum,
}

/// Incremental frame decoder for byte streams.
///
/// Bytes may arrive in arbitrary chunks; state carries across calls to
/// [`FrameDecoder::push`].
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    frame_type: u8,
    payload: Vec<u8>,
    digits: Vec<u8>,
    skipped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            frame_type: 0,
            payload: Vec::new(),
            digits: Vec::with_capacity(4),
            skipped: 0,
        }
    }

    /// Number of noise bytes discarded while hunting for a start marker
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed bytes, returning every frame (or framing error) they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Frame>> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(result) = self.step(b) {
                out.push(result);
            }
        }
        out
    }

    fn restart(&mut self) {
        self.state = State::Type;
        self.payload.clear();
        self.digits.clear();
    }

    fn fail(&mut self, reason: String) -> Option<Result<Frame>> {
        self.state = State::Idle;
        self.payload.clear();
        self.digits.clear();
        Some(Err(CoreconfError::Framing(reason)))
    }

    fn step(&mut self, b: u8) -> Option<Result<Frame>> {
        match self.state {
            State::Idle => {
                if b == SOF {
                    self.restart();
                } else {
                    self.skipped += 1;
                }
                None
            }
            State::Type => match b {
                SOF => None,
                EOF | ESC => self.fail(format!("invalid frame type byte 0x{b:02x}")),
                _ => {
                    self.frame_type = b;
                    self.state = State::Data;
                    None
                }
            },
            State::Data => match b {
                ESC => {
                    self.state = State::Escape;
                    None
                }
                SOF => {
                    let dropped = self.payload.len();
                    self.restart();
                    Some(Err(CoreconfError::Framing(format!(
                        "start marker inside frame, dropped {dropped} bytes"
                    ))))
                }
                EOF => {
                    self.state = if self.payload.len() % 2 == 0 {
                        State::SecondEof
                    } else {
                        State::Checksum
                    };
                    None
                }
                _ => self.push_payload(b),
            },
            State::Escape => match unescape(b) {
                Some(raw) => {
                    self.state = State::Data;
                    self.push_payload(raw)
                }
                None => self.fail(format!("invalid escape sequence 0x{b:02x}")),
            },
            State::SecondEof => match b {
                EOF => {
                    self.state = State::Checksum;
                    None
                }
                SOF => {
                    self.restart();
                    Some(Err(CoreconfError::Framing(
                        "missing doubled end marker".into(),
                    )))
                }
                _ => self.fail("missing doubled end marker".into()),
            },
            State::Checksum => {
                if b == SOF {
                    self.restart();
                    return Some(Err(CoreconfError::Framing("truncated checksum".into())));
                }
                if !b.is_ascii_hexdigit() {
                    return self.fail(format!("invalid checksum digit 0x{b:02x}"));
                }
                self.digits.push(b);
                if self.digits.len() < 4 {
                    return None;
                }
                Some(self.finish())
            }
        }
    }

    fn push_payload(&mut self, b: u8) -> Option<Result<Frame>> {
        if self.payload.len() >= MAX_PAYLOAD {
            return self.fail(format!("payload exceeds {MAX_PAYLOAD} bytes"));
        }
        self.payload.push(b);
        None
    }

    fn finish(&mut self) -> Result<Frame> {
        self.state = State::Idle;
        let digits = std::mem::take(&mut self.digits);
        let payload = std::mem::take(&mut self.payload);

        // Digits were validated as ASCII hex on the way in.
        let text = String::from_utf8_lossy(&digits);
        let received = u16::from_str_radix(&text, 16)
            .map_err(|e| CoreconfError::Framing(format!("bad checksum '{text}': {e}")))?;
        let expected = checksum(&unescaped_frame(self.frame_type, &payload));
        if received != expected {
            return Err(CoreconfError::Framing(format!(
                "checksum mismatch: received {received:04x}, computed {expected:04x}"
            )));
        }
        Ok(Frame {
            frame_type: FrameType::from_u8(self.frame_type),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame_type: FrameType, payload: &[u8]) {
        let frame = Frame::new(frame_type, payload);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_roundtrip_odd_and_even() {
        roundtrip(FrameType::Coap, b"abc");
        roundtrip(FrameType::Coap, b"abcd");
        roundtrip(FrameType::Announce, b"");
        roundtrip(FrameType::Trace, b"x");
    }

    #[test]
    fn test_roundtrip_special_bytes() {
        roundtrip(FrameType::Coap, &[SOF, EOF, ESC, 0x00, 0xFF, 0x41]);
        let all: Vec<u8> = (0..=255).collect();
        roundtrip(FrameType::Coap, &all);
    }

    #[test]
    fn test_end_marker_doubling() {
        let odd = Frame::new(FrameType::Ping, b"a".to_vec()).encode();
        assert_eq!(&odd[..4], b">Pa<");
        assert_ne!(odd[4], EOF);

        let even = Frame::new(FrameType::Ping, b"ab".to_vec()).encode();
        assert_eq!(&even[..6], b">Pab<<");
        assert_eq!(even.len(), 10);
    }

    #[test]
    fn test_markers_never_unescaped_in_data() {
        let encoded = Frame::new(FrameType::Coap, vec![SOF, SOF, EOF]).encode();
        let body = &encoded[2..encoded.len() - 5];
        assert_eq!(hex::encode(body), "5c3e5c3e5c3c");
    }

    #[test]
    fn test_checksum_known_value() {
        // ">Pab<<" = 0x3e50 + 0x6162 + 0x3c3c = 0xdbee -> !0xdbee = 0x2411
        assert_eq!(checksum(b">Pab<<"), 0x2411);
        let encoded = Frame::new(FrameType::Ping, b"ab".to_vec()).encode();
        assert_eq!(&encoded[6..], b"2411");
    }

    #[test]
    fn test_any_corrupted_byte_is_rejected() {
        let frame = Frame::new(FrameType::Coap, b"\x40\x01\x12\x34hello".to_vec());
        let encoded = frame.encode();
        for i in 0..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0x01;
            let result = Frame::decode(&corrupted);
            assert!(
                result.is_err(),
                "corruption at byte {i} produced {:?}",
                result
            );
        }
    }

    #[test]
    fn test_resync_after_noise() {
        let frame = Frame::new(FrameType::Coap, b"payload".to_vec());
        let mut stream = b"garbage\x00\x01<<".to_vec();
        stream.extend(frame.encode());

        let mut decoder = FrameDecoder::new();
        let results = decoder.push(&stream);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &frame);
        assert_eq!(decoder.skipped(), 11);
    }

    #[test]
    fn test_split_across_reads() {
        let a = Frame::new(FrameType::Coap, b"first".to_vec());
        let b = Frame::new(FrameType::Trace, b"second!".to_vec());
        let mut stream = a.encode();
        stream.extend(b.encode());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            for result in decoder.push(chunk) {
                frames.push(result.unwrap());
            }
        }
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn test_bad_frame_then_good_frame() {
        let good = Frame::new(FrameType::Coap, b"ok".to_vec());
        let mut bad = Frame::new(FrameType::Coap, b"broken".to_vec()).encode();
        let last = bad.len() - 1;
        bad[last] = if bad[last] == b'0' { b'1' } else { b'0' };

        let mut stream = bad;
        stream.extend(good.encode());

        let results = FrameDecoder::new().push(&stream);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn test_start_marker_inside_frame_restarts() {
        let good = Frame::new(FrameType::Coap, b"xyz".to_vec());
        let mut stream = b">Cpartial".to_vec();
        stream.extend(good.encode());

        let results = FrameDecoder::new().push(&stream);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn test_uppercase_checksum_accepted() {
        let encoded = Frame::new(FrameType::Coap, b"\xfe\xfd\xfc".to_vec()).encode();
        let upper: Vec<u8> = encoded
            .iter()
            .enumerate()
            .map(|(i, b)| if i >= encoded.len() - 4 { b.to_ascii_uppercase() } else { *b })
            .collect();
        assert!(Frame::decode(&upper).is_ok());
    }
}
