//! Sans-IO transport framings.
//!
//! A [`Framing`] turns payloads into wire frames and back. It never touches a
//! socket: the caller appends received bytes to a buffer and calls
//! [`Framing::unpack`] until it stops asking for more.
//!
//! | Framing                          | Init bytes    | Frame layout                         |
//! |----------------------------------|---------------|--------------------------------------|
//! | [`Abridged`]                     | `ef`          | `len/4` (1 or 4 bytes) + payload     |
//! | [`Intermediate`]                 | `eeeeeeee`    | `len:u32` + payload                  |
//! | [`PaddedIntermediate`]           | `dddddddd`    | `len:u32` + payload + 0..15 random   |
//! | [`Full`]                         | none          | `len:u32 seq:u32` payload `crc32`    |
//!
//! A payload of exactly four bytes holding a negative integer is a transport
//! status from the server (for example `-404` for an unknown auth key) and is
//! reported as [`FrameError::Status`].
//!
//! See <https://core.telegram.org/mtproto/mtproto-transports>.

use std::fmt;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Why [`Framing::unpack`] could not return a payload.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    /// At least `needed` bytes must be buffered before retrying.
    Incomplete { needed: usize },
    /// The length header is implausible.
    BadLength { len: i64 },
    /// The CRC-32 of a Full frame did not match.
    BadCrc { expected: u32, got: u32 },
    /// A Full frame arrived out of sequence.
    BadSeq { expected: u32, got: u32 },
    /// Transport-level status code sent by the server in place of a frame.
    Status { code: i32, consumed: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete { needed } => write!(f, "need {needed} more bytes"),
            Self::BadLength { len } => write!(f, "bad frame length {len}"),
            Self::BadCrc { expected, got } => write!(f, "crc mismatch: expected {expected:#010x}, got {got:#010x}"),
            Self::BadSeq { expected, got } => write!(f, "frame seq {got}, expected {expected}"),
            Self::Status { code, .. } => write!(f, "transport status {code}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A complete payload and the number of input bytes it used.
#[derive(Clone, Debug, PartialEq)]
pub struct Unpacked {
    /// Bytes to drop from the front of the input buffer.
    pub consumed: usize,
    /// The frame's payload.
    pub payload: Vec<u8>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// One MTProto transport framing.
pub trait Framing: Send + Sync {
    /// Bytes sent once, before the first frame, on a plain connection.
    fn init_bytes(&self) -> &'static [u8];

    /// The tag embedded in an Obfuscated2 header, if this framing can be obfuscated.
    fn obfuscation_tag(&self) -> Option<[u8; 4]>;

    /// Append a framed `payload` to `out`.
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>);

    /// Try to take one frame off the front of `input`.
    fn unpack(&mut self, input: &[u8]) -> Result<Unpacked, FrameError>;
}

fn need(input: &[u8], len: usize) -> Result<(), FrameError> {
    if input.len() < len {
        Err(FrameError::Incomplete { needed: len - input.len() })
    } else {
        Ok(())
    }
}

fn read_u32(input: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([input[at], input[at + 1], input[at + 2], input[at + 3]])
}

fn finish(payload: &[u8], consumed: usize) -> Result<Unpacked, FrameError> {
    if payload.len() == 4 {
        let code = read_u32(payload, 0) as i32;
        if code < 0 {
            return Err(FrameError::Status { code, consumed });
        }
    }
    Ok(Unpacked { consumed, payload: payload.to_vec() })
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME_LEN {
        Err(FrameError::BadLength { len: len as i64 })
    } else {
        Ok(())
    }
}

// ─── Abridged ────────────────────────────────────────────────────────────────

/// The smallest framing: a one-byte word count for frames under 508 bytes.
#[derive(Debug, Default)]
pub struct Abridged;

impl Framing for Abridged {
    fn init_bytes(&self) -> &'static [u8] { &[0xef] }

    fn obfuscation_tag(&self) -> Option<[u8; 4]> { Some([0xef; 4]) }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let words = payload.len() / 4;
        if words < 0x7f {
            out.push(words as u8);
        } else {
            out.extend([0x7f, (words & 0xff) as u8, ((words >> 8) & 0xff) as u8, ((words >> 16) & 0xff) as u8]);
        }
        out.extend_from_slice(payload);
    }

    fn unpack(&mut self, input: &[u8]) -> Result<Unpacked, FrameError> {
        need(input, 1)?;
        // high bit flags a quick-ack; not requested by this client
        let first = input[0] & 0x7f;
        let (words, header) = if first < 0x7f {
            (first as usize, 1)
        } else {
            need(input, 4)?;
            (input[1] as usize | (input[2] as usize) << 8 | (input[3] as usize) << 16, 4)
        };
        let len = words * 4;
        check_len(len)?;
        need(input, header + len)?;
        finish(&input[header..header + len], header + len)
    }
}

// ─── Intermediate ────────────────────────────────────────────────────────────

/// Four-byte little-endian length prefix.
#[derive(Debug, Default)]
pub struct Intermediate;

fn unpack_intermediate(input: &[u8]) -> Result<(usize, usize), FrameError> {
    need(input, 4)?;
    let raw = read_u32(input, 0) as i32;
    if raw < 0 {
        return Err(FrameError::Status { code: raw, consumed: 4 });
    }
    let len = raw as usize;
    check_len(len)?;
    need(input, 4 + len)?;
    Ok((4, 4 + len))
}

impl Framing for Intermediate {
    fn init_bytes(&self) -> &'static [u8] { &[0xee; 4] }

    fn obfuscation_tag(&self) -> Option<[u8; 4]> { Some([0xee; 4]) }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn unpack(&mut self, input: &[u8]) -> Result<Unpacked, FrameError> {
        let (start, end) = unpack_intermediate(input)?;
        finish(&input[start..end], end)
    }
}

/// Intermediate with 0..15 random trailing bytes per frame.
#[derive(Debug, Default)]
pub struct PaddedIntermediate;

impl Framing for PaddedIntermediate {
    fn init_bytes(&self) -> &'static [u8] { &[0xdd; 4] }

    fn obfuscation_tag(&self) -> Option<[u8; 4]> { Some([0xdd; 4]) }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let mut pad = [0u8; 16];
        let pad_len = match getrandom::getrandom(&mut pad) {
            Ok(()) => (pad[0] & 0x0f) as usize,
            Err(_) => 0,
        };
        out.extend(((payload.len() + pad_len) as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(&pad[..pad_len]);
    }

    fn unpack(&mut self, input: &[u8]) -> Result<Unpacked, FrameError> {
        let (start, end) = unpack_intermediate(input)?;
        let mut payload = &input[start..end];
        // encrypted payloads are 24 + 16k bytes; anything past that is padding
        if payload.len() >= 24 && payload[..8] != [0u8; 8] {
            let excess = (payload.len() - 24) % 16;
            payload = &payload[..payload.len() - excess];
        }
        finish(payload, end)
    }
}

// ─── Full ────────────────────────────────────────────────────────────────────

/// Length, sequence number and CRC-32 around every payload.
#[derive(Debug, Default)]
pub struct Full {
    send_seq: u32,
    recv_seq: u32,
}

impl Framing for Full {
    fn init_bytes(&self) -> &'static [u8] { &[] }

    fn obfuscation_tag(&self) -> Option<[u8; 4]> { None }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        out.extend(((payload.len() + 12) as u32).to_le_bytes());
        out.extend(self.send_seq.to_le_bytes());
        out.extend_from_slice(payload);
        let crc = crc32_ieee(&out[start..]);
        out.extend(crc.to_le_bytes());
        self.send_seq = self.send_seq.wrapping_add(1);
    }

    fn unpack(&mut self, input: &[u8]) -> Result<Unpacked, FrameError> {
        need(input, 4)?;
        let raw = read_u32(input, 0) as i32;
        if raw < 0 {
            return Err(FrameError::Status { code: raw, consumed: 4 });
        }
        let len = raw as usize;
        if len < 12 {
            return Err(FrameError::BadLength { len: len as i64 });
        }
        check_len(len)?;
        need(input, len)?;

        let got = read_u32(input, len - 4);
        let expected = crc32_ieee(&input[..len - 4]);
        if got != expected {
            return Err(FrameError::BadCrc { expected, got });
        }

        let seq = read_u32(input, 4);
        if seq != self.recv_seq {
            return Err(FrameError::BadSeq { expected: self.recv_seq, got: seq });
        }
        self.recv_seq = self.recv_seq.wrapping_add(1);
        finish(&input[8..len - 4], len)
    }
}

/// CRC-32 with the IEEE 802.3 polynomial.
fn crc32_ieee(data: &[u8]) -> u32 {
    const POLY: u32 = 0xedb88320;
    let mut crc: u32 = 0xffffffff;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        assert_eq!(crc32_ieee(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn abridged_short_and_long_headers() {
        let mut out = Vec::new();
        Abridged.pack(&[1, 2, 3, 4], &mut out);
        assert_eq!(out, [1, 1, 2, 3, 4]);

        let big = vec![0u8; 0x7f * 4];
        let mut out = Vec::new();
        Abridged.pack(&big, &mut out);
        assert_eq!(&out[..4], &[0x7f, 0x7f, 0, 0]);

        let got = Abridged.unpack(&out).unwrap();
        assert_eq!(got.consumed, out.len());
        assert_eq!(got.payload.len(), big.len());
    }

    #[test]
    fn abridged_asks_for_missing_bytes() {
        assert_eq!(Abridged.unpack(&[2, 0, 0]), Err(FrameError::Incomplete { needed: 6 }));
        assert_eq!(Abridged.unpack(&[0x7f, 1]), Err(FrameError::Incomplete { needed: 2 }));
    }

    #[test]
    fn abridged_status_code() {
        let mut wire = vec![1u8];
        wire.extend((-404i32).to_le_bytes());
        assert_eq!(Abridged.unpack(&wire), Err(FrameError::Status { code: -404, consumed: 5 }));
    }

    #[test]
    fn intermediate_negative_length_is_status() {
        let wire = (-429i32).to_le_bytes();
        assert_eq!(Intermediate.unpack(&wire), Err(FrameError::Status { code: -429, consumed: 4 }));
    }

    #[test]
    fn intermediate_rejects_huge_length() {
        let wire = ((MAX_FRAME_LEN + 4) as u32).to_le_bytes();
        assert!(matches!(Intermediate.unpack(&wire), Err(FrameError::BadLength { .. })));
    }

    #[test]
    fn padded_strips_padding_from_encrypted_payload() {
        let mut payload = vec![0xAAu8; 8];
        payload.extend([0u8; 16 + 32]);
        let mut framing = PaddedIntermediate;
        let mut out = Vec::new();
        framing.pack(&payload, &mut out);
        let got = framing.unpack(&out).unwrap();
        assert_eq!(got.payload, payload);
        assert_eq!(got.consumed, out.len());
    }

    #[test]
    fn full_checks_crc_and_sequence() {
        let mut tx = Full::default();
        let mut wire = Vec::new();
        tx.pack(b"abcd", &mut wire);
        tx.pack(b"efgh", &mut wire);

        let mut rx = Full::default();
        let first = rx.unpack(&wire).unwrap();
        assert_eq!(first.payload, b"abcd");
        let second = rx.unpack(&wire[first.consumed..]).unwrap();
        assert_eq!(second.payload, b"efgh");

        let mut corrupt = wire.clone();
        corrupt[9] ^= 0xff;
        assert!(matches!(Full::default().unpack(&corrupt), Err(FrameError::BadCrc { .. })));

        // replaying the second frame to a fresh reader breaks the sequence
        assert_eq!(
            Full::default().unpack(&wire[first.consumed..]),
            Err(FrameError::BadSeq { expected: 0, got: 1 })
        );
    }
}
