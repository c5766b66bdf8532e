//! Wire framing and the pluggable payload cipher.
//!
//! A frame is a three-byte header (marker byte `0xAA`, big-endian u16 body
//! length) followed by the body: one opcode byte and the payload. The
//! payload of most opcodes is obfuscated with parameters negotiated during
//! the handshake; the cipher step runs after reassembly and before
//! dispatch, and is symmetric.

use sha1::{Digest, Sha1};

pub const FRAME_MARKER: u8 = 0xaa;
pub const FRAME_HEADER_BYTES: usize = 3;
pub const SALT_BYTES: usize = 16;

/// Opcodes exchanged before cipher parameters exist travel in the clear.
const PLAINTEXT_OPCODES: &[u8] = &[super::handlers::OPCODE_VERSION];

/// A fully reassembled inbound unit: one command byte plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

pub fn is_plaintext_opcode(opcode: u8) -> bool {
    PLAINTEXT_OPCODES.contains(&opcode)
}

/// Parses the frame header once at least `FRAME_HEADER_BYTES` are buffered.
/// Returns `Ok(None)` while incomplete and the declared body length once
/// complete. A bad marker, a zero length, or a length above `max_body` is a
/// protocol error.
pub fn parse_header(buffer: &[u8], max_body: usize) -> Result<Option<usize>, String> {
    if buffer.len() < FRAME_HEADER_BYTES {
        return Ok(None);
    }
    if buffer[0] != FRAME_MARKER {
        return Err(format!("bad frame marker 0x{:02x}", buffer[0]));
    }
    let len = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
    if len == 0 {
        return Err("frame length is zero".to_string());
    }
    if len > max_body {
        return Err(format!("frame length {} exceeds max {}", len, max_body));
    }
    Ok(Some(len))
}

/// Splits a complete body (opcode byte + payload) into a packet.
pub fn parse_body(body: &[u8]) -> Result<Packet, String> {
    let Some((&opcode, payload)) = body.split_first() else {
        return Err("frame body is empty".to_string());
    };
    Ok(Packet {
        opcode,
        payload: payload.to_vec(),
    })
}

/// Serializes one outbound frame, running the payload through `cipher`
/// unless the opcode is a plaintext one.
pub fn serialize_frame(
    opcode: u8,
    payload: &[u8],
    cipher: &dyn PacketCipher,
) -> Result<Vec<u8>, String> {
    let mut payload = payload.to_vec();
    if !is_plaintext_opcode(opcode) {
        cipher.apply(opcode, &mut payload);
    }
    let body_len = payload
        .len()
        .checked_add(1)
        .and_then(|len| u16::try_from(len).ok())
        .ok_or_else(|| "frame body too large".to_string())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body_len as usize);
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.push(opcode);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Symmetric payload obfuscation. Applying `apply` twice with the same
/// parameters restores the original bytes.
pub trait PacketCipher: Send + Sync {
    fn apply(&self, opcode: u8, payload: &mut [u8]);
}

/// Pre-handshake cipher: leaves bytes untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl PacketCipher for NullCipher {
    fn apply(&self, _opcode: u8, _payload: &mut [u8]) {}
}

/// The connection-negotiated cipher: a seed byte and a salt table exchanged
/// during the handshake, XOR-folded over the payload. Stands in for the
/// proprietary algorithm, which is pluggable behind `PacketCipher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaltCipher {
    seed: u8,
    salt: [u8; SALT_BYTES],
}

impl SaltCipher {
    pub fn new(seed: u8, salt: [u8; SALT_BYTES]) -> Self {
        Self { seed, salt }
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    pub fn salt(&self) -> &[u8; SALT_BYTES] {
        &self.salt
    }
}

impl PacketCipher for SaltCipher {
    fn apply(&self, opcode: u8, payload: &mut [u8]) {
        for (idx, byte) in payload.iter_mut().enumerate() {
            let key = self.salt[idx % SALT_BYTES]
                ^ self.seed.wrapping_add(idx as u8)
                ^ opcode;
            *byte ^= key;
        }
    }
}

/// Derives per-connection handshake parameters. Uniqueness matters more
/// than unpredictability here; the real algorithm is a collaborator.
pub fn derive_handshake(session_id: u32, nonce: u64) -> SaltCipher {
    let mut hasher = Sha1::new();
    hasher.update(session_id.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    let digest = hasher.finalize();
    let mut salt = [0u8; SALT_BYTES];
    salt.copy_from_slice(&digest[..SALT_BYTES]);
    SaltCipher::new(digest[SALT_BYTES], salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header_incomplete_returns_none() {
        assert_eq!(parse_header(&[FRAME_MARKER, 0x00], 1024), Ok(None));
        assert_eq!(parse_header(&[], 1024), Ok(None));
    }

    #[test]
    fn parse_header_rejects_bad_marker() {
        assert!(parse_header(&[0x55, 0x00, 0x04], 1024).is_err());
    }

    #[test]
    fn parse_header_rejects_zero_and_oversize_lengths() {
        assert!(parse_header(&[FRAME_MARKER, 0x00, 0x00], 1024).is_err());
        assert!(parse_header(&[FRAME_MARKER, 0xff, 0xff], 1024).is_err());
    }

    #[test]
    fn parse_header_returns_declared_length() {
        assert_eq!(
            parse_header(&[FRAME_MARKER, 0x01, 0x02], 1024),
            Ok(Some(0x0102))
        );
    }

    #[test]
    fn parse_body_splits_opcode_and_payload() {
        let packet = parse_body(&[0x06, 0x01, 0x02]).expect("packet");
        assert_eq!(packet.opcode, 0x06);
        assert_eq!(packet.payload, vec![0x01, 0x02]);
        assert!(parse_body(&[]).is_err());
    }

    #[test]
    fn salt_cipher_is_symmetric() {
        let cipher = derive_handshake(7, 0x1122_3344_5566_7788);
        let original = b"the quick brown fox".to_vec();
        let mut payload = original.clone();
        cipher.apply(0x06, &mut payload);
        assert_ne!(payload, original);
        cipher.apply(0x06, &mut payload);
        assert_eq!(payload, original);
    }

    #[test]
    fn derive_handshake_differs_per_session() {
        let a = derive_handshake(1, 99);
        let b = derive_handshake(2, 99);
        assert_ne!(a, b);
    }

    #[test]
    fn serialize_frame_builds_header_and_encrypts() {
        let cipher = derive_handshake(3, 4);
        let frame = serialize_frame(0x06, &[0xaa, 0xbb], &cipher).expect("frame");
        assert_eq!(frame[0], FRAME_MARKER);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), 3);
        assert_eq!(frame[3], 0x06);
        let mut payload = frame[4..].to_vec();
        cipher.apply(0x06, &mut payload);
        assert_eq!(payload, vec![0xaa, 0xbb]);
    }

    #[test]
    fn serialize_frame_leaves_plaintext_opcodes_alone() {
        let cipher = derive_handshake(3, 4);
        let frame =
            serialize_frame(crate::net::handlers::OPCODE_VERSION, &[0x01, 0x02], &cipher)
                .expect("frame");
        assert_eq!(&frame[4..], &[0x01, 0x02]);
    }
}
