//! Per-socket receive state: accumulates partial reads into complete
//! packets. The state machine is `AwaitingHeader -> AwaitingBody ->
//! (packet) -> AwaitingHeader`; any protocol error is terminal.

use crate::net::codec::{self, Packet, FRAME_HEADER_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitingHeader,
    AwaitingBody { body_len: usize },
    Closed,
}

#[derive(Debug)]
pub struct Reassembler {
    state: ReceiveState,
    buffer: Vec<u8>,
    max_body: usize,
}

impl Reassembler {
    pub fn new(max_body: usize) -> Self {
        Self {
            state: ReceiveState::AwaitingHeader,
            buffer: Vec::with_capacity(FRAME_HEADER_BYTES + max_body),
            max_body,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Feeds freshly received bytes and drains every packet completed by
    /// them. Chunk boundaries are arbitrary; the same byte stream yields
    /// the same packets however it is split. A protocol error closes the
    /// reassembler permanently.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Packet>, String> {
        if self.state == ReceiveState::Closed {
            return Err("receive state is closed".to_string());
        }
        self.buffer.extend_from_slice(bytes);

        let mut packets = Vec::new();
        loop {
            match self.state {
                ReceiveState::AwaitingHeader => {
                    match codec::parse_header(&self.buffer, self.max_body) {
                        Ok(Some(body_len)) => {
                            self.buffer.drain(..FRAME_HEADER_BYTES);
                            self.state = ReceiveState::AwaitingBody { body_len };
                        }
                        Ok(None) => break,
                        Err(err) => {
                            self.state = ReceiveState::Closed;
                            return Err(err);
                        }
                    }
                }
                ReceiveState::AwaitingBody { body_len } => {
                    if self.buffer.len() < body_len {
                        break;
                    }
                    let body: Vec<u8> = self.buffer.drain(..body_len).collect();
                    match codec::parse_body(&body) {
                        Ok(packet) => {
                            packets.push(packet);
                            self.state = ReceiveState::AwaitingHeader;
                        }
                        Err(err) => {
                            self.state = ReceiveState::Closed;
                            return Err(err);
                        }
                    }
                }
                ReceiveState::Closed => break,
            }
        }
        Ok(packets)
    }

    pub fn close(&mut self) {
        self.state = ReceiveState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{serialize_frame, NullCipher};

    fn frames() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(serialize_frame(0x06, &[0x01], &NullCipher).expect("frame"));
        stream.extend(serialize_frame(0x38, &[], &NullCipher).expect("frame"));
        stream.extend(serialize_frame(0x45, &[0xaa, 0xbb, 0xcc], &NullCipher).expect("frame"));
        stream
    }

    #[test]
    fn whole_stream_yields_all_packets() {
        let mut reassembler = Reassembler::new(1024);
        let packets = reassembler.feed(&frames()).expect("packets");
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].opcode, 0x06);
        assert_eq!(packets[1].opcode, 0x38);
        assert_eq!(packets[2].payload, vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(reassembler.state(), ReceiveState::AwaitingHeader);
    }

    #[test]
    fn byte_at_a_time_matches_whole_stream() {
        let stream = frames();
        let mut whole = Reassembler::new(1024);
        let expected = whole.feed(&stream).expect("packets");

        let mut chunked = Reassembler::new(1024);
        let mut got = Vec::new();
        for byte in &stream {
            got.extend(chunked.feed(std::slice::from_ref(byte)).expect("packets"));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn uneven_chunks_match_whole_stream() {
        let stream = frames();
        let mut whole = Reassembler::new(1024);
        let expected = whole.feed(&stream).expect("packets");

        for chunk_len in [2usize, 3, 5, 7] {
            let mut chunked = Reassembler::new(1024);
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_len) {
                got.extend(chunked.feed(chunk).expect("packets"));
            }
            assert_eq!(got, expected, "chunk_len={}", chunk_len);
        }
    }

    #[test]
    fn bad_marker_closes_permanently() {
        let mut reassembler = Reassembler::new(1024);
        assert!(reassembler.feed(&[0x55, 0x00, 0x01]).is_err());
        assert_eq!(reassembler.state(), ReceiveState::Closed);
        assert!(reassembler.feed(&[0x00]).is_err());
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut reassembler = Reassembler::new(16);
        let result = reassembler.feed(&[super::codec::FRAME_MARKER, 0x00, 0x20]);
        assert!(result.is_err());
        assert_eq!(reassembler.state(), ReceiveState::Closed);
    }

    #[test]
    fn header_split_across_feeds() {
        let stream = serialize_frame(0x06, &[0x09], &NullCipher).expect("frame");
        let mut reassembler = Reassembler::new(1024);
        assert!(reassembler.feed(&stream[..1]).expect("packets").is_empty());
        assert!(reassembler.feed(&stream[1..2]).expect("packets").is_empty());
        let packets = reassembler.feed(&stream[2..]).expect("packets");
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].opcode, 0x06);
    }
}
