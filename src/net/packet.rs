//! Per-opcode payload reading and writing.
//!
//! Payload integers are big-endian on the wire; strings carry a one-byte
//! length prefix. Field order and width per opcode are fixed protocol
//! surface and must not change.

#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Some(value)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let hi = self.data[self.pos] as u16;
        let lo = self.data[self.pos + 1] as u16;
        self.pos += 2;
        Some((hi << 8) | lo)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Some((hi << 16) | lo)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let start = self.pos;
        self.pos += len;
        Some(&self.data[start..start + len])
    }

    pub fn read_string(&mut self) -> Option<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).to_string())
    }

    /// Reads a string but keeps at most `max_len` bytes of it, skipping the
    /// rest so the reader stays aligned with the declared length.
    pub fn read_string_limited(&mut self, max_len: usize) -> Option<String> {
        let len = self.read_u8()? as usize;
        if max_len > 0 && len > max_len {
            let kept = self.read_bytes(max_len)?.to_vec();
            self.skip(len - max_len)?;
            return Some(String::from_utf8_lossy(&kept).to_string());
        }
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).to_string())
    }

    pub fn skip(&mut self, len: usize) -> Option<()> {
        if self.remaining() < len {
            return None;
        }
        self.pos += len;
        Some(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    data: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        self.data.push(len as u8);
        self.data.extend_from_slice(&bytes[..len]);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip_is_big_endian() {
        let mut writer = PacketWriter::new();
        writer.write_u16(0x1234);
        writer.write_u32(0xdead_beef);
        let bytes = writer.into_vec();
        assert_eq!(bytes[..2], [0x12, 0x34]);

        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_u16(), Some(0x1234));
        assert_eq!(reader.read_u32(), Some(0xdead_beef));
        assert_eq!(reader.read_u8(), None);
    }

    #[test]
    fn string_roundtrip() {
        let mut writer = PacketWriter::new();
        writer.write_string("Ealagad");
        let bytes = writer.into_vec();
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_string().as_deref(), Some("Ealagad"));
    }

    #[test]
    fn read_string_limited_skips_excess() {
        let mut writer = PacketWriter::new();
        writer.write_string("abcdefgh");
        writer.write_u8(0x7f);
        let bytes = writer.into_vec();
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_string_limited(4).as_deref(), Some("abcd"));
        assert_eq!(reader.read_u8(), Some(0x7f));
    }

    #[test]
    fn short_reads_return_none() {
        let mut reader = PacketReader::new(&[0x01]);
        assert_eq!(reader.read_u16(), None);
        assert_eq!(reader.read_u8(), Some(0x01));
        assert_eq!(reader.read_string(), None);
    }
}
