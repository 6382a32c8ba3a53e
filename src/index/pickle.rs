//! Length-prefixed pickle used by the index file.
//!
//! Layout: an 8-byte prefix of `[payload_len: u32][crc: u32]` followed by
//! the payload, a sequence of little-endian 4- and 8-byte fields. The CRC
//! covers the payload region only and is stored after the trailer has been
//! appended. Bytes past `payload_len` are ignored on read.

use std::convert::TryInto;

pub const PICKLE_PREFIX_LEN: usize = 8;

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub struct Pickle {
    buf: Vec<u8>,
}

impl Pickle {
    pub fn new() -> Pickle {
        Pickle {
            buf: vec![0u8; PICKLE_PREFIX_LEN],
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[PICKLE_PREFIX_LEN..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    /// Finalize the prefix: store the payload length and the CRC of the
    /// payload. Must be the last step before writing out.
    pub fn store_crc(&mut self) {
        let payload_len = (self.buf.len() - PICKLE_PREFIX_LEN) as u32;
        let crc = crc32(&self.buf[PICKLE_PREFIX_LEN..]);
        self.buf[0..4].copy_from_slice(&payload_len.to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for Pickle {
    fn default() -> Self {
        Pickle::new()
    }
}

pub struct PickleReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PickleReader<'a> {
    /// Validate the prefix and return the stored CRC plus a reader over the
    /// payload. `None` if the buffer is too short for its own length field.
    pub fn new(data: &'a [u8]) -> Option<(u32, PickleReader<'a>)> {
        if data.len() < PICKLE_PREFIX_LEN {
            return None;
        }
        let payload_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let stored_crc = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if data.len() - PICKLE_PREFIX_LEN < payload_len {
            return None;
        }
        let payload = &data[PICKLE_PREFIX_LEN..PICKLE_PREFIX_LEN + payload_len];
        Some((stored_crc, PickleReader { payload, pos: 0 }))
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.payload.len() - self.pos < n {
            return None;
        }
        let out = &self.payload[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_bytes(4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_bytes(8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_bytes(8)
            .map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut pickle = Pickle::new();
        pickle.write_u64(0x1122_3344_5566_7788);
        pickle.write_u32(42);
        pickle.write_i64(-7);
        pickle.store_crc();

        let (crc, mut reader) = PickleReader::new(pickle.as_bytes()).unwrap();
        assert_eq!(crc, crc32(reader.payload()));
        assert_eq!(reader.read_u64(), Some(0x1122_3344_5566_7788));
        assert_eq!(reader.read_u32(), Some(42));
        assert_eq!(reader.read_i64(), Some(-7));
        assert_eq!(reader.read_u32(), None);
    }

    #[test]
    fn rejects_truncated_buffers() {
        assert!(PickleReader::new(&[]).is_none());
        assert!(PickleReader::new(&[0u8; 7]).is_none());

        let mut pickle = Pickle::new();
        pickle.write_u64(1);
        pickle.store_crc();
        let bytes = pickle.into_bytes();
        // Chop the payload but leave the prefix intact: length check fails.
        assert!(PickleReader::new(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn ignores_trailing_bytes() {
        let mut pickle = Pickle::new();
        pickle.write_u32(7);
        pickle.store_crc();
        let mut bytes = pickle.into_bytes();
        bytes.extend_from_slice(b"garbage");
        let (_, mut reader) = PickleReader::new(&bytes).unwrap();
        assert_eq!(reader.read_u32(), Some(7));
        assert_eq!(reader.read_u32(), None);
    }
}
