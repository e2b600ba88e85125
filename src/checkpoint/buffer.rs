//! Growable byte buffer used for checkpoint data.
//!
//! Writes append at the end, reads consume from a cursor that can be
//! repositioned with [`ByteBuffer::seek`]. Scalars are fixed-width
//! little-endian except for [`ByteBuffer::write_vu64`], which uses a compact
//! variable-length encoding for the incremental checkpoint index.

use bincode::config;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::CheckpointError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already serialized buffer for reading.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes of the content written so far.
    pub fn content_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Number of bytes between the read cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Move the read cursor to an absolute offset.
    pub fn seek(&mut self, offset: u64) -> Result<(), CheckpointError> {
        if offset > self.data.len() as u64 {
            return Err(CheckpointError::BadSeek {
                offset,
                size: self.data.len() as u64,
            });
        }
        self.cursor = offset as usize;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CheckpointError> {
        if self.remaining() < n {
            return Err(CheckpointError::BufferUnderflow {
                requested: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn read_u8(&mut self) -> Result<u8, CheckpointError> {
        Ok(self.take(1)?[0])
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn read_bool(&mut self) -> Result<bool, CheckpointError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&mut self) -> Result<u32, CheckpointError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64(&mut self) -> Result<u64, CheckpointError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn read_i64(&mut self) -> Result<i64, CheckpointError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn write_f64(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn read_f64(&mut self) -> Result<f64, CheckpointError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Append a 64-bit value in variable-length form.
    ///
    /// The encoding is a tag byte holding a 2-bit length selector
    /// (0, 1, 2, 3 for payloads of 1, 2, 4, 8 bytes) followed by the value in
    /// little-endian order, truncated to the smallest of those widths that
    /// still represents it.
    pub fn write_vu64(&mut self, value: u64) {
        if value <= u8::MAX as u64 {
            self.write_u8(0);
            self.write_u8(value as u8);
        } else if value <= u16::MAX as u64 {
            self.write_u8(1);
            self.data.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= u32::MAX as u64 {
            self.write_u8(2);
            self.write_u32(value as u32);
        } else {
            self.write_u8(3);
            self.write_u64(value);
        }
    }

    pub fn read_vu64(&mut self) -> Result<u64, CheckpointError> {
        let selector = self.read_u8()?;
        match selector {
            0 => Ok(self.read_u8()? as u64),
            1 => Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as u64),
            2 => Ok(self.read_u32()? as u64),
            3 => self.read_u64(),
            other => Err(CheckpointError::InvalidIndexKind(other)),
        }
    }

    /// Append raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append a length-prefixed blob.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_vu64(bytes.len() as u64);
        self.data.extend_from_slice(bytes);
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, CheckpointError> {
        let len = self.read_vu64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Serialize a serde value as a length-prefixed blob.
    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<(), CheckpointError> {
        let encoded = bincode::serde::encode_to_vec(value, config::standard())?;
        self.write_blob(&encoded);
        Ok(())
    }

    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T, CheckpointError> {
        let blob = self.read_blob()?;
        let (value, _) = bincode::serde::decode_from_slice(&blob, config::standard())?;
        Ok(value)
    }

    /// Write a short marker used to catch misaligned restores early.
    pub fn write_marker(&mut self, marker: &str) {
        self.write_blob(marker.as_bytes());
    }

    pub fn verify_marker(&mut self, marker: &str) -> Result<(), CheckpointError> {
        let found = self.read_blob()?;
        if found != marker.as_bytes() {
            return Err(CheckpointError::MarkerMismatch {
                expected: marker.to_string(),
                found: String::from_utf8_lossy(&found).into_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.write_u8(7);
        buf.write_u32(1 << 20);
        buf.write_u64(u64::MAX - 1);
        buf.write_i64(-42);
        buf.write_f64(2.5);
        buf.write_bool(true);

        assert_eq!(buf.read_u8().unwrap(), 7);
        assert_eq!(buf.read_u32().unwrap(), 1 << 20);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(buf.read_i64().unwrap(), -42);
        assert_eq!(buf.read_f64().unwrap(), 2.5);
        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn vu64_minimal_widths() {
        // (value, expected payload width)
        let cases = [
            (0u64, 1usize),
            (1, 1),
            (u8::MAX as u64, 1),
            (u8::MAX as u64 + 1, 2),
            (u16::MAX as u64, 2),
            (u16::MAX as u64 + 1, 4),
            (u32::MAX as u64, 4),
            (u32::MAX as u64 + 1, 8),
            (u64::MAX, 8),
        ];
        for (value, width) in cases {
            let mut buf = ByteBuffer::new();
            buf.write_vu64(value);
            assert_eq!(buf.content_size(), 1 + width as u64, "value {value}");
            assert_eq!(buf.read_vu64().unwrap(), value);
        }
    }

    #[test]
    fn vu64_random_round_trip() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(0xbeef);
        let mut buf = ByteBuffer::new();
        let values: Vec<u64> = (0..1000)
            .map(|_| {
                let bits = rng.random_range(0..64);
                rng.random::<u64>() >> bits
            })
            .collect();
        for &v in &values {
            buf.write_vu64(v);
        }
        for &v in &values {
            assert_eq!(buf.read_vu64().unwrap(), v);
        }
    }

    #[test]
    fn underflow_is_typed() {
        let mut buf = ByteBuffer::new();
        buf.write_u8(1);
        buf.read_u8().unwrap();
        assert!(matches!(
            buf.read_u32(),
            Err(CheckpointError::BufferUnderflow { .. })
        ));
    }

    #[test]
    fn marker_mismatch() {
        let mut buf = ByteBuffer::new();
        buf.write_marker("window");
        assert!(matches!(
            buf.verify_marker("partitions"),
            Err(CheckpointError::MarkerMismatch { .. })
        ));
    }

    #[test]
    fn serde_values() {
        let mut buf = ByteBuffer::new();
        buf.write_value(&vec![(1u32, "a".to_string()), (2, "b".to_string())])
            .unwrap();
        let back: Vec<(u32, String)> = buf.read_value().unwrap();
        assert_eq!(back, vec![(1, "a".to_string()), (2, "b".to_string())]);
    }

    #[test]
    fn seek_and_reread() {
        let mut buf = ByteBuffer::new();
        buf.write_u64(11);
        buf.write_u64(22);
        buf.seek(8).unwrap();
        assert_eq!(buf.read_u64().unwrap(), 22);
        buf.seek(0).unwrap();
        assert_eq!(buf.read_u64().unwrap(), 11);
        assert!(buf.seek(1000).is_err());
    }
}
