//! Little-endian packing for dispatch wire payloads.
//!
//! Collective payloads are flat byte buffers; these helpers keep the
//! encode/decode sides symmetric. All multi-byte values are little-endian.

use conclave::{Error, Result};

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32_slice(buf: &mut Vec<u8>, values: &[f32]) {
    buf.reserve(values.len() * 4);
    for &v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn put_i8_slice(buf: &mut Vec<u8>, values: &[i8]) {
    // i8 -> u8 is a bit-level cast; the reader mirrors it
    buf.extend(values.iter().map(|&v| v as u8));
}

/// Sequential reader over a received payload.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(Error::WireFormat(format!(
                "truncated payload: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.bytes.len()
            )));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
        let b = self.take(n * 4)?;
        Ok(b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn i8_vec(&mut self, n: usize) -> Result<Vec<i8>> {
        let b = self.take(n)?;
        Ok(b.iter().map(|&v| v as i8).collect())
    }

    /// Assert the payload was fully consumed.
    pub fn finish(self) -> Result<()> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(Error::WireFormat(format!(
                "payload has {} trailing bytes",
                self.bytes.len() - self.pos
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_mixed_fields() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 7);
        put_f32(&mut buf, -1.5);
        put_f32_slice(&mut buf, &[0.25, 0.5]);
        put_i8_slice(&mut buf, &[-128, 0, 127]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.f32().unwrap(), -1.5);
        assert_eq!(r.f32_vec(2).unwrap(), vec![0.25, 0.5]);
        assert_eq!(r.i8_vec(3).unwrap(), vec![-128, 0, 127]);
        r.finish().unwrap();
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        let mut r = Reader::new(&buf);
        assert_eq!(r.u32().unwrap(), 1);
        assert!(r.u32().is_err());
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let buf = vec![0u8; 5];
        let mut r = Reader::new(&buf);
        let _ = r.u32().unwrap();
        assert!(r.finish().is_err());
    }
}
