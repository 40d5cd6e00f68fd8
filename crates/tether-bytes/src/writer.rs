//! Internal: Declare the Writer trait for tether-bytes

use crate::{EncodeError, EncodeResult};

/// A byte-oriented trait for writing remoting wire data.
///
/// Most code will want to use the fact that `Vec<u8>` implements this
/// trait: frames are assembled in memory and flushed to the stream in a
/// single call, so that a frame is never interleaved with another.
/// To define a new implementation, just define the `write_all` method.
///
/// All multi-byte integers are encoded in little-endian order.
///
/// # Examples
///
/// ```
/// use tether_bytes::Writer;
/// let mut w: Vec<u8> = Vec::new(); // Vec<u8> implements Writer.
/// w.write_u8(0x22);
/// w.write_i32(0x12345);
/// assert_eq!(w, &[0x22, 0x45, 0x23, 0x01, 0x00]);
/// ```
pub trait Writer {
    /// Append a slice to the end of this writer.
    fn write_all(&mut self, b: &[u8]);

    /// Append a single u8 to this writer.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x]);
    }
    /// Append a single u16 to this writer, encoded in little-endian order.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_le_bytes());
    }
    /// Append a single i32 to this writer, encoded in little-endian order.
    fn write_i32(&mut self, x: i32) {
        self.write_all(&x.to_le_bytes());
    }
    /// Append a single u32 to this writer, encoded in little-endian order.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_le_bytes());
    }
    /// Append a single i64 to this writer, encoded in little-endian order.
    fn write_i64(&mut self, x: i64) {
        self.write_all(&x.to_le_bytes());
    }
    /// Append a single u64 to this writer, encoded in little-endian order.
    fn write_u64(&mut self, x: u64) {
        self.write_all(&x.to_le_bytes());
    }
    /// Write n bytes to this writer, all with the value zero.
    fn write_zeros(&mut self, n: usize) {
        let v = vec![0_u8; n];
        self.write_all(&v[..]);
    }

    /// Append a string, encoded as an `i32` byte length followed by the
    /// string's UTF-16LE code units.
    ///
    /// Returns [`EncodeError::BadLengthValue`] if the encoded form does not
    /// fit in an `i32` length field.
    fn write_str(&mut self, s: &str) -> EncodeResult<()> {
        let n_units = s.encode_utf16().count();
        let byte_len: i32 = n_units
            .checked_mul(2)
            .and_then(|n| i32::try_from(n).ok())
            .ok_or(EncodeError::BadLengthValue)?;
        self.write_i32(byte_len);
        for unit in s.encode_utf16() {
            self.write_all(&unit.to_le_bytes());
        }
        Ok(())
    }

    /// Append an opaque byte blob, encoded as an `i32` length followed by
    /// the bytes themselves.
    fn write_blob(&mut self, b: &[u8]) -> EncodeResult<()> {
        let len: i32 = i32::try_from(b.len()).map_err(|_| EncodeError::BadLengthValue)?;
        self.write_i32(len);
        self.write_all(b);
        Ok(())
    }

    /// Encode an [`Encodable`] object onto this writer, using its
    /// `encode_onto` method.
    fn write<E: Encodable + ?Sized>(&mut self, e: &E) -> EncodeResult<()> {
        e.encode_onto(self)
    }
}

/// Trait for an object that can be encoded onto a [`Writer`].
pub trait Encodable {
    /// Encode this object into the provided writer.
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()>;

    /// Encode this object into a fresh byte vector.
    fn to_vec(&self) -> EncodeResult<Vec<u8>> {
        let mut v = Vec::new();
        self.encode_onto(&mut v)?;
        Ok(v)
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, b: &[u8]) {
        self.extend_from_slice(b);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn write_ints() {
        let mut v: Vec<u8> = Vec::new();
        v.write_u8(1);
        v.write_u16(2);
        v.write_i32(3);
        v.write_u32(4);
        v.write_i64(-1);
        assert_eq!(
            &v[..],
            &[
                1, 2, 0, 3, 0, 0, 0, 4, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff
            ]
        );
    }

    #[test]
    fn write_negative() {
        let mut v: Vec<u8> = Vec::new();
        v.write_i32(-2);
        assert_eq!(&v[..], &[0xfe, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn write_strings() {
        let mut v: Vec<u8> = Vec::new();
        v.write_str("Hi!").unwrap();
        assert_eq!(&v[..], &[6, 0, 0, 0, b'H', 0, b'i', 0, b'!', 0]);

        let mut v: Vec<u8> = Vec::new();
        v.write_str("").unwrap();
        assert_eq!(&v[..], &[0, 0, 0, 0]);

        // Non-BMP characters take two UTF-16 code units.
        let mut v: Vec<u8> = Vec::new();
        v.write_str("\u{1F980}").unwrap();
        assert_eq!(v.len(), 4 + 4);
        assert_eq!(&v[..4], &[4, 0, 0, 0]);
    }

    #[test]
    fn write_blobs() {
        let mut v: Vec<u8> = Vec::new();
        v.write_blob(&[9, 8, 7]).unwrap();
        assert_eq!(&v[..], &[3, 0, 0, 0, 9, 8, 7]);
    }

    #[test]
    fn writeable() {
        struct Sequence(u8);
        impl Encodable for Sequence {
            fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
                for i in 0..self.0 {
                    w.write_u8(i);
                }
                Ok(())
            }
        }

        let v = Sequence(6).to_vec().unwrap();
        assert_eq!(&v[..], &[0, 1, 2, 3, 4, 5]);
    }
}
