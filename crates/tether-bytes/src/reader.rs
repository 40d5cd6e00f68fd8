//! Internal: Declare the StreamReader type for tether-bytes

use std::io::Read;

use crate::{Error, Result};

/// Largest length field we will honor for a counted string or blob.
///
/// Remoting frames are not length-prefixed end to end, so a corrupt
/// length field would otherwise let the peer make us allocate an
/// arbitrarily large buffer before we notice the stream is garbage.
const MAX_COUNTED_LEN: usize = 64 * 1024 * 1024;

/// A type for reading remoting wire data from a live byte stream.
///
/// Unlike a slice-based reader, this object pulls bytes from an
/// [`io::Read`](std::io::Read) on demand: remoting frames carry no
/// overall length prefix, so each field is consumed exactly as it is
/// decoded and the frame boundary is implicit in the frame's own
/// structure.
///
/// All multi-byte integers are decoded in little-endian order; strings
/// are an `i32` byte length followed by UTF-16LE code units.
///
/// # Examples
///
/// ```
/// use tether_bytes::StreamReader;
/// let msg = [0x22, 0x45, 0x23, 0x01, 0x00];
/// let mut r = StreamReader::new(&msg[..]);
/// assert_eq!(r.take_u8()?, 0x22);
/// assert_eq!(r.take_i32()?, 0x12345);
/// # tether_bytes::Result::Ok(())
/// ```
pub struct StreamReader<R> {
    /// The underlying stream that we're reading from.
    inner: R,
}

impl<R: Read> StreamReader<R> {
    /// Construct a new StreamReader wrapping an underlying stream.
    pub fn new(inner: R) -> Self {
        StreamReader { inner }
    }

    /// Consume this reader and return the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Try to consume exactly `buf.len()` bytes from the stream.
    pub fn take_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    /// Try to consume and return `n` bytes from the stream.
    pub fn take(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; n];
        self.take_into(&mut buf[..])?;
        Ok(buf)
    }

    /// Try to consume and return a u8 from the stream.
    pub fn take_u8(&mut self) -> Result<u8> {
        let mut b = [0_u8; 1];
        self.take_into(&mut b)?;
        Ok(b[0])
    }

    /// Try to consume and return a little-endian u16 from the stream.
    pub fn take_u16(&mut self) -> Result<u16> {
        let mut b = [0_u8; 2];
        self.take_into(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Try to consume and return a little-endian i32 from the stream.
    pub fn take_i32(&mut self) -> Result<i32> {
        let mut b = [0_u8; 4];
        self.take_into(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    /// Try to consume and return a little-endian u32 from the stream.
    pub fn take_u32(&mut self) -> Result<u32> {
        let mut b = [0_u8; 4];
        self.take_into(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Try to consume and return a little-endian i64 from the stream.
    pub fn take_i64(&mut self) -> Result<i64> {
        let mut b = [0_u8; 8];
        self.take_into(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    /// Try to consume and return a little-endian u64 from the stream.
    pub fn take_u64(&mut self) -> Result<u64> {
        let mut b = [0_u8; 8];
        self.take_into(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Consume an `i32` length field, validating it against `MAX_COUNTED_LEN`.
    fn take_len(&mut self) -> Result<usize> {
        let len = self.take_i32()?;
        let len = usize::try_from(len).map_err(|_| Error::BadLengthValue)?;
        if len > MAX_COUNTED_LEN {
            return Err(Error::BadLengthValue);
        }
        Ok(len)
    }

    /// Try to consume and return a counted UTF-16LE string.
    pub fn take_str(&mut self) -> Result<String> {
        let byte_len = self.take_len()?;
        if byte_len % 2 != 0 {
            return Err(Error::BadString);
        }
        let bytes = self.take(byte_len)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| Error::BadString)
    }

    /// Try to consume and return a counted opaque byte blob.
    pub fn take_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.take_len()?;
        self.take(len)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::Writer;

    #[test]
    fn take_ints() {
        let msg = [1, 2, 0, 3, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff];
        let mut r = StreamReader::new(&msg[..]);
        assert_eq!(r.take_u8().unwrap(), 1);
        assert_eq!(r.take_u16().unwrap(), 2);
        assert_eq!(r.take_u32().unwrap(), 3);
        assert_eq!(r.take_i32().unwrap(), -2);
    }

    #[test]
    fn string_round_trip() {
        let mut v: Vec<u8> = Vec::new();
        v.write_str("they're good dogs, Bront").unwrap();
        v.write_str("").unwrap();
        v.write_str("\u{1F980}").unwrap();
        let mut r = StreamReader::new(&v[..]);
        assert_eq!(r.take_str().unwrap(), "they're good dogs, Bront");
        assert_eq!(r.take_str().unwrap(), "");
        assert_eq!(r.take_str().unwrap(), "\u{1F980}");
    }

    #[test]
    fn blob_round_trip() {
        let mut v: Vec<u8> = Vec::new();
        v.write_blob(&[1, 2, 3, 4]).unwrap();
        let mut r = StreamReader::new(&v[..]);
        assert_eq!(r.take_blob().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn truncated() {
        let msg = [1, 2, 3];
        let mut r = StreamReader::new(&msg[..]);
        assert!(matches!(r.take_u32(), Err(Error::Io(_))));
    }

    #[test]
    fn bad_lengths() {
        // A negative string length is rejected before any allocation.
        let msg = [0xff, 0xff, 0xff, 0xff];
        let mut r = StreamReader::new(&msg[..]);
        assert!(matches!(r.take_str(), Err(Error::BadLengthValue)));

        // An odd byte count cannot hold UTF-16 code units.
        let msg = [3, 0, 0, 0, b'a', 0, b'b'];
        let mut r = StreamReader::new(&msg[..]);
        assert!(matches!(r.take_str(), Err(Error::BadString)));
    }

    #[test]
    fn disconnect_classification() {
        let msg: [u8; 0] = [];
        let mut r = StreamReader::new(&msg[..]);
        let err = r.take_u8().unwrap_err();
        assert!(err.is_disconnect());
        assert!(!Error::BadLengthValue.is_disconnect());
    }
}
