//! The fixed-size authentication token exchanged before any frames.
//!
//! Each new TCP connection begins with a 100-byte token.  Byte 0 is the
//! channel role; bytes 1..5 are a little-endian fingerprint of the
//! initiator's instance identifier, used by the acceptor to pair a
//! reverse socket with its primary connection.  The remaining bytes are
//! reserved and must be zero.  Real authentication is out of scope; the
//! token exists so that both sides agree on roles before framing starts.

use std::io::Read;

use tether_bytes::{Encodable, EncodeResult, StreamReader, Writer};

use crate::{Error, Result};

/// Size in bytes of the authentication token.
pub const AUTH_TOKEN_LEN: usize = 100;

/// Value acknowledging a successful pre-handshake, written as an `i32`
/// ahead of the acceptor's instance identifier.
pub const AUTH_SUCCEEDED: i32 = 0x0057_4f4b;

/// Which role a freshly opened socket will play.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelRole {
    /// Requests flow from the initiator to the acceptor.
    Primary,
    /// Callback requests flow from the acceptor back to the initiator.
    Reverse,
}

impl ChannelRole {
    /// The wire byte for this role.
    fn as_byte(self) -> u8 {
        match self {
            ChannelRole::Primary => 0,
            ChannelRole::Reverse => 1,
        }
    }

    /// Parse a wire byte into a role.
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ChannelRole::Primary),
            1 => Ok(ChannelRole::Reverse),
            _ => Err(Error::BadFrame("unrecognized channel role")),
        }
    }
}

/// The decoded contents of an authentication token.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AuthToken {
    /// Role the new socket will play.
    pub role: ChannelRole,
    /// Fingerprint of the initiator's instance identifier.
    pub connection_id: u32,
}

impl AuthToken {
    /// Construct a token.
    pub fn new(role: ChannelRole, connection_id: u32) -> Self {
        AuthToken {
            role,
            connection_id,
        }
    }

    /// Decode a token from the stream, consuming all 100 bytes.
    pub fn decode_from<R: Read>(r: &mut StreamReader<R>) -> Result<Self> {
        let mut buf = [0_u8; AUTH_TOKEN_LEN];
        r.take_into(&mut buf).map_err(Error::Bytes)?;
        let role = ChannelRole::from_byte(buf[0])?;
        let connection_id = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(AuthToken {
            role,
            connection_id,
        })
    }
}

impl Encodable for AuthToken {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.role.as_byte());
        w.write_u32(self.connection_id);
        w.write_zeros(AUTH_TOKEN_LEN - 5);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn round_trip() {
        let t = AuthToken::new(ChannelRole::Reverse, 0xfeed_f00d);
        let bytes = t.to_vec().unwrap();
        assert_eq!(bytes.len(), AUTH_TOKEN_LEN);
        assert_eq!(bytes[0], 1);
        let mut r = StreamReader::new(&bytes[..]);
        assert_eq!(AuthToken::decode_from(&mut r).unwrap(), t);
    }

    #[test]
    fn bad_role() {
        let mut bytes = vec![9_u8];
        bytes.extend_from_slice(&[0; AUTH_TOKEN_LEN - 1]);
        let mut r = StreamReader::new(&bytes[..]);
        assert!(AuthToken::decode_from(&mut r).is_err());
    }
}
