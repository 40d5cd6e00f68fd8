//! Internal: Declare error types for tether-bytes

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

/// Error type for decoding remoting objects from bytes.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The underlying stream failed, or reached end-of-file in the middle
    /// of an object.
    #[error("read error on remoting stream")]
    Io(#[source] Arc<std::io::Error>),
    /// A length field was negative, or too large to represent as usize.
    #[error("object length field out of range")]
    BadLengthValue,
    /// A string field did not contain well-formed UTF-16.
    #[error("malformed UTF-16 string field")]
    BadString,
    /// An attempt to parse an object failed for some reason related to its
    /// contents.
    #[error("bad object: {0}")]
    InvalidMessage(Cow<'static, str>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Return true if this error means the peer (probably) just closed the
    /// stream, rather than sending something malformed.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind as IK;
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                IK::UnexpectedEof | IK::ConnectionAborted | IK::ConnectionReset | IK::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Error type for encoding remoting objects to bytes.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum EncodeError {
    /// We tried to encode an object with an attached length, but the length
    /// was too large to encode in the available space.
    #[error("object length too large to encode")]
    BadLengthValue,
}
