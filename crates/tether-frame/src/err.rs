//! Internal: Declare an Error type for tether-frame.

use thiserror::Error;

/// An error that occurred while decoding a remoting frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A byte-level decoding problem.
    #[error("byte-level decoding error")]
    Bytes(#[from] tether_bytes::Error),
    /// A tagged argument carried a tag value we do not recognize.
    ///
    /// Unlike an unknown frame kind, this is unrecoverable for the whole
    /// stream: the argument's length cannot be known without its tag.
    #[error("unrecognized argument tag {0}")]
    UnknownArgTag(i32),
    /// A frame field violated the structure its kind promises.
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
}

impl Error {
    /// Return true if this error means the peer (probably) just closed
    /// the stream.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Bytes(e) => e.is_disconnect(),
            _ => false,
        }
    }
}
