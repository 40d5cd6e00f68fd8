//! Define the error types for the tether-proto crate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error type for the tether-proto crate.
///
/// Errors here fall into two families with very different fates: call
/// failures (bad arguments, missing objects, remote faults) are shipped
/// back to the caller of the invocation; framing and identity errors are
/// fatal to the connection, which is torn down, failing every pending
/// call with [`Error::ConnectionLost`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A byte-level problem while decoding from the stream.
    #[error("wire decoding error")]
    Bytes(#[from] tether_bytes::Error),
    /// A frame-level problem while decoding from the stream.
    #[error("frame decoding error")]
    Frame(#[from] tether_frame::Error),
    /// An I/O failure on one of the connection's streams.
    #[error("i/o error on remoting stream")]
    Io(#[source] Arc<std::io::Error>),
    /// The operation cannot be expressed by the remoting layer at all.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// An object or interface could not be found or bound.
    #[error("object management error: {0}")]
    ProxyManagement(String),
    /// The peer violated the protocol; the connection is torn down.
    #[error("protocol violation: {0}")]
    Proto(String),
    /// A value could not be serialized or deserialized.
    #[error("serialization failure: {0}")]
    Serialization(String),
    /// The stream failed or the peer went away; all pending calls fail
    /// with this error.
    #[error("connection lost")]
    ConnectionLost,
    /// The pre-frame handshake went wrong.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The peer's invocation failed; this is its fault record, re-thrown
    /// in the caller's context.
    #[error("remote call failed")]
    Remote(#[source] RemoteFault),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<tether_bytes::EncodeError> for Error {
    fn from(e: tether_bytes::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Return true if this error is fatal to the whole connection, as
    /// opposed to a failure of one invocation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bytes(_)
                | Error::Frame(_)
                | Error::Io(_)
                | Error::Proto(_)
                | Error::ConnectionLost
                | Error::Handshake(_)
        )
    }

    /// Return true if this error means the peer (probably) just closed
    /// the stream.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind as IK;
        match self {
            Error::Bytes(e) => e.is_disconnect(),
            Error::Frame(e) => e.is_disconnect(),
            Error::Io(e) => matches!(
                e.kind(),
                IK::UnexpectedEof | IK::ConnectionAborted | IK::ConnectionReset | IK::BrokenPipe
            ),
            Error::ConnectionLost => true,
            _ => false,
        }
    }

    /// A short, stable code for this error, used when shipping it to the
    /// peer inside an exception frame.
    fn code(&self) -> &'static str {
        match self {
            Error::Bytes(_) | Error::Frame(_) => "wire",
            Error::Io(_) => "io",
            Error::Unsupported(_) => "unsupported-operation",
            Error::ProxyManagement(_) => "proxy-management",
            Error::Proto(_) => "protocol",
            Error::Serialization(_) => "serialization",
            Error::ConnectionLost => "connection-lost",
            Error::Handshake(_) => "handshake",
            Error::Remote(f) => f.kind_str(),
        }
    }
}

/// The serializable record of a failed invocation, carried inside an
/// `EXCEPTION_RETURN` frame.
///
/// The receiving side wraps it in [`Error::Remote`] and hands it to the
/// blocked caller.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteFault {
    /// Stable code naming the failure family.
    kind: String,
    /// Human-readable description from the failing side.
    message: String,
}

impl RemoteFault {
    /// Capture `err` as a fault record to ship to the peer.
    pub fn capture(err: &Error) -> Self {
        RemoteFault {
            kind: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Construct a fault record directly from an application message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteFault {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The failure-family code.
    pub fn kind_str(&self) -> &'static str {
        // Faults round-trip through serialization, so the kind is an
        // owned string; map the well-known ones back to static names.
        match self.kind.as_str() {
            "unsupported-operation" => "unsupported-operation",
            "proxy-management" => "proxy-management",
            "serialization" => "serialization",
            _ => "remote",
        }
    }

    /// Return true if this fault was a serialization failure on the
    /// remote side.
    pub fn is_serialization(&self) -> bool {
        self.kind == "serialization"
    }
}

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn fatality() {
        assert!(Error::Proto("desync".into()).is_fatal());
        assert!(Error::ConnectionLost.is_fatal());
        assert!(!Error::Serialization("nan".into()).is_fatal());
        assert!(!Error::Unsupported("static delegate".into()).is_fatal());
    }

    #[test]
    fn fault_round_trip() {
        let err = Error::Serialization("payload refused".into());
        let fault = RemoteFault::capture(&err);
        let bytes = serde_json::to_vec(&fault).unwrap();
        let back: RemoteFault = serde_json::from_slice(&bytes).unwrap();
        assert!(back.is_serialization());
        let surfaced = Error::Remote(back);
        assert!(!surfaced.is_fatal());
    }
}
