//! Utilities to encode and decode the byte-oriented wire data used by
//! the tether remoting protocol.
//!
//! # Overview
//!
//! The remoting wire format is a stream of frames on a long-lived TCP
//! connection. Frames are not length-prefixed end to end: a frame's
//! extent is implicit in its header and the typed fields that follow.
//! This crate therefore provides two halves:
//!
//! * [`Writer`] — a trait for assembling a frame into an in-memory
//!   buffer (usually a `Vec<u8>`), so the finished frame can be flushed
//!   to the stream in one write.
//! * [`StreamReader`] — a blocking reader that decodes fields directly
//!   from the live stream.
//!
//! All integers are little-endian.  Strings are an `i32` byte length
//! followed by UTF-16LE code units; blobs are an `i32` length followed
//! by raw bytes.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]

mod err;
mod reader;
mod writer;

pub use err::{EncodeError, Error};
pub use reader::StreamReader;
pub use writer::{Encodable, Writer};

/// Result type returned by this crate's decoding operations.
pub type Result<T> = std::result::Result<T, Error>;
/// Result type returned by this crate's encoding operations.
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;
