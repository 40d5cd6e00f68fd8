//! Frames and messages of the tether remoting protocol.
//!
//! A remoting connection is a pair of byte streams carrying frames: a
//! primary stream for requests from the initiator, and a reverse stream
//! for callbacks from the acceptor.  This crate defines the frame
//! alphabet ([`MsgKind`]), the tagged-argument alphabet ([`ArgTag`] and
//! [`WireArg`]), object identities ([`ObjectId`], [`InstanceIdent`]),
//! and the pre-frame authentication token ([`AuthToken`]).
//!
//! Nothing here touches live objects: resolving a [`WireArg`] into a
//! value (or a proxy) is the marshalling layer's job.

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

mod auth;
mod cmd;
mod err;
mod msg;
mod objid;

pub use auth::{AUTH_SUCCEEDED, AUTH_TOKEN_LEN, AuthToken, ChannelRole};
pub use cmd::{ArgTag, MsgKind};
pub use err::Error;
pub use msg::{GcCleanup, Header, OpenReverseChannel, RequestPrefix, WireArg};
pub use objid::{InstanceIdent, ObjectId, fnv1a};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
