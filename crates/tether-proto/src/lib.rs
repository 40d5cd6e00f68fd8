//! Transparent cross-process object remoting.
//!
//! A program on one machine obtains references to objects living in
//! another process and invokes their methods as if they were local;
//! results and failures flow back.  The peer can call back the other
//! way: each connection carries a *reverse channel* over which the
//! acceptor invokes delegates and callback objects owned by the
//! initiator.
//!
//! # Overview
//!
//! * Interfaces are declared with [`remote_interface!`]; servant types
//!   opt in with [`remotable!`]; plain data types opt in with
//!   [`pass_by_value!`].
//! * A [`RemotingServer`] listens and exposes services (registered in a
//!   [`ServiceMap`]) and constructible types.
//! * A [`RemotingClient`] connects and obtains its first references via
//!   [`get_service`](RemotingClient::get_service) or
//!   [`create_instance`](RemotingClient::create_instance); everything
//!   else flows from calling methods on those.
//! * Objects passed by reference are tracked in an [`InstanceMap`]:
//!   originals are held hard until the peer reports (via the
//!   distributed-GC sweep) that it has dropped its proxies; proxies are
//!   held weak, so user code dropping them is what reclaims them.
//!
//! # Example
//!
//! ```ignore
//! remote_interface! {
//!     pub trait Greeter {
//!         fn hello(&self, name: String) -> Result<String>;
//!     }
//! }
//!
//! struct GreeterImpl;
//! impl Greeter for GreeterImpl {
//!     fn hello(&self, name: String) -> tether_proto::Result<String> {
//!         Ok(format!("hello, {name}"))
//!     }
//! }
//! remotable! { GreeterImpl: Greeter }
//!
//! // Server side:
//! let services = ServiceMap::new();
//! services.register_service(<dyn Greeter>::NAME, std::sync::Arc::new(GreeterImpl));
//! let server = RemotingServer::bind("0.0.0.0:4711", ConnectionConfig::new(), services)?;
//! server.start()?;
//!
//! // Client side:
//! let client = RemotingClient::connect("server:4711", ConnectionConfig::new())?;
//! let greeter = client.get_service::<dyn Greeter>()?;
//! assert_eq!(greeter.hello("world".into())?, "hello, world");
//! ```

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

mod arg;
mod client;
mod config;
mod delegate;
mod dispatch;
mod err;
mod handshake;
mod iface;
mod instances;
mod invoker;
mod marshal;
mod object;
mod payload;
mod server;
mod services;
mod util;

pub use arg::{ArgValue, FromArg, ToArg, TypeName};
pub use client::RemotingClient;
pub use config::ConnectionConfig;
pub use delegate::{Delegate, DelegateValue, Event, RemoteBinding};
pub use err::{Error, RemoteFault, Result};
pub use iface::{DispatchTable, IfaceEntry, InvokeCtx, method_token, table};
pub use instances::InstanceMap;
pub use invoker::{CallBuilder, ProxyHandle, ReplyValues};
pub use marshal::{Marshaller, UnmarshalCtx};
pub use object::{Remotable, RemoteIface, bind_cast};
pub use payload::Ref;
pub use server::RemotingServer;
pub use services::{Factory, ServiceMap};
pub use util::ShutdownSignal;

// The protocol-level names generated stubs refer to.
pub use tether_frame::{InstanceIdent, MsgKind, ObjectId, WireArg};

// Re-exported for the generated code; not part of the public API.
#[doc(hidden)]
pub use {inventory, paste};
