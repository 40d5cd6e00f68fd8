//! The initiating endpoint.
//!
//! Connecting opens two sockets to the same peer: the primary, on which
//! this side sends requests, and the reverse, on which the peer sends
//! callbacks targeting objects owned here.  An embedded dispatcher
//! serves the reverse stream, so a server-side servant can invoke a
//! client-side callback while the client is itself blocked in a call.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tether_bytes::Encodable;
use tether_frame::{ChannelRole, GcCleanup, InstanceIdent, MsgKind, OpenReverseChannel};
use tracing::{debug, trace};

use crate::arg::FromArg;
use crate::config::ConnectionConfig;
use crate::dispatch::{ConnShared, Core, Dispatcher};
use crate::handshake;
use crate::instances::InstanceMap;
use crate::invoker::{CallBuilder, Invoker};
use crate::object::RemoteIface;
use crate::services::ServiceMap;
use crate::{Error, Result};

/// A connected remoting client.
pub struct RemotingClient {
    /// Shared endpoint state.
    core: Arc<Core>,
    /// The primary channel: this side's requests.
    invoker: Arc<Invoker>,
    /// Identity of the peer.
    peer: InstanceIdent,
    /// Set once this client has said goodbye.
    disconnected: AtomicBool,
}

impl RemotingClient {
    /// Connect to a listening peer and bring up both channels.
    pub fn connect(addr: impl ToSocketAddrs, config: ConnectionConfig) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Handshake("address resolved to nothing".into()))?;
        let core = Core::new(config, ServiceMap::new());
        let ident = core.instances.ident().clone();
        let connection_id = ident.fingerprint();

        let mut primary = TcpStream::connect(addr)?;
        let peer = handshake::initiate(&mut primary, ChannelRole::Primary, &ident, connection_id)?;
        let mut reverse = TcpStream::connect(addr)?;
        let _ = handshake::initiate(&mut reverse, ChannelRole::Reverse, &ident, connection_id)?;
        let local = primary.local_addr()?;
        debug!("connected to {peer} (as {ident})");

        let invoker = Invoker::launch(primary, Arc::clone(&core.instances))?;
        invoker.oneway(MsgKind::OPEN_REVERSE_CHANNEL, |buf| {
            OpenReverseChannel {
                initiator_addr: local.ip().to_string(),
                initiator_port: local.port(),
                initiator_instance: ident.to_string(),
                connection_id,
            }
            .encode_onto(buf)?;
            Ok(())
        })?;

        // The embedded dispatcher serves callbacks on the reverse
        // stream; proxies it decodes route their calls onto the primary.
        let shared = ConnShared::new(Arc::clone(&core), &reverse, peer.clone())?;
        let _ = shared.callback.set(Arc::clone(&invoker));
        Dispatcher::new(shared, None, false).spawn(reverse)?;

        if let Some(interval) = core.config.gc_interval {
            let instances = Arc::clone(&core.instances);
            let chan = Arc::clone(&invoker);
            let core_for_gc = Arc::clone(&core);
            thread::Builder::new()
                .name("tether-gc".into())
                .spawn(move || {
                    while !core_for_gc.shutdown.wait_timeout(interval) {
                        match sweep_and_report(&instances, &chan) {
                            Ok(n) if n > 0 => trace!("reported {n} reclaimed proxies"),
                            Ok(_) => {}
                            Err(e) => {
                                debug!("gc sweep stopped: {e}");
                                return;
                            }
                        }
                    }
                })?;
        }

        Ok(RemotingClient {
            core,
            invoker,
            peer,
            disconnected: AtomicBool::new(false),
        })
    }

    /// Ask the peer to construct an instance of `type_name`, and bind
    /// the returned reference as interface `T`.
    ///
    /// An empty argument list uses the default-constructor request.
    pub fn create_instance<T>(&self, type_name: &str, args: CallBuilder) -> Result<Arc<T>>
    where
        T: RemoteIface + ?Sized,
        Arc<T>: FromArg,
    {
        let kind = if args.is_empty() {
            MsgKind::CREATE_INSTANCE_DEFAULT
        } else {
            MsgKind::CREATE_INSTANCE
        };
        let mut reply = self.invoker.invoke_method(kind, "", type_name, 0, args)?;
        reply.take_return()
    }

    /// Ask the peer for its well-known service exposing interface `T`.
    pub fn get_service<T>(&self) -> Result<Arc<T>>
    where
        T: RemoteIface + ?Sized,
        Arc<T>: FromArg,
    {
        let mut reply = self.invoker.invoke_method(
            MsgKind::REQUEST_SERVICE_REFERENCE,
            "",
            T::NAME,
            0,
            CallBuilder::new(),
        )?;
        reply.take_return()
    }

    /// Sweep expired proxies and report them to the owner in a single
    /// cleanup frame.  Returns how many were reclaimed.
    pub fn sweep(&self) -> Result<usize> {
        sweep_and_report(&self.core.instances, &self.invoker)
    }

    /// Offer the peer the name of a code unit it may want to warm its
    /// type lookups with.  Purely a hint.
    pub fn offer_code_unit(&self, name: &str) -> Result<()> {
        self.invoker.oneway(MsgKind::LOAD_CLIENT_ASSEMBLY, |buf| {
            use tether_bytes::Writer;
            buf.write_str(name)?;
            Ok(())
        })
    }

    /// Ask the peer's process to terminate.
    pub fn shutdown_server(&self) -> Result<()> {
        self.invoker.oneway(MsgKind::SHUTDOWN_SERVER, |_| Ok(()))
    }

    /// Identity of the peer.
    pub fn peer(&self) -> &InstanceIdent {
        &self.peer
    }

    /// This endpoint's instance map (exposed for diagnostics and
    /// tests).
    pub fn instances(&self) -> &Arc<InstanceMap> {
        &self.core.instances
    }

    /// Say goodbye and close both channels.  Idempotent; also called on
    /// drop.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .invoker
            .oneway(MsgKind::CLIENT_DISCONNECTING, |_| Ok(()));
        self.invoker.close();
        self.core.shutdown.trigger();
    }
}

impl Drop for RemotingClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Shared sweep-and-report: collect the expired weak entries and tell
/// the owner in one frame.
fn sweep_and_report(instances: &Arc<InstanceMap>, chan: &Invoker) -> Result<usize> {
    let ids = instances.sweep();
    let n = ids.len();
    if n > 0 {
        chan.oneway(MsgKind::GC_CLEANUP, move |buf| {
            GcCleanup { ids }.encode_onto(buf)?;
            Ok(())
        })?;
    }
    Ok(n)
}
