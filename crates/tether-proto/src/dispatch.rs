//! The inbound half of a connection: requests in, replies out.
//!
//! One dispatcher owns one stream's read direction.  Control frames are
//! handled inline on the reader; invocations are decoded completely
//! (the tagged arguments are self-describing) and then run on a
//! detached worker thread, so a servant that calls back into the peer
//! over the reverse channel cannot deadlock the reader.  Failures of an
//! invocation are captured and shipped back as exception frames;
//! protocol violations tear the connection down.

use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use gethostname::gethostname;
use tether_bytes::{Encodable, StreamReader};
use tether_frame::{
    GcCleanup, Header, InstanceIdent, MsgKind, ObjectId, OpenReverseChannel, RequestPrefix,
    WireArg,
};
use tracing::{debug, trace, warn};

use crate::arg::ArgValue;
use crate::config::ConnectionConfig;
use crate::delegate::DelegateRegistry;
use crate::iface::{InvokeCtx, table};
use crate::instances::InstanceMap;
use crate::invoker::Invoker;
use crate::marshal::{Marshaller, UnmarshalCtx};
use crate::server::PendingReverse;
use crate::services::ServiceMap;
use crate::util::ShutdownSignal;
use crate::{Error, RemoteFault, Result};

/// State one endpoint (server or client) shares across its connections.
pub(crate) struct Core {
    /// The endpoint's instance map.
    pub(crate) instances: Arc<InstanceMap>,
    /// Well-known services and constructors.
    pub(crate) services: ServiceMap,
    /// Endpoint configuration.
    pub(crate) config: ConnectionConfig,
    /// Process-wide termination signal.
    pub(crate) shutdown: ShutdownSignal,
}

impl Core {
    /// Build the shared state, deriving the instance identity from the
    /// hostname and the process id (or the configured tag).
    pub(crate) fn new(config: ConnectionConfig, services: ServiceMap) -> Arc<Core> {
        let host = gethostname().to_string_lossy().into_owned();
        let tag = config
            .instance_tag
            .clone()
            .unwrap_or_else(|| std::process::id().to_string());
        let ident = InstanceIdent::new(&host, &tag);
        Arc::new(Core {
            instances: Arc::new(InstanceMap::new(ident)),
            services,
            config,
            shutdown: ShutdownSignal::new(),
        })
    }
}

/// Per-connection state shared between the reader and its workers.
pub(crate) struct ConnShared {
    /// Endpoint state.
    pub(crate) core: Arc<Core>,
    /// Channel for calls *toward* the peer: proxies decoded on this
    /// connection bind to it.  On a server connection it appears when
    /// the reverse channel is matched; on a client's embedded reverse
    /// dispatcher it is the primary channel, set at construction.
    pub(crate) callback: OnceLock<Arc<Invoker>>,
    /// Delegate registration ledger for this connection.
    pub(crate) registry: Arc<DelegateRegistry>,
    /// Write half of this dispatcher's stream, for replies.
    writer: Mutex<TcpStream>,
    /// Identity of the peer, for logs.
    peer: InstanceIdent,
}

impl ConnShared {
    /// Build the shared state over a connected stream.
    pub(crate) fn new(core: Arc<Core>, stream: &TcpStream, peer: InstanceIdent) -> Result<Arc<Self>> {
        Ok(Arc::new(ConnShared {
            core,
            callback: OnceLock::new(),
            registry: Arc::new(DelegateRegistry::new()),
            writer: Mutex::new(stream.try_clone()?),
            peer,
        }))
    }

    /// Write one whole frame under the writer lock.
    pub(crate) fn write_frame(&self, frame: &[u8]) -> Result<()> {
        use std::io::Write;
        let mut w = self.writer.lock().expect("writer poisoned");
        w.write_all(frame)?;
        w.flush()?;
        Ok(())
    }

    /// Abandon the connection: further reads on the peer's side fail.
    pub(crate) fn tear_down(&self) {
        let w = self.writer.lock().expect("writer poisoned");
        let _ = w.shutdown(Shutdown::Both);
    }
}

/// The read loop for one connection direction.
pub(crate) struct Dispatcher {
    /// Shared connection state.
    shared: Arc<ConnShared>,
    /// Pre-accepted reverse sockets, present only on a listening
    /// server's primary connections.
    pending_reverse: Option<Arc<PendingReverse>>,
    /// Shut the whole endpoint down if this connection dies.
    exit_on_disconnect: bool,
}

impl Dispatcher {
    /// Build a dispatcher over shared connection state.
    pub(crate) fn new(
        shared: Arc<ConnShared>,
        pending_reverse: Option<Arc<PendingReverse>>,
        exit_on_disconnect: bool,
    ) -> Self {
        Dispatcher {
            shared,
            pending_reverse,
            exit_on_disconnect,
        }
    }

    /// Spawn the read loop on its own thread.
    pub(crate) fn spawn(self, stream: TcpStream) -> Result<()> {
        thread::Builder::new()
            .name("tether-dispatch".into())
            .spawn(move || self.run(stream))?;
        Ok(())
    }

    /// Read frames until the stream dies or the peer misbehaves.
    fn run(self, stream: TcpStream) {
        let peer = self.shared.peer.clone();
        let mut r = StreamReader::new(stream);
        loop {
            match self.read_one(&mut r) {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    debug!("connection from {peer} closed");
                    break;
                }
                Err(e) => {
                    warn!("connection from {peer} failed: {e}");
                    break;
                }
            }
        }
        if let Some(cb) = self.shared.callback.get() {
            cb.close();
        }
        self.shared.tear_down();
        if self.exit_on_disconnect {
            debug!("primary channel lost; shutting down");
            self.shared.core.shutdown.trigger();
        }
    }

    /// Read and handle one frame.
    fn read_one(&self, r: &mut StreamReader<TcpStream>) -> Result<()> {
        let hdr = Header::decode_from(r)?;
        match hdr.kind {
            MsgKind::OPEN_REVERSE_CHANNEL => self.open_reverse_channel(r),
            MsgKind::CLIENT_DISCONNECTING => {
                debug!("{} is disconnecting", self.shared.peer);
                if let Some(cb) = self.shared.callback.get() {
                    cb.close();
                }
                Ok(())
            }
            MsgKind::GC_CLEANUP => {
                let body = GcCleanup::decode_from(r)?;
                trace!("peer released {} object(s)", body.ids.len());
                for id in &body.ids {
                    self.shared.core.instances.remove(id);
                }
                Ok(())
            }
            MsgKind::LOAD_CLIENT_ASSEMBLY => {
                // A lookup-warming hint; with a statically linked servant
                // set there is nothing to load.
                let name = r.take_str()?;
                debug!("peer offered code unit {name:?}");
                Ok(())
            }
            MsgKind::SHUTDOWN_SERVER => {
                debug!("shutdown requested by {}", self.shared.peer);
                self.shared.core.shutdown.trigger();
                Ok(())
            }
            MsgKind::METHOD_CALL
            | MsgKind::CREATE_INSTANCE
            | MsgKind::CREATE_INSTANCE_DEFAULT
            | MsgKind::REQUEST_SERVICE_REFERENCE => {
                let prefix = RequestPrefix::decode_from(r)?;
                let mut args = Vec::with_capacity(prefix.n_args.min(64) as usize);
                for _ in 0..prefix.n_args {
                    args.push(WireArg::decode_from(r)?);
                }
                let shared = Arc::clone(&self.shared);
                thread::Builder::new()
                    .name("tether-worker".into())
                    .spawn(move || serve_request(shared, hdr, prefix, args))?;
                Ok(())
            }
            other => Err(Error::Proto(format!(
                "unexpected frame {other} on the request direction"
            ))),
        }
    }

    /// Pair this connection with its pre-accepted reverse socket and
    /// start the callback channel on it.
    fn open_reverse_channel(&self, r: &mut StreamReader<TcpStream>) -> Result<()> {
        let body = OpenReverseChannel::decode_from(r)?;
        let pending = self
            .pending_reverse
            .as_ref()
            .ok_or_else(|| Error::Proto("unexpected open-reverse-channel frame".into()))?;
        let deadline = self.shared.core.config.reverse_wait;
        let sock = pending.take_matching(body.connection_id, deadline)?;
        let inv = Invoker::launch(sock, Arc::clone(&self.shared.core.instances))?;
        if self.shared.callback.set(inv).is_err() {
            return Err(Error::Proto("reverse channel opened twice".into()));
        }
        debug!(
            "reverse channel to {} ({}:{}) is up",
            body.initiator_instance, body.initiator_addr, body.initiator_port
        );
        Ok(())
    }
}

/// Worker-thread entry: run one invocation and send its reply.
fn serve_request(shared: Arc<ConnShared>, hdr: Header, prefix: RequestPrefix, args: Vec<WireArg>) {
    let outcome = run_invocation(&shared, hdr.kind, &prefix, args);
    let frame = match outcome {
        Ok(values) => match encode_reply(hdr.seq, &values) {
            Ok(frame) => frame,
            // The reply itself would not serialize; discard what was
            // assembled and ship the failure instead.
            Err(e) => encode_exception(hdr.seq, &e),
        },
        Err(e) => {
            if e.is_fatal() {
                warn!("fatal error in invocation from {}: {e}", shared.peer);
                shared.tear_down();
                return;
            }
            trace!("invocation {} failed: {e}", hdr.seq);
            encode_exception(hdr.seq, &e)
        }
    };
    if frame.is_empty() {
        warn!("could not encode any reply for sequence {}", hdr.seq);
        return;
    }
    if let Err(e) = shared.write_frame(&frame) {
        debug!("could not write reply for sequence {}: {e}", hdr.seq);
    }
}

/// Resolve the target, invoke it, and collect the reply values.
fn run_invocation(
    shared: &Arc<ConnShared>,
    kind: MsgKind,
    prefix: &RequestPrefix,
    args: Vec<WireArg>,
) -> Result<Vec<WireArg>> {
    let core = &shared.core;
    let um = UnmarshalCtx {
        instances: Arc::clone(&core.instances),
        chan: shared.callback.get().cloned(),
        registry: Some(Arc::clone(&shared.registry)),
        calling_method: "",
    };
    let mut ctx = InvokeCtx::new(args, um, Marshaller::new(Arc::clone(&core.instances)));

    match kind {
        MsgKind::METHOD_CALL => {
            let id = ObjectId::from(prefix.instance_id.as_str());
            let target = core.instances.try_get(&id).ok_or_else(|| {
                Error::ProxyManagement(format!("no instance {id} to invoke on"))
            })?;
            let entry = table().lookup(&prefix.declaring_type).ok_or_else(|| {
                Error::ProxyManagement(format!(
                    "unknown interface {:?}",
                    prefix.declaring_type
                ))
            })?;
            (entry.invoke)(target, prefix.method, &mut ctx)?;
        }
        MsgKind::CREATE_INSTANCE | MsgKind::CREATE_INSTANCE_DEFAULT => {
            let obj = core.services.construct(&prefix.declaring_type, &mut ctx)?;
            ctx.finish_ret_arg(ArgValue::Object(obj))?;
        }
        MsgKind::REQUEST_SERVICE_REFERENCE => {
            let obj = core.services.get(&prefix.declaring_type)?;
            ctx.finish_ret_arg(ArgValue::Object(obj))?;
        }
        other => {
            return Err(Error::Proto(format!("frame {other} is not an invocation")));
        }
    }
    Ok(ctx.into_reply())
}

/// Frame a successful reply: header, tagged return, tagged by-refs.
fn encode_reply(seq: u32, values: &[WireArg]) -> Result<Vec<u8>> {
    let mut frame: Vec<u8> = Vec::new();
    Header::new(MsgKind::METHOD_REPLY, seq).encode_onto(&mut frame)?;
    for v in values {
        v.encode_onto(&mut frame)?;
    }
    Ok(frame)
}

/// Frame a failure as an exception reply.  Returns an empty buffer in
/// the (theoretical) case where even the fault cannot be encoded.
fn encode_exception(seq: u32, err: &Error) -> Vec<u8> {
    let fault = RemoteFault::capture(err);
    let bytes = serde_json::to_vec(&fault).unwrap_or_default();
    let mut frame: Vec<u8> = Vec::new();
    let ok = Header::new(MsgKind::EXCEPTION_RETURN, seq)
        .encode_onto(&mut frame)
        .and_then(|()| WireArg::Serialized(bytes).encode_onto(&mut frame));
    if ok.is_err() {
        return Vec::new();
    }
    frame
}
