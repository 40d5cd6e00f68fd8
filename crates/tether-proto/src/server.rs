//! The listening endpoint.
//!
//! A server accepts two kinds of socket, told apart by the handshake
//! token's role byte: primary sockets get a dispatcher immediately;
//! reverse sockets are parked, keyed by their connection identifier,
//! until the matching primary connection claims one with an
//! open-reverse-channel frame.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tether_bytes::Encodable;
use tether_frame::{ChannelRole, Header, InstanceIdent, MsgKind};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::dispatch::{ConnShared, Core, Dispatcher};
use crate::handshake;
use crate::instances::InstanceMap;
use crate::services::ServiceMap;
use crate::{Error, Result};

/// How often the reverse-socket wait and the accept loop poll.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Reverse sockets accepted but not yet claimed by their primary
/// connection.
#[derive(Default)]
pub(crate) struct PendingReverse {
    /// Parked sockets by connection identifier.
    map: Mutex<HashMap<u32, TcpStream>>,
}

impl PendingReverse {
    /// Park a freshly accepted reverse socket.
    fn put(&self, connection_id: u32, stream: TcpStream) {
        let mut map = self.map.lock().expect("reverse map poisoned");
        if map.insert(connection_id, stream).is_some() {
            warn!("replacing parked reverse socket for {connection_id:#x}");
        }
    }

    /// Claim the reverse socket for `connection_id`, waiting for it to
    /// arrive for at most `deadline`.
    pub(crate) fn take_matching(
        &self,
        connection_id: u32,
        deadline: Duration,
    ) -> Result<TcpStream> {
        let started = Instant::now();
        loop {
            if let Some(s) = self
                .map
                .lock()
                .expect("reverse map poisoned")
                .remove(&connection_id)
            {
                return Ok(s);
            }
            if started.elapsed() > deadline {
                return Err(Error::Handshake(format!(
                    "no reverse socket arrived for connection {connection_id:#x}"
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// A listening remoting endpoint.
pub struct RemotingServer {
    /// Shared endpoint state.
    core: Arc<Core>,
    /// The listening socket, in non-blocking mode so the accept loop
    /// can observe shutdown.
    listener: TcpListener,
    /// Parked reverse sockets.
    pending_reverse: Arc<PendingReverse>,
    /// Live connections, for the shutting-down broadcast.
    conns: Arc<Mutex<Vec<Weak<ConnShared>>>>,
}

impl RemotingServer {
    /// Bind a listener and prepare the endpoint.  Call
    /// [`start`](Self::start) to begin accepting.
    pub fn bind(
        addr: impl ToSocketAddrs,
        config: ConnectionConfig,
        services: ServiceMap,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(RemotingServer {
            core: Core::new(config, services),
            listener,
            pending_reverse: Arc::new(PendingReverse::default()),
            conns: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// This endpoint's instance identity.
    pub fn ident(&self) -> &InstanceIdent {
        self.core.instances.ident()
    }

    /// This endpoint's instance map (exposed for diagnostics and
    /// tests).
    pub fn instances(&self) -> &Arc<InstanceMap> {
        &self.core.instances
    }

    /// Start the accept loop on a background thread.
    pub fn start(&self) -> Result<()> {
        let listener = self.listener.try_clone()?;
        let core = Arc::clone(&self.core);
        let pending = Arc::clone(&self.pending_reverse);
        let conns = Arc::clone(&self.conns);
        thread::Builder::new()
            .name("tether-accept".into())
            .spawn(move || accept_loop(listener, core, pending, conns))?;
        Ok(())
    }

    /// Block until the endpoint is asked to shut down.
    pub fn wait(&self) {
        self.core.shutdown.wait();
    }

    /// Return true once shutdown has been requested (locally or by a
    /// shutdown frame from a peer).
    pub fn is_shut_down(&self) -> bool {
        self.core.shutdown.is_triggered()
    }

    /// Shut the endpoint down: tell every live connection, stop
    /// accepting, and wake every waiter.
    pub fn shutdown(&self) {
        let mut announce: Vec<u8> = Vec::new();
        if Header::new(MsgKind::SERVER_SHUTTING_DOWN, 0)
            .encode_onto(&mut announce)
            .is_ok()
        {
            let conns = self.conns.lock().expect("connection list poisoned");
            for conn in conns.iter().filter_map(Weak::upgrade) {
                if let Err(e) = conn.write_frame(&announce) {
                    debug!("could not announce shutdown: {e}");
                }
                conn.tear_down();
            }
        }
        self.core.shutdown.trigger();
    }
}

/// Accept sockets until shutdown, sorting them by role.
fn accept_loop(
    listener: TcpListener,
    core: Arc<Core>,
    pending: Arc<PendingReverse>,
    conns: Arc<Mutex<Vec<Weak<ConnShared>>>>,
) {
    loop {
        if core.shutdown.is_triggered() {
            return;
        }
        match listener.accept() {
            Ok((stream, from)) => {
                let core = Arc::clone(&core);
                let pending = Arc::clone(&pending);
                let conns = Arc::clone(&conns);
                // Handshakes run off the accept thread, so one stalled
                // peer cannot block new connections.
                let spawned = thread::Builder::new()
                    .name("tether-handshake".into())
                    .spawn(move || {
                        if let Err(e) = admit(stream, core, pending, conns) {
                            warn!("handshake with {from} failed: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    warn!("could not spawn handshake thread: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Handshake one accepted socket and route it by role.
fn admit(
    mut stream: TcpStream,
    core: Arc<Core>,
    pending: Arc<PendingReverse>,
    conns: Arc<Mutex<Vec<Weak<ConnShared>>>>,
) -> Result<()> {
    // Accepted sockets inherit the listener's non-blocking mode on some
    // platforms; framing assumes blocking reads.
    stream.set_nonblocking(false)?;
    let (token, peer) = handshake::accept(&mut stream, core.instances.ident())?;
    match token.role {
        ChannelRole::Primary => {
            debug!("primary connection from {peer}");
            let exit_on_disconnect = core.config.exit_on_disconnect;
            let shared = ConnShared::new(core, &stream, peer)?;
            conns
                .lock()
                .expect("connection list poisoned")
                .push(Arc::downgrade(&shared));
            Dispatcher::new(shared, Some(pending), exit_on_disconnect).spawn(stream)
        }
        ChannelRole::Reverse => {
            debug!("reverse socket from {peer} parked");
            pending.put(token.connection_id, stream);
            Ok(())
        }
    }
}
