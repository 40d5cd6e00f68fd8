//! The outgoing half of a connection: requests out, replies in.
//!
//! One `Invoker` owns one stream direction.  Callers (proxy stubs, the
//! bootstrap, delegates) allocate a sequence number, enqueue a slot,
//! write the whole request frame under the writer lock, and block until
//! the reader thread routes the matching reply to them.  Replies may
//! arrive in any order; the sequence number is the only correlation.
//! When the stream dies, every pending slot fails with a
//! connection-lost error.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;

use tether_bytes::{Encodable, StreamReader};
use tether_frame::{Header, MsgKind, ObjectId, RequestPrefix, WireArg};
use tracing::{debug, trace};

use crate::arg::{ArgValue, FromArg, ToArg};
use crate::delegate::DelegateRegistry;
use crate::instances::InstanceMap;
use crate::marshal::{Marshaller, UnmarshalCtx};
use crate::{Error, RemoteFault, Result};

/// Arguments being gathered for one outgoing call.
pub struct CallBuilder {
    /// The classified arguments, in declaration order.
    pub(crate) args: Vec<ArgValue>,
    /// How many of them are by-ref, and so come back with the reply.
    pub(crate) n_byref: u32,
}

impl Default for CallBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallBuilder {
    /// Start an empty argument list.
    pub fn new() -> Self {
        CallBuilder {
            args: Vec::new(),
            n_byref: 0,
        }
    }

    /// Add a by-value argument.
    pub fn push(&mut self, v: impl ToArg) {
        self.args.push(v.to_arg());
    }

    /// Add a by-ref argument: its current value is sent, and the reply
    /// will carry the value to write back.
    pub fn push_byref(&mut self, v: impl ToArg) {
        self.args.push(v.to_arg());
        self.n_byref += 1;
    }

    /// Add an argument already in wire form.
    pub fn push_raw(&mut self, w: WireArg) {
        self.args.push(ArgValue::Raw(w));
    }

    /// Return true if no arguments have been added.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// The decoded values of one successful reply.
pub struct ReplyValues {
    /// The tagged return value, until taken.
    ret: Option<WireArg>,
    /// The by-ref argument values, in declaration order.
    byref: std::vec::IntoIter<WireArg>,
    /// Context for resolving references inside the reply.
    um: UnmarshalCtx,
}

impl ReplyValues {
    /// Take and decode the return value.
    pub fn take_return<T: FromArg>(&mut self) -> Result<T> {
        let w = self
            .ret
            .take()
            .ok_or_else(|| Error::Proto("return value already taken".into()))?;
        T::from_arg(w, &mut self.um)
    }

    /// Take and decode the next by-ref argument value.
    pub fn take_byref<T: FromArg>(&mut self) -> Result<T> {
        let w = self
            .byref
            .next()
            .ok_or_else(|| Error::Proto("reply carried too few by-ref values".into()))?;
        T::from_arg(w, &mut self.um)
    }
}

/// Identity of a peer-owned object plus the channel to reach it; the
/// state behind every proxy.
pub struct ProxyHandle {
    /// The original object's id.
    id: ObjectId,
    /// Interface the proxy exposes; the declaring type of every call.
    iface: &'static str,
    /// The channel calls travel on.
    chan: Arc<Invoker>,
}

impl ProxyHandle {
    /// Build a handle (done by the marshalling layer on decode).
    pub(crate) fn new(id: ObjectId, iface: &'static str, chan: Arc<Invoker>) -> Self {
        ProxyHandle { id, iface, chan }
    }

    /// The original object's id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Forward one intercepted call and block for its reply.
    pub fn invoke(&self, method: i32, name: &str, call: CallBuilder) -> Result<ReplyValues> {
        trace!("proxy call {}::{} on {}", self.iface, name, self.id);
        self.chan
            .invoke_method(MsgKind::METHOD_CALL, self.id.as_str(), self.iface, method, call)
    }
}

/// A slot waiting for one reply.
struct Pending {
    /// How many by-ref values the reply carries after the return value.
    n_byref: u32,
    /// Rendezvous with the blocked caller.
    tx: mpsc::SyncSender<Result<RawReply>>,
}

/// An undecoded successful reply.
struct RawReply {
    /// The tagged return value.
    ret: WireArg,
    /// The by-ref values, in declaration order.
    byref: Vec<WireArg>,
}

/// The outgoing-call engine for one stream.
pub struct Invoker {
    /// Instance map shared by the whole endpoint.
    instances: Arc<InstanceMap>,
    /// Delegate ledger for values decoded out of replies.
    registry: Arc<DelegateRegistry>,
    /// Write half.  Held only while writing one whole frame, so frames
    /// are never interleaved on the wire.
    writer: Mutex<TcpStream>,
    /// Extra handle used to shut the socket down on close.
    sock: TcpStream,
    /// Slots awaiting replies, by sequence number.
    pending: Mutex<HashMap<u32, Pending>>,
    /// The next sequence number.
    next_seq: AtomicU32,
    /// Set once the stream has failed; fails all future calls fast.
    fatal: Mutex<Option<Error>>,
    /// Handle to ourselves, for contexts that need the channel.
    self_ref: Weak<Invoker>,
}

impl Invoker {
    /// Take ownership of a connected stream's outgoing direction and
    /// start its reply reader thread.
    pub(crate) fn launch(stream: TcpStream, instances: Arc<InstanceMap>) -> Result<Arc<Self>> {
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;
        let inv = Arc::new_cyclic(|self_ref| Invoker {
            instances,
            registry: Arc::new(DelegateRegistry::new()),
            writer: Mutex::new(writer_stream),
            sock: stream,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU32::new(1),
            fatal: Mutex::new(None),
            self_ref: self_ref.clone(),
        });
        let for_thread = Arc::clone(&inv);
        thread::Builder::new()
            .name("tether-replies".into())
            .spawn(move || for_thread.read_loop(reader_stream))?;
        Ok(inv)
    }

    /// Send one request and block until its reply arrives.
    pub(crate) fn invoke_method(
        &self,
        kind: MsgKind,
        instance: &str,
        declaring: &str,
        method: i32,
        call: CallBuilder,
    ) -> Result<ReplyValues> {
        self.check_fatal()?;

        // Classify and serialize the arguments before touching any
        // shared state; a value that cannot be marshalled fails the call
        // here, with nothing on the wire.
        let marshaller = Marshaller::new(Arc::clone(&self.instances));
        let wire_args = call
            .args
            .into_iter()
            .map(|a| marshaller.marshal(a))
            .collect::<Result<Vec<_>>>()?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut frame: Vec<u8> = Vec::new();
        Header::new(kind, seq).encode_onto(&mut frame)?;
        RequestPrefix {
            instance_id: instance.to_owned(),
            declaring_type: declaring.to_owned(),
            method,
            generic_args: Vec::new(),
            n_args: wire_args.len() as u32,
        }
        .encode_onto(&mut frame)?;
        for w in &wire_args {
            w.encode_onto(&mut frame)?;
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.pending.lock().expect("pending poisoned").insert(
            seq,
            Pending {
                n_byref: call.n_byref,
                tx,
            },
        );
        // The reader may have died between our first check and the
        // insert; re-check so the slot cannot be left behind unserved.
        if let Err(e) = self.check_fatal() {
            self.pending.lock().expect("pending poisoned").remove(&seq);
            return Err(e);
        }

        if let Err(e) = self.write_frame(&frame) {
            self.pending.lock().expect("pending poisoned").remove(&seq);
            self.set_fatal(e.clone());
            return Err(e);
        }

        match rx.recv() {
            Ok(outcome) => outcome.map(|raw| self.reply_values(raw)),
            Err(_) => Err(self.fatal_error()),
        }
    }

    /// Send a frame that expects no reply.
    pub(crate) fn oneway(
        &self,
        kind: MsgKind,
        body: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        self.check_fatal()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut frame: Vec<u8> = Vec::new();
        Header::new(kind, seq).encode_onto(&mut frame)?;
        body(&mut frame)?;
        if let Err(e) = self.write_frame(&frame) {
            self.set_fatal(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Fail everything and shut the socket down.
    pub(crate) fn close(&self) {
        self.set_fatal(Error::ConnectionLost);
        let _ = self.sock.shutdown(Shutdown::Both);
    }

    /// Write one whole frame under the writer lock.
    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().expect("writer poisoned");
        w.write_all(frame)?;
        w.flush()?;
        Ok(())
    }

    /// Build the decode context for a successful reply.
    fn reply_values(&self, raw: RawReply) -> ReplyValues {
        ReplyValues {
            ret: Some(raw.ret),
            byref: raw.byref.into_iter(),
            um: UnmarshalCtx {
                instances: Arc::clone(&self.instances),
                chan: self.self_ref.upgrade(),
                registry: Some(Arc::clone(&self.registry)),
                calling_method: "",
            },
        }
    }

    /// Return the recorded fatal error, if any.
    fn check_fatal(&self) -> Result<()> {
        match &*self.fatal.lock().expect("fatal poisoned") {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// The recorded fatal error, or a plain connection-lost.
    fn fatal_error(&self) -> Error {
        self.fatal
            .lock()
            .expect("fatal poisoned")
            .clone()
            .unwrap_or(Error::ConnectionLost)
    }

    /// Record a fatal error and fail every pending slot with it.
    fn set_fatal(&self, e: Error) {
        {
            let mut fatal = self.fatal.lock().expect("fatal poisoned");
            if fatal.is_none() {
                *fatal = Some(e.clone());
            }
        }
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending poisoned");
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            let _ = p.tx.send(Err(e.clone()));
        }
    }

    /// Reader thread: route reply frames to their slots until the
    /// stream dies.
    fn read_loop(&self, stream: TcpStream) {
        let mut r = StreamReader::new(stream);
        loop {
            match self.read_one(&mut r) {
                Ok(()) => {}
                Err(e) => {
                    if e.is_disconnect() {
                        debug!("reply stream closed");
                        self.set_fatal(Error::ConnectionLost);
                    } else {
                        debug!("reply stream failed: {e}");
                        self.set_fatal(e);
                    }
                    return;
                }
            }
        }
    }

    /// Read and route one reply frame.
    fn read_one(&self, r: &mut StreamReader<TcpStream>) -> Result<()> {
        let hdr = Header::decode_from(r)?;
        match hdr.kind {
            MsgKind::METHOD_REPLY => {
                let slot = self.take_slot(hdr.seq)?;
                let ret = WireArg::decode_from(r)?;
                let mut byref = Vec::with_capacity(slot.n_byref as usize);
                for _ in 0..slot.n_byref {
                    byref.push(WireArg::decode_from(r)?);
                }
                trace!("reply for sequence {}", hdr.seq);
                let _ = slot.tx.send(Ok(RawReply { ret, byref }));
                Ok(())
            }
            MsgKind::EXCEPTION_RETURN => {
                let slot = self.take_slot(hdr.seq)?;
                let fault = match WireArg::decode_from(r)? {
                    WireArg::Serialized(bytes) => serde_json::from_slice::<RemoteFault>(&bytes)
                        .map_err(|e| Error::Proto(format!("undecodable fault record: {e}")))?,
                    other => {
                        return Err(Error::Proto(format!(
                            "exception frame carried tag {}",
                            other.tag()
                        )));
                    }
                };
                trace!("exception for sequence {}: {fault}", hdr.seq);
                let _ = slot.tx.send(Err(Error::Remote(fault)));
                Ok(())
            }
            MsgKind::SERVER_SHUTTING_DOWN => {
                debug!("peer announced shutdown");
                Err(Error::ConnectionLost)
            }
            other => Err(Error::Proto(format!(
                "unexpected frame {other} on the reply direction"
            ))),
        }
    }

    /// Remove and return the slot for `seq`.
    ///
    /// A reply with no slot means the streams have desynchronized: the
    /// frame's extent cannot even be known without the slot's recorded
    /// shape, so this is fatal.
    fn take_slot(&self, seq: u32) -> Result<Pending> {
        self.pending
            .lock()
            .expect("pending poisoned")
            .remove(&seq)
            .ok_or_else(|| Error::Proto(format!("reply for unknown sequence {seq}")))
    }
}
