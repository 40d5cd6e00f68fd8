//! Delegates: callable references that cross the connection.
//!
//! A [`Delegate<A>`] is how an event handler or callback travels.  On
//! its home side it wraps a closure (hosted by an anonymous sink
//! servant); marshalled outward it becomes a method pointer, and the
//! peer sees a delegate whose invocation sends a request back over the
//! connection.  [`Event<A>`] is the hosting side of an event: a multiset
//! of subscribed delegates with order-preserving add/remove.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use tether_frame::{MsgKind, ObjectId, WireArg};

use crate::arg::{ArgValue, FromArg, ToArg};
use crate::iface::{method_token, IfaceEntry, InvokeCtx};
use crate::invoker::{CallBuilder, Invoker, ProxyHandle};
use crate::marshal::UnmarshalCtx;
use crate::object::bind_cast;
use crate::{Error, Remotable, Result};

/// Wire name of the built-in sink interface every local delegate is
/// hosted behind.
pub(crate) const SINK_IFACE: &str = "tether.DelegateSink";

/// Method token of the sink's single `invoke` method.
pub(crate) const SINK_METHOD: i32 = method_token("invoke");

/// A remote-side delegate: everything needed to route an invocation to
/// the sink living on the peer.
#[derive(Clone)]
pub struct RemoteBinding {
    /// Id of the sink object hosting the method.
    pub(crate) target: ObjectId,
    /// The delegate's own identity, used to match add/remove pairs.
    pub(crate) delegate: ObjectId,
    /// Interface declaring the pointed-to method.
    pub(crate) iface: String,
    /// Token of the pointed-to method.
    pub(crate) method: i32,
    /// Channel toward the sink's owner.
    pub(crate) chan: Arc<Invoker>,
}

/// The two homes a delegate can have.
#[derive(Clone)]
pub(crate) enum DelegateRepr {
    /// The handler lives here: a sink servant wrapping the closure.
    Local {
        /// The sink servant; marshalling registers it and sends its id.
        sink: Arc<dyn Remotable>,
        /// Identity anchor: a separate servant whose id names the
        /// delegate itself, so an add and its matching remove agree.
        anchor: Arc<dyn Remotable>,
        /// Interface name the sink answers to.
        iface: &'static str,
        /// Method token on that interface.
        method: i32,
    },
    /// The handler lives on the peer.
    Remote(RemoteBinding),
}

/// An opaque, classified delegate value, as handed to the marshaller.
pub struct DelegateValue(DelegateRepr);

impl DelegateValue {
    /// Unwrap into the representation.
    pub(crate) fn into_repr(self) -> DelegateRepr {
        self.0
    }
}

/// A callable reference to a method, local or remote.
///
/// `A` is the argument the handler takes.  Ref parameters and return
/// values are not supported on delegates; event handlers are
/// fire-and-acknowledge.
pub struct Delegate<A> {
    /// Where the handler lives.
    repr: DelegateRepr,
    /// Marker tying this delegate to its argument type.
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for Delegate<A> {
    fn clone(&self) -> Self {
        Delegate {
            repr: self.repr.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for Delegate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            DelegateRepr::Local { .. } => write!(f, "Delegate(local)"),
            DelegateRepr::Remote(b) => write!(f, "Delegate(remote {})", b.delegate),
        }
    }
}

impl<A> PartialEq for Delegate<A> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.repr, &other.repr) {
            (DelegateRepr::Local { anchor: a, .. }, DelegateRepr::Local { anchor: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (DelegateRepr::Remote(a), DelegateRepr::Remote(b)) => a.delegate == b.delegate,
            _ => false,
        }
    }
}

impl<A: Send + Sync + 'static> Delegate<A>
where
    A: FromArg,
{
    /// Wrap a closure as a delegate.
    ///
    /// The closure is hosted by an anonymous sink servant; marshalling
    /// this delegate outward registers the sink in the instance map and
    /// sends a method pointer at it.
    pub fn from_fn(f: impl Fn(A) + Send + Sync + 'static) -> Self {
        Delegate {
            repr: DelegateRepr::Local {
                sink: Arc::new(FnSink {
                    f: Box::new(f),
                }),
                anchor: Arc::new(DelegateAnchor),
                iface: SINK_IFACE,
                method: SINK_METHOD,
            },
            _marker: PhantomData,
        }
    }
}

impl<A: ToArg + 'static> Delegate<A> {
    /// Invoke the handler with `arg`.
    ///
    /// A local delegate runs the closure in place; a remote one sends a
    /// request to the sink's owner and waits for the acknowledgement.
    pub fn call(&self, arg: A) -> Result<()> {
        match &self.repr {
            DelegateRepr::Local { sink, .. } => {
                let any: &dyn Any = &**sink;
                let sink = any.downcast_ref::<FnSink<A>>().ok_or_else(|| {
                    Error::Unsupported("delegate argument type mismatch".into())
                })?;
                (sink.f)(arg);
                Ok(())
            }
            DelegateRepr::Remote(b) => {
                let mut call = CallBuilder::new();
                call.push(arg);
                let mut reply = b.chan.invoke_method(
                    MsgKind::METHOD_CALL,
                    b.target.as_str(),
                    &b.iface,
                    b.method,
                    call,
                )?;
                reply.take_return::<()>()
            }
        }
    }
}

impl<A> ToArg for Delegate<A> {
    fn to_arg(self) -> ArgValue {
        ArgValue::Delegate(DelegateValue(self.repr))
    }
}

impl<A> FromArg for Delegate<A> {
    fn from_arg(arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::MethodPointer {
                target,
                delegate,
                iface,
                method,
            } => {
                let binding = ctx.bind_delegate(target, delegate, iface, method)?;
                Ok(Delegate {
                    repr: DelegateRepr::Remote(binding),
                    _marker: PhantomData,
                })
            }
            other => Err(Error::Serialization(format!(
                "expected method pointer argument, got tag {}",
                other.tag()
            ))),
        }
    }
}

/// The hosting side of an event: an ordered multiset of subscribers.
///
/// Adding the same delegate twice subscribes it twice; removing drops
/// one matching subscription; removing an absent delegate is a no-op.
pub struct Event<A> {
    /// Current subscriptions, in add order.
    subs: Mutex<Vec<Delegate<A>>>,
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Event {
            subs: Mutex::new(Vec::new()),
        }
    }
}

impl<A> Event<A> {
    /// Create an event with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a delegate.
    pub fn add(&self, d: Delegate<A>) {
        self.subs.lock().expect("event poisoned").push(d);
    }

    /// Drop one subscription matching `d`.  No-op if none matches.
    pub fn remove(&self, d: &Delegate<A>) {
        let mut subs = self.subs.lock().expect("event poisoned");
        if let Some(pos) = subs.iter().position(|s| s == d) {
            subs.remove(pos);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subs.lock().expect("event poisoned").len()
    }

    /// Return true if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: ToArg + Clone + 'static> Event<A> {
    /// Invoke every subscriber with a clone of `arg`, in add order.
    ///
    /// All subscribers run even if one fails; the first failure is
    /// returned afterwards.
    pub fn fire(&self, arg: A) -> Result<()> {
        let snapshot = self.subs.lock().expect("event poisoned").clone();
        let mut first_err = None;
        for sub in snapshot {
            if let Err(e) = sub.call(arg.clone()) {
                tracing::warn!("event subscriber failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// The anonymous servant hosting a closure-backed delegate.
struct FnSink<A> {
    /// The handler itself.
    f: Box<dyn Fn(A) + Send + Sync>,
}

impl<A: FromArg + Send + Sync + 'static> Remotable for FnSink<A> {
    fn wire_type_name(&self) -> &'static str {
        "DelegateSink"
    }
    fn iface_name(&self) -> &'static str {
        SINK_IFACE
    }
    fn cast_to(self: Arc<Self>, iface: &str) -> Option<Box<dyn Any + Send + Sync>> {
        if iface == SINK_IFACE {
            Some(Box::new(self as Arc<dyn SinkObj>))
        } else {
            None
        }
    }
    fn into_remotable(self: Arc<Self>) -> Arc<dyn Remotable> {
        self
    }
}

/// Identity anchor for a delegate; owns no behavior.
struct DelegateAnchor;

impl Remotable for DelegateAnchor {
    fn wire_type_name(&self) -> &'static str {
        "Delegate"
    }
    fn iface_name(&self) -> &'static str {
        "tether.Delegate"
    }
    fn cast_to(self: Arc<Self>, _iface: &str) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }
    fn into_remotable(self: Arc<Self>) -> Arc<dyn Remotable> {
        self
    }
}

/// Untyped view of a sink servant: takes the argument in wire form and
/// decodes it itself, since each sink knows its own argument type.
pub(crate) trait SinkObj: Send + Sync {
    /// Decode `arg` and run the handler.
    fn invoke_sink(&self, arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<()>;
}

impl<A: FromArg + Send + Sync + 'static> SinkObj for FnSink<A> {
    fn invoke_sink(&self, arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<()> {
        let arg = A::from_arg(arg, ctx)?;
        (self.f)(arg);
        Ok(())
    }
}

/// Proxy for a sink owned by the peer; forwards the raw argument.
struct SinkProxy {
    /// Handle routing to the original sink.
    handle: ProxyHandle,
}

impl Remotable for SinkProxy {
    fn wire_type_name(&self) -> &'static str {
        "DelegateSinkProxy"
    }
    fn iface_name(&self) -> &'static str {
        SINK_IFACE
    }
    fn cast_to(self: Arc<Self>, iface: &str) -> Option<Box<dyn Any + Send + Sync>> {
        if iface == SINK_IFACE {
            Some(Box::new(self as Arc<dyn SinkObj>))
        } else {
            None
        }
    }
    fn into_remotable(self: Arc<Self>) -> Arc<dyn Remotable> {
        self
    }
}

impl SinkObj for SinkProxy {
    fn invoke_sink(&self, arg: WireArg, _ctx: &mut UnmarshalCtx) -> Result<()> {
        let mut call = CallBuilder::new();
        call.push_raw(arg);
        let mut reply = self.handle.invoke(SINK_METHOD, "invoke", call)?;
        reply.take_return::<()>()
    }
}

/// Dispatch glue for the sink interface.
fn sink_invoke(target: Arc<dyn Remotable>, method: i32, ctx: &mut InvokeCtx) -> Result<()> {
    if method != SINK_METHOD {
        return Err(Error::ProxyManagement(format!(
            "no method {method} on {SINK_IFACE}"
        )));
    }
    ctx.begin_method("invoke");
    let sink: Arc<dyn SinkObj> = bind_cast(target, SINK_IFACE)?;
    let arg = ctx.next_raw()?;
    sink.invoke_sink(arg, ctx.unmarshal_mut())?;
    ctx.finish_ret(())
}

/// Proxy factory for the sink interface.
fn sink_make_proxy(handle: ProxyHandle) -> Arc<dyn Remotable> {
    Arc::new(SinkProxy { handle })
}

inventory::submit! {
    IfaceEntry::new(SINK_IFACE, sink_invoke, sink_make_proxy)
}

/// The add/remove registration ledger of one connection.
///
/// An `add_` call records the decoded binding; the matching `remove_`
/// call retrieves (and drops) it, so both calls hand the application the
/// same delegate identity.
#[derive(Default)]
pub struct DelegateRegistry {
    /// Registrations keyed `"{sink-host-id}.{event}"`.
    inner: Mutex<HashMap<String, RemoteBinding>>,
}

impl DelegateRegistry {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `binding` under `key`, or return the earlier recording.
    pub(crate) fn register(&self, key: String, binding: RemoteBinding) -> RemoteBinding {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.entry(key).or_insert(binding).clone()
    }

    /// Remove and return the recording under `key`, if any.
    pub(crate) fn take(&self, key: &str) -> Option<RemoteBinding> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.remove(key)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn local_delegate_calls_closure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let d = {
            let hits = Arc::clone(&hits);
            Delegate::from_fn(move |n: i32| {
                hits.fetch_add(n as usize, Ordering::SeqCst);
            })
        };
        d.call(3).unwrap();
        d.call(4).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn event_is_a_multiset() {
        let count = Arc::new(AtomicUsize::new(0));
        let ev: Event<String> = Event::new();
        let d = {
            let count = Arc::clone(&count);
            Delegate::from_fn(move |_: String| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        // Added twice: fires twice per event.
        ev.add(d.clone());
        ev.add(d.clone());
        ev.fire("x".to_owned()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // One remove drops one subscription.
        ev.remove(&d);
        ev.fire("y".to_owned()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Removing again empties it; a third remove is a no-op.
        ev.remove(&d);
        ev.remove(&d);
        ev.fire("z".to_owned()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(ev.is_empty());
    }

    #[test]
    fn distinct_handlers_are_distinct() {
        let ev: Event<i32> = Event::new();
        let a = Delegate::from_fn(|_: i32| {});
        let b = Delegate::from_fn(|_: i32| {});
        ev.add(a.clone());
        ev.add(b.clone());
        assert_ne!(a, b);
        ev.remove(&b);
        assert_eq!(ev.len(), 1);
    }
}
