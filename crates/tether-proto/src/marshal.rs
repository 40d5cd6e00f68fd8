//! Marshalling: turning classified values into wire arguments and back.
//!
//! The write side ([`Marshaller::marshal`]) fixes each value's fate
//! against the instance map: a known proxy is sent as a bare reference
//! (the owner already knows it), a local object gets an id minted (or
//! reused) and travels as a declared reference, serializable values are
//! serialized inside a marshalling scope so embedded [`Ref`]s work, and
//! delegates become method pointers.
//!
//! The read side ([`UnmarshalCtx`]) is total over the tag alphabet:
//! references resolve to the original object when this side owns it,
//! are a fatal protocol error when they claim to be local but are not
//! known, and otherwise synthesize (or reuse) a proxy registered weakly
//! in the instance map.
//!
//! [`Ref`]: crate::Ref

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tether_frame::{ObjectId, WireArg};

use crate::delegate::{DelegateRegistry, DelegateRepr, DelegateValue, RemoteBinding};
use crate::iface::table;
use crate::instances::InstanceMap;
use crate::invoker::{Invoker, ProxyHandle};
use crate::payload::{self, ObjectResolver};
use crate::{ArgValue, Error, Remotable, Result};

/// Record an object reference for sending: its id, and the interface
/// name to declare (empty when the receiver already owns the object).
pub(crate) fn object_to_ref(
    instances: &Arc<InstanceMap>,
    obj: Arc<dyn Remotable>,
) -> (ObjectId, String) {
    if let Some(id) = instances.try_get_id(&obj) {
        if instances.is_local(&id) {
            (id, obj.iface_name().to_owned())
        } else {
            // A proxy going home: the owner knows it by id alone.
            (id, String::new())
        }
    } else {
        let id = instances.id_for(&obj);
        (id, obj.iface_name().to_owned())
    }
}

/// Resolve a reference received from the peer.
///
/// `chan` is the channel on which calls *toward* the peer travel; a
/// fresh proxy binds its handle to it.
pub(crate) fn resolve_object(
    instances: &Arc<InstanceMap>,
    chan: Option<&Arc<Invoker>>,
    id: &ObjectId,
    wire_iface: &str,
    want_iface: &'static str,
) -> Result<Arc<dyn Remotable>> {
    if let Some(obj) = instances.try_get(id) {
        return Ok(obj);
    }
    if instances.is_local(id) {
        // The peer named an object of ours that we never handed out (or
        // have already been told to release): it invented the id.
        return Err(Error::Proto(format!(
            "peer referenced unknown local object {id}"
        )));
    }
    let iface = if wire_iface.is_empty() {
        want_iface
    } else {
        wire_iface
    };
    let entry = table().lookup(iface).ok_or_else(|| {
        Error::ProxyManagement(format!("no interface {iface:?} registered for proxying"))
    })?;
    let chan = chan
        .ok_or_else(|| {
            Error::ProxyManagement(format!(
                "no channel available to proxy remote object {id}"
            ))
        })?
        .clone();
    let proxy = (entry.make_proxy)(ProxyHandle::new(id.clone(), entry.name, chan));
    instances.add_or_replace(Arc::clone(&proxy), id.clone());
    Ok(proxy)
}

/// The resolver handed to the payload serializer, so `Ref` fields inside
/// payload graphs can reach the instance map.
struct ScopeResolver {
    /// The instance map of this endpoint.
    instances: Arc<InstanceMap>,
    /// Channel toward the peer, for synthesizing proxies on decode.
    chan: Option<Arc<Invoker>>,
}

impl ObjectResolver for ScopeResolver {
    fn resolve(
        &self,
        id: &ObjectId,
        iface: &str,
        want_iface: &'static str,
    ) -> Result<Arc<dyn Remotable>> {
        resolve_object(&self.instances, self.chan.as_ref(), id, iface, want_iface)
    }

    fn to_ref(&self, obj: Arc<dyn Remotable>) -> (ObjectId, String) {
        object_to_ref(&self.instances, obj)
    }
}

/// The write half of the marshalling layer.
pub struct Marshaller {
    /// The instance map classification runs against.
    instances: Arc<InstanceMap>,
}

impl Marshaller {
    /// Create a marshaller over an instance map.
    pub fn new(instances: Arc<InstanceMap>) -> Self {
        Marshaller { instances }
    }

    /// Convert one classified value into its wire form.
    pub fn marshal(&self, value: ArgValue) -> Result<WireArg> {
        Ok(match value {
            ArgValue::Null => WireArg::Null,
            ArgValue::TypeToken(name) => WireArg::TypeToken(name),
            ArgValue::TypeTokenArray(names) => WireArg::TypeTokenArray(names),
            ArgValue::Address(addr) => WireArg::Address(addr.to_string()),
            ArgValue::Sequence { element, items } => {
                let items = items
                    .into_iter()
                    .map(|i| self.marshal(i))
                    .collect::<Result<Vec<_>>>()?;
                WireArg::Container {
                    container: "Vec".to_owned(),
                    element: element.to_owned(),
                    items,
                }
            }
            ArgValue::Delegate(d) => self.marshal_delegate(d)?,
            ArgValue::Object(obj) => {
                let (id, type_name) = object_to_ref(&self.instances, obj);
                WireArg::RemoteRef { id, type_name }
            }
            ArgValue::Payload(p) => {
                let resolver = Arc::new(ScopeResolver {
                    instances: Arc::clone(&self.instances),
                    chan: None,
                });
                WireArg::Serialized(payload::encode(&*p, resolver)?)
            }
            ArgValue::Raw(w) => w,
        })
    }

    /// Convert a delegate into a method pointer.
    fn marshal_delegate(&self, d: DelegateValue) -> Result<WireArg> {
        match d.into_repr() {
            DelegateRepr::Local {
                sink,
                anchor,
                iface,
                method,
            } => {
                // The sink is the callback target; the anchor gives the
                // delegate its own identity, so a later removal can name
                // this same registration.
                let target = self.instances.id_for(&sink);
                let delegate = self.instances.id_for(&anchor);
                Ok(WireArg::MethodPointer {
                    target,
                    delegate,
                    iface: iface.to_owned(),
                    method,
                })
            }
            DelegateRepr::Remote(b) => Ok(WireArg::MethodPointer {
                target: b.target,
                delegate: b.delegate,
                iface: b.iface,
                method: b.method,
            }),
        }
    }
}

/// The read half of the marshalling layer: everything a [`FromArg`]
/// conversion needs to rebuild a typed value.
///
/// [`FromArg`]: crate::FromArg
pub struct UnmarshalCtx {
    /// The instance map of this endpoint.
    pub(crate) instances: Arc<InstanceMap>,
    /// Channel toward the peer; fresh proxies bind to it.
    pub(crate) chan: Option<Arc<Invoker>>,
    /// Delegate registration ledger of this connection.
    pub(crate) registry: Option<Arc<DelegateRegistry>>,
    /// Name of the method whose arguments are being decoded; the
    /// `add_`/`remove_` prefix drives delegate registration.
    pub(crate) calling_method: &'static str,
}

impl UnmarshalCtx {
    /// A minimal context for decoding outside any connection (tests,
    /// local loopback).
    pub fn detached(instances: Arc<InstanceMap>) -> Self {
        UnmarshalCtx {
            instances,
            chan: None,
            registry: None,
            calling_method: "",
        }
    }

    /// Decode a serialized payload, with `Ref` resolution available.
    pub fn decode_payload<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let resolver = Arc::new(ScopeResolver {
            instances: Arc::clone(&self.instances),
            chan: self.chan.clone(),
        });
        payload::decode(bytes, resolver)
    }

    /// Resolve a reference to a live object (original or proxy).
    pub fn resolve(
        &mut self,
        id: &ObjectId,
        wire_iface: &str,
        want_iface: &'static str,
    ) -> Result<Arc<dyn Remotable>> {
        resolve_object(&self.instances, self.chan.as_ref(), id, wire_iface, want_iface)
    }

    /// Bind a received method pointer to a callable delegate, keeping
    /// the add/remove registration ledger.
    ///
    /// When the surrounding call is an `add_` method, the binding is
    /// recorded under `"{instance}.{event}"`; a matching `remove_` call
    /// gets the recorded binding back (and drops the record), so both
    /// ends of the pair name the same delegate.  A removal with no prior
    /// registration still yields a binding — carrying the wire identity,
    /// so the caller's remove can match by id — but registers nothing.
    pub fn bind_delegate(
        &mut self,
        target: ObjectId,
        delegate: ObjectId,
        iface: String,
        method: i32,
    ) -> Result<RemoteBinding> {
        if target.as_str().is_empty() {
            // A method pointer with no bound target cannot be routed to
            // an object, so it cannot be represented here at all.
            return Err(Error::Unsupported(
                "method pointer without a bound target".into(),
            ));
        }
        let chan = self
            .chan
            .as_ref()
            .ok_or_else(|| {
                Error::ProxyManagement("no channel available for callback delegate".into())
            })?
            .clone();
        let binding = RemoteBinding {
            target,
            delegate,
            iface,
            method,
            chan,
        };
        if let Some(registry) = &self.registry {
            if let Some(event) = self.calling_method.strip_prefix("add_") {
                let key = registration_key(&binding.target, event);
                return Ok(registry.register(key, binding));
            } else if let Some(event) = self.calling_method.strip_prefix("remove_") {
                let key = registration_key(&binding.target, event);
                return Ok(registry.take(&key).unwrap_or(binding));
            }
        }
        Ok(binding)
    }
}

/// Ledger key for a delegate registration: the sink's host instance plus
/// the event name, so distinct handlers on one event stay distinct.
fn registration_key(instance: &ObjectId, event: &str) -> String {
    format!("{}.{}", instance, event)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::any::Any;
    use tether_frame::InstanceIdent;

    struct Plain;
    impl Remotable for Plain {
        fn wire_type_name(&self) -> &'static str {
            "Plain"
        }
        fn iface_name(&self) -> &'static str {
            "Plain"
        }
        fn cast_to(self: Arc<Self>, _iface: &str) -> Option<Box<dyn Any + Send + Sync>> {
            None
        }
        fn into_remotable(self: Arc<Self>) -> Arc<dyn Remotable> {
            self
        }
    }

    fn instances() -> Arc<InstanceMap> {
        Arc::new(InstanceMap::new(InstanceIdent::new("here", "1")))
    }

    #[test]
    fn null_and_tokens() {
        let m = Marshaller::new(instances());
        assert_eq!(m.marshal(ArgValue::Null).unwrap(), WireArg::Null);
        assert_eq!(
            m.marshal(ArgValue::TypeToken("Widget".into())).unwrap(),
            WireArg::TypeToken("Widget".into())
        );
    }

    #[test]
    fn fresh_object_gets_declared_reference() {
        let inst = instances();
        let m = Marshaller::new(Arc::clone(&inst));
        let obj: Arc<dyn Remotable> = Arc::new(Plain);
        let w = m.marshal(ArgValue::Object(Arc::clone(&obj))).unwrap();
        match w {
            WireArg::RemoteRef { id, type_name } => {
                assert_eq!(type_name, "Plain");
                assert!(inst.is_local(&id));
                // The map now holds the object hard, under that id.
                assert!(Arc::ptr_eq(&inst.try_get(&id).unwrap(), &obj));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn known_proxy_travels_bare() {
        let inst = instances();
        let m = Marshaller::new(Arc::clone(&inst));
        // Pretend `obj` is a proxy for a peer-owned object.
        let obj: Arc<dyn Remotable> = Arc::new(Plain);
        let peer_id = ObjectId::from("peer/2/Plain/5");
        inst.add_or_replace(Arc::clone(&obj), peer_id.clone());

        let w = m.marshal(ArgValue::Object(obj)).unwrap();
        assert_eq!(
            w,
            WireArg::RemoteRef {
                id: peer_id,
                type_name: String::new()
            }
        );
    }

    #[test]
    fn local_reference_resolves_to_original() {
        let inst = instances();
        let obj: Arc<dyn Remotable> = Arc::new(Plain);
        let id = inst.id_for(&obj);
        let got = resolve_object(&inst, None, &id, "", "Plain").unwrap();
        assert!(Arc::ptr_eq(&got, &obj));
    }

    #[test]
    fn invented_local_reference_is_fatal() {
        let inst = instances();
        let bogus = ObjectId::from("here/1/Plain/99");
        let err = match resolve_object(&inst, None, &bogus, "", "Plain") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, Error::Proto(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn sequence_marshals_elementwise() {
        let inst = instances();
        let m = Marshaller::new(Arc::clone(&inst));
        let a: Arc<dyn Remotable> = Arc::new(Plain);
        let b: Arc<dyn Remotable> = Arc::new(Plain);
        let w = m
            .marshal(ArgValue::Sequence {
                element: "Plain",
                items: vec![ArgValue::Object(a), ArgValue::Object(b), ArgValue::Null],
            })
            .unwrap();
        match w {
            WireArg::Container { element, items, .. } => {
                assert_eq!(element, "Plain");
                assert_eq!(items.len(), 3);
                assert!(matches!(items[0], WireArg::RemoteRef { .. }));
                assert!(matches!(items[2], WireArg::Null));
                // Two distinct objects, two distinct ids.
                assert_ne!(items[0], items[1]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
