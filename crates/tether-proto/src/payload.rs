//! The opaque value serializer and its object-reference surrogate.
//!
//! Pass-by-value arguments cross the wire as length-prefixed payloads,
//! produced by `serde`.  A payload may embed references to remotable
//! objects inside a larger value graph: a [`Ref<T>`] field serializes as
//! a small reference token instead of descending into the object, and
//! deserializes by resolving that token back through the instance map —
//! producing the original object on its owning side and a proxy
//! elsewhere.
//!
//! Serialization runs inside a marshalling scope (a thread-local set up
//! by the marshaller for the duration of one encode or decode), which is
//! how `serde` code reaches the instance map without threading context
//! through every `Serialize` impl.

use std::cell::RefCell;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_frame::ObjectId;

use crate::object::RemoteIface;
use crate::{Error, Remotable, Result};

/// Resolution callback available to deserializing code: turns a
/// reference token back into a live object.
pub(crate) trait ObjectResolver: Send + Sync {
    /// Resolve `id` to the original object or a proxy exposing `iface`
    /// (falling back to `want_iface` when the token does not name one).
    fn resolve(
        &self,
        id: &ObjectId,
        iface: &str,
        want_iface: &'static str,
    ) -> Result<Arc<dyn Remotable>>;

    /// Record an object reference for serialization, returning its id
    /// and declared interface.
    fn to_ref(&self, obj: Arc<dyn Remotable>) -> (ObjectId, String);
}

thread_local! {
    /// The marshalling scope active on this thread, if any.
    static SCOPE: RefCell<Option<Arc<dyn ObjectResolver>>> = const { RefCell::new(None) };
}

/// Run `f` with `resolver` installed as the thread's marshalling scope.
///
/// Scopes nest: the previous scope (if any) is restored afterwards, so a
/// payload decode triggered from inside another decode behaves.
fn enter_scope<T>(resolver: Arc<dyn ObjectResolver>, f: impl FnOnce() -> T) -> T {
    let prev = SCOPE.with(|s| s.replace(Some(resolver)));
    /// Restores the previous scope even if `f` panics.
    struct Restore(Option<Arc<dyn ObjectResolver>>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            SCOPE.with(|s| *s.borrow_mut() = prev);
        }
    }
    let _restore = Restore(prev);
    f()
}

/// Run `f` with the active scope, or `None` when serialization happens
/// outside the marshaller.
fn with_scope<T>(f: impl FnOnce(&Arc<dyn ObjectResolver>) -> T) -> Option<T> {
    SCOPE.with(|s| s.borrow().as_ref().map(f))
}

/// Serialize `v` into payload bytes, inside a marshalling scope.
pub(crate) fn encode(
    v: &(dyn erased_serde::Serialize + Send),
    resolver: Arc<dyn ObjectResolver>,
) -> Result<Vec<u8>> {
    enter_scope(resolver, || {
        serde_json::to_vec(v).map_err(|e| Error::Serialization(e.to_string()))
    })
}

/// Deserialize payload bytes into `T`, inside a marshalling scope.
pub(crate) fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    resolver: Arc<dyn ObjectResolver>,
) -> Result<T> {
    enter_scope(resolver, || {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    })
}

/// An object reference embedded in a pass-by-value graph.
///
/// Wherever a serializable struct needs to carry a remotable object,
/// it declares the field as `Ref<dyn Iface>`: the payload then contains
/// a reference token, and the receiving side sees a `Ref` holding the
/// original object (if it is the owner) or a proxy.
pub struct Ref<T: ?Sized + RemoteIface>(pub Arc<T>);

impl<T: ?Sized + RemoteIface> Ref<T> {
    /// Wrap a typed object reference.
    pub fn new(obj: Arc<T>) -> Self {
        Ref(obj)
    }
}

impl<T: ?Sized + RemoteIface> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref(Arc::clone(&self.0))
    }
}

impl<T: ?Sized + RemoteIface> std::ops::Deref for Ref<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized + RemoteIface> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref<{}>", T::NAME)
    }
}

/// The wire shape of an embedded object reference.
#[derive(Serialize, Deserialize)]
struct RefToken {
    /// The referenced object's id.
    #[serde(rename = "$remote")]
    id: String,
    /// Declared interface, or empty when the receiver is the owner.
    #[serde(rename = "$iface")]
    iface: String,
}

impl<T: ?Sized + RemoteIface> Serialize for Ref<T> {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        let (id, iface) = with_scope(|r| r.to_ref(T::upcast(Arc::clone(&self.0))))
            .ok_or_else(|| S::Error::custom("object reference outside a marshalling scope"))?;
        RefToken {
            id: id.to_string(),
            iface,
        }
        .serialize(s)
    }
}

impl<'de, T: ?Sized + RemoteIface> Deserialize<'de> for Ref<T> {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as _;
        let token = RefToken::deserialize(d)?;
        let id = ObjectId::from(token.id.as_str());
        let obj = with_scope(|r| r.resolve(&id, &token.iface, T::NAME))
            .ok_or_else(|| D::Error::custom("object reference outside a marshalling scope"))?
            .map_err(|e| D::Error::custom(e.to_string()))?;
        let bound = T::bind(obj).map_err(|e| D::Error::custom(e.to_string()))?;
        Ok(Ref(bound))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn plain_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Point {
            x: i32,
            y: i32,
            label: String,
        }
        /// A resolver that refuses everything; plain values never use it.
        struct NoObjects;
        impl ObjectResolver for NoObjects {
            fn resolve(
                &self,
                _id: &ObjectId,
                _iface: &str,
                _want: &'static str,
            ) -> Result<Arc<dyn Remotable>> {
                Err(Error::ProxyManagement("no objects in this test".into()))
            }
            fn to_ref(&self, _obj: Arc<dyn Remotable>) -> (ObjectId, String) {
                unreachable!("no objects in this test")
            }
        }

        let p = Point {
            x: 3,
            y: -4,
            label: "origin-ish".into(),
        };
        let bytes = encode(&p, Arc::new(NoObjects)).unwrap();
        let back: Point = decode(&bytes, Arc::new(NoObjects)).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn unserializable_value_is_reported() {
        /// A value the payload serializer cannot represent.
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(
                &self,
                _s: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                use serde::ser::Error as _;
                Err(S::Error::custom("contains a raw os handle"))
            }
        }

        let out = encode(&Opaque, Arc::new(Panicky));
        assert!(matches!(out, Err(Error::Serialization(_))));

        /// Never consulted.
        struct Panicky;
        impl ObjectResolver for Panicky {
            fn resolve(
                &self,
                _id: &ObjectId,
                _iface: &str,
                _want: &'static str,
            ) -> Result<Arc<dyn Remotable>> {
                unreachable!()
            }
            fn to_ref(&self, _obj: Arc<dyn Remotable>) -> (ObjectId, String) {
                unreachable!()
            }
        }
    }

    #[test]
    fn scope_is_restored() {
        assert!(with_scope(|_| ()).is_none());
        let _ = encode(&1_i32, Arc::new(Nop));
        assert!(with_scope(|_| ()).is_none());

        /// Never consulted.
        struct Nop;
        impl ObjectResolver for Nop {
            fn resolve(
                &self,
                _id: &ObjectId,
                _iface: &str,
                _want: &'static str,
            ) -> Result<Arc<dyn Remotable>> {
                unreachable!()
            }
            fn to_ref(&self, _obj: Arc<dyn Remotable>) -> (ObjectId, String) {
                unreachable!()
            }
        }
    }
}
