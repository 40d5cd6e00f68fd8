//! The object model: what it means to be callable across a connection.
//!
//! An object is *pass-by-reference* when it implements [`Remotable`]:
//! marshalling it sends its identity, and the peer gets a proxy.  The
//! [`remotable!`](crate::remotable) macro implements the trait for a
//! servant type and lists the remote interfaces it answers to; the
//! [`remote_interface!`](crate::remote_interface) macro declares those
//! interfaces and implements [`RemoteIface`] for their `dyn` types.

use std::any::Any;
use std::sync::Arc;

use crate::{Error, Result};

/// Marker trait for objects that are marshalled by reference.
///
/// Instances are held in `Arc`s: the instance map keeps a hard `Arc` for
/// every locally-owned object the peer can still reach, and a weak one
/// for every proxy standing in for a peer-owned object.
pub trait Remotable: Any + Send + Sync {
    /// Name of the concrete servant type, used in minted object ids.
    fn wire_type_name(&self) -> &'static str;

    /// Name of the primary remote interface this object is exposed as.
    ///
    /// This is what goes on the wire as the declared type of a fresh
    /// reference, so the peer knows which proxy to build.
    fn iface_name(&self) -> &'static str;

    /// Cast this object to one of its remote interfaces.
    ///
    /// On success the box holds an `Arc<dyn Iface>` for the named
    /// interface.  Returns `None` if this object does not expose it.
    fn cast_to(self: Arc<Self>, iface: &str) -> Option<Box<dyn Any + Send + Sync>>;

    /// Upcast to the untyped object trait.
    ///
    /// Exists so generic code holding an `Arc<T>` for some `T: Remotable
    /// + ?Sized` (including an `Arc<dyn Iface>` trait object) can reach
    /// `Arc<dyn Remotable>` without relying on an unsizing coercion the
    /// compiler cannot derive for an abstract `T`; each implementor
    /// performs the (trivial, for it) coercion itself.
    fn into_remotable(self: Arc<Self>) -> Arc<dyn Remotable>;
}

/// A remote interface's `dyn` type: named on the wire, bindable from an
/// untyped object, and upcastable to [`Remotable`].
///
/// Implemented by [`remote_interface!`](crate::remote_interface); not
/// meant to be implemented by hand.
pub trait RemoteIface: Remotable {
    /// The interface's stable wire name.
    const NAME: &'static str;

    /// Bind an untyped object (an original servant or a proxy) to this
    /// interface, failing if the object does not expose it.
    fn bind(obj: Arc<dyn Remotable>) -> Result<Arc<Self>>;

    /// Upcast a typed reference to the untyped object trait.
    fn upcast(obj: Arc<Self>) -> Arc<dyn Remotable>;
}

/// Shared implementation of [`RemoteIface::bind`]: downcast the box that
/// [`Remotable::cast_to`] produced.
pub fn bind_cast<I>(obj: Arc<dyn Remotable>, iface: &'static str) -> Result<Arc<I>>
where
    I: ?Sized + 'static,
    Arc<I>: Sized,
{
    let type_name = obj.wire_type_name();
    obj.cast_to(iface)
        .and_then(|b| b.downcast::<Arc<I>>().ok())
        .map(|b| *b)
        .ok_or_else(|| {
            Error::ProxyManagement(format!(
                "object of type {} does not expose interface {}",
                type_name, iface
            ))
        })
}

/// Declare a concrete servant type as pass-by-reference, listing the
/// remote interfaces it answers to.  The first interface listed is the
/// one fresh references are declared as on the wire.
///
/// ```ignore
/// remote_interface! { pub trait Greeter { fn hello(&self, name: String) -> Result<String>; } }
///
/// struct GreeterImpl;
/// impl Greeter for GreeterImpl { /* ... */ }
/// remotable! { GreeterImpl: Greeter }
/// ```
#[macro_export]
macro_rules! remotable {
    { $ty:ty : $first:path $(, $rest:path)* $(,)? } => {
        impl $crate::Remotable for $ty {
            fn wire_type_name(&self) -> &'static str {
                stringify!($ty)
            }
            fn iface_name(&self) -> &'static str {
                <dyn $first as $crate::RemoteIface>::NAME
            }
            fn cast_to(
                self: ::std::sync::Arc<Self>,
                iface: &str,
            ) -> Option<Box<dyn ::std::any::Any + Send + Sync>> {
                if iface == <dyn $first as $crate::RemoteIface>::NAME {
                    return Some(Box::new(self.clone() as ::std::sync::Arc<dyn $first>));
                }
                $(
                    if iface == <dyn $rest as $crate::RemoteIface>::NAME {
                        return Some(Box::new(self.clone() as ::std::sync::Arc<dyn $rest>));
                    }
                )*
                None
            }
            fn into_remotable(self: ::std::sync::Arc<Self>) -> ::std::sync::Arc<dyn $crate::Remotable> {
                self
            }
        }
    };
}
