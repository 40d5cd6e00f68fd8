//! Runtime argument values and the conversions the generated stubs use.
//!
//! A stub turns each typed argument into an [`ArgValue`] (via [`ToArg`])
//! before handing it to the marshaller, and turns decoded wire
//! arguments back into typed values (via [`FromArg`]).  The conversion
//! is where a value's *classification* is fixed: serializable values
//! become payloads, remotable objects become references, delegates
//! become method pointers, and so on.

use std::net::IpAddr;
use std::sync::Arc;

use tether_frame::WireArg;

use crate::delegate::DelegateValue;
use crate::marshal::UnmarshalCtx;
use crate::{Error, Remotable, RemoteIface, Result};

/// A classified argument value, ready for the marshaller.
pub enum ArgValue {
    /// No value.
    Null,
    /// A value serialized by the opaque payload serializer.
    ///
    /// Serialization is deferred: it runs inside the marshaller, where
    /// embedded object references can reach the instance map.
    Payload(Box<dyn erased_serde::Serialize + Send>),
    /// A pass-by-reference object: only its identity crosses the wire.
    Object(Arc<dyn Remotable>),
    /// A type descriptor, by name.
    TypeToken(String),
    /// An array of type descriptors.
    TypeTokenArray(Vec<String>),
    /// A network address.
    Address(IpAddr),
    /// A list-like container of pass-by-reference elements; each element
    /// is classified recursively.
    Sequence {
        /// Interface name of the element type.
        element: &'static str,
        /// The elements.
        items: Vec<ArgValue>,
    },
    /// A bound method reference.
    Delegate(DelegateValue),
    /// An already-encoded wire argument, forwarded untouched.
    Raw(WireArg),
}

impl ArgValue {
    /// Wrap a serializable value as a deferred payload.
    pub fn value<T: serde::Serialize + Send + 'static>(v: T) -> ArgValue {
        ArgValue::Payload(Box::new(v))
    }
}

impl std::fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::Null => write!(f, "Null"),
            ArgValue::Payload(_) => write!(f, "Payload(..)"),
            ArgValue::Object(o) => write!(f, "Object({})", o.wire_type_name()),
            ArgValue::TypeToken(t) => write!(f, "TypeToken({t})"),
            ArgValue::TypeTokenArray(ts) => write!(f, "TypeTokenArray({} entries)", ts.len()),
            ArgValue::Address(a) => write!(f, "Address({a})"),
            ArgValue::Sequence { element, items } => {
                write!(f, "Sequence<{element}>({} items)", items.len())
            }
            ArgValue::Delegate(_) => write!(f, "Delegate(..)"),
            ArgValue::Raw(w) => write!(f, "Raw({:?})", w.tag()),
        }
    }
}

/// Conversion of a typed value into a classified [`ArgValue`].
pub trait ToArg {
    /// Classify and convert this value.
    fn to_arg(self) -> ArgValue;
}

/// Conversion of a decoded wire argument back into a typed value.
pub trait FromArg: Sized {
    /// Convert `arg`, resolving references through `ctx`.
    fn from_arg(arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<Self>;
}

/// Reject a wire argument whose tag does not fit the expected type.
fn wrong_tag<T>(expected: &'static str, got: &WireArg) -> Result<T> {
    Err(Error::Serialization(format!(
        "expected {} argument, got tag {}",
        expected,
        got.tag()
    )))
}

/// Implement pass-by-value conversion for serializable types.
///
/// This is the by-value marker: a type listed here crosses the wire as
/// an opaque serialized payload.  The crate pre-declares the primitive
/// and common standard types; applications invoke this for their own
/// `serde`-enabled types.
#[macro_export]
macro_rules! pass_by_value {
    { $($ty:ty),* $(,)? } => {
        $(
            impl $crate::ToArg for $ty {
                fn to_arg(self) -> $crate::ArgValue {
                    $crate::ArgValue::value(self)
                }
            }
            impl $crate::FromArg for $ty {
                fn from_arg(
                    arg: $crate::WireArg,
                    ctx: &mut $crate::UnmarshalCtx,
                ) -> $crate::Result<Self> {
                    match arg {
                        $crate::WireArg::Serialized(bytes) => ctx.decode_payload(&bytes),
                        other => Err($crate::Error::Serialization(format!(
                            "expected serialized argument for {}, got tag {}",
                            stringify!($ty),
                            other.tag()
                        ))),
                    }
                }
            }
        )*
    };
}

pass_by_value! {
    i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, char, String,
    Vec<u8>, Vec<i32>, Vec<i64>, Vec<String>,
}

impl ToArg for () {
    fn to_arg(self) -> ArgValue {
        ArgValue::Null
    }
}

impl FromArg for () {
    fn from_arg(arg: WireArg, _ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::Null => Ok(()),
            other => wrong_tag("null", &other),
        }
    }
}

impl<T: ToArg> ToArg for Option<T> {
    fn to_arg(self) -> ArgValue {
        match self {
            None => ArgValue::Null,
            Some(v) => v.to_arg(),
        }
    }
}

impl<T: FromArg> FromArg for Option<T> {
    fn from_arg(arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::Null => Ok(None),
            other => T::from_arg(other, ctx).map(Some),
        }
    }
}

impl ToArg for IpAddr {
    fn to_arg(self) -> ArgValue {
        ArgValue::Address(self)
    }
}

impl FromArg for IpAddr {
    fn from_arg(arg: WireArg, _ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::Address(text) => text
                .parse()
                .map_err(|_| Error::Serialization(format!("unparseable address {text:?}"))),
            other => wrong_tag("address", &other),
        }
    }
}

/// A type descriptor passed as an argument value.
///
/// Carried by name rather than by payload, since type descriptors are
/// not themselves serializable values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeName(pub String);

impl ToArg for TypeName {
    fn to_arg(self) -> ArgValue {
        ArgValue::TypeToken(self.0)
    }
}

impl FromArg for TypeName {
    fn from_arg(arg: WireArg, _ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::TypeToken(name) => Ok(TypeName(name)),
            other => wrong_tag("type token", &other),
        }
    }
}

impl ToArg for Vec<TypeName> {
    fn to_arg(self) -> ArgValue {
        ArgValue::TypeTokenArray(self.into_iter().map(|t| t.0).collect())
    }
}

impl FromArg for Vec<TypeName> {
    fn from_arg(arg: WireArg, _ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::TypeTokenArray(names) => Ok(names.into_iter().map(TypeName).collect()),
            other => wrong_tag("type token array", &other),
        }
    }
}

/// Any concrete servant reference, or a reference typed as the `Arc<dyn
/// Iface>` trait object a [`remote_interface!`](crate::remote_interface)
/// declares, is pass-by-reference.
///
/// Calls [`Remotable::into_remotable`] rather than relying on an
/// unsizing coercion, since the compiler cannot derive `Arc<T> ->
/// Arc<dyn Remotable>` for an abstract `T: ?Sized`; each implementor
/// performs that (trivial, for it) coercion itself.
impl<T: Remotable + ?Sized> ToArg for Arc<T> {
    fn to_arg(self) -> ArgValue {
        ArgValue::Object(self.into_remotable())
    }
}

/// Rebuild an `Arc<dyn Iface>` received as a remote reference, for any
/// interface declared via [`remote_interface!`](crate::remote_interface).
///
/// Lives here (rather than being emitted per-invocation by the macro) so
/// that the impl is local to this crate regardless of which downstream
/// crate declares the interface — implementing the macro's own
/// `ToArg`/`FromArg` impls there would run into the orphan rule once the
/// trait is defined outside this crate.
impl<T: RemoteIface + ?Sized> FromArg for Arc<T> {
    fn from_arg(arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::RemoteRef { id, type_name } => {
                let obj = ctx.resolve(&id, &type_name, T::NAME)?;
                T::bind(obj)
            }
            other => Err(Error::Serialization(format!(
                "expected object reference for {}, got tag {}",
                T::NAME,
                other.tag(),
            ))),
        }
    }
}

impl<T: RemoteIface + ?Sized> ToArg for Vec<Arc<T>> {
    fn to_arg(self) -> ArgValue {
        ArgValue::Sequence {
            element: T::NAME,
            items: self.into_iter().map(ToArg::to_arg).collect(),
        }
    }
}

impl<T: RemoteIface + ?Sized> FromArg for Vec<Arc<T>> {
    fn from_arg(arg: WireArg, ctx: &mut UnmarshalCtx) -> Result<Self> {
        match arg {
            WireArg::Container { items, .. } => items
                .into_iter()
                .map(|w| <Arc<T> as FromArg>::from_arg(w, ctx))
                .collect(),
            other => Err(Error::Serialization(format!(
                "expected container argument, got tag {}",
                other.tag(),
            ))),
        }
    }
}
