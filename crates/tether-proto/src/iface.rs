//! Remote interfaces: declaration, dispatch, and generated stubs.
//!
//! A dynamic language synthesizes proxies at runtime; here they are
//! generated at build time from declared interface lists.  The
//! [`remote_interface!`](crate::remote_interface) macro takes a trait
//! definition and emits:
//!
//! * the trait itself (with [`Remotable`] as supertrait);
//! * a `<Name>Proxy` stub type whose methods marshal their arguments,
//!   send a request, block for the reply, and write `&mut` parameters
//!   back;
//! * an invoke function that decodes arguments, calls the real method,
//!   and collects the reply — registered in the global [`DispatchTable`]
//!   through `inventory`, alongside a proxy factory;
//! * conversions for `Arc<dyn Name>` and `Vec<Arc<dyn Name>>` so the
//!   interface can appear in other interfaces' signatures.
//!
//! Methods are identified on the wire by a token derived from the
//! method's name; the declaring type is the interface's name.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tether_frame::WireArg;

use crate::arg::{ArgValue, FromArg, ToArg};
use crate::invoker::ProxyHandle;
use crate::marshal::{Marshaller, UnmarshalCtx};
use crate::{Error, Remotable, Result};

/// Compute the wire token for a method name.
///
/// A 31-bit FNV-1a hash: stable under reordering and insertion of
/// methods, unlike an ordinal.  Clashes within one interface would be
/// caught by the dispatch match arms being unreachable in tests.
pub const fn method_token(name: &str) -> i32 {
    (tether_frame::fnv1a(name.as_bytes()) & 0x7fff_ffff) as i32
}

/// One registered remote interface.
pub struct IfaceEntry {
    /// The interface's wire name.
    pub name: &'static str,
    /// Decode arguments, invoke the method on the target, and push the
    /// reply values.
    pub invoke: fn(Arc<dyn Remotable>, i32, &mut InvokeCtx) -> Result<()>,
    /// Build a proxy servant over a handle to a peer-owned object.
    pub make_proxy: fn(ProxyHandle) -> Arc<dyn Remotable>,
}

impl IfaceEntry {
    /// Construct an entry (used by generated code).
    pub const fn new(
        name: &'static str,
        invoke: fn(Arc<dyn Remotable>, i32, &mut InvokeCtx) -> Result<()>,
        make_proxy: fn(ProxyHandle) -> Arc<dyn Remotable>,
    ) -> Self {
        IfaceEntry {
            name,
            invoke,
            make_proxy,
        }
    }
}

inventory::collect!(IfaceEntry);

/// Lookup table from interface wire name to its entry.
pub struct DispatchTable {
    /// The registered interfaces.
    map: HashMap<&'static str, &'static IfaceEntry>,
}

impl DispatchTable {
    /// Find an interface by wire name.
    pub fn lookup(&self, name: &str) -> Option<&'static IfaceEntry> {
        self.map.get(name).copied()
    }

    /// Number of registered interfaces.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Return true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The process-wide dispatch table, built once from the entries the
/// linker collected.
pub fn table() -> &'static DispatchTable {
    static TABLE: OnceLock<DispatchTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut map = HashMap::new();
        for entry in inventory::iter::<IfaceEntry> {
            if map.insert(entry.name, entry).is_some() {
                tracing::warn!("remote interface {:?} registered twice", entry.name);
            }
        }
        DispatchTable { map }
    })
}

/// Everything one server-side invocation needs: the decoded arguments,
/// the unmarshalling context to resolve them with, and the reply being
/// accumulated.
pub struct InvokeCtx {
    /// Arguments not yet consumed, in declaration order.
    args: std::vec::IntoIter<WireArg>,
    /// Reply values: the tagged return first, then by-ref arguments.
    reply: Vec<WireArg>,
    /// Resolution context for the arguments.
    um: UnmarshalCtx,
    /// Marshaller for the reply values.
    marshaller: Marshaller,
}

impl InvokeCtx {
    /// Build a context over decoded arguments.
    pub(crate) fn new(args: Vec<WireArg>, um: UnmarshalCtx, marshaller: Marshaller) -> Self {
        InvokeCtx {
            args: args.into_iter(),
            reply: Vec::new(),
            um,
            marshaller,
        }
    }

    /// Record which method's arguments are being decoded.  Generated
    /// dispatch arms call this first; the `add_`/`remove_` prefix drives
    /// delegate registration.
    pub fn begin_method(&mut self, name: &'static str) {
        self.um.calling_method = name;
    }

    /// Decode the next argument as `T`.
    pub fn next_arg<T: FromArg>(&mut self) -> Result<T> {
        let arg = self.next_raw()?;
        T::from_arg(arg, &mut self.um)
    }

    /// Take the next argument in wire form.
    pub fn next_raw(&mut self) -> Result<WireArg> {
        self.args
            .next()
            .ok_or_else(|| Error::Proto("request carried too few arguments".into()))
    }

    /// Direct access to the unmarshalling context.
    pub fn unmarshal_mut(&mut self) -> &mut UnmarshalCtx {
        &mut self.um
    }

    /// Record the return value.  Every reply carries exactly one, with
    /// unit marshalling as a null.
    pub fn finish_ret<T: ToArg>(&mut self, v: T) -> Result<()> {
        let w = self.marshaller.marshal(v.to_arg())?;
        self.reply.push(w);
        Ok(())
    }

    /// Record one by-ref argument's outgoing value, in declaration
    /// order after the return value.
    pub fn push_byref<T: ToArg>(&mut self, v: T) -> Result<()> {
        let w = self.marshaller.marshal(v.to_arg())?;
        self.reply.push(w);
        Ok(())
    }

    /// Record an already-classified return value.
    pub(crate) fn finish_ret_arg(&mut self, v: ArgValue) -> Result<()> {
        let w = self.marshaller.marshal(v)?;
        self.reply.push(w);
        Ok(())
    }

    /// Record an already-encoded reply value.
    pub fn push_raw_reply(&mut self, w: WireArg) {
        self.reply.push(w);
    }

    /// Finish, yielding the reply values in wire order.
    pub(crate) fn into_reply(self) -> Vec<WireArg> {
        self.reply
    }
}

/// Declare a remote interface.
///
/// ```ignore
/// remote_interface! {
///     /// Something a server exposes.
///     pub trait Counter {
///         fn increment(&self, by: i32) -> Result<i32>;
///         fn scale(&self, value: &mut i64) -> Result<()>;
///     }
/// }
/// ```
///
/// Methods take `&self`, and return `Result<T>`.  A `&mut T` parameter
/// is a by-ref parameter: its value travels with the request, and the
/// value the servant leaves behind travels back with the reply (`T`
/// must be `Clone`).  Event subscription methods follow the
/// `add_`/`remove_` naming convention and take a
/// [`Delegate`](crate::Delegate) parameter.
#[macro_export]
macro_rules! remote_interface {
    {
        $(#[$tmeta:meta])*
        $vis:vis trait $tname:ident {
            $(
                $(#[$mmeta:meta])*
                fn $mname:ident ( &self $($params:tt)* ) -> Result<$ret:ty> ;
            )*
        }
    } => {
        $(#[$tmeta])*
        $vis trait $tname: $crate::Remotable {
            $(
                $(#[$mmeta])*
                fn $mname(&self $($params)*) -> $crate::Result<$ret>;
            )*
        }

        $crate::paste::paste! {
            /// Stand-in for a peer-owned object: every call is forwarded
            /// to the original over the connection.
            $vis struct [<$tname Proxy>] {
                /// Identity of the original plus the channel to reach it.
                handle: $crate::ProxyHandle,
            }

            impl $crate::Remotable for [<$tname Proxy>] {
                fn wire_type_name(&self) -> &'static str {
                    concat!(stringify!($tname), "Proxy")
                }
                fn iface_name(&self) -> &'static str {
                    <dyn $tname as $crate::RemoteIface>::NAME
                }
                fn cast_to(
                    self: ::std::sync::Arc<Self>,
                    iface: &str,
                ) -> Option<Box<dyn ::std::any::Any + Send + Sync>> {
                    if iface == <dyn $tname as $crate::RemoteIface>::NAME {
                        Some(Box::new(self as ::std::sync::Arc<dyn $tname>))
                    } else {
                        None
                    }
                }
                fn into_remotable(self: ::std::sync::Arc<Self>) -> ::std::sync::Arc<dyn $crate::Remotable> {
                    self
                }
            }

            impl $tname for [<$tname Proxy>] {
                $(
                    fn $mname(&self $($params)*) -> $crate::Result<$ret> {
                        #[allow(unused_mut)]
                        let mut __call = $crate::CallBuilder::new();
                        $crate::__ri_push_args!(__call ; $($params)*);
                        #[allow(unused_mut)]
                        let mut __reply = self.handle.invoke(
                            $crate::method_token(stringify!($mname)),
                            stringify!($mname),
                            __call,
                        )?;
                        let __ret: $ret = __reply.take_return()?;
                        $crate::__ri_writebacks!(__reply ; $($params)*);
                        Ok(__ret)
                    }
                )*
            }

            impl $crate::RemoteIface for dyn $tname {
                const NAME: &'static str = stringify!($tname);
                fn bind(
                    obj: ::std::sync::Arc<dyn $crate::Remotable>,
                ) -> $crate::Result<::std::sync::Arc<dyn $tname>> {
                    $crate::bind_cast(obj, Self::NAME)
                }
                fn upcast(
                    obj: ::std::sync::Arc<dyn $tname>,
                ) -> ::std::sync::Arc<dyn $crate::Remotable> {
                    obj
                }
            }

            // `ToArg`/`FromArg` for `Arc<dyn $tname>` and
            // `Vec<Arc<dyn $tname>>` come from the blanket impls over
            // `RemoteIface` in `arg.rs`, not from this macro: emitting
            // them here would implement this crate's traits for a
            // foreign `Arc`/`Vec` wrapper from whichever crate invokes
            // the macro, which the orphan rules forbid once `$tname` is
            // declared outside this crate.

            #[doc(hidden)]
            mod [<__tether_iface_ $tname:snake>] {
                use super::*;

                /// Decode, invoke, reply: one registered interface method.
                fn __invoke(
                    target: ::std::sync::Arc<dyn $crate::Remotable>,
                    method: i32,
                    ctx: &mut $crate::InvokeCtx,
                ) -> $crate::Result<()> {
                    let __target = <dyn $tname as $crate::RemoteIface>::bind(target)?;
                    match method {
                        $(
                            m if m == $crate::method_token(stringify!($mname)) => {
                                ctx.begin_method(stringify!($mname));
                                $crate::__ri_dispatch!(ctx, __target, $mname ; $($params)*)
                            }
                        )*
                        other => Err($crate::Error::ProxyManagement(format!(
                            "no method with token {} on {}",
                            other,
                            <dyn $tname as $crate::RemoteIface>::NAME,
                        ))),
                    }
                }

                /// Wrap a handle to a peer-owned object in the proxy type.
                fn __make_proxy(
                    handle: $crate::ProxyHandle,
                ) -> ::std::sync::Arc<dyn $crate::Remotable> {
                    ::std::sync::Arc::new(super::[<$tname Proxy>] { handle })
                }

                $crate::inventory::submit! {
                    $crate::IfaceEntry::new(
                        <dyn super::$tname as $crate::RemoteIface>::NAME,
                        __invoke,
                        __make_proxy,
                    )
                }
            }
        }
    };
}

/// Internal: emit the argument-pushing statements of a proxy stub,
/// classifying each parameter as by-value or by-ref (`&mut`).
#[doc(hidden)]
#[macro_export]
macro_rules! __ri_push_args {
    ($call:ident ; ) => {};
    ($call:ident ; , $($rest:tt)*) => {
        $crate::__ri_push_args!($call ; $($rest)*);
    };
    ($call:ident ; $p:ident : &mut $t:ty $(, $($rest:tt)*)?) => {
        $call.push_byref((*$p).clone());
        $crate::__ri_push_args!($call ; $($($rest)*)?);
    };
    ($call:ident ; $p:ident : $t:ty $(, $($rest:tt)*)?) => {
        $call.push($p);
        $crate::__ri_push_args!($call ; $($($rest)*)?);
    };
}

/// Internal: emit the reply write-back statements of a proxy stub; only
/// `&mut` parameters receive a value from the reply.
#[doc(hidden)]
#[macro_export]
macro_rules! __ri_writebacks {
    ($reply:ident ; ) => {};
    ($reply:ident ; , $($rest:tt)*) => {
        $crate::__ri_writebacks!($reply ; $($rest)*);
    };
    ($reply:ident ; $p:ident : &mut $t:ty $(, $($rest:tt)*)?) => {
        *$p = $reply.take_byref()?;
        $crate::__ri_writebacks!($reply ; $($($rest)*)?);
    };
    ($reply:ident ; $p:ident : $t:ty $(, $($rest:tt)*)?) => {
        $crate::__ri_writebacks!($reply ; $($($rest)*)?);
    };
}

/// Internal: emit one dispatch arm's body — decode the arguments, call
/// the real method, and record the return plus by-ref values.
#[doc(hidden)]
#[macro_export]
macro_rules! __ri_dispatch {
    ($ctx:ident, $target:ident, $m:ident ; $($params:tt)*) => {
        $crate::__ri_dispatch!(@munch $ctx $target $m [] ; $($params)*)
    };
    (@munch $ctx:ident $target:ident $m:ident [$($acc:tt)*] ; , $($rest:tt)*) => {
        $crate::__ri_dispatch!(@munch $ctx $target $m [$($acc)*] ; $($rest)*)
    };
    (@munch $ctx:ident $target:ident $m:ident [$($acc:tt)*] ; $p:ident : &mut $t:ty $(, $($rest:tt)*)?) => {
        $crate::__ri_dispatch!(@munch $ctx $target $m [$($acc)* (r $p ($t))] ; $($($rest)*)?)
    };
    (@munch $ctx:ident $target:ident $m:ident [$($acc:tt)*] ; $p:ident : $t:ty $(, $($rest:tt)*)?) => {
        $crate::__ri_dispatch!(@munch $ctx $target $m [$($acc)* (v $p ($t))] ; $($($rest)*)?)
    };
    (@munch $ctx:ident $target:ident $m:ident [$(($mode:ident $p:ident ($t:ty)))*] ; ) => {{
        $( $crate::__ri_declare!($mode $ctx $p ($t)); )*
        let __ret = $target.$m($( $crate::__ri_pass!($mode $p) ),*)?;
        $ctx.finish_ret(__ret)?;
        $( $crate::__ri_byref_out!($mode $ctx $p); )*
        Ok(())
    }};
}

/// Internal: declare one decoded argument local.
#[doc(hidden)]
#[macro_export]
macro_rules! __ri_declare {
    (r $ctx:ident $p:ident ($t:ty)) => {
        let mut $p: $t = $ctx.next_arg()?;
    };
    (v $ctx:ident $p:ident ($t:ty)) => {
        let $p: $t = $ctx.next_arg()?;
    };
}

/// Internal: pass one argument to the real method.
#[doc(hidden)]
#[macro_export]
macro_rules! __ri_pass {
    (r $p:ident) => {
        &mut $p
    };
    (v $p:ident) => {
        $p
    };
}

/// Internal: after the call, send a by-ref argument's value back.
#[doc(hidden)]
#[macro_export]
macro_rules! __ri_byref_out {
    (r $ctx:ident $p:ident) => {
        $ctx.push_byref($p)?;
    };
    (v $ctx:ident $p:ident) => {};
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::instances::InstanceMap;
    use crate::{remotable, remote_interface};
    use tether_frame::InstanceIdent;

    #[test]
    fn tokens_are_stable_and_distinct() {
        assert_eq!(method_token("echo"), method_token("echo"));
        assert_ne!(method_token("echo"), method_token("bump"));
        assert!(method_token("anything") >= 0);
    }

    // A whole interface exercised without any socket: dispatch through
    // the registered invoke function, exactly as the server would.
    remote_interface! {
        trait Doubler {
            fn double(&self, n: i32) -> Result<i32>;
            fn amend(&self, n: &mut i32, extra: String) -> Result<()>;
        }
    }

    struct DoublerImpl;
    impl Doubler for DoublerImpl {
        fn double(&self, n: i32) -> crate::Result<i32> {
            Ok(n * 2)
        }
        fn amend(&self, n: &mut i32, extra: String) -> crate::Result<()> {
            *n += extra.len() as i32;
            Ok(())
        }
    }
    remotable! { DoublerImpl: Doubler }

    fn ctx() -> InvokeCtx {
        let instances = std::sync::Arc::new(InstanceMap::new(InstanceIdent::new("t", "1")));
        InvokeCtx::new(
            Vec::new(),
            UnmarshalCtx::detached(std::sync::Arc::clone(&instances)),
            Marshaller::new(instances),
        )
    }

    fn json_arg<T: serde::Serialize>(v: &T) -> WireArg {
        WireArg::Serialized(serde_json::to_vec(v).unwrap())
    }

    #[test]
    fn registered_and_dispatchable() {
        let entry = table().lookup("Doubler").expect("Doubler not registered");
        let target: std::sync::Arc<dyn Remotable> = std::sync::Arc::new(DoublerImpl);

        let mut c = ctx();
        c.args = vec![json_arg(&21_i32)].into_iter();
        (entry.invoke)(
            std::sync::Arc::clone(&target),
            method_token("double"),
            &mut c,
        )
        .unwrap();
        let reply = c.into_reply();
        assert_eq!(reply, vec![json_arg(&42_i32)]);
    }

    #[test]
    fn byref_values_come_back_after_the_return() {
        let entry = table().lookup("Doubler").unwrap();
        let target: std::sync::Arc<dyn Remotable> = std::sync::Arc::new(DoublerImpl);

        let mut c = ctx();
        c.args = vec![json_arg(&4_i32), json_arg(&"ab")].into_iter();
        (entry.invoke)(target, method_token("amend"), &mut c).unwrap();
        let reply = c.into_reply();
        // Unit return marshals as a null, then the amended by-ref value.
        assert_eq!(reply[0], WireArg::Null);
        assert_eq!(reply[1], json_arg(&6_i32));
    }

    #[test]
    fn unknown_method_is_reported() {
        let entry = table().lookup("Doubler").unwrap();
        let target: std::sync::Arc<dyn Remotable> = std::sync::Arc::new(DoublerImpl);
        let mut c = ctx();
        let err = (entry.invoke)(target, 0x0bad_cafe, &mut c).unwrap_err();
        assert!(matches!(err, Error::ProxyManagement(_)));
    }
}
