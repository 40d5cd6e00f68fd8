//! Well-known services and remote construction.
//!
//! A server exposes two ways for a fresh client to get its first object:
//! asking for a *service* (a singleton registered by name) or asking the
//! server to *construct* an instance of a registered type.  Everything
//! after that flows from method calls on the references these return.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::iface::InvokeCtx;
use crate::{Error, Remotable, Result};

/// A registered constructor: decodes its arguments from the request and
/// returns a fresh servant.
pub type Factory = Box<dyn Fn(&mut InvokeCtx) -> Result<Arc<dyn Remotable>> + Send + Sync>;

/// The table of well-known services and constructible types.
#[derive(Default)]
pub struct ServiceMap {
    /// Singleton services by wire name.
    services: Mutex<HashMap<String, Arc<dyn Remotable>>>,
    /// Constructors by wire type name.
    factories: Mutex<HashMap<String, Factory>>,
}

impl ServiceMap {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton service under a wire name.
    ///
    /// Typically called as
    /// `register_service(<dyn MyIface>::NAME, my_impl)`.
    pub fn register_service(&self, name: &str, obj: Arc<dyn Remotable>) {
        self.services
            .lock()
            .expect("services poisoned")
            .insert(name.to_owned(), obj);
    }

    /// Register a constructor for a wire type name.
    pub fn register_factory(
        &self,
        name: &str,
        f: impl Fn(&mut InvokeCtx) -> Result<Arc<dyn Remotable>> + Send + Sync + 'static,
    ) {
        self.factories
            .lock()
            .expect("factories poisoned")
            .insert(name.to_owned(), Box::new(f));
    }

    /// Look a service up by name.
    pub(crate) fn get(&self, name: &str) -> Result<Arc<dyn Remotable>> {
        self.services
            .lock()
            .expect("services poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProxyManagement(format!("no service registered as {name:?}")))
    }

    /// Construct an instance of a registered type, decoding constructor
    /// arguments from `ctx`.
    pub(crate) fn construct(&self, name: &str, ctx: &mut InvokeCtx) -> Result<Arc<dyn Remotable>> {
        let factories = self.factories.lock().expect("factories poisoned");
        let f = factories
            .get(name)
            .ok_or_else(|| Error::ProxyManagement(format!("no constructor registered for {name:?}")))?;
        f(ctx)
    }
}
