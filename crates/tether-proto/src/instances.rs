//! The instance map: looking objects up by id, and ids up by object.
//!
//! This map stores a strong or a weak reference per entry.  Objects this
//! process owns are held strongly, so the peer's proxies stay resolvable
//! until the peer says it has let go of them; proxies for peer-owned
//! objects are held weakly, so they can be reclaimed as soon as user
//! code drops them, and a later sweep reports the reclaimed ids.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tether_frame::{InstanceIdent, ObjectId};

use crate::Remotable;

/// Strong or weak reference to an object.
enum ObjRef {
    /// A strong reference: this process owns the original.
    Strong(Arc<dyn Remotable>),
    /// A weak reference: this is a proxy for a peer-owned object.
    Weak(Weak<dyn Remotable>),
}

impl ObjRef {
    /// Try to return a strong reference to this object, upgrading a weak
    /// reference if needed.
    ///
    /// A `None` return indicates a dangling weak reference.
    fn strong(&self) -> Option<Arc<dyn Remotable>> {
        match self {
            ObjRef::Strong(s) => Some(Arc::clone(s)),
            ObjRef::Weak(w) => Weak::upgrade(w),
        }
    }

    /// Return true if this entry's object is still reachable.
    ///
    /// Can produce false positives (if the last strong reference is
    /// dropped in another thread right after we look), but never false
    /// negatives: once the strong count hits zero, nothing can resurrect
    /// the object.
    fn is_present(&self) -> bool {
        match self {
            ObjRef::Strong(_) => true,
            ObjRef::Weak(w) => w.strong_count() > 0,
        }
    }

    /// Return true if this is a weak (proxy) entry.
    fn is_weak(&self) -> bool {
        matches!(self, ObjRef::Weak(_))
    }
}

/// The identity of an `Arc<dyn Remotable>`: its allocation address plus
/// the concrete type stored there.
///
/// Address alone is not enough: `Arc<dyn Trait>` is a fat pointer, and a
/// single type can be instantiated with multiple vtable pointers, so
/// comparing fat pointers directly gives wrong answers.  Comparing
/// (thin address, TypeId) pairs does not.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
struct TaggedAddr {
    /// The object's allocation address.
    addr: usize,
    /// The concrete type of the object at that address.
    type_id: TypeId,
}

impl TaggedAddr {
    /// The identity of the object behind `arc`.
    ///
    /// The key is captured once, at insertion, and stored in the entry:
    /// a weak entry's address stays valid after its object dies, so
    /// removal never needs to recompute it.
    fn of(arc: &Arc<dyn Remotable>) -> Self {
        TaggedAddr {
            addr: Arc::as_ptr(arc) as *const () as usize,
            type_id: (**arc).type_id(),
        }
    }
}

/// One entry in the instance map.
struct Entry {
    /// The reference itself.
    obj: ObjRef,
    /// The identity key under which `obj` is indexed in the reverse map.
    addr: TaggedAddr,
}

/// The lock-protected interior of an [`InstanceMap`].
#[derive(Default)]
struct Inner {
    /// Forward index: id to entry.
    ///
    /// Invariant: every entry at id `i` has `reverse[entry.addr] == i`.
    entries: HashMap<ObjectId, Entry>,
    /// Backwards index, for looking an id up by object identity.
    ///
    /// Invariant: every `(addr, id)` pair has `entries[id].addr == addr`.
    reverse: HashMap<TaggedAddr, ObjectId>,
}

/// A mechanism to look up remotable objects by [`ObjectId`], and the
/// owner of this process's side of the distributed-GC contract.
pub struct InstanceMap {
    /// Identity of this process; ids starting with it are locally owned.
    ident: InstanceIdent,
    /// The indexes.  One lock covers both, so they cannot drift.
    inner: Mutex<Inner>,
    /// Serial number for minted ids.  Monotonic and never reused, so an
    /// id stays unique for the whole process lifetime even after the
    /// object's address is recycled.
    next_serial: AtomicU64,
}

impl InstanceMap {
    /// Create a new, empty map for a process with the given identity.
    pub fn new(ident: InstanceIdent) -> Self {
        InstanceMap {
            ident,
            inner: Mutex::new(Inner::default()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Return the identity of this process.
    pub fn ident(&self) -> &InstanceIdent {
        &self.ident
    }

    /// Return true if `id` names an object this process owns.
    pub fn is_local(&self, id: &ObjectId) -> bool {
        id.is_owned_by(&self.ident)
    }

    /// Return the id for a locally-owned object, minting one (and
    /// recording a hard reference) if it has none yet.
    pub fn id_for(&self, obj: &Arc<dyn Remotable>) -> ObjectId {
        let addr = TaggedAddr::of(obj);
        let mut inner = self.inner.lock().expect("instance map poisoned");
        if let Some(id) = inner.reverse.get(&addr) {
            return id.clone();
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let id = ObjectId::mint(&self.ident, obj.wire_type_name(), serial);
        inner.entries.insert(
            id.clone(),
            Entry {
                obj: ObjRef::Strong(Arc::clone(obj)),
                addr,
            },
        );
        inner.reverse.insert(addr, id.clone());
        id
    }

    /// Look an object up by id.  Returns `None` if the id is unknown or
    /// its weak entry has expired.
    pub fn try_get(&self, id: &ObjectId) -> Option<Arc<dyn Remotable>> {
        let inner = self.inner.lock().expect("instance map poisoned");
        inner.entries.get(id).and_then(|e| e.obj.strong())
    }

    /// Look an id up by object identity.
    pub fn try_get_id(&self, obj: &Arc<dyn Remotable>) -> Option<ObjectId> {
        let addr = TaggedAddr::of(obj);
        let inner = self.inner.lock().expect("instance map poisoned");
        inner.reverse.get(&addr).cloned()
    }

    /// Insert (or re-insert) an object under a given id.
    ///
    /// Idempotent: re-adding the same object under the same id is a
    /// no-op.  The reference strength follows ownership: locally-owned
    /// ids get a hard reference, peer-owned ids a weak one.
    pub fn add_or_replace(&self, obj: Arc<dyn Remotable>, id: ObjectId) {
        let addr = TaggedAddr::of(&obj);
        let obj_ref = if self.is_local(&id) {
            ObjRef::Strong(obj)
        } else {
            ObjRef::Weak(Arc::downgrade(&obj))
        };
        let mut inner = self.inner.lock().expect("instance map poisoned");
        if let Some(old) = inner.entries.insert(id.clone(), Entry { obj: obj_ref, addr }) {
            inner.reverse.remove(&old.addr);
        }
        inner.reverse.insert(addr, id);
    }

    /// Drop the entry for `id`, if any.
    ///
    /// Called when the peer reports (via a gc-cleanup frame) that it no
    /// longer holds any proxy for a locally-owned object.
    pub fn remove(&self, id: &ObjectId) {
        let mut inner = self.inner.lock().expect("instance map poisoned");
        if let Some(entry) = inner.entries.remove(id) {
            inner.reverse.remove(&entry.addr);
        }
    }

    /// Scan for weak entries whose object has been dropped; remove them
    /// and return their ids, for the caller to report to the owning peer
    /// in a single gc-cleanup frame.
    pub fn sweep(&self) -> Vec<ObjectId> {
        let mut inner = self.inner.lock().expect("instance map poisoned");
        let mut dead = Vec::new();
        for (id, entry) in inner.entries.iter() {
            if entry.obj.is_weak() && !entry.obj.is_present() {
                dead.push(id.clone());
            }
        }
        for id in &dead {
            if let Some(entry) = inner.entries.remove(id) {
                inner.reverse.remove(&entry.addr);
            }
        }
        dead
    }

    /// Number of live entries (for tests and diagnostics).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("instance map poisoned").entries.len()
    }

    /// Return true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A minimal servant for exercising the map without the macros.
    struct Example(#[allow(dead_code)] String);
    impl Remotable for Example {
        fn wire_type_name(&self) -> &'static str {
            "Example"
        }
        fn iface_name(&self) -> &'static str {
            "Example"
        }
        fn cast_to(self: Arc<Self>, _iface: &str) -> Option<Box<dyn Any + Send + Sync>> {
            None
        }
        fn into_remotable(self: Arc<Self>) -> Arc<dyn Remotable> {
            self
        }
    }

    fn map() -> InstanceMap {
        InstanceMap::new(InstanceIdent::new("testhost", "1"))
    }

    fn obj(s: &str) -> Arc<dyn Remotable> {
        Arc::new(Example(s.into()))
    }

    #[test]
    fn id_for_is_stable() {
        let m = map();
        let o = obj("abcdef");
        let id1 = m.id_for(&o);
        let id2 = m.id_for(&o);
        assert_eq!(id1, id2);
        assert!(m.is_local(&id1));
        let out = m.try_get(&id1).unwrap();
        assert!(Arc::ptr_eq(&out, &o));
        assert_eq!(m.try_get_id(&o), Some(id1));
    }

    #[test]
    fn distinct_objects_distinct_ids() {
        let m = map();
        let a = obj("hello");
        let b = obj("hello");
        assert_ne!(m.id_for(&a), m.id_for(&b));
    }

    #[test]
    fn strong_and_weak() {
        let m = map();
        let local = obj("hello");
        let proxy = obj("world");
        let local_id = m.id_for(&local);
        let proxy_id = ObjectId::from("elsewhere/9/Example/1");
        m.add_or_replace(Arc::clone(&proxy), proxy_id.clone());

        assert!(m.try_get(&local_id).is_some());
        assert!(m.try_get(&proxy_id).is_some());

        // Drop every reference we hold and look again.
        drop(local);
        drop(proxy);
        // The local entry was strong, so it is still there.
        assert!(m.try_get(&local_id).is_some());
        // The proxy entry was weak, so it went away.
        assert!(m.try_get(&proxy_id).is_none());
    }

    #[test]
    fn add_or_replace_is_idempotent() {
        let m = map();
        let proxy = obj("proxy");
        let id = ObjectId::from("elsewhere/9/Example/7");
        m.add_or_replace(Arc::clone(&proxy), id.clone());
        m.add_or_replace(Arc::clone(&proxy), id.clone());
        assert_eq!(m.len(), 1);
        assert_eq!(m.try_get_id(&proxy), Some(id));
    }

    #[test]
    fn remove() {
        let m = map();
        let o = obj("hello");
        let id = m.id_for(&o);
        m.remove(&id);
        assert!(m.try_get(&id).is_none());
        assert!(m.try_get_id(&o).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn sweep_reports_dead_proxies_only() {
        let m = map();
        let local = obj("kept");
        let _local_id = m.id_for(&local);

        let live_proxy = obj("live");
        m.add_or_replace(Arc::clone(&live_proxy), ObjectId::from("peer/2/Example/1"));

        {
            let dead_proxy = obj("dead");
            m.add_or_replace(Arc::clone(&dead_proxy), ObjectId::from("peer/2/Example/2"));
        }

        let reclaimed = m.sweep();
        assert_eq!(reclaimed, vec![ObjectId::from("peer/2/Example/2")]);
        assert_eq!(m.len(), 2);

        // Sweeping again finds nothing new.
        assert!(m.sweep().is_empty());
    }
}
