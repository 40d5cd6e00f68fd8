//! Object and instance identifiers.
//!
//! Every object that crosses a connection is named by an [`ObjectId`]:
//! a string of the shape `"{hostname}/{pid}/{type-name}/{serial}"`.
//! The first two segments form the [`InstanceIdent`] of the process
//! that owns the original object; peers only ever parse that prefix, so
//! the trailing segments are effectively opaque.

use tether_bytes::{Encodable, EncodeResult, Writer};

/// Identity of one process in the connected fleet: the first two
/// segments (`"{hostname}/{pid}"`) of every [`ObjectId`] it mints.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct InstanceIdent(String);

impl InstanceIdent {
    /// Construct an instance identifier from a hostname and a process tag.
    ///
    /// The tag is normally the numeric process id, but tests that host
    /// both endpoints inside one process substitute a distinct string.
    pub fn new(hostname: &str, process_tag: &str) -> Self {
        InstanceIdent(format!("{}/{}", hostname, process_tag))
    }

    /// Return this identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return a 32-bit fingerprint of this identifier.
    ///
    /// Used as the connection identifier in the authentication token, so
    /// an acceptor can match a reverse socket to its primary connection.
    pub fn fingerprint(&self) -> u32 {
        fnv1a(self.0.as_bytes())
    }
}

impl From<String> for InstanceIdent {
    fn from(s: String) -> Self {
        InstanceIdent(s)
    }
}

impl std::fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// 32-bit FNV-1a over a byte string.
///
/// Only ever compared against values computed by this same code, so the
/// exact function does not matter beyond being deterministic.
pub const fn fnv1a(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        h ^= bytes[i] as u32;
        h = h.wrapping_mul(0x0100_0193);
        i += 1;
    }
    h
}

/// Globally unique, stable identity of one object.
///
/// Minted by the process that owns the original object, and stable for
/// the object's entire lifetime there.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Mint an id for an object owned by `ident`.
    ///
    /// `serial` must be unique within the owning process for as long as
    /// the process lives; a monotonic counter satisfies that, while an
    /// address-derived hash would not (addresses are reused).
    pub fn mint(ident: &InstanceIdent, type_name: &str, serial: u64) -> Self {
        ObjectId(format!("{}/{}/{}", ident.as_str(), type_name, serial))
    }

    /// Return this id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return true if the object this id names is owned by `ident`.
    pub fn is_owned_by(&self, ident: &InstanceIdent) -> bool {
        // Match a whole segment prefix: "host/12" must not claim ids
        // minted by "host/123".
        self.0
            .strip_prefix(ident.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Return the type-name segment of this id, if the id is well formed.
    pub fn type_name(&self) -> Option<&str> {
        let mut it = self.0.split('/');
        let _host = it.next()?;
        let _pid = it.next()?;
        it.next()
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        ObjectId(s)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        ObjectId(s.to_owned())
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Encodable for ObjectId {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minting() {
        let ident = InstanceIdent::new("calliope", "4242");
        let id = ObjectId::mint(&ident, "Greeter", 7);
        assert_eq!(id.as_str(), "calliope/4242/Greeter/7");
        assert_eq!(id.type_name(), Some("Greeter"));
        assert!(id.is_owned_by(&ident));
    }

    #[test]
    fn ownership_is_segment_exact() {
        let short = InstanceIdent::new("host", "12");
        let long = InstanceIdent::new("host", "123");
        let id = ObjectId::mint(&long, "Widget", 1);
        assert!(id.is_owned_by(&long));
        assert!(!id.is_owned_by(&short));
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = InstanceIdent::new("host", "1");
        let b = InstanceIdent::new("host", "1");
        let c = InstanceIdent::new("host", "2");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
