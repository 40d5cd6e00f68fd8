//! Frame headers, frame bodies, and the tagged-argument codec.
//!
//! A frame is a [`Header`] followed by fields determined by its
//! [`MsgKind`].  Invocation frames carry a [`RequestPrefix`] and then a
//! run of tagged arguments; each tagged argument is self-describing, so
//! a reader can consume it without knowing the method being invoked.

use std::io::Read;

use tether_bytes::{Encodable, EncodeResult, StreamReader, Writer};

use crate::{ArgTag, Error, MsgKind, ObjectId, Result};

/// Deepest container nesting we will decode.
///
/// Containers recurse; without a bound a malicious peer could overflow
/// the decoder's stack with a few hundred bytes.
const MAX_NESTING: usize = 32;

/// The fixed header that begins every frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// What this frame means, and therefore what follows the header.
    pub kind: MsgKind,
    /// Correlates a request with its reply.  Replies may arrive in any
    /// order; this number is the only correlation between them.
    pub seq: u32,
}

impl Header {
    /// Construct a new header.
    pub fn new(kind: MsgKind, seq: u32) -> Self {
        Header { kind, seq }
    }

    /// Decode a header from the stream.
    pub fn decode_from<R: Read>(r: &mut StreamReader<R>) -> Result<Self> {
        let kind = MsgKind::from(r.take_i32()?);
        let seq = r.take_u32()?;
        Ok(Header { kind, seq })
    }
}

impl Encodable for Header {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_i32(self.kind.into());
        w.write_u32(self.seq);
        Ok(())
    }
}

/// One tagged argument value, in wire form.
///
/// This is the decoded-but-untyped representation: object references
/// are still ids, serialized payloads are still bytes.  The marshalling
/// layer converts between this and live values.
#[derive(Clone, Debug, PartialEq)]
pub enum WireArg {
    /// No value.
    Null,
    /// An opaque serialized payload.
    Serialized(Vec<u8>),
    /// A reference to an object owned by one of the two endpoints.
    ///
    /// `type_name` is the interface the receiver should expose for it; it
    /// is empty when the receiver is the owner and already knows the
    /// object.
    RemoteRef {
        /// The object's identity.
        id: ObjectId,
        /// Interface name, or empty for "you already know it".
        type_name: String,
    },
    /// A type descriptor, by name.
    TypeToken(String),
    /// An array of type descriptors.  Empty slots are empty strings.
    TypeTokenArray(Vec<String>),
    /// A list-like container of tagged elements.
    Container {
        /// Name of the container shape (for diagnostics only).
        container: String,
        /// Interface name of the element type.
        element: String,
        /// The elements, each classified recursively.
        items: Vec<WireArg>,
    },
    /// A network address in text form.
    Address(String),
    /// A bound method reference.
    MethodPointer {
        /// Id of the object the method is bound to.
        target: ObjectId,
        /// Separate id for the delegate itself, so a later removal can
        /// name the same registration.
        delegate: ObjectId,
        /// Interface declaring the pointed-to method.
        iface: String,
        /// Token of the pointed-to method.
        method: i32,
    },
}

impl WireArg {
    /// Return the tag this value encodes as.
    pub fn tag(&self) -> ArgTag {
        match self {
            WireArg::Null => ArgTag::NULL_POINTER,
            WireArg::Serialized(_) => ArgTag::SERIALIZED_ITEM,
            WireArg::RemoteRef { .. } => ArgTag::REMOTE_REFERENCE,
            WireArg::TypeToken(_) => ArgTag::INSTANCE_OF_SYSTEM_TYPE,
            WireArg::TypeTokenArray(_) => ArgTag::ARRAY_OF_SYSTEM_TYPE,
            WireArg::Container { .. } => ArgTag::CONTAINER_TYPE,
            WireArg::Address(_) => ArgTag::IP_ADDRESS,
            WireArg::MethodPointer { .. } => ArgTag::METHOD_POINTER,
        }
    }

    /// Decode one tagged argument from the stream.
    pub fn decode_from<R: Read>(r: &mut StreamReader<R>) -> Result<Self> {
        Self::decode_at_depth(r, 0)
    }

    /// Decode one tagged argument, tracking container nesting.
    fn decode_at_depth<R: Read>(r: &mut StreamReader<R>, depth: usize) -> Result<Self> {
        if depth > MAX_NESTING {
            return Err(Error::BadFrame("container nesting too deep"));
        }
        let tag = ArgTag::from(r.take_i32()?);
        Ok(match tag {
            ArgTag::NULL_POINTER => WireArg::Null,
            ArgTag::SERIALIZED_ITEM => WireArg::Serialized(r.take_blob()?),
            ArgTag::REMOTE_REFERENCE => {
                let id = ObjectId::from(r.take_str()?);
                let type_name = r.take_str()?;
                WireArg::RemoteRef { id, type_name }
            }
            ArgTag::INSTANCE_OF_SYSTEM_TYPE => WireArg::TypeToken(r.take_str()?),
            ArgTag::ARRAY_OF_SYSTEM_TYPE => {
                let n = r.take_i32()?;
                let n = usize::try_from(n)
                    .map_err(|_| Error::BadFrame("negative type-array length"))?;
                let mut names = Vec::with_capacity(n.min(64));
                for _ in 0..n {
                    names.push(r.take_str()?);
                }
                WireArg::TypeTokenArray(names)
            }
            ArgTag::CONTAINER_TYPE => {
                let container = r.take_str()?;
                let element = r.take_str()?;
                let mut items = Vec::new();
                // Elements are framed as (1, element)* 0: there is no
                // count up front.
                loop {
                    match r.take_u8()? {
                        0 => break,
                        1 => items.push(Self::decode_at_depth(r, depth + 1)?),
                        _ => return Err(Error::BadFrame("bad container separator")),
                    }
                }
                WireArg::Container {
                    container,
                    element,
                    items,
                }
            }
            ArgTag::IP_ADDRESS => WireArg::Address(r.take_str()?),
            ArgTag::METHOD_POINTER => {
                let target = ObjectId::from(r.take_str()?);
                let delegate = ObjectId::from(r.take_str()?);
                let iface = r.take_str()?;
                let method = r.take_i32()?;
                WireArg::MethodPointer {
                    target,
                    delegate,
                    iface,
                    method,
                }
            }
            other => return Err(Error::UnknownArgTag(other.into())),
        })
    }
}

impl Encodable for WireArg {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_i32(self.tag().into());
        match self {
            WireArg::Null => {}
            WireArg::Serialized(bytes) => w.write_blob(bytes)?,
            WireArg::RemoteRef { id, type_name } => {
                w.write_str(id.as_str())?;
                w.write_str(type_name)?;
            }
            WireArg::TypeToken(name) => w.write_str(name)?,
            WireArg::TypeTokenArray(names) => {
                w.write_i32(names.len() as i32);
                for name in names {
                    w.write_str(name)?;
                }
            }
            WireArg::Container {
                container,
                element,
                items,
            } => {
                w.write_str(container)?;
                w.write_str(element)?;
                for item in items {
                    w.write_u8(1);
                    item.encode_onto(w)?;
                }
                w.write_u8(0);
            }
            WireArg::Address(text) => w.write_str(text)?,
            WireArg::MethodPointer {
                target,
                delegate,
                iface,
                method,
            } => {
                w.write_str(target.as_str())?;
                w.write_str(delegate.as_str())?;
                w.write_str(iface)?;
                w.write_i32(*method);
            }
        }
        Ok(())
    }
}

/// The fields every invocation frame carries between its header and its
/// tagged arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPrefix {
    /// Id of the instance to invoke on.  Empty for manual invocations
    /// (constructions and service requests), which target a type rather
    /// than an instance.
    pub instance_id: String,
    /// Name of the interface declaring the method; for manual
    /// invocations, the type being constructed or looked up.
    pub declaring_type: String,
    /// Token of the method to invoke.
    pub method: i32,
    /// Type names of generic arguments.  Always empty for this
    /// implementation's stubs, but tolerated on read.
    pub generic_args: Vec<String>,
    /// Number of tagged arguments that follow.
    pub n_args: u32,
}

impl RequestPrefix {
    /// Decode a request prefix from the stream.
    pub fn decode_from<R: Read>(r: &mut StreamReader<R>) -> Result<Self> {
        let instance_id = r.take_str()?;
        let declaring_type = r.take_str()?;
        let method = r.take_i32()?;
        let n_generic = r.take_i32()?;
        let n_generic =
            usize::try_from(n_generic).map_err(|_| Error::BadFrame("negative generic count"))?;
        let mut generic_args = Vec::with_capacity(n_generic.min(16));
        for _ in 0..n_generic {
            generic_args.push(r.take_str()?);
        }
        let n_args = r.take_i32()?;
        let n_args = u32::try_from(n_args).map_err(|_| Error::BadFrame("negative arg count"))?;
        Ok(RequestPrefix {
            instance_id,
            declaring_type,
            method,
            generic_args,
            n_args,
        })
    }
}

impl Encodable for RequestPrefix {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_str(&self.instance_id)?;
        w.write_str(&self.declaring_type)?;
        w.write_i32(self.method);
        w.write_i32(self.generic_args.len() as i32);
        for g in &self.generic_args {
            w.write_str(g)?;
        }
        w.write_i32(self.n_args as i32);
        Ok(())
    }
}

/// Body of an `OPEN_REVERSE_CHANNEL` frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenReverseChannel {
    /// Address the initiator connected from, in text form.
    pub initiator_addr: String,
    /// Port the initiator connected from.
    pub initiator_port: u16,
    /// The initiator's instance identifier.
    pub initiator_instance: String,
    /// Fingerprint matching the reverse socket's authentication token.
    pub connection_id: u32,
}

impl OpenReverseChannel {
    /// Decode an open-reverse-channel body from the stream.
    pub fn decode_from<R: Read>(r: &mut StreamReader<R>) -> Result<Self> {
        let initiator_addr = r.take_str()?;
        let initiator_port = r.take_u16()?;
        let initiator_instance = r.take_str()?;
        let connection_id = r.take_u32()?;
        Ok(OpenReverseChannel {
            initiator_addr,
            initiator_port,
            initiator_instance,
            connection_id,
        })
    }
}

impl Encodable for OpenReverseChannel {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_str(&self.initiator_addr)?;
        w.write_u16(self.initiator_port);
        w.write_str(&self.initiator_instance)?;
        w.write_u32(self.connection_id);
        Ok(())
    }
}

/// Body of a `GC_CLEANUP` frame: the ids the sender has stopped holding
/// proxies for, all in one frame per sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcCleanup {
    /// The reclaimed ids.
    pub ids: Vec<ObjectId>,
}

impl GcCleanup {
    /// Decode a gc-cleanup body from the stream.
    pub fn decode_from<R: Read>(r: &mut StreamReader<R>) -> Result<Self> {
        let n = r.take_i32()?;
        let n = usize::try_from(n).map_err(|_| Error::BadFrame("negative id count"))?;
        let mut ids = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            ids.push(ObjectId::from(r.take_str()?));
        }
        Ok(GcCleanup { ids })
    }
}

impl Encodable for GcCleanup {
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_i32(self.ids.len() as i32);
        for id in &self.ids {
            w.write_str(id.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn round_trip_arg(arg: &WireArg) -> WireArg {
        let bytes = arg.to_vec().unwrap();
        let mut r = StreamReader::new(&bytes[..]);
        let out = WireArg::decode_from(&mut r).unwrap();
        assert!(r.into_inner().is_empty(), "arg not fully consumed");
        out
    }

    #[test]
    fn header() {
        let h = Header::new(MsgKind::METHOD_CALL, 77);
        let bytes = h.to_vec().unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 77, 0, 0, 0]);
        let mut r = StreamReader::new(&bytes[..]);
        assert_eq!(Header::decode_from(&mut r).unwrap(), h);
    }

    #[test]
    fn args_round_trip() {
        let args = [
            WireArg::Null,
            WireArg::Serialized(vec![1, 2, 3]),
            WireArg::RemoteRef {
                id: ObjectId::from("h/1/Widget/4"),
                type_name: "Widget".into(),
            },
            WireArg::RemoteRef {
                id: ObjectId::from("h/1/Widget/4"),
                type_name: String::new(),
            },
            WireArg::TypeToken("Widget".into()),
            WireArg::TypeTokenArray(vec!["A".into(), String::new(), "C".into()]),
            WireArg::Address("192.0.2.7".into()),
            WireArg::MethodPointer {
                target: ObjectId::from("h/1/Sink/9"),
                delegate: ObjectId::from("h/1/Delegate/10"),
                iface: "Sink".into(),
                method: 0x1234,
            },
        ];
        for arg in &args {
            assert_eq!(&round_trip_arg(arg), arg);
        }
    }

    #[test]
    fn container_round_trip() {
        let arg = WireArg::Container {
            container: "Vec".into(),
            element: "Widget".into(),
            items: vec![
                WireArg::RemoteRef {
                    id: ObjectId::from("h/1/Widget/1"),
                    type_name: "Widget".into(),
                },
                WireArg::Null,
            ],
        };
        assert_eq!(round_trip_arg(&arg), arg);
    }

    #[test]
    fn nesting_bound() {
        // A container-of-container chain deeper than MAX_NESTING must be
        // rejected rather than recursing without limit.
        let mut bytes: Vec<u8> = Vec::new();
        for _ in 0..(MAX_NESTING + 2) {
            bytes.write_i32(ArgTag::CONTAINER_TYPE.into());
            bytes.write_str("Vec").unwrap();
            bytes.write_str("X").unwrap();
            bytes.write_u8(1);
        }
        let mut r = StreamReader::new(&bytes[..]);
        assert!(matches!(
            WireArg::decode_from(&mut r),
            Err(Error::BadFrame(_))
        ));
    }

    #[test]
    fn unknown_tag() {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.write_i32(99);
        let mut r = StreamReader::new(&bytes[..]);
        assert!(matches!(
            WireArg::decode_from(&mut r),
            Err(Error::UnknownArgTag(99))
        ));
    }

    #[test]
    fn request_prefix_round_trip() {
        let p = RequestPrefix {
            instance_id: "h/1/Widget/4".into(),
            declaring_type: "Widget".into(),
            method: -12345,
            generic_args: vec![],
            n_args: 3,
        };
        let bytes = p.to_vec().unwrap();
        let mut r = StreamReader::new(&bytes[..]);
        assert_eq!(RequestPrefix::decode_from(&mut r).unwrap(), p);
    }

    #[test]
    fn control_bodies_round_trip() {
        let orc = OpenReverseChannel {
            initiator_addr: "127.0.0.1".into(),
            initiator_port: 40123,
            initiator_instance: "h/77".into(),
            connection_id: 0xdead_beef,
        };
        let bytes = orc.to_vec().unwrap();
        let mut r = StreamReader::new(&bytes[..]);
        assert_eq!(OpenReverseChannel::decode_from(&mut r).unwrap(), orc);

        let gc = GcCleanup {
            ids: vec![ObjectId::from("h/1/A/1"), ObjectId::from("h/1/B/2")],
        };
        let bytes = gc.to_vec().unwrap();
        let mut r = StreamReader::new(&bytes[..]);
        assert_eq!(GcCleanup::decode_from(&mut r).unwrap(), gc);
    }
}
