//! Frame and argument type codes.

use caret::caret_int;

caret_int! {
    /// A MsgKind is the function code of a frame header.  The value of the
    /// MsgKind indicates the meaning of the frame, and therefore the typed
    /// fields that follow the header.
    pub struct MsgKind(i32) {
        /// Invoke a method on a remote instance.
        METHOD_CALL = 1,
        /// Successful reply to an invocation: a tagged return value
        /// followed by the by-ref arguments, in declaration order.
        METHOD_REPLY = 2,
        /// Construct a remote instance with explicit constructor arguments.
        CREATE_INSTANCE = 3,
        /// Construct a remote instance using its default constructor.
        CREATE_INSTANCE_DEFAULT = 4,
        /// Ask the peer for a reference to a well-known service.
        REQUEST_SERVICE_REFERENCE = 5,
        /// Failed reply to an invocation: a serialized fault record.
        EXCEPTION_RETURN = 6,
        /// Tell the peer which pre-accepted companion socket carries our
        /// callbacks.
        OPEN_REVERSE_CHANNEL = 7,
        /// The client is going away; tear down its callback channel.
        CLIENT_DISCONNECTING = 8,
        /// A list of object ids the sender no longer holds proxies for.
        GC_CLEANUP = 9,
        /// Hint naming a client code unit, so the server can warm its type
        /// lookups.  Best-effort only.
        LOAD_CLIENT_ASSEMBLY = 10,
        /// The server is shutting down; all pending calls will fail.
        SERVER_SHUTTING_DOWN = 11,
        /// Ask the server process to terminate.
        SHUTDOWN_SERVER = 12,
    }
}

caret_int! {
    /// An ArgTag introduces one tagged argument value on the wire and
    /// selects the payload layout that follows it.
    pub struct ArgTag(i32) {
        /// No value.
        NULL_POINTER = 0,
        /// An opaque, length-prefixed serialized payload.
        SERIALIZED_ITEM = 1,
        /// An object identity: the receiver resolves it to the original
        /// object or to a proxy standing in for it.
        REMOTE_REFERENCE = 2,
        /// A type descriptor, carried by name.
        INSTANCE_OF_SYSTEM_TYPE = 3,
        /// An array of type descriptors.
        ARRAY_OF_SYSTEM_TYPE = 4,
        /// A list-like container whose elements are tagged recursively.
        CONTAINER_TYPE = 5,
        /// A network address in text form.
        IP_ADDRESS = 6,
        /// A bound method reference: a callback target plus method token.
        METHOD_POINTER = 7,
    }
}

impl MsgKind {
    /// Return true if this frame kind is a control frame, handled inline
    /// by the dispatcher's reader rather than dispatched to a worker.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MsgKind::OPEN_REVERSE_CHANNEL
                | MsgKind::CLIENT_DISCONNECTING
                | MsgKind::GC_CLEANUP
                | MsgKind::LOAD_CLIENT_ASSEMBLY
                | MsgKind::SHUTDOWN_SERVER
        )
    }

    /// Return true if this frame kind is a reply to an earlier request.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MsgKind::METHOD_REPLY | MsgKind::EXCEPTION_RETURN | MsgKind::SERVER_SHUTTING_DOWN
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(i32::from(MsgKind::METHOD_CALL), 1);
        assert_eq!(MsgKind::from(9), MsgKind::GC_CLEANUP);
        assert_eq!(format!("{}", MsgKind::METHOD_REPLY), "METHOD_REPLY");
        // Unknown codes are representable; they surface as protocol errors
        // at a higher layer.
        let odd = MsgKind::from(77);
        assert!(!odd.is_recognized());
        assert_eq!(format!("{}", odd), "77");
    }

    #[test]
    fn classification() {
        assert!(MsgKind::GC_CLEANUP.is_control());
        assert!(!MsgKind::METHOD_CALL.is_control());
        assert!(MsgKind::EXCEPTION_RETURN.is_reply());
        assert!(!MsgKind::OPEN_REVERSE_CHANNEL.is_reply());
    }

    #[test]
    fn arg_tags() {
        assert_eq!(i32::from(ArgTag::NULL_POINTER), 0);
        assert_eq!(ArgTag::from(7), ArgTag::METHOD_POINTER);
        assert!(!ArgTag::from(8).is_recognized());
    }
}
