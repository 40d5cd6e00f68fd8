//! The pre-frame handshake on every new socket.
//!
//! Before any frames flow, the initiator writes a fixed-size
//! authentication token (carrying the socket's role and the connection
//! identifier) and its instance identifier; the acceptor answers with a
//! success code and its own identifier.  Only after this exchange do
//! both sides know who they are talking to and what the socket is for.

use std::io::Write;
use std::net::TcpStream;

use tether_bytes::{Encodable, StreamReader, Writer};
use tether_frame::{AUTH_SUCCEEDED, AuthToken, ChannelRole, InstanceIdent};
use tracing::trace;

use crate::{Error, Result};

/// Initiator side: announce ourselves, learn who answered.
pub(crate) fn initiate(
    stream: &mut TcpStream,
    role: ChannelRole,
    ident: &InstanceIdent,
    connection_id: u32,
) -> Result<InstanceIdent> {
    let mut hello: Vec<u8> = Vec::new();
    AuthToken::new(role, connection_id).encode_onto(&mut hello)?;
    hello.write_str(ident.as_str())?;
    stream.write_all(&hello)?;
    stream.flush()?;

    let mut r = StreamReader::new(&mut *stream);
    let ack = r.take_i32()?;
    if ack != AUTH_SUCCEEDED {
        return Err(Error::Handshake(format!(
            "unexpected acknowledgement {ack:#x}"
        )));
    }
    let peer = InstanceIdent::from(r.take_str()?);
    trace!("handshake ({role:?}) accepted by {peer}");
    Ok(peer)
}

/// Acceptor side: learn who connected and for what, then acknowledge.
pub(crate) fn accept(
    stream: &mut TcpStream,
    ident: &InstanceIdent,
) -> Result<(AuthToken, InstanceIdent)> {
    let (token, peer) = {
        let mut r = StreamReader::new(&mut *stream);
        let token = AuthToken::decode_from(&mut r)?;
        let peer = InstanceIdent::from(r.take_str()?);
        (token, peer)
    };

    let mut ack: Vec<u8> = Vec::new();
    ack.write_i32(AUTH_SUCCEEDED);
    ack.write_str(ident.as_str())?;
    stream.write_all(&ack)?;
    stream.flush()?;

    trace!("accepted {:?} socket from {peer}", token.role);
    Ok((token, peer))
}
