//! Error types for the mesh node.

use meshlink_core::{CodecError, Command, Contact, DecodeError};
use thiserror::Error;

/// Errors surfaced by a mesh node.
///
/// Most of these never cross an API call: they are published as
/// [`NodeEvent::Error`](crate::NodeEvent::Error) from inside the node.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("protocol violation: expected {expected}, got {got}")]
    ProtocolViolation { expected: String, got: String },

    #[error("unexpected {cmd} from {from}")]
    UnexpectedCommand { cmd: Command, from: String },

    #[error("unknown command {cmd:?} from {from}")]
    UnknownCommand { cmd: String, from: String },

    #[error("malformed {cmd} payload: {reason}")]
    MalformedPayload { cmd: Command, reason: String },

    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("already connected to {0}")]
    AlreadyConnected(Contact),

    #[error("refusing to connect to own contact {0}")]
    SelfConnection(Contact),

    #[error("not connected to {0}")]
    NotConnected(Contact),

    #[error("handshake rejected by {0}")]
    HandshakeRejected(Contact),

    #[error("connect to {contact}: {source}")]
    Connect {
        contact: Contact,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing: {0}")]
    Codec(#[from] CodecError),

    #[error("node has stopped")]
    Stopped,
}
