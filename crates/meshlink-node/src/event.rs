//! Notifications published by a running node.

use crate::MeshError;
use meshlink_core::Contact;
use serde_json::Value;
use std::sync::Arc;

/// Something the embedding application may want to react to.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer was committed to the membership list.
    Connected(Contact),
    /// A peer left the membership list.
    Disconnected(Contact),
    /// A peer pushed new application state.
    StateUpdated { peer: Contact, state: Value },
    /// A peer pushed a new membership list (already self-filtered).
    PeersReceived { peer: Contact, peers: Vec<Contact> },
    /// A message was appended to a peer's log. `peer` is `None` until the
    /// connection's handshake has named it.
    Message {
        peer: Option<Contact>,
        cmd: String,
        data: Option<Value>,
    },
    /// A protocol, precondition or transport failure. The node keeps running.
    Error(Arc<MeshError>),
}
