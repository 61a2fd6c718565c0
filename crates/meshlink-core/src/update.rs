//! Queued traffic annotated with where it came from.

use crate::{Contact, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A received message paired with the contact of the peer that sent it,
/// ready to be forwarded onward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub peer: Contact,
}

impl Update {
    pub fn new(peer: impl Into<Contact>, message: &Message) -> Self {
        Self {
            cmd: message.cmd.clone(),
            data: message.data.clone(),
            peer: peer.into(),
        }
    }
}
