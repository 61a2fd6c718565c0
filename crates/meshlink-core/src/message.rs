//! Protocol messages.
//!
//! The envelope is deliberately loose (`cmd` is a plain string, `data` any
//! JSON value) so the codec never interprets application commands. The
//! [`Command`] catalogue is what the mesh itself speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Wire envelope: `{"cmd": .., "data"?: ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    /// A message with no payload.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            data: None,
        }
    }

    /// A message carrying `data`.
    pub fn with_data(cmd: impl Into<String>, data: Value) -> Self {
        Self {
            cmd: cmd.into(),
            data: Some(data),
        }
    }

    /// Parse `cmd` against the mesh catalogue.
    pub fn command(&self) -> Result<Command, UnknownCommand> {
        self.cmd.parse()
    }
}

impl From<Command> for Message {
    fn from(cmd: Command) -> Self {
        Self::new(cmd.as_str())
    }
}

/// Commands exchanged between mesh nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Initiator's contact.
    RequestHandshake,
    /// Boolean accept/reject.
    RespondHandshake,
    /// New full membership list.
    RequestPeers,
    RespondPeers,
    RequestDisconnect,
    RespondDisconnect,
    /// Opaque application state.
    UpdateState,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::RequestHandshake,
        Command::RespondHandshake,
        Command::RequestPeers,
        Command::RespondPeers,
        Command::RequestDisconnect,
        Command::RespondDisconnect,
        Command::UpdateState,
    ];

    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::RequestHandshake => "requestHandshake",
            Command::RespondHandshake => "respondHandshake",
            Command::RequestPeers => "requestPeers",
            Command::RespondPeers => "respondPeers",
            Command::RequestDisconnect => "requestDisconnect",
            Command::RespondDisconnect => "respondDisconnect",
            Command::UpdateState => "updateState",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// A `cmd` outside the mesh catalogue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);
