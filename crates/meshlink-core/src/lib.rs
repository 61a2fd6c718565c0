//! Core types for the meshlink overlay.
//!
//! This crate provides the protocol primitives: endpoint identity, the wire
//! envelope and its framing, and the update record used for forwarding. It
//! has no runtime; `meshlink-node` drives these over real connections.

pub mod codec;
mod contact;
mod message;
mod update;

pub use codec::{CodecError, DecodeError, MessageCodec, MessageDecoder};
pub use contact::{Contact, ContactForm, equal, excluding, find};
pub use message::{Command, Message, UnknownCommand};
pub use update::Update;
