//! Mesh node runtime.
//!
//! A [`Server`] listens for connections, dials peers, and keeps every
//! connected node agreeing on who is in the mesh: a membership change is only
//! committed once every existing peer has acknowledged the new list. Local
//! state is broadcast to peers last-write-wins.
//!
//! ```no_run
//! use meshlink_node::{NodeEvent, Server, ServerConfig};
//!
//! # async fn example() -> Result<(), meshlink_node::MeshError> {
//! let server = Server::bind(ServerConfig::new(4000)).await?;
//! let mut events = server.subscribe();
//! server.connect_peer("localhost:4001")?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::Connected(peer) = event {
//!         println!("joined {peer}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod event;
mod node;
mod peer;
mod quorum;
mod server;
mod transport;

pub use config::ServerConfig;
pub use error::MeshError;
pub use event::NodeEvent;
pub use peer::{PeerView, UpdateOptions};
pub use server::Server;

pub use meshlink_core::{Contact, Update};
