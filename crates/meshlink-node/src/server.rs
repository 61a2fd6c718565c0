//! Handle to a running mesh node.

use crate::node::{Node, Request};
use crate::{MeshError, NodeEvent, PeerView, ServerConfig, UpdateOptions};
use meshlink_core::{Contact, Update};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A local mesh node.
///
/// Binding spawns the node task; this handle only enqueues requests for it.
/// Operations that can fail for protocol reasons (already connected, not
/// connected, rejected handshakes) report through [`NodeEvent::Error`]; the
/// `Result`s returned here only fail once the node has stopped.
///
/// Dropping the handle stops the node.
pub struct Server {
    contact: Contact,
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<NodeEvent>,
    shutdown: CancellationToken,
}

impl Server {
    /// Listen on `config.host:config.port` and start the node.
    pub async fn bind(config: ServerConfig) -> Result<Self, MeshError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let contact = Contact::new(config.host, port);

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let node = Node::new(contact.clone(), config.state, events.clone(), inbound);
        tokio::spawn(node.run(listener, requests_rx, inbound_rx, shutdown.clone()));

        Ok(Self {
            contact,
            requests,
            events,
            shutdown,
        })
    }

    /// The contact this node advertises in handshakes.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Receive events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Dial `info`, handshake, and propagate the new membership.
    pub fn connect_peer(&self, info: impl Into<Contact>) -> Result<(), MeshError> {
        self.request(Request::Connect(info.into()))
    }

    /// Ask `info` to leave and propagate the shrunken membership.
    pub fn disconnect_peer(&self, info: impl Into<Contact>) -> Result<(), MeshError> {
        self.request(Request::Disconnect(info.into()))
    }

    /// Replace local state and push it to every peer. No acknowledgement.
    pub fn update_state(&self, state: Value) -> Result<(), MeshError> {
        self.request(Request::UpdateState(state))
    }

    /// Committed peers, in the order they joined.
    pub async fn peers(&self) -> Result<Vec<Contact>, MeshError> {
        self.query(Request::Peers).await
    }

    /// What this node remembers about the committed peer `info`.
    pub async fn peer(&self, info: impl Into<Contact>) -> Result<Option<PeerView>, MeshError> {
        let contact = info.into();
        self.query(|reply| Request::Peer(contact, reply)).await
    }

    /// Local state.
    pub async fn state(&self) -> Result<Value, MeshError> {
        self.query(Request::State).await
    }

    /// Queued traffic from every committed peer, subject to the resend cap.
    ///
    /// This is the only thing that trims peer logs: every message a peer
    /// sends stays queued until it has been offered `max_resends` times, so a
    /// long-running node should call this periodically even if it forwards
    /// nothing.
    pub async fn updates(&self, options: UpdateOptions) -> Result<Vec<Update>, MeshError> {
        self.query(|reply| Request::Updates(options, reply)).await
    }

    /// Stop listening and close every connection.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn request(&self, request: Request) -> Result<(), MeshError> {
        self.requests.send(request).map_err(|_| MeshError::Stopped)
    }

    async fn query<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, MeshError> {
        let (reply, response) = oneshot::channel();
        self.request(request(reply))?;
        response.await.map_err(|_| MeshError::Stopped)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
