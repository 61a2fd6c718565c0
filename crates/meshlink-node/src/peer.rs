//! One established connection and everything remembered about its remote end.

use crate::quorum::RoundId;
use crate::transport::{ConnId, Link};
use meshlink_core::{Command, Contact, Message, Update};
use serde_json::Value;
use std::collections::VecDeque;

/// A received message and how many times it has been offered for forwarding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueuedMessage {
    pub message: Message,
    pub resends: u32,
}

/// Limits for [`Peer::get_updates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Times a message is offered before it is dropped from the log.
    pub max_resends: u32,
    /// Messages returned per call.
    pub max_updates: usize,
}

/// What the node does when an armed one-shot listener fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reaction {
    RemoteHandshake,
    HandshakeResponse,
    DisconnectRequest,
    DisconnectResponse,
}

/// Where a connection is in its lifecycle, from this node's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Our request is out; waiting for the remote's request.
    AwaitingRemoteRequest,
    /// We accepted the remote's request; waiting for its verdict on ours.
    AwaitingRemoteResponse { remote: Contact },
    /// Both sides accepted; our connect round is running.
    Joining,
    /// Committed to the membership list.
    Member,
    /// We asked it to disconnect.
    Leaving,
    /// It asked us to disconnect; waiting for it to close the transport.
    Departing,
    /// One side refused the handshake.
    Rejected,
}

pub(crate) type Fired = (Reaction, Option<Value>);

/// What a node remembers about one of its peers.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerView {
    pub contact: Contact,
    /// Last state the peer pushed.
    pub state: Value,
    /// Last membership list exchanged with the peer, without the peer itself.
    pub peers: Vec<Contact>,
}

pub(crate) struct Peer {
    id: ConnId,
    link: Option<Link>,
    log: VecDeque<QueuedMessage>,
    contact: Option<Contact>,
    state: Value,
    peers: Vec<Contact>,
    listeners: Vec<(Command, Reaction)>,
    /// Rounds this peer owes a `respondPeers` for, oldest first.
    rounds: VecDeque<RoundId>,
    pub phase: Phase,
}

impl Peer {
    pub fn new(id: ConnId, link: Link) -> Self {
        Self {
            id,
            link: Some(link),
            log: VecDeque::new(),
            contact: None,
            state: Value::Object(Default::default()),
            peers: Vec::new(),
            listeners: Vec::new(),
            rounds: VecDeque::new(),
            phase: Phase::AwaitingRemoteRequest,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn contact(&self) -> Option<&Contact> {
        self.contact.as_ref()
    }

    pub fn set_contact(&mut self, contact: Contact) {
        self.contact = Some(contact);
    }

    /// Contact if known, connection id otherwise. For logs.
    pub fn label(&self) -> String {
        match &self.contact {
            Some(contact) => contact.to_string(),
            None => self.id.to_string(),
        }
    }

    pub fn view(&self) -> Option<PeerView> {
        Some(PeerView {
            contact: self.contact.clone()?,
            state: self.state.clone(),
            peers: self.peers.clone(),
        })
    }

    pub fn peers(&self) -> &[Contact] {
        &self.peers
    }

    /// Cache a membership list. A peer never lists itself.
    pub fn set_peers(&mut self, peers: Vec<Contact>) {
        self.peers = match &self.contact {
            Some(own) => meshlink_core::excluding(&peers, own),
            None => peers,
        };
    }

    /// Encode and hand to the writer. Returns `false` once the link is closed.
    pub fn send(&self, message: Message) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        tracing::debug!(peer = %self.label(), cmd = %message.cmd, "send");
        link.send(message)
    }

    pub fn request_handshake(&self, local: &Contact) -> bool {
        self.send(Message::with_data(
            Command::RequestHandshake.as_str(),
            contact_value(local),
        ))
    }

    pub fn respond_handshake(&self, accept: bool) -> bool {
        self.send(Message::with_data(
            Command::RespondHandshake.as_str(),
            Value::Bool(accept),
        ))
    }

    /// Push a membership list and remember it as this peer's view.
    pub fn request_peers(&mut self, peers: Vec<Contact>) -> bool {
        let data = Value::Array(peers.iter().map(contact_value).collect());
        self.set_peers(peers);
        self.send(Message::with_data(Command::RequestPeers.as_str(), data))
    }

    pub fn respond_peers(&self) -> bool {
        self.send(Command::RespondPeers.into())
    }

    pub fn request_disconnect(&self) -> bool {
        self.send(Command::RequestDisconnect.into())
    }

    pub fn respond_disconnect(&self) -> bool {
        self.send(Command::RespondDisconnect.into())
    }

    pub fn update_state(&self, state: &Value) -> bool {
        self.send(Message::with_data(Command::UpdateState.as_str(), state.clone()))
    }

    /// Overwrite the cached remote state. Last write wins.
    pub fn handle_update_state(&mut self, state: Value) {
        self.state = state;
    }

    /// Log an inbound message and fire the listeners armed for its command.
    pub fn receive(&mut self, message: Message) -> Vec<Fired> {
        let data = message.data.clone();
        let cmd = message.cmd.clone();
        self.log.push_back(QueuedMessage {
            message,
            resends: 0,
        });

        let mut fired = Vec::new();
        self.listeners.retain(|(armed, reaction)| {
            if armed.as_str() == cmd {
                fired.push((*reaction, data.clone()));
                false
            } else {
                true
            }
        });
        fired
    }

    /// Fire `reaction` against a `cmd` already in the log, or arm it for the
    /// next one.
    ///
    /// On a hit the data is returned for the caller to dispatch later; the
    /// listener is not armed.
    pub fn once_before(&mut self, cmd: Command, reaction: Reaction) -> Option<Option<Value>> {
        if let Some(queued) = self.log.iter().find(|q| q.message.cmd == cmd.as_str()) {
            return Some(queued.message.data.clone());
        }
        self.listeners.push((cmd, reaction));
        None
    }

    #[cfg(test)]
    pub fn is_armed(&self, cmd: Command) -> bool {
        self.listeners.iter().any(|(armed, _)| *armed == cmd)
    }

    /// Offer the oldest logged messages for forwarding.
    ///
    /// Each returned entry has its resend count bumped; entries that reach
    /// `max_resends` are dropped, the rest stay at the front of the log.
    pub fn get_updates(&mut self, options: UpdateOptions) -> Vec<Update> {
        let Some(contact) = self.contact.clone() else {
            return Vec::new();
        };
        let taken = options.max_updates.min(self.log.len());

        let mut updates = Vec::with_capacity(taken);
        for queued in self.log.iter_mut().take(taken) {
            queued.resends += 1;
            updates.push(Update::new(&contact, &queued.message));
        }

        let mut index = 0;
        self.log.retain(|queued| {
            let keep = index >= taken || queued.resends < options.max_resends;
            index += 1;
            keep
        });
        updates
    }

    #[cfg(test)]
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn owe_round(&mut self, round: RoundId) {
        self.rounds.push_back(round);
    }

    /// The round a `respondPeers` from this peer acknowledges.
    pub fn settle_round(&mut self) -> Option<RoundId> {
        self.rounds.pop_front()
    }

    /// Stop reading and let the writer flush what is queued, then shut down.
    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            tracing::debug!(peer = %self.label(), "closing connection");
            link.close();
        }
    }
}

fn contact_value(contact: &Contact) -> Value {
    serde_json::json!({ "host": contact.host(), "port": contact.port() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn peer() -> (Peer, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peer = Peer::new(ConnId::from(1), Link::detached(tx));
        peer.set_contact(Contact::new("localhost", 22222));
        (peer, rx)
    }

    fn msg(n: u64) -> Message {
        Message::with_data("updateState", json!({ "n": n }))
    }

    #[test]
    fn typed_senders() {
        let (mut peer, mut rx) = peer();
        peer.request_handshake(&Contact::new("localhost", 22222));
        peer.respond_handshake(false);
        peer.request_peers(vec![Contact::new("a", 1)]);
        peer.respond_peers();
        peer.request_disconnect();
        peer.respond_disconnect();
        peer.update_state(&json!({ "a": 1 }));

        let sent: Vec<Value> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| serde_json::to_value(m).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                json!({ "cmd": "requestHandshake", "data": { "host": "localhost", "port": 22222 } }),
                json!({ "cmd": "respondHandshake", "data": false }),
                json!({ "cmd": "requestPeers", "data": [{ "host": "a", "port": 1 }] }),
                json!({ "cmd": "respondPeers" }),
                json!({ "cmd": "requestDisconnect" }),
                json!({ "cmd": "respondDisconnect" }),
                json!({ "cmd": "updateState", "data": { "a": 1 } }),
            ]
        );
    }

    #[test]
    fn peers_exclude_self() {
        let (mut peer, _rx) = peer();
        peer.set_peers(vec![
            Contact::new("localhost", 22222),
            Contact::new("localhost", 22223),
        ]);
        assert_eq!(peer.peers(), &[Contact::new("localhost", 22223)]);
    }

    #[test]
    fn receive_logs_and_fires_listener_once() {
        let (mut peer, _rx) = peer();
        assert_eq!(
            peer.once_before(Command::RespondHandshake, Reaction::HandshakeResponse),
            None
        );
        assert!(peer.is_armed(Command::RespondHandshake));

        let fired = peer.receive(Message::with_data("respondHandshake", json!(true)));
        assert_eq!(fired, vec![(Reaction::HandshakeResponse, Some(json!(true)))]);
        assert!(!peer.is_armed(Command::RespondHandshake));

        assert!(peer.receive(Message::with_data("respondHandshake", json!(true))).is_empty());
        assert_eq!(peer.log_len(), 2);
    }

    #[test]
    fn once_before_catches_earlier_message() {
        let (mut peer, _rx) = peer();
        assert!(peer.receive(Message::new("respondDisconnect")).is_empty());
        assert_eq!(
            peer.once_before(Command::RespondDisconnect, Reaction::DisconnectResponse),
            Some(None)
        );
        assert!(!peer.is_armed(Command::RespondDisconnect));
    }

    #[test]
    fn updates_are_dropped_at_resend_cap() {
        let (mut peer, _rx) = peer();
        for n in 0..4 {
            peer.receive(msg(n));
        }
        let options = UpdateOptions {
            max_resends: 1,
            max_updates: 2,
        };

        let first = peer.get_updates(options);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].data, Some(json!({ "n": 0 })));
        assert_eq!(first[1].data, Some(json!({ "n": 1 })));
        assert_eq!(first[0].peer, Contact::new("localhost", 22222));

        let second = peer.get_updates(options);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].data, Some(json!({ "n": 2 })));
        assert_eq!(second[1].data, Some(json!({ "n": 3 })));

        assert!(peer.get_updates(options).is_empty());
    }

    #[test]
    fn updates_under_cap_are_offered_again() {
        let (mut peer, _rx) = peer();
        for n in 0..3 {
            peer.receive(msg(n));
        }
        let options = UpdateOptions {
            max_resends: 2,
            max_updates: 2,
        };

        let first = peer.get_updates(options);
        assert_eq!(first.len(), 2);
        assert_eq!(peer.log_len(), 3);

        // same two again, now at the cap
        let second = peer.get_updates(options);
        assert_eq!(second, first);
        assert_eq!(peer.log_len(), 1);

        let third = peer.get_updates(options);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].data, Some(json!({ "n": 2 })));
    }

    #[test]
    fn round_acknowledgements_are_fifo() {
        let (mut peer, _rx) = peer();
        peer.owe_round(RoundId::from(3));
        peer.owe_round(RoundId::from(4));
        assert_eq!(peer.settle_round(), Some(RoundId::from(3)));
        assert_eq!(peer.settle_round(), Some(RoundId::from(4)));
        assert_eq!(peer.settle_round(), None);
    }

    #[test]
    fn closed_peer_stops_sending() {
        let (mut peer, mut rx) = peer();
        peer.close();
        assert!(!peer.respond_peers());
        assert!(rx.try_recv().is_err());
    }
}
