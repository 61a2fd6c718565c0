//! The node task.
//!
//! One task per node owns the membership list, every connection's [`Peer`],
//! and all rounds in flight. Everything else talks to it through channels:
//! the [`Server`](crate::Server) handle sends [`Request`]s, connection tasks
//! send [`Inbound`] traffic, and the node publishes [`NodeEvent`]s.

use crate::peer::{Fired, Peer, PeerView, Phase, Reaction, UpdateOptions};
use crate::quorum::{Commit, Round, RoundId, Rounds};
use crate::transport::{self, ConnId, Inbound};
use crate::{MeshError, NodeEvent};
use meshlink_core::{CodecError, Command, Contact, DecodeError, Message, Update};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Operations requested through the [`Server`](crate::Server) handle.
pub(crate) enum Request {
    Connect(Contact),
    Disconnect(Contact),
    UpdateState(Value),
    Peers(oneshot::Sender<Vec<Contact>>),
    Peer(Contact, oneshot::Sender<Option<PeerView>>),
    State(oneshot::Sender<Value>),
    Updates(UpdateOptions, oneshot::Sender<Vec<Update>>),
}

pub(crate) struct Node {
    contact: Contact,
    state: Value,
    /// Committed peers in commit order.
    members: Vec<ConnId>,
    conns: HashMap<ConnId, Peer>,
    dialing: HashSet<Contact>,
    rounds: Rounds,
    deferred: VecDeque<(ConnId, Fired)>,
    next_conn: u64,
    events: broadcast::Sender<NodeEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl Node {
    pub fn new(
        contact: Contact,
        state: Value,
        events: broadcast::Sender<NodeEvent>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            contact,
            state,
            members: Vec::new(),
            conns: HashMap::new(),
            dialing: HashSet::new(),
            rounds: Rounds::default(),
            deferred: VecDeque::new(),
            next_conn: 0,
            events,
            inbound,
        }
    }

    pub async fn run(
        mut self,
        listener: TcpListener,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(contact = %self.contact, "node listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "accepted connection");
                        self.attach(stream, None);
                    }
                    Err(e) => self.fail(MeshError::Io(e)),
                },

                Some(request) = requests.recv() => self.handle_request(request),

                Some(traffic) = inbound.recv() => self.handle_inbound(traffic),
            }
            self.drain_deferred();
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.rounds.is_empty() {
            tracing::warn!(rounds = self.rounds.len(), "stopping with rounds in flight");
        }
        for (_, mut peer) in self.conns.drain() {
            peer.close();
        }
        self.members.clear();
        tracing::info!(contact = %self.contact, "node stopped");
    }

    fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail(&self, error: MeshError) {
        tracing::warn!(contact = %self.contact, error = %error, "mesh error");
        self.emit(NodeEvent::Error(Arc::new(error)));
    }

    // ------------------------------------------------------------------
    // Requests

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect(contact) => self.connect_peer(contact),
            Request::Disconnect(contact) => self.disconnect_peer(contact),
            Request::UpdateState(state) => self.update_state(state),
            Request::Peers(reply) => {
                let _ = reply.send(self.member_contacts(&self.members));
            }
            Request::Peer(contact, reply) => {
                let view = self
                    .member(&contact)
                    .and_then(|conn| self.conns.get(&conn))
                    .and_then(Peer::view);
                let _ = reply.send(view);
            }
            Request::State(reply) => {
                let _ = reply.send(self.state.clone());
            }
            Request::Updates(options, reply) => {
                let mut updates = Vec::new();
                for conn in &self.members {
                    if let Some(peer) = self.conns.get_mut(conn) {
                        updates.extend(peer.get_updates(options));
                    }
                }
                let _ = reply.send(updates);
            }
        }
    }

    fn connect_peer(&mut self, contact: Contact) {
        if contact == self.contact {
            return self.fail(MeshError::SelfConnection(contact));
        }
        let known = self.conns.values().any(|peer| {
            peer.phase != Phase::Rejected && peer.contact() == Some(&contact)
        });
        if known || self.dialing.contains(&contact) {
            return self.fail(MeshError::AlreadyConnected(contact));
        }

        tracing::debug!(peer = %contact, "dialing");
        self.dialing.insert(contact.clone());
        transport::dial(contact, self.inbound.clone());
    }

    fn disconnect_peer(&mut self, contact: Contact) {
        let Some(conn) = self.member(&contact) else {
            return self.fail(MeshError::NotConnected(contact));
        };
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        if peer.phase != Phase::Member {
            tracing::debug!(peer = %contact, phase = ?peer.phase, "already leaving");
            return;
        }

        tracing::info!(peer = %contact, "requesting disconnect");
        peer.phase = Phase::Leaving;
        peer.request_disconnect();
        self.arm(conn, Command::RespondDisconnect, Reaction::DisconnectResponse);
    }

    fn update_state(&mut self, state: Value) {
        for conn in &self.members {
            if let Some(peer) = self.conns.get(conn) {
                peer.update_state(&state);
            }
        }
        self.state = state;
    }

    // ------------------------------------------------------------------
    // Connection traffic

    fn handle_inbound(&mut self, traffic: Inbound) {
        match traffic {
            Inbound::Frame { conn, frame } => self.handle_frame(conn, frame),
            Inbound::Closed { conn, error } => self.handle_closed(conn, error),
            Inbound::Dialed { contact, result } => {
                self.dialing.remove(&contact);
                match result {
                    Ok(stream) => self.attach(stream, Some(contact)),
                    Err(source) => self.fail(MeshError::Connect { contact, source }),
                }
            }
        }
    }

    /// Wrap a fresh connection and open our side of the handshake.
    fn attach(&mut self, stream: TcpStream, dialed: Option<Contact>) {
        let conn = ConnId::from(self.next_conn);
        self.next_conn += 1;

        let link = transport::spawn(stream, conn, self.inbound.clone());
        let mut peer = Peer::new(conn, link);
        if let Some(contact) = dialed {
            peer.set_contact(contact);
        }
        peer.request_handshake(&self.contact);
        self.conns.insert(conn, peer);
        self.arm(conn, Command::RequestHandshake, Reaction::RemoteHandshake);
    }

    fn handle_frame(&mut self, conn: ConnId, frame: Result<Message, DecodeError>) {
        let message = match frame {
            Ok(message) => message,
            Err(e) => return self.fail(MeshError::Decode(e)),
        };
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        if peer.phase == Phase::Rejected {
            tracing::debug!(peer = %peer.label(), cmd = %message.cmd, "ignoring traffic after rejection");
            return;
        }

        tracing::debug!(peer = %peer.label(), cmd = %message.cmd, "received");
        let cmd = message.cmd.clone();
        let data = message.data.clone();
        let fired = peer.receive(message);
        let sender = peer.contact().cloned();
        self.emit(NodeEvent::Message {
            peer: sender,
            cmd: cmd.clone(),
            data: data.clone(),
        });

        if !fired.is_empty() {
            for (reaction, data) in fired {
                self.react(conn, reaction, data);
            }
            return;
        }
        self.handle_unsolicited(conn, cmd, data);
    }

    /// Commands with no armed listener: the always-on handlers.
    fn handle_unsolicited(&mut self, conn: ConnId, cmd: String, data: Option<Value>) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        let from = peer.label();

        match peer.phase {
            Phase::AwaitingRemoteRequest => {
                peer.respond_handshake(false);
                peer.phase = Phase::Rejected;
                return self.fail(MeshError::ProtocolViolation {
                    expected: Command::RequestHandshake.to_string(),
                    got: cmd,
                });
            }
            Phase::AwaitingRemoteResponse { .. } => {
                return self.fail(MeshError::ProtocolViolation {
                    expected: Command::RespondHandshake.to_string(),
                    got: cmd,
                });
            }
            _ => {}
        }

        let command = match cmd.parse::<Command>() {
            Ok(command) => command,
            Err(_) => return self.fail(MeshError::UnknownCommand { cmd, from }),
        };

        match command {
            Command::RequestPeers => self.handle_request_peers(conn, data),
            Command::RespondPeers => self.handle_respond_peers(conn),
            Command::UpdateState => {
                let state = data.unwrap_or(Value::Null);
                peer.handle_update_state(state.clone());
                let contact = peer.contact().cloned();
                if let Some(contact) = contact {
                    self.emit(NodeEvent::StateUpdated {
                        peer: contact,
                        state,
                    });
                }
            }
            Command::RequestDisconnect if peer.phase == Phase::Joining => {
                // stays in the log; the listener armed at commit picks it up
                tracing::debug!(peer = %from, "disconnect requested before commit");
            }
            other => self.fail(MeshError::UnexpectedCommand { cmd: other, from }),
        }
    }

    fn handle_request_peers(&mut self, conn: ConnId, data: Option<Value>) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        let parsed = data
            .map(serde_json::from_value::<Vec<Contact>>)
            .unwrap_or_else(|| Ok(Vec::new()));
        // reply regardless so the sender's round can complete
        peer.respond_peers();

        match parsed {
            Ok(list) => {
                peer.set_peers(list);
                let event = peer.contact().cloned().map(|contact| NodeEvent::PeersReceived {
                    peer: contact,
                    peers: peer.peers().to_vec(),
                });
                if let Some(event) = event {
                    self.emit(event);
                }
            }
            Err(e) => self.fail(MeshError::MalformedPayload {
                cmd: Command::RequestPeers,
                reason: e.to_string(),
            }),
        }
    }

    fn handle_respond_peers(&mut self, conn: ConnId) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        let Some(round) = peer.settle_round() else {
            let from = peer.label();
            return self.fail(MeshError::UnexpectedCommand {
                cmd: Command::RespondPeers,
                from,
            });
        };
        if let Some(commit) = self.rounds.acknowledge(round, conn) {
            self.commit(commit);
        }
    }

    fn handle_closed(&mut self, conn: ConnId, error: Option<CodecError>) {
        let Some(mut peer) = self.conns.remove(&conn) else {
            return;
        };
        peer.close();
        match error {
            // a reset is just another way to hang up
            Some(CodecError::Io(e)) => {
                tracing::debug!(peer = %peer.label(), error = %e, "read failed")
            }
            Some(e) => self.fail(MeshError::Codec(e)),
            None => {}
        }

        let was_member = self.members.contains(&conn);
        self.members.retain(|member| *member != conn);
        for commit in self.rounds.forget(conn) {
            self.commit(commit);
        }

        match (was_member, peer.contact().cloned()) {
            (true, Some(contact)) => {
                if peer.phase == Phase::Departing {
                    tracing::info!(peer = %contact, "peer departed");
                } else {
                    tracing::warn!(peer = %contact, "connection to peer lost");
                }
                self.emit(NodeEvent::Disconnected(contact));
            }
            _ => tracing::debug!(peer = %peer.label(), "connection closed before commit"),
        }
    }

    // ------------------------------------------------------------------
    // One-shot listeners

    /// Arm `reaction` on `conn`, or queue it if the command already arrived.
    fn arm(&mut self, conn: ConnId, cmd: Command, reaction: Reaction) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        if let Some(data) = peer.once_before(cmd, reaction) {
            self.deferred.push_back((conn, (reaction, data)));
        }
    }

    fn drain_deferred(&mut self) {
        while let Some((conn, (reaction, data))) = self.deferred.pop_front() {
            self.react(conn, reaction, data);
        }
    }

    fn react(&mut self, conn: ConnId, reaction: Reaction, data: Option<Value>) {
        match reaction {
            Reaction::RemoteHandshake => self.on_remote_handshake(conn, data),
            Reaction::HandshakeResponse => self.on_handshake_response(conn, data),
            Reaction::DisconnectRequest => self.on_disconnect_request(conn),
            Reaction::DisconnectResponse => self.on_disconnect_response(conn),
        }
    }

    // ------------------------------------------------------------------
    // Handshake

    fn on_remote_handshake(&mut self, conn: ConnId, data: Option<Value>) {
        let remote = data.map(serde_json::from_value::<Contact>);
        let verdict = match remote {
            Some(Ok(remote)) if remote == self.contact => Err(MeshError::SelfConnection(remote)),
            Some(Ok(remote)) if self.claimed(&remote, conn) => {
                Err(MeshError::AlreadyConnected(remote))
            }
            Some(Ok(remote)) => Ok(remote),
            Some(Err(e)) => Err(MeshError::MalformedPayload {
                cmd: Command::RequestHandshake,
                reason: e.to_string(),
            }),
            None => Err(MeshError::MalformedPayload {
                cmd: Command::RequestHandshake,
                reason: "missing contact".to_string(),
            }),
        };

        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        match verdict {
            Ok(remote) => {
                tracing::debug!(peer = %remote, "accepting handshake");
                peer.respond_handshake(true);
                peer.phase = Phase::AwaitingRemoteResponse { remote };
                self.arm(conn, Command::RespondHandshake, Reaction::HandshakeResponse);
            }
            Err(error) => {
                peer.respond_handshake(false);
                peer.phase = Phase::Rejected;
                self.fail(error);
            }
        }
    }

    fn on_handshake_response(&mut self, conn: ConnId, data: Option<Value>) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        let Phase::AwaitingRemoteResponse { remote } = peer.phase.clone() else {
            return;
        };
        let accepted = match data {
            Some(Value::Bool(accepted)) => accepted,
            other => {
                return self.fail(MeshError::MalformedPayload {
                    cmd: Command::RespondHandshake,
                    reason: format!("expected a boolean, got {other:?}"),
                });
            }
        };

        if !accepted {
            self.abandon(conn);
            return self.fail(MeshError::HandshakeRejected(remote));
        }
        if self.claimed(&remote, conn) {
            self.abandon(conn);
            return self.fail(MeshError::AlreadyConnected(remote));
        }

        if let Some(peer) = self.conns.get_mut(&conn) {
            peer.set_contact(remote);
            peer.phase = Phase::Joining;
        }
        self.begin_connect(conn);
    }

    /// Drop a connection that never joined.
    fn abandon(&mut self, conn: ConnId) {
        if let Some(mut peer) = self.conns.remove(&conn) {
            peer.close();
        }
    }

    // ------------------------------------------------------------------
    // Membership propagation

    fn begin_connect(&mut self, conn: ConnId) {
        if self.members.is_empty() {
            return self.finish_connect(conn);
        }
        let Some(joining) = self.conns.get(&conn).and_then(|p| p.contact().cloned()) else {
            return;
        };

        let mut list = self.member_contacts(&self.members);
        list.push(joining.clone());
        let expected = self.members.clone();
        let round = self.rounds.open(Commit::Connect(conn), expected.iter().copied());
        self.broadcast_peers(&expected, &list, round);
        tracing::info!(
            peer = %joining,
            %round,
            awaiting = self.rounds.get(round).map_or(0, Round::outstanding),
            "propagating new member"
        );
    }

    fn finish_connect(&mut self, conn: ConnId) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            tracing::debug!(%conn, "joining peer went away before commit");
            return;
        };
        if peer.phase != Phase::Joining {
            return;
        }
        peer.phase = Phase::Member;
        let contact = peer.contact().cloned();

        self.arm(conn, Command::RequestDisconnect, Reaction::DisconnectRequest);
        self.members.push(conn);
        if let Some(contact) = contact {
            tracing::info!(peer = %contact, members = self.members.len(), "peer connected");
            self.emit(NodeEvent::Connected(contact));
        }
    }

    fn on_disconnect_request(&mut self, conn: ConnId) {
        let Some(peer) = self.conns.get_mut(&conn) else {
            return;
        };
        tracing::info!(peer = %peer.label(), "peer asked to disconnect");
        peer.phase = Phase::Departing;
        peer.respond_disconnect();
    }

    fn on_disconnect_response(&mut self, conn: ConnId) {
        let remaining: Vec<ConnId> = self
            .members
            .iter()
            .copied()
            .filter(|member| *member != conn)
            .collect();
        if remaining.is_empty() {
            return self.finish_disconnect(conn);
        }

        let list = self.member_contacts(&remaining);
        let expected = self.members.clone();
        let round = self.rounds.open(Commit::Disconnect(conn), expected.iter().copied());
        self.broadcast_peers(&expected, &list, round);
        tracing::info!(
            %conn,
            %round,
            awaiting = self.rounds.get(round).map_or(0, Round::outstanding),
            "propagating departure"
        );
    }

    fn finish_disconnect(&mut self, conn: ConnId) {
        let Some(mut peer) = self.conns.remove(&conn) else {
            return;
        };
        peer.close();
        self.members.retain(|member| *member != conn);
        for commit in self.rounds.forget(conn) {
            self.commit(commit);
        }

        if let Some(contact) = peer.contact().cloned() {
            tracing::info!(peer = %contact, members = self.members.len(), "peer disconnected");
            self.emit(NodeEvent::Disconnected(contact));
        }
    }

    fn commit(&mut self, commit: Commit) {
        match commit {
            Commit::Connect(conn) => self.finish_connect(conn),
            Commit::Disconnect(conn) => self.finish_disconnect(conn),
        }
    }

    fn broadcast_peers(&mut self, to: &[ConnId], list: &[Contact], round: RoundId) {
        for conn in to {
            if let Some(peer) = self.conns.get_mut(conn) {
                peer.request_peers(list.to_vec());
                peer.owe_round(round);
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookups

    fn member_contacts(&self, conns: &[ConnId]) -> Vec<Contact> {
        conns
            .iter()
            .filter_map(|conn| self.conns.get(conn))
            .filter_map(|peer| peer.contact().cloned())
            .collect()
    }

    fn member(&self, contact: &Contact) -> Option<ConnId> {
        let contacts = self.member_contacts(&self.members);
        let found = meshlink_core::find(&contacts, contact)?;
        self.members
            .iter()
            .copied()
            .find(|conn| self.conns.get(conn).and_then(Peer::contact) == Some(found))
    }

    /// Whether another connection already holds `contact` past the handshake.
    fn claimed(&self, contact: &Contact, except: ConnId) -> bool {
        self.conns.values().any(|peer| {
            peer.id() != except
                && matches!(
                    peer.phase,
                    Phase::Joining | Phase::Member | Phase::Leaving | Phase::Departing
                )
                && peer.contact() == Some(contact)
        })
    }
}
