//! Single-consumer event loop that owns the peer registry.
//!
//! Everything that can change negotiation state arrives as an [`Event`] on
//! one queue: relay envelopes, relay connectivity, link callbacks, finished
//! link operations and application requests. Each event is handled to
//! completion before the next is taken, so handlers never observe a
//! half-applied transition. Slow link work (description generation,
//! description and candidate installation) runs on the per-link driver and
//! comes back later as [`Event::Completed`].

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use mesh_proto::{IceCandidate, ParticipantId, SdpKind, SessionDescription, SignalEnvelope};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::channel::DataChannelHandler;
use crate::config::MeshConfig;
use crate::error::PeerError;
use crate::link::{LinkDriver, LinkEvent, LinkEvents, LinkOp, OpOutcome, PeerConnector};
use crate::registry::{PeerEntry, PeerRegistry, PeerSnapshot, Role, Step};

/// State of the relay connection as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
}

/// What the application gets told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Connectivity(Connectivity),
    /// The relay assigned this node an id.
    Ready { local_id: ParticipantId },
    /// Data channel to the peer is open.
    PeerConnected(ParticipantId),
    /// Transport to the peer went away without the relay announcing a departure.
    PeerDisconnected(ParticipantId),
    /// The relay announced the peer left.
    PeerLeft(ParticipantId),
    Message { from: ParticipantId, data: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub local_id: Option<ParticipantId>,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug)]
pub(crate) enum Event {
    Signal(SignalEnvelope),
    Relay(Connectivity),
    Link {
        peer: ParticipantId,
        generation: u64,
        event: LinkEvent,
    },
    Completed {
        peer: ParticipantId,
        generation: u64,
        outcome: OpOutcome,
    },
    Broadcast(Bytes),
    SendTo {
        peer: ParticipantId,
        data: Bytes,
    },
    Snapshot(oneshot::Sender<MeshSnapshot>),
    Shutdown,
}

/// Cloneable entry point into a running [`Negotiator`].
#[derive(Clone)]
pub struct NegotiatorHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl NegotiatorHandle {
    fn post(&self, event: Event) -> Result<(), PeerError> {
        self.tx.send(event).map_err(|_| PeerError::ChannelClosed)
    }

    /// Feed one envelope received from the relay.
    pub fn deliver(&self, envelope: SignalEnvelope) -> Result<(), PeerError> {
        self.post(Event::Signal(envelope))
    }

    pub fn connectivity(&self, status: Connectivity) -> Result<(), PeerError> {
        self.post(Event::Relay(status))
    }

    /// Send to every peer whose channel is open; others are skipped.
    pub fn broadcast(&self, data: impl Into<Bytes>) -> Result<(), PeerError> {
        self.post(Event::Broadcast(data.into()))
    }

    pub fn send_to(&self, peer: ParticipantId, data: impl Into<Bytes>) -> Result<(), PeerError> {
        self.post(Event::SendTo {
            peer,
            data: data.into(),
        })
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Snapshot(reply))?;
        rx.await.map_err(|_| PeerError::ChannelClosed)
    }

    /// Stops the loop after closing every peer. Later calls on any handle fail.
    pub fn shutdown(&self) {
        let _ = self.post(Event::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Negotiator {
    connector: Arc<dyn PeerConnector>,
    channel_label: String,
    ordered: bool,
    local_id: Option<ParticipantId>,
    /// Set when the relay connection drops; the next `init` starts a new session.
    relay_dropped: bool,
    registry: PeerRegistry,
    next_generation: u64,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl Negotiator {
    /// `outbound` carries envelopes for the relay; `events` carries
    /// [`MeshEvent`]s for the application.
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        config: &MeshConfig,
        outbound: mpsc::UnboundedSender<SignalEnvelope>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> (Self, NegotiatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NegotiatorHandle { tx: tx.clone() };
        let negotiator = Self {
            connector,
            channel_label: config.channel_label.clone(),
            ordered: config.ordered,
            local_id: None,
            relay_dropped: false,
            registry: PeerRegistry::new(),
            next_generation: 0,
            tx,
            rx,
            outbound,
            events,
        };
        (negotiator, handle)
    }

    pub async fn run(mut self) {
        debug!(target = "mesh::negotiator", "negotiator started");
        while let Some(event) = self.rx.recv().await {
            if self.dispatch(event).await.is_break() {
                break;
            }
        }
        let closed = self.registry.clear();
        debug!(target = "mesh::negotiator", peers = closed.len(), "negotiator stopped");
    }

    async fn dispatch(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Signal(envelope) => self.on_signal(envelope).await,
            Event::Relay(status) => {
                info!(target = "mesh::signaling", ?status, "relay connectivity changed");
                if status == Connectivity::Disconnected {
                    self.relay_dropped = true;
                }
                self.notify(MeshEvent::Connectivity(status));
            }
            Event::Link {
                peer,
                generation,
                event,
            } => self.on_link_event(peer, generation, event),
            Event::Completed {
                peer,
                generation,
                outcome,
            } => self.on_completed(peer, generation, outcome),
            Event::Broadcast(data) => self.broadcast(data),
            Event::SendTo { peer, data } => self.send_to(&peer, data),
            Event::Snapshot(reply) => {
                let _ = reply.send(MeshSnapshot {
                    local_id: self.local_id.clone(),
                    peers: self.registry.snapshot(),
                });
            }
            Event::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        trace!(target = "mesh::negotiator", kind = envelope.kind(), from = ?envelope.sender(), "signal received");
        match envelope {
            SignalEnvelope::Init { id, peers } => self.on_init(id, peers).await,
            SignalEnvelope::NewPeer { id } => self.initiate(id).await,
            SignalEnvelope::PeerLeft { id } => self.on_peer_left(id),
            SignalEnvelope::Offer { from, sdp, .. } => {
                if let Some(from) = self.admit(from, "offer").await {
                    self.on_offer(from, sdp);
                }
            }
            SignalEnvelope::Answer { from, sdp, .. } => {
                if let Some(from) = self.admit(from, "answer").await {
                    self.on_answer(from, sdp);
                }
            }
            SignalEnvelope::Ice {
                from, candidate, ..
            } => {
                if let Some(from) = self.admit(from, "ice").await {
                    self.on_ice(from, candidate);
                }
            }
        }
    }

    async fn on_init(&mut self, id: ParticipantId, peers: Vec<ParticipantId>) {
        let relay_dropped = std::mem::take(&mut self.relay_dropped);
        if let Some(previous) = self.local_id.replace(id.clone()) {
            if previous != id || relay_dropped {
                info!(target = "mesh::negotiator", %previous, current = %id, relay_dropped, "new relay session; dropping existing peers");
                for peer in self.registry.clear() {
                    self.notify(MeshEvent::PeerDisconnected(peer));
                }
            }
        }
        info!(target = "mesh::negotiator", local = %id, peers = peers.len(), "joined mesh");
        self.notify(MeshEvent::Ready { local_id: id });
        for peer in peers {
            self.initiate(peer).await;
        }
    }

    fn on_peer_left(&mut self, id: ParticipantId) {
        if self.registry.remove(&id) {
            info!(target = "mesh::negotiator", peer = %id, "peer left");
            self.notify(MeshEvent::PeerLeft(id));
        } else {
            debug!(target = "mesh::negotiator", peer = %id, "departure for unknown peer");
        }
    }

    /// Validates the sender of a peer-addressed envelope and makes sure an
    /// entry exists for it.
    async fn admit(&mut self, from: Option<ParticipantId>, kind: &str) -> Option<ParticipantId> {
        let Some(local) = self.local_id.clone() else {
            debug!(target = "mesh::negotiator", kind, "dropping envelope received before init");
            return None;
        };
        let Some(from) = from else {
            debug!(target = "mesh::negotiator", kind, "dropping envelope without sender");
            return None;
        };
        if from == local {
            debug!(target = "mesh::negotiator", kind, "dropping envelope from ourselves");
            return None;
        }
        self.initiate(from.clone()).await;
        self.registry.contains(&from).then_some(from)
    }

    /// Creates the entry and connection for `peer` unless one exists. The
    /// initiator side also creates the data channel and starts its offer.
    async fn initiate(&mut self, peer: ParticipantId) {
        let Some(local) = self.local_id.clone() else {
            debug!(target = "mesh::negotiator", %peer, "cannot initiate before init");
            return;
        };
        if peer == local || self.registry.contains(&peer) {
            return;
        }

        let role = Role::resolve(&local, &peer);
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = LinkEvents::new(peer.clone(), generation, self.tx.clone());

        let link = match self.connector.open(&local, &peer, events.clone()).await {
            Ok(link) => link,
            Err(err) => {
                warn!(target = "mesh::negotiator", %peer, error = %err, "failed to open peer connection");
                return;
            }
        };

        let mut entry = PeerEntry::new(role, generation, LinkDriver::spawn(link.clone(), events));
        if role == Role::Initiator {
            match link.create_channel(&self.channel_label, self.ordered).await {
                Ok(channel) => {
                    entry.channel = Some(DataChannelHandler::new(peer.clone(), channel));
                }
                Err(err) => {
                    warn!(target = "mesh::negotiator", %peer, error = %err, "failed to create data channel");
                }
            }
            entry.driver.push(LinkOp::CreateOffer);
        }

        info!(target = "mesh::negotiator", %peer, ?role, generation, "peer entry created");
        self.registry.insert(peer, entry);
    }

    fn on_offer(&mut self, from: ParticipantId, sdp: SessionDescription) {
        if sdp.kind != SdpKind::Offer {
            debug!(target = "mesh::negotiator", peer = %from, "offer envelope carried a non-offer description");
            return;
        }
        let Some(entry) = self.registry.get_mut(&from) else {
            return;
        };
        match entry.advance(Step::AcceptOffer) {
            Ok(_) => {
                entry.driver.push(LinkOp::AcceptOffer(sdp));
                flush_candidates(entry);
            }
            Err(err) => {
                debug!(target = "mesh::negotiator", peer = %from, error = %err, "dropping offer");
            }
        }
    }

    fn on_answer(&mut self, from: ParticipantId, sdp: SessionDescription) {
        if sdp.kind != SdpKind::Answer {
            debug!(target = "mesh::negotiator", peer = %from, "answer envelope carried a non-answer description");
            return;
        }
        let Some(entry) = self.registry.get_mut(&from) else {
            return;
        };
        match entry.advance(Step::ApplyAnswer) {
            Ok(_) => {
                entry.driver.push(LinkOp::ApplyAnswer(sdp));
                flush_candidates(entry);
            }
            Err(err) => {
                debug!(target = "mesh::negotiator", peer = %from, error = %err, "dropping answer");
            }
        }
    }

    fn on_ice(&mut self, from: ParticipantId, candidate: IceCandidate) {
        let Some(entry) = self.registry.get_mut(&from) else {
            return;
        };
        if entry.has_remote_description() {
            entry.driver.push(LinkOp::AddCandidate(candidate));
        } else {
            trace!(target = "mesh::negotiator", peer = %from, "holding candidate until remote description");
            entry.pending_candidates.push(candidate);
        }
    }

    fn on_completed(&mut self, peer: ParticipantId, generation: u64, outcome: OpOutcome) {
        if self.registry.current_mut(&peer, generation).is_none() {
            trace!(target = "mesh::negotiator", %peer, generation, "ignoring result from superseded link");
            return;
        }
        match outcome {
            OpOutcome::Offer(Ok(description)) | OpOutcome::Answer(Ok(description)) => {
                self.on_local_description(peer, generation, description);
            }
            OpOutcome::Offer(Err(err)) => {
                warn!(target = "mesh::negotiator", %peer, error = %err, "failed to create offer");
            }
            OpOutcome::Answer(Err(err)) => {
                warn!(target = "mesh::negotiator", %peer, error = %err, "failed to answer offer");
            }
            OpOutcome::AnswerApplied(Ok(())) => {
                debug!(target = "mesh::negotiator", %peer, "remote answer applied");
            }
            OpOutcome::AnswerApplied(Err(err)) => {
                warn!(target = "mesh::negotiator", %peer, error = %err, "failed to apply answer");
            }
            OpOutcome::CandidateApplied(Ok(())) => {}
            OpOutcome::CandidateApplied(Err(err)) => {
                warn!(target = "mesh::negotiator", %peer, error = %err, "failed to apply remote candidate");
            }
        }
    }

    /// Sends a freshly generated description if the entry's phase allows it.
    fn on_local_description(
        &mut self,
        peer: ParticipantId,
        generation: u64,
        description: SessionDescription,
    ) {
        let Some(entry) = self.registry.current_mut(&peer, generation) else {
            return;
        };
        let (step, envelope) = match description.kind {
            SdpKind::Offer => (
                Step::SendOffer,
                SignalEnvelope::offer(peer.clone(), description),
            ),
            SdpKind::Answer => (
                Step::SendAnswer,
                SignalEnvelope::answer(peer.clone(), description),
            ),
        };
        match entry.advance(step) {
            Ok(phase) => {
                debug!(target = "mesh::negotiator", %peer, %phase, "sending {}", envelope.kind());
                self.send_signal(envelope);
            }
            Err(err) => {
                debug!(target = "mesh::negotiator", %peer, error = %err, "discarding local description");
            }
        }
    }

    fn on_link_event(&mut self, peer: ParticipantId, generation: u64, event: LinkEvent) {
        let Some(entry) = self.registry.current_mut(&peer, generation) else {
            trace!(target = "mesh::negotiator", %peer, generation, ?event, "ignoring event from superseded link");
            return;
        };

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalEnvelope::ice(peer, candidate));
            }
            LinkEvent::StateChanged(state) => {
                debug!(target = "mesh::negotiator", %peer, ?state, "connection state changed");
                if state.is_terminal() {
                    self.registry.remove(&peer);
                    info!(target = "mesh::negotiator", %peer, ?state, "peer connection ended");
                    self.notify(MeshEvent::PeerDisconnected(peer));
                }
            }
            LinkEvent::ChannelAnnounced(link) => {
                if entry.channel.is_some() {
                    debug!(target = "mesh::negotiator", %peer, "closing unexpected extra data channel");
                    link.close();
                } else {
                    entry.channel = Some(DataChannelHandler::new(peer, link));
                }
            }
            LinkEvent::ChannelOpen => {
                let phase = entry.phase;
                let opened = match entry.channel.as_mut() {
                    Some(channel) => channel.on_open(phase),
                    None => Err(PeerError::Closed),
                };
                match opened {
                    Ok(event) => {
                        info!(target = "mesh::negotiator", %peer, "data channel open");
                        self.notify(event);
                    }
                    Err(err) => {
                        warn!(target = "mesh::negotiator", %peer, error = %err, "rejecting data channel open");
                    }
                }
            }
            LinkEvent::ChannelMessage(data) => {
                let delivered = entry
                    .channel
                    .as_ref()
                    .and_then(|channel| channel.on_message(data));
                match delivered {
                    Some(event) => self.notify(event),
                    None => {
                        debug!(target = "mesh::negotiator", %peer, "dropping message on channel that is not open");
                    }
                }
            }
            LinkEvent::ChannelClosed => {
                if let Some(channel) = entry.channel.as_mut() {
                    if channel.on_close() {
                        info!(target = "mesh::negotiator", %peer, "data channel closed");
                    }
                }
            }
        }
    }

    fn broadcast(&mut self, data: Bytes) {
        let mut sent = 0usize;
        for (_, entry) in self.registry.iter() {
            if let Some(channel) = entry.channel.as_ref() {
                if channel.send(data.clone()) {
                    sent += 1;
                }
            }
        }
        debug!(target = "mesh::negotiator", bytes = data.len(), peers = sent, "broadcast");
    }

    fn send_to(&mut self, peer: &ParticipantId, data: Bytes) {
        let sent = self
            .registry
            .get(peer)
            .and_then(|entry| entry.channel.as_ref())
            .map(|channel| channel.send(data))
            .unwrap_or(false);
        if !sent {
            debug!(target = "mesh::negotiator", %peer, "no open channel; message dropped");
        }
    }

    fn send_signal(&self, envelope: SignalEnvelope) {
        if self.outbound.send(envelope).is_err() {
            debug!(target = "mesh::negotiator", "signaling client gone; envelope dropped");
        }
    }

    fn notify(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

fn flush_candidates(entry: &mut PeerEntry) {
    for candidate in entry.pending_candidates.drain(..) {
        entry.driver.push(LinkOp::AddCandidate(candidate));
    }
}
