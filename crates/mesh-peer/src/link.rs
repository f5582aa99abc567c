//! Seam between the negotiator and whatever actually moves bytes between
//! two participants.
//!
//! [`PeerConnector`] opens one [`PeerLink`] per remote participant. The link
//! reports what happens to it through [`LinkEvents`], which lands on the
//! negotiator's queue tagged with the peer and the entry generation it was
//! opened for.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_proto::{IceCandidate, ParticipantId, SessionDescription};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::PeerError;
use crate::negotiator::Event;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Initiator side only. The responder learns about the channel through
    /// [`LinkEvent::ChannelAnnounced`].
    async fn create_channel(&self, label: &str, ordered: bool)
        -> Result<Arc<dyn DataLink>, PeerError>;

    /// Generates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Installs the remote offer, then generates and installs the answer.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self);
}

pub trait DataLink: Send + Sync {
    fn send(&self, data: Bytes) -> Result<(), PeerError>;
    fn close(&self);
}

/// Transport-level connection state, collapsed from whatever the link reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the entry is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    ChannelAnnounced(Arc<dyn DataLink>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            LinkEvent::ChannelAnnounced(_) => f.write_str("ChannelAnnounced"),
            LinkEvent::ChannelOpen => f.write_str("ChannelOpen"),
            LinkEvent::ChannelMessage(data) => {
                f.debug_tuple("ChannelMessage").field(&data.len()).finish()
            }
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Handle a link uses to report back to the negotiator.
#[derive(Clone)]
pub struct LinkEvents {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl LinkEvents {
    pub(crate) fn new(peer: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Silently dropped once the negotiator has stopped.
    pub fn emit(&self, event: LinkEvent) {
        trace!(target = "mesh::rtc", peer = %self.peer, generation = self.generation, ?event, "link event");
        let _ = self.tx.send(Event::Link {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }

    fn complete(&self, outcome: OpOutcome) {
        let _ = self.tx.send(Event::Completed {
            peer: self.peer.clone(),
            generation: self.generation,
            outcome,
        });
    }
}

/// Work queued against one link, executed strictly in order.
#[derive(Debug)]
pub(crate) enum LinkOp {
    CreateOffer,
    AcceptOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Result of a [`LinkOp`], delivered back to the negotiator as its own event.
#[derive(Debug)]
pub(crate) enum OpOutcome {
    Offer(Result<SessionDescription, PeerError>),
    Answer(Result<SessionDescription, PeerError>),
    AnswerApplied(Result<(), PeerError>),
    CandidateApplied(Result<(), PeerError>),
}

/// Per-link worker queue. Keeps remote descriptions ahead of the candidates
/// that follow them on the relay.
pub(crate) struct LinkDriver {
    ops: mpsc::UnboundedSender<LinkOp>,
}

impl LinkDriver {
    pub(crate) fn spawn(link: Arc<dyn PeerLink>, events: LinkEvents) -> Self {
        let (ops, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let outcome = match op {
                    LinkOp::CreateOffer => OpOutcome::Offer(link.create_offer().await),
                    LinkOp::AcceptOffer(offer) => OpOutcome::Answer(link.accept_offer(offer).await),
                    LinkOp::ApplyAnswer(answer) => {
                        OpOutcome::AnswerApplied(link.accept_answer(answer).await)
                    }
                    LinkOp::AddCandidate(candidate) => {
                        OpOutcome::CandidateApplied(link.add_candidate(candidate).await)
                    }
                    LinkOp::Close => break,
                };
                events.complete(outcome);
            }
            link.close().await;
            trace!(target = "mesh::rtc", peer = %events.peer(), generation = events.generation(), "link driver stopped");
        });
        Self { ops }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<LinkOp>) {
        let (ops, rx) = mpsc::unbounded_channel();
        (Self { ops }, rx)
    }

    pub(crate) fn push(&self, op: LinkOp) {
        let _ = self.ops.send(op);
    }

    pub(crate) fn close(&self) {
        self.push(LinkOp::Close);
    }
}
