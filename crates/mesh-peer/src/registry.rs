//! Local bookkeeping for every remote participant this node negotiates with.
//!
//! The registry is owned by the negotiator loop and never shared; all
//! mutation happens inside one dispatch step at a time.

use std::collections::HashMap;
use std::fmt;

use mesh_proto::{IceCandidate, ParticipantId};

use crate::channel::DataChannelHandler;
use crate::error::PeerError;
use crate::link::LinkDriver;

/// Which side of a pair produces the offer. Fixed for the life of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The participant whose id sorts first initiates; both sides agree
    /// without exchanging anything.
    pub fn resolve(local: &ParticipantId, remote: &ParticipantId) -> Role {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    OfferSent,
    /// Responder has taken the remote offer and is producing its answer.
    Answered,
    Stable,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::OfferSent => "offer-sent",
            Phase::Answered => "answered",
            Phase::Stable => "stable",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something that happened to a negotiation and may move its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SendOffer,
    AcceptOffer,
    ApplyAnswer,
    SendAnswer,
    Close,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::SendOffer => "send-offer",
            Step::AcceptOffer => "accept-offer",
            Step::ApplyAnswer => "apply-answer",
            Step::SendAnswer => "send-answer",
            Step::Close => "close",
        };
        f.write_str(name)
    }
}

impl Phase {
    /// Permitted moves:
    ///
    /// ```text
    /// idle      --send-offer-->   offer-sent
    /// idle      --accept-offer--> answered
    /// offer-sent --apply-answer--> stable
    /// answered  --send-answer-->  stable
    /// *         --close-->        closed   (except from closed)
    /// ```
    pub fn advance(self, step: Step) -> Result<Phase, PeerError> {
        let next = match (self, step) {
            (Phase::Idle, Step::SendOffer) => Phase::OfferSent,
            (Phase::Idle, Step::AcceptOffer) => Phase::Answered,
            (Phase::OfferSent, Step::ApplyAnswer) => Phase::Stable,
            (Phase::Answered, Step::SendAnswer) => Phase::Stable,
            (phase, Step::Close) if phase != Phase::Closed => Phase::Closed,
            (from, step) => return Err(PeerError::InvalidTransition { from, step }),
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

pub struct PeerEntry {
    pub role: Role,
    pub phase: Phase,
    /// Bumped every time the entry is recreated; link events carry the
    /// generation they were produced for.
    pub generation: u64,
    pub channel: Option<DataChannelHandler>,
    /// Remote candidates that arrived before the remote description.
    pub(crate) pending_candidates: Vec<IceCandidate>,
    pub(crate) driver: LinkDriver,
}

impl PeerEntry {
    pub(crate) fn new(role: Role, generation: u64, driver: LinkDriver) -> Self {
        Self {
            role,
            phase: Phase::Idle,
            generation,
            channel: None,
            pending_candidates: Vec::new(),
            driver,
        }
    }

    /// Whether a remote description has been handed to the link.
    pub fn has_remote_description(&self) -> bool {
        matches!(self.phase, Phase::Answered | Phase::Stable)
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map(DataChannelHandler::state)
            .unwrap_or(ChannelState::Connecting)
    }

    /// Guarded phase move; the phase is untouched on rejection.
    pub fn advance(&mut self, step: Step) -> Result<Phase, PeerError> {
        self.phase = self.phase.advance(step)?;
        Ok(self.phase)
    }

    /// Terminal. Closes the channel and the underlying connection.
    pub(crate) fn close(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.driver.close();
        if self.phase != Phase::Closed {
            self.phase = Phase::Closed;
        }
    }
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: ParticipantId,
    pub role: Role,
    pub phase: Phase,
    pub channel: ChannelState,
}

#[derive(Default)]
pub struct PeerRegistry {
    entries: HashMap<ParticipantId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PeerEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerEntry> {
        self.entries.get_mut(id)
    }

    /// Entry for `id` only if it is still the given generation.
    pub fn current_mut(&mut self, id: &ParticipantId, generation: u64) -> Option<&mut PeerEntry> {
        self.entries
            .get_mut(id)
            .filter(|entry| entry.generation == generation)
    }

    pub(crate) fn insert(&mut self, id: ParticipantId, entry: PeerEntry) {
        if let Some(mut previous) = self.entries.insert(id, entry) {
            previous.close();
        }
    }

    /// Closes and forgets the entry. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: &ParticipantId) -> bool {
        match self.entries.remove(id) {
            Some(mut entry) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    /// Closes every entry, returning the ids that were present.
    pub fn clear(&mut self) -> Vec<ParticipantId> {
        let mut ids = Vec::with_capacity(self.entries.len());
        for (id, mut entry) in self.entries.drain() {
            entry.close();
            ids.push(id);
        }
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &PeerEntry)> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .entries
            .iter()
            .map(|(id, entry)| PeerSnapshot {
                id: id.clone(),
                role: entry.role,
                phase: entry.phase,
                channel: entry.channel_state(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}
