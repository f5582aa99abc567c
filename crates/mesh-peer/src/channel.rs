use std::sync::Arc;

use bytes::Bytes;
use mesh_proto::ParticipantId;
use tracing::debug;

use crate::error::PeerError;
use crate::link::DataLink;
use crate::negotiator::MeshEvent;
use crate::registry::{ChannelState, Phase};

/// Application-facing wrapper around the single data channel of a pair.
pub struct DataChannelHandler {
    peer: ParticipantId,
    state: ChannelState,
    link: Arc<dyn DataLink>,
}

impl DataChannelHandler {
    pub fn new(peer: ParticipantId, link: Arc<dyn DataLink>) -> Self {
        Self {
            peer,
            state: ChannelState::Connecting,
            link,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Hands `data` to the link when open. Anything else is a silent no-op
    /// and returns `false`.
    pub fn send(&self, data: Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.link.send(data) {
            Ok(()) => true,
            Err(err) => {
                debug!(target = "mesh::negotiator", peer = %self.peer, error = %err, "send on data channel failed");
                false
            }
        }
    }

    /// A channel may only open once negotiation for its pair is stable.
    pub fn on_open(&mut self, phase: Phase) -> Result<MeshEvent, PeerError> {
        if phase != Phase::Stable {
            return Err(PeerError::ChannelBeforeStable(phase));
        }
        if self.state != ChannelState::Connecting {
            return Err(PeerError::Closed);
        }
        self.state = ChannelState::Open;
        Ok(MeshEvent::PeerConnected(self.peer.clone()))
    }

    pub fn on_message(&self, data: Bytes) -> Option<MeshEvent> {
        self.is_open().then(|| MeshEvent::Message {
            from: self.peer.clone(),
            data,
        })
    }

    /// Returns `true` the first time the channel goes closed.
    pub fn on_close(&mut self) -> bool {
        let was_closed = self.state == ChannelState::Closed;
        self.state = ChannelState::Closed;
        !was_closed
    }

    pub fn close(&mut self) {
        if self.on_close() {
            self.link.close();
        }
    }
}
