//! In-process links for tests and single-machine demos.
//!
//! Every [`MemoryConnector`] built from the same [`MemoryNetwork`] can reach
//! the others. A pair connects once both sides hold a local and a remote
//! description; the side that created the data channel then announces it to
//! the other and both channels open. Descriptions and candidates are opaque
//! tokens, but their ordering rules follow a real peer connection: a remote
//! candidate is refused until the remote description is installed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_proto::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::PeerError;
use crate::link::{ConnectionState, DataLink, LinkEvent, LinkEvents, PeerConnector, PeerLink};

const CANDIDATE_PREFIX: &str = "candidate:memory";

type Key = (ParticipantId, ParticipantId);

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Network>>,
}

#[derive(Default)]
struct Network {
    slots: HashMap<Key, Slot>,
    candidates: u64,
    applied_candidates: u64,
    premature_candidates: u64,
}

struct Slot {
    generation: u64,
    events: LinkEvents,
    local_description: bool,
    remote_description: bool,
    connected: bool,
    owns_channel: bool,
}

impl Network {
    fn slot(&mut self, key: &Key, generation: u64) -> Result<&mut Slot, PeerError> {
        self.slots
            .get_mut(key)
            .filter(|slot| slot.generation == generation)
            .ok_or(PeerError::Closed)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(MemoryConnector {
            network: self.clone(),
        })
    }

    /// Links currently held open, counting each direction separately.
    pub fn open_links(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Remote candidates installed successfully across every link.
    pub fn applied_candidates(&self) -> u64 {
        self.inner.lock().applied_candidates
    }

    /// Remote candidates refused because no remote description was set yet.
    pub fn premature_candidates(&self) -> u64 {
        self.inner.lock().premature_candidates
    }

    /// Drops the transport between two participants; both sides observe
    /// [`ConnectionState::Failed`].
    pub fn fail(&self, a: &ParticipantId, b: &ParticipantId) {
        let mut network = self.inner.lock();
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(slot) = network.slots.remove(&key) {
                slot.events
                    .emit(LinkEvent::StateChanged(ConnectionState::Failed));
            }
        }
    }

    fn try_connect(&self, network: &mut Network, local: &ParticipantId, remote: &ParticipantId) {
        let forward = (local.clone(), remote.clone());
        let backward = (remote.clone(), local.clone());
        let ready = |slot: Option<&Slot>| {
            slot.is_some_and(|slot| {
                slot.local_description && slot.remote_description && !slot.connected
            })
        };
        if !ready(network.slots.get(&forward)) || !ready(network.slots.get(&backward)) {
            return;
        }

        for key in [&forward, &backward] {
            if let Some(slot) = network.slots.get_mut(key) {
                slot.connected = true;
                slot.events
                    .emit(LinkEvent::StateChanged(ConnectionState::Connected));
            }
        }

        for (owner, other) in [(&forward, &backward), (&backward, &forward)] {
            let owns = network.slots.get(owner).is_some_and(|slot| slot.owns_channel);
            if !owns {
                continue;
            }
            if let Some(slot) = network.slots.get(other) {
                let channel = MemoryChannel {
                    network: self.clone(),
                    key: other.clone(),
                };
                slot.events
                    .emit(LinkEvent::ChannelAnnounced(Arc::new(channel)));
                slot.events.emit(LinkEvent::ChannelOpen);
            }
            if let Some(slot) = network.slots.get(owner) {
                slot.events.emit(LinkEvent::ChannelOpen);
            }
        }
        debug!(target = "mesh::rtc", %local, %remote, "memory link connected");
    }
}

pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn open(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let generation = events.generation();
        let key = (local.clone(), remote.clone());
        self.network.inner.lock().slots.insert(
            key.clone(),
            Slot {
                generation,
                events,
                local_description: false,
                remote_description: false,
                connected: false,
                owns_channel: false,
            },
        );
        Ok(Arc::new(MemoryLink {
            network: self.network.clone(),
            key,
            generation,
        }))
    }
}

struct MemoryLink {
    network: MemoryNetwork,
    key: Key,
    generation: u64,
}

impl MemoryLink {
    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!("memory {} -> {}", self.key.0, self.key.1);
        match kind {
            SdpKind::Offer => SessionDescription::offer(sdp),
            SdpKind::Answer => SessionDescription::answer(sdp),
        }
    }

    fn gather(&self, network: &mut Network) {
        network.candidates += 1;
        let candidate = IceCandidate {
            candidate: format!("{CANDIDATE_PREFIX} {}", network.candidates),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        if let Some(slot) = network.slots.get(&self.key) {
            slot.events.emit(LinkEvent::LocalCandidate(candidate));
        }
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_channel(
        &self,
        _label: &str,
        _ordered: bool,
    ) -> Result<Arc<dyn DataLink>, PeerError> {
        let mut network = self.network.inner.lock();
        network.slot(&self.key, self.generation)?.owns_channel = true;
        Ok(Arc::new(MemoryChannel {
            network: self.network.clone(),
            key: self.key.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut network = self.network.inner.lock();
        let slot = network.slot(&self.key, self.generation)?;
        if slot.local_description {
            return Err(PeerError::Rtc("offer already created".into()));
        }
        slot.local_description = true;
        self.gather(&mut network);
        Ok(self.describe(SdpKind::Offer))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if offer.kind != SdpKind::Offer {
            return Err(PeerError::UnexpectedDescription {
                expected: SdpKind::Offer,
            });
        }
        let mut network = self.network.inner.lock();
        let slot = network.slot(&self.key, self.generation)?;
        if slot.local_description || slot.remote_description {
            return Err(PeerError::Rtc("offer arrived in the wrong signaling state".into()));
        }
        slot.remote_description = true;
        slot.local_description = true;
        self.gather(&mut network);
        self.network.try_connect(&mut network, &self.key.0, &self.key.1);
        Ok(self.describe(SdpKind::Answer))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        if answer.kind != SdpKind::Answer {
            return Err(PeerError::UnexpectedDescription {
                expected: SdpKind::Answer,
            });
        }
        let mut network = self.network.inner.lock();
        let slot = network.slot(&self.key, self.generation)?;
        if !slot.local_description || slot.remote_description {
            return Err(PeerError::Rtc("answer arrived without a pending offer".into()));
        }
        slot.remote_description = true;
        self.network.try_connect(&mut network, &self.key.0, &self.key.1);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut network = self.network.inner.lock();
        if !network.slot(&self.key, self.generation)?.remote_description {
            network.premature_candidates += 1;
            return Err(PeerError::Rtc("remote description not set".into()));
        }
        if !candidate.candidate.starts_with(CANDIDATE_PREFIX) {
            return Err(PeerError::MalformedCandidate(candidate.candidate));
        }
        network.applied_candidates += 1;
        Ok(())
    }

    /// The far side sees its channel close but keeps its connection state;
    /// departures are announced by the relay.
    async fn close(&self) {
        let mut network = self.network.inner.lock();
        let owned = network
            .slots
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation);
        if !owned {
            return;
        }
        if let Some(slot) = network.slots.remove(&self.key) {
            slot.events
                .emit(LinkEvent::StateChanged(ConnectionState::Closed));
            if slot.connected {
                let far = (self.key.1.clone(), self.key.0.clone());
                if let Some(other) = network.slots.get_mut(&far) {
                    other.connected = false;
                    other.events.emit(LinkEvent::ChannelClosed);
                }
            }
        }
    }
}

struct MemoryChannel {
    network: MemoryNetwork,
    key: Key,
}

impl DataLink for MemoryChannel {
    fn send(&self, data: Bytes) -> Result<(), PeerError> {
        let network = self.network.inner.lock();
        let far = (self.key.1.clone(), self.key.0.clone());
        let near_up = network.slots.get(&self.key).is_some_and(|slot| slot.connected);
        match network.slots.get(&far) {
            Some(slot) if near_up && slot.connected => {
                slot.events.emit(LinkEvent::ChannelMessage(data));
                Ok(())
            }
            _ => Err(PeerError::Closed),
        }
    }

    fn close(&self) {
        let network = self.network.inner.lock();
        let far = (self.key.1.clone(), self.key.0.clone());
        for key in [&self.key, &far] {
            if let Some(slot) = network.slots.get(key) {
                slot.events.emit(LinkEvent::ChannelClosed);
            }
        }
    }
}
