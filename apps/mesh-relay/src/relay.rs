use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_proto::{ParticipantId, SignalEnvelope};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const ID_LEN: usize = 7;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Per-connection queue of encoded frames, drained by that connection's writer task.
pub type Outbox = mpsc::UnboundedSender<String>;

/// Source of candidate participant ids. Collisions with live ids are retried by the relay.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> ParticipantId;
}

/// Short lowercase base-36 ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn generate(&self) -> ParticipantId {
        let mut rng = rand::thread_rng();
        let id: String = (0..ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        ParticipantId::new(id)
    }
}

/// Hands out a fixed sequence of ids, then falls back to random ones.
#[derive(Debug, Default)]
pub struct ScriptedIds {
    script: Mutex<VecDeque<ParticipantId>>,
}

impl ScriptedIds {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ParticipantId>,
    {
        Self {
            script: Mutex::new(ids.into_iter().map(Into::into).collect()),
        }
    }
}

impl IdGenerator for ScriptedIds {
    fn generate(&self) -> ParticipantId {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| RandomIds.generate())
    }
}

/// Outcome of forwarding one client frame. Never reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forwarded,
    /// Not a JSON object, or no string `to` field.
    Malformed,
    /// `to` names nobody currently registered.
    UnknownTarget,
}

struct Participant {
    outbox: Outbox,
    joined: u64,
}

/// Registry of connected participants plus the forwarding rules between them.
#[derive(Clone)]
pub struct Relay {
    participants: Arc<DashMap<ParticipantId, Participant>>,
    ids: Arc<dyn IdGenerator>,
    joins: Arc<AtomicU64>,
    /// Held across join and leave bookkeeping so every participant sees its
    /// `init` before any announcement that postdates it.
    membership: Arc<Mutex<()>>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self::with_ids(RandomIds)
    }

    pub fn with_ids(ids: impl IdGenerator + 'static) -> Self {
        Self {
            participants: Arc::new(DashMap::new()),
            ids: Arc::new(ids),
            joins: Arc::new(AtomicU64::new(0)),
            membership: Arc::new(Mutex::new(())),
        }
    }

    /// Register a new participant, hand it its id and the roster, and announce it to everyone else.
    pub fn connect(&self, outbox: Outbox) -> ParticipantId {
        let _membership = self.membership.lock();
        let joined = self.joins.fetch_add(1, Ordering::SeqCst);
        let id = loop {
            let candidate = self.ids.generate();
            match self.participants.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    debug!(target = "mesh::relay", id = %candidate, "id collision, regenerating");
                }
                Entry::Vacant(slot) => {
                    slot.insert(Participant {
                        outbox: outbox.clone(),
                        joined,
                    });
                    break candidate;
                }
            }
        };

        let peers = self.roster_except(&id);
        info!(
            target = "mesh::relay",
            id = %id,
            peers = peers.len(),
            "participant connected"
        );
        send_envelope(
            &outbox,
            &SignalEnvelope::Init {
                id: id.clone(),
                peers,
            },
        );
        self.broadcast_except(&id, &SignalEnvelope::NewPeer { id: id.clone() });
        id
    }

    /// Forward a raw client frame to the participant named in its `to` field.
    ///
    /// Everything except `from` is passed through untouched; `from` is always
    /// overwritten with the sender's registered id.
    pub fn relay(&self, sender: &ParticipantId, text: &str) -> Delivery {
        let mut frame = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(frame)) => frame,
            Ok(_) | Err(_) => {
                debug!(target = "mesh::relay", from = %sender, "dropping malformed frame");
                return Delivery::Malformed;
            }
        };
        let Some(target) = frame
            .get("to")
            .and_then(Value::as_str)
            .map(ParticipantId::from)
        else {
            debug!(target = "mesh::relay", from = %sender, "dropping frame without recipient");
            return Delivery::Malformed;
        };

        let Some(outbox) = self
            .participants
            .get(&target)
            .map(|participant| participant.outbox.clone())
        else {
            debug!(
                target = "mesh::relay",
                from = %sender,
                to = %target,
                "dropping frame for unknown participant"
            );
            return Delivery::UnknownTarget;
        };

        frame.insert("from".to_string(), Value::String(sender.to_string()));
        if outbox.send(Value::Object(frame).to_string()).is_err() {
            debug!(target = "mesh::relay", to = %target, "recipient writer already gone");
            return Delivery::UnknownTarget;
        }
        Delivery::Forwarded
    }

    /// Remove a participant and tell the rest it left. Returns false if it was already gone.
    pub fn disconnect(&self, id: &ParticipantId) -> bool {
        let _membership = self.membership.lock();
        if self.participants.remove(id).is_none() {
            return false;
        }
        info!(target = "mesh::relay", id = %id, "participant disconnected");
        self.broadcast_except(id, &SignalEnvelope::PeerLeft { id: id.clone() });
        true
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Registered ids other than `id`, in join order.
    fn roster_except(&self, id: &ParticipantId) -> Vec<ParticipantId> {
        let mut roster: Vec<(u64, ParticipantId)> = self
            .participants
            .iter()
            .filter(|entry| entry.key() != id)
            .map(|entry| (entry.value().joined, entry.key().clone()))
            .collect();
        roster.sort_by_key(|(joined, _)| *joined);
        roster.into_iter().map(|(_, id)| id).collect()
    }

    fn broadcast_except(&self, except: &ParticipantId, envelope: &SignalEnvelope) {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(target = "mesh::relay", error = %err, "failed to encode broadcast");
                return;
            }
        };
        // Collect outboxes first so no DashMap guard is held while sending.
        let outboxes: Vec<Outbox> = self
            .participants
            .iter()
            .filter(|entry| entry.key() != except)
            .map(|entry| entry.value().outbox.clone())
            .collect();
        for outbox in outboxes {
            let _ = outbox.send(text.clone());
        }
    }
}

fn send_envelope(outbox: &Outbox, envelope: &SignalEnvelope) {
    match envelope.encode() {
        Ok(text) => {
            let _ = outbox.send(text);
        }
        Err(err) => warn!(target = "mesh::relay", error = %err, "failed to encode envelope"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test_timeout::timeout]
    fn first_participant_gets_empty_roster() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1"]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = relay.connect(tx);
        assert_eq!(id.as_str(), "a1");
        assert_eq!(
            frames(&mut rx),
            vec![json!({"type": "init", "id": "a1", "peers": []})]
        );
    }

    #[test_timeout::timeout]
    fn later_participants_see_roster_and_are_announced() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1", "b1", "c1"]));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, mut c_rx) = mpsc::unbounded_channel();
        relay.connect(a_tx);
        relay.connect(b_tx);
        relay.connect(c_tx);

        assert_eq!(
            frames(&mut a_rx),
            vec![
                json!({"type": "init", "id": "a1", "peers": []}),
                json!({"type": "new-peer", "id": "b1"}),
                json!({"type": "new-peer", "id": "c1"}),
            ]
        );
        assert_eq!(
            frames(&mut b_rx),
            vec![
                json!({"type": "init", "id": "b1", "peers": ["a1"]}),
                json!({"type": "new-peer", "id": "c1"}),
            ]
        );
        assert_eq!(
            frames(&mut c_rx),
            vec![json!({"type": "init", "id": "c1", "peers": ["a1", "b1"]})]
        );
    }

    #[test_timeout::timeout]
    fn colliding_ids_are_regenerated() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1", "a1", "b1"]));
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        assert_eq!(relay.connect(a_tx).as_str(), "a1");
        assert_eq!(relay.connect(b_tx).as_str(), "b1");
        assert_eq!(relay.participant_count(), 2);
    }

    #[test_timeout::timeout]
    fn forwards_with_stamped_sender() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1", "b1"]));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = relay.connect(a_tx);
        relay.connect(b_tx);
        frames(&mut a_rx);
        frames(&mut b_rx);

        let outcome = relay.relay(
            &a,
            r#"{"type":"offer","to":"b1","from":"mallory","sdp":{"type":"offer","sdp":"v=0"},"extra":1}"#,
        );
        assert_eq!(outcome, Delivery::Forwarded);
        assert_eq!(
            frames(&mut b_rx),
            vec![json!({
                "type": "offer",
                "to": "b1",
                "from": "a1",
                "sdp": {"type": "offer", "sdp": "v=0"},
                "extra": 1
            })]
        );
        assert!(frames(&mut a_rx).is_empty());
    }

    #[test_timeout::timeout]
    fn drops_malformed_and_unaddressable_frames() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1", "b1"]));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = relay.connect(a_tx);
        relay.connect(b_tx);
        frames(&mut a_rx);
        frames(&mut b_rx);

        assert_eq!(relay.relay(&a, "{not json"), Delivery::Malformed);
        assert_eq!(relay.relay(&a, r#"["to","b1"]"#), Delivery::Malformed);
        assert_eq!(relay.relay(&a, r#"{"type":"ice"}"#), Delivery::Malformed);
        assert_eq!(relay.relay(&a, r#"{"type":"ice","to":7}"#), Delivery::Malformed);
        assert_eq!(
            relay.relay(&a, r#"{"type":"ice","to":"zz"}"#),
            Delivery::UnknownTarget
        );
        assert!(frames(&mut a_rx).is_empty());
        assert!(frames(&mut b_rx).is_empty());
    }

    #[test_timeout::timeout]
    fn never_forwards_to_departed_participant() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1", "b1"]));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let a = relay.connect(a_tx);
        let b = relay.connect(b_tx);
        assert!(relay.disconnect(&b));
        frames(&mut a_rx);

        assert_eq!(
            relay.relay(&a, r#"{"type":"ice","to":"b1","candidate":{"candidate":"x"}}"#),
            Delivery::UnknownTarget
        );
        assert!(!relay.contains(&b));
    }

    #[test_timeout::timeout]
    fn disconnect_broadcasts_once() {
        let relay = Relay::with_ids(ScriptedIds::new(["a1", "b1"]));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = relay.connect(a_tx);
        relay.connect(b_tx);
        frames(&mut b_rx);

        assert!(relay.disconnect(&a));
        assert!(!relay.disconnect(&a));
        assert_eq!(
            frames(&mut b_rx),
            vec![json!({"type": "peer-left", "id": "a1"})]
        );
        assert_eq!(relay.participant_count(), 1);
        assert!(frames(&mut a_rx).iter().all(|frame| frame["type"] != "peer-left"));
    }

    #[test_timeout::timeout]
    fn random_ids_are_short_base36() {
        let id = RandomIds.generate();
        assert_eq!(id.as_str().len(), ID_LEN);
        assert!(id
            .as_str()
            .bytes()
            .all(|byte| ID_ALPHABET.contains(&byte)));
    }
}
