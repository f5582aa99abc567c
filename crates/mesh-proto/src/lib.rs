//! Wire protocol shared by the mesh relay and its participants.
//!
//! Every frame on the relay connection is one JSON object tagged by `type`.
//! The relay only ever looks at `to` (for addressing) and stamps `from`; the
//! remaining fields are opaque to it and interpreted by the negotiators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier the relay assigns to a participant for the lifetime of its connection.
///
/// Ordering is plain lexicographic string ordering; the pair's initiator is
/// the participant whose id sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the shape browsers produce (`{"type": "offer", "sdp": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled network candidate, field names matching `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// One signaling frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalEnvelope {
    /// Relay to a freshly connected participant: its id and everyone already present.
    Init {
        id: ParticipantId,
        peers: Vec<ParticipantId>,
    },
    NewPeer {
        id: ParticipantId,
    },
    PeerLeft {
        id: ParticipantId,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ParticipantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        sdp: SessionDescription,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ParticipantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        sdp: SessionDescription,
    },
    Ice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ParticipantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        candidate: IceCandidate,
    },
}

impl SignalEnvelope {
    pub fn offer(to: ParticipantId, sdp: SessionDescription) -> Self {
        SignalEnvelope::Offer {
            to: Some(to),
            from: None,
            sdp,
        }
    }

    pub fn answer(to: ParticipantId, sdp: SessionDescription) -> Self {
        SignalEnvelope::Answer {
            to: Some(to),
            from: None,
            sdp,
        }
    }

    pub fn ice(to: ParticipantId, candidate: IceCandidate) -> Self {
        SignalEnvelope::Ice {
            to: Some(to),
            from: None,
            candidate,
        }
    }

    /// Wire name of the frame, as carried in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEnvelope::Init { .. } => "init",
            SignalEnvelope::NewPeer { .. } => "new-peer",
            SignalEnvelope::PeerLeft { .. } => "peer-left",
            SignalEnvelope::Offer { .. } => "offer",
            SignalEnvelope::Answer { .. } => "answer",
            SignalEnvelope::Ice { .. } => "ice",
        }
    }

    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            SignalEnvelope::Offer { to, .. }
            | SignalEnvelope::Answer { to, .. }
            | SignalEnvelope::Ice { to, .. } => to.as_ref(),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&ParticipantId> {
        match self {
            SignalEnvelope::Offer { from, .. }
            | SignalEnvelope::Answer { from, .. }
            | SignalEnvelope::Ice { from, .. } => from.as_ref(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test_timeout::timeout]
    fn init_matches_relay_wire_shape() {
        let init = SignalEnvelope::Init {
            id: "a1".into(),
            peers: vec![],
        };
        let value: Value = serde_json::from_str(&init.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "init", "id": "a1", "peers": []}));
    }

    #[test_timeout::timeout]
    fn lifecycle_frames_use_kebab_case_tags() {
        let joined = SignalEnvelope::NewPeer { id: "b1".into() };
        let left = SignalEnvelope::PeerLeft { id: "b1".into() };
        assert_eq!(
            serde_json::to_value(&joined).unwrap(),
            json!({"type": "new-peer", "id": "b1"})
        );
        assert_eq!(
            serde_json::to_value(&left).unwrap(),
            json!({"type": "peer-left", "id": "b1"})
        );
    }

    #[test_timeout::timeout]
    fn outbound_offer_omits_from() {
        let offer = SignalEnvelope::offer("b1".into(), SessionDescription::offer("v=0"));
        let value = serde_json::to_value(&offer).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer", "to": "b1", "sdp": {"type": "offer", "sdp": "v=0"}})
        );
        assert_eq!(offer.recipient(), Some(&ParticipantId::from("b1")));
        assert_eq!(offer.sender(), None);
    }

    #[test_timeout::timeout]
    fn decodes_browser_candidate_fields() {
        let text = r#"{
            "type": "ice",
            "to": "a1",
            "from": "b1",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        }"#;
        let envelope = SignalEnvelope::decode(text).unwrap();
        match envelope {
            SignalEnvelope::Ice { from, candidate, .. } => {
                assert_eq!(from, Some("b1".into()));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn candidate_without_optional_fields_decodes() {
        let candidate: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:2"})).unwrap();
        assert_eq!(candidate, IceCandidate::new("candidate:2"));
    }

    #[test_timeout::timeout]
    fn rejects_unknown_type_and_missing_payload() {
        assert!(SignalEnvelope::decode(r#"{"type": "renegotiate", "to": "a1"}"#).is_err());
        assert!(SignalEnvelope::decode(r#"{"type": "answer", "to": "a1"}"#).is_err());
        assert!(SignalEnvelope::decode("not json").is_err());
    }

    #[test_timeout::timeout]
    fn participant_ids_order_lexicographically() {
        let a = ParticipantId::from("a1");
        let b = ParticipantId::from("b1");
        assert!(a < b);
        assert!(ParticipantId::from("z") > ParticipantId::from("abc"));
    }
}
