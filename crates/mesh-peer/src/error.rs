use mesh_proto::SdpKind;
use thiserror::Error;

use crate::registry::{Phase, Step};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("peer connection error: {0}")]
    Rtc(String),
    #[error("transition {step} rejected in phase {from}")]
    InvalidTransition { from: Phase, step: Step },
    #[error("data channel opened while negotiation is {0}")]
    ChannelBeforeStable(Phase),
    #[error("peer connection closed")]
    Closed,
    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),
    #[error("expected {expected:?} description")]
    UnexpectedDescription { expected: SdpKind },
    #[error("negotiator stopped")]
    ChannelClosed,
    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Rtc(err.to_string())
    }
}
