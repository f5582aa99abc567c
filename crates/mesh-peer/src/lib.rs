//! Participant side of a full-mesh peer-to-peer chat.
//!
//! A participant keeps one connection to the relay ([`signaling`]) and one
//! negotiated peer connection per other participant ([`negotiator`]). Roles
//! are settled by comparing ids, so every pair produces exactly one offer.
//! The transport behind each pair is pluggable through [`link::PeerConnector`]:
//! [`rtc`] uses webrtc-rs, [`memory`] wires participants together in-process.

pub mod channel;
pub mod config;
pub mod error;
pub mod link;
pub mod memory;
pub mod negotiator;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use channel::DataChannelHandler;
pub use config::MeshConfig;
pub use error::PeerError;
pub use mesh_proto::{ParticipantId, SignalEnvelope};
pub use link::{ConnectionState, DataLink, LinkEvent, LinkEvents, PeerConnector, PeerLink};
pub use memory::MemoryNetwork;
pub use negotiator::{Connectivity, MeshEvent, MeshSnapshot, Negotiator, NegotiatorHandle};
pub use registry::{ChannelState, Phase, PeerSnapshot, Role};
pub use rtc::RtcConnector;
pub use session::MeshSession;
pub use signaling::SignalingClient;
