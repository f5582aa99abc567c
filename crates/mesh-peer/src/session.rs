use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::MeshConfig;
use crate::error::PeerError;
use crate::link::PeerConnector;
use crate::negotiator::{MeshEvent, MeshSnapshot, Negotiator, NegotiatorHandle};
use crate::rtc::RtcConnector;
use crate::signaling::SignalingClient;

const SIGNALING_DRAIN: Duration = Duration::from_secs(1);

/// A running mesh participant: negotiator loop plus relay client.
pub struct MeshSession {
    handle: NegotiatorHandle,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    negotiator: JoinHandle<()>,
    signaling: JoinHandle<()>,
}

impl MeshSession {
    /// Joins the mesh over real peer connections.
    pub fn start(config: MeshConfig) -> Result<Self, PeerError> {
        let connector = Arc::new(RtcConnector::new(&config)?);
        Self::with_connector(config, connector)
    }

    pub fn with_connector(
        config: MeshConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self, PeerError> {
        let client = SignalingClient::new(&config.signaling_url, config.reconnect_delay)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (negotiator, handle) = Negotiator::new(connector, &config, outbound_tx, events_tx);

        let negotiator = tokio::spawn(negotiator.run());
        let relay_handle = handle.clone();
        let signaling = tokio::spawn(async move {
            match client.run(relay_handle, outbound_rx).await {
                Ok(()) | Err(PeerError::ChannelClosed) => {
                    debug!(target = "mesh::signaling", "signaling client stopped");
                }
                Err(err) => {
                    warn!(target = "mesh::signaling", error = %err, "signaling client failed");
                }
            }
        });

        Ok(Self {
            handle,
            events,
            negotiator,
            signaling,
        })
    }

    pub fn handle(&self) -> NegotiatorHandle {
        self.handle.clone()
    }

    pub async fn next_event(&mut self) -> Option<MeshEvent> {
        self.events.recv().await
    }

    pub fn broadcast(&self, data: impl Into<bytes::Bytes>) -> Result<(), PeerError> {
        self.handle.broadcast(data)
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot, PeerError> {
        self.handle.snapshot().await
    }

    /// Closes every peer, then drops the relay connection.
    pub async fn shutdown(self) {
        self.handle.shutdown();
        if let Err(err) = self.negotiator.await {
            warn!(target = "mesh::negotiator", error = %err, "negotiator task failed");
        }
        let mut signaling = self.signaling;
        if timeout(SIGNALING_DRAIN, &mut signaling).await.is_err() {
            signaling.abort();
        }
    }
}
