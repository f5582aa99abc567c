//! WebSocket client for the relay.
//!
//! Holds at most one relay connection. Frames from the relay are decoded and
//! handed to the negotiator; envelopes from the negotiator are encoded and
//! written out. When the connection drops the client waits a fixed delay and
//! dials again, forever. Envelopes produced while disconnected are discarded.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_proto::SignalEnvelope;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::PeerError;
use crate::negotiator::{Connectivity, NegotiatorHandle};

pub struct SignalingClient {
    url: Url,
    reconnect_delay: Duration,
}

/// Why a connected session ended.
enum SessionEnd {
    Dropped,
    Finished,
}

impl SignalingClient {
    pub fn new(url: &str, reconnect_delay: Duration) -> Result<Self, PeerError> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self {
                url,
                reconnect_delay,
            }),
            other => Err(PeerError::Setup(format!(
                "relay url must be ws:// or wss://, got {other}://"
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Runs until the negotiator goes away.
    pub async fn run(
        self,
        negotiator: NegotiatorHandle,
        mut outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    ) -> Result<(), PeerError> {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!(target = "mesh::signaling", url = %self.url, "connected to relay");
                    while let Ok(stale) = outbound.try_recv() {
                        debug!(target = "mesh::signaling", kind = stale.kind(), "dropping envelope queued while dialing");
                    }
                    negotiator.connectivity(Connectivity::Connected)?;
                    let end = session(stream, &negotiator, &mut outbound).await?;
                    negotiator.connectivity(Connectivity::Disconnected)?;
                    if let SessionEnd::Finished = end {
                        return Ok(());
                    }
                    warn!(target = "mesh::signaling", url = %self.url, "relay connection lost");
                }
                Err(err) => {
                    warn!(target = "mesh::signaling", url = %self.url, error = %err, "relay connection failed");
                    negotiator.connectivity(Connectivity::Disconnected)?;
                }
            }

            debug!(target = "mesh::signaling", delay_ms = self.reconnect_delay.as_millis() as u64, "waiting before reconnect");
            let wait = sleep(self.reconnect_delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    envelope = outbound.recv() => match envelope {
                        Some(envelope) => {
                            debug!(target = "mesh::signaling", kind = envelope.kind(), "relay down; dropping outbound envelope");
                        }
                        None => return Ok(()),
                    },
                }
            }
        }
    }
}

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn session(
    stream: RelayStream,
    negotiator: &NegotiatorHandle,
    outbound: &mut mpsc::UnboundedReceiver<SignalEnvelope>,
) -> Result<SessionEnd, PeerError> {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            frame = reader.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(target = "mesh::signaling", "ignoring non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(target = "mesh::signaling", error = %err, "relay read error");
                        return Ok(SessionEnd::Dropped);
                    }
                };
                match SignalEnvelope::decode(&text) {
                    Ok(envelope) => negotiator.deliver(envelope)?,
                    Err(err) => {
                        debug!(target = "mesh::signaling", error = %err, "dropping undecodable frame");
                    }
                }
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    let _ = writer.close().await;
                    return Ok(SessionEnd::Finished);
                };
                let text = envelope.encode()?;
                if let Err(err) = writer.send(Message::Text(text)).await {
                    debug!(target = "mesh::signaling", error = %err, "relay write failed");
                    return Ok(SessionEnd::Dropped);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn accepts_websocket_urls_only() {
        assert!(SignalingClient::new("ws://localhost:3001", Duration::from_secs(1)).is_ok());
        assert!(SignalingClient::new("wss://relay.example/ws", Duration::from_secs(1)).is_ok());
        assert!(matches!(
            SignalingClient::new("http://localhost:3001", Duration::from_secs(1)),
            Err(PeerError::Setup(_))
        ));
        assert!(matches!(
            SignalingClient::new("not a url", Duration::from_secs(1)),
            Err(PeerError::Url(_))
        ));
    }
}
