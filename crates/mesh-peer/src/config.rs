use std::env;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3001";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Settings for one mesh participant.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Relay WebSocket endpoint.
    pub signaling_url: String,
    /// Fixed wait between relay reconnect attempts. No backoff, no cap.
    pub reconnect_delay: Duration,
    /// STUN/TURN urls handed to the peer connection.
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub ordered: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env::var("MESH_LOCALHOST_ONLY").is_ok() {
            vec![]
        } else {
            env::var("MESH_ICE_SERVERS")
                .ok()
                .map(|value| parse_ice_servers(&value))
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            signaling_url: env::var("MESH_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            reconnect_delay: env::var("MESH_RECONNECT_DELAY_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_delay),
            ice_servers,
            channel_label: defaults.channel_label,
            ordered: defaults.ordered,
        }
    }

    /// Host candidates only, for peers on the same machine or LAN.
    pub fn localhost(mut self) -> Self {
        self.ice_servers.clear();
        self
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Comma separated list; blanks are skipped.
pub fn parse_ice_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
