use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "mesh-relay",
    author,
    version,
    about = "Signaling relay for full-mesh peer-to-peer chat"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "MESH_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// Seconds to wait after the shutdown signal before exiting.
    #[arg(long, env = "MESH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 0)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            shutdown_grace: Duration::ZERO,
        }
    }
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(RelayConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_cli_into_config() {
        let cli = Cli::parse_from([
            "mesh-relay",
            "--listen-addr",
            "127.0.0.1:4000",
            "--shutdown-grace-secs",
            "2",
        ]);
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_addr() {
        let cli = Cli {
            listen_addr: "not-an-addr".into(),
            shutdown_grace_secs: 0,
        };
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }
}
