use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mesh_peer::config::{DEFAULT_SIGNALING_URL, DEFAULT_STUN_SERVER};
use mesh_peer::{Connectivity, MeshConfig, MeshEvent, MeshSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mesh-chat",
    author,
    version,
    about = "Chat with everyone connected to the same relay"
)]
struct Cli {
    /// Relay WebSocket url.
    #[arg(long, env = "MESH_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    signaling_url: String,

    /// Seconds between relay reconnect attempts.
    #[arg(long, env = "MESH_RECONNECT_DELAY_SECS", default_value_t = 30)]
    reconnect_delay_secs: u64,

    /// STUN/TURN servers, comma separated.
    #[arg(
        long,
        env = "MESH_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    ice_servers: Vec<String>,

    /// Use host candidates only.
    #[arg(long, env = "MESH_LOCALHOST_ONLY")]
    localhost: bool,
}

impl From<Cli> for MeshConfig {
    fn from(cli: Cli) -> Self {
        let config = MeshConfig {
            signaling_url: cli.signaling_url,
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
            ice_servers: cli.ice_servers,
            ..MeshConfig::default()
        };
        if cli.localhost {
            config.localhost()
        } else {
            config
        }
    }
}

const REQUEST_PROMPT: &str = "Please enter the book name or ISBN: /request <book or ISBN>";

/// What a line typed by the user asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Chat(String),
    Request(String),
    MissingRequest,
}

fn parse_input(line: &str) -> Option<Input> {
    let text = line.trim();
    if text.is_empty() {
        return None;
    }
    let input = match text.strip_prefix("/request") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
            match rest.trim() {
                "" => Input::MissingRequest,
                book => Input::Request(book_request(book)),
            }
        }
        _ => Input::Chat(text.to_string()),
    };
    Some(input)
}

/// Canned message asking peers to scan a book from their local library.
fn book_request(book: &str) -> String {
    format!(
        "Get the book you need, delivered to your home for your half hour of scanning the book needed from a library near you!\n\
         Requested book (name or ISBN): {book}.\n\
         Video instructions:\n\
         - https://bit.ly/oeBookLamp,\n\
         - https://bit.ly/oeBookVideo4Library;\n\
         Download DocScan app:\n\
         - For Android https://play.google.com/store/apps/details;\n\
         - For iPhone https://apps.apple.com/us/app/doc-scan-pdf-scanner/id453312964"
    )
}

/// One line of chat output, or nothing for events the user does not see.
fn render(event: &MeshEvent) -> Option<String> {
    match event {
        MeshEvent::Connectivity(Connectivity::Connected) => {
            Some("* connected to relay".to_string())
        }
        MeshEvent::Connectivity(Connectivity::Disconnected) => {
            Some("* relay unreachable, retrying".to_string())
        }
        MeshEvent::Ready { local_id } => Some(format!("* your id is {local_id}")),
        MeshEvent::PeerConnected(peer) => Some(format!("User {peer} connected!")),
        MeshEvent::PeerLeft(peer) => Some(format!("User {peer} left the chat")),
        MeshEvent::PeerDisconnected(peer) => Some(format!("User {peer} disconnected")),
        MeshEvent::Message { from, data } => {
            Some(format!("{from}: {}", String::from_utf8_lossy(data)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = MeshConfig::from(Cli::parse());
    tracing::info!(url = %config.signaling_url, "starting mesh chat");
    let mut session = MeshSession::start(config).context("failed to start mesh session")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Some(Input::Chat(text)) | Some(Input::Request(text)) => {
                        session.broadcast(text.clone())?;
                        println!("me: {text}");
                    }
                    Some(Input::MissingRequest) => println!("{REQUEST_PROMPT}"),
                    None => {}
                }
            }
            event = session.next_event() => match event {
                Some(event) => {
                    if let Some(line) = render(&event) {
                        println!("{line}");
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_peer::ParticipantId;

    #[test_timeout::timeout]
    fn renders_chat_lines() {
        let peer = ParticipantId::new("k3j9x2a");
        assert_eq!(
            render(&MeshEvent::Message {
                from: peer.clone(),
                data: "hi there".into(),
            })
            .as_deref(),
            Some("k3j9x2a: hi there")
        );
        assert_eq!(
            render(&MeshEvent::PeerConnected(peer.clone())).as_deref(),
            Some("User k3j9x2a connected!")
        );
        assert_eq!(
            render(&MeshEvent::PeerLeft(peer)).as_deref(),
            Some("User k3j9x2a left the chat")
        );
    }

    #[test_timeout::timeout]
    fn request_command_builds_book_request() {
        let Some(Input::Request(text)) = parse_input("/request  978-0262033848 ") else {
            panic!("expected a book request");
        };
        assert!(text.starts_with("Get the book you need"));
        assert!(text.contains("Requested book (name or ISBN): 978-0262033848.\n"));
        assert!(text.ends_with("id453312964"));
        assert_eq!(text.lines().count(), 8);
    }

    #[test_timeout::timeout]
    fn empty_request_prompts_instead_of_sending() {
        assert_eq!(parse_input("/request"), Some(Input::MissingRequest));
        assert_eq!(parse_input("/request   "), Some(Input::MissingRequest));
        assert_eq!(parse_input("   "), None);
        assert_eq!(
            parse_input("/requested nothing"),
            Some(Input::Chat("/requested nothing".into()))
        );
        assert_eq!(parse_input(" hello "), Some(Input::Chat("hello".into())));
    }

    #[test_timeout::timeout]
    fn cli_flags_build_config() {
        let cli = Cli::parse_from([
            "mesh-chat",
            "--signaling-url",
            "ws://10.0.0.2:3001",
            "--reconnect-delay-secs",
            "5",
            "--ice-servers",
            "stun:a:1,stun:b:2",
        ]);
        let config = MeshConfig::from(cli);
        assert_eq!(config.signaling_url, "ws://10.0.0.2:3001");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.ice_servers, vec!["stun:a:1", "stun:b:2"]);
        assert_eq!(config.channel_label, "chat");
    }

    #[test_timeout::timeout]
    fn localhost_flag_clears_ice_servers() {
        let cli = Cli::parse_from(["mesh-chat", "--localhost"]);
        assert!(MeshConfig::from(cli).ice_servers.is_empty());
    }
}
