#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use mesh_peer::{MemoryNetwork, MeshConfig, MeshEvent, MeshSession, MeshSnapshot, Phase};
use mesh_proto::ParticipantId;
use mesh_relay::{router, Relay, ScriptedIds};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_relay(ids: &[&'static str]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    serve_relay(listener, ids);
    addr
}

pub fn serve_relay(listener: TcpListener, ids: &[&'static str]) {
    let relay = Relay::with_ids(ScriptedIds::new(ids.iter().copied()));
    tokio::spawn(async move {
        axum::serve(listener, router(relay)).await.unwrap();
    });
}

pub fn config(addr: SocketAddr) -> MeshConfig {
    MeshConfig::default()
        .localhost()
        .with_signaling_url(format!("ws://{addr}/"))
        .with_reconnect_delay(Duration::from_millis(100))
}

pub fn join(addr: SocketAddr, network: &MemoryNetwork) -> MeshSession {
    MeshSession::with_connector(config(addr), network.connector()).unwrap()
}

/// Joins and waits until the relay has assigned an id.
pub async fn join_ready(addr: SocketAddr, network: &MemoryNetwork) -> MeshSession {
    let mut session = join(addr, network);
    expect_event(&mut session, |event| matches!(event, MeshEvent::Ready { .. })).await;
    session
}

pub async fn expect_event<F>(session: &mut MeshSession, matches: F) -> MeshEvent
where
    F: Fn(&MeshEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let event = timeout(deadline.saturating_duration_since(Instant::now()), session.next_event())
            .await
            .expect("timed out waiting for mesh event")
            .expect("mesh event stream ended");
        if matches(&event) {
            return event;
        }
    }
}

pub async fn expect_connected(session: &mut MeshSession, peer: &str) {
    expect_event(session, |event| {
        matches!(event, MeshEvent::PeerConnected(id) if id.as_str() == peer)
    })
    .await;
}

/// Waits for a connection to each of `peers`, in any order.
pub async fn expect_connected_to(session: &mut MeshSession, peers: &[&str]) {
    let mut pending: HashSet<String> = peers.iter().map(|peer| peer.to_string()).collect();
    while !pending.is_empty() {
        let event = expect_event(session, |event| matches!(event, MeshEvent::PeerConnected(_))).await;
        if let MeshEvent::PeerConnected(peer) = event {
            pending.remove(peer.as_str());
        }
    }
}

/// No message event arrives within a short window.
pub async fn assert_no_message(session: &mut MeshSession) {
    let window = Instant::now() + Duration::from_millis(200);
    while let Ok(Some(event)) =
        timeout(window.saturating_duration_since(Instant::now()), session.next_event()).await
    {
        assert!(
            !matches!(event, MeshEvent::Message { .. }),
            "unexpected message: {event:?}"
        );
    }
}

pub async fn wait_for<F>(session: &MeshSession, predicate: F) -> MeshSnapshot
where
    F: Fn(&MeshSnapshot) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = session.snapshot().await.unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "condition not reached: {snapshot:?}");
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn phase_of(snapshot: &MeshSnapshot, peer: &str) -> Option<Phase> {
    snapshot
        .peers
        .iter()
        .find(|entry| entry.id.as_str() == peer)
        .map(|entry| entry.phase)
}

pub fn id(value: &str) -> ParticipantId {
    ParticipantId::new(value)
}
