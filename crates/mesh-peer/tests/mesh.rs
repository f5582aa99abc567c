mod common;

use bytes::Bytes;
use common::*;
use mesh_peer::{ChannelState, Connectivity, MemoryNetwork, MeshEvent, MeshSession, Phase, Role};
use mesh_proto::{IceCandidate, SignalEnvelope};
use tokio::net::TcpListener;

async fn pair() -> (MeshSession, MeshSession, MemoryNetwork) {
    let addr = start_relay(&["a1", "b1"]).await;
    let network = MemoryNetwork::new();
    let mut a = join_ready(addr, &network).await;
    let mut b = join_ready(addr, &network).await;
    expect_connected(&mut a, "b1").await;
    expect_connected(&mut b, "a1").await;
    (a, b, network)
}

#[test_timeout::tokio_timeout_test]
async fn pair_negotiates_to_stable_with_open_channels() {
    let (a, b, network) = pair().await;

    let a_view = a.snapshot().await.unwrap();
    assert_eq!(a_view.local_id, Some(id("a1")));
    assert_eq!(a_view.peers.len(), 1);
    assert_eq!(a_view.peers[0].id, id("b1"));
    assert_eq!(a_view.peers[0].role, Role::Initiator);
    assert_eq!(a_view.peers[0].phase, Phase::Stable);
    assert_eq!(a_view.peers[0].channel, ChannelState::Open);

    let b_view = b.snapshot().await.unwrap();
    assert_eq!(b_view.peers.len(), 1);
    assert_eq!(b_view.peers[0].id, id("a1"));
    assert_eq!(b_view.peers[0].role, Role::Responder);
    assert_eq!(b_view.peers[0].phase, Phase::Stable);
    assert_eq!(b_view.peers[0].channel, ChannelState::Open);

    assert_eq!(network.open_links(), 2);
    assert_eq!(network.premature_candidates(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn broadcast_is_delivered_exactly_once() {
    let (a, mut b, _network) = pair().await;

    a.broadcast(Bytes::from_static(b"hello")).unwrap();
    let event = expect_event(&mut b, |event| matches!(event, MeshEvent::Message { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Message {
            from: id("a1"),
            data: Bytes::from_static(b"hello"),
        }
    );
    assert_no_message(&mut b).await;
}

#[test_timeout::tokio_timeout_test]
async fn three_participants_form_a_full_mesh() {
    let addr = start_relay(&["a1", "b1", "c1"]).await;
    let network = MemoryNetwork::new();
    let mut a = join_ready(addr, &network).await;
    let mut b = join_ready(addr, &network).await;
    let mut c = join_ready(addr, &network).await;

    expect_connected_to(&mut a, &["b1", "c1"]).await;
    expect_connected_to(&mut b, &["a1", "c1"]).await;
    expect_connected_to(&mut c, &["a1", "b1"]).await;

    for session in [&a, &b, &c] {
        let view = session.snapshot().await.unwrap();
        assert_eq!(view.peers.len(), 2);
        assert!(view.peers.iter().all(|peer| peer.phase == Phase::Stable));
    }

    let c_view = c.snapshot().await.unwrap();
    assert!(c_view.peers.iter().all(|peer| peer.role == Role::Responder));

    c.broadcast(Bytes::from_static(b"from c")).unwrap();
    for session in [&mut a, &mut b] {
        let event = expect_event(session, |event| matches!(event, MeshEvent::Message { .. })).await;
        assert_eq!(
            event,
            MeshEvent::Message {
                from: id("c1"),
                data: Bytes::from_static(b"from c"),
            }
        );
    }
}

#[test_timeout::tokio_timeout_test]
async fn send_to_reaches_only_the_named_peer() {
    let addr = start_relay(&["a1", "b1", "c1"]).await;
    let network = MemoryNetwork::new();
    let mut a = join_ready(addr, &network).await;
    let mut b = join_ready(addr, &network).await;
    let mut c = join_ready(addr, &network).await;
    expect_connected_to(&mut a, &["b1", "c1"]).await;
    expect_connected_to(&mut b, &["a1", "c1"]).await;
    expect_connected_to(&mut c, &["a1", "b1"]).await;

    a.handle().send_to(id("b1"), "only b").unwrap();
    let event = expect_event(&mut b, |event| matches!(event, MeshEvent::Message { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Message {
            from: id("a1"),
            data: Bytes::from_static(b"only b"),
        }
    );
    assert_no_message(&mut b).await;
    assert_no_message(&mut c).await;

    c.shutdown().await;
    let event = expect_event(&mut a, |event| matches!(event, MeshEvent::PeerLeft(_))).await;
    assert_eq!(event, MeshEvent::PeerLeft(id("c1")));

    a.handle().send_to(id("c1"), "too late").unwrap();
    a.handle().send_to(id("z9"), "nobody").unwrap();
    assert_no_message(&mut b).await;
    let view = a.snapshot().await.unwrap();
    assert_eq!(phase_of(&view, "b1"), Some(Phase::Stable));
    assert!(phase_of(&view, "c1").is_none());
}

#[test_timeout::tokio_timeout_test]
async fn departure_removes_peer_from_registry() {
    let (a, mut b, _network) = pair().await;

    a.shutdown().await;

    let event = expect_event(&mut b, |event| matches!(event, MeshEvent::PeerLeft(_))).await;
    assert_eq!(event, MeshEvent::PeerLeft(id("a1")));
    let view = b.snapshot().await.unwrap();
    assert!(view.peers.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn malformed_candidate_leaves_pair_stable() {
    let (a, mut b, _network) = pair().await;

    b.handle()
        .deliver(SignalEnvelope::Ice {
            to: Some(id("b1")),
            from: Some(id("a1")),
            candidate: IceCandidate::new("garbage"),
        })
        .unwrap();

    let view = b.snapshot().await.unwrap();
    assert_eq!(phase_of(&view, "a1"), Some(Phase::Stable));

    a.broadcast("still here").unwrap();
    let event = expect_event(&mut b, |event| matches!(event, MeshEvent::Message { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Message {
            from: id("a1"),
            data: Bytes::from_static(b"still here"),
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn transport_failure_tears_down_both_sides() {
    let (mut a, mut b, network) = pair().await;

    network.fail(&id("a1"), &id("b1"));

    let event = expect_event(&mut a, |event| matches!(event, MeshEvent::PeerDisconnected(_))).await;
    assert_eq!(event, MeshEvent::PeerDisconnected(id("b1")));
    let event = expect_event(&mut b, |event| matches!(event, MeshEvent::PeerDisconnected(_))).await;
    assert_eq!(event, MeshEvent::PeerDisconnected(id("a1")));

    wait_for(&a, |view| view.peers.is_empty()).await;
    wait_for(&b, |view| view.peers.is_empty()).await;
}

#[test_timeout::tokio_timeout_test]
async fn client_keeps_dialing_until_relay_appears() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let network = MemoryNetwork::new();
    let mut session = join(addr, &network);
    expect_event(&mut session, |event| {
        *event == MeshEvent::Connectivity(Connectivity::Disconnected)
    })
    .await;

    serve_relay(TcpListener::bind(addr).await.unwrap(), &["a1"]);

    expect_event(&mut session, |event| {
        *event == MeshEvent::Connectivity(Connectivity::Connected)
    })
    .await;
    let event = expect_event(&mut session, |event| matches!(event, MeshEvent::Ready { .. })).await;
    assert_eq!(event, MeshEvent::Ready { local_id: id("a1") });
}
