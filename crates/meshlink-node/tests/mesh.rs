use meshlink_node::{Contact, MeshError, NodeEvent, Server, ServerConfig, UpdateOptions};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn node() -> Server {
    Server::bind(ServerConfig::new(0).with_host("127.0.0.1"))
        .await
        .expect("bind")
}

/// Skip events until `pick` accepts one.
async fn wait_for<T>(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut pick: impl FnMut(&NodeEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("node stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connected(events: &mut broadcast::Receiver<NodeEvent>, peer: &Contact) {
    wait_for(events, |e| matches!(e, NodeEvent::Connected(c) if c == peer).then_some(())).await
}

async fn disconnected(events: &mut broadcast::Receiver<NodeEvent>, peer: &Contact) {
    wait_for(events, |e| {
        matches!(e, NodeEvent::Disconnected(c) if c == peer).then_some(())
    })
    .await
}

async fn error(events: &mut broadcast::Receiver<NodeEvent>) -> std::sync::Arc<MeshError> {
    wait_for(events, |e| match e {
        NodeEvent::Error(err) => Some(err.clone()),
        _ => None,
    })
    .await
}

/// `a` dials `b` and both sides commit.
async fn link(a: &Server, b: &Server) {
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    a.connect_peer(b.contact()).unwrap();
    connected(&mut a_events, b.contact()).await;
    connected(&mut b_events, a.contact()).await;
}

#[tokio::test]
async fn two_nodes_connect() {
    let a = node().await;
    let b = node().await;
    link(&b, &a).await;

    assert_eq!(a.peers().await.unwrap(), vec![b.contact().clone()]);
    assert_eq!(b.peers().await.unwrap(), vec![a.contact().clone()]);
}

#[tokio::test]
async fn membership_propagates_through_three_nodes() {
    let a = node().await;
    let b = node().await;
    let c = node().await;
    let mut b_events = b.subscribe();

    link(&b, &a).await;

    let mut a_events = a.subscribe();
    c.connect_peer(a.contact()).unwrap();
    connected(&mut a_events, c.contact()).await;

    assert_eq!(
        a.peers().await.unwrap(),
        vec![b.contact().clone(), c.contact().clone()]
    );
    let seen_by_b = wait_for(&mut b_events, |e| match e {
        NodeEvent::PeersReceived { peer, peers } if peer == a.contact() => Some(peers.clone()),
        _ => None,
    })
    .await;
    assert!(seen_by_b.contains(c.contact()));
    assert!(!seen_by_b.contains(a.contact()));

    let view = a.peer(b.contact()).await.unwrap().expect("b is a member");
    assert_eq!(view.peers, vec![c.contact().clone()]);

    let mut c_events = c.subscribe();
    a.disconnect_peer(b.contact()).unwrap();
    disconnected(&mut a_events, b.contact()).await;
    disconnected(&mut b_events, a.contact()).await;

    assert_eq!(a.peers().await.unwrap(), vec![c.contact().clone()]);
    assert!(b.peers().await.unwrap().is_empty());

    let seen_by_c = wait_for(&mut c_events, |e| match e {
        NodeEvent::PeersReceived { peer, peers } if peer == a.contact() => Some(peers.clone()),
        _ => None,
    })
    .await;
    assert!(!seen_by_c.contains(b.contact()));
    let view = c.peer(a.contact()).await.unwrap().expect("a is a member");
    assert!(!view.peers.contains(b.contact()));
}

#[tokio::test]
async fn second_connect_is_rejected_locally() {
    let a = node().await;
    let b = node().await;
    link(&a, &b).await;

    let mut events = a.subscribe();
    a.connect_peer(b.contact()).unwrap();
    let err = error(&mut events).await;
    assert!(matches!(&*err, MeshError::AlreadyConnected(c) if c == b.contact()));
    assert_eq!(a.peers().await.unwrap(), vec![b.contact().clone()]);

    let mut events = b.subscribe();
    b.connect_peer(a.contact()).unwrap();
    let err = error(&mut events).await;
    assert!(matches!(&*err, MeshError::AlreadyConnected(_)));
    assert_eq!(b.peers().await.unwrap(), vec![a.contact().clone()]);
}

#[tokio::test]
async fn refuses_own_contact() {
    let a = node().await;
    let mut events = a.subscribe();
    a.connect_peer(a.contact()).unwrap();
    let err = error(&mut events).await;
    assert!(matches!(&*err, MeshError::SelfConnection(_)));
    assert!(a.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn disconnecting_a_stranger_fails() {
    let a = node().await;
    let mut events = a.subscribe();
    a.disconnect_peer("127.0.0.1:1").unwrap();
    let err = error(&mut events).await;
    assert!(matches!(&*err, MeshError::NotConnected(c) if *c == Contact::new("127.0.0.1", 1)));
}

#[tokio::test]
async fn unreachable_peer_reports_connect_error() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let a = node().await;
    let mut events = a.subscribe();
    a.connect_peer(("127.0.0.1", port)).unwrap();
    let err = error(&mut events).await;
    assert!(matches!(&*err, MeshError::Connect { .. }));

    // the failed dial no longer counts as in flight
    let b = node().await;
    link(&a, &b).await;
}

#[tokio::test]
async fn state_flows_both_ways() {
    let a = node().await;
    let b = node().await;
    link(&a, &b).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.update_state(json!({ "a": 1 })).unwrap();
    let state = wait_for(&mut b_events, |e| match e {
        NodeEvent::StateUpdated { peer, state } if peer == a.contact() => Some(state.clone()),
        _ => None,
    })
    .await;
    assert_eq!(state, json!({ "a": 1 }));
    assert_eq!(a.state().await.unwrap(), json!({ "a": 1 }));

    b.update_state(json!({ "b": 2 })).unwrap();
    wait_for(&mut a_events, |e| {
        matches!(e, NodeEvent::StateUpdated { .. }).then_some(())
    })
    .await;
    let view = a.peer(b.contact()).await.unwrap().unwrap();
    assert_eq!(view.state, json!({ "b": 2 }));
}

#[tokio::test]
async fn updates_respect_resend_cap() {
    let a = node().await;
    let b = node().await;
    link(&a, &b).await;
    let mut a_events = a.subscribe();

    b.update_state(json!({ "x": 1 })).unwrap();
    wait_for(&mut a_events, |e| {
        matches!(e, NodeEvent::StateUpdated { .. }).then_some(())
    })
    .await;

    let options = UpdateOptions {
        max_resends: 1,
        max_updates: 16,
    };
    let updates = a.updates(options).await.unwrap();
    assert!(updates.iter().all(|u| &u.peer == b.contact()));
    assert!(updates.iter().any(|u| u.cmd == "requestHandshake"));
    assert!(
        updates
            .iter()
            .any(|u| u.cmd == "updateState" && u.data == Some(json!({ "x": 1 })))
    );

    assert!(a.updates(options).await.unwrap().is_empty());
}

#[tokio::test]
async fn stopped_node_refuses_requests() {
    let a = node().await;
    a.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(a.peers().await, Err(MeshError::Stopped)));
    assert!(matches!(
        a.connect_peer("127.0.0.1:1"),
        Err(MeshError::Stopped)
    ));
}

#[tokio::test]
async fn disconnecting_the_last_peer_commits_without_a_round() {
    let a = node().await;
    let b = node().await;
    link(&a, &b).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.disconnect_peer(b.contact()).unwrap();
    disconnected(&mut a_events, b.contact()).await;

    let mut announced = false;
    wait_for(&mut b_events, |e| match e {
        NodeEvent::PeersReceived { .. } => {
            announced = true;
            None
        }
        NodeEvent::Disconnected(c) if c == a.contact() => Some(()),
        _ => None,
    })
    .await;
    assert!(!announced, "no peers remained, so nothing should be announced");

    assert!(a.peers().await.unwrap().is_empty());
    assert!(b.peers().await.unwrap().is_empty());
}
