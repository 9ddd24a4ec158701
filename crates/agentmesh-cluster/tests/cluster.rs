//! Multi-node scenarios: forwarding, rebalancing and failure handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agentmesh_cluster::{
    AgentError, FrameSource, HostStatus, MembershipEvent, NodeRecord, NodeState, RouteOutcome, TransferState,
};
use agentmesh_transport::{
    Answer, Command, Frame, FrameFlags, HostId, NodeId, TcpTransport, TcpTransportConfig, Transport,
};
use common::{eventually, TestCluster};

const HOST: HostId = HostId::new(42);
const NODE_A: NodeId = NodeId::new(1);
const NODE_B: NodeId = NodeId::new(2);

fn ping() -> Vec<Command> {
    vec![Command::Opaque { name: "Ping".into(), body: vec![] }]
}

#[tokio::test]
async fn test_request_forwarded_to_owner_over_tcp() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    cluster.load_on(1, 42).await;

    let b = &cluster.node(2).manager;
    for _ in 0..3 {
        let answers = b.execute(HOST, ping(), true).await.unwrap();
        assert!(answers[0].result);
        assert!(answers[0].details.contains("host 42"));
    }
    assert!(b.attache(HOST).unwrap().is_forwarding());
    assert!(cluster.node(1).manager.attache(HOST).unwrap().is_local());

    let seqs: Vec<u64> = cluster.node(1).loader.delivered().iter().map(|(_, f)| f.sequence()).collect();
    assert_eq!(seqs.len(), 3);
    assert!(seqs.windows(2).all(|w| w[0] <= w[1]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rebalance_moves_host_to_requesting_node() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    cluster.load_on(1, 42).await;
    let a = &cluster.node(1).manager;
    let b = &cluster.node(2).manager;

    cluster.node(2).planner.plan(NODE_A, vec![HOST]);
    assert_eq!(b.start_rebalance_agents().await.unwrap(), 1);
    assert_eq!(a.coordinator().pending_hosts(), vec![HOST]);
    assert_eq!(cluster.store.transfer(HOST).unwrap().state, TransferState::Requested);

    let report = a.scan_transfers().await;
    assert_eq!(report.started, vec![(HOST, true)]);

    let forwarding = a.attache(HOST).unwrap();
    assert!(forwarding.is_forwarding());
    assert!(!forwarding.in_transfer_mode());
    assert_eq!(forwarding.buffered_count(), 0);
    assert!(b.attache(HOST).unwrap().is_local());

    let record = cluster.store.host(HOST).unwrap();
    assert_eq!(record.owner, Some(NODE_B));
    assert_eq!(record.status, HostStatus::Up);
    assert!(cluster.store.transfer(HOST).is_none());
    let completed = cluster.store.completed_transfers();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].state, TransferState::Completed);

    // Requests sent to the old owner now reach the new one.
    let answers = a.execute(HOST, ping(), false).await.unwrap();
    assert!(answers[0].result);
    assert_eq!(cluster.node(2).loader.delivered().len(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rejected_rebalance_leaves_host_unowned() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    cluster.load_on(1, 42).await;
    let a = &cluster.node(1).manager;
    cluster.node(2).loader.refuse(HOST);

    cluster.node(2).planner.plan(NODE_A, vec![HOST]);
    assert_eq!(cluster.node(2).manager.start_rebalance_agents().await.unwrap(), 1);
    let report = a.scan_transfers().await;
    assert_eq!(report.started, vec![(HOST, false)]);

    assert!(a.attache(HOST).is_none());
    assert!(cluster.node(2).manager.attache(HOST).is_none());
    let record = cluster.store.host(HOST).unwrap();
    assert_eq!(record.owner, None);
    assert_eq!(record.status, HostStatus::Disconnected);
    assert_eq!(cluster.store.completed_transfers().len(), 1);

    // The direct-host scan picks it up again.
    let report = cluster.node(1).manager.scan_direct_hosts().await.unwrap();
    assert_eq!(report.loaded, vec![HOST]);
    assert_eq!(cluster.store.host(HOST).unwrap().owner, Some(NODE_A));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stuck_transfer_abandoned_without_touching_attache() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    cluster.node(1).loader.mute(HOST);
    cluster.load_on(1, 42).await;
    let a = &cluster.node(1).manager;
    let local = a.attache(HOST).unwrap();
    let busy = Frame::request(HOST, NODE_A, 1, &ping(), true).unwrap();
    local.send(busy).await.unwrap();

    cluster.node(2).planner.plan(NODE_A, vec![HOST]);
    assert_eq!(cluster.node(2).manager.start_rebalance_agents().await.unwrap(), 1);

    let report = a.scan_transfers().await;
    assert_eq!(report.waiting, vec![HOST]);

    cluster.clock.advance(Duration::from_secs(301));
    let report = a.scan_transfers().await;
    assert_eq!(report.abandoned, vec![HOST]);
    assert!(a.coordinator().pending_hosts().is_empty());
    assert!(cluster.store.transfer(HOST).is_none());
    assert!(Arc::ptr_eq(&a.attache(HOST).unwrap(), &local));
    assert!(!local.is_closed());
    assert_eq!(local.queue_size(), 1);
    assert_eq!(cluster.store.host(HOST).unwrap().owner, Some(NODE_A));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_route_to_dead_peer_returns_false() {
    let cluster = TestCluster::new(1).await;
    cluster.directory.upsert(NodeRecord::up(NodeId::new(3), "127.0.0.1:1"));
    let a = &cluster.node(1).manager;

    assert!(!a.cancel(NodeId::new(3), HOST, 9, "gone").await.unwrap());
    assert!(!a.cancel(NodeId::new(4), HOST, 9, "gone").await.unwrap());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_answer_for_unknown_agent_is_dropped() {
    let cluster = TestCluster::new(1).await;
    let a = &cluster.node(1).manager;
    let request = Frame::request(HostId::new(99), NODE_A, 5, &ping(), false).unwrap();
    let answer = Frame::response(&request.header, &[Answer::success("late")]).unwrap();

    let outcome = a.router().route(FrameSource::Direct(HostId::new(99)), answer).await;
    assert_eq!(outcome, RouteOutcome::AnswerDropped);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_request_for_unreachable_host_fails() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    let err = cluster.node(2).manager.execute(HOST, ping(), false).await.unwrap_err();
    assert!(matches!(err, AgentError::AgentUnavailable { .. }));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_left_releases_its_hosts() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    cluster.load_on(2, 42).await;
    cluster.directory.set_state(NODE_B, NodeState::Down);

    let left = NodeRecord { state: NodeState::Down, ..NodeRecord::up(NODE_B, cluster.node(2).addr.clone()) };
    cluster.node(1).manager.on_membership_event(MembershipEvent::NodesLeft(vec![left])).await.unwrap();
    let record = cluster.store.host(HOST).unwrap();
    assert_eq!(record.owner, None);

    let report = cluster.node(1).manager.scan_direct_hosts().await.unwrap();
    assert_eq!(report.loaded, vec![HOST]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_host_link_serves_forwarded_requests() {
    let cluster = TestCluster::new(2).await;
    cluster.add_host(42, 1);
    let a_addr = cluster.node(1).addr.clone();

    let transport = TcpTransport::new(TcpTransportConfig::default());
    let host_link = transport.connect(&a_addr).await.unwrap();
    let mut hello = Frame::request(HOST, NodeId::UNKNOWN, 0, &ping(), false).unwrap();
    hello.header.flags.set(FrameFlags::FROM_SERVER, false);
    host_link.send_frame(&hello).await.unwrap();

    let store = cluster.store.clone();
    assert!(eventually(|| store.host(HOST).map(|h| h.owner == Some(NODE_A)).unwrap_or(false)).await);

    let b = cluster.node(2).manager.clone();
    let pending = tokio::spawn(async move { b.execute(HOST, ping(), true).await });

    let request = host_link.recv_frame().await.unwrap();
    assert!(request.from_server());
    assert_eq!(request.origin(), NODE_B);
    let reply = Frame::response(&request.header, &[Answer::success("pong")]).unwrap();
    host_link.send_frame(&reply).await.unwrap();

    let answers = pending.await.unwrap().unwrap();
    assert_eq!(answers, vec![Answer::success("pong")]);
    let owner = cluster.node(1).manager.attache(HOST).unwrap();
    assert!(eventually(|| owner.queue_size() == 0).await);

    host_link.close().await;
    cluster.shutdown().await;
}
