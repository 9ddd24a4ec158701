//! Connector and link server wired together over real loopback sockets.

use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_transport::tls::{generate_node_cert, generate_self_signed_ca};
use agentmesh_transport::{
    Command, ConnectorConfig, Frame, FrameHandler, HostId, LinkContext, LinkServer, NodeId,
    PeerConnector, PeerResolver, TcpTransport, TcpTransportConfig, TlsConfig, TlsTcpTransport,
    Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

struct Resolver(Mutex<HashMap<NodeId, String>>);

#[async_trait]
impl PeerResolver for Resolver {
    async fn resolve(&self, peer: NodeId) -> Option<String> {
        self.0.lock().get(&peer).cloned()
    }
}

struct Collect(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl FrameHandler for Collect {
    async fn handle(&self, _link: &Arc<LinkContext>, frame: Frame) {
        let _ = self.0.send(frame);
    }
}

fn opaque(seq: u64) -> Frame {
    let cmds = [Command::Opaque { name: "Ready".into(), body: seq.to_be_bytes().to_vec() }];
    Frame::request(HostId::new(42), NodeId::new(1), seq, &cmds, true).unwrap()
}

async fn start_server(
    transport: &dyn Transport,
) -> (String, mpsc::UnboundedReceiver<Frame>, oneshot::Sender<()>) {
    let listener = transport.listen("127.0.0.1:0").await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let server = LinkServer::new(listener, Arc::new(Collect(tx)));
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(server.serve_until(async move {
        let _ = stop_rx.await;
    }));
    (addr, rx, stop_tx)
}

#[tokio::test]
async fn test_route_over_tls_preserves_order() {
    let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
    let (b_cert, b_key) = generate_node_cert(&ca_cert, &ca_key, "localhost").unwrap();
    let (a_cert, a_key) = generate_node_cert(&ca_cert, &ca_key, "node-a").unwrap();

    let node_b = TlsTcpTransport::new(
        TcpTransportConfig::default(),
        &TlsConfig::new(ca_cert.clone(), b_cert, b_key, true),
    )
    .unwrap();
    let (addr, mut frames, stop) = start_server(&node_b).await;
    let addr = addr.replace("127.0.0.1", "localhost");

    let node_a = TlsTcpTransport::new(
        TcpTransportConfig::default(),
        &TlsConfig::new(ca_cert, a_cert, a_key, true),
    )
    .unwrap();
    let resolver = Resolver(Mutex::new(HashMap::from([(NodeId::new(2), addr)])));
    let connector = PeerConnector::new(Arc::new(node_a), Arc::new(resolver), ConnectorConfig::default());

    for seq in 1..=3 {
        assert!(connector.route(NodeId::new(2), &opaque(seq)).await);
    }
    for seq in 1..=3 {
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.sequence(), seq);
        assert!(frame.requires_sequential());
    }
    assert_eq!(connector.cached_peers(), vec![NodeId::new(2)]);

    connector.close_all().await;
    let _ = stop.send(());
}

#[tokio::test]
async fn test_route_to_down_peer_returns_false() {
    let down = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = down.local_addr().unwrap().to_string();
    drop(down);

    let resolver = Resolver(Mutex::new(HashMap::from([(NodeId::new(2), addr)])));
    let connector = PeerConnector::new(
        Arc::new(TcpTransport::default()),
        Arc::new(resolver),
        ConnectorConfig::default(),
    );
    assert!(!connector.route(NodeId::new(2), &opaque(1)).await);
}

#[tokio::test]
async fn test_route_recovers_after_peer_restart() {
    let transport = TcpTransport::default();
    let (addr, mut frames, stop) = start_server(&transport).await;
    let resolver = Arc::new(Resolver(Mutex::new(HashMap::from([(NodeId::new(2), addr)]))));
    let connector =
        PeerConnector::new(Arc::new(TcpTransport::default()), resolver.clone(), ConnectorConfig::default());

    assert!(connector.route(NodeId::new(2), &opaque(1)).await);
    assert_eq!(frames.recv().await.unwrap().sequence(), 1);
    let _ = stop.send(());

    let (addr, mut frames, stop) = start_server(&transport).await;
    resolver.0.lock().insert(NodeId::new(2), addr);
    // The cached link points at the stopped server; the connector re-dials.
    connector.close(NodeId::new(2)).await;
    assert!(connector.route(NodeId::new(2), &opaque(2)).await);
    assert_eq!(frames.recv().await.unwrap().sequence(), 2);
    let _ = stop.send(());
}

#[tokio::test]
async fn test_silent_socket_does_not_hold_up_tls_peers() {
    let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
    let (b_cert, b_key) = generate_node_cert(&ca_cert, &ca_key, "localhost").unwrap();
    let (a_cert, a_key) = generate_node_cert(&ca_cert, &ca_key, "node-a").unwrap();

    let node_b = TlsTcpTransport::new(
        TcpTransportConfig::default(),
        &TlsConfig::new(ca_cert.clone(), b_cert, b_key, true),
    )
    .unwrap();
    let (addr, mut frames, stop) = start_server(&node_b).await;

    // Connects but never starts the handshake.
    let _silent = tokio::net::TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let node_a = TlsTcpTransport::new(
        TcpTransportConfig::default(),
        &TlsConfig::new(ca_cert, a_cert, a_key, true),
    )
    .unwrap();
    let addr = addr.replace("127.0.0.1", "localhost");
    let delivered = tokio::time::timeout(std::time::Duration::from_secs(3), async {
        let conn = node_a.connect(&addr).await.unwrap();
        conn.send_frame(&opaque(7)).await.unwrap();
        frames.recv().await.unwrap()
    })
    .await
    .expect("TLS peer stalled behind a silent socket");
    assert_eq!(delivered.sequence(), 7);
    let _ = stop.send(());
}
