//! End-to-end mesh tests over loopback WebSocket connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use clipmesh::clipboard::{ClipboardProvider, MemoryClipboard};
use clipmesh::node::NodeError;
use clipmesh::{Config, Error, Node};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn addr(port: u16) -> SocketAddr {
    ([127, 0, 0, 1], port).into()
}

fn mesh_config(port: u16) -> Config {
    Config {
        listen_addr: format!("127.0.0.1:{port}"),
        poll_interval_ms: 50,
        ..Config::default()
    }
}

struct Mesh {
    node: Arc<Node>,
    clipboard: Arc<MemoryClipboard>,
    port: u16,
}

async fn spawn_node(config: Config) -> Mesh {
    let port = config.listen_port();
    let clipboard = Arc::new(MemoryClipboard::new());
    let node = Node::new(config, clipboard.clone()).unwrap();
    tokio::spawn(Arc::clone(&node).run());
    // Give the listener a moment to bind.
    sleep(Duration::from_millis(100)).await;
    Mesh { node, clipboard, port }
}

async fn link(dialer: &Mesh, listener: &Mesh) {
    let node = Arc::clone(&dialer.node);
    let target = addr(listener.port);
    tokio::spawn(async move {
        let _ = node.connect_to(target).await;
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while dialer.node.peer_count().await != 1 || listener.node.peer_count().await != 1 {
        assert!(Instant::now() < deadline, "peers never linked");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_content(mesh: &Mesh, expected: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while mesh.clipboard.get().await.unwrap() != expected {
        assert!(Instant::now() < deadline, "clipboard never converged");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_clipboard_propagates_between_two_nodes() {
    let a = spawn_node(mesh_config(free_port())).await;
    let b = spawn_node(mesh_config(free_port())).await;
    link(&b, &a).await;

    a.clipboard.set(b"hello mesh").await.unwrap();
    wait_for_content(&b, b"hello mesh").await;

    // The origin must not get its own change echoed back.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(a.clipboard.get().await.unwrap(), b"hello mesh");

    a.node.shutdown().await;
    b.node.shutdown().await;
}

#[tokio::test]
async fn test_clipboard_propagates_across_a_chain() {
    let a = spawn_node(mesh_config(free_port())).await;
    let b = spawn_node(mesh_config(free_port())).await;
    let c = spawn_node(mesh_config(free_port())).await;
    link(&b, &a).await;
    // b now has one peer; c links to b, making b the relay.
    let node = Arc::clone(&c.node);
    let target = addr(b.port);
    tokio::spawn(async move {
        let _ = node.connect_to(target).await;
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while b.node.peer_count().await != 2 {
        assert!(Instant::now() < deadline, "chain never formed");
        sleep(Duration::from_millis(20)).await;
    }

    a.clipboard.set(b"via relay").await.unwrap();
    wait_for_content(&b, b"via relay").await;
    wait_for_content(&c, b"via relay").await;

    a.node.shutdown().await;
    b.node.shutdown().await;
    c.node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_connection_rejected() {
    let a = spawn_node(mesh_config(free_port())).await;
    let b = spawn_node(mesh_config(free_port())).await;
    link(&b, &a).await;

    let result = b.node.connect_to(addr(a.port)).await;
    match result {
        Err(Error::Node(NodeError::AlreadyConnected(id))) => {
            assert_eq!(id, a.node.id());
        }
        Err(other) => panic!("expected AlreadyConnected, got {other}"),
        Ok(()) => panic!("redundant edge was accepted"),
    }
    assert_eq!(b.node.peer_count().await, 1);

    a.node.shutdown().await;
    b.node.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_relays_across_a_chain() {
    let mut configs = Vec::new();
    for _ in 0..3 {
        let mut config = mesh_config(free_port());
        config.announce_threshold = 256;
        configs.push(config);
    }
    let a = spawn_node(configs.remove(0)).await;
    let b = spawn_node(configs.remove(0)).await;
    let c = spawn_node(configs.remove(0)).await;
    link(&b, &a).await;
    let node = Arc::clone(&c.node);
    let target = addr(b.port);
    tokio::spawn(async move {
        let _ = node.connect_to(target).await;
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while b.node.peer_count().await != 2 {
        assert!(Instant::now() < deadline, "chain never formed");
        sleep(Duration::from_millis(20)).await;
    }

    // The body must reach the far end even though the announcer is two hops
    // away and only the relay can serve the request.
    let big = vec![0x7e; 8192];
    a.clipboard.set(&big).await.unwrap();
    wait_for_content(&b, &big).await;
    wait_for_content(&c, &big).await;

    a.node.shutdown().await;
    b.node.shutdown().await;
    c.node.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_travels_via_announce() {
    let mut config_a = mesh_config(free_port());
    config_a.announce_threshold = 256;
    let mut config_b = mesh_config(free_port());
    config_b.announce_threshold = 256;

    let a = spawn_node(config_a).await;
    let b = spawn_node(config_b).await;
    link(&b, &a).await;

    let big = vec![0x5a; 4096];
    a.clipboard.set(&big).await.unwrap();
    wait_for_content(&b, &big).await;

    a.node.shutdown().await;
    b.node.shutdown().await;
}
