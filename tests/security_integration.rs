//! Mutual authentication between nodes with and without shared secrets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use clipmesh::clipboard::MemoryClipboard;
use clipmesh::{Config, Node};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn addr(port: u16) -> SocketAddr {
    ([127, 0, 0, 1], port).into()
}

fn secure_config(port: u16, secret: Option<&str>) -> Config {
    Config {
        listen_addr: format!("127.0.0.1:{port}"),
        secret: secret.map(str::to_string),
        poll_interval_ms: 50,
        ..Config::default()
    }
}

async fn spawn_node(config: Config) -> Arc<Node> {
    let node = Node::new(config, Arc::new(MemoryClipboard::new())).unwrap();
    tokio::spawn(Arc::clone(&node).run());
    sleep(Duration::from_millis(100)).await;
    node
}

#[tokio::test]
async fn test_shared_secret_nodes_connect() {
    let port = free_port();
    let a = spawn_node(secure_config(port, Some("marmalade"))).await;
    let b = spawn_node(secure_config(free_port(), Some("marmalade"))).await;

    let dialer = Arc::clone(&b);
    tokio::spawn(async move {
        let _ = dialer.connect_to(addr(port)).await;
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while a.peer_count().await != 1 || b.peer_count().await != 1 {
        assert!(Instant::now() < deadline, "secured peers never linked");
        sleep(Duration::from_millis(20)).await;
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_mismatched_secrets_refused() {
    let port = free_port();
    let a = spawn_node(secure_config(port, Some("alpha"))).await;
    let b = spawn_node(secure_config(free_port(), Some("beta"))).await;

    assert!(b.connect_to(addr(port)).await.is_err());
    assert_eq!(a.peer_count().await, 0);
    assert_eq!(b.peer_count().await, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_one_sided_secret_refused() {
    let port = free_port();
    let a = spawn_node(secure_config(port, Some("alpha"))).await;
    let b = spawn_node(secure_config(free_port(), None)).await;

    assert!(b.connect_to(addr(port)).await.is_err());
    assert_eq!(a.peer_count().await, 0);

    a.shutdown().await;
    b.shutdown().await;
}
