//! Two full routers on loopback, each hosting one destination with 1-hop
//! pools through the other: the smallest real overlay.
//!
//! A opens a stream to B, writes `"hello world\r\n"`, and closes; B's
//! accepted stream observes exactly those bytes followed by EOF.
//!
//! Run with: cargo test -p garliccraft-tests two_router_network -- --ignored --nocapture

use std::time::Duration;

use garliccraft_router::{Router, RouterConfig};
use garliccraft_tunnel::PoolConfig;

fn config(dir: &std::path::Path, port: u16) -> RouterConfig {
    RouterConfig {
        data_dir: dir.to_path_buf(),
        host: "127.0.0.1".to_string(),
        port,
        v6: false,
        floodfill: true,
        bandwidth: 'O',
        max_participating: 100,
        explicit_peers: Vec::new(),
    }
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "binds fixed localhost ports and takes ~1 minute"]
async fn loopback_streaming_between_two_routers() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let router_a = Router::start(config(dir_a.path(), 47731)).await.unwrap();
    let router_b = Router::start(config(dir_b.path(), 47732)).await.unwrap();

    // seed each side's netdb with the other's RouterInfo
    router_a
        .netdb()
        .add_router_info(&router_b.context().router_info().to_bytes())
        .unwrap();
    router_b
        .netdb()
        .add_router_info(&router_a.context().router_info().to_bytes())
        .unwrap();

    // 1-hop pools through the opposite router
    let pool_a = PoolConfig {
        inbound_count: 2,
        outbound_count: 2,
        length: 1,
        explicit_peers: Some(vec![router_b.context().hash()]),
    };
    let pool_b = PoolConfig {
        inbound_count: 2,
        outbound_count: 2,
        length: 1,
        explicit_peers: Some(vec![router_a.context().hash()]),
    };
    let (dest_a, _datagrams_a) = router_a.create_destination(pool_a).unwrap();
    let (dest_b, _datagrams_b) = router_b.create_destination(pool_b).unwrap();

    // both destinations need tunnels in each direction
    let a = dest_a.clone();
    let b = dest_b.clone();
    assert!(
        wait_until(Duration::from_secs(60), move || a.is_ready() && b.is_ready()).await,
        "tunnel pools never became ready"
    );

    let acceptor = dest_b.clone();
    let reader = tokio::spawn(async move {
        let stream = acceptor.accept_stream().await.expect("inbound stream");
        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        collected
    });

    let stream = tokio::time::timeout(
        Duration::from_secs(30),
        dest_a.create_stream(dest_b.hash(), 0),
    )
    .await
    .expect("lease set resolvable")
    .expect("stream created");
    stream.write(b"hello world\r\n").await.unwrap();
    stream.close().await.unwrap();

    let collected = tokio::time::timeout(Duration::from_secs(60), reader)
        .await
        .expect("reader finished")
        .unwrap();
    assert_eq!(collected, b"hello world\r\n");

    router_a.stop().await;
    router_b.stop().await;
}
