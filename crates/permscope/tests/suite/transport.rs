use std::time::{Duration, Instant};

use permscope::transport::{connect_with_policy, ConnectPolicy};
use permscope::TraceError;
use permscope_jdwp::wire::mock::{MockHeap, MockJdwpServer};
use permscope_jdwp::wire::JdwpClientConfig;

/// An address nothing listens on.
async fn closed_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[tokio::test]
async fn attaches_to_a_listening_target() {
    let server = MockJdwpServer::spawn(MockHeap::new()).await.unwrap();
    let policy = ConnectPolicy {
        wait: false,
        timeout: Duration::from_secs(1),
        retry_interval: Duration::from_millis(100),
    };
    let client = connect_with_policy(&server.addr().to_string(), policy, JdwpClientConfig::default())
        .await
        .unwrap();
    client.vm_dispose().await.unwrap();
}

#[tokio::test]
async fn refused_connections_fail_fast_without_wait() {
    let address = closed_address().await;
    let policy = ConnectPolicy {
        wait: false,
        timeout: Duration::from_secs(60),
        retry_interval: Duration::from_secs(30),
    };

    let started = Instant::now();
    let err = connect_with_policy(&address, policy, JdwpClientConfig::default())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        TraceError::Transport { address: reported, .. } => assert_eq!(reported, address),
        other => panic!("expected a transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn waiting_gives_up_at_the_deadline() {
    let address = closed_address().await;
    let policy = ConnectPolicy {
        wait: true,
        timeout: Duration::from_millis(300),
        retry_interval: Duration::from_millis(50),
    };

    let started = Instant::now();
    let err = connect_with_policy(&address, policy, JdwpClientConfig::default())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "kept retrying for {elapsed:?}");
    assert!(matches!(err, TraceError::Transport { .. }), "{err:?}");
    assert!(err.is_fatal());
}
