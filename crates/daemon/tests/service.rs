//! The service as the daemon runs it

use std::time::Duration;

use sigma_daemon::{spawn_service, ServiceConfig};
use sigmaclnt::{FdClient, SessClnt};
use sigmap::{Mode, Perm};
use sigmasrv::{StatsSnapshot, STATS_FILE};

fn config(replicated: bool) -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        replicated,
        ..Default::default()
    }
}

async fn client(addr: std::net::SocketAddr) -> FdClient {
    let sess = SessClnt::connect(addr).await.unwrap();
    FdClient::attach(sess, "").await.unwrap()
}

#[tokio::test]
async fn test_serves_until_shutdown() {
    let handle = spawn_service(&config(false)).await.unwrap();
    let addr = handle.addr();
    let c = client(addr).await;

    c.put_file("/motd", Perm(0o644), Mode::OWRITE, b"hi", None)
        .await
        .unwrap();
    assert_eq!(c.get_file("/motd").await.unwrap(), b"hi");

    let stats: StatsSnapshot =
        serde_json::from_slice(&c.get_file(STATS_FILE).await.unwrap()).unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.ops.get("Tputfile"), Some(&1));
    assert_eq!(handle.state().log_len(), None);

    let fs = handle.state().fs().clone();
    handle.shutdown().await.unwrap();
    assert!(fs.sessions().is_empty());
    let refused = tokio::time::timeout(Duration::from_secs(5), SessClnt::connect(addr))
        .await
        .unwrap();
    assert!(refused.is_err());
}

#[tokio::test]
async fn test_replicated_service_logs_mutations() {
    let handle = spawn_service(&config(true)).await.unwrap();
    let c = client(handle.addr()).await;
    let before = handle.state().log_len().unwrap();

    c.put_file("/a", Perm(0o644), Mode::OWRITE, b"1", None)
        .await
        .unwrap();
    c.rename("/a", "/b").await.unwrap();
    assert_eq!(c.get_file("/b").await.unwrap(), b"1");
    assert!(handle.state().log_len().unwrap() > before);
    assert!(handle.state().fs().is_replicated());

    handle.shutdown().await.unwrap();
}
