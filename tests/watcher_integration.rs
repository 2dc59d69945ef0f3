//! File system watcher feeding a client.
//!
//! Event delivery is asynchronous, so every check polls with a deadline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use treesync::client::{ChangeKind, Client};
use treesync::config::{ClientConfig, RetryPolicy, ServerConfig};
use treesync::events::{ConnectionState, NullObserver};
use treesync::server::Server;
use treesync::watcher::FsWatcher;

fn client_config(root: &Path, server_addr: String) -> ClientConfig {
    ClientConfig {
        server_addr,
        root: root.to_path_buf(),
        sync_interval_secs: 0,
        retry: RetryPolicy::fixed(Duration::from_millis(50), Some(5)),
        ..ClientConfig::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_watcher_records_pending_changes() {
    let temp_dir = TempDir::new().unwrap();
    let client = Client::new(
        client_config(temp_dir.path(), "127.0.0.1:1".into()),
        Arc::new(NullObserver),
    );
    let handle = client.handle();
    let watcher = FsWatcher::start(temp_dir.path(), handle.clone()).unwrap();
    assert_eq!(watcher.root(), temp_dir.path());

    // Give the backend a moment to register the watch.
    sleep(Duration::from_millis(100)).await;
    tokio::fs::create_dir_all(temp_dir.path().join("sub")).await.unwrap();
    tokio::fs::write(temp_dir.path().join("sub/new.txt"), b"hello")
        .await
        .unwrap();

    eventually("sub/new.txt to be pending", || {
        handle
            .pending_changes()
            .iter()
            .any(|(path, _)| path == "sub/new.txt")
    })
    .await;

    tokio::fs::remove_file(temp_dir.path().join("sub/new.txt"))
        .await
        .unwrap();
    eventually("removal to be recorded", || {
        handle
            .pending_changes()
            .iter()
            .any(|(path, kind)| path == "sub/new.txt" && *kind == ChangeKind::Removed)
    })
    .await;
}

#[tokio::test]
async fn test_watcher_ignores_partial_files() {
    let temp_dir = TempDir::new().unwrap();
    let client = Client::new(
        client_config(temp_dir.path(), "127.0.0.1:1".into()),
        Arc::new(NullObserver),
    );
    let handle = client.handle();
    let _watcher = FsWatcher::start(temp_dir.path(), handle.clone()).unwrap();

    sleep(Duration::from_millis(100)).await;
    tokio::fs::write(temp_dir.path().join(".x.123.tsync-part"), b"junk")
        .await
        .unwrap();
    tokio::fs::write(temp_dir.path().join("real.txt"), b"data")
        .await
        .unwrap();

    eventually("real.txt to be pending", || {
        handle
            .pending_changes()
            .iter()
            .any(|(path, _)| path == "real.txt")
    })
    .await;
    assert!(handle
        .pending_changes()
        .iter()
        .all(|(path, _)| !path.ends_with(".tsync-part")));
}

#[tokio::test]
async fn test_watched_edit_reaches_server() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();

    let server = Server::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        root: remote.path().to_path_buf(),
        ..ServerConfig::default()
    })
    .await
    .unwrap()
    .spawn();
    let addr = server.local_addr().unwrap();

    let mut client = Client::new(client_config(local.path(), addr.to_string()), Arc::new(NullObserver));
    client.connect().await.unwrap();
    let handle = client.handle();
    let _watcher = FsWatcher::start(local.path(), handle.clone()).unwrap();

    eventually("the client to connect", || handle.state() == ConnectionState::Connected).await;
    // Let the initial pass settle before editing.
    eventually("the initial pass", || handle.trigger_sync()).await;
    sleep(Duration::from_millis(200)).await;

    tokio::fs::write(local.path().join("edited.txt"), b"pushed by watcher")
        .await
        .unwrap();

    let target = remote.path().join("edited.txt");
    eventually("edited.txt on the server", || {
        std::fs::read(&target).map_or(false, |data| data == b"pushed by watcher")
    })
    .await;

    client.disconnect().await;
    server.shutdown().await;
}
