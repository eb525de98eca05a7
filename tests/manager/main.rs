//! End-to-end tests for the download manager
//!
//! A local HTTP server stands in for the network; transfers go through the
//! real reqwest transport, the manager actor and an in-memory metadata store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use download_manager::app::{
    ClientConfig, DownloadManager, DownloadRequest, GroupItem, GroupRequest, ManagerConfig,
    ManagerHandle, ManualProbe, MemoryStore, Metadata, NetworkMode, Notification,
    ReqwestTransport, StaticResolver, TransferEvent, TransferId, TransferState,
};
use download_manager::constants::{metadata, MAX_REDIRECTS};
use download_manager::errors::{NetworkErrorCode, TransferError};
use httpmock::prelude::*;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

struct Harness {
    manager: ManagerHandle,
    store: MemoryStore,
    _probe: ManualProbe,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let probe = ManualProbe::new(NetworkMode::Ethernet);
        let manager = spawn_manager(dir.path(), &store, &probe);
        Self {
            manager,
            store,
            _probe: probe,
            dir,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn spawn_manager(root: &Path, store: &MemoryStore, probe: &ManualProbe) -> ManagerHandle {
    let transport = ReqwestTransport::from_config(&ClientConfig::default()).unwrap();
    let config = ManagerConfig {
        download_root: root.to_path_buf(),
        ..Default::default()
    };
    let (manager, _task) = DownloadManager::spawn(
        config,
        Arc::new(transport),
        Arc::new(StaticResolver::unconfined(root)),
        Arc::new(store.clone()),
        probe,
    );
    manager
}

/// Collect the events of `id` up to and including its final one
async fn wait_final(
    events: &mut broadcast::Receiver<Notification>,
    id: TransferId,
) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(Notification { id: from, event }) if from == id => {
                    let done = event.is_final();
                    seen.push(event);
                    if done {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("transfer did not finish in time");
    seen
}

#[tokio::test]
async fn test_download_is_verified_and_collected() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/hello.txt");
            then.status(200).body("hello world");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download(
            "tests",
            DownloadRequest::new(server.url("/hello.txt")).with_hash(HELLO_MD5, "md5"),
        )
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    let target = h.path("hello.txt");
    assert_eq!(seen.last(), Some(&TransferEvent::Finished(target.clone())));
    assert!(seen.contains(&TransferEvent::Started(true)));
    assert!(seen
        .iter()
        .any(|e| matches!(e, TransferEvent::Processing(_))));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello world");
    assert!(!h.path("hello.txt.tmp").exists());
    mock.assert_async().await;

    assert_eq!(download.state().await.unwrap(), TransferState::Uncollected);
    assert_eq!(download.progress().await.unwrap(), (11, 11));

    download.collected().await.unwrap();
    assert!(!h.store.contains(&download.id()));
    assert!(download.state().await.is_err());
    assert!(target.exists());
}

#[tokio::test]
async fn test_checksum_mismatch_reports_error_and_removes_data() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/corrupt.txt");
            then.status(200).body("hello wordl");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download(
            "tests",
            DownloadRequest::new(server.url("/corrupt.txt")).with_hash(HELLO_MD5, "md5"),
        )
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    match seen.last() {
        Some(TransferEvent::Error(TransferError::Hash { expected, .. })) => {
            assert_eq!(expected, HELLO_MD5);
        }
        other => panic!("expected a hash error, got {:?}", other),
    }
    assert!(!h.path("corrupt.txt").exists());
    assert!(!h.path("corrupt.txt.tmp").exists());
    assert_eq!(download.state().await.unwrap(), TransferState::Error);
    assert!(download.info().await.unwrap().last_error.is_some());
}

#[tokio::test]
async fn test_http_error_status_fails_transfer() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/missing.bin");
            then.status(404);
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download("tests", DownloadRequest::new(server.url("/missing.bin")))
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    assert!(matches!(
        seen.last(),
        Some(TransferEvent::Error(TransferError::Http { status: 404, .. }))
    ));
    assert!(!h.path("missing.bin").exists());
}

#[tokio::test]
async fn test_custom_headers_are_sent() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/private.bin")
                .header("Authorization", "Bearer secret");
            then.status(200).body("payload");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download(
            "tests",
            DownloadRequest::new(server.url("/private.bin"))
                .with_header("Authorization", "Bearer secret"),
        )
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    assert!(matches!(seen.last(), Some(TransferEvent::Finished(_))));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_content_disposition_names_the_file() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/download");
            then.status(200)
                .header("Content-Disposition", "attachment; filename=\"report.csv\"")
                .body("a,b\n1,2\n");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download("tests", DownloadRequest::new(server.url("/download")))
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    let target = h.path("report.csv");
    assert_eq!(seen.last(), Some(&TransferEvent::Finished(target.clone())));
    assert_eq!(std::fs::read_to_string(target).unwrap(), "a,b\n1,2\n");
}

#[tokio::test]
async fn test_post_download_command_consumes_file() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/package.tar");
            then.status(200).body("archive");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let mut data = Metadata::new();
    data.insert(metadata::COMMAND, serde_json::json!(["true", "$file"]));
    let download = h
        .manager
        .create_download(
            "tests",
            DownloadRequest::new(server.url("/package.tar")).with_metadata(data),
        )
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    let target = h.path("package.tar");
    assert_eq!(seen.last(), Some(&TransferEvent::Finished(target.clone())));
    assert!(seen.contains(&TransferEvent::Processing(target.clone())));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_group_downloads_every_file() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/one");
            then.status(200).body("first");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/two");
            then.status(200).body("second");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let request = GroupRequest {
        items: vec![
            GroupItem {
                url: server.url("/one"),
                local_file: "one.txt".to_string(),
                hash: None,
            },
            GroupItem {
                url: server.url("/two"),
                local_file: "two.txt".to_string(),
                hash: None,
            },
        ],
        ..Default::default()
    };
    let group = h
        .manager
        .create_download_group("tests", request)
        .await
        .unwrap();
    group.start().await.unwrap();

    let seen = wait_final(&mut events, group.id()).await;

    let expected = vec![h.path("one.txt"), h.path("two.txt")];
    assert_eq!(seen.last(), Some(&TransferEvent::GroupFinished(expected)));
    assert_eq!(std::fs::read_to_string(h.path("one.txt")).unwrap(), "first");
    assert_eq!(std::fs::read_to_string(h.path("two.txt")).unwrap(), "second");
    assert!(group.info().await.unwrap().is_group);
}

#[tokio::test]
async fn test_persisted_downloads_survive_restart() {
    let h = Harness::new();
    let download = h
        .manager
        .create_download("tests", DownloadRequest::new("http://127.0.0.1:9/later.iso"))
        .await
        .unwrap();
    download.set_throttle(2048).await.unwrap();
    h.manager.shutdown().await.unwrap();

    let probe = ManualProbe::new(NetworkMode::Offline);
    let restarted = spawn_manager(h.dir.path(), &h.store, &probe);
    let restored = restarted.restore().await.unwrap();

    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].id(), download.id());
    assert_eq!(restored[0].state().await.unwrap(), TransferState::Idle);
    assert_eq!(restored[0].throttle().await.unwrap(), 2048);

    // Restoring twice does not duplicate anything
    restarted.restore().await.unwrap();
    assert_eq!(restarted.get_all_downloads().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_single_redirect_is_followed() {
    let server = MockServer::start_async().await;
    let old = server
        .mock_async(|when, then| {
            when.method(GET).path("/old/report.txt");
            then.status(302)
                .header("location", server.url("/new/report.txt"));
        })
        .await;
    let new = server
        .mock_async(|when, then| {
            when.method(GET).path("/new/report.txt");
            then.status(200).body("hello world");
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download(
            "tests",
            DownloadRequest::new(server.url("/old/report.txt")).with_hash(HELLO_MD5, "md5"),
        )
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    match seen.last() {
        Some(TransferEvent::Finished(path)) => {
            assert_eq!(std::fs::read_to_string(path).unwrap(), "hello world");
        }
        other => panic!("expected the redirected file, got {:?}", other),
    }
    old.assert_async().await;
    new.assert_async().await;
    assert_eq!(download.state().await.unwrap(), TransferState::Uncollected);
}

#[tokio::test]
async fn test_redirect_cycle_fails_with_network_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/a");
            then.status(302).header("location", server.url("/b"));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/b");
            then.status(302).header("location", server.url("/a"));
        })
        .await;

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download("tests", DownloadRequest::new(server.url("/a")))
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    assert!(matches!(
        seen.last(),
        Some(TransferEvent::Error(TransferError::Network {
            code: NetworkErrorCode::RedirectLoop,
            ..
        }))
    ));
    assert_eq!(download.state().await.unwrap(), TransferState::Error);
}

#[tokio::test]
async fn test_redirect_chain_longer_than_limit_fails() {
    let server = MockServer::start_async().await;
    for hop in 0..=MAX_REDIRECTS {
        let path = format!("/hop/{}", hop);
        let next = server.url(format!("/hop/{}", hop + 1));
        server
            .mock_async(|when, then| {
                when.method(GET).path(path);
                then.status(302).header("location", next);
            })
            .await;
    }

    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .create_download("tests", DownloadRequest::new(server.url("/hop/0")))
        .await
        .unwrap();
    download.start().await.unwrap();

    let seen = wait_final(&mut events, download.id()).await;

    assert!(matches!(
        seen.last(),
        Some(TransferEvent::Error(TransferError::Network {
            code: NetworkErrorCode::RedirectLoop,
            ..
        }))
    ));
}
