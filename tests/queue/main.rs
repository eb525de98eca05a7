//! Integration tests for the transfer queue
//!
//! These tests drive real file transfers through the queue with a scripted
//! transport, checking admission control, the mobile-data policy and
//! suspension on connectivity changes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use download_manager::app::client::{HttpTransport, TransferRequest};
use download_manager::app::confinement::StaticResolver;
use download_manager::app::engine::{ConnectionSink, Engine, EngineMessage, NetworkEvent};
use download_manager::app::factory::{DownloadRequest, TransferDefaults, TransferFactory};
use download_manager::app::network::NetworkMode;
use download_manager::app::queue::{ClientRequest, TransferQueue};
use download_manager::app::transfer::{
    Metadata, PathLocks, TransferControl, TransferEvent, TransferId, TransferState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Keeps every connection's sink so tests can play the server
#[derive(Debug, Default)]
struct ScriptedTransport {
    opened: Mutex<Vec<(TransferRequest, Arc<ConnectionSink>)>>,
}

impl ScriptedTransport {
    fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> TransferRequest {
        self.opened.lock().unwrap()[index].0.clone()
    }

    fn sink(&self, index: usize) -> Arc<ConnectionSink> {
        self.opened.lock().unwrap()[index].1.clone()
    }
}

impl HttpTransport for ScriptedTransport {
    fn open(&self, request: TransferRequest, sink: ConnectionSink) -> JoinHandle<()> {
        self.opened.lock().unwrap().push((request, Arc::new(sink)));
        tokio::spawn(async {})
    }
}

struct Harness {
    queue: TransferQueue,
    factory: TransferFactory,
    transport: Arc<ScriptedTransport>,
    rx: mpsc::Receiver<EngineMessage>,
    dir: TempDir,
}

impl Harness {
    fn new(mode: NetworkMode) -> Self {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let (engine, rx) = Engine::new(transport.clone());
        let factory = TransferFactory::new(
            engine,
            PathLocks::new(),
            Arc::new(StaticResolver::unconfined(dir.path())),
            TransferDefaults::default(),
            10,
        );
        Self {
            queue: TransferQueue::new(mode),
            factory,
            transport,
            rx,
            dir,
        }
    }

    async fn add(&mut self, name: &str, allow_mobile_data: bool) -> TransferId {
        let request = DownloadRequest::new(format!("http://example.com/{}", name));
        self.add_request(request, allow_mobile_data).await
    }

    async fn add_request(&mut self, request: DownloadRequest, allow_mobile_data: bool) -> TransferId {
        let mut transfer = self.factory.create_download("test", request).unwrap();
        transfer.allow_mobile_download(allow_mobile_data);
        let id = transfer.id();
        self.queue.add(transfer.into()).await.unwrap();
        id
    }

    async fn request(&mut self, id: &TransferId, request: ClientRequest) -> Vec<TransferEvent> {
        self.queue
            .request(id, request)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.id == *id)
            .map(|n| n.event)
            .collect()
    }

    /// Send an event on connection `index` and hand it to the queue
    async fn deliver(&mut self, index: usize, event: NetworkEvent) -> Vec<TransferEvent> {
        assert!(self.transport.sink(index).send(event).await);
        let message = self.rx.recv().await.unwrap();
        self.queue
            .handle_engine_message(message)
            .await
            .into_iter()
            .map(|n| n.event)
            .collect()
    }

    fn state(&self, id: &TransferId) -> TransferState {
        self.queue.get(id).unwrap().state()
    }
}

fn headers(content_length: u64) -> NetworkEvent {
    NetworkEvent::Headers {
        status: 200,
        content_length: Some(content_length),
        content_disposition: None,
        partial: false,
    }
}

#[tokio::test]
async fn test_only_first_started_transfer_is_admitted() {
    let mut h = Harness::new(NetworkMode::Wlan);
    let mut ids = Vec::new();
    for name in ["a", "b", "c", "d", "e"] {
        ids.push(h.add(name, true).await);
    }

    // Three START, two IDLE
    for index in [1, 2, 4] {
        h.request(&ids[index], ClientRequest::Start).await;
        assert!(h.queue.open_connections() <= 1);
    }

    assert_eq!(h.queue.current(), Some(ids[1]));
    assert_eq!(h.transport.count(), 1);
    assert_eq!(h.state(&ids[2]), TransferState::Start);
    assert_eq!(h.state(&ids[0]), TransferState::Idle);

    // Canceling the current transfer admits the next one in order
    let events = h.request(&ids[1], ClientRequest::Cancel).await;
    assert!(events.contains(&TransferEvent::Canceled(true)));
    assert!(!h.queue.contains(&ids[1]));
    assert_eq!(h.queue.current(), Some(ids[2]));
    assert_eq!(h.queue.open_connections(), 1);

    // Pausing it hands the slot to the last started one
    let events = h.request(&ids[2], ClientRequest::Pause).await;
    assert!(events.contains(&TransferEvent::Paused(true)));
    assert_eq!(h.queue.current(), Some(ids[4]));
    assert_eq!(h.queue.open_connections(), 1);
    assert_eq!(h.transport.count(), 3);
}

#[tokio::test]
async fn test_finished_transfer_frees_the_slot() {
    let mut h = Harness::new(NetworkMode::Ethernet);
    let first = h.add("first.bin", true).await;
    let second = h.add("second.bin", true).await;
    h.request(&first, ClientRequest::Start).await;
    h.request(&second, ClientRequest::Start).await;
    assert_eq!(h.transport.count(), 1);

    h.deliver(0, headers(5)).await;
    let events = h.deliver(0, NetworkEvent::Data(Bytes::from_static(b"hello"))).await;
    assert!(events.contains(&TransferEvent::Progress {
        received: 5,
        total: 5
    }));
    let events = h.deliver(0, NetworkEvent::Finished).await;

    let final_path = h.dir.path().join("first.bin");
    assert!(events.contains(&TransferEvent::Finished(final_path.clone())));
    assert_eq!(std::fs::read(&final_path).unwrap(), b"hello");
    assert_eq!(h.state(&first), TransferState::Uncollected);
    assert_eq!(h.queue.current(), Some(second));
    assert_eq!(h.transport.count(), 2);

    h.queue.collected(&first).await.unwrap();
    assert!(!h.queue.contains(&first));
    // The file stays where it is
    assert!(final_path.exists());
}

#[tokio::test]
async fn test_failed_transfer_frees_the_slot() {
    let mut h = Harness::new(NetworkMode::Ethernet);
    let first = h.add("first.bin", true).await;
    let second = h.add("second.bin", true).await;
    h.request(&first, ClientRequest::Start).await;
    h.request(&second, ClientRequest::Start).await;

    let events = h
        .deliver(
            0,
            NetworkEvent::Failed(download_manager::errors::TransferError::Http {
                status: 404,
                reason: "Not Found".to_string(),
            }),
        )
        .await;

    assert!(events
        .iter()
        .any(|event| matches!(event, TransferEvent::Error(_))));
    assert_eq!(h.state(&first), TransferState::Error);
    assert_eq!(h.queue.current(), Some(second));
    assert!(!h.dir.path().join("first.bin.tmp").exists());
}

#[tokio::test]
async fn test_mobile_policy_skips_without_preempting() {
    let mut h = Harness::new(NetworkMode::Mobile3G);
    let metered = h.add("metered.bin", false).await;
    let allowed = h.add("allowed.bin", true).await;

    h.request(&metered, ClientRequest::Start).await;
    assert_eq!(h.queue.current(), None);
    assert_eq!(h.transport.count(), 0);

    h.request(&allowed, ClientRequest::Start).await;
    assert_eq!(h.queue.current(), Some(allowed));

    // A better network does not interrupt the running transfer
    h.queue.set_network_mode(NetworkMode::Wlan).await;
    assert_eq!(h.queue.current(), Some(allowed));
    assert_eq!(h.transport.count(), 1);
    assert_eq!(h.state(&metered), TransferState::Start);

    h.request(&allowed, ClientRequest::Cancel).await;
    assert_eq!(h.queue.current(), Some(metered));
    assert_eq!(h.transport.count(), 2);
}

#[tokio::test]
async fn test_allowing_mobile_data_admits_waiting_transfer() {
    let mut h = Harness::new(NetworkMode::Mobile4G);
    let id = h.add("a.bin", false).await;
    h.request(&id, ClientRequest::Start).await;
    assert_eq!(h.queue.current(), None);

    let events = h.request(&id, ClientRequest::AllowMobileData(true)).await;

    assert!(events.contains(&TransferEvent::MobileDataChanged(true)));
    assert_eq!(h.queue.current(), Some(id));
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn test_losing_eligibility_suspends_and_continues_with_range() {
    let mut h = Harness::new(NetworkMode::Wlan);
    let id = h.add("a.bin", false).await;
    h.request(&id, ClientRequest::Start).await;
    assert_eq!(h.transport.request(0).range_start, None);

    h.deliver(0, headers(10)).await;
    h.deliver(0, NetworkEvent::Data(Bytes::from_static(b"0123"))).await;

    h.queue.set_network_mode(NetworkMode::Mobile2G).await;
    assert_eq!(h.queue.current(), None);
    assert_eq!(h.queue.open_connections(), 0);
    // Suspension is invisible to the client
    assert_eq!(h.state(&id), TransferState::Start);

    h.queue.set_network_mode(NetworkMode::Wlan).await;
    assert_eq!(h.queue.current(), Some(id));
    assert_eq!(h.transport.count(), 2);
    assert_eq!(h.transport.request(1).range_start, Some(4));
}

#[tokio::test]
async fn test_offline_blocks_every_transfer() {
    let mut h = Harness::new(NetworkMode::Offline);
    let id = h.add("a.bin", true).await;
    h.request(&id, ClientRequest::Start).await;
    assert_eq!(h.queue.current(), None);

    h.queue.set_network_mode(NetworkMode::Ethernet).await;
    assert_eq!(h.queue.current(), Some(id));
}

#[tokio::test]
async fn test_events_from_stale_connections_are_ignored() {
    let mut h = Harness::new(NetworkMode::Ethernet);
    let id = h.add("a.bin", true).await;
    h.request(&id, ClientRequest::Start).await;
    h.request(&id, ClientRequest::Pause).await;
    h.request(&id, ClientRequest::Resume).await;
    assert_eq!(h.transport.count(), 2);

    // The first connection was closed by the pause
    let events = h.deliver(0, NetworkEvent::Finished).await;

    assert!(events.is_empty());
    assert_eq!(h.state(&id), TransferState::Resume);
}

#[tokio::test]
async fn test_connectivity_bounce_during_post_command_keeps_file() {
    let mut h = Harness::new(NetworkMode::Ethernet);
    let mut metadata = Metadata::new();
    metadata.insert("post-download-command", serde_json::json!(["sleep", "1"]));
    let request = DownloadRequest::new("http://example.com/pkg.bin").with_metadata(metadata);
    let id = h.add_request(request, true).await;
    h.request(&id, ClientRequest::Start).await;

    h.deliver(0, headers(4)).await;
    h.deliver(0, NetworkEvent::Data(Bytes::from_static(b"data"))).await;
    h.deliver(0, NetworkEvent::Finished).await;
    assert_eq!(h.state(&id), TransferState::Start);

    h.queue.set_network_mode(NetworkMode::Offline).await;
    h.queue.set_network_mode(NetworkMode::Ethernet).await;

    // The body is complete, nothing is downloaded twice
    assert_eq!(h.transport.count(), 1);
    assert_eq!(h.queue.open_connections(), 0);
    assert_eq!(std::fs::read(h.dir.path().join("pkg.bin")).unwrap(), b"data");

    let exit = tokio::time::timeout(Duration::from_secs(5), h.rx.recv())
        .await
        .expect("command did not exit")
        .unwrap();
    let events: Vec<_> = h
        .queue
        .handle_engine_message(exit)
        .await
        .into_iter()
        .map(|n| n.event)
        .collect();

    assert!(events.contains(&TransferEvent::Finished(h.dir.path().join("pkg.bin"))));
    assert_eq!(h.state(&id), TransferState::Uncollected);
    assert_eq!(h.queue.current(), None);
    assert_eq!(h.queue.open_connections(), 0);
}
