use crate::fault::RawPeer;
use crate::*;

use std::sync::atomic::{AtomicBool, Ordering};

use tally_services::{
    ClientError, HistoryEntry, SeriesStore, SeriesSummary, StoreError, StoreStatus,
};

/// A peer that never acks the response exhausts the retry budget and
/// loses its session.
#[tokio::test]
async fn test_silent_peer_is_declared_unreachable() {
    let mut config = test_config();
    config.protocol.idle_timeout_ticks = 1000;
    let server = spawn_server(config).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    peer.send_content(0, 1, b"txt:hello").await;
    assert!(peer.recv_content(PATIENCE).await.is_some());
    assert!(server.registry().contains(&peer.addr()));

    let registry = server.registry().clone();
    let me = peer.addr();
    assert!(wait_until(|| !registry.contains(&me)).await);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_datagrams_are_dropped() {
    let server = spawn_server(test_config()).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    peer.send_raw(&[0xff, 1, 2]).await;
    peer.send_raw(&[1, 0]).await;
    peer.send_raw(&[]).await;
    assert_eq!(peer.recv(Duration::from_millis(100)).await, None);
    assert!(server.registry().is_empty());

    // The loop is still serving.
    let mut c = client(server.local_addr()).await;
    assert_eq!(c.request("txt:alive").await.unwrap(), "alive");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_message_from_client_is_rejected() {
    let server = spawn_server(test_config()).await;
    let mut c = client(server.local_addr()).await;

    assert_eq!(
        c.request("err:boom").await.unwrap(),
        "err:Unexpected error message"
    );
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_gives_up_on_dead_server() {
    let server = spawn_server(test_config()).await;
    let addr = server.local_addr();
    server.shutdown().await.unwrap();

    let settings = ClientSettings {
        retransmit_interval: Duration::from_millis(10),
        retry_budget: 3,
        ..client_settings()
    };
    let mut c = Client::with_settings(addr, settings).await.unwrap();
    match c.request("txt:anyone?").await {
        Err(ClientError::Unreachable { retries }) => assert_eq!(retries, 3),
        other => panic!("expected unreachable, got {other:?}"),
    }
}

/// Memory store whose listing blocks until the test opens the gate.
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    entered: AtomicBool,
    open: AtomicBool,
}

impl SeriesStore for GatedStore {
    fn add(&self, name: &str) -> Result<StoreStatus, StoreError> {
        self.inner.add(name)
    }
    fn add_value(&self, name: &str, value: f64) -> Result<StoreStatus, StoreError> {
        self.inner.add_value(name, value)
    }
    fn remove(&self, name: &str) -> Result<StoreStatus, StoreError> {
        self.inner.remove(name)
    }
    fn list(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        self.entered.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + PATIENCE;
        while !self.open.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inner.list()
    }
    fn history(&self, name: &str) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        self.inner.history(name)
    }
}

/// With the only worker stuck and the queue full, a new message is answered
/// with a busy error instead of waiting.
#[tokio::test]
async fn test_full_queue_answers_server_busy() {
    let mut config = test_config();
    config.dispatch.workers = 1;
    config.dispatch.queue_depth = 1;
    config.protocol.idle_timeout_ticks = 1000;
    let store = Arc::new(GatedStore::default());
    let server = Server::bind(config, store.clone())
        .await
        .unwrap()
        .spawn()
        .unwrap();

    // Occupies the worker.
    let stuck = RawPeer::connect(server.local_addr()).await;
    stuck.send_content(0, 1, b"cmd:get_all_currencies").await;
    assert!(wait_until(|| store.entered.load(Ordering::SeqCst)).await);

    // Fills the queue.
    let queued = RawPeer::connect(server.local_addr()).await;
    queued.send_content(0, 1, b"txt:waiting").await;
    assert_eq!(queued.recv_ack(PATIENCE).await, Some(0));

    let mut c = client(server.local_addr()).await;
    assert_eq!(c.request("txt:hello?").await.unwrap(), "err:server busy");

    store.open.store(true, Ordering::SeqCst);
    let (_, _, reply) = queued.recv_content(PATIENCE).await.unwrap();
    assert_eq!(&reply[..], b"waiting\r\n\r\n");
    server.shutdown().await.unwrap();
}
