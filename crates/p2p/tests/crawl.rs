//! End-to-end crawler scenarios driven by a channel-backed fake host.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use armiarma_peerdb::{ErrorKind, Peer, PeerStore};
use armiarma_p2p::{
    Crawler, CrawlerConfig, CrawlerError, DiscoveryFeed, GossipDriver, GossipMessage, Host,
    HostError, HostInfo, Network, NoopLocator, PeerInfo, TopicSubscription, WorkerPool,
};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fake host: scripted dial outcomes, canned neighbour lists and manually
/// published gossip.
///
/// Each peer has a queue of dial outcomes; once the queue is drained a
/// dial never resolves, so tests see exactly the attempts they scripted.
#[derive(Default)]
struct MockHost {
    outcomes: Mutex<HashMap<PeerId, Vec<Result<(), HostError>>>>,
    neighbors: Mutex<HashMap<PeerId, Vec<PeerInfo>>>,
    infos: Mutex<HashMap<PeerId, HostInfo>>,
    dials: Mutex<Vec<PeerId>>,
    topics: Mutex<HashMap<String, mpsc::Sender<Result<GossipMessage, HostError>>>>,
}

impl MockHost {
    fn script_dial(&self, peer: PeerId, outcome: Result<(), HostError>) {
        self.outcomes.lock().unwrap().entry(peer).or_default().push(outcome);
    }

    fn script_neighbors(&self, peer: PeerId, neighbors: Vec<PeerInfo>) {
        self.neighbors.lock().unwrap().insert(peer, neighbors);
    }

    fn script_info(&self, peer: PeerId, info: HostInfo) {
        self.infos.lock().unwrap().insert(peer, info);
    }

    fn dials_of(&self, peer: &PeerId) -> usize {
        self.dials.lock().unwrap().iter().filter(|p| *p == peer).count()
    }

    async fn publish(&self, topic: &str, source: PeerId, data: &[u8]) {
        let sender = self.topics.lock().unwrap().get(topic).cloned().expect("topic joined");
        sender.send(Ok(GossipMessage { source: Some(source), data: data.to_vec() })).await.unwrap();
    }
}

#[async_trait]
impl Host for MockHost {
    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError> {
        self.dials.lock().unwrap().push(peer.peer_id);
        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            outcomes.get_mut(&peer.peer_id).and_then(|queue| {
                if queue.is_empty() { None } else { Some(queue.remove(0)) }
            })
        };
        match outcome {
            Some(outcome) => outcome,
            // Script exhausted: hang until the caller's timeout or the
            // end of the test.
            None => std::future::pending().await,
        }
    }

    async fn host_info(&self, peer_id: &PeerId) -> Option<HostInfo> {
        self.infos.lock().unwrap().get(peer_id).cloned()
    }

    async fn fetch_neighbors(&self, peer: &PeerInfo) -> Result<Vec<PeerInfo>, HostError> {
        Ok(self.neighbors.lock().unwrap().get(&peer.peer_id).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, HostError> {
        let (tx, subscription) = TopicSubscription::channel(topic, 64);
        self.topics.lock().unwrap().insert(topic.to_string(), tx);
        Ok(subscription)
    }
}

fn addr(last_octet: u8) -> Multiaddr {
    format!("/ip4/10.0.0.{last_octet}/tcp/9000").parse().unwrap()
}

async fn wait_until(mut pred: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Spins up a feed plus a single worker over the mock host.
fn spawn_worker(
    store: Arc<PeerStore>,
    host: Arc<MockHost>,
    cancel: CancellationToken,
) -> Arc<DiscoveryFeed> {
    let (feed, channels) = DiscoveryFeed::new(store.clone(), 1, Duration::from_millis(50));
    feed.clone().start(channels, cancel.clone());
    WorkerPool::new(store, feed.clone(), host, Arc::new(NoopLocator))
        .with_dial_timeout(Duration::from_secs(60))
        .with_neighbor_timeout(Duration::from_secs(5))
        .spawn(1, cancel);
    feed
}

#[tokio::test]
async fn bootstrap_discovers_one_neighbor() {
    let p1 = PeerId::random();
    let p2 = PeerId::random();

    let host = Arc::new(MockHost::default());
    host.script_dial(p1, Ok(()));
    host.script_info(
        p1,
        HostInfo {
            user_agent: "lotus-1.23.0/mainnet".into(),
            protocols: vec!["/ipfs/kad/1.0.0".into()],
            addresses: vec![],
            latency: Some(Duration::from_millis(40)),
        },
    );
    host.script_neighbors(p1, vec![PeerInfo::new(p2, vec![addr(2)])]);

    let store = Arc::new(PeerStore::in_memory());
    store.store(Peer::with_addresses(p1.to_string(), vec![addr(1)])).unwrap();

    let cancel = CancellationToken::new();
    spawn_worker(store.clone(), host.clone(), cancel.clone());

    wait_until(|| store.load(&p2.to_string()).is_ok(), "neighbor to be stored").await;
    cancel.cancel();

    let stored_p1 = store.load(&p1.to_string()).unwrap();
    assert!(stored_p1.succeed);
    assert!(stored_p1.attempted);
    assert_eq!(stored_p1.attempts, 1);
    assert_eq!(stored_p1.last_error, ErrorKind::None);
    assert_eq!(stored_p1.user_agent, "lotus-1.23.0/mainnet");
    assert_eq!(stored_p1.latency, Some(Duration::from_millis(40)));
    assert!(stored_p1.metadata_requested && stored_p1.metadata_succeeded);

    let stored_p2 = store.load(&p2.to_string()).unwrap();
    assert_eq!(stored_p2.attempts, 0);
    assert!(!stored_p2.attempted);
    assert_eq!(stored_p2.addresses, vec![addr(2)]);
}

#[tokio::test]
async fn permanent_error_blacklists_the_peer() {
    let p3 = PeerId::random();

    let host = Arc::new(MockHost::default());
    host.script_dial(p3, Err(HostError::Dial("protocol not supported".into())));

    let store = Arc::new(PeerStore::in_memory());
    store.store(Peer::with_addresses(p3.to_string(), vec![addr(3)])).unwrap();

    let cancel = CancellationToken::new();
    let feed = spawn_worker(store.clone(), host.clone(), cancel.clone());

    wait_until(|| feed.is_blacklisted(&p3.to_string()), "peer to be blacklisted").await;

    let stored = store.load(&p3.to_string()).unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error, ErrorKind::ProtocolNotSupported);
    assert!(stored.deprecated);

    // Later passes must not dial the blacklisted peer again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(host.dials_of(&p3), 1);
    cancel.cancel();
}

#[tokio::test]
async fn peers_without_addresses_are_never_dialed() {
    let p = PeerId::random();
    let host = Arc::new(MockHost::default());
    let store = Arc::new(PeerStore::in_memory());
    store.store(Peer::new(p.to_string())).unwrap();

    let cancel = CancellationToken::new();
    spawn_worker(store.clone(), host.clone(), cancel.clone());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(host.dials_of(&p), 0);
    assert_eq!(store.load(&p.to_string()).unwrap().attempts, 0);
    cancel.cancel();
}

#[tokio::test]
async fn gossip_counts_each_delivery_and_attributes_senders() {
    let p4 = PeerId::random();
    let p5 = PeerId::random();
    let topic = "/eth2/b5303f2a/beacon_block/ssz_snappy";

    let host = Arc::new(MockHost::default());
    let store = Arc::new(PeerStore::in_memory());
    let cancel = CancellationToken::new();

    let driver = GossipDriver::new(host.clone(), store.clone(), cancel.clone());
    driver.join_and_subscribe(topic).await.unwrap();

    // The same payload from two different publishers.
    let payload = b"identical gossip payload";
    host.publish(topic, p4, payload).await;
    host.publish(topic, p5, payload).await;

    let metrics = driver.metrics();
    wait_until(|| metrics.topic(topic).map(|s| s.count) == Some(2), "both deliveries counted")
        .await;

    let stored_p4 = store.load(&p4.to_string()).unwrap();
    let stored_p5 = store.load(&p5.to_string()).unwrap();
    assert_eq!(stored_p4.messages[topic].count, 1);
    assert_eq!(stored_p5.messages[topic].count, 1);

    // Content-addressed identity: both injections hash to the same id.
    assert_eq!(armiarma_p2p::message_id(payload), armiarma_p2p::message_id(payload));

    cancel.cancel();
    driver.close().await;
}

#[tokio::test]
async fn zero_workers_is_refused_at_build_time() {
    let mut config = CrawlerConfig::for_network(Network::Eth2);
    config.workers = 0;
    let result = Crawler::builder(config)
        .with_host(Arc::new(MockHost::default()))
        .with_locator(Arc::new(NoopLocator))
        .build();
    assert!(matches!(result, Err(CrawlerError::Config(_))));
}

#[tokio::test]
async fn graceful_shutdown_flushes_the_csv() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CrawlerConfig::for_network(Network::Eth2);
    config.workers = 100;
    config.topics = vec!["/eth2/b5303f2a/beacon_block/ssz_snappy".to_string()];
    config.output_path = dir.path().to_path_buf();
    config.peerstore_backend = "memory".to_string();

    // Every dial hangs, so all 100 workers are mid-dial at shutdown.
    let host = Arc::new(MockHost::default());
    let crawler = Crawler::builder(config)
        .with_host(host)
        .with_locator(Arc::new(NoopLocator))
        .with_dial_timeout(Duration::from_secs(1))
        .with_min_wait(Duration::from_millis(100))
        .build()
        .unwrap();

    let cancel = crawler.cancellation_token();
    let store = crawler.store();
    store.store(Peer::with_addresses(PeerId::random().to_string(), vec![addr(9)])).unwrap();

    let run = tokio::spawn(crawler.run());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    cancel.cancel();
    run.await.unwrap().unwrap();
    // Dial timeout plus the grace period bounds the shutdown.
    assert!(started.elapsed() < Duration::from_secs(5));

    let csv = std::fs::read_to_string(dir.path().join("peerstore.csv")).unwrap();
    assert!(csv.starts_with("Peer Id,Node Id,User Agent"));
    assert!(csv.lines().count() >= 2);
}

#[tokio::test]
async fn empty_bootstrap_idles_and_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CrawlerConfig::for_network(Network::Eth2);
    config.workers = 2;
    config.topics = vec![];
    config.output_path = dir.path().to_path_buf();
    config.peerstore_backend = "memory".to_string();

    let crawler = Crawler::builder(config)
        .with_host(Arc::new(MockHost::default()))
        .with_locator(Arc::new(NoopLocator))
        .with_min_wait(Duration::from_millis(100))
        .build()
        .unwrap();

    let cancel = crawler.cancellation_token();
    let run = tokio::spawn(crawler.run());
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let csv = std::fs::read_to_string(dir.path().join("peerstore.csv")).unwrap();
    assert_eq!(csv.lines().count(), 1, "header only");
}
