//! Bundled libp2p host: a swarm driven in its own task, exposed to the
//! crawler through message-passing.

use std::{collections::HashMap, time::Duration};

use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, SwarmBuilder,
    gossipsub, identify,
    identity::Keypair,
    kad,
    noise::Config as NoiseConfig,
    ping,
    swarm::{NetworkBehaviour, Swarm, SwarmEvent, dial_opts::DialOpts},
    tcp::Config as TcpConfig,
    yamux::Config as YamuxConfig,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{GossipMessage, Host, HostError, HostEvent, HostInfo, PeerInfo, TopicSubscription};
use crate::gossip;

/// Capacity of the command, event and per-topic channels.
const CHANNEL_SIZE: usize = 256;

/// Network behaviour of the crawling host.
#[derive(NetworkBehaviour)]
struct CrawlerBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kademlia: kad::Behaviour<kad::store::MemoryStore>,
}

/// Requests from [`SwarmHost`] handles to the spawned swarm task.
enum HostCommand {
    Dial { peer: PeerInfo, resp: oneshot::Sender<Result<(), HostError>> },
    HostInfo { peer_id: PeerId, resp: oneshot::Sender<Option<HostInfo>> },
    Neighbors { peer: PeerInfo, resp: oneshot::Sender<Result<Vec<PeerInfo>, HostError>> },
    Subscribe { topic: String, resp: oneshot::Sender<Result<TopicSubscription, HostError>> },
}

/// A builder for the [`SwarmHost`].
pub struct SwarmHostBuilder {
    keypair: Option<Keypair>,
    listen_addr: Option<Multiaddr>,
    agent_version: String,
    kad_protocol: Option<String>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for SwarmHostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmHostBuilder")
            .field("listen_addr", &self.listen_addr)
            .field("agent_version", &self.agent_version)
            .field("kad_protocol", &self.kad_protocol)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl Default for SwarmHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmHostBuilder {
    /// Creates a new [`SwarmHostBuilder`].
    pub fn new() -> Self {
        Self {
            keypair: None,
            listen_addr: None,
            agent_version: concat!("armiarma/", env!("CARGO_PKG_VERSION")).to_string(),
            kad_protocol: None,
            idle_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the [`Keypair`] for the host.
    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Sets the [`Multiaddr`] the host listens on.
    pub fn with_listen_addr(mut self, addr: Multiaddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Sets the agent string advertised through identify.
    pub fn with_agent_version(mut self, agent: impl Into<String>) -> Self {
        self.agent_version = agent.into();
        self
    }

    /// Sets the kademlia protocol id used for neighbour queries.
    pub fn with_kad_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.kad_protocol = Some(protocol.into());
        self
    }

    /// Sets the swarm's idle connection timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Builds the swarm, spawns the service task and returns the handle
    /// plus the stream of connection events.
    pub fn start(
        self,
        cancel: CancellationToken,
    ) -> Result<(SwarmHost, mpsc::Receiver<HostEvent>), HostError> {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate_secp256k1);
        let local_peer_id = PeerId::from(keypair.public());

        // The router runs unsigned: target networks do not sign at the
        // pubsub layer, and signed-mode routers drop their messages.
        let gossipsub_config =
            gossip::gossipsub_config().map_err(|e| HostError::Setup(e.to_string()))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Anonymous,
            gossipsub_config,
        )
        .map_err(|e| HostError::Setup(e.to_string()))?;

        let identify = identify::Behaviour::new(
            identify::Config::new("ipfs/1.0.0".into(), keypair.public())
                .with_agent_version(self.agent_version.clone()),
        );

        let ping = ping::Behaviour::new(ping::Config::new());

        let kad_protocol = self.kad_protocol.unwrap_or_else(|| "/ipfs/kad/1.0.0".to_string());
        let protocol = StreamProtocol::try_from_owned(kad_protocol)
            .map_err(|e| HostError::Setup(e.to_string()))?;
        let mut kademlia = kad::Behaviour::with_config(
            local_peer_id,
            kad::store::MemoryStore::new(local_peer_id),
            kad::Config::new(protocol),
        );
        // The crawler only queries; it never serves records.
        kademlia.set_mode(Some(kad::Mode::Client));

        let behaviour = CrawlerBehaviour { gossipsub, identify, ping, kademlia };

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(TcpConfig::default(), |i: &Keypair| NoiseConfig::new(i), YamuxConfig::default)
            .map_err(|_| HostError::Setup("tcp transport".to_string()))?
            .with_behaviour(|_| behaviour)
            .map_err(|_| HostError::Setup("swarm behaviour".to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(self.idle_timeout))
            .build();

        let listen_addr =
            self.listen_addr.unwrap_or_else(|| "/ip4/0.0.0.0/tcp/9020".parse().expect("static"));
        swarm.listen_on(listen_addr).map_err(|e| HostError::Setup(e.to_string()))?;

        // With an empty routing table this reports no known peers; the
        // table fills as identified peers are added and later queries
        // walk it anyway.
        if let Err(err) = swarm.behaviour_mut().kademlia.bootstrap() {
            debug!(target: "crawler::host", %err, "dht bootstrap deferred");
        }

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_SIZE);

        let service = SwarmService {
            swarm,
            commands: command_rx,
            events: event_tx,
            pending_dials: HashMap::new(),
            pending_queries: HashMap::new(),
            identities: HashMap::new(),
            topics: HashMap::new(),
            cancel,
        };
        tokio::spawn(service.run());

        info!(target: "crawler::host", peer_id = %local_peer_id, "libp2p host started");
        Ok((SwarmHost { commands: command_tx, local_peer_id }, event_rx))
    }
}

/// Handle to the spawned swarm task.
///
/// Cheap to clone; every capability is a request/response exchange over
/// the command channel, so no swarm state is shared across tasks.
#[derive(Debug, Clone)]
pub struct SwarmHost {
    commands: mpsc::Sender<HostCommand>,
    local_peer_id: PeerId,
}

impl SwarmHost {
    /// Returns a new [`SwarmHostBuilder`].
    pub fn builder() -> SwarmHostBuilder {
        SwarmHostBuilder::new()
    }

    /// The local peer identity.
    pub const fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HostCommand,
    ) -> Result<T, HostError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| HostError::ServiceStopped)?;
        rx.await.map_err(|_| HostError::ServiceStopped)
    }
}

#[async_trait::async_trait]
impl Host for SwarmHost {
    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError> {
        let peer = peer.clone();
        self.request(|resp| HostCommand::Dial { peer, resp }).await?
    }

    async fn host_info(&self, peer_id: &PeerId) -> Option<HostInfo> {
        let peer_id = *peer_id;
        self.request(|resp| HostCommand::HostInfo { peer_id, resp }).await.ok().flatten()
    }

    async fn fetch_neighbors(&self, peer: &PeerInfo) -> Result<Vec<PeerInfo>, HostError> {
        let peer = peer.clone();
        self.request(|resp| HostCommand::Neighbors { peer, resp }).await?
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, HostError> {
        let topic = topic.to_string();
        self.request(|resp| HostCommand::Subscribe { topic, resp }).await?
    }
}

/// The swarm task: owns the [`Swarm`] and services commands and events.
struct SwarmService {
    swarm: Swarm<CrawlerBehaviour>,
    commands: mpsc::Receiver<HostCommand>,
    events: mpsc::Sender<HostEvent>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), HostError>>>>,
    pending_queries: HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerInfo>, HostError>>>,
    identities: HashMap<PeerId, HostInfo>,
    topics: HashMap<gossipsub::TopicHash, mpsc::Sender<Result<GossipMessage, HostError>>>,
    cancel: CancellationToken,
}

impl SwarmService {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(target: "crawler::host", "shutting down swarm service");
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                event = self.swarm.select_next_some() => self.handle_event(event).await,
            }
        }
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Dial { peer, resp } => self.handle_dial(peer, resp),
            HostCommand::HostInfo { peer_id, resp } => {
                let _ = resp.send(self.identities.get(&peer_id).cloned());
            }
            HostCommand::Neighbors { peer, resp } => {
                for addr in &peer.addresses {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer.peer_id, addr.clone());
                }
                let query = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer.peer_id);
                self.pending_queries.insert(query, resp);
            }
            HostCommand::Subscribe { topic, resp } => {
                let ident = gossipsub::IdentTopic::new(&topic);
                match self.swarm.behaviour_mut().gossipsub.subscribe(&ident) {
                    Ok(_) => {
                        let (tx, subscription) =
                            TopicSubscription::channel(topic.as_str(), CHANNEL_SIZE);
                        self.topics.insert(ident.hash(), tx);
                        let _ = resp.send(Ok(subscription));
                    }
                    Err(err) => {
                        let _ = resp.send(Err(HostError::Subscription(err.to_string())));
                    }
                }
            }
        }
    }

    fn handle_dial(&mut self, peer: PeerInfo, resp: oneshot::Sender<Result<(), HostError>>) {
        if peer.addresses.is_empty() {
            let _ = resp.send(Err(HostError::Dial("no addresses".to_string())));
            return;
        }
        if self.swarm.is_connected(&peer.peer_id) {
            let _ = resp.send(Ok(()));
            return;
        }
        let opts = DialOpts::peer_id(peer.peer_id).addresses(peer.addresses.clone()).build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.entry(peer.peer_id).or_default().push(resp);
            }
            Err(err) => {
                let _ = resp.send(Err(HostError::Dial(err.to_string())));
            }
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<CrawlerBehaviourEvent>) {
        match event {
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                for resp in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = resp.send(Ok(()));
                }
                let _ = self
                    .events
                    .send(HostEvent::Connected { peer_id, inbound: endpoint.is_listener() })
                    .await;
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    let _ = self.events.send(HostEvent::Disconnected { peer_id }).await;
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    for resp in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                        let _ = resp.send(Err(HostError::Dial(error.to_string())));
                    }
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: CrawlerBehaviourEvent) {
        match event {
            CrawlerBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                let Some(sender) = self.topics.get(&message.topic) else {
                    return;
                };
                let delivery = GossipMessage {
                    source: message.source.or(Some(propagation_source)),
                    data: message.data,
                };
                // Readers falling behind drop deliveries rather than
                // stalling the swarm.
                if sender.try_send(Ok(delivery)).is_err() {
                    debug!(target: "crawler::host", topic = %message.topic, "dropping gossip delivery, reader is behind");
                }
            }
            CrawlerBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in &info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                }
                let entry = self.identities.entry(peer_id).or_default();
                entry.user_agent = info.agent_version;
                entry.protocols = info.protocols.iter().map(|p| p.to_string()).collect();
                entry.addresses = info.listen_addrs;
            }
            CrawlerBehaviourEvent::Ping(ping::Event { peer, result: Ok(rtt), .. }) => {
                self.identities.entry(peer).or_default().latency = Some(rtt);
            }
            CrawlerBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetClosestPeers(result),
                step,
                ..
            }) => {
                if !step.last {
                    return;
                }
                let Some(resp) = self.pending_queries.remove(&id) else {
                    return;
                };
                let reply = match result {
                    Ok(ok) => Ok(ok
                        .peers
                        .into_iter()
                        .map(|p| PeerInfo::new(p.peer_id, p.addrs))
                        .collect()),
                    Err(err) => Err(HostError::NeighborQuery(err.to_string())),
                };
                let _ = resp.send(reply);
            }
            _ => {}
        }
    }
}
