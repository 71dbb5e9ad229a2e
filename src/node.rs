//! Top-level `Node`: wires Identity, Discovery, Transport, Election,
//! Lock Manager, Coordinator, and Aggregator into one process lifecycle
//! (`init -> start -> stop`), matching the supervised-task shape the
//! rest of the crate's components already follow.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::ClusterAggregator;
use crate::config::NodeConfig;
use crate::coordinator::Coordinator;
use crate::discovery::{DiscoveryAgent, DiscoveryEvent, PeerTable};
use crate::election::ElectionEngine;
use crate::error::CoordResult;
use crate::identity::{self, BoundIdentity, IdStore};
use crate::ids::NodeId;
use crate::lock::LockTable;
use crate::messages::LeaderRequest;
use crate::store::Store;
use crate::transport;
use crate::transport::PeerListener;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything one running node needs, owned by a single struct so
/// `main.rs` has one thing to construct and shut down.
pub struct Node<S: Store> {
    pub self_id: NodeId,
    pub config: NodeConfig,
    pub store: Arc<S>,
    pub peers: PeerTable,
    pub lock_table: Arc<LockTable>,
    pub election: Arc<ElectionEngine>,
    pub coordinator: Arc<Coordinator<S>>,
    pub aggregator: Arc<ClusterAggregator<S>>,
    discovery: DiscoveryAgent,
    tcp_listener: Option<std::net::TcpListener>,
    root_cancel: CancellationToken,
    tasks: SyncRwLock<Vec<tokio::task::JoinHandle<()>>>,
    collision: Arc<Notify>,
}

/// Binds a node identity (externally supplied or freshly searched,
/// reusing a persisted id from a prior run of this same process where
/// possible) and returns the bound sockets plus the chosen id.
pub fn resolve_identity(config: &NodeConfig) -> CoordResult<BoundIdentity> {
    let id_store = IdStore::new(config.id_store_dir());

    if let Some(node_id) = config.node_id {
        let bound = identity::bind_specific_identity(node_id, config.base_tcp_port, config.base_udp_port)?;
        id_store.save(bound.node_id.value())?;
        return Ok(bound);
    }

    if let Some(persisted) = id_store.load() {
        if let Ok(bound) = identity::bind_specific_identity(persisted, config.base_tcp_port, config.base_udp_port) {
            return Ok(bound);
        }
        warn!(persisted, "persisted node id no longer bindable, searching for a new one");
    }

    let bound = identity::bind_identity(config.identity_start_id, config.identity_max_attempts, config.base_tcp_port, config.base_udp_port)?;
    id_store.save(bound.node_id.value())?;
    Ok(bound)
}

/// Abandons whatever id this process was using (persisted or explicit)
/// and performs a fresh search, per §4.4's id-collision recovery: "the
/// node shuts down discovery, abandons current id, and requests a new id
/// from the Identity Binder."
pub fn resolve_fresh_identity(config: &NodeConfig) -> CoordResult<BoundIdentity> {
    let id_store = IdStore::new(config.id_store_dir());
    id_store.clear()?;
    let bound = identity::bind_identity(config.identity_start_id, config.identity_max_attempts, config.base_tcp_port, config.base_udp_port)?;
    id_store.save(bound.node_id.value())?;
    Ok(bound)
}

fn local_addrs() -> Vec<IpAddr> {
    match local_ip_candidates() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!(error = %e, "failed to enumerate local addresses");
            Vec::new()
        }
    }
}

fn local_ip_candidates() -> std::io::Result<Vec<IpAddr>> {
    // A UDP "connect" without sending data is the usual portable trick for
    // discovering which local interface the OS would route through.
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect("8.8.8.8:80").ok();
    let mut addrs = vec![IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)];
    if let Ok(addr) = probe.local_addr() {
        addrs.push(addr.ip());
    }
    Ok(addrs)
}

impl<S: Store + 'static> Node<S> {
    pub fn new(config: NodeConfig, store: Arc<S>, bound: BoundIdentity) -> std::io::Result<Self> {
        let self_id = bound.node_id;
        let tcp_port = bound.tcp_listener.local_addr()?.port();
        let udp_port = bound.udp_socket.local_addr()?.port();

        let (discovery, events_rx) = DiscoveryAgent::new(
            self_id,
            tcp_port,
            udp_port,
            local_addrs(),
            config.multicast_group.parse().unwrap_or(std::net::Ipv4Addr::new(224, 0, 0, 100)),
            config.multicast_port,
            config.announce_interval(),
            config.discovery_node_timeout(),
        );
        std::mem::drop(bound.udp_socket);

        let peers = discovery.peers();
        let lock_table = Arc::new(LockTable::new());
        let election = Arc::new(ElectionEngine::new(self_id, peers.clone()));
        let coordinator = Arc::new(Coordinator::new(self_id, store.clone(), lock_table.clone(), peers.clone(), election.clone()));
        let aggregator = Arc::new(ClusterAggregator::new(self_id, store.clone(), peers.clone()));

        let root_cancel = discovery.cancellation_token();

        let node = Self {
            self_id,
            config,
            store,
            peers,
            lock_table,
            election,
            coordinator,
            aggregator,
            discovery,
            tcp_listener: Some(bound.tcp_listener),
            root_cancel,
            tasks: SyncRwLock::new(Vec::new()),
            collision: Arc::new(Notify::new()),
        };

        node.spawn_event_reactor(events_rx);
        Ok(node)
    }

    /// Reacts to discovery events: a new higher-id peer joining while we
    /// are leader triggers a fresh election; an id collision notifies
    /// `collision`, which wakes whoever is awaiting
    /// `Node::wait_for_collision` (normally `main.rs`'s run loop, which
    /// tears this node down and restarts it with a fresh identity).
    fn spawn_event_reactor(&self, mut events_rx: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let election = self.election.clone();
        let cancel = self.root_cancel.clone();
        let collision = self.collision.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events_rx.recv() => {
                        match event {
                            Some(DiscoveryEvent::PeerDiscovered(peer)) => {
                                if election.higher_peer_joined_while_leader(peer.node_id) {
                                    info!(peer = %peer.node_id, "higher-id peer joined while leading, re-electing");
                                    election.start_election().await;
                                }
                            }
                            Some(DiscoveryEvent::PeerLost(node_id)) => {
                                if election.current_leader() == Some(node_id) {
                                    warn!(%node_id, "leader lost, starting election");
                                    election.start_election().await;
                                }
                            }
                            Some(DiscoveryEvent::IdCollision { foreign_host }) => {
                                error!(%foreign_host, "id collision detected, requesting a fresh identity and restart");
                                collision.notify_one();
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        self.tasks.write().push(handle);
    }

    pub async fn start(&mut self) -> CoordResult<()> {
        let discovery_handles = self.discovery.start().await?;
        self.tasks.write().extend(discovery_handles);

        if let Some(tcp_listener) = self.tcp_listener.take() {
            let listener = PeerListener::from_std(tcp_listener)?;
            let handler: Arc<dyn crate::transport::ConnectionHandler> = Arc::new(crate::node::RequestRouter {
                self_id: self.self_id,
                store: self.store.clone(),
                lock_table: self.lock_table.clone(),
                peers: self.peers.clone(),
                election: self.election.clone(),
                coordinator: self.coordinator.clone(),
            });
            let cancel = self.root_cancel.clone();
            let handle = tokio::spawn(listener.serve(handler, cancel));
            self.tasks.write().push(handle);
        }

        self.spawn_heartbeat_loop();

        info!(node_id = %self.self_id, "node started");
        self.election.start_election().await;
        Ok(())
    }

    /// Pings the believed leader every `HEARTBEAT_INTERVAL`; if it stays
    /// unreachable for `NODE_TIMEOUT`, suspects it lost and starts an
    /// election (§4.4's "failure to contact LeaderRef within heartbeat
    /// window" trigger, distinct from discovery's own peer-table eviction
    /// timeout).
    fn spawn_heartbeat_loop(&self) {
        let election = self.election.clone();
        let peers = self.peers.clone();
        let heartbeat_interval = self.config.heartbeat_interval();
        let node_timeout = self.config.node_timeout();
        let cancel = self.root_cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(heartbeat_interval);
            let mut last_contact = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(leader) = election.current_leader() else {
                            election.start_election().await;
                            continue;
                        };
                        if leader == election.self_id() {
                            last_contact = tokio::time::Instant::now();
                            continue;
                        }
                        let Some(addr) = peers.read().get(&leader).map(|p| p.tcp_addr()) else {
                            if last_contact.elapsed() >= node_timeout {
                                warn!(%leader, "leader not in peer table past node_timeout, starting election");
                                election.start_election().await;
                                last_contact = tokio::time::Instant::now();
                            }
                            continue;
                        };
                        let reached = transport::send_json_request_token(leader, addr, &LeaderRequest::Health).await.is_ok();
                        if reached {
                            last_contact = tokio::time::Instant::now();
                        } else if last_contact.elapsed() >= node_timeout {
                            warn!(%leader, elapsed = ?last_contact.elapsed(), "leader unreachable past node_timeout, starting election");
                            election.start_election().await;
                            last_contact = tokio::time::Instant::now();
                        }
                    }
                }
            }
        });
        self.tasks.write().push(handle);
    }

    /// Resolves once this node's Discovery Agent has observed its own id
    /// echoed from a foreign host. The caller (normally `main.rs`'s run
    /// loop) is expected to `stop` this node, obtain a fresh identity via
    /// `resolve_fresh_identity`, and construct+start a replacement.
    pub async fn wait_for_collision(&self) {
        self.collision.notified().await;
    }

    pub async fn stop(&self) {
        self.discovery.announce_leave().await;
        self.root_cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks.write());
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!("shutdown grace period elapsed before all tasks exited");
        }
        info!(node_id = %self.self_id, "node stopped");
    }
}

/// Dispatches inbound peer TCP connections to the right component based
/// on the wire message's tag.
struct RequestRouter<S: Store> {
    self_id: NodeId,
    store: Arc<S>,
    lock_table: Arc<LockTable>,
    peers: PeerTable,
    election: Arc<ElectionEngine>,
    coordinator: Arc<Coordinator<S>>,
}

#[async_trait::async_trait]
impl<S: Store + 'static> crate::transport::ConnectionHandler for RequestRouter<S> {
    async fn handle(&self, request_bytes: Vec<u8>, peer_addr: SocketAddr) -> Vec<u8> {
        crate::router::route(
            &request_bytes,
            peer_addr,
            self.self_id,
            &self.store,
            &self.lock_table,
            &self.peers,
            &self.election,
            &self.coordinator,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterMode;
    use std::path::PathBuf;

    fn test_config(data_dir: PathBuf) -> NodeConfig {
        NodeConfig {
            node_id: None,
            cluster_mode: ClusterMode::Dynamic,
            multicast_group: "224.0.0.100".to_string(),
            multicast_port: 5005,
            discovery_announce_interval_secs: 5,
            discovery_node_timeout_secs: 15,
            heartbeat_interval_secs: 5,
            node_timeout_secs: 15,
            base_tcp_port: 25555,
            base_udp_port: 26000,
            identity_start_id: 1,
            identity_max_attempts: 100,
            data_dir,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn resolve_identity_persists_and_reuses_across_calls_in_same_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());

        let first = resolve_identity(&config).unwrap();
        let first_id = first.node_id.value();
        drop(first);

        let second = resolve_identity(&config).unwrap();
        assert_eq!(second.node_id.value(), first_id);
    }

    #[test]
    fn resolve_identity_honors_explicit_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.node_id = Some(9);

        let bound = resolve_identity(&config).unwrap();
        assert_eq!(bound.node_id.value(), 9);
    }
}
