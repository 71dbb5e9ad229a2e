//! Discovery Agent (§4.2): multicast presence announcements and a live
//! peer table, the sole source of truth for Election Engine and
//! Aggregator membership.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ids::NodeId;
use crate::messages::DiscoveryMessage;

#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: NodeId,
    pub host: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub last_seen: Instant,
}

impl Peer {
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.udp_port)
    }
}

pub type PeerTable = Arc<RwLock<HashMap<NodeId, Peer>>>;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerDiscovered(Peer),
    PeerLost(NodeId),
    IdCollision { foreign_host: IpAddr },
}

pub struct DiscoveryAgent {
    self_id: NodeId,
    self_tcp_port: u16,
    self_udp_port: u16,
    local_addrs: Vec<IpAddr>,
    multicast_group: Ipv4Addr,
    multicast_port: u16,
    announce_interval: Duration,
    node_timeout: Duration,
    peers: PeerTable,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
}

fn now_unix_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn bind_multicast_recv_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn bind_multicast_send_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

impl DiscoveryAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        self_tcp_port: u16,
        self_udp_port: u16,
        local_addrs: Vec<IpAddr>,
        multicast_group: Ipv4Addr,
        multicast_port: u16,
        announce_interval: Duration,
        node_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Self {
            self_id,
            self_tcp_port,
            self_udp_port,
            local_addrs,
            multicast_group,
            multicast_port,
            announce_interval,
            node_timeout,
            peers: Arc::new(RwLock::new(HashMap::new())),
            events: tx,
            cancel: CancellationToken::new(),
        };
        (agent, rx)
    }

    pub fn peers(&self) -> PeerTable {
        self.peers.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the announce, listen, and cleanup tasks. Returns immediately;
    /// the tasks run until `cancel` (or the returned token) is cancelled.
    pub async fn start(&self) -> std::io::Result<Vec<tokio::task::JoinHandle<()>>> {
        let recv_socket = bind_multicast_recv_socket(self.multicast_group, self.multicast_port)?;
        let send_socket = bind_multicast_send_socket()?;

        let announce_handle = {
            let send_socket = send_socket;
            let target = SocketAddr::new(self.multicast_group.into(), self.multicast_port);
            let self_id = self.self_id;
            let tcp_port = self.self_tcp_port;
            let udp_port = self.self_udp_port;
            let interval_dur = self.announce_interval;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                run_announce_loop(send_socket, target, self_id, tcp_port, udp_port, interval_dur, cancel).await;
            })
        };

        let listen_handle = {
            let self_id = self.self_id;
            let local_addrs = self.local_addrs.clone();
            let peers = self.peers.clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                run_listen_loop(recv_socket, self_id, local_addrs, peers, events, cancel).await;
            })
        };

        let cleanup_handle = {
            let peers = self.peers.clone();
            let events = self.events.clone();
            let timeout = self.node_timeout;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                run_cleanup_loop(peers, events, timeout, cancel).await;
            })
        };

        Ok(vec![announce_handle, listen_handle, cleanup_handle])
    }

    /// Sends a single best-effort LEAVE announcement, used during shutdown.
    pub async fn announce_leave(&self) {
        if let Ok(socket) = bind_multicast_send_socket() {
            let target = SocketAddr::new(self.multicast_group.into(), self.multicast_port);
            let msg = DiscoveryMessage::Leave { node_id: self.self_id.value(), timestamp: now_unix_f64() };
            if let Ok(bytes) = serde_json::to_vec(&msg) {
                let _ = socket.send_to(&bytes, target).await;
            }
        }
        self.cancel.cancel();
    }
}

async fn run_announce_loop(
    socket: UdpSocket,
    target: SocketAddr,
    self_id: NodeId,
    tcp_port: u16,
    udp_port: u16,
    announce_interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(announce_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let msg = DiscoveryMessage::Announce {
                    node_id: self_id.value(),
                    tcp_port,
                    udp_port,
                    timestamp: now_unix_f64(),
                };
                match serde_json::to_vec(&msg) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, target).await {
                            warn!(error = %e, "discovery announce send failed");
                        } else {
                            debug!(node_id = %self_id, "sent ANNOUNCE");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode ANNOUNCE"),
                }
            }
        }
    }
}

async fn run_listen_loop(
    socket: UdpSocket,
    self_id: NodeId,
    local_addrs: Vec<IpAddr>,
    peers: PeerTable,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => handle_datagram(&buf[..len], src, self_id, &local_addrs, &peers, &events),
                    Err(e) => warn!(error = %e, "discovery recv error"),
                }
            }
        }
    }
}

fn handle_datagram(
    bytes: &[u8],
    src: SocketAddr,
    self_id: NodeId,
    local_addrs: &[IpAddr],
    peers: &PeerTable,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let msg: DiscoveryMessage = match serde_json::from_slice(bytes) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "dropping malformed discovery datagram");
            return;
        }
    };

    let sender_id = match &msg {
        DiscoveryMessage::Announce { node_id, .. } => *node_id,
        DiscoveryMessage::Leave { node_id, .. } => *node_id,
    };

    if sender_id == self_id.value() {
        let is_self_host = local_addrs.contains(&src.ip()) || src.ip().is_loopback();
        if !is_self_host {
            warn!(foreign_host = %src.ip(), "id collision detected");
            let _ = events.send(DiscoveryEvent::IdCollision { foreign_host: src.ip() });
        }
        return;
    }

    match msg {
        DiscoveryMessage::Announce { node_id, tcp_port, udp_port, .. } => {
            let node_id = match NodeId::try_from(node_id) {
                Ok(id) => id,
                Err(_) => return,
            };
            let peer = Peer { node_id, host: src.ip(), tcp_port, udp_port, last_seen: Instant::now() };
            let is_new = {
                let mut table = peers.write();
                let is_new = !table.contains_key(&node_id);
                table.insert(node_id, peer.clone());
                is_new
            };
            if is_new {
                info!(peer = %node_id, host = %src.ip(), "peer discovered");
                let _ = events.send(DiscoveryEvent::PeerDiscovered(peer));
            }
        }
        DiscoveryMessage::Leave { node_id, .. } => {
            if let Ok(node_id) = NodeId::try_from(node_id) {
                let removed = peers.write().remove(&node_id).is_some();
                if removed {
                    info!(peer = %node_id, "peer left");
                    let _ = events.send(DiscoveryEvent::PeerLost(node_id));
                }
            }
        }
    }
}

async fn run_cleanup_loop(peers: PeerTable, events: mpsc::UnboundedSender<DiscoveryEvent>, timeout: Duration, cancel: CancellationToken) {
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let stale: Vec<NodeId> = {
                    let table = peers.read();
                    table
                        .values()
                        .filter(|p| p.last_seen.elapsed() >= timeout)
                        .map(|p| p.node_id)
                        .collect()
                };
                for node_id in stale {
                    let removed = peers.write().remove(&node_id).is_some();
                    if removed {
                        warn!(peer = %node_id, "peer timed out");
                        let _ = events.send(DiscoveryEvent::PeerLost(node_id));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn dummy_peers() -> PeerTable {
        Arc::new(RwLock::new(HashMap::new()))
    }

    #[test]
    fn announce_from_new_peer_is_upserted() {
        let peers = dummy_peers();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let self_id = NodeId::try_from(1).unwrap();
        let msg = DiscoveryMessage::Announce { node_id: 2, tcp_port: 5556, udp_port: 6002, timestamp: 0.0 };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 40000);

        handle_datagram(&bytes, src, self_id, &[], &peers, &tx);

        assert_eq!(peers.read().len(), 1);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, DiscoveryEvent::PeerDiscovered(p) if p.node_id.value() == 2));
    }

    #[test]
    fn leave_removes_peer_and_fires_event() {
        let peers = dummy_peers();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let self_id = NodeId::try_from(1).unwrap();
        let peer_id = NodeId::try_from(2).unwrap();
        peers.write().insert(
            peer_id,
            Peer {
                node_id: peer_id,
                host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                tcp_port: 5556,
                udp_port: 6002,
                last_seen: Instant::now(),
            },
        );

        let msg = DiscoveryMessage::Leave { node_id: 2, timestamp: 0.0 };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 40000);
        handle_datagram(&bytes, src, self_id, &[], &peers, &tx);

        assert!(peers.read().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), DiscoveryEvent::PeerLost(id) if id == peer_id));
    }

    #[test]
    fn own_id_from_foreign_host_raises_collision_and_is_dropped() {
        let peers = dummy_peers();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let self_id = NodeId::try_from(1).unwrap();
        let msg = DiscoveryMessage::Announce { node_id: 1, tcp_port: 5556, udp_port: 6001, timestamp: 0.0 };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 40000);

        handle_datagram(&bytes, src, self_id, &[], &peers, &tx);

        assert!(peers.read().is_empty(), "colliding announce must not be upserted as a peer");
        assert!(matches!(rx.try_recv().unwrap(), DiscoveryEvent::IdCollision { .. }));
    }

    #[test]
    fn own_id_from_own_host_is_ignored_without_collision() {
        let peers = dummy_peers();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let self_id = NodeId::try_from(1).unwrap();
        let msg = DiscoveryMessage::Announce { node_id: 1, tcp_port: 5556, udp_port: 6001, timestamp: 0.0 };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);

        handle_datagram(&bytes, src, self_id, &[], &peers, &tx);

        assert!(peers.read().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_loop_evicts_peers_past_timeout() {
        let peers = dummy_peers();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer_id = NodeId::try_from(2).unwrap();
        peers.write().insert(
            peer_id,
            Peer {
                node_id: peer_id,
                host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                tcp_port: 5556,
                udp_port: 6002,
                last_seen: Instant::now() - Duration::from_secs(20),
            },
        );
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(run_cleanup_loop(peers.clone(), tx, Duration::from_secs(15), cancel_clone));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        cancel.cancel();
        let _ = handle.await;

        assert!(peers.read().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), DiscoveryEvent::PeerLost(id) if id == peer_id));
    }
}
