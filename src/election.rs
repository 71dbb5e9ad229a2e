//! Election Engine (§4.4): Bully algorithm over the peer table.
//!
//! Three-state machine (Follower/Candidate/Leader) with term-based
//! tie-breaking over the JSON/TCP wire format: an `RwLock`-guarded leader
//! reference, a `start_election` entry point, and handlers that react to
//! inbound `ELECTION`/`COORDINATOR` requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::discovery::PeerTable;
use crate::ids::{NodeId, Term};
use crate::messages::PeerRequest;
use crate::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy)]
pub struct ElectionState {
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
}

impl Default for ElectionState {
    fn default() -> Self {
        Self { role: Role::Follower, term: Term(0), leader: None }
    }
}

pub const COORDINATOR_WAIT: Duration = Duration::from_secs(6);

/// Runs the Bully algorithm for one node. State transitions are
/// serialized behind a single `RwLock`; a separate flag guards against
/// overlapping concurrent election runs.
pub struct ElectionEngine {
    self_id: NodeId,
    state: RwLock<ElectionState>,
    running: AtomicBool,
    peers: PeerTable,
}

impl ElectionEngine {
    pub fn new(self_id: NodeId, peers: PeerTable) -> Self {
        Self { self_id, state: RwLock::new(ElectionState::default()), running: AtomicBool::new(false), peers }
    }

    pub fn snapshot(&self) -> ElectionState {
        *self.state.read()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.state.read().leader
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.state.read().term
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Starts a new election unless one is already running on this node.
    /// Contacts every peer with a higher id; if any answers, defers to it
    /// and reverts to `Follower` pending its `COORDINATOR` announcement.
    /// If none answer (or none exist), becomes leader and broadcasts.
    pub async fn start_election(self: &Arc<Self>) -> ElectionState {
        if self.running.swap(true, Ordering::SeqCst) {
            return self.snapshot();
        }

        let term = {
            let mut state = self.state.write();
            state.role = Role::Candidate;
            state.term = state.term.next();
            state.leader = None;
            state.term
        };
        info!(node_id = %self.self_id, term = %term, "starting election");

        let higher: Vec<_> = {
            let table = self.peers.read();
            table.values().filter(|p| p.node_id > self.self_id).cloned().collect()
        };

        let mut higher_alive = false;
        let request = PeerRequest::Election { term: term.0, from: self.self_id.value() };
        for peer in &higher {
            if transport::send_json_request_token(peer.node_id, peer.tcp_addr(), &request).await.is_ok() {
                higher_alive = true;
            }
        }

        let resolved = if higher_alive {
            let mut state = self.state.write();
            state.role = Role::Follower;
            *state
        } else {
            self.become_leader(term);
            self.announce_leadership().await;
            self.snapshot()
        };

        self.running.store(false, Ordering::SeqCst);

        if resolved.role == Role::Follower {
            self.spawn_coordinator_wait(term);
        }
        resolved
    }

    /// After deferring to a higher-id candidate, waits a bounded window for
    /// its `COORDINATOR` announcement. If none arrives for this term (the
    /// leader is still unset or the term itself is stale), retriggers a
    /// fresh election rather than waiting forever.
    fn spawn_coordinator_wait(self: &Arc<Self>, waited_term: Term) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COORDINATOR_WAIT).await;
            let still_waiting = {
                let state = engine.state.read();
                state.term == waited_term && state.leader.is_none()
            };
            if still_waiting {
                warn!(node_id = %engine.self_id, term = %waited_term, "no COORDINATOR arrived within wait window, retriggering election");
                engine.start_election().await;
            }
        });
    }

    fn become_leader(&self, term: Term) {
        let mut state = self.state.write();
        if state.term > term {
            return;
        }
        state.role = Role::Leader;
        state.term = term;
        state.leader = Some(self.self_id);
        info!(node_id = %self.self_id, term = %term, "became leader");
    }

    /// Broadcasts `COORDINATOR(term, self)` to every known peer, best
    /// effort, after winning an election.
    pub async fn announce_leadership(&self) {
        let term = self.state.read().term;
        let msg = PeerRequest::Coordinator { term: term.0, leader: self.self_id.value() };
        let peers: Vec<_> = self.peers.read().values().cloned().collect();
        for peer in peers {
            let _ = transport::send_fire_and_forget(peer.tcp_addr(), &msg).await;
        }
    }

    /// Handles an inbound `ELECTION(term, from)` request: replies `true`
    /// (caller sends back `"OK"`) only when our id outranks the
    /// requester, which per the Bully rule means the requester should
    /// back off and we should start our own election in the background.
    pub fn handle_election(&self, term: Term, from: NodeId) -> bool {
        if self.self_id <= from {
            return false;
        }
        {
            let mut state = self.state.write();
            if term > state.term {
                state.term = term;
            }
        }
        true
    }

    /// Handles an inbound `COORDINATOR(term, leader)`. Adoption is
    /// monotonic in term: a message for an older term than what we've
    /// already seen is ignored, so a delayed announcement from a
    /// superseded election can never roll back a newer leader.
    pub fn handle_coordinator(&self, term: Term, leader: NodeId) {
        let mut state = self.state.write();
        if term < state.term {
            warn!(node_id = %self.self_id, term = %term, current = %state.term, "ignoring stale COORDINATOR");
            return;
        }
        state.term = term;
        state.role = Role::Follower;
        state.leader = Some(leader);
        info!(node_id = %self.self_id, leader = %leader, term = %term, "adopted leader");
    }

    /// A higher-id peer joining while self is leader must trigger a
    /// fresh election per the Bully invariant (the highest live id always
    /// wins).
    pub fn higher_peer_joined_while_leader(&self, joined: NodeId) -> bool {
        let state = self.state.read();
        state.role == Role::Leader && joined > self.self_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Peer;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Instant;

    fn peer(id: u32) -> Peer {
        Peer {
            node_id: NodeId::try_from(id).unwrap(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 1,
            udp_port: 2,
            last_seen: Instant::now(),
        }
    }

    #[tokio::test]
    async fn single_node_cluster_self_elects_leader() {
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = Arc::new(ElectionEngine::new(NodeId::try_from(3).unwrap(), peers));
        let state = engine.start_election().await;
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.leader, Some(NodeId::try_from(3).unwrap()));
    }

    #[tokio::test]
    async fn unreachable_higher_peer_still_yields_leadership() {
        // Node 2 in a {1,2,3} cluster where 3 is dead on the network: its
        // tcp port points nowhere, so the election reply collapses to
        // `TransportUnavailable` and is treated as "no higher peer alive".
        let mut table = HashMap::new();
        table.insert(NodeId::try_from(1).unwrap(), peer(1));
        let mut dead = peer(3);
        dead.tcp_port = 1; // nothing listens on port 1 in the sandbox
        table.insert(NodeId::try_from(3).unwrap(), dead);
        let peers: PeerTable = Arc::new(RwLock::new(table));
        let engine = Arc::new(ElectionEngine::new(NodeId::try_from(2).unwrap(), peers));

        let state = engine.start_election().await;
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.leader, Some(NodeId::try_from(2).unwrap()));
    }

    #[test]
    fn coordinator_adoption_is_monotonic_in_term() {
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = ElectionEngine::new(NodeId::try_from(1).unwrap(), peers);
        engine.handle_coordinator(Term(5), NodeId::try_from(9).unwrap());
        assert_eq!(engine.current_leader(), Some(NodeId::try_from(9).unwrap()));

        engine.handle_coordinator(Term(3), NodeId::try_from(2).unwrap());
        assert_eq!(engine.current_leader(), Some(NodeId::try_from(9).unwrap()));

        engine.handle_coordinator(Term(5), NodeId::try_from(9).unwrap());
        assert_eq!(engine.current_leader(), Some(NodeId::try_from(9).unwrap()));
    }

    #[test]
    fn higher_peer_join_while_leader_triggers_reelection_flag() {
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = ElectionEngine::new(NodeId::try_from(4).unwrap(), peers);
        engine.handle_coordinator(Term(1), NodeId::try_from(4).unwrap());
        assert!(engine.higher_peer_joined_while_leader(NodeId::try_from(5).unwrap()));
        assert!(!engine.higher_peer_joined_while_leader(NodeId::try_from(3).unwrap()));
    }

    #[test]
    fn election_handler_defers_only_to_lower_ids() {
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = ElectionEngine::new(NodeId::try_from(5).unwrap(), peers);
        assert!(engine.handle_election(Term(1), NodeId::try_from(2).unwrap()));
        assert!(!engine.handle_election(Term(1), NodeId::try_from(9).unwrap()));
    }
}
