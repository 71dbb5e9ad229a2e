//! Coordinator (§4.6): the leader-mediated write path. `CreatePatient`,
//! `CreateVisit`, `CloseVisit`, and `IncrementSequence` all flow through
//! here. A follower transparently proxies to the current leader; the
//! leader performs the real work under the Lock Manager and Store.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::discovery::PeerTable;
use crate::election::ElectionEngine;
use crate::error::CoordError;
use crate::ids::{NodeId, ResourceKey};
use crate::lock::{self, LockTable};
use crate::messages::{
    CreateVisitRequest, CreateVisitResponse, IncrementSequenceBody, LeaderRequest, PeerRequest, ReplicateCloseVisit, ReplicateVisit,
    SimpleReply,
};
use crate::store::{NewPatient, NewVisit, Store, Visit};
use crate::transport;

const PROXY_RETRIES: u32 = 3;
const FOLIO_MINT_RETRIES: u32 = 5;

pub struct Coordinator<S: Store> {
    self_id: NodeId,
    store: Arc<S>,
    lock_table: Arc<LockTable>,
    peers: PeerTable,
    election: Arc<ElectionEngine>,
    // Held across steps 1-6 of visit creation, per the concurrency model:
    // one mutex, scoped to the smallest block that re-reads, inserts, and
    // flips resource state.
    visit_creation: AsyncMutex<()>,
}

impl<S: Store> Coordinator<S> {
    pub fn new(self_id: NodeId, store: Arc<S>, lock_table: Arc<LockTable>, peers: PeerTable, election: Arc<ElectionEngine>) -> Self {
        Self { self_id, store, lock_table, peers, election, visit_creation: AsyncMutex::new(()) }
    }

    fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    fn leader_addr(&self) -> Option<std::net::SocketAddr> {
        let leader = self.election.current_leader()?;
        if leader == self.self_id {
            return None;
        }
        self.peers.read().get(&leader).map(|p| p.tcp_addr())
    }

    pub async fn create_patient(&self, patient: NewPatient) -> Result<i64, CoordError> {
        patient.validate()?;
        if self.is_leader() {
            return self.store.insert_patient(patient).await;
        }
        // CreatePatient has no dedicated wire shape beyond the generic
        // INSERT_PATIENT replication command; proxy it as a fire-and-forget
        // style request carrying the raw payload and read back the minted id.
        for attempt in 0..PROXY_RETRIES {
            let Some(addr) = self.leader_addr() else {
                warn!(attempt, "no leader known for CreatePatient proxy");
                continue;
            };
            let leader_id = self.election.current_leader().unwrap_or(self.self_id);
            let payload = serde_json::to_value(&patient_to_wire(&patient)).map_err(CoordError::Codec)?;
            let request = PeerRequest::InsertPatient { data: payload };
            match transport::send_json_request::<_, i64>(leader_id, addr, &request).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    warn!(attempt, error = %e, "CreatePatient proxy attempt failed");
                    continue;
                }
            }
        }
        Err(CoordError::NoLeader)
    }

    pub async fn create_visit(&self, req: CreateVisitRequest) -> Result<CreateVisitResponse, CoordError> {
        if self.is_leader() {
            return self.create_visit_as_leader(req).await;
        }
        for attempt in 0..PROXY_RETRIES {
            let Some(addr) = self.leader_addr() else {
                warn!(attempt, "no leader known for CreateVisit proxy");
                continue;
            };
            let leader_id = self.election.current_leader().unwrap_or(self.self_id);
            let envelope = LeaderRequest::CreateVisit { request: req.clone() };
            match transport::send_json_request::<_, CreateVisitResponse>(leader_id, addr, &envelope).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(attempt, error = %e, "CreateVisit proxy attempt failed");
                    continue;
                }
            }
        }
        Err(CoordError::NoLeader)
    }

    async fn create_visit_as_leader(&self, req: CreateVisitRequest) -> Result<CreateVisitResponse, CoordError> {
        let doctor_key = ResourceKey::doctor(req.id_doctor);
        let bed_key = ResourceKey::bed(req.id_cama);
        lock::acquire_unanimous(self.self_id, &self.lock_table, &self.peers, self.store.as_ref(), &[doctor_key, bed_key]).await?;

        let result = self.create_visit_locked(&req).await;

        lock::release_all(self.self_id, &self.lock_table, &self.peers, &[doctor_key, bed_key]).await;
        let visit = result?;

        self.replicate_visit_to_peers(&visit).await;

        Ok(CreateVisitResponse { success: true, folio: visit.folio.clone(), visita: visit })
    }

    async fn create_visit_locked(&self, req: &CreateVisitRequest) -> Result<Visit, CoordError> {
        let _guard = self.visit_creation.lock().await;

        if !self.store.doctor_available(req.id_doctor).await? {
            return Err(CoordError::ResourceBusy(ResourceKey::doctor(req.id_doctor)));
        }
        if !self.store.bed_free(req.id_cama).await? {
            return Err(CoordError::ResourceBusy(ResourceKey::bed(req.id_cama)));
        }

        let folio = self.mint_folio(req.id_paciente, req.id_doctor, req.id_sala).await?;

        self.store
            .create_visit(NewVisit {
                folio,
                patient_id: req.id_paciente,
                doctor_id: req.id_doctor,
                bed_id: req.id_cama,
                sw_id: req.id_trabajador,
                sala_id: req.id_sala,
                symptoms: req.sintomas.clone(),
            })
            .await
    }

    async fn mint_folio(&self, patient_id: i64, doctor_id: i64, sala_id: u32) -> Result<String, CoordError> {
        for _ in 0..FOLIO_MINT_RETRIES {
            let seq = self.store.next_sequence(sala_id).await?;
            let folio = format!("{patient_id}+{doctor_id}+{sala_id}+{seq:03}");
            if self.store.visit_by_folio(&folio).await?.is_none() {
                return Ok(folio);
            }
        }
        let unix_secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        Ok(format!("{patient_id}{doctor_id}{sala_id}{unix_secs}"))
    }

    async fn replicate_visit_to_peers(&self, visit: &Visit) {
        let request = PeerRequest::AssignResources {
            data: ReplicateVisit {
                folio: visit.folio.clone(),
                patient_id: visit.patient_id,
                doctor_id: visit.doctor_id,
                bed_id: visit.bed_id,
                sw_id: visit.sw_id,
                sala_id: visit.sala_id,
                symptoms: visit.symptoms.clone(),
                created_at_unix: visit.created_at_unix,
            },
        };
        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        let mut failed_nodes = Vec::new();
        for peer in &peer_list {
            match transport::send_json_request_token(peer.node_id, peer.tcp_addr(), &request).await {
                Ok(reply) if SimpleReply::parse(&reply) == Some(SimpleReply::ConsensusOk) => {}
                _ => failed_nodes.push(peer.node_id.value()),
            }
        }
        if !failed_nodes.is_empty() {
            warn!(folio = %visit.folio, ?failed_nodes, "visit replication partially failed");
        } else {
            info!(folio = %visit.folio, "visit replicated to all peers");
        }
    }

    /// Idempotent replication receiver for `ASSIGN_RESOURCES`.
    pub async fn handle_replicate_visit(&self, data: ReplicateVisit) -> SimpleReply {
        let result = self
            .store
            .replicate_visit(NewVisit {
                folio: data.folio,
                patient_id: data.patient_id,
                doctor_id: data.doctor_id,
                bed_id: data.bed_id,
                sw_id: data.sw_id,
                sala_id: data.sala_id,
                symptoms: data.symptoms,
            })
            .await;
        match result {
            Ok(_) => SimpleReply::ConsensusOk,
            Err(e) => {
                warn!(error = %e, "replication of visit failed");
                SimpleReply::Error
            }
        }
    }

    pub async fn close_visit(&self, folio: String, doctor_id: i64, diagnosis: String) -> Result<Visit, CoordError> {
        if self.is_leader() {
            return self.close_visit_as_leader(folio, doctor_id, diagnosis).await;
        }
        for attempt in 0..PROXY_RETRIES {
            let Some(addr) = self.leader_addr() else {
                warn!(attempt, "no leader known for CloseVisit proxy");
                continue;
            };
            let leader_id = self.election.current_leader().unwrap_or(self.self_id);
            let request = ReplicateCloseVisit { folio: folio.clone(), doctor_id, diagnosis: diagnosis.clone(), closed_at_unix: 0 };
            let envelope = LeaderRequest::CloseVisit { request };
            match transport::send_json_request::<_, Visit>(leader_id, addr, &envelope).await {
                Ok(visit) => return Ok(visit),
                Err(e) => {
                    warn!(attempt, error = %e, "CloseVisit proxy attempt failed");
                    continue;
                }
            }
        }
        Err(CoordError::NoLeader)
    }

    async fn close_visit_as_leader(&self, folio: String, doctor_id: i64, diagnosis: String) -> Result<Visit, CoordError> {
        let visit = self.store.close_visit(&folio, doctor_id, diagnosis.clone()).await?;

        let request = PeerRequest::CloseVisit {
            data: ReplicateCloseVisit {
                folio: visit.folio.clone(),
                doctor_id: visit.doctor_id,
                diagnosis: diagnosis.clone(),
                closed_at_unix: visit.closed_at_unix.unwrap_or(0),
            },
        };
        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        for peer in &peer_list {
            let _ = transport::send_json_request_token(peer.node_id, peer.tcp_addr(), &request).await;
        }
        Ok(visit)
    }

    /// Idempotent replication receiver for `CLOSE_VISIT`.
    pub async fn handle_replicate_close(&self, data: ReplicateCloseVisit) -> SimpleReply {
        match self.store.close_visit(&data.folio, data.doctor_id, data.diagnosis).await {
            Ok(_) => SimpleReply::ConsensusOk,
            Err(CoordError::AlreadyClosed { .. }) => SimpleReply::ConsensusOk,
            Err(e) => {
                warn!(error = %e, "replication of close-visit failed");
                SimpleReply::Error
            }
        }
    }

    /// `IncrementSequence` over the majority-consensus path: broadcasts
    /// the proposed value, requires `floor(n/2)+1` `CONSENSUS_OK` votes
    /// out of the whole cluster (peers plus self), then applies locally
    /// regardless of stragglers (the local counter has already advanced
    /// by the time quorum is checked).
    pub async fn increment_sequence(&self, sala_id: u32) -> Result<u64, CoordError> {
        let proposed = self.store.next_sequence(sala_id).await?;
        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        // N = peers + self; quorum is floor(N/2)+1 of the whole cluster,
        // not of the peer set alone.
        let cluster_size = peer_list.len() + 1;
        let needed = cluster_size / 2 + 1;

        let request = PeerRequest::IncrementSequence { data: IncrementSequenceBody { sala_id, proposed } };
        let mut acked = 1; // the proposer counts as one voter
        for peer in &peer_list {
            match transport::send_json_request_token(peer.node_id, peer.tcp_addr(), &request).await {
                Ok(reply) if SimpleReply::parse(&reply) == Some(SimpleReply::ConsensusOk) => acked += 1,
                _ => {}
            }
        }

        if acked < needed {
            return Err(CoordError::ConsensusFailed { acked, needed });
        }
        Ok(proposed)
    }

    /// Peer-side vote for an `INCREMENT_SEQUENCE` proposal: accepts
    /// (advances the local sequence to at least `proposed`) as long as
    /// the proposal is not behind what we've already seen.
    pub async fn handle_increment_sequence_vote(&self, body: IncrementSequenceBody) -> SimpleReply {
        match self.store.advance_sequence_to(body.sala_id, body.proposed).await {
            Ok(current) if current >= body.proposed => SimpleReply::ConsensusOk,
            Ok(_) => SimpleReply::ConsensusRejected,
            Err(e) => {
                warn!(error = %e, "sequence vote failed");
                SimpleReply::Error
            }
        }
    }
}

#[derive(serde::Serialize)]
struct PatientWire<'a> {
    name: &'a str,
    age: i32,
    sex: &'a Option<String>,
    curp: &'a Option<String>,
    contact: &'a Option<String>,
}

fn patient_to_wire(patient: &NewPatient) -> PatientWire<'_> {
    PatientWire { name: &patient.name, age: patient.age, sex: &patient.sex, curp: &patient.curp, contact: &patient.contact }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Peer;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Instant;

    use crate::store::MemoryStore;
    use parking_lot::RwLock;

    fn single_node_coordinator() -> Coordinator<MemoryStore> {
        let self_id = NodeId::try_from(1).unwrap();
        let store = Arc::new(MemoryStore::new(1));
        store.seed_doctor(2, 1);
        store.seed_bed(3, 1);
        let lock_table = Arc::new(LockTable::new());
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let election = Arc::new(ElectionEngine::new(self_id, peers.clone()));
        election.handle_coordinator(crate::ids::Term(1), self_id);
        Coordinator::new(self_id, store, lock_table, peers, election)
    }

    #[tokio::test]
    async fn create_visit_mints_expected_folio_for_single_node() {
        let coordinator = single_node_coordinator();
        let req = CreateVisitRequest { id_paciente: 5, id_doctor: 2, id_cama: 3, id_trabajador: 1, id_sala: 1, sintomas: "chest pain".into() };
        let reply = coordinator.create_visit(req).await.unwrap();
        assert_eq!(reply.folio, "5+2+1+001");
        assert!(reply.success);
    }

    #[tokio::test]
    async fn create_visit_rejects_busy_doctor() {
        let coordinator = single_node_coordinator();
        let req = CreateVisitRequest { id_paciente: 5, id_doctor: 2, id_cama: 3, id_trabajador: 1, id_sala: 1, sintomas: "a".into() };
        coordinator.create_visit(req).await.unwrap();

        let req2 = CreateVisitRequest { id_paciente: 9, id_doctor: 2, id_cama: 3, id_trabajador: 1, id_sala: 1, sintomas: "b".into() };
        let err = coordinator.create_visit(req2).await.unwrap_err();
        assert!(matches!(err, CoordError::ResourceBusy(_)));
    }

    #[tokio::test]
    async fn close_visit_frees_resources() {
        let coordinator = single_node_coordinator();
        let req = CreateVisitRequest { id_paciente: 5, id_doctor: 2, id_cama: 3, id_trabajador: 1, id_sala: 1, sintomas: "a".into() };
        let created = coordinator.create_visit(req).await.unwrap();

        let closed = coordinator.close_visit(created.folio, 2, "resolved".into()).await.unwrap();
        assert_eq!(closed.state, crate::store::VisitState::Completed);
    }

    #[tokio::test]
    async fn non_leader_without_reachable_leader_returns_no_leader() {
        let self_id = NodeId::try_from(1).unwrap();
        let store = Arc::new(MemoryStore::new(1));
        let lock_table = Arc::new(LockTable::new());
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let election = Arc::new(ElectionEngine::new(self_id, peers.clone()));
        // Never adopts a leader: role stays Follower, leader stays None.
        let coordinator = Coordinator::new(self_id, store, lock_table, peers, election);

        let req = CreateVisitRequest { id_paciente: 1, id_doctor: 1, id_cama: 1, id_trabajador: 1, id_sala: 1, sintomas: "x".into() };
        let err = coordinator.create_visit(req).await.unwrap_err();
        assert!(matches!(err, CoordError::NoLeader));
    }

    #[tokio::test]
    async fn increment_sequence_with_no_peers_always_meets_quorum_of_one() {
        let coordinator = single_node_coordinator();
        let first = coordinator.increment_sequence(7).await.unwrap();
        let second = coordinator.increment_sequence(7).await.unwrap();
        assert!(first < second);
    }

    fn dummy_peer(id: u32) -> Peer {
        Peer { node_id: NodeId::try_from(id).unwrap(), host: IpAddr::V4(Ipv4Addr::LOCALHOST), tcp_port: 1, udp_port: 2, last_seen: Instant::now() }
    }

    struct ConsensusOkHandler;

    #[async_trait::async_trait]
    impl crate::transport::ConnectionHandler for ConsensusOkHandler {
        async fn handle(&self, _request_bytes: Vec<u8>, _peer_addr: std::net::SocketAddr) -> Vec<u8> {
            SimpleReply::ConsensusOk.as_token().as_bytes().to_vec()
        }
    }

    /// Spawns a listener that unconditionally grants `CONSENSUS_OK`, for
    /// simulating a reachable, voting peer.
    async fn spawn_voting_peer(node_id: u32) -> Peer {
        let listener = crate::transport::PeerListener::bind(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(listener.serve(Arc::new(ConsensusOkHandler), cancel));
        Peer { node_id: NodeId::try_from(node_id).unwrap(), host: addr.ip(), tcp_port: addr.port(), udp_port: 0, last_seen: Instant::now() }
    }

    /// N=4 (self + 3 peers), needed = floor(4/2)+1 = 3. With only one
    /// unreachable peer (port 1) and two voting peers, `acked` reaches
    /// exactly 3 (self + 2 voters): the N/2+1 boundary must succeed.
    #[tokio::test]
    async fn increment_sequence_four_node_cluster_succeeds_at_majority_plus_one() {
        let self_id = NodeId::try_from(1).unwrap();
        let store = Arc::new(MemoryStore::new(1));
        let lock_table = Arc::new(LockTable::new());
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let voter_a = spawn_voting_peer(2).await;
        let voter_b = spawn_voting_peer(3).await;
        let unreachable = dummy_peer(4);
        {
            let mut table = peers.write();
            table.insert(voter_a.node_id, voter_a);
            table.insert(voter_b.node_id, voter_b);
            table.insert(unreachable.node_id, unreachable);
        }
        let election = Arc::new(ElectionEngine::new(self_id, peers.clone()));
        election.handle_coordinator(crate::ids::Term(1), self_id);
        let coordinator = Coordinator::new(self_id, store, lock_table, peers, election);

        let result = coordinator.increment_sequence(1).await;
        assert!(result.is_ok());
    }

    /// Same four-node cluster, but only one peer is reachable: `acked`
    /// stops at 2 (self + 1 voter), exactly N/2, which must fail quorum.
    #[tokio::test]
    async fn increment_sequence_four_node_cluster_fails_at_exactly_half() {
        let self_id = NodeId::try_from(1).unwrap();
        let store = Arc::new(MemoryStore::new(1));
        let lock_table = Arc::new(LockTable::new());
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let voter_a = spawn_voting_peer(2).await;
        let unreachable_b = dummy_peer(3);
        let unreachable_c = dummy_peer(4);
        {
            let mut table = peers.write();
            table.insert(voter_a.node_id, voter_a);
            table.insert(unreachable_b.node_id, unreachable_b);
            table.insert(unreachable_c.node_id, unreachable_c);
        }
        let election = Arc::new(ElectionEngine::new(self_id, peers.clone()));
        election.handle_coordinator(crate::ids::Term(1), self_id);
        let coordinator = Coordinator::new(self_id, store, lock_table, peers, election);

        let err = coordinator.increment_sequence(1).await.unwrap_err();
        assert!(matches!(err, CoordError::ConsensusFailed { acked: 2, needed: 3 }));
    }
}
