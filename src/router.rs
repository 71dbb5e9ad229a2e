//! Dispatches one inbound peer TCP connection's JSON payload to the
//! right component. Two tagged families share the same listener: the
//! peer protocol (`PeerRequest`, tag `action`) and the leader-endpoint
//! protocol (`LeaderRequest`, tag `endpoint`); the router tries the
//! former first since it is the more frequent traffic.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::discovery::PeerTable;
use crate::election::ElectionEngine;
use crate::ids::{NodeId, Term};
use crate::lock::LockTable;
use crate::messages::{HealthResponse, LeaderRequest, ListDoctorsResponse, ListBedsResponse, ListVisitsResponse, PeerRequest, SimpleReply};
use crate::store::{Store, VisitState};

// `LeaderRequest` handlers here answer peer-to-peer queries (e.g. the
// Aggregator on another node asking for our local rows) and always return
// local-only data; the merged, tagged, multi-node view is
// `Node::aggregator`, called in-process by whatever embeds this crate.
#[allow(clippy::too_many_arguments)]
pub async fn route<S: Store + 'static>(
    request_bytes: &[u8],
    peer_addr: SocketAddr,
    self_id: NodeId,
    store: &Arc<S>,
    lock_table: &Arc<LockTable>,
    peers: &PeerTable,
    election: &Arc<ElectionEngine>,
    coordinator: &Arc<Coordinator<S>>,
) -> Vec<u8> {
    if let Ok(request) = serde_json::from_slice::<PeerRequest>(request_bytes) {
        return handle_peer_request(request, peer_addr, self_id, store, lock_table, election, coordinator).await;
    }
    if let Ok(request) = serde_json::from_slice::<LeaderRequest>(request_bytes) {
        return handle_leader_request(request, self_id, store, coordinator).await;
    }
    debug!(peer = %peer_addr, "unrecognized request shape");
    SimpleReply::Error.as_token().as_bytes().to_vec()
}

async fn handle_peer_request<S: Store + 'static>(
    request: PeerRequest,
    peer_addr: SocketAddr,
    self_id: NodeId,
    store: &Arc<S>,
    lock_table: &Arc<LockTable>,
    election: &Arc<ElectionEngine>,
    coordinator: &Arc<Coordinator<S>>,
) -> Vec<u8> {
    match request {
        PeerRequest::LockRequest { kind, id, requester, .. } => {
            let key = crate::ids::ResourceKey { kind, id };
            let requester_id = match NodeId::try_from(requester) {
                Ok(id) => id,
                Err(_) => return SimpleReply::Error.as_token().as_bytes().to_vec(),
            };
            let resource_free = match crate::lock::resource_free_in_store(store.as_ref(), key).await {
                Ok(free) => free,
                Err(e) => {
                    warn!(error = %e, "store lookup failed while handling lock request");
                    return SimpleReply::Error.as_token().as_bytes().to_vec();
                }
            };
            lock_table.handle_lock_request(key, requester_id, resource_free).as_token().as_bytes().to_vec()
        }
        PeerRequest::LockRelease { kind, id } => {
            lock_table.handle_lock_release(crate::ids::ResourceKey { kind, id });
            SimpleReply::LockReleased.as_token().as_bytes().to_vec()
        }
        PeerRequest::InsertPatient { data } => match serde_json::from_value::<crate::store::NewPatient>(data) {
            Ok(patient) => match coordinator.create_patient(patient).await {
                Ok(id) => serde_json::to_vec(&id).unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "insert_patient replication failed");
                    SimpleReply::Error.as_token().as_bytes().to_vec()
                }
            },
            Err(_) => SimpleReply::Error.as_token().as_bytes().to_vec(),
        },
        PeerRequest::AssignResources { data } => coordinator.handle_replicate_visit(data).await.as_token().as_bytes().to_vec(),
        PeerRequest::CloseVisit { data } => coordinator.handle_replicate_close(data).await.as_token().as_bytes().to_vec(),
        PeerRequest::IncrementSequence { data } => coordinator.handle_increment_sequence_vote(data).await.as_token().as_bytes().to_vec(),
        PeerRequest::Election { term, from } => {
            let from_id = match NodeId::try_from(from) {
                Ok(id) => id,
                Err(_) => return SimpleReply::Error.as_token().as_bytes().to_vec(),
            };
            let defer = election.handle_election(Term(term), from_id);
            if defer {
                let election = election.clone();
                tokio::spawn(async move {
                    election.start_election().await;
                });
            }
            b"OK".to_vec()
        }
        PeerRequest::Coordinator { term, leader } => {
            if let Ok(leader_id) = NodeId::try_from(leader) {
                election.handle_coordinator(Term(term), leader_id);
            }
            debug!(peer = %peer_addr, "processed COORDINATOR announcement");
            let _ = self_id;
            b"OK".to_vec()
        }
    }
}

async fn handle_leader_request<S: Store + 'static>(
    request: LeaderRequest,
    self_id: NodeId,
    store: &Arc<S>,
    coordinator: &Arc<Coordinator<S>>,
) -> Vec<u8> {
    let sala_id = self_id.value();
    match request {
        LeaderRequest::Health => {
            serde_json::to_vec(&HealthResponse { status: "ok", node_id: self_id.value() }).unwrap_or_default()
        }
        LeaderRequest::ListDoctors { query } => match store.list_doctors(sala_id, query.disponible, query.activo).await {
            Ok(doctors) => serde_json::to_vec(&ListDoctorsResponse { node_id: self_id.to_string(), count: doctors.len(), doctors }).unwrap_or_default(),
            Err(_) => SimpleReply::Error.as_token().as_bytes().to_vec(),
        },
        LeaderRequest::ListBeds { query } => match store.list_beds(sala_id, query.ocupada).await {
            Ok(beds) => serde_json::to_vec(&ListBedsResponse { node_id: self_id.to_string(), count: beds.len(), beds }).unwrap_or_default(),
            Err(_) => SimpleReply::Error.as_token().as_bytes().to_vec(),
        },
        LeaderRequest::ListVisits { query } => {
            let estado = query.estado.as_deref().and_then(parse_visit_state);
            match store.list_visits(sala_id, estado, query.limit).await {
                Ok(visits) => serde_json::to_vec(&ListVisitsResponse { node_id: self_id.to_string(), count: visits.len(), visits }).unwrap_or_default(),
                Err(_) => SimpleReply::Error.as_token().as_bytes().to_vec(),
            }
        }
        LeaderRequest::Stats => match store.stats(sala_id).await {
            Ok(stats) => serde_json::to_vec(&stats).unwrap_or_default(),
            Err(_) => SimpleReply::Error.as_token().as_bytes().to_vec(),
        },
        LeaderRequest::CreateVisit { request } => match coordinator.create_visit(request).await {
            Ok(reply) => serde_json::to_vec(&reply).unwrap_or_default(),
            Err(e) => serde_json::to_vec(&e.to_string()).unwrap_or_default(),
        },
        LeaderRequest::CloseVisit { request } => {
            match coordinator.close_visit(request.folio, request.doctor_id, request.diagnosis).await {
                Ok(visit) => serde_json::to_vec(&visit).unwrap_or_default(),
                Err(e) => serde_json::to_vec(&e.to_string()).unwrap_or_default(),
            }
        }
    }
}

fn parse_visit_state(s: &str) -> Option<VisitState> {
    match s {
        "active" => Some(VisitState::Active),
        "completed" => Some(VisitState::Completed),
        "cancelled" => Some(VisitState::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn single_node_fixture() -> (NodeId, Arc<MemoryStore>, Arc<LockTable>, PeerTable, Arc<ElectionEngine>, Arc<Coordinator<MemoryStore>>) {
        let self_id = NodeId::try_from(1).unwrap();
        let store = Arc::new(MemoryStore::new(1));
        store.seed_doctor(2, 1);
        store.seed_bed(3, 1);
        let lock_table = Arc::new(LockTable::new());
        let peers: PeerTable = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let election = Arc::new(ElectionEngine::new(self_id, peers.clone()));
        election.handle_coordinator(crate::ids::Term(1), self_id);
        let coordinator = Arc::new(Coordinator::new(self_id, store.clone(), lock_table.clone(), peers.clone(), election.clone()));
        (self_id, store, lock_table, peers, election, coordinator)
    }

    fn dummy_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn routes_health_request_to_leader_endpoint_family() {
        let (self_id, store, lock_table, peers, election, coordinator) = single_node_fixture();
        let request = serde_json::to_vec(&LeaderRequest::Health).unwrap();

        let reply = route(&request, dummy_addr(), self_id, &store, &lock_table, &peers, &election, &coordinator).await;

        let parsed: HealthResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.node_id, self_id.value());
    }

    #[tokio::test]
    async fn routes_lock_request_to_lock_table() {
        let (self_id, store, lock_table, peers, election, coordinator) = single_node_fixture();
        let request = serde_json::to_vec(&PeerRequest::LockRequest {
            kind: crate::ids::ResourceKind::Doctor,
            id: 2,
            requester: self_id.value(),
            ts: 0.0,
        })
        .unwrap();

        let reply = route(&request, dummy_addr(), self_id, &store, &lock_table, &peers, &election, &coordinator).await;

        assert_eq!(reply, SimpleReply::LockGranted.as_token().as_bytes());
    }

    #[tokio::test]
    async fn lock_request_is_denied_when_resource_occupied_in_store_without_local_entry() {
        let (self_id, store, lock_table, peers, election, coordinator) = single_node_fixture();
        // Doctor 99 was never seeded, so the store reports it unavailable
        // even though no peer has taken out a LockEntry for it.
        let request = serde_json::to_vec(&PeerRequest::LockRequest {
            kind: crate::ids::ResourceKind::Doctor,
            id: 99,
            requester: self_id.value(),
            ts: 0.0,
        })
        .unwrap();

        let reply = route(&request, dummy_addr(), self_id, &store, &lock_table, &peers, &election, &coordinator).await;

        assert_eq!(reply, SimpleReply::LockDenied.as_token().as_bytes());
        assert!(!lock_table.is_locked_locally(crate::ids::ResourceKey::doctor(99)));
    }

    #[tokio::test]
    async fn routes_create_visit_to_coordinator_and_mints_folio() {
        let (self_id, store, lock_table, peers, election, coordinator) = single_node_fixture();
        let request = serde_json::to_vec(&LeaderRequest::CreateVisit {
            request: crate::messages::CreateVisitRequest {
                id_paciente: 5,
                id_doctor: 2,
                id_cama: 3,
                id_trabajador: 1,
                id_sala: 1,
                sintomas: "chest pain".into(),
            },
        })
        .unwrap();

        let reply = route(&request, dummy_addr(), self_id, &store, &lock_table, &peers, &election, &coordinator).await;

        let parsed: crate::messages::CreateVisitResponse = serde_json::from_slice(&reply).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.folio, "5+2+1+001");
    }

    #[tokio::test]
    async fn unrecognized_payload_returns_error_token() {
        let (self_id, store, lock_table, peers, election, coordinator) = single_node_fixture();
        let request = b"{\"nonsense\":true}".to_vec();

        let reply = route(&request, dummy_addr(), self_id, &store, &lock_table, &peers, &election, &coordinator).await;

        assert_eq!(reply, SimpleReply::Error.as_token().as_bytes());
    }
}
