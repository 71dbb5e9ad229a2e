//! Cluster Aggregator (§4.7): read-only fan-out/merge across the local
//! store and every known peer. Local rows are tagged `source=local`;
//! peer rows are tagged `source=node_{id}`; unreachable peers contribute
//! a `status=offline` entry instead of failing the whole call.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::discovery::PeerTable;
use crate::error::CoordError;
use crate::ids::NodeId;
use crate::messages::{
    LeaderRequest, ListBedsQuery, ListBedsResponse, ListDoctorsQuery, ListDoctorsResponse, ListVisitsQuery, ListVisitsResponse,
};
use crate::store::{Bed, Doctor, Store, StoreStats, Visit, VisitState};
use crate::transport;

const PEER_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedDoctor {
    #[serde(flatten)]
    pub doctor: Doctor,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedBed {
    #[serde(flatten)]
    pub bed: Bed,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedVisit {
    #[serde(flatten)]
    pub visit: Visit,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEntry {
    pub source: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedDoctors {
    pub doctors: Vec<TaggedDoctor>,
    pub offline: Vec<OfflineEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedBeds {
    pub beds: Vec<TaggedBed>,
    pub offline: Vec<OfflineEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedVisits {
    pub visits: Vec<TaggedVisit>,
    pub offline: Vec<OfflineEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub doctors_total: i64,
    pub doctors_available: i64,
    pub beds_total: i64,
    pub beds_available: i64,
    pub visits_active: i64,
    pub visits_completed: i64,
    pub doctors_pct: f64,
    pub beds_pct: f64,
    pub responding_nodes: usize,
    pub offline: Vec<OfflineEntry>,
}

fn capacity_pct(available: i64, total: i64) -> f64 {
    if total > 0 {
        (available as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

pub struct ClusterAggregator<S: Store> {
    self_id: NodeId,
    store: Arc<S>,
    peers: PeerTable,
}

impl<S: Store> ClusterAggregator<S> {
    pub fn new(self_id: NodeId, store: Arc<S>, peers: PeerTable) -> Self {
        Self { self_id, store, peers }
    }

    fn offline_source(&self, node_id: NodeId) -> OfflineEntry {
        OfflineEntry { source: format!("node_{}", node_id.value()), status: "offline" }
    }

    pub async fn list_doctors(&self, sala_id: u32, disponible: Option<bool>, activo: Option<bool>) -> Result<AggregatedDoctors, CoordError> {
        let mut out = AggregatedDoctors::default();
        for doctor in self.store.list_doctors(sala_id, disponible, activo).await? {
            out.doctors.push(TaggedDoctor { doctor, source: "local".to_string() });
        }

        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        let envelope = LeaderRequest::ListDoctors { query: ListDoctorsQuery { disponible, activo } };
        let replies = join_all(peer_list.iter().map(|peer| {
            let envelope = envelope.clone();
            async move {
                let result = tokio::time::timeout(
                    PEER_QUERY_TIMEOUT,
                    transport::send_json_request::<_, ListDoctorsResponse>(peer.node_id, peer.tcp_addr(), &envelope),
                )
                .await;
                (peer.node_id, result)
            }
        }))
        .await;

        for (node_id, result) in replies {
            match result {
                Ok(Ok(response)) => {
                    let source = format!("node_{}", node_id.value());
                    for doctor in response.doctors {
                        out.doctors.push(TaggedDoctor { doctor, source: source.clone() });
                    }
                }
                _ => {
                    warn!(peer = %node_id, "peer unreachable for list_doctors");
                    out.offline.push(self.offline_source(node_id));
                }
            }
        }
        Ok(out)
    }

    pub async fn list_beds(&self, sala_id: u32, ocupada: Option<bool>) -> Result<AggregatedBeds, CoordError> {
        let mut out = AggregatedBeds::default();
        for bed in self.store.list_beds(sala_id, ocupada).await? {
            out.beds.push(TaggedBed { bed, source: "local".to_string() });
        }

        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        let envelope = LeaderRequest::ListBeds { query: ListBedsQuery { ocupada } };
        let replies = join_all(peer_list.iter().map(|peer| {
            let envelope = envelope.clone();
            async move {
                let result = tokio::time::timeout(
                    PEER_QUERY_TIMEOUT,
                    transport::send_json_request::<_, ListBedsResponse>(peer.node_id, peer.tcp_addr(), &envelope),
                )
                .await;
                (peer.node_id, result)
            }
        }))
        .await;

        for (node_id, result) in replies {
            match result {
                Ok(Ok(response)) => {
                    let source = format!("node_{}", node_id.value());
                    for bed in response.beds {
                        out.beds.push(TaggedBed { bed, source: source.clone() });
                    }
                }
                _ => {
                    warn!(peer = %node_id, "peer unreachable for list_beds");
                    out.offline.push(self.offline_source(node_id));
                }
            }
        }
        Ok(out)
    }

    pub async fn list_visits(&self, sala_id: u32, estado: Option<VisitState>, limit: Option<usize>) -> Result<AggregatedVisits, CoordError> {
        let mut out = AggregatedVisits::default();
        for visit in self.store.list_visits(sala_id, estado, limit).await? {
            out.visits.push(TaggedVisit { visit, source: "local".to_string() });
        }

        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        let estado_str = estado.map(|s| s.as_str().to_string());
        let envelope = LeaderRequest::ListVisits { query: ListVisitsQuery { estado: estado_str, limit } };
        let replies = join_all(peer_list.iter().map(|peer| {
            let envelope = envelope.clone();
            async move {
                let result = tokio::time::timeout(
                    PEER_QUERY_TIMEOUT,
                    transport::send_json_request::<_, ListVisitsResponse>(peer.node_id, peer.tcp_addr(), &envelope),
                )
                .await;
                (peer.node_id, result)
            }
        }))
        .await;

        for (node_id, result) in replies {
            match result {
                Ok(Ok(response)) => {
                    let source = format!("node_{}", node_id.value());
                    for visit in response.visits {
                        out.visits.push(TaggedVisit { visit, source: source.clone() });
                    }
                }
                _ => {
                    warn!(peer = %node_id, "peer unreachable for list_visits");
                    out.offline.push(self.offline_source(node_id));
                }
            }
        }
        Ok(out)
    }

    pub async fn stats(&self, sala_id: u32) -> Result<AggregatedStats, CoordError> {
        let local = self.store.stats(sala_id).await?;
        let mut total = AggregatedStats {
            doctors_total: local.doctors_total,
            doctors_available: local.doctors_available,
            beds_total: local.beds_total,
            beds_available: local.beds_available,
            visits_active: local.visits_active,
            visits_completed: local.visits_completed,
            responding_nodes: 1,
            ..Default::default()
        };

        let peer_list: Vec<_> = self.peers.read().values().cloned().collect();
        let replies = join_all(peer_list.iter().map(|peer| async move {
            let result = tokio::time::timeout(PEER_QUERY_TIMEOUT, fetch_peer_stats(peer.node_id, peer.tcp_addr())).await;
            (peer.node_id, result)
        }))
        .await;

        for (node_id, result) in replies {
            match result {
                Ok(Ok(stats)) => {
                    total.doctors_total += stats.doctors_total;
                    total.doctors_available += stats.doctors_available;
                    total.beds_total += stats.beds_total;
                    total.beds_available += stats.beds_available;
                    total.visits_active += stats.visits_active;
                    total.visits_completed += stats.visits_completed;
                    total.responding_nodes += 1;
                }
                _ => {
                    warn!(peer = %node_id, "peer unreachable for stats");
                    total.offline.push(self.offline_source(node_id));
                }
            }
        }

        total.doctors_pct = capacity_pct(total.doctors_available, total.doctors_total);
        total.beds_pct = capacity_pct(total.beds_available, total.beds_total);
        let _ = self.self_id;
        Ok(total)
    }
}

async fn fetch_peer_stats(peer: NodeId, addr: std::net::SocketAddr) -> Result<StoreStats, CoordError> {
    transport::send_json_request(peer, addr, &LeaderRequest::Stats).await
}
