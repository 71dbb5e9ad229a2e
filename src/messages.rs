//! Wire message shapes for §6.
//!
//! Every message is a closed, tagged variant with an explicit parser
//! (`serde`'s internally-tagged enums): unknown tags fail to deserialize
//! instead of being silently ignored.

use serde::{Deserialize, Serialize};

use crate::ids::ResourceKind;
use crate::store::{Bed, Doctor, Visit};

/// Multicast discovery datagram (one JSON object per packet).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryMessage {
    #[serde(rename = "ANNOUNCE")]
    Announce {
        node_id: u32,
        tcp_port: u16,
        udp_port: u16,
        timestamp: f64,
    },
    #[serde(rename = "LEAVE")]
    Leave { node_id: u32, timestamp: f64 },
}

/// A single JSON object sent over a peer TCP connection; the reply is
/// either a bare ASCII token (`LockReply`/`Ack`) or a JSON object
/// (`ConsensusReply`, structured query responses).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum PeerRequest {
    #[serde(rename = "LOCK_REQUEST")]
    LockRequest { kind: ResourceKind, id: i64, requester: u32, ts: f64 },

    #[serde(rename = "LOCK_RELEASE")]
    LockRelease { kind: ResourceKind, id: i64 },

    #[serde(rename = "INSERT_PATIENT")]
    InsertPatient { data: serde_json::Value },

    #[serde(rename = "ASSIGN_RESOURCES")]
    AssignResources { data: ReplicateVisit },

    #[serde(rename = "CLOSE_VISIT")]
    CloseVisit { data: ReplicateCloseVisit },

    #[serde(rename = "INCREMENT_SEQUENCE")]
    IncrementSequence { data: IncrementSequenceBody },

    #[serde(rename = "ELECTION")]
    Election { term: u64, from: u32 },

    #[serde(rename = "COORDINATOR")]
    Coordinator { term: u64, leader: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementSequenceBody {
    pub sala_id: u32,
    pub proposed: u64,
}

/// Full visit record replicated from the leader to followers, keyed on
/// the leader-minted folio for idempotent re-application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateVisit {
    pub folio: String,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub bed_id: i64,
    pub sw_id: i64,
    pub sala_id: u32,
    pub symptoms: String,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateCloseVisit {
    pub folio: String,
    pub doctor_id: i64,
    pub diagnosis: String,
    pub closed_at_unix: i64,
}

/// Ad-hoc ASCII/JSON reply tokens for lock and consensus exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleReply {
    LockGranted,
    LockDenied,
    LockReleased,
    ConsensusOk,
    ConsensusRejected,
    Error,
}

impl SimpleReply {
    pub fn as_token(self) -> &'static str {
        match self {
            SimpleReply::LockGranted => "LOCK_GRANTED",
            SimpleReply::LockDenied => "LOCK_DENIED",
            SimpleReply::LockReleased => "LOCK_RELEASED",
            SimpleReply::ConsensusOk => "CONSENSUS_OK",
            SimpleReply::ConsensusRejected => "CONSENSUS_REJECTED",
            SimpleReply::Error => "ERROR",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "LOCK_GRANTED" => Some(SimpleReply::LockGranted),
            "LOCK_DENIED" => Some(SimpleReply::LockDenied),
            "LOCK_RELEASED" => Some(SimpleReply::LockReleased),
            "CONSENSUS_OK" => Some(SimpleReply::ConsensusOk),
            "CONSENSUS_REJECTED" => Some(SimpleReply::ConsensusRejected),
            "ERROR" => Some(SimpleReply::Error),
            _ => None,
        }
    }
}

/// Envelope for the leader HTTP-style endpoints of §6, carried as a
/// single tagged JSON object over the same peer TCP transport used for
/// everything else — "any reliable request/reply transport is
/// acceptable; the JSON schemas are the contract". Tagging these the
/// same way as `PeerRequest` lets one listener dispatch both families
/// from the `action`/`endpoint` field without ambiguity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "endpoint")]
pub enum LeaderRequest {
    #[serde(rename = "HEALTH")]
    Health,
    #[serde(rename = "LIST_DOCTORS")]
    ListDoctors {
        #[serde(flatten)]
        query: ListDoctorsQuery,
    },
    #[serde(rename = "LIST_BEDS")]
    ListBeds {
        #[serde(flatten)]
        query: ListBedsQuery,
    },
    #[serde(rename = "LIST_VISITS")]
    ListVisits {
        #[serde(flatten)]
        query: ListVisitsQuery,
    },
    #[serde(rename = "STATS")]
    Stats,
    #[serde(rename = "CREATE_VISIT")]
    CreateVisit { request: CreateVisitRequest },
    #[serde(rename = "CLOSE_VISIT")]
    CloseVisit { request: ReplicateCloseVisit },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDoctorsQuery {
    pub disponible: Option<bool>,
    pub activo: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDoctorsResponse {
    pub node_id: String,
    pub count: usize,
    pub doctors: Vec<Doctor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBedsQuery {
    pub ocupada: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListBedsResponse {
    pub node_id: String,
    pub count: usize,
    pub beds: Vec<Bed>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVisitsQuery {
    pub estado: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVisitsResponse {
    pub node_id: String,
    pub count: usize,
    pub visits: Vec<Visit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVisitRequest {
    pub id_paciente: i64,
    pub id_doctor: i64,
    pub id_cama: i64,
    pub id_trabajador: i64,
    pub id_sala: u32,
    pub sintomas: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVisitResponse {
    pub success: bool,
    pub folio: String,
    pub visita: Visit,
}
