//! Closed error taxonomy shared by every coordination component.
//!
//! Only transport primitives (`std::io::Error`, `serde_json::Error`) and the
//! store layer are allowed to produce errors internally; everything else in
//! the coordination core returns `CoordError` so callers can match on a
//! closed set instead of catching arbitrary exceptions.

use crate::ids::{NodeId, ResourceKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("no leader known or leader unreachable after retries")]
    NoLeader,

    #[error("resource {0:?} is no longer free")]
    ResourceBusy(ResourceKey),

    #[error("peer {0:?} denied the lock request")]
    LockDenied(NodeId),

    #[error("consensus failed: {acked}/{needed} peers acknowledged")]
    ConsensusFailed { acked: usize, needed: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("peer {0:?} unavailable (timeout, refused, or malformed reply)")]
    TransportUnavailable(NodeId),

    #[error("visit {folio} is already closed")]
    AlreadyClosed { folio: String },

    #[error("doctor {doctor_id} is not assigned to visit {folio}")]
    NotAssigned { folio: String, doctor_id: i64 },

    #[error("no free node identity found after {attempts} attempts")]
    NoFreeIdentity { attempts: u32 },

    #[error("node id {0} collides with a peer already using it")]
    IdCollision(NodeId),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type CoordResult<T> = Result<T, CoordError>;
