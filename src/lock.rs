//! Lock Manager (§4.5): unanimous-agreement distributed locking over a
//! fixed resource set (`Doctor`/`Bed`). Every peer must grant before a
//! lock is considered held; any denial or timeout rolls back whatever was
//! already acquired, released in reverse order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::discovery::PeerTable;
use crate::error::CoordError;
use crate::ids::{NodeId, ResourceKey, ResourceKind};
use crate::messages::{PeerRequest, SimpleReply};
use crate::store::Store;
use crate::transport;

const PROVISIONAL_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    holder: NodeId,
    acquired_at: Instant,
}

/// The locally-held view of locks this node has granted to others (as a
/// peer, when asked) or acquired for itself (as the requester).
struct LockTableInner {
    held: HashMap<ResourceKey, LockEntry>,
}

pub struct LockTable {
    inner: Mutex<LockTableInner>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(LockTableInner { held: HashMap::new() }) }
    }

    /// Evicts provisional locks older than `PROVISIONAL_TTL`, in case a
    /// requester crashed after acquiring but before releasing.
    fn sweep_expired(&self) {
        let mut inner = self.inner.lock();
        inner.held.retain(|key, entry| {
            let alive = entry.acquired_at.elapsed() < PROVISIONAL_TTL;
            if !alive {
                warn!(?key, holder = %entry.holder, "provisional lock expired, evicting");
            }
            alive
        });
    }

    /// Handles an inbound `LOCK_REQUEST` as a peer: denies if the
    /// resource is already held by someone else *or* `resource_free` (the
    /// caller's own local-store availability check, §4.5: "if local
    /// LockEntry exists for the key or the resource is occupied in the
    /// local store, reply LOCK_DENIED") says it is no longer free;
    /// otherwise records a provisional entry and grants.
    pub fn handle_lock_request(&self, key: ResourceKey, requester: NodeId, resource_free: bool) -> SimpleReply {
        self.sweep_expired();
        if !resource_free {
            return SimpleReply::LockDenied;
        }
        let mut inner = self.inner.lock();
        match inner.held.get(&key) {
            Some(entry) if entry.holder != requester => SimpleReply::LockDenied,
            _ => {
                inner.held.insert(key, LockEntry { holder: requester, acquired_at: Instant::now() });
                SimpleReply::LockGranted
            }
        }
    }

    pub fn handle_lock_release(&self, key: ResourceKey) {
        self.inner.lock().held.remove(&key);
    }

    pub fn is_locked_locally(&self, key: ResourceKey) -> bool {
        self.inner.lock().held.contains_key(&key)
    }
}

/// Looks up whether a resource is still free in the local store, per
/// `ResourceKind`.
pub async fn resource_free_in_store<S: Store>(store: &S, key: ResourceKey) -> Result<bool, CoordError> {
    match key.kind {
        ResourceKind::Doctor => store.doctor_available(key.id).await,
        ResourceKind::Bed => store.bed_free(key.id).await,
    }
}

/// Acquires unanimous agreement on every key in `keys`, in the fixed
/// global acquisition order, contacting both remote peers and this same
/// node's local table (the leader locks against itself too, so a
/// single-node cluster still serializes correctly).
pub async fn acquire_unanimous<S: Store>(
    self_id: NodeId,
    local_table: &LockTable,
    peers: &PeerTable,
    store: &S,
    keys: &[ResourceKey],
) -> Result<(), CoordError> {
    let mut ordered = keys.to_vec();
    ResourceKey::sort_for_acquisition(&mut ordered);

    let mut acquired: Vec<ResourceKey> = Vec::new();
    for key in &ordered {
        match acquire_one(self_id, local_table, peers, store, *key).await {
            Ok(()) => acquired.push(*key),
            Err(e) => {
                release_all(self_id, local_table, peers, &acquired).await;
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn acquire_one<S: Store>(self_id: NodeId, local_table: &LockTable, peers: &PeerTable, store: &S, key: ResourceKey) -> Result<(), CoordError> {
    let resource_free = resource_free_in_store(store, key).await?;
    let local_reply = local_table.handle_lock_request(key, self_id, resource_free);
    if local_reply == SimpleReply::LockDenied {
        return Err(CoordError::LockDenied(self_id));
    }

    let peer_list: Vec<_> = peers.read().values().cloned().collect();
    let request = PeerRequest::LockRequest { kind: key.kind, id: key.id, requester: self_id.value(), ts: now_unix_f64() };

    for peer in &peer_list {
        let reply = transport::send_json_request_token(peer.node_id, peer.tcp_addr(), &request)
            .await
            .map_err(|_| CoordError::TransportUnavailable(peer.node_id))?;
        match SimpleReply::parse(&reply) {
            Some(SimpleReply::LockGranted) => continue,
            Some(SimpleReply::LockDenied) | None => {
                local_table.handle_lock_release(key);
                return Err(CoordError::LockDenied(peer.node_id));
            }
            Some(_) => {
                local_table.handle_lock_release(key);
                return Err(CoordError::LockDenied(peer.node_id));
            }
        }
    }

    info!(?key, node_id = %self_id, "lock acquired unanimously");
    Ok(())
}

/// Releases every key, best-effort, in reverse acquisition order.
pub async fn release_all(self_id: NodeId, local_table: &LockTable, peers: &PeerTable, keys: &[ResourceKey]) {
    for key in keys.iter().rev() {
        local_table.handle_lock_release(*key);
        let peer_list: Vec<_> = peers.read().values().cloned().collect();
        let request = PeerRequest::LockRelease { kind: key.kind, id: key.id };
        for peer in &peer_list {
            let _ = transport::send_fire_and_forget(peer.tcp_addr(), &request).await;
        }
        let _ = self_id;
    }
}

fn now_unix_f64() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

pub type SharedLockTable = Arc<LockTable>;
