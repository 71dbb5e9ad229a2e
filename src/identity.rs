//! Identity & Port Binder (§4.1).
//!
//! Scans candidate node ids starting at `start_id`, binding the derived
//! TCP and UDP ports atomically (at the OS level) for each candidate,
//! until both bind successfully. The chosen id is persisted to a
//! per-process file so a restart of the *same* process reuses it; a
//! different process performs a fresh search.

use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CoordError;
use crate::ids::NodeId;

pub fn derive_tcp_port(base_tcp: u16, node_id: u32) -> u16 {
    base_tcp + (node_id % 1000) as u16
}

pub fn derive_udp_port(base_udp: u16, node_id: u32) -> u16 {
    base_udp + (node_id % 1000) as u16
}

/// Result of a successful identity bind: the chosen id plus the two
/// already-bound sockets, so nothing else can race us for the ports
/// between the check and first use.
pub struct BoundIdentity {
    pub node_id: NodeId,
    pub tcp_listener: TcpListener,
    pub udp_socket: UdpSocket,
}

fn ports_available(tcp_port: u16, udp_port: u16) -> Option<(TcpListener, UdpSocket)> {
    let tcp = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, tcp_port)).ok()?;
    let udp = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, udp_port)).ok()?;
    Some((tcp, udp))
}

/// Binds the smallest integer id (starting at `start_id`) whose derived TCP
/// and UDP ports both bind successfully.
pub fn bind_identity(
    start_id: u32,
    max_attempts: u32,
    base_tcp: u16,
    base_udp: u16,
) -> Result<BoundIdentity, CoordError> {
    for attempt in 0..max_attempts {
        let candidate = start_id + attempt;
        let node_id = match NodeId::try_from(candidate) {
            Ok(id) => id,
            Err(_) => continue,
        };
        let tcp_port = derive_tcp_port(base_tcp, candidate);
        let udp_port = derive_udp_port(base_udp, candidate);
        if let Some((tcp_listener, udp_socket)) = ports_available(tcp_port, udp_port) {
            info!(node_id = candidate, tcp_port, udp_port, "bound node identity");
            return Ok(BoundIdentity { node_id, tcp_listener, udp_socket });
        }
        debug!(candidate, tcp_port, udp_port, "candidate id unavailable");
    }
    Err(CoordError::NoFreeIdentity { attempts: max_attempts })
}

/// Binds a specific, externally supplied node id (validated to be a
/// positive integer below 2^31). Fails if the derived ports are taken.
pub fn bind_specific_identity(node_id: u32, base_tcp: u16, base_udp: u16) -> Result<BoundIdentity, CoordError> {
    let validated = NodeId::try_from(node_id)?;
    let tcp_port = derive_tcp_port(base_tcp, node_id);
    let udp_port = derive_udp_port(base_udp, node_id);
    let (tcp_listener, udp_socket) = ports_available(tcp_port, udp_port)
        .ok_or_else(|| CoordError::Validation(format!("ports for node id {node_id} are already in use")))?;
    Ok(BoundIdentity { node_id: validated, tcp_listener, udp_socket })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedId {
    node_id: u32,
    generated_at: f64,
    timestamp: String,
}

/// Persists/loads the chosen node id to a per-process file, keyed by PID,
/// under `<data_dir>/node_ids/`.
pub struct IdStore {
    dir: PathBuf,
}

impl IdStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn file_path(&self) -> PathBuf {
        self.dir.join(format!("node_pid_{}.json", std::process::id()))
    }

    pub fn load(&self) -> Option<u32> {
        let path = self.file_path();
        let contents = fs::read_to_string(&path).ok()?;
        let persisted: PersistedId = serde_json::from_str(&contents).ok()?;
        info!(node_id = persisted.node_id, path = %path.display(), "loaded persisted node id");
        Some(persisted.node_id)
    }

    pub fn save(&self, node_id: u32) -> Result<(), CoordError> {
        fs::create_dir_all(&self.dir)?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let persisted = PersistedId {
            node_id,
            generated_at: now.as_secs_f64(),
            timestamp: humantime_like(now.as_secs()),
        };
        let path = self.file_path();
        fs::write(&path, serde_json::to_vec_pretty(&persisted)?)?;
        info!(node_id, path = %path.display(), "persisted node id");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CoordError> {
        let path = self.file_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Minimal `YYYY-MM-DD HH:MM:SS` UTC rendering without pulling in a date
/// crate just for an informational timestamp field.
fn humantime_like(unix_secs: u64) -> String {
    let days = unix_secs / 86_400;
    let secs_of_day = unix_secs % 86_400;
    let (h, m, s) = (secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60);
    // Naive civil-from-days conversion (Howard Hinnant's algorithm), good
    // enough for a diagnostic timestamp field.
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let mo = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if mo <= 2 { y + 1 } else { y };
    format!("{y:04}-{mo:02}-{d:02} {h:02}:{m:02}:{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_derivation_wraps_at_1000() {
        assert_eq!(derive_tcp_port(5555, 1), 5556);
        assert_eq!(derive_tcp_port(5555, 1000), 5555);
        assert_eq!(derive_udp_port(6000, 2), 6002);
    }

    #[test]
    fn bind_identity_finds_smallest_free_id() {
        let bound = bind_identity(1, 100, 15555, 16000).unwrap();
        assert!(bound.node_id.value() >= 1);
    }

    #[test]
    fn bind_identity_exhausts_when_ports_always_taken() {
        // Hold the very first candidate's ports open, then restrict the
        // search to a single attempt so it cannot skip past the conflict.
        let held_tcp = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 25555)).unwrap();
        let held_udp = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 26000)).unwrap();

        let result = bind_identity(1000 * 25, 1, 25555, 26000);
        assert!(matches!(result, Err(CoordError::NoFreeIdentity { attempts: 1 })));

        drop(held_tcp);
        drop(held_udp);
    }

    #[test]
    fn id_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdStore::new(dir.path().to_path_buf());
        assert!(store.load().is_none());
        store.save(42).unwrap();
        assert_eq!(store.load(), Some(42));
        store.clear().unwrap();
        assert!(store.load().is_none());
    }
}
