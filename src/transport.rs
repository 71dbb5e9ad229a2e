//! Peer Transport (§4.3): one TCP listener per node, unicast
//! request/reply framed as exactly one JSON object per connection, plus
//! the client-side helpers every other component uses to talk to peers.
//!
//! Transport failures (timeout, refused, malformed reply) are never
//! fatal to the caller: they collapse to `CoordError::TransportUnavailable`
//! and the caller treats that peer as absent for the current round.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::CoordError;
use crate::ids::NodeId;

pub const NORMAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const FIRE_AND_FORGET_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_FRAME_BYTES: usize = 1 << 20;

/// Sends `request` to `addr`, reads back a reply of type `R`
/// (a JSON object decoded with serde), bounded by `NORMAL_TIMEOUT`.
/// Any failure along the way is reported as `TransportUnavailable(peer)`.
pub async fn send_json_request<Req, Rep>(peer: NodeId, addr: SocketAddr, request: &Req) -> Result<Rep, CoordError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    timeout(NORMAL_TIMEOUT, send_json_request_inner(addr, request))
        .await
        .map_err(|_| CoordError::TransportUnavailable(peer))?
        .map_err(|_| CoordError::TransportUnavailable(peer))
}

async fn send_json_request_inner<Req, Rep>(addr: SocketAddr, request: &Req) -> std::io::Result<Rep>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let mut stream = TcpStream::connect(addr).await?;
    let bytes = serde_json::to_vec(request)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await.ok();
    let body = read_one_frame(&mut stream).await?;
    serde_json::from_slice(&body)
}

/// Sends `request` to `addr` and reads back a bare ASCII reply token
/// (`LOCK_GRANTED`, `CONSENSUS_OK`, ...) bounded by `NORMAL_TIMEOUT`.
pub async fn send_json_request_token<Req>(peer: NodeId, addr: SocketAddr, request: &Req) -> Result<String, CoordError>
where
    Req: Serialize,
{
    timeout(NORMAL_TIMEOUT, send_token_request_inner(addr, request))
        .await
        .map_err(|_| CoordError::TransportUnavailable(peer))?
        .map_err(|_| CoordError::TransportUnavailable(peer))
}

async fn send_token_request_inner<Req>(addr: SocketAddr, request: &Req) -> std::io::Result<String>
where
    Req: Serialize,
{
    let mut stream = TcpStream::connect(addr).await?;
    let bytes = serde_json::to_vec(request)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await.ok();
    let body = read_one_frame(&mut stream).await?;
    Ok(String::from_utf8_lossy(&body).to_string())
}

/// Best-effort send with no reply expected (e.g. `LOCK_RELEASE`, UDP
/// heartbeats sent over TCP in the absence of a reply). Bounded by
/// `FIRE_AND_FORGET_TIMEOUT`; errors are swallowed by the caller.
pub async fn send_fire_and_forget<Req>(addr: SocketAddr, request: &Req) -> Result<(), CoordError>
where
    Req: Serialize,
{
    timeout(FIRE_AND_FORGET_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        let bytes = serde_json::to_vec(request)?;
        stream.write_all(&bytes).await?;
        stream.shutdown().await.ok();
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|_| CoordError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "fire-and-forget timed out")))?
    .map_err(CoordError::Io)
}

async fn read_one_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
        }
    }
    Ok(buf)
}

/// A connection handler receives the raw request bytes for one connection
/// and returns the raw reply bytes to write back before the socket closes.
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, request_bytes: Vec<u8>, peer_addr: SocketAddr) -> Vec<u8>;
}

/// Owns the TCP listener task. Each inbound connection is a short-lived
/// spawned task bounded by `NORMAL_TIMEOUT` for reading the request and
/// writing the reply.
pub struct PeerListener {
    listener: TcpListener,
}

impl PeerListener {
    pub fn from_std(std_listener: std::net::TcpListener) -> std::io::Result<Self> {
        std_listener.set_nonblocking(true)?;
        Ok(Self { listener: TcpListener::from_std(std_listener)? })
    }

    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, handler: std::sync::Arc<dyn ConnectionHandler>, cancel: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, peer_addr, handler).await {
                                    debug!(peer = %peer_addr, error = %e, "connection handling failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, peer_addr: SocketAddr, handler: std::sync::Arc<dyn ConnectionHandler>) -> std::io::Result<()> {
    let body = timeout(NORMAL_TIMEOUT, read_one_frame(&mut stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request read timed out"))??;
    let reply = handler.handle(body, peer_addr).await;
    timeout(NORMAL_TIMEOUT, stream.write_all(&reply))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "reply write timed out"))??;
    stream.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ConnectionHandler for EchoHandler {
        async fn handle(&self, request_bytes: Vec<u8>, _peer_addr: SocketAddr) -> Vec<u8> {
            let mut reply = b"ECHO:".to_vec();
            reply.extend_from_slice(&request_bytes);
            reply
        }
    }

    #[tokio::test]
    async fn request_reply_roundtrips_one_json_object_per_connection() {
        let listener = PeerListener::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(listener.serve(Arc::new(EchoHandler), cancel_clone));

        #[derive(serde::Serialize)]
        struct Ping {
            value: u32,
        }

        let peer = NodeId::try_from(1).unwrap();
        let reply = send_json_request_token(peer, addr, &Ping { value: 7 }).await.unwrap();
        assert!(reply.starts_with("ECHO:"));
        assert!(reply.contains("\"value\":7"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported_as_transport_unavailable() {
        let peer = NodeId::try_from(9).unwrap();
        // Port 1 is privileged/unused in test sandboxes; connecting should fail fast.
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));

        #[derive(serde::Serialize)]
        struct Ping;

        let result: Result<String, CoordError> = send_json_request(peer, addr, &Ping).await;
        assert!(matches!(result, Err(CoordError::TransportUnavailable(id)) if id == peer));
    }
}
