//! Port forwarding
//!
//! Three independent modes over an authenticated session: local
//! (listen here, tunnel out), remote (listen on the far end, dial here),
//! and dynamic (embedded SOCKS5 server tunnelling per-request). The
//! [`PortForwardManager`] owns the registry and lifecycle.

mod dynamic;
mod local;
mod manager;
mod remote;

pub use manager::{ForwardKind, ForwardRule, ForwardRuleUpdate, ForwardStatus, PortForwardManager};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Traffic counters for one forward
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub(crate) type SharedStats = std::sync::Arc<parking_lot::RwLock<ForwardStats>>;

pub(crate) fn new_stats() -> SharedStats {
    std::sync::Arc::new(parking_lot::RwLock::new(ForwardStats::default()))
}

/// A bridge with no bytes moving in a direction for this long is torn down.
pub(crate) const BRIDGE_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Pipe two streams into each other until either side closes, errors, or
/// sits idle past [`BRIDGE_IDLE_TIMEOUT`]. Returns bytes moved a->b and b->a.
pub(crate) async fn bridge_streams<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let forward = async {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match tokio::time::timeout(BRIDGE_IDLE_TIMEOUT, a_read.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => {
                    if b_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    a_to_b += n as u64;
                }
            }
        }
        let _ = b_write.shutdown().await;
        a_to_b
    };

    let backward = async {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match tokio::time::timeout(BRIDGE_IDLE_TIMEOUT, b_read.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => {
                    if a_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    b_to_a += n as u64;
                }
            }
        }
        let _ = a_write.shutdown().await;
        b_to_a
    };

    // Either side finishing ends the bridge; the other drains on drop
    tokio::select! {
        sent = forward => (sent, b_to_a),
        received = backward => (a_to_b, received),
    }
}
