//! Local port forwarding
//!
//! Binds a TCP listener and tunnels each accepted connection through the
//! session toward the target. Stopping closes the listener; connections
//! already piping drain naturally.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{bridge_streams, new_stats, ForwardStats, SharedStats};
use crate::error::{Error, Result};
use crate::transport::Session;

/// Handle to a running local forward
#[derive(Debug)]
pub(crate) struct LocalForwardHandle {
    /// Actual bound address (differs from requested when port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: SharedStats,
}

impl LocalForwardHandle {
    pub async fn stop(&self) {
        info!("Stopping local forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

pub(crate) fn bind_error(addr: &str, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::AddrInUse => Error::ForwardSetup(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        ErrorKind::PermissionDenied => Error::ForwardSetup(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        ErrorKind::AddrNotAvailable => Error::ForwardSetup(format!(
            "Address not available: {}. The address is not valid on this system.",
            addr
        )),
        _ => Error::ForwardSetup(format!("Failed to bind to {}: {}", addr, e)),
    }
}

pub(crate) async fn start_local_forward(
    session: Arc<dyn Session>,
    bind_addr: &str,
    target_host: String,
    target_port: u16,
) -> Result<LocalForwardHandle> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| bind_error(bind_addr, e))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| Error::ForwardSetup(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local forward: {} -> {}:{}",
        bound_addr, target_host, target_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_task = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stats = new_stats();
    let stats_task = stats.clone();
    let mut session_closed = session.subscribe_close();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = session_closed.recv() => {
                    info!("Local forward on {} stopped: session closed", bound_addr);
                    break;
                }
                _ = stop_rx.recv() => {
                    debug!("Local forward on {} stopped by request", bound_addr);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if !running_task.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Accepted {} for forward to {}:{}", peer, target_host, target_port);
                            {
                                let mut s = stats_task.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let session = session.clone();
                            let target_host = target_host.clone();
                            let stats = stats_task.clone();
                            tokio::spawn(async move {
                                if let Err(e) = pipe_connection(
                                    session, stream, peer, &target_host, target_port, &stats,
                                )
                                .await
                                {
                                    warn!("Forwarded connection failed: {}", e);
                                }
                                let mut s = stats.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            });
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", bound_addr, e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        running_task.store(false, Ordering::SeqCst);
    });

    Ok(LocalForwardHandle {
        bound_addr,
        running,
        stop_tx,
        stats,
    })
}

async fn pipe_connection(
    session: Arc<dyn Session>,
    local: TcpStream,
    peer: SocketAddr,
    target_host: &str,
    target_port: u16,
    stats: &SharedStats,
) -> Result<()> {
    let channel = session
        .forward_out(&peer.ip().to_string(), peer.port(), target_host, target_port)
        .await?;

    let (sent, received) = bridge_streams(local, channel).await;

    let mut s = stats.write();
    s.bytes_sent += sent;
    s.bytes_received += received;
    debug!(
        "Forwarded connection from {} closed ({}B out, {}B in)",
        peer, sent, received
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, Endpoint};
    use crate::transport::mock::MockTransport;
    use crate::transport::Transport;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn mock_session() -> (Arc<MockTransport>, Arc<dyn Session>) {
        let transport = MockTransport::new();
        let (stream, _other) = tokio::io::duplex(64);
        let session = transport
            .authenticate(
                Box::new(stream),
                &Endpoint::new("host", 22),
                "user",
                &AuthMethod::password("pw"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        (transport, session)
    }

    #[tokio::test]
    async fn forwards_bytes_round_trip() {
        let (transport, session) = mock_session().await;
        let handle = start_local_forward(session, "127.0.0.1:0", "db.internal".into(), 5432)
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let mock = transport.last_session().unwrap();
        assert_eq!(
            mock.forward_out_log.lock().clone(),
            vec![("db.internal".to_string(), 5432)]
        );
        assert_eq!(handle.stats().connection_count, 1);
        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn bind_conflict_is_a_setup_error() {
        let (_transport, session) = mock_session().await;
        let first = start_local_forward(session.clone(), "127.0.0.1:0", "t".into(), 80)
            .await
            .unwrap();

        let err = start_local_forward(
            session,
            &first.bound_addr.to_string(),
            "t".into(),
            80,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ForwardSetup(_)));
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn stop_closes_the_listener() {
        let (_transport, session) = mock_session().await;
        let handle = start_local_forward(session, "127.0.0.1:0", "t".into(), 80)
            .await
            .unwrap();
        handle.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // New connections are refused once the listener is gone
        assert!(TcpStream::connect(handle.bound_addr).await.is_err());
    }
}
