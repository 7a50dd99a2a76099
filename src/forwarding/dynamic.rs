//! Dynamic port forwarding (embedded SOCKS5 server)
//!
//! Binds a TCP listener and speaks the SOCKS5 server side to each client:
//! no-auth greeting, CONNECT request, then a tunnel through the session to
//! the requested destination. Only CONNECT with IPv4 or domain addresses
//! is served.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::local::bind_error;
use super::{bridge_streams, new_stats, ForwardStats, SharedStats};
use crate::error::{Error, Result};
use crate::proxy::socks5;
use crate::transport::Session;

/// Handle to a running SOCKS5 forward
pub(crate) struct DynamicForwardHandle {
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: SharedStats,
}

impl DynamicForwardHandle {
    pub async fn stop(&self) {
        info!("Stopping SOCKS5 forward on {}", self.bound_addr);
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

pub(crate) async fn start_dynamic_forward(
    session: Arc<dyn Session>,
    bind_addr: &str,
) -> Result<DynamicForwardHandle> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| bind_error(bind_addr, e))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| Error::ForwardSetup(format!("Failed to get bound address: {}", e)))?;

    info!("Started SOCKS5 forward on {}", bound_addr);

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
                    info!("SOCKS5 forward on {} stopped: session closed", bound_addr);
                    break;
                }
                _ = stop_rx.recv() => {
                    debug!("SOCKS5 forward on {} stopped by request", bound_addr);
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
                            {
                                let mut s = stats_task.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let session = session.clone();
                            let stats = stats_task.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_client(session, stream, peer, &stats).await {
                                    debug!("SOCKS5 client {} failed: {}", peer, e);
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

    Ok(DynamicForwardHandle {
        bound_addr,
        running,
        stop_tx,
        stats,
    })
}

async fn serve_client(
    session: Arc<dyn Session>,
    mut stream: TcpStream,
    peer: SocketAddr,
    stats: &SharedStats,
) -> Result<()> {
    socks5::serve_greeting(&mut stream).await?;
    let request = socks5::serve_connect_request(&mut stream).await?;
    debug!(
        "SOCKS5 client {} requests {}:{}",
        peer, request.host, request.port
    );

    let channel = session
        .forward_out(
            &peer.ip().to_string(),
            peer.port(),
            &request.host,
            request.port,
        )
        .await;

    let channel = match channel {
        Ok(channel) => {
            socks5::send_server_reply(&mut stream, socks5::REP_SUCCESS).await?;
            channel
        }
        Err(e) => {
            warn!(
                "SOCKS5 tunnel to {}:{} failed: {}",
                request.host, request.port, e
            );
            socks5::send_server_reply(&mut stream, socks5::REP_GENERAL_FAILURE).await?;
            return Err(e);
        }
    };

    let (sent, received) = bridge_streams(stream, channel).await;
    let mut s = stats.write();
    s.bytes_sent += sent;
    s.bytes_received += received;
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
    async fn socks5_connect_end_to_end() {
        let (transport, session) = mock_session().await;
        let handle = start_dynamic_forward(session, "127.0.0.1:0").await.unwrap();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        socks5::client_handshake(&mut client, None, "example.com", 80)
            .await
            .unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let mock = transport.last_session().unwrap();
        assert_eq!(
            mock.forward_out_log.lock().clone(),
            vec![("example.com".to_string(), 80)]
        );
    }

    #[tokio::test]
    async fn channel_failure_returns_generic_failure_reply() {
        let (transport, session) = mock_session().await;
        let handle = start_dynamic_forward(session, "127.0.0.1:0").await.unwrap();
        transport.last_session().unwrap().refuse_forward_out();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        let err = socks5::client_handshake(&mut client, None, "example.com", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial(_)));
        assert!(err.to_string().contains("status 1"));
    }
}
