//! Remote port forwarding
//!
//! Registers a listener on the far end of the session. Each inbound
//! connection the far end delivers is piped against a freshly dialed TCP
//! connection to the local target. Stopping cancels the registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{bridge_streams, new_stats, ForwardStats, SharedStats};
use crate::error::Result;
use crate::transport::{IncomingForward, Session};

/// Handle to a running remote forward
pub(crate) struct RemoteForwardHandle {
    /// Port actually bound on the far end (differs when 0 was requested)
    pub bound_port: u16,
    bind_host: String,
    session: Arc<dyn Session>,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: SharedStats,
}

impl RemoteForwardHandle {
    pub async fn stop(&self) {
        info!(
            "Stopping remote forward on {}:{}",
            self.bind_host, self.bound_port
        );
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self
            .session
            .cancel_forward_in(&self.bind_host, self.bound_port)
            .await
        {
            warn!(
                "Failed to cancel remote forward {}:{}: {}",
                self.bind_host, self.bound_port, e
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

pub(crate) async fn start_remote_forward(
    session: Arc<dyn Session>,
    bind_host: String,
    bind_port: u16,
    target_host: String,
    target_port: u16,
) -> Result<RemoteForwardHandle> {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<IncomingForward>(32);
    let bound_port = session.forward_in(&bind_host, bind_port, incoming_tx).await?;

    info!(
        "Started remote forward: {}:{} -> {}:{}",
        bind_host, bound_port, target_host, target_port
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
                    info!("Remote forward on port {} stopped: session closed", bound_port);
                    break;
                }
                _ = stop_rx.recv() => {
                    debug!("Remote forward on port {} stopped by request", bound_port);
                    break;
                }
                incoming = incoming_rx.recv() => {
                    let Some(incoming) = incoming else {
                        debug!("Remote forward on port {} delivery channel ended", bound_port);
                        break;
                    };
                    debug!(
                        "Inbound connection from {}:{} on remote port {}",
                        incoming.originator_host, incoming.originator_port, bound_port
                    );
                    {
                        let mut s = stats_task.write();
                        s.connection_count += 1;
                        s.active_connections += 1;
                    }

                    let target_host = target_host.clone();
                    let stats = stats_task.clone();
                    tokio::spawn(async move {
                        if let Err(e) = pipe_inbound(incoming, &target_host, target_port, &stats).await {
                            warn!("Remote-forwarded connection failed: {}", e);
                        }
                        let mut s = stats.write();
                        s.active_connections = s.active_connections.saturating_sub(1);
                    });
                }
            }
        }
        running_task.store(false, Ordering::SeqCst);
    });

    Ok(RemoteForwardHandle {
        bound_port,
        bind_host,
        session,
        running,
        stop_tx,
        stats,
    })
}

async fn pipe_inbound(
    incoming: IncomingForward,
    target_host: &str,
    target_port: u16,
    stats: &SharedStats,
) -> std::io::Result<()> {
    let local = TcpStream::connect((target_host, target_port)).await?;
    let _ = local.set_nodelay(true);
    let channel = incoming.accept();

    let (sent, received) = bridge_streams(channel, local).await;
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
    use tokio::net::TcpListener;

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

    async fn echo_listener() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn inbound_connections_reach_the_local_target() {
        let (transport, session) = mock_session().await;
        let echo_port = echo_listener().await;

        let handle = start_remote_forward(
            session,
            "0.0.0.0".into(),
            0,
            "127.0.0.1".into(),
            echo_port,
        )
        .await
        .unwrap();
        assert_ne!(handle.bound_port, 0);

        let mock = transport.last_session().unwrap();
        let (mut near, far) = tokio::io::duplex(4096);
        assert!(
            mock.push_incoming("0.0.0.0", handle.bound_port, Box::new(far))
                .await
        );

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(handle.stats().connection_count, 1);
    }

    #[tokio::test]
    async fn stop_cancels_the_registration() {
        let (transport, session) = mock_session().await;
        let handle = start_remote_forward(
            session,
            "0.0.0.0".into(),
            8080,
            "127.0.0.1".into(),
            80,
        )
        .await
        .unwrap();
        assert_eq!(handle.bound_port, 8080);

        handle.stop().await;
        let mock = transport.last_session().unwrap();
        assert!(!mock.has_route("0.0.0.0", 8080));
        assert_eq!(
            mock.cancelled.lock().clone(),
            vec![("0.0.0.0".to_string(), 8080)]
        );
        assert!(!handle.is_running());
    }
}
