//! russh-backed transport adapter
//!
//! One task owns each `Handle`; everything else talks to it through a
//! `HandleController` over an mpsc command channel. This avoids lock
//! contention on the handle and protocol violations from concurrent access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    BoxedStream, IncomingForward, Session, ShellChannel, ShellCommand, ShellEvent, ShellParams,
    Transport,
};
use crate::config::{AuthMethod, Endpoint};
use crate::error::{Error, Result};

/// Routing table for remote-forward registrations: bound (host, port) to
/// the sender inbound connections are delivered on.
type ForwardRoutes = Arc<DashMap<(String, u16), mpsc::Sender<IncomingForward>>>;

/// Expand ~ to the home directory so key paths like ~/.ssh/id_ed25519 work
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Load the private key named by a key-auth method, inline PEM taking
/// precedence over a path.
fn load_private_key(
    private_key: Option<&str>,
    private_key_path: Option<&str>,
    passphrase: Option<&str>,
) -> Result<russh::keys::PrivateKey> {
    match (private_key, private_key_path) {
        (Some(pem), _) => {
            russh::keys::decode_secret_key(pem, passphrase).map_err(|e| Error::Key(e.to_string()))
        }
        (None, Some(path)) => {
            let expanded = expand_tilde(path);
            russh::keys::load_secret_key(&expanded, passphrase)
                .map_err(|e| Error::Key(e.to_string()))
        }
        (None, None) => Err(Error::Configuration(
            "Key authentication selected but neither key material nor key path provided".into(),
        )),
    }
}

/// russh callback handler
///
/// Host key policy belongs to the embedding application; the adapter logs
/// and accepts. Forwarded-tcpip channels are routed to whichever remote
/// forward registered the bound address.
struct ClientHandler {
    host: String,
    port: u16,
    routes: ForwardRoutes,
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!("Accepting server key for {}:{}", self.host, self.port);
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let key = (connected_address.to_string(), connected_port as u16);
        let incoming = IncomingForward::new(
            connected_address,
            connected_port as u16,
            originator_address,
            originator_port as u16,
            Box::new(channel.into_stream()) as BoxedStream,
        );

        match self.routes.get(&key) {
            Some(tx) => {
                if tx.try_send(incoming).is_err() {
                    warn!(
                        "Dropping forwarded connection for {}:{}: receiver full or gone",
                        key.0, key.1
                    );
                }
            }
            None => {
                warn!(
                    "No remote forward registered for {}:{}, dropping channel",
                    key.0, key.1
                );
            }
        }
        Ok(())
    }
}

/// Commands sent to the Handle Owner Task
enum HandleCommand {
    OpenSession {
        reply_tx: oneshot::Sender<std::result::Result<Channel<Msg>, russh::Error>>,
    },
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<std::result::Result<Channel<Msg>, russh::Error>>,
    },
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<std::result::Result<u32, russh::Error>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<std::result::Result<(), russh::Error>>,
    },
    Disconnect,
}

/// Cloneable controller for the Handle Owner Task
#[derive(Clone)]
struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    async fn open_session_channel(&self) -> Result<Channel<Msg>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSession { reply_tx })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Returns the actual bound port (may differ if requested port was 0)
    async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::ForwardSetup(e.to_string()))
    }

    async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::ForwardSetup(e.to_string()))
    }

    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, transferring ownership of the Handle.
fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle; // sole owner from here on

        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = *bound_port;
                            if reply_tx.send(result).is_err() {
                                // Caller disappeared after the forward was
                                // established; cancel to avoid a ghost forward
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded, \
                                     cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving cancel_tcpip_forward result");
                    }
                }

                HandleCommand::Disconnect => {
                    debug!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        // Cleanup: notify subscribers, drain queued commands, close SSH
        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Return Disconnected to every caller still waiting in the queue
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

/// Transport implementation over russh
#[derive(Default)]
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn authenticate(
        &self,
        stream: BoxedStream,
        endpoint: &Endpoint,
        username: &str,
        auth: &AuthMethod,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>> {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let routes: ForwardRoutes = Arc::new(DashMap::new());
        let handler = ClientHandler {
            host: endpoint.host.clone(),
            port: endpoint.port,
            routes: routes.clone(),
        };

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect_stream(Arc::new(ssh_config), stream, handler),
        )
        .await
        .map_err(|_| Error::Timeout(format!("SSH handshake with {} timed out", endpoint)))?
        .map_err(|e| Error::Dial(format!("SSH handshake with {} failed: {}", endpoint, e)))?;

        debug!("SSH handshake with {} completed", endpoint);

        let authenticated = match auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| Error::Authentication(e.to_string()))?,
            AuthMethod::Key {
                private_key,
                private_key_path,
                passphrase,
            } => {
                let key = load_private_key(
                    private_key.as_deref(),
                    private_key_path.as_deref(),
                    passphrase.as_deref(),
                )?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(username, key_with_hash)
                    .await
                    .map_err(|e| Error::Authentication(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(Error::Authentication(format!(
                "Authentication to {} rejected by server",
                endpoint
            )));
        }

        info!("Authenticated to {}@{}", username, endpoint);

        let controller = spawn_handle_owner_task(handle, endpoint.to_string());
        Ok(Arc::new(SshSession { controller, routes }))
    }
}

/// An authenticated russh session
struct SshSession {
    controller: HandleController,
    routes: ForwardRoutes,
}

#[async_trait]
impl Session for SshSession {
    async fn open_shell(&self, params: ShellParams) -> Result<ShellChannel> {
        let mut channel = self.controller.open_session_channel().await?;

        channel
            .request_pty(false, &params.term, params.cols, params.rows, 0, 0, &[])
            .await
            .map_err(|e| Error::Channel(format!("PTY request failed: {}", e)))?;

        for (name, value) in &params.env {
            if let Err(e) = channel.set_env(false, name.as_str(), value.as_str()).await {
                warn!("Failed to set env {}: {}", name, e);
            }
        }

        channel
            .request_shell(false)
            .await
            .map_err(|e| Error::Channel(format!("Shell request failed: {}", e)))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(1024);
        let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(1024);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(ShellCommand::Data(data)) => {
                                if let Err(e) = channel.data(&data[..]).await {
                                    debug!("Shell channel write error: {}", e);
                                    break;
                                }
                            }
                            Some(ShellCommand::Resize(cols, rows)) => {
                                if let Err(e) = channel
                                    .window_change(cols as u32, rows as u32, 0, 0)
                                    .await
                                {
                                    warn!("Window change failed: {}", e);
                                }
                            }
                            Some(ShellCommand::Close) | None => {
                                let _ = channel.eof().await;
                                break;
                            }
                        }
                    }

                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                if event_tx.send(ShellEvent::Data(data.to_vec())).await.is_err() {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                                if event_tx.send(ShellEvent::Stderr(data.to_vec())).await.is_err() {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                let _ = event_tx.send(ShellEvent::ExitStatus(exit_status)).await;
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                                debug!("Shell channel closed");
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
            }

            let _ = event_tx.send(ShellEvent::Closed).await;
        });

        Ok(ShellChannel {
            cmd_tx,
            events: event_rx,
        })
    }

    async fn exec(&self, command: &str) -> Result<Vec<u8>> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Channel(format!("Exec request failed: {}", e)))?;

        let mut output = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(output)
    }

    async fn forward_out(
        &self,
        origin_host: &str,
        origin_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<BoxedStream> {
        let channel = self
            .controller
            .open_direct_tcpip(dst_host, dst_port as u32, origin_host, origin_port as u32)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn forward_in(
        &self,
        bind_host: &str,
        bind_port: u16,
        incoming_tx: mpsc::Sender<IncomingForward>,
    ) -> Result<u16> {
        let bound = self
            .controller
            .tcpip_forward(bind_host, bind_port as u32)
            .await?;
        self.routes
            .insert((bind_host.to_string(), bound as u16), incoming_tx);
        Ok(bound as u16)
    }

    async fn cancel_forward_in(&self, bind_host: &str, bind_port: u16) -> Result<()> {
        self.routes.remove(&(bind_host.to_string(), bind_port));
        self.controller
            .cancel_tcpip_forward(bind_host, bind_port as u32)
            .await
    }

    fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    fn is_open(&self) -> bool {
        self.controller.is_connected()
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tilde_expansion_only_touches_leading_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_tilde("~/.ssh/id_ed25519"),
            home.join(".ssh/id_ed25519").to_string_lossy()
        );
        assert_eq!(expand_tilde("/etc/ssh/key"), "/etc/ssh/key");
        assert_eq!(expand_tilde("relative/~path"), "relative/~path");
    }

    #[test]
    fn key_auth_without_material_is_a_configuration_error() {
        let err = load_private_key(None, None, None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn garbage_key_file_is_a_key_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a private key").unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let err = load_private_key(None, Some(&path), None).unwrap_err();
        assert!(matches!(err, Error::Key(_)));
    }

    #[test]
    fn inline_pem_takes_precedence_over_path() {
        // Invalid inline material must fail as a key error even when a
        // (nonexistent) path is also supplied
        let err = load_private_key(Some("garbage"), Some("/nonexistent"), None).unwrap_err();
        assert!(matches!(err, Error::Key(_)));
    }
}
