//! Transport abstraction
//!
//! The orchestration core never talks the SSH wire protocol directly; it
//! consumes this trait pair. The bundled [`SshTransport`] adapter implements
//! it over russh. Tests substitute their own implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use crate::config::{AuthMethod, Endpoint};
use crate::error::Result;

mod ssh;

pub use ssh::SshTransport;

#[cfg(test)]
pub(crate) mod mock;

/// Marker for byte streams the core moves between protocol layers.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// An owned, type-erased bidirectional byte stream.
pub type BoxedStream = Box<dyn RawStream>;

/// Parameters for the interactive shell channel
#[derive(Debug, Clone)]
pub struct ShellParams {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub env: Vec<(String, String)>,
}

/// Commands accepted by an open shell channel
#[derive(Debug)]
pub enum ShellCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Window change (cols, rows)
    Resize(u16, u16),
    /// Close the channel
    Close,
}

/// Events emitted by an open shell channel
#[derive(Debug)]
pub enum ShellEvent {
    /// Remote stdout bytes
    Data(Vec<u8>),
    /// Remote stderr bytes
    Stderr(Vec<u8>),
    /// Remote command exit status
    ExitStatus(u32),
    /// Channel closed; no further events follow
    Closed,
}

/// Handle to an interactive shell channel: a command sender in, an event
/// receiver out. Dropping the sender closes the channel.
pub struct ShellChannel {
    pub cmd_tx: mpsc::Sender<ShellCommand>,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// An inbound connection delivered by a remote-forward registration.
pub struct IncomingForward {
    /// Address the remote listener was bound to
    pub connected_host: String,
    /// Port the remote listener was bound to
    pub connected_port: u16,
    /// Peer that connected on the far end
    pub originator_host: String,
    pub originator_port: u16,
    stream: BoxedStream,
}

impl IncomingForward {
    pub fn new(
        connected_host: impl Into<String>,
        connected_port: u16,
        originator_host: impl Into<String>,
        originator_port: u16,
        stream: BoxedStream,
    ) -> Self {
        Self {
            connected_host: connected_host.into(),
            connected_port,
            originator_host: originator_host.into(),
            originator_port,
            stream,
        }
    }

    /// Accept the connection, yielding the channel as a stream.
    pub fn accept(self) -> BoxedStream {
        self.stream
    }
}

/// The excluded remote-shell protocol layer: performs the handshake and
/// authentication over a raw stream the core has already positioned.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn authenticate(
        &self,
        stream: BoxedStream,
        endpoint: &Endpoint,
        username: &str,
        auth: &AuthMethod,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>>;
}

/// An authenticated session on one host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the interactive shell channel.
    async fn open_shell(&self, params: ShellParams) -> Result<ShellChannel>;

    /// Run a one-shot command and collect its stdout.
    async fn exec(&self, command: &str) -> Result<Vec<u8>>;

    /// Open an egress channel from this session toward `dst_host:dst_port`.
    async fn forward_out(
        &self,
        origin_host: &str,
        origin_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<BoxedStream>;

    /// Register a listener on the far end. Inbound connections are delivered
    /// on `incoming_tx`. Returns the actual bound port (may differ when the
    /// requested port was 0).
    async fn forward_in(
        &self,
        bind_host: &str,
        bind_port: u16,
        incoming_tx: mpsc::Sender<IncomingForward>,
    ) -> Result<u16>;

    /// Cancel a remote-forward registration.
    async fn cancel_forward_in(&self, bind_host: &str, bind_port: u16) -> Result<()>;

    /// Subscribe to session close. Receives one notification when the
    /// underlying connection goes away, deliberate or not.
    fn subscribe_close(&self) -> broadcast::Receiver<()>;

    /// Whether the session is still usable.
    fn is_open(&self) -> bool;

    /// Close the session and release the underlying connection.
    async fn close(&self);
}
