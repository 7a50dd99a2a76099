//! In-crate mock transport for tests
//!
//! Sessions record what the core asked for and let tests inject shell
//! output, incoming forwarded connections, and failures. `forward_out`
//! returns one side of a duplex pipe with an echo task on the far side,
//! which is enough for round-trip forwarding tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use super::{
    BoxedStream, IncomingForward, Session, ShellChannel, ShellCommand, ShellEvent, ShellParams,
    Transport,
};
use crate::config::{AuthMethod, Endpoint};
use crate::error::{Error, Result};

pub(crate) struct MockTransport {
    attempts: AtomicUsize,
    /// Authentication attempts numbered >= this value fail with a dial error
    fail_from_attempt: Option<usize>,
    auth_log: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            fail_from_attempt: None,
            auth_log: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Succeed for attempts 1..n, fail from attempt n onward.
    pub fn failing_from(n: usize) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            fail_from_attempt: Some(n),
            auth_log: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn auth_log(&self) -> Vec<String> {
        self.auth_log.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn authenticate(
        &self,
        _stream: BoxedStream,
        endpoint: &Endpoint,
        username: &str,
        _auth: &AuthMethod,
        _timeout: Duration,
    ) -> Result<Arc<dyn Session>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.auth_log
            .lock()
            .push(format!("{}@{}", username, endpoint));

        if let Some(n) = self.fail_from_attempt {
            if attempt >= n {
                return Err(Error::Dial(format!(
                    "simulated connect failure (attempt {})",
                    attempt
                )));
            }
        }

        let session = MockSession::new();
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

pub(crate) struct MockSession {
    pub written: Arc<Mutex<Vec<u8>>>,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    pub forward_out_log: Mutex<Vec<(String, u16)>>,
    pub cancelled: Mutex<Vec<(String, u16)>>,
    shell_event_tx: Mutex<Option<mpsc::Sender<ShellEvent>>>,
    forward_routes: Mutex<HashMap<(String, u16), mpsc::Sender<IncomingForward>>>,
    exec_output: Mutex<Vec<u8>>,
    fail_forward_out: AtomicBool,
    closed: AtomicBool,
    close_tx: broadcast::Sender<()>,
}

impl MockSession {
    fn new() -> Arc<Self> {
        let (close_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            written: Arc::new(Mutex::new(Vec::new())),
            resizes: Arc::new(Mutex::new(Vec::new())),
            forward_out_log: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            shell_event_tx: Mutex::new(None),
            forward_routes: Mutex::new(HashMap::new()),
            exec_output: Mutex::new(Vec::new()),
            fail_forward_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    /// Make every subsequent forward_out fail with a channel error.
    pub fn refuse_forward_out(&self) {
        self.fail_forward_out.store(true, Ordering::SeqCst);
    }

    pub fn set_exec_output(&self, bytes: &[u8]) {
        *self.exec_output.lock() = bytes.to_vec();
    }

    /// Inject remote stdout bytes into the open shell.
    pub async fn inject_output(&self, bytes: &[u8]) {
        let tx = self.shell_event_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ShellEvent::Data(bytes.to_vec())).await;
        }
    }

    /// Simulate an unexpected close of the shell channel.
    pub async fn drop_shell(&self) {
        let tx = self.shell_event_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(ShellEvent::Closed).await;
        }
    }

    /// Deliver an inbound connection to a remote-forward registration.
    pub async fn push_incoming(&self, host: &str, port: u16, stream: BoxedStream) -> bool {
        let tx = self
            .forward_routes
            .lock()
            .get(&(host.to_string(), port))
            .cloned();
        match tx {
            Some(tx) => tx
                .send(IncomingForward::new(host, port, "203.0.113.9", 49152, stream))
                .await
                .is_ok(),
            None => false,
        }
    }

    pub fn has_route(&self, host: &str, port: u16) -> bool {
        self.forward_routes
            .lock()
            .contains_key(&(host.to_string(), port))
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open_shell(&self, _params: ShellParams) -> Result<ShellChannel> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(64);

        *self.shell_event_tx.lock() = Some(event_tx);

        let written = self.written.clone();
        let resizes = self.resizes.clone();

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ShellCommand::Data(data) => written.lock().extend_from_slice(&data),
                    ShellCommand::Resize(cols, rows) => resizes.lock().push((cols, rows)),
                    ShellCommand::Close => break,
                }
            }
        });

        Ok(ShellChannel {
            cmd_tx,
            events: event_rx,
        })
    }

    async fn exec(&self, _command: &str) -> Result<Vec<u8>> {
        Ok(self.exec_output.lock().clone())
    }

    async fn forward_out(
        &self,
        _origin_host: &str,
        _origin_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<BoxedStream> {
        if self.fail_forward_out.load(Ordering::SeqCst) {
            return Err(Error::Channel(format!(
                "simulated channel refusal to {}:{}",
                dst_host, dst_port
            )));
        }

        self.forward_out_log
            .lock()
            .push((dst_host.to_string(), dst_port));

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if far.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(near))
    }

    async fn forward_in(
        &self,
        bind_host: &str,
        bind_port: u16,
        incoming_tx: mpsc::Sender<IncomingForward>,
    ) -> Result<u16> {
        // Port 0 gets a deterministic fake allocation
        let bound = if bind_port == 0 { 34567 } else { bind_port };
        self.forward_routes
            .lock()
            .insert((bind_host.to_string(), bound), incoming_tx);
        Ok(bound)
    }

    async fn cancel_forward_in(&self, bind_host: &str, bind_port: u16) -> Result<()> {
        self.forward_routes
            .lock()
            .remove(&(bind_host.to_string(), bind_port));
        self.cancelled
            .lock()
            .push((bind_host.to_string(), bind_port));
        Ok(())
    }

    fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(());
    }
}
