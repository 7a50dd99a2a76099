//! Connection supervision
//!
//! One supervisor owns every live connection: establishment through the
//! chain resolver and transport, the interactive channel pump, the idle
//! monitor, and bounded reconnection after unexpected closes. Constructed
//! once at startup; `shutdown` tears every connection down explicitly.

mod events;

pub use events::ConnectionEvent;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectOptions;
use crate::error::{Error, Result};
use crate::proxy::ChainResolver;
use crate::transport::{Session, ShellCommand, ShellEvent, ShellParams, Transport};

const EVENT_CAPACITY: usize = 1024;
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

/// Serializable snapshot of one supervised connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub status: ConnectionStatus,
    /// Resolved jump chain description, when one was used
    pub chain: Option<String>,
    /// When the current transport incarnation came up
    pub connected_at: DateTime<Utc>,
    pub idle_seconds: u64,
    pub reconnect_attempts: u32,
}

/// Live transport state of a connection. Replaced wholesale on reconnect.
#[derive(Clone)]
struct LiveConnection {
    session: Arc<dyn Session>,
    hops: Vec<Arc<dyn Session>>,
    shell_tx: mpsc::Sender<ShellCommand>,
    chain: Option<String>,
}

struct ConnectionEntry {
    id: String,
    options: ConnectOptions,
    status: Mutex<ConnectionStatus>,
    live: Mutex<Option<LiveConnection>>,
    connected_at: Mutex<DateTime<Utc>>,
    last_activity: Mutex<Instant>,
    /// Bumped whenever the live transport is replaced or torn down, so
    /// pumps from an earlier incarnation recognise themselves as stale.
    epoch: AtomicU64,
    reconnect_attempts: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionEntry {
    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Track a spawned task, dropping handles that already finished so
    /// long-lived connections with many reconnect cycles stay bounded.
    fn add_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    connections: Arc<DashMap<String, Arc<ConnectionEntry>>>,
    events: broadcast::Sender<ConnectionEvent>,
    monitor_interval: Duration,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_monitor_interval(transport, DEFAULT_MONITOR_INTERVAL)
    }

    /// Like [`new`](Self::new) with a custom idle-monitor tick interval.
    /// The interval is independent of any configured idle timeout.
    pub fn with_monitor_interval(transport: Arc<dyn Transport>, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            connections: Arc::new(DashMap::new()),
            events,
            monitor_interval: interval,
        }
    }

    /// Subscribe to lifecycle notifications for all connections.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Establish a supervised connection under `id`. An existing connection
    /// with the same id is torn down and replaced.
    pub async fn connect(&self, id: impl Into<String>, options: ConnectOptions) -> Result<()> {
        let id = id.into();
        options.validate()?;

        if self.remove_entry(&id).await.is_some() {
            warn!("Connection {} already existed, replacing it", id);
        }

        let entry = Arc::new(ConnectionEntry {
            id: id.clone(),
            options,
            status: Mutex::new(ConnectionStatus::Connecting),
            live: Mutex::new(None),
            connected_at: Mutex::new(Utc::now()),
            last_activity: Mutex::new(Instant::now()),
            epoch: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        self.connections.insert(id.clone(), entry.clone());

        match self.establish(&entry.options).await {
            Ok((live, shell_events)) => {
                let chain = live.chain.clone();
                *entry.live.lock() = Some(live);
                *entry.connected_at.lock() = Utc::now();
                entry.touch();
                entry.set_status(ConnectionStatus::Connected);

                if let Some(chain) = chain {
                    self.emit(ConnectionEvent::ProxyConnected {
                        id: id.clone(),
                        chain,
                    });
                }

                self.spawn_pump(entry.clone(), shell_events, 0);
                self.spawn_idle_monitor(entry);
                info!("Connection {} established", id);
                Ok(())
            }
            Err(e) => {
                error!("Connection {} failed: {}", id, e);
                entry.set_status(ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    /// Forward bytes to the interactive channel. A warning no-op when the
    /// connection exists but is not ready (connecting, reconnecting, or mid
    /// teardown), so channel races never crash callers. An id with no record
    /// at all is a caller error and returns `NotFound`.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        let entry = self.entry(id)?;
        let tx = entry.live.lock().as_ref().map(|l| l.shell_tx.clone());
        match tx {
            Some(tx) if entry.status() == ConnectionStatus::Connected => {
                entry.touch();
                if tx.send(ShellCommand::Data(data.to_vec())).await.is_err() {
                    warn!("Write to {} dropped: shell channel closed", id);
                }
                Ok(())
            }
            _ => {
                warn!("Write to {} ignored: not connected", id);
                Ok(())
            }
        }
    }

    /// Send a window-change to the interactive channel. No-op if not
    /// connected.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let entry = self.entry(id)?;
        let tx = entry.live.lock().as_ref().map(|l| l.shell_tx.clone());
        if let Some(tx) = tx {
            if entry.status() == ConnectionStatus::Connected {
                let _ = tx.send(ShellCommand::Resize(cols, rows)).await;
            }
        }
        Ok(())
    }

    /// Run a one-shot command on the connection's session.
    pub async fn exec(&self, id: &str, command: &str) -> Result<Vec<u8>> {
        let session = self.session(id)?;
        session.exec(command).await
    }

    /// The live session behind a connection, for port forwarding.
    pub fn session(&self, id: &str) -> Result<Arc<dyn Session>> {
        let entry = self.entry(id)?;
        let session = entry.live.lock().as_ref().map(|l| l.session.clone());
        session.ok_or(Error::Disconnected)
    }

    /// Deliberately close a connection and drop its record. Cancels any
    /// pending reconnect before touching sockets.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.remove_entry(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("No connection with id {}", id)))?;
        self.emit(ConnectionEvent::Closed { id: id.to_string() });
        info!("Connection {} disconnected", id);
        Ok(())
    }

    pub fn get_connection(&self, id: &str) -> Option<ConnectionView> {
        self.connections.get(id).map(|e| self.view(&e))
    }

    pub fn list_connections(&self) -> Vec<ConnectionView> {
        let mut views: Vec<_> = self.connections.iter().map(|e| self.view(&e)).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Tear down every connection. Call once on shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!("Shutdown of {} failed: {}", id, e);
            }
        }
    }

    fn view(&self, entry: &ConnectionEntry) -> ConnectionView {
        let chain = entry.live.lock().as_ref().and_then(|l| l.chain.clone());
        ConnectionView {
            id: entry.id.clone(),
            host: entry.options.endpoint.host.clone(),
            port: entry.options.endpoint.port,
            username: entry.options.username.clone(),
            status: entry.status(),
            chain,
            connected_at: *entry.connected_at.lock(),
            idle_seconds: entry.last_activity.lock().elapsed().as_secs(),
            reconnect_attempts: entry.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<ConnectionEntry>> {
        self.connections
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("No connection with id {}", id)))
    }

    fn emit(&self, event: ConnectionEvent) {
        // Send only fails when nobody subscribed
        let _ = self.events.send(event);
    }

    /// Resolve the path, authenticate, and open the interactive channel.
    /// Shared between initial connect and every reconnect attempt.
    async fn establish(
        &self,
        options: &ConnectOptions,
    ) -> Result<(LiveConnection, mpsc::Receiver<ShellEvent>)> {
        let resolver = ChainResolver::new(self.transport.clone(), options.connect_timeout());
        let resolved = resolver
            .resolve(
                options.proxy_jump.as_ref(),
                options.proxy.as_ref(),
                &options.endpoint.host,
                options.endpoint.port,
            )
            .await?;

        let session = self
            .transport
            .authenticate(
                resolved.stream,
                &options.endpoint,
                &options.username,
                &options.auth,
                options.connect_timeout(),
            )
            .await?;

        let shell = session
            .open_shell(ShellParams {
                term: options.term.clone(),
                cols: options.cols,
                rows: options.rows,
                env: options.env.clone(),
            })
            .await?;

        Ok((
            LiveConnection {
                session,
                hops: resolved.hop_sessions,
                shell_tx: shell.cmd_tx,
                chain: resolved.description,
            },
            shell.events,
        ))
    }

    /// Drive shell events into the broadcast stream. On an unexpected end
    /// of the channel, kick off reconnection.
    fn spawn_pump(
        &self,
        entry: Arc<ConnectionEntry>,
        mut shell_events: mpsc::Receiver<ShellEvent>,
        epoch: u64,
    ) {
        let sup = self.clone();
        let task_entry = entry.clone();
        let handle = tokio::spawn(async move {
            let entry = task_entry;
            while let Some(event) = shell_events.recv().await {
                match event {
                    ShellEvent::Data(bytes) | ShellEvent::Stderr(bytes) => {
                        entry.touch();
                        sup.emit(ConnectionEvent::Data {
                            id: entry.id.clone(),
                            bytes,
                        });
                    }
                    ShellEvent::ExitStatus(code) => {
                        sup.emit(ConnectionEvent::ExitStatus {
                            id: entry.id.clone(),
                            code,
                        });
                    }
                    ShellEvent::Closed => break,
                }
            }

            // A newer incarnation or a deliberate teardown owns the entry now
            if entry.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            if entry.status() != ConnectionStatus::Connected {
                return;
            }

            warn!("Connection {} closed unexpectedly", entry.id);
            sup.emit(ConnectionEvent::Closed {
                id: entry.id.clone(),
            });
            sup.teardown_live(&entry).await;
            sup.spawn_reconnect(entry);
        });
        entry.add_task(handle);
    }

    fn spawn_idle_monitor(&self, entry: Arc<ConnectionEntry>) {
        let Some(idle_timeout) = entry.options.idle_timeout() else {
            return;
        };

        let sup = self.clone();
        let handle = tokio::spawn({
            let entry = entry.clone();
            async move {
            let mut ticker = tokio::time::interval(sup.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if entry.status() != ConnectionStatus::Connected {
                    continue;
                }
                let idle_for = entry.last_activity.lock().elapsed();
                if idle_for < idle_timeout {
                    continue;
                }

                // Policy decision, not a transport failure: never retried
                warn!(
                    "Connection {} idle for {}s, closing",
                    entry.id,
                    idle_for.as_secs()
                );
                let timeout_err = Error::Timeout(format!(
                    "Connection idle for {} minutes, closed by idle timeout",
                    entry.options.idle_timeout_minutes
                ));
                sup.emit(ConnectionEvent::Error {
                    id: entry.id.clone(),
                    message: timeout_err.to_string(),
                });
                entry.set_status(ConnectionStatus::Disconnected);
                sup.teardown_live(&entry).await;
                sup.emit(ConnectionEvent::Closed {
                    id: entry.id.clone(),
                });
                return;
            }
        }});
        entry.add_task(handle);
    }

    fn spawn_reconnect(&self, entry: Arc<ConnectionEntry>) {
        let policy = entry.options.reconnect.clone();
        if policy.max_attempts == 0 {
            entry.set_status(ConnectionStatus::Disconnected);
            return;
        }

        entry.set_status(ConnectionStatus::Reconnecting);
        let sup = self.clone();
        let handle = tokio::spawn({
            let entry = entry.clone();
            async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                entry.reconnect_attempts.store(attempt, Ordering::SeqCst);
                sup.emit(ConnectionEvent::Reconnecting {
                    id: entry.id.clone(),
                    attempt,
                    max_attempts: policy.max_attempts,
                });
                tokio::time::sleep(policy.interval()).await;

                match sup.establish(&entry.options).await {
                    Ok((live, shell_events)) => {
                        let chain = live.chain.clone();
                        let epoch = entry.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                        *entry.live.lock() = Some(live);
                        *entry.connected_at.lock() = Utc::now();
                        entry.touch();
                        entry.reconnect_attempts.store(0, Ordering::SeqCst);
                        entry.set_status(ConnectionStatus::Connected);
                        info!(
                            "Connection {} reconnected on attempt {}",
                            entry.id, attempt
                        );
                        // The chain was re-resolved, so subscribers tracking
                        // it get the fresh description before the recovery
                        if let Some(chain) = chain {
                            sup.emit(ConnectionEvent::ProxyConnected {
                                id: entry.id.clone(),
                                chain,
                            });
                        }
                        sup.emit(ConnectionEvent::Reconnected {
                            id: entry.id.clone(),
                        });
                        sup.spawn_pump(entry.clone(), shell_events, epoch);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "Reconnect attempt {}/{} for {} failed: {}",
                            attempt, policy.max_attempts, entry.id, e
                        );
                        if attempt >= policy.max_attempts {
                            entry.set_status(ConnectionStatus::Disconnected);
                            sup.emit(ConnectionEvent::ReconnectFailed {
                                id: entry.id.clone(),
                                attempts: attempt,
                            });
                            return;
                        }
                    }
                }
            }
        }});
        entry.add_task(handle);
    }

    /// Remove the record and stop everything it owns. Reconnect and monitor
    /// tasks are cancelled before sockets are touched.
    async fn remove_entry(&self, id: &str) -> Option<Arc<ConnectionEntry>> {
        let (_, entry) = self.connections.remove(id)?;
        entry.set_status(ConnectionStatus::Disconnected);
        let handles: Vec<_> = entry.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.teardown_live(&entry).await;
        Some(entry)
    }

    /// Close channel, session, and hop sessions in that order.
    async fn teardown_live(&self, entry: &ConnectionEntry) {
        entry.epoch.fetch_add(1, Ordering::SeqCst);
        let live = entry.live.lock().take();
        if let Some(live) = live {
            let _ = live.shell_tx.send(ShellCommand::Close).await;
            live.session.close().await;
            for hop in live.hops.iter().rev() {
                hop.close().await;
            }
            debug!("Connection {} transport torn down", entry.id);
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, id: &str, by: Duration) {
        if let Some(entry) = self.connections.get(id) {
            *entry.last_activity.lock() = Instant::now() - by;
        }
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self, id: &str) -> usize {
        self.connections
            .get(id)
            .map(|e| e.tasks.lock().len())
            .unwrap_or(0)
    }
}
