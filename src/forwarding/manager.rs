//! Port forward registry and lifecycle
//!
//! One manager per authenticated session. Rules are registered inactive,
//! started into a live listener/registration, stopped back to inactive
//! (rule preserved for restart), and deleted outright. Each id maps to at
//! most one active listener at a time.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};
use uuid::Uuid;

use super::dynamic::{start_dynamic_forward, DynamicForwardHandle};
use super::local::{start_local_forward, LocalForwardHandle};
use super::remote::{start_remote_forward, RemoteForwardHandle};
use super::ForwardStats;
use crate::error::{Error, Result};
use crate::transport::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardKind {
    /// Listen locally, tunnel out (-L)
    Local,
    /// Listen on the far end, dial locally (-R)
    Remote,
    /// Embedded SOCKS5 server (-D)
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Active,
    Inactive,
    Error,
}

/// One port forward rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub id: String,
    pub kind: ForwardKind,
    /// Local bind address (local/dynamic) or remote bind address (remote)
    pub bind_address: String,
    pub bind_port: u16,
    /// Destination host; unused for dynamic forwards
    pub target_host: String,
    pub target_port: u16,
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForwardRule {
    pub fn local(
        bind_address: impl Into<String>,
        bind_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ForwardKind::Local,
            bind_address: bind_address.into(),
            bind_port,
            target_host: target_host.into(),
            target_port,
            status: ForwardStatus::Inactive,
            error: None,
        }
    }

    pub fn remote(
        bind_address: impl Into<String>,
        bind_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ForwardKind::Remote,
            bind_address: bind_address.into(),
            bind_port,
            target_host: target_host.into(),
            target_port,
            status: ForwardStatus::Inactive,
            error: None,
        }
    }

    pub fn dynamic(bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ForwardKind::Dynamic,
            bind_address: bind_address.into(),
            bind_port,
            target_host: String::new(),
            target_port: 0,
            status: ForwardStatus::Inactive,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Partial edit applied to a stopped forward. Absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRuleUpdate {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
}

enum ActiveHandle {
    Local(LocalForwardHandle),
    Remote(RemoteForwardHandle),
    Dynamic(DynamicForwardHandle),
}

impl ActiveHandle {
    async fn stop(&self) {
        match self {
            Self::Local(h) => h.stop().await,
            Self::Remote(h) => h.stop().await,
            Self::Dynamic(h) => h.stop().await,
        }
    }

    fn is_running(&self) -> bool {
        match self {
            Self::Local(h) => h.is_running(),
            Self::Remote(h) => h.is_running(),
            Self::Dynamic(h) => h.is_running(),
        }
    }

    fn stats(&self) -> ForwardStats {
        match self {
            Self::Local(h) => h.stats(),
            Self::Remote(h) => h.stats(),
            Self::Dynamic(h) => h.stats(),
        }
    }
}

struct ForwardEntry {
    rule: parking_lot::Mutex<ForwardRule>,
    handle: AsyncMutex<Option<ActiveHandle>>,
}

/// Registry of port forwards over one session.
pub struct PortForwardManager {
    session: Arc<dyn Session>,
    forwards: DashMap<String, Arc<ForwardEntry>>,
}

impl PortForwardManager {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            forwards: DashMap::new(),
        }
    }

    /// Register a rule without starting it.
    pub fn add_forward(&self, mut rule: ForwardRule) -> ForwardRule {
        rule.status = ForwardStatus::Inactive;
        rule.error = None;
        let entry = Arc::new(ForwardEntry {
            rule: parking_lot::Mutex::new(rule.clone()),
            handle: AsyncMutex::new(None),
        });
        self.forwards.insert(rule.id.clone(), entry);
        info!("Registered {:?} forward {}", rule.kind, rule.id);
        rule
    }

    /// Start a registered forward. Already-active forwards are untouched.
    pub async fn start_forward(&self, id: &str) -> Result<ForwardRule> {
        let entry = self.entry(id)?;
        let mut handle = entry.handle.lock().await;
        if handle.as_ref().map(|h| h.is_running()).unwrap_or(false) {
            return Ok(entry.rule.lock().clone());
        }

        let rule = entry.rule.lock().clone();
        let started = match rule.kind {
            ForwardKind::Local => start_local_forward(
                self.session.clone(),
                &format!("{}:{}", rule.bind_address, rule.bind_port),
                rule.target_host.clone(),
                rule.target_port,
            )
            .await
            .map(|h| {
                let bound = h.bound_addr;
                (ActiveHandle::Local(h), bound.ip().to_string(), bound.port())
            }),
            ForwardKind::Dynamic => start_dynamic_forward(
                self.session.clone(),
                &format!("{}:{}", rule.bind_address, rule.bind_port),
            )
            .await
            .map(|h| {
                let bound = h.bound_addr;
                (
                    ActiveHandle::Dynamic(h),
                    bound.ip().to_string(),
                    bound.port(),
                )
            }),
            ForwardKind::Remote => start_remote_forward(
                self.session.clone(),
                rule.bind_address.clone(),
                rule.bind_port,
                rule.target_host.clone(),
                rule.target_port,
            )
            .await
            .map(|h| {
                let port = h.bound_port;
                (ActiveHandle::Remote(h), rule.bind_address.clone(), port)
            }),
        };

        match started {
            Ok((active, bound_address, bound_port)) => {
                *handle = Some(active);
                let mut rule = entry.rule.lock();
                rule.bind_address = bound_address;
                rule.bind_port = bound_port;
                rule.status = ForwardStatus::Active;
                rule.error = None;
                info!("Forward {} active on {}:{}", id, rule.bind_address, bound_port);
                Ok(rule.clone())
            }
            Err(e) => {
                error!("Forward {} failed to start: {}", id, e);
                let mut rule = entry.rule.lock();
                rule.status = ForwardStatus::Error;
                rule.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Register and immediately start.
    pub async fn create_forward(&self, rule: ForwardRule) -> Result<ForwardRule> {
        let rule = self.add_forward(rule);
        self.start_forward(&rule.id).await
    }

    /// Stop a forward, preserving the rule for restart.
    pub async fn stop_forward(&self, id: &str) -> Result<ForwardRule> {
        let entry = self.entry(id)?;
        let mut handle = entry.handle.lock().await;
        if let Some(active) = handle.take() {
            active.stop().await;
        }
        let mut rule = entry.rule.lock();
        rule.status = ForwardStatus::Inactive;
        rule.error = None;
        info!("Forward {} stopped", id);
        Ok(rule.clone())
    }

    /// Stop if needed and remove the rule entirely.
    pub async fn delete_forward(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let mut handle = entry.handle.lock().await;
        if let Some(active) = handle.take() {
            active.stop().await;
        }
        drop(handle);
        self.forwards.remove(id);
        info!("Forward {} deleted", id);
        Ok(())
    }

    /// Stop an active forward and start it again with the same rule.
    pub async fn restart_forward(&self, id: &str) -> Result<ForwardRule> {
        self.stop_forward(id).await?;
        self.start_forward(id).await
    }

    /// Edit a stopped forward. Active forwards must be stopped first so the
    /// live listener never disagrees with its rule.
    pub async fn update_forward(&self, id: &str, update: ForwardRuleUpdate) -> Result<ForwardRule> {
        let entry = self.entry(id)?;
        let handle = entry.handle.lock().await;
        if handle.as_ref().map(|h| h.is_running()).unwrap_or(false) {
            return Err(Error::ForwardSetup(format!(
                "Forward {} is active; stop it before editing",
                id
            )));
        }

        let mut rule = entry.rule.lock();
        if let Some(bind_address) = update.bind_address {
            rule.bind_address = bind_address;
        }
        if let Some(bind_port) = update.bind_port {
            rule.bind_port = bind_port;
        }
        if let Some(target_host) = update.target_host {
            rule.target_host = target_host;
        }
        if let Some(target_port) = update.target_port {
            rule.target_port = target_port;
        }
        rule.error = None;
        info!("Forward {} updated", id);
        Ok(rule.clone())
    }

    pub fn get_forward(&self, id: &str) -> Option<ForwardRule> {
        self.forwards.get(id).map(|e| e.rule.lock().clone())
    }

    pub fn list_forwards(&self) -> Vec<ForwardRule> {
        let mut rules: Vec<_> = self
            .forwards
            .iter()
            .map(|e| e.rule.lock().clone())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Traffic counters for an active forward.
    pub async fn forward_stats(&self, id: &str) -> Option<ForwardStats> {
        let entry = self.forwards.get(id)?.value().clone();
        let handle = entry.handle.lock().await;
        handle.as_ref().map(|h| h.stats())
    }

    /// Stop every forward but keep the rules registered.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.forwards.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_forward(&id).await {
                error!("Failed to stop forward {}: {}", id, e);
            }
        }
        info!("All forwards stopped");
    }

    pub fn count(&self) -> usize {
        self.forwards.len()
    }

    fn entry(&self, id: &str) -> Result<Arc<ForwardEntry>> {
        self.forwards
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("No forward with id {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, Endpoint};
    use crate::transport::mock::MockTransport;
    use crate::transport::Transport;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn manager() -> PortForwardManager {
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
        PortForwardManager::new(session)
    }

    #[tokio::test]
    async fn add_registers_inactive() {
        let mgr = manager().await;
        let rule = mgr.add_forward(ForwardRule::local("127.0.0.1", 0, "t", 80));
        assert_eq!(rule.status, ForwardStatus::Inactive);
        assert_eq!(mgr.get_forward(&rule.id).unwrap().status, ForwardStatus::Inactive);
    }

    #[tokio::test]
    async fn start_then_round_trip_through_the_tunnel() {
        let mgr = manager().await;
        let rule = mgr
            .create_forward(ForwardRule::local("127.0.0.1", 0, "web.internal", 8080))
            .await
            .unwrap();
        assert_eq!(rule.status, ForwardStatus::Active);
        assert_ne!(rule.bind_port, 0);

        let mut client = TcpStream::connect((rule.bind_address.as_str(), rule.bind_port))
            .await
            .unwrap();
        client.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        let stats = mgr.forward_stats(&rule.id).await.unwrap();
        assert_eq!(stats.connection_count, 1);
    }

    #[tokio::test]
    async fn stop_marks_inactive_and_preserves_the_rule() {
        let mgr = manager().await;
        let rule = mgr
            .create_forward(ForwardRule::local("127.0.0.1", 0, "t", 80))
            .await
            .unwrap();

        let stopped = mgr.stop_forward(&rule.id).await.unwrap();
        assert_eq!(stopped.status, ForwardStatus::Inactive);
        assert_eq!(
            mgr.get_forward(&rule.id).unwrap().status,
            ForwardStatus::Inactive
        );

        // Restart reuses the preserved rule
        let restarted = mgr.start_forward(&rule.id).await.unwrap();
        assert_eq!(restarted.status, ForwardStatus::Active);
    }

    #[tokio::test]
    async fn delete_removes_the_rule() {
        let mgr = manager().await;
        let rule = mgr
            .create_forward(ForwardRule::dynamic("127.0.0.1", 0))
            .await
            .unwrap();

        mgr.delete_forward(&rule.id).await.unwrap();
        assert!(mgr.get_forward(&rule.id).is_none());
        assert!(matches!(
            mgr.delete_forward(&rule.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn start_failure_sets_error_status() {
        let mgr = manager().await;
        let first = mgr
            .create_forward(ForwardRule::local("127.0.0.1", 0, "t", 80))
            .await
            .unwrap();

        // Same port again: bind conflict
        let second = mgr.add_forward(ForwardRule::local(
            "127.0.0.1",
            first.bind_port,
            "t",
            80,
        ));
        let err = mgr.start_forward(&second.id).await.unwrap_err();
        assert!(matches!(err, Error::ForwardSetup(_)));

        let rule = mgr.get_forward(&second.id).unwrap();
        assert_eq!(rule.status, ForwardStatus::Error);
        assert!(rule.error.unwrap().contains("in use"));
    }

    #[tokio::test]
    async fn remote_forward_reports_the_far_bound_port() {
        let mgr = manager().await;
        let rule = mgr
            .create_forward(ForwardRule::remote("0.0.0.0", 0, "127.0.0.1", 3000))
            .await
            .unwrap();
        assert_eq!(rule.status, ForwardStatus::Active);
        assert_ne!(rule.bind_port, 0);
    }

    #[tokio::test]
    async fn update_edits_stopped_rules_only() {
        let mgr = manager().await;
        let rule = mgr
            .create_forward(ForwardRule::local("127.0.0.1", 0, "old.internal", 80))
            .await
            .unwrap();

        let err = mgr
            .update_forward(
                &rule.id,
                ForwardRuleUpdate {
                    target_host: Some("new.internal".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ForwardSetup(_)));

        mgr.stop_forward(&rule.id).await.unwrap();
        let updated = mgr
            .update_forward(
                &rule.id,
                ForwardRuleUpdate {
                    target_host: Some("new.internal".into()),
                    target_port: Some(443),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.target_host, "new.internal");
        assert_eq!(updated.target_port, 443);
        assert_eq!(updated.bind_address, rule.bind_address);
    }

    #[tokio::test]
    async fn stop_all_keeps_rules_registered() {
        let mgr = manager().await;
        let a = mgr
            .create_forward(ForwardRule::local("127.0.0.1", 0, "t", 80))
            .await
            .unwrap();
        let b = mgr
            .create_forward(ForwardRule::dynamic("127.0.0.1", 0))
            .await
            .unwrap();

        mgr.stop_all().await;
        assert_eq!(mgr.count(), 2);
        assert_eq!(mgr.get_forward(&a.id).unwrap().status, ForwardStatus::Inactive);
        assert_eq!(mgr.get_forward(&b.id).unwrap().status, ForwardStatus::Inactive);
    }
}
