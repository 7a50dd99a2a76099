//! Bastion chain resolution
//!
//! Walks a [`ProxyJump`] chain front to back: authenticate the current hop
//! over whatever stream reaches it, then open an egress channel through that
//! hop toward the next one (or the final target) and use the channel as the
//! stream for the next round. Hop sessions are retained in order; dropping
//! them tears the tunnel down.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::{Endpoint, ProxyConfig, ProxyJump};
use crate::error::{Error, Result};
use crate::transport::{BoxedStream, Session, Transport};

/// Result of resolving a connection path to the final target.
pub struct ResolvedChain {
    /// Stream positioned at the final target, ready for authentication
    pub stream: BoxedStream,
    /// Authenticated hop sessions, outermost first. Must be kept alive for
    /// as long as the target connection uses the chain.
    pub hop_sessions: Vec<Arc<dyn Session>>,
    /// Human-readable chain description when hops were involved
    pub description: Option<String>,
}

impl std::fmt::Debug for ResolvedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedChain")
            .field("hop_sessions", &self.hop_sessions.len())
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

pub struct ChainResolver {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl ChainResolver {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Resolve a stream to `target_host:target_port` through the configured
    /// jump chain and/or underlying proxy. Configuration is validated before
    /// any network I/O happens.
    pub async fn resolve(
        &self,
        jump: Option<&ProxyJump>,
        proxy: Option<&ProxyConfig>,
        target_host: &str,
        target_port: u16,
    ) -> Result<ResolvedChain> {
        if let Some(jump) = jump {
            jump.validate()?;
        }
        if let Some(proxy) = proxy {
            proxy.validate()?;
        }

        let Some(chain) = jump else {
            let stream = self.initial_stream(proxy, target_host, target_port).await?;
            return Ok(ResolvedChain {
                stream,
                hop_sessions: Vec::new(),
                description: None,
            });
        };

        let description = chain.description();
        info!(
            "Resolving {}-hop jump chain: {}",
            chain.depth(),
            description
        );

        let mut hop_sessions: Vec<Arc<dyn Session>> = Vec::with_capacity(chain.depth());
        let mut stream = self.initial_stream(proxy, &chain.host, chain.port).await?;

        let mut hops = chain.hops().peekable();
        while let Some(hop) = hops.next() {
            let endpoint = Endpoint::new(hop.host.clone(), hop.port);
            debug!("Authenticating jump hop {}@{}", hop.username, endpoint);

            let session = self
                .transport
                .authenticate(stream, &endpoint, &hop.username, &hop.auth, self.timeout)
                .await?;

            let (next_host, next_port) = match hops.peek() {
                Some(next) => (next.host.as_str(), next.port),
                None => (target_host, target_port),
            };

            stream = session
                .forward_out("127.0.0.1", 0, next_host, next_port)
                .await
                .map_err(|e| {
                    Error::Dial(format!(
                        "Failed to open tunnel from {} to {}:{}: {}",
                        hop.host, next_host, next_port, e
                    ))
                })?;

            hop_sessions.push(session);
        }

        Ok(ResolvedChain {
            stream,
            hop_sessions,
            description: Some(description),
        })
    }

    async fn initial_stream(
        &self,
        proxy: Option<&ProxyConfig>,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream> {
        if let Some(proxy) = proxy.filter(|p| p.enabled) {
            return super::dial(proxy, host, port, self.timeout).await;
        }

        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("Connection to {} timed out", addr)))?
            .map_err(|e| Error::Dial(format!("Failed to connect to {}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        Ok(Box::new(stream))
    }
}
