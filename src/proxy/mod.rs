//! Proxy dialers and bastion chain resolution

pub mod chain;
pub mod http;
pub mod socks5;

pub use chain::{ChainResolver, ResolvedChain};

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::{Error, Result};
use crate::transport::BoxedStream;

/// Open a TCP connection to the proxy and run the matching handshake,
/// returning a stream transport-ready to `target_host:target_port`.
pub async fn dial(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    timeout: Duration,
) -> Result<BoxedStream> {
    proxy.validate()?;

    let addr = format!("{}:{}", proxy.host, proxy.port);
    info!(
        "Dialing {:?} proxy at {} toward {}:{}",
        proxy.kind, addr, target_host, target_port
    );

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Timeout(format!("Connection to proxy {} timed out", addr)))?
        .map_err(|e| Error::Dial(format!("Failed to connect to proxy {}: {}", addr, e)))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    match proxy.kind {
        ProxyKind::Socks5 => {
            socks5::client_handshake(&mut stream, proxy.credentials(), target_host, target_port)
                .await?;
            Ok(Box::new(stream))
        }
        ProxyKind::Http => {
            let leftover =
                http::client_handshake(&mut stream, proxy.credentials(), target_host, target_port)
                    .await?;
            if leftover.is_empty() {
                Ok(Box::new(stream))
            } else {
                debug!(
                    "Replaying {} bytes received past the CONNECT header",
                    leftover.len()
                );
                Ok(Box::new(http::ReplayStream::new(leftover, stream)))
            }
        }
    }
}
