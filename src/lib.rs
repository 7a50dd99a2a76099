//! FerroLink - SSH connection orchestration
//!
//! The pieces between a user's connect request and an authenticated,
//! supervised SSH session: bastion chain resolution, SOCKS5/HTTP CONNECT
//! proxy dialing, lifecycle supervision with bounded reconnect and idle
//! timeout, and local/remote/dynamic port forwarding. The SSH wire
//! protocol itself sits behind the [`transport`] seam, implemented over
//! russh.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod proxy;
pub mod supervisor;
pub mod transport;

pub use config::{
    AuthMethod, ConnectOptions, Endpoint, ProxyConfig, ProxyJump, ProxyKind, ReconnectPolicy,
};
pub use error::{Error, Result};
pub use forwarding::{
    ForwardKind, ForwardRule, ForwardRuleUpdate, ForwardStats, ForwardStatus, PortForwardManager,
};
pub use proxy::{ChainResolver, ResolvedChain};
pub use supervisor::{ConnectionEvent, ConnectionStatus, ConnectionSupervisor, ConnectionView};
pub use transport::{Session, SshTransport, Transport};
