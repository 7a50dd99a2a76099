//! Connection configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Target of a TCP/SSH connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Remote host address
    pub host: String,

    /// Remote port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// Private key authentication
    Key {
        /// Inline PEM key material (takes precedence over the path)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
        /// Path to a private key file
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key_path: Option<String>,
        /// Optional passphrase for encrypted keys
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key_path(path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            private_key: None,
            private_key_path: Some(path.into()),
            passphrase,
        }
    }

    pub fn key_inline(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            private_key: Some(pem.into()),
            private_key_path: None,
            passphrase,
        }
    }

    /// Check that the variant carries enough material to attempt auth.
    pub fn validate(&self) -> Result<()> {
        match self {
            AuthMethod::Password { password } => {
                if password.is_empty() {
                    return Err(Error::Configuration(
                        "Password authentication selected but no password provided".into(),
                    ));
                }
            }
            AuthMethod::Key {
                private_key,
                private_key_path,
                ..
            } => {
                if private_key.is_none() && private_key_path.is_none() {
                    return Err(Error::Configuration(
                        "Key authentication selected but neither key material nor key path provided"
                            .into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A single bastion hop in a jump chain
///
/// Chains are singly linked: the last node (with `next == None`) is the
/// bastion closest to the final target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyJump {
    /// Hostname of the jump host
    pub host: String,
    /// Port of the jump host (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username for authentication
    pub username: String,
    /// Authentication method for this hop
    pub auth: AuthMethod,
    /// Next hop, closer to the final target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<ProxyJump>>,
}

impl ProxyJump {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            next: None,
        }
    }

    /// Append a hop at the end of the chain (closest to the target)
    pub fn then(mut self, next: ProxyJump) -> Self {
        self.next = Some(Box::new(match self.next.take() {
            Some(tail) => tail.then(next),
            None => next,
        }));
        self
    }

    /// Number of hops in the chain
    pub fn depth(&self) -> usize {
        let mut n = 1;
        let mut cur = self;
        while let Some(next) = cur.next.as_deref() {
            n += 1;
            cur = next;
        }
        n
    }

    /// Iterate hops front to back
    pub fn hops(&self) -> impl Iterator<Item = &ProxyJump> {
        std::iter::successors(Some(self), |cur| cur.next.as_deref())
    }

    /// Human-readable chain description: `user@host:port -> user@host:port`
    pub fn description(&self) -> String {
        self.hops()
            .map(|hop| format!("{}@{}:{}", hop.username, hop.host, hop.port))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Validate the whole chain without any network I/O
    pub fn validate(&self) -> Result<()> {
        for (i, hop) in self.hops().enumerate() {
            if hop.host.is_empty() {
                return Err(Error::Configuration(format!("Jump hop {} has no host", i + 1)));
            }
            if hop.port == 0 {
                return Err(Error::Configuration(format!(
                    "Jump hop {} ({}) has no port",
                    i + 1,
                    hop.host
                )));
            }
            if hop.username.is_empty() {
                return Err(Error::Configuration(format!(
                    "Jump hop {} ({}) has no username",
                    i + 1,
                    hop.host
                )));
            }
            hop.auth.validate().map_err(|e| {
                Error::Configuration(format!("Jump hop {} ({}): {}", i + 1, hop.host, e))
            })?;
        }
        Ok(())
    }
}

/// Kind of underlying proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

/// A single underlying proxy used to reach the first hop (or the target
/// directly when no jump chain exists). Independent of [`ProxyJump`];
/// both may be combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Credentials as a pair, only when both parts are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.is_empty() {
            return Err(Error::Configuration("Proxy has no host".into()));
        }
        if self.port == 0 {
            return Err(Error::Configuration("Proxy has no port".into()));
        }
        Ok(())
    }
}

/// Reconnect policy for a supervised connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum consecutive attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub interval_ms: u64,
}

impl ReconnectPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_reconnect_interval_ms(),
        }
    }
}

/// Everything needed to establish and supervise one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Final target
    pub endpoint: Endpoint,

    /// Username on the target
    pub username: String,

    /// Authentication for the target
    pub auth: AuthMethod,

    /// Optional bastion chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<ProxyJump>,

    /// Optional underlying SOCKS5/HTTP proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Terminal type requested for the interactive channel
    #[serde(default = "default_term")]
    pub term: String,

    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,

    /// Environment variables requested for the shell
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in minutes; 0 disables the idle monitor
    #[serde(default)]
    pub idle_timeout_minutes: u64,

    /// Reconnect policy on unexpected close
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl ConnectOptions {
    pub fn new(endpoint: Endpoint, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            endpoint,
            username: username.into(),
            auth,
            proxy_jump: None,
            proxy: None,
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            env: Vec::new(),
            connect_timeout_secs: default_timeout(),
            idle_timeout_minutes: 0,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_minutes * 60))
        }
    }

    /// Validate credentials and any proxy/jump configuration. No I/O.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.host.is_empty() {
            return Err(Error::Configuration("Target has no host".into()));
        }
        if self.username.is_empty() {
            return Err(Error::Configuration("Target has no username".into()));
        }
        self.auth.validate()?;
        if let Some(jump) = &self.proxy_jump {
            jump.validate()?;
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_term() -> String {
    "xterm-256color".into()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

fn default_max_attempts() -> u32 {
    5
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}
