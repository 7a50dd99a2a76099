//! Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed proxy/jump/forward configuration. Fails fast, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket connect or proxy handshake failure.
    #[error("Dial failed: {0}")]
    Dial(String),

    /// Credentials rejected by the transport.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed SOCKS5 / HTTP CONNECT response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connect timeout or idle-session policy trigger.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Listener bind or remote registration failure.
    #[error("Forward setup failed: {0}")]
    ForwardSetup(String),

    /// Channel open or channel I/O failure on an established session.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Key(err.to_string())
    }
}

// Keep errors serializable so host applications can ship results across
// an IPC boundary as plain strings.
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
