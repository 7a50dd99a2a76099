//! Connection lifecycle notifications
//!
//! Broadcast to every subscriber; delivery transport is the caller's
//! concern. Slow subscribers may observe lag, never block the core.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    /// Remote output bytes (stdout or stderr)
    Data { id: String, bytes: Vec<u8> },

    /// A non-fatal error surfaced on the connection
    Error { id: String, message: String },

    /// The connection or its interactive channel closed
    Closed { id: String },

    /// The remote shell reported an exit status
    ExitStatus { id: String, code: u32 },

    /// A jump chain was resolved end to end
    ProxyConnected { id: String, chain: String },

    /// A reconnect attempt is about to run
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        id: String,
        attempt: u32,
        max_attempts: u32,
    },

    /// Reconnect succeeded; the connection is usable again
    Reconnected { id: String },

    /// All reconnect attempts exhausted; the connection is terminal
    ReconnectFailed { id: String, attempts: u32 },
}

impl ConnectionEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Data { id, .. }
            | Self::Error { id, .. }
            | Self::Closed { id }
            | Self::ExitStatus { id, .. }
            | Self::ProxyConnected { id, .. }
            | Self::Reconnecting { id, .. }
            | Self::Reconnected { id }
            | Self::ReconnectFailed { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_camel_case_tags() {
        let ev = ConnectionEvent::Reconnecting {
            id: "c1".into(),
            attempt: 2,
            max_attempts: 5,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "reconnecting");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["maxAttempts"], 5);
    }

    #[test]
    fn event_id_accessor() {
        let ev = ConnectionEvent::Closed { id: "c9".into() };
        assert_eq!(ev.id(), "c9");
    }
}
