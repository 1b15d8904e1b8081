//! Connection lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the realtime connection.
///
/// ```text
/// Disconnected --connect--> Connecting --open--> Connected
/// Connecting/Connected --close or error--> Reconnecting | Disconnected
/// Reconnecting --timer--> Connecting
/// any --disconnect--> Disconnected
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Reconnecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
