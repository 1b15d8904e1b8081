//! Mirror of the realtime connection for UI consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::realtime::ConnectionState;
use crate::slice::{Slice, SliceAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub changed_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            changed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ConnectionAction {
    StatusChanged {
        state: ConnectionState,
        reconnect_attempts: u32,
        at: DateTime<Utc>,
    },
}

impl SliceAction for ConnectionAction {
    fn reducer_name(&self) -> &'static str {
        match self {
            ConnectionAction::StatusChanged { .. } => "statusChanged",
        }
    }
}

impl Slice for ConnectionStatus {
    const NAME: &'static str = "connection";
    type Action = ConnectionAction;

    fn initial() -> Self {
        Self::default()
    }

    fn reduce(&self, action: &ConnectionAction) -> Option<Self> {
        match action {
            ConnectionAction::StatusChanged {
                state,
                reconnect_attempts,
                ..
            } if *state == self.state && *reconnect_attempts == self.reconnect_attempts => None,
            ConnectionAction::StatusChanged {
                state,
                reconnect_attempts,
                at,
            } => Some(ConnectionStatus {
                state: *state,
                reconnect_attempts: *reconnect_attempts,
                changed_at: Some(*at),
            }),
        }
    }
}
