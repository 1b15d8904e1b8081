//! Reconciling a client's speculative value with a server value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::SyncError;
use crate::time;

/// Field added to the result of [`Strategy::Manual`].
pub const CONFLICT_FIELD: &str = "_conflict";

/// How to pick between a client and a server value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    ClientWins,
    #[default]
    ServerWins,
    /// Newer `updatedAt` wins; ties and missing timestamps go to the server.
    LastWriteWins,
    /// Keep the server value and attach the client value for a human to
    /// merge.
    Manual,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ClientWins => "client-wins",
            Strategy::ServerWins => "server-wins",
            Strategy::LastWriteWins => "last-write-wins",
            Strategy::Manual => "manual",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = SyncError;

    /// Accepts kebab, snake or screaming case, e.g. `client-wins`,
    /// `CLIENT_WINS`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "client-wins" => Ok(Strategy::ClientWins),
            "server-wins" => Ok(Strategy::ServerWins),
            "last-write-wins" => Ok(Strategy::LastWriteWins),
            "manual" => Ok(Strategy::Manual),
            _ => Err(SyncError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Resolve `client` against `server`.
pub fn resolve(client: &Value, server: &Value, strategy: Strategy) -> Value {
    let resolved = match strategy {
        Strategy::ClientWins => client.clone(),
        Strategy::ServerWins => server.clone(),
        Strategy::LastWriteWins => match (time::updated_at(client), time::updated_at(server)) {
            (Some(c), Some(s)) if c > s => client.clone(),
            _ => server.clone(),
        },
        Strategy::Manual => annotate(client, server),
    };
    debug!(strategy = %strategy, "conflict resolved");
    resolved
}

fn annotate(client: &Value, server: &Value) -> Value {
    let mut conflict = Map::new();
    conflict.insert("client".to_string(), client.clone());

    match server {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert(CONFLICT_FIELD.to_string(), Value::Object(conflict));
            Value::Object(fields)
        }
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), other.clone());
            wrapped.insert(CONFLICT_FIELD.to_string(), Value::Object(conflict));
            Value::Object(wrapped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!("client-wins".parse::<Strategy>().unwrap(), Strategy::ClientWins);
        assert_eq!("CLIENT_WINS".parse::<Strategy>().unwrap(), Strategy::ClientWins);
        assert_eq!("last_write_wins".parse::<Strategy>().unwrap(), Strategy::LastWriteWins);
        assert_eq!(" Manual ".parse::<Strategy>().unwrap(), Strategy::Manual);
        assert!(matches!(
            "newest".parse::<Strategy>(),
            Err(SyncError::UnknownStrategy(name)) if name == "newest"
        ));
        assert_eq!(Strategy::default(), Strategy::ServerWins);
    }

    #[test]
    fn test_client_and_server_wins() {
        let client = json!({"id": 1, "title": "mine"});
        let server = json!({"id": 1, "title": "theirs"});
        assert_eq!(resolve(&client, &server, Strategy::ClientWins), client);
        assert_eq!(resolve(&client, &server, Strategy::ServerWins), server);
    }

    #[test]
    fn test_last_write_wins() {
        let older = json!({"title": "a", "updatedAt": "2024-01-01T00:00:00Z"});
        let newer = json!({"title": "b", "updated_at": 1_704_153_600_000i64});

        assert_eq!(resolve(&newer, &older, Strategy::LastWriteWins), newer);
        assert_eq!(resolve(&older, &newer, Strategy::LastWriteWins), newer);
    }

    #[test]
    fn test_last_write_wins_ties_and_missing_go_to_server() {
        let client = json!({"v": "c", "updatedAt": "2024-01-01T00:00:00Z"});
        let server = json!({"v": "s", "updatedAt": "2024-01-01T00:00:00Z"});
        assert_eq!(resolve(&client, &server, Strategy::LastWriteWins), server);

        let undated = json!({"v": "c"});
        assert_eq!(resolve(&undated, &server, Strategy::LastWriteWins), server);
        assert_eq!(resolve(&client, &undated, Strategy::LastWriteWins), undated);
    }

    #[test]
    fn test_manual_keeps_both_sides() {
        let client = json!({"title": "mine"});
        let server = json!({"title": "theirs"});
        let merged = resolve(&client, &server, Strategy::Manual);
        assert_eq!(merged["title"], "theirs");
        assert_eq!(merged[CONFLICT_FIELD]["client"], client);

        let scalar = resolve(&json!(1), &json!(2), Strategy::Manual);
        assert_eq!(scalar, json!({"value": 2, "_conflict": {"client": 1}}));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_value(Strategy::LastWriteWins).unwrap(), json!("last-write-wins"));
        assert_eq!(Strategy::Manual.to_string(), "manual");
    }
}
