//! Signed-in user and the opaque access token.
//!
//! The token is never persisted and never printed; see [`Masked`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mask::Masked;
use crate::slice::{Slice, SliceAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub user: Option<User>,
    #[serde(skip)]
    pub token: Option<Masked<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// True when a token is held and has not expired at `now`.
    pub fn is_authenticated(&self, now: DateTime<Utc>) -> bool {
        self.token.is_some() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionAction {
    LoggedIn {
        user: User,
        token: Masked<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    TokenRefreshed {
        token: Masked<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    LoggedOut,
}

impl SliceAction for SessionAction {
    fn reducer_name(&self) -> &'static str {
        match self {
            SessionAction::LoggedIn { .. } => "loggedIn",
            SessionAction::TokenRefreshed { .. } => "tokenRefreshed",
            SessionAction::LoggedOut => "loggedOut",
        }
    }
}

impl Slice for SessionState {
    const NAME: &'static str = "session";
    type Action = SessionAction;

    fn initial() -> Self {
        Self::default()
    }

    fn reduce(&self, action: &SessionAction) -> Option<Self> {
        match action {
            SessionAction::LoggedIn {
                user,
                token,
                expires_at,
            } => Some(SessionState {
                user: Some(user.clone()),
                token: Some(token.clone()),
                expires_at: *expires_at,
            }),
            SessionAction::TokenRefreshed { .. } if self.user.is_none() => None,
            SessionAction::TokenRefreshed { token, expires_at } => Some(SessionState {
                token: Some(token.clone()),
                expires_at: *expires_at,
                ..self.clone()
            }),
            SessionAction::LoggedOut if self == &SessionState::default() => None,
            SessionAction::LoggedOut => Some(SessionState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn analyst() -> User {
        User {
            id: "u-1".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            roles: vec!["analyst".to_string()],
        }
    }

    fn logged_in(expires_at: Option<DateTime<Utc>>) -> SessionState {
        SessionState::initial()
            .reduce(&SessionAction::LoggedIn {
                user: analyst(),
                token: Masked::new("tok-1".to_string()),
                expires_at,
            })
            .unwrap()
    }

    #[test]
    fn test_login_and_logout() {
        let state = logged_in(None);
        assert!(state.is_authenticated(Utc::now()));

        let out = state.reduce(&SessionAction::LoggedOut).unwrap();
        assert_eq!(out, SessionState::default());
        assert!(out.reduce(&SessionAction::LoggedOut).is_none());
    }

    #[test]
    fn test_expired_token_is_not_authenticated() {
        let now = Utc::now();
        let state = logged_in(Some(now - Duration::minutes(1)));
        assert!(!state.is_authenticated(now));
    }

    #[test]
    fn test_refresh_requires_user() {
        let refresh = SessionAction::TokenRefreshed {
            token: Masked::new("tok-2".to_string()),
            expires_at: None,
        };
        assert!(SessionState::initial().reduce(&refresh).is_none());

        let refreshed = logged_in(None).reduce(&refresh).unwrap();
        assert_eq!(refreshed.token.unwrap().expose(), "tok-2");
    }

    #[test]
    fn test_token_never_serialized() {
        let json = serde_json::to_value(logged_in(None)).unwrap();
        assert!(json.get("token").is_none());

        let action = serde_json::to_value(SessionAction::LoggedIn {
            user: analyst(),
            token: Masked::new("tok-1".to_string()),
            expires_at: None,
        })
        .unwrap();
        assert_eq!(action["type"], "loggedIn");
        assert_eq!(action["payload"]["token"], "***");
    }
}
