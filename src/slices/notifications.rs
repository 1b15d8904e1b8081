//! Toast notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slice::{Slice, SliceAction};

/// Oldest notifications are dropped beyond this many.
pub const MAX_NOTIFICATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub level: Level,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationsState {
    pub items: Vec<Notification>,
    pub next_id: u64,
}

impl Default for NotificationsState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum NotificationsAction {
    Push {
        level: Level,
        message: String,
        at: DateTime<Utc>,
    },
    Dismiss {
        id: u64,
    },
    Clear,
}

impl NotificationsAction {
    /// Push a notification stamped with the current time.
    pub fn push(level: Level, message: impl Into<String>) -> Self {
        NotificationsAction::Push {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl SliceAction for NotificationsAction {
    fn reducer_name(&self) -> &'static str {
        match self {
            NotificationsAction::Push { .. } => "push",
            NotificationsAction::Dismiss { .. } => "dismiss",
            NotificationsAction::Clear => "clear",
        }
    }
}

impl Slice for NotificationsState {
    const NAME: &'static str = "notifications";
    type Action = NotificationsAction;

    fn initial() -> Self {
        Self::default()
    }

    fn reduce(&self, action: &NotificationsAction) -> Option<Self> {
        match action {
            NotificationsAction::Push { level, message, at } => {
                let mut items = self.items.clone();
                items.push(Notification {
                    id: self.next_id,
                    level: *level,
                    message: message.clone(),
                    created_at: *at,
                });
                if items.len() > MAX_NOTIFICATIONS {
                    let excess = items.len() - MAX_NOTIFICATIONS;
                    items.drain(..excess);
                }
                Some(NotificationsState {
                    items,
                    next_id: self.next_id + 1,
                })
            }
            NotificationsAction::Dismiss { id } => {
                let position = self.items.iter().position(|n| n.id == *id)?;
                let mut items = self.items.clone();
                items.remove(position);
                Some(NotificationsState {
                    items,
                    next_id: self.next_id,
                })
            }
            NotificationsAction::Clear if self.items.is_empty() => None,
            NotificationsAction::Clear => Some(NotificationsState {
                items: Vec::new(),
                next_id: self.next_id,
            }),
        }
    }
}
