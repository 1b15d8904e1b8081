//! Slices of the dashboard's root state.

pub mod connection;
pub mod notifications;
pub mod session;
pub mod ui;

pub use connection::{ConnectionAction, ConnectionStatus};
pub use notifications::{Level, Notification, NotificationsAction, NotificationsState};
pub use session::{SessionAction, SessionState, User};
pub use ui::{Selection, Theme, UiAction, UiState};
