//! The dashboard's root state, composed from its slices.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::persist::Persistable;
use crate::realtime::RealtimeSync;
use crate::slice::{action_type, reduce_slice, Slice};
use crate::slices::{
    ConnectionAction, ConnectionStatus, NotificationsAction, NotificationsState, SessionAction,
    SessionState, UiAction, UiState,
};
use crate::store::{Action, Reducer, Store};

/// Root state. Each slice sits behind its own `Arc`, so an action touching
/// one slice leaves the others shared with the previous root.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub session: Arc<SessionState>,
    pub ui: Arc<UiState>,
    pub notifications: Arc<NotificationsState>,
    pub connection: Arc<ConnectionStatus>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            session: Arc::new(SessionState::initial()),
            ui: Arc::new(UiState::initial()),
            notifications: Arc::new(NotificationsState::initial()),
            connection: Arc::new(ConnectionStatus::initial()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum AppAction {
    Session(SessionAction),
    Ui(UiAction),
    Notifications(NotificationsAction),
    Connection(ConnectionAction),
    /// Restore persisted slices by name.
    Hydrate(BTreeMap<String, Value>),
    /// Back to initial state, keeping the live connection status.
    Reset,
}

impl Action for AppAction {
    fn action_type(&self) -> String {
        match self {
            AppAction::Session(a) => action_type::<SessionState>(a),
            AppAction::Ui(a) => action_type::<UiState>(a),
            AppAction::Notifications(a) => action_type::<NotificationsState>(a),
            AppAction::Connection(a) => action_type::<ConnectionStatus>(a),
            AppAction::Hydrate(_) => "app/hydrate".to_string(),
            AppAction::Reset => "app/reset".to_string(),
        }
    }
}

macro_rules! replace_slice {
    ($state:expr, $field:ident, $action:expr) => {{
        let next = reduce_slice(&$state.$field, $action);
        if Arc::ptr_eq(&next, &$state.$field) {
            $state.clone()
        } else {
            Arc::new(AppState {
                $field: next,
                ..(**$state).clone()
            })
        }
    }};
}

impl Reducer for AppState {
    type Action = AppAction;

    fn reduce(state: &Arc<Self>, action: &AppAction) -> Arc<Self> {
        match action {
            AppAction::Session(a) => replace_slice!(state, session, a),
            AppAction::Ui(a) => replace_slice!(state, ui, a),
            AppAction::Notifications(a) => replace_slice!(state, notifications, a),
            AppAction::Connection(a) => replace_slice!(state, connection, a),
            AppAction::Hydrate(slices) => hydrate(state, slices),
            AppAction::Reset => reset(state),
        }
    }
}

/// Slices already at their initial value keep their `Arc`, so resetting a
/// pristine root is a no-op.
fn reset(state: &Arc<AppState>) -> Arc<AppState> {
    fn initial_or_same<S: Slice + PartialEq>(current: &Arc<S>) -> Arc<S> {
        let initial = S::initial();
        if **current == initial {
            current.clone()
        } else {
            Arc::new(initial)
        }
    }

    let next = AppState {
        session: initial_or_same(&state.session),
        ui: initial_or_same(&state.ui),
        notifications: initial_or_same(&state.notifications),
        connection: state.connection.clone(),
    };
    if Arc::ptr_eq(&next.session, &state.session)
        && Arc::ptr_eq(&next.ui, &state.ui)
        && Arc::ptr_eq(&next.notifications, &state.notifications)
    {
        return state.clone();
    }
    Arc::new(next)
}

fn decode<S: Slice + DeserializeOwned>(slices: &BTreeMap<String, Value>) -> Option<S> {
    let value = slices.get(S::NAME)?;
    match serde_json::from_value(value.clone()) {
        Ok(slice) => Some(slice),
        Err(e) => {
            warn!(slice = S::NAME, error = %e, "ignoring malformed persisted slice");
            None
        }
    }
}

fn hydrate(state: &Arc<AppState>, slices: &BTreeMap<String, Value>) -> Arc<AppState> {
    let mut next = (**state).clone();
    let mut changed = false;

    if let Some(session) = decode::<SessionState>(slices) {
        // Tokens are never persisted; keep the one held in memory.
        next.session = Arc::new(SessionState {
            token: state.session.token.clone(),
            ..session
        });
        changed = true;
    }
    if let Some(ui) = decode::<UiState>(slices) {
        next.ui = Arc::new(ui);
        changed = true;
    }
    if let Some(notifications) = decode::<NotificationsState>(slices) {
        next.notifications = Arc::new(notifications);
        changed = true;
    }

    if changed {
        Arc::new(next)
    } else {
        state.clone()
    }
}

fn encode<S: Slice + Serialize>(slice: &S) -> Option<(&'static str, Value)> {
    match serde_json::to_value(slice) {
        Ok(value) => Some((S::NAME, value)),
        Err(e) => {
            warn!(slice = S::NAME, error = %e, "could not serialize slice");
            None
        }
    }
}

impl Persistable for AppState {
    fn persisted_slices(&self) -> Vec<(&'static str, Value)> {
        [
            encode(&*self.session),
            encode(&*self.ui),
            encode(&*self.notifications),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn hydrate(slices: BTreeMap<String, Value>) -> AppAction {
        AppAction::Hydrate(slices)
    }
}

/// Mirror the realtime connection state into the `connection` slice.
/// Runs until the returned handle is aborted.
pub fn bridge_connection_state(sync: &RealtimeSync, store: &Store<AppState>) -> JoinHandle<()> {
    let mut states = sync.watch_state();
    let sync = sync.clone();
    let store = store.clone();
    tokio::spawn(async move {
        loop {
            let state = *states.borrow_and_update();
            let action = AppAction::Connection(ConnectionAction::StatusChanged {
                state,
                reconnect_attempts: sync.reconnect_attempts(),
                at: Utc::now(),
            });
            if let Err(e) = store.dispatch(action) {
                warn!(error = %e, "could not mirror connection state");
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Masked;
    use crate::middleware::HistoryMiddleware;
    use crate::slices::{Level, Theme, User};
    use serde_json::json;

    #[test]
    fn test_untouched_slices_are_shared() {
        let store = Store::new(AppState::default());
        let before = store.get_state();

        store.dispatch(AppAction::Ui(UiAction::SetTheme(Theme::Dark))).unwrap();
        let after = store.get_state();

        assert!(!Arc::ptr_eq(&before.ui, &after.ui));
        assert!(Arc::ptr_eq(&before.session, &after.session));
        assert!(Arc::ptr_eq(&before.notifications, &after.notifications));
    }

    #[test]
    fn test_noop_keeps_root_identity() {
        let store = Store::new(AppState::default());
        let before = store.get_state();
        store.dispatch(AppAction::Ui(UiAction::SetTheme(Theme::System))).unwrap();
        assert!(Arc::ptr_eq(&before, &store.get_state()));
    }

    #[test]
    fn test_action_types_are_namespaced() {
        let (history, handle) = HistoryMiddleware::new(10);
        let store = Store::builder(AppState::default()).middleware(history).build();

        store.dispatch(AppAction::Ui(UiAction::ToggleSidebar)).unwrap();
        store
            .dispatch(AppAction::Notifications(NotificationsAction::push(Level::Info, "hi")))
            .unwrap();
        store.dispatch(AppAction::Reset).unwrap();

        assert_eq!(
            handle.action_types(),
            vec!["ui/toggleSidebar", "notifications/push", "app/reset"]
        );
    }

    #[test]
    fn test_login_token_is_masked_in_history() {
        let (history, handle) = HistoryMiddleware::new(10);
        let store = Store::builder(AppState::default()).middleware(history).build();

        store
            .dispatch(AppAction::Session(SessionAction::LoggedIn {
                user: User {
                    id: "u1".to_string(),
                    name: "Analyst".to_string(),
                    email: "analyst@example.com".to_string(),
                    roles: vec!["analyst".to_string()],
                },
                token: Masked::new("secret-token".to_string()),
                expires_at: None,
            }))
            .unwrap();

        let payload = handle.records()[0].payload.to_string();
        assert!(!payload.contains("secret-token"));
        assert!(store.get_state().session.is_authenticated(Utc::now()));
    }

    #[test]
    fn test_hydrate_and_persisted_slices() {
        let store = Store::new(AppState::default());
        let mut slices = BTreeMap::new();
        slices.insert("ui".to_string(), json!({"theme": "dark", "sidebar_collapsed": false, "selected": null}));
        slices.insert("session".to_string(), json!(42));
        store.dispatch(AppAction::Hydrate(slices)).unwrap();

        let state = store.get_state();
        assert_eq!(state.ui.theme, Theme::Dark);
        assert_eq!(*state.session, SessionState::default());

        let names: Vec<_> = state.persisted_slices().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["session", "ui", "notifications"]);
    }

    #[test]
    fn test_reset_keeps_connection() {
        let store = Store::new(AppState::default());
        store
            .dispatch(AppAction::Connection(ConnectionAction::StatusChanged {
                state: crate::realtime::ConnectionState::Connected,
                reconnect_attempts: 0,
                at: Utc::now(),
            }))
            .unwrap();
        store.dispatch(AppAction::Ui(UiAction::ToggleSidebar)).unwrap();
        store.dispatch(AppAction::Reset).unwrap();

        let state = store.get_state();
        assert!(!state.ui.sidebar_collapsed);
        assert_eq!(state.connection.state, crate::realtime::ConnectionState::Connected);
    }

    #[test]
    fn test_reset_of_initial_state_is_noop() {
        let store = Store::new(AppState::default());
        let notified = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = notified.clone();
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let before = store.get_state();

        store.dispatch(AppAction::Reset).unwrap();
        assert!(Arc::ptr_eq(&before, &store.get_state()));
        assert_eq!(notified.load(std::sync::atomic::Ordering::SeqCst), 0);

        store.dispatch(AppAction::Ui(UiAction::ToggleSidebar)).unwrap();
        let toggled = store.get_state();
        store.dispatch(AppAction::Reset).unwrap();
        let after = store.get_state();
        assert!(!Arc::ptr_eq(&toggled, &after));
        assert!(Arc::ptr_eq(&toggled.session, &after.session));
        assert_eq!(notified.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
