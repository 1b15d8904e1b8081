use caseboard_sync::app::{AppAction, AppState};
use caseboard_sync::config::PersistConfig;
use caseboard_sync::persist::{KeyValueStorage, Persister, SqliteStorage};
use caseboard_sync::slices::{Theme, UiAction};
use caseboard_sync::Store;
use std::sync::Arc;
use tempfile::TempDir;

fn config(dir: &TempDir) -> PersistConfig {
    PersistConfig {
        path: Some(dir.path().join("caseboard.db")),
        debounce_ms: 20,
        ..PersistConfig::default()
    }
}

#[tokio::test]
async fn test_preferences_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let persister = Persister::open(&config(&dir)).await.unwrap();
        let store = Store::new(AppState::default());
        let handle = persister.attach(&store);

        store.dispatch(AppAction::Ui(UiAction::SetTheme(Theme::Dark))).unwrap();
        store.dispatch(AppAction::Ui(UiAction::ToggleSidebar)).unwrap();
        handle.shutdown().await;
    }

    let persister = Persister::open(&config(&dir)).await.unwrap();
    let store = Store::new(AppState::default());
    let restored = persister.load(&store).await.unwrap();

    assert_eq!(restored, 2);
    let state = store.get_state();
    assert_eq!(state.ui.theme, Theme::Dark);
    assert!(state.ui.sidebar_collapsed);
}

#[tokio::test]
async fn test_disabled_persistence_is_inert() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::open(dir.path().join("off.db")).await.unwrap();
    let persister = Persister::new(
        Arc::new(storage.clone()),
        PersistConfig {
            enabled: false,
            ..PersistConfig::default()
        },
    );

    let state = AppState::default();
    assert_eq!(persister.flush(&state).await, 0);
    assert!(storage.keys("/").await.unwrap().is_empty());
    assert_eq!(persister.load(&Store::new(AppState::default())).await.unwrap(), 0);
}
