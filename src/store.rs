//! State persistence.
//!
//! [`JsonFileStore`] keeps the relay state as four JSON documents in a data
//! directory:
//!
//! | file                  | content                                   |
//! |-----------------------|-------------------------------------------|
//! | `user_feeds.json`     | subscriber -> list of source URLs         |
//! | `posted_entries.json` | subscriber -> entry ID -> delivery time   |
//! | `channel_config.json` | `{"channel_id": ...}`                     |
//! | `user_settings.json`  | subscriber -> `{"update_interval": n}`    |
//!
//! A save renders every document before touching the disk, writes each to a
//! temporary sibling and then renames them into place, so a failed save
//! leaves the previous documents readable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::ledger::DeliveryLedger;
use crate::state::{RelayState, SubscriberSettings};
use crate::{RelayError, Result};

/// Subscriber list document.
pub const FEEDS_FILE: &str = "user_feeds.json";
/// Delivery ledger document.
pub const POSTED_ENTRIES_FILE: &str = "posted_entries.json";
/// Channel binding document.
pub const CHANNEL_CONFIG_FILE: &str = "channel_config.json";
/// Subscriber settings document.
pub const SETTINGS_FILE: &str = "user_settings.json";

/// Load/replace store for the relay state.
pub trait StateStore: Send + Sync {
    /// Load the full state. Missing data loads as empty.
    fn load(&self) -> Result<RelayState>;

    /// Replace the stored state with `state`.
    fn save(&self, state: &RelayState) -> Result<()>;
}

/// JSON documents in a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_document<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            debug!("{} does not exist, starting empty", path.display());
            return Ok(T::default());
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| RelayError::Persistence(format!("{}: {e}", path.display())))
    }
}

/// Channel ID as stored by either a string or an integer.
fn channel_from_document(doc: &Value) -> Option<String> {
    match doc.get("channel_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<RelayState> {
        let subscribers: BTreeMap<String, Vec<String>> = self.read_document(FEEDS_FILE)?;
        let ledger: DeliveryLedger = self.read_document(POSTED_ENTRIES_FILE)?;
        let channel: Value = self.read_document(CHANNEL_CONFIG_FILE)?;
        let settings: BTreeMap<String, SubscriberSettings> = self.read_document(SETTINGS_FILE)?;

        let state = RelayState {
            subscribers,
            ledger,
            channel_id: channel_from_document(&channel),
            settings,
        };

        info!(
            "Loaded state from {}: {} subscriber(s), {} delivered entr(ies)",
            self.dir.display(),
            state.subscribers.len(),
            state.ledger.len()
        );
        Ok(state)
    }

    fn save(&self, state: &RelayState) -> Result<()> {
        let documents = [
            (FEEDS_FILE, serde_json::to_string(&state.subscribers)?),
            (POSTED_ENTRIES_FILE, serde_json::to_string(&state.ledger)?),
            (
                CHANNEL_CONFIG_FILE,
                serde_json::to_string(&serde_json::json!({ "channel_id": state.channel_id }))?,
            ),
            (SETTINGS_FILE, serde_json::to_string(&state.settings)?),
        ];

        fs::create_dir_all(&self.dir)?;

        let mut staged = Vec::with_capacity(documents.len());
        for (name, body) in &documents {
            let target = self.dir.join(name);
            let tmp = self.dir.join(format!("{name}.tmp"));
            fs::write(&tmp, body)?;
            staged.push((tmp, target));
        }
        for (tmp, target) in staged {
            fs::rename(&tmp, &target)?;
        }

        debug!("Saved state to {}", self.dir.display());
        Ok(())
    }
}

/// The authoritative in-memory state and the store it is saved to.
///
/// Every mutation happens under the one lock and is saved before the lock
/// is released, so concurrent cycles and commands never lose each other's
/// updates.
pub struct SharedState {
    state: tokio::sync::Mutex<RelayState>,
    store: Arc<dyn StateStore>,
}

impl SharedState {
    /// Load the state from `store`.
    pub fn load(store: Arc<dyn StateStore>) -> Result<Self> {
        let state = store.load()?;
        Ok(Self::with_state(state, store))
    }

    /// Wrap an already loaded state.
    pub fn with_state(state: RelayState, store: Arc<dyn StateStore>) -> Self {
        Self {
            state: tokio::sync::Mutex::new(state),
            store,
        }
    }

    /// Lock the state for a read or a multi-step mutation.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, RelayState> {
        self.state.lock().await
    }

    /// Save `state` (normally the guard returned by [`SharedState::lock`]).
    ///
    /// A failed save is logged and reported as `false`; the in-memory state
    /// is kept and goes out with the next successful save.
    pub fn persist(&self, state: &RelayState) -> bool {
        match self.store.save(state) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist state: {}", e);
                false
            }
        }
    }

    /// Apply `f` to the state and save it.
    ///
    /// Nothing is saved when `f` fails.
    pub async fn update<T>(&self, f: impl FnOnce(&mut RelayState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let value = f(&mut state)?;
        self.persist(&state);
        Ok(value)
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> RelayState {
        self.state.lock().await.clone()
    }

    /// Save the current state, returning the store error on failure.
    pub async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.store.save(&state)
    }
}

/// In-process store, used by tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<RelayState>,
    fail_saves: Mutex<bool>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that loads `state`.
    pub fn with_state(state: RelayState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        *lock(&self.fail_saves) = fail;
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        *lock(&self.saves)
    }

    /// Last successfully saved state.
    pub fn snapshot(&self) -> RelayState {
        lock(&self.state).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<RelayState> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &RelayState) -> Result<()> {
        if *lock(&self.fail_saves) {
            return Err(RelayError::Persistence("store unavailable".to_string()));
        }
        *lock(&self.state) = state.clone();
        *lock(&self.saves) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_state() -> RelayState {
        let mut state = RelayState::new();
        state.add_source("100", "https://example.com/feed.xml").unwrap();
        state.add_source("100", "https://example.com/other.xml").unwrap();
        state.bind_channel("-200");
        state.set_interval("100", 15).unwrap();
        state.ledger.record("100", "a", Utc::now());
        state
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope"));
        let state = store.load().unwrap();
        assert_eq!(state, RelayState::new());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let state = sample_state();

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.subscribers, state.subscribers);
        assert_eq!(loaded.channel_id.as_deref(), Some("-200"));
        assert_eq!(loaded.interval_for("100", 30), 15);
        assert!(loaded.ledger.has("100", "a"));

        for name in [FEEDS_FILE, POSTED_ENTRIES_FILE, CHANNEL_CONFIG_FILE, SETTINGS_FILE] {
            assert!(dir.path().join(name).exists());
            assert!(!dir.path().join(format!("{name}.tmp")).exists());
        }
    }

    #[test]
    fn test_load_legacy_documents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(FEEDS_FILE),
            r#"{"100": ["https://example.com/feed.xml"]}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join(POSTED_ENTRIES_FILE),
            r#"{"100": {"a": "2024-03-01T10:00:00.000001"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join(CHANNEL_CONFIG_FILE), r#"{"channel_id": -1001}"#).unwrap();

        let state = JsonFileStore::new(dir.path()).load().unwrap();
        assert_eq!(state.sources("100"), ["https://example.com/feed.xml"]);
        assert!(state.ledger.has("100", "a"));
        assert_eq!(state.channel_id.as_deref(), Some("-1001"));
        assert!(state.settings.is_empty());
    }

    #[test]
    fn test_load_null_channel() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CHANNEL_CONFIG_FILE), r#"{"channel_id": null}"#).unwrap();

        let state = JsonFileStore::new(dir.path()).load().unwrap();
        assert_eq!(state.channel_id, None);
    }

    #[test]
    fn test_load_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(FEEDS_FILE), "{not json").unwrap();

        let err = JsonFileStore::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_shared_state_update_persists() {
        let store = Arc::new(MemoryStore::new());
        let shared = SharedState::load(store.clone()).unwrap();

        let created = shared.update(|s| Ok(s.register_subscriber("100"))).await.unwrap();
        assert!(created);
        assert_eq!(store.save_count(), 1);
        assert!(store.snapshot().subscribers.contains_key("100"));
    }

    #[tokio::test]
    async fn test_shared_state_failed_mutation_is_not_saved() {
        let store = Arc::new(MemoryStore::new());
        let shared = SharedState::load(store.clone()).unwrap();

        let result = shared.update(|s| s.set_interval("100", 0)).await;
        assert!(matches!(result, Err(RelayError::InvalidInterval(0))));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_state_keeps_changes_when_save_fails() {
        let store = Arc::new(MemoryStore::new());
        let shared = SharedState::load(store.clone()).unwrap();
        store.set_fail_saves(true);

        shared
            .update(|s| s.add_source("100", "https://example.com/feed.xml"))
            .await
            .unwrap();
        assert!(shared.flush().await.is_err());
        assert_eq!(shared.snapshot().await.sources("100").len(), 1);

        store.set_fail_saves(false);
        shared.flush().await.unwrap();
        assert_eq!(store.snapshot().sources("100").len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let state = sample_state();

        store.save(&state).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap(), state);

        store.set_fail_saves(true);
        assert!(store.save(&RelayState::new()).is_err());
        assert_eq!(store.snapshot(), state);
    }
}
