//! Persisted per-component state.
//!
//! A stack keeps one state document, a mapping from component path to that
//! component's key/value entries:
//!
//! ```text
//! {
//!   "backups/password": { "value": "Zq3…" },
//!   "backups/repo": { "initialized": true }
//! }
//! ```
//!
//! Every write goes through the backend before the call returns, so a
//! component that finished deploying is never observed half-applied by the
//! next component or by a later run. The JSON file backend writes sorted,
//! pretty-printed JSON so the file can be inspected and hand-edited.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::component::ComponentPath;
use crate::error::{KilnError, KilnResult};

/// Entries of a single component.
pub type StateEntries = BTreeMap<String, Value>;

/// The whole state document, keyed by component path.
pub type StateDocument = BTreeMap<String, StateEntries>;

/// Where the state document lives.
pub trait StateBackend: Send + Sync {
    /// Read the document. A missing document is an empty one.
    fn load(&self) -> KilnResult<StateDocument>;

    /// Durably replace the document.
    fn save(&self, document: &StateDocument) -> KilnResult<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

fn render(document: &StateDocument) -> KilnResult<String> {
    let mut json = serde_json::to_string_pretty(document)?;
    json.push('\n');
    Ok(json)
}

fn parse(content: &str) -> KilnResult<StateDocument> {
    if content.trim().is_empty() {
        return Ok(StateDocument::new());
    }
    Ok(serde_json::from_str(content)?)
}

/// State document stored as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> KilnResult<StateDocument> {
        if !self.path.exists() {
            return Ok(StateDocument::new());
        }
        let content = fs::read_to_string(&self.path)?;
        parse(&content)
    }

    fn save(&self, document: &StateDocument) -> KilnResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // Write next to the target and rename over it, so a crash leaves
        // either the old or the new document.
        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(render(document)?.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| KilnError::from(err.error))?;

        debug!("Saved state to {:?}", self.path);
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory backend for tests. Keeps the serialized bytes so callers can
/// compare documents exactly.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    contents: Arc<Mutex<Option<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing JSON document.
    pub fn with_contents(json: impl Into<String>) -> Self {
        Self {
            contents: Arc::new(Mutex::new(Some(json.into()))),
        }
    }

    /// Serialized document as last saved.
    pub fn contents(&self) -> Option<String> {
        self.contents.lock().clone()
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> KilnResult<StateDocument> {
        match self.contents.lock().as_deref() {
            Some(content) => parse(content),
            None => Ok(StateDocument::new()),
        }
    }

    fn save(&self, document: &StateDocument) -> KilnResult<()> {
        *self.contents.lock() = Some(render(document)?);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct StoreInner {
    backend: Box<dyn StateBackend>,
    document: Mutex<StateDocument>,
    read_only: AtomicBool,
}

/// Durable key/value state for every component of a stack.
///
/// There is no locking: two runs against the same backend at the same time
/// are not supported.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.inner.backend.describe())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl StateStore {
    /// Open a store, loading the current document from the backend.
    pub fn open(backend: impl StateBackend + 'static) -> KilnResult<Self> {
        let document = backend.load()?;
        debug!(
            "Opened state {} ({} components)",
            backend.describe(),
            document.len()
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                backend: Box::new(backend),
                document: Mutex::new(document),
                read_only: AtomicBool::new(false),
            }),
        })
    }

    /// A fresh, empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: Box::new(MemoryBackend::new()),
                document: Mutex::new(StateDocument::new()),
                read_only: AtomicBool::new(false),
            }),
        }
    }

    /// State handle scoped to one component.
    pub fn scoped(&self, path: ComponentPath) -> StateHandle {
        StateHandle {
            store: self.clone(),
            path,
        }
    }

    pub fn get(&self, path: &ComponentPath, key: &str, default: Value) -> Value {
        self.get_value(path, key).unwrap_or(default)
    }

    pub fn get_value(&self, path: &ComponentPath, key: &str) -> Option<Value> {
        self.inner
            .document
            .lock()
            .get(&path.to_string())
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    pub fn entries(&self, path: &ComponentPath) -> StateEntries {
        self.inner
            .document
            .lock()
            .get(&path.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, path: &ComponentPath, key: &str, value: Value) -> KilnResult<()> {
        let path_key = path.to_string();
        self.update(path, |document| {
            let entries = document.entry(path_key).or_default();
            entries.insert(key.to_string(), value.clone()) != Some(value)
        })
    }

    pub fn clear(&self, path: &ComponentPath, key: &str) -> KilnResult<()> {
        let path_key = path.to_string();
        self.update(path, |document| {
            let Some(entries) = document.get_mut(&path_key) else {
                return false;
            };
            let removed = entries.remove(key).is_some();
            if entries.is_empty() {
                document.remove(&path_key);
            }
            removed
        })
    }

    /// Drop every entry of a component.
    pub fn clear_component(&self, path: &ComponentPath) -> KilnResult<()> {
        let path_key = path.to_string();
        self.update(path, |document| document.remove(&path_key).is_some())
    }

    /// Copy of the whole document.
    pub fn snapshot(&self) -> StateDocument {
        self.inner.document.lock().clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::SeqCst)
    }

    /// Reject writes until the guard is dropped.
    pub fn read_only_guard(&self) -> ReadOnlyGuard {
        let previous = self.inner.read_only.swap(true, Ordering::SeqCst);
        ReadOnlyGuard {
            store: self.clone(),
            previous,
        }
    }

    /// Apply `change` to a copy of the document and persist it. The in-memory
    /// document is only replaced once the backend accepted the write.
    fn update<F>(&self, path: &ComponentPath, change: F) -> KilnResult<()>
    where
        F: FnOnce(&mut StateDocument) -> bool,
    {
        let mut document = self.inner.document.lock();
        let mut next = document.clone();
        if !change(&mut next) {
            return Ok(());
        }

        if self.is_read_only() {
            return Err(KilnError::State(format!(
                "refusing to write state of {} during a dry run",
                path
            )));
        }

        self.inner.backend.save(&next)?;
        *document = next;
        Ok(())
    }
}

/// Restores the previous write mode of a [`StateStore`] when dropped.
pub struct ReadOnlyGuard {
    store: StateStore,
    previous: bool,
}

impl Drop for ReadOnlyGuard {
    fn drop(&mut self) {
        self.store
            .inner
            .read_only
            .store(self.previous, Ordering::SeqCst);
    }
}

/// A [`StateStore`] scoped to one component path.
#[derive(Debug, Clone)]
pub struct StateHandle {
    store: StateStore,
    path: ComponentPath,
}

impl StateHandle {
    pub fn path(&self) -> &ComponentPath {
        &self.path
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.store.get_value(&self.path, key)
    }

    /// Typed read. A missing key or a JSON `null` reads as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> KilnResult<Option<T>> {
        match self.get_value(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                KilnError::State(format!("{}: cannot read `{}`: {}", self.path, key, err))
            }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> KilnResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> KilnResult<()> {
        self.store.set(&self.path, key, serde_json::to_value(value)?)
    }

    pub fn clear(&self, key: &str) -> KilnResult<()> {
        self.store.clear(&self.path, key)
    }

    pub fn clear_all(&self) -> KilnResult<()> {
        self.store.clear_component(&self.path)
    }

    pub fn entries(&self) -> StateEntries {
        self.store.entries(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn path(p: &str) -> ComponentPath {
        ComponentPath::parse(p)
    }

    #[test]
    fn test_get_set_clear() {
        let store = StateStore::in_memory();
        let repo = path("backups/repo");

        assert_eq!(store.get(&repo, "initialized", json!(false)), json!(false));

        store.set(&repo, "initialized", json!(true)).unwrap();
        assert_eq!(store.get(&repo, "initialized", json!(false)), json!(true));

        store.clear(&repo, "initialized").unwrap();
        assert_eq!(store.get_value(&repo, "initialized"), None);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("state").join("kiln.json");

        let store = StateStore::open(JsonFileBackend::new(&file)).unwrap();
        store
            .set(&path("media/password"), "value", json!("s3cret"))
            .unwrap();
        drop(store);

        let reopened = StateStore::open(JsonFileBackend::new(&file)).unwrap();
        assert_eq!(
            reopened.get_value(&path("media/password"), "value"),
            Some(json!("s3cret"))
        );

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"media/password": {"value": "s3cret"}}));
    }

    #[test]
    fn test_missing_and_empty_files_are_empty_state() {
        let dir = TempDir::new().unwrap();
        let missing = JsonFileBackend::new(dir.path().join("nope.json"));
        assert!(missing.load().unwrap().is_empty());

        let empty = dir.path().join("empty.json");
        fs::write(&empty, "  \n").unwrap();
        assert!(JsonFileBackend::new(&empty).load().unwrap().is_empty());
    }

    #[test]
    fn test_set_is_flushed_before_returning() {
        let backend = MemoryBackend::new();
        let store = StateStore::open(backend.clone()).unwrap();

        store.set(&path("a"), "k", json!(1)).unwrap();

        let saved: Value = serde_json::from_str(&backend.contents().unwrap()).unwrap();
        assert_eq!(saved, json!({"a": {"k": 1}}));
    }

    #[test]
    fn test_unchanged_write_does_not_touch_backend() {
        let backend = MemoryBackend::with_contents(r#"{"a":{"k":1}}"#);
        let store = StateStore::open(backend.clone()).unwrap();

        store.set(&path("a"), "k", json!(1)).unwrap();
        store.clear(&path("b"), "missing").unwrap();

        assert_eq!(backend.contents().as_deref(), Some(r#"{"a":{"k":1}}"#));
    }

    #[test]
    fn test_read_only_guard_rejects_writes() {
        let backend = MemoryBackend::new();
        let store = StateStore::open(backend.clone()).unwrap();

        {
            let _guard = store.read_only_guard();
            let err = store.set(&path("a"), "k", json!(1)).unwrap_err();
            assert!(matches!(err, KilnError::State(_)));
            assert!(store.get_value(&path("a"), "k").is_none());
        }

        assert!(!store.is_read_only());
        store.set(&path("a"), "k", json!(1)).unwrap();
        assert!(backend.contents().is_some());
    }

    #[test]
    fn test_handle_typed_access() {
        let store = StateStore::in_memory();
        let handle = store.scoped(path("app/version"));

        assert_eq!(handle.get::<String>("current_version").unwrap(), None);
        assert_eq!(handle.get_or("current_version", String::new()).unwrap(), "");

        handle.set("current_version", "v1.2.0").unwrap();
        assert_eq!(
            handle.get::<String>("current_version").unwrap().as_deref(),
            Some("v1.2.0")
        );

        handle.set("current_version", &Value::Null).unwrap();
        assert_eq!(handle.get::<String>("current_version").unwrap(), None);

        handle.set("count", &3u32).unwrap();
        assert!(handle.get::<bool>("count").is_err());

        handle.clear_all().unwrap();
        assert!(handle.entries().is_empty());
    }
}
