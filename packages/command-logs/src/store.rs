//! Debounced string key-value persistence.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use sandbox_logs_error::LogsError;

/// Quiet period after the last write before a value is persisted.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(150);

/// Durable string storage. Writes are best-effort.
pub trait Storage: Send + Sync + 'static {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        lock(&self.items).insert(key.to_string(), value.to_string());
    }
}

/// Storage backed by a single JSON object file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Opens `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match load_items(&path) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to load storage file");
                BTreeMap::new()
            }
        };
        Self {
            path,
            items: Mutex::new(items),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sandbox-logs")
            .join("storage.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, items: &BTreeMap<String, String>) -> Result<(), LogsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let content = serde_json::to_string_pretty(items).map_err(|err| LogsError::Storage {
            message: err.to_string(),
        })?;
        fs::write(&self.path, content).map_err(storage_error)
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        let mut items = lock(&self.items);
        items.insert(key.to_string(), value.to_string());
        if let Err(err) = self.save(&items) {
            tracing::warn!(path = %self.path.display(), key, error = %err, "failed to persist storage item");
        }
    }
}

fn load_items(path: &Path) -> Result<BTreeMap<String, String>, LogsError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path).map_err(storage_error)?;
    serde_json::from_str(&content).map_err(|err| LogsError::Storage {
        message: err.to_string(),
    })
}

fn storage_error(err: std::io::Error) -> LogsError {
    LogsError::Storage {
        message: err.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct PendingWrite {
    generation: u64,
    value: String,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct StoreState {
    values: HashMap<String, String>,
    pending: HashMap<String, PendingWrite>,
    generation: u64,
}

/// In-memory values with per-key debounced persistence.
///
/// Reads see the latest write immediately. Each key is persisted once it has
/// been quiet for the configured period. Dropping the store cancels pending
/// persists without flushing them.
pub struct DebouncedStore<S: Storage> {
    storage: Arc<S>,
    state: Arc<Mutex<StoreState>>,
    quiet_period: Duration,
}

impl<S: Storage> DebouncedStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_quiet_period(storage, DEFAULT_QUIET_PERIOD)
    }

    pub fn with_quiet_period(storage: Arc<S>, quiet_period: Duration) -> Self {
        Self {
            storage,
            state: Arc::new(Mutex::new(StoreState::default())),
            quiet_period,
        }
    }

    /// Latest value written through this store, else the persisted one, else `""`.
    pub fn read(&self, key: &str) -> String {
        if let Some(value) = lock(&self.state).values.get(key) {
            return value.clone();
        }
        self.storage.get_item(key).unwrap_or_default()
    }

    /// Must be called from within a Tokio runtime.
    pub fn write(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let mut state = lock(&self.state);
        state.generation += 1;
        let generation = state.generation;
        state.values.insert(key.to_string(), value.clone());
        if let Some(previous) = state.pending.remove(key) {
            previous.task.abort();
        }

        let task = tokio::spawn(persist_after_quiet(
            self.storage.clone(),
            Arc::downgrade(&self.state),
            key.to_string(),
            value.clone(),
            generation,
            self.quiet_period,
        ));
        state.pending.insert(
            key.to_string(),
            PendingWrite {
                generation,
                value,
                task,
            },
        );
    }

    /// Persists every pending value now.
    pub fn flush(&self) {
        let pending: Vec<(String, PendingWrite)> = lock(&self.state).pending.drain().collect();
        for (key, write) in pending {
            write.task.abort();
            self.storage.set_item(&key, &write.value);
        }
    }

    pub fn has_pending(&self, key: &str) -> bool {
        lock(&self.state).pending.contains_key(key)
    }
}

impl<S: Storage> Drop for DebouncedStore<S> {
    fn drop(&mut self) {
        for (_, write) in lock(&self.state).pending.drain() {
            write.task.abort();
        }
    }
}

async fn persist_after_quiet<S: Storage>(
    storage: Arc<S>,
    state: Weak<Mutex<StoreState>>,
    key: String,
    value: String,
    generation: u64,
    quiet_period: Duration,
) {
    tokio::time::sleep(quiet_period).await;
    let Some(state) = state.upgrade() else {
        return;
    };
    {
        let mut state = lock(&state);
        match state.pending.get(&key) {
            Some(pending) if pending.generation == generation => {
                state.pending.remove(&key);
            }
            _ => return,
        }
    }
    storage.set_item(&key, &value);
}
