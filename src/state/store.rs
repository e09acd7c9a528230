//! Key/value storage backends.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Host key/value storage for one scope.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Store `value` under `key`, or remove the key when `value` is `None`.
    async fn update(&self, key: &str, value: Option<Value>) -> anyhow::Result<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Direct write, bypassing the async interface.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().insert(key.into(), value);
    }

    pub fn peek(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.peek(key))
    }

    async fn update(&self, key: &str, value: Option<Value>) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => entries.insert(key.to_string(), value),
            None => entries.remove(key),
        };
        Ok(())
    }
}

/// Store backed by a single JSON file.
///
/// The file is read once on open and rewritten after every update whose
/// serialized content differs from what is on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("malformed state file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        if file_content_matches(&self.path, &json) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn update(&self, key: &str, value: Option<Value>) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        let previous = match value {
            Some(value) => entries.insert(key.to_string(), value),
            None => entries.remove(key),
        };
        if let Err(e) = self.persist(&entries) {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Check if file content is the same as new content
fn file_content_matches(path: &Path, content: &str) -> bool {
    path.exists() && fs::read_to_string(path).is_ok_and(|existing| existing == content)
}
