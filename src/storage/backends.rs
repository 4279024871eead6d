//! Key-value backends
//!
//! `FileStore` keeps one `<key>.json` file per key under a directory.
//! `MemoryStore` is process-local and used by tests and embedders that do
//! their own persistence.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};

use super::KeyValueStore;

/// One file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage dir {}", root.display()))?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        std::fs::write(&path, value)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Some(stem) = path.file_stem() {
                        let stem = stem.to_string_lossy();
                        match urlencoding::decode(&stem) {
                            Ok(key) => keys.push(key.into_owned()),
                            Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Map a key onto a file stem; distinct keys never share a file
fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("kv")).unwrap();

        assert_eq!(store.get("session-a1").unwrap(), None);
        store.set("session-a1", "{}").unwrap();
        store.set("global-settings", "{\"APIKey\":\"\"}").unwrap();

        assert_eq!(store.get("session-a1").unwrap().as_deref(), Some("{}"));
        assert_eq!(store.keys().unwrap(), vec!["global-settings", "session-a1"]);

        store.remove("session-a1").unwrap();
        store.remove("session-a1").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["global-settings"]);
    }

    #[test]
    fn test_file_store_ignores_foreign_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "x").unwrap();
        store.set("k", "v").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["k"]);
    }

    #[test]
    fn test_unsafe_key_characters_are_encoded() {
        assert_eq!(encode_key("session-a1"), "session-a1");
        assert_eq!(encode_key("session-a/b"), "session-a%2Fb");
        assert_eq!(encode_key("a:b*c"), "a%3Ab%2Ac");
    }

    #[test]
    fn test_similar_keys_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        store.set("session-a/b", "slash").unwrap();
        store.set("session-a_b", "underscore").unwrap();

        assert_eq!(store.get("session-a/b").unwrap().as_deref(), Some("slash"));
        assert_eq!(store.get("session-a_b").unwrap().as_deref(), Some("underscore"));
        assert_eq!(store.keys().unwrap(), vec!["session-a/b", "session-a_b"]);
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        assert_eq!(store.len(), 2);
        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
