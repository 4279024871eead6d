//! Persistent storage for chat-ledger
//!
//! Everything lives in a flat key-value store holding JSON strings, the same
//! shape a browser origin's local storage has:
//!
//! ```text
//! global-settings        # GlobalSettings overrides
//! session-{id}           # one Session record per conversation
//! ```
//!
//! Records are read fail-soft: a value that no longer parses is logged and
//! treated as absent, and a session whose messages are unreadable still yields
//! its settings.

pub mod backends;

pub use backends::{FileStore, MemoryStore};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::core::settings::{value_to_override, Overrides};
use crate::core::types::{ChatMessage, GlobalSettings, Session};

/// Key of the global settings record
pub const GLOBAL_SETTINGS_KEY: &str = "global-settings";

/// Prefix of every session record key
pub const SESSION_KEY_PREFIX: &str = "session-";

/// Minimal string key-value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

/// Key of a session record
pub fn session_key(id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, id)
}

/// A session record as found in the store
///
/// Settings stay as raw overrides so the caller can merge them over its own
/// defaults; `messages` is `None` when the field is missing or unreadable.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub id: String,
    pub last_visit: i64,
    pub settings: Option<Overrides>,
    pub messages: Option<Vec<ChatMessage>>,
}

impl StoredSession {
    /// Parse a raw record; `fallback_id` is used when the record carries none
    pub fn parse(raw: &str, fallback_id: &str) -> Option<Self> {
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Error parsing session {}: {}", fallback_id, e);
                return None;
            }
        };
        let Value::Object(mut record) = value else {
            tracing::error!("Error parsing session {}: not a JSON object", fallback_id);
            return None;
        };

        let id = match record.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => fallback_id.to_string(),
        };
        let last_visit = record
            .get("lastVisit")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(0);
        let settings = record
            .remove("settings")
            .and_then(|v| value_to_override(v, "session settings"));
        let messages = record.remove("messages").and_then(|v| {
            serde_json::from_value::<Vec<ChatMessage>>(v)
                .map_err(|e| tracing::error!("Error parsing messages of session {}: {}", id, e))
                .ok()
        });

        Some(Self {
            id,
            last_visit,
            settings,
            messages,
        })
    }

    /// Title stored in the record, empty when absent
    pub fn title(&self) -> &str {
        self.settings
            .as_ref()
            .and_then(|s| s.get("title"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.messages.as_deref().unwrap_or_default()
    }
}

/// Typed access to the records of a key-value store
#[derive(Clone)]
pub struct LocalStorage {
    backend: Arc<dyn KeyValueStore>,
}

impl LocalStorage {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Storage backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Storage backed by one JSON file per key under `dir`
    pub fn open(dir: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileStore::new(dir)?)))
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }

    // ========== Global settings ==========

    /// Persisted global settings, as an override layer
    pub fn global_settings_override(&self) -> Result<Option<Overrides>> {
        let raw = self.backend.get(GLOBAL_SETTINGS_KEY)?;
        Ok(raw.and_then(|raw| {
            crate::core::settings::parse_override(&raw, GLOBAL_SETTINGS_KEY)
        }))
    }

    pub fn set_global_settings(&self, settings: &GlobalSettings) -> Result<()> {
        let content = serde_json::to_string(settings)?;
        self.backend.set(GLOBAL_SETTINGS_KEY, &content)
    }

    // ========== Sessions ==========

    pub fn get_session(&self, id: &str) -> Result<Option<StoredSession>> {
        let raw = self.backend.get(&session_key(id))?;
        Ok(raw.and_then(|raw| StoredSession::parse(&raw, id)))
    }

    /// Whether any record occupies this id, readable or not
    pub fn session_exists(&self, id: &str) -> Result<bool> {
        Ok(self.backend.get(&session_key(id))?.is_some())
    }

    pub fn set_session(&self, session: &Session) -> Result<()> {
        let content = serde_json::to_string(session)
            .with_context(|| format!("Failed to serialize session {}", session.id))?;
        self.backend.set(&session_key(&session.id), &content)
    }

    /// Remove a session record; absent ids are ignored
    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.backend.remove(&session_key(id))
    }

    /// Every readable session record, in key order
    pub fn fetch_all_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut sessions = Vec::new();
        for key in self.backend.keys()? {
            let Some(id) = key.strip_prefix(SESSION_KEY_PREFIX) else {
                continue;
            };
            if let Some(raw) = self.backend.get(&key)? {
                if let Some(session) = StoredSession::parse(&raw, id) {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    // ========== Export / import ==========

    /// Every key with its raw value, as one JSON object
    pub fn export_all(&self) -> Result<Value> {
        let mut dump = Map::new();
        for key in self.backend.keys()? {
            if let Some(value) = self.backend.get(&key)? {
                dump.insert(key, Value::String(value));
            }
        }
        Ok(Value::Object(dump))
    }

    /// Replace the whole store with a dump produced by `export_all`
    ///
    /// Non-string values are stored as their JSON text. Every key of the dump
    /// is written before any old key is removed, so a failed write leaves the
    /// previous records in place. Returns the number of keys written.
    pub fn import_all(&self, dump: &str) -> Result<usize> {
        let value: Value = serde_json::from_str(dump).context("Import is not valid JSON")?;
        let Value::Object(entries) = value else {
            anyhow::bail!("Import must be a JSON object of key/value pairs");
        };

        let previous = self.backend.keys()?;
        for (key, value) in &entries {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.backend
                .set(key, &raw)
                .with_context(|| format!("Failed to import {}", key))?;
        }
        for key in previous.iter().filter(|k| !entries.contains_key(k.as_str())) {
            self.backend.remove(key)?;
        }
        tracing::info!("Imported {} keys", entries.len());
        Ok(entries.len())
    }
}
