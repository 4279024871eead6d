//! Configuration management for chat-ledger
//!
//! Two sources feed the engine: a TOML file under the platform config
//! directory (throttle windows, index strings, storage location) and the
//! `CLIENT_*` environment overrides consumed at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::accounting::ThrottleWindows;
use crate::core::pricing::TokenTable;
use crate::core::settings::{merge_settings, parse_override, Overrides};
use crate::core::types::{ChatMessage, MessageType, SimpleModel};

/// Environment variable holding the global settings override
pub const ENV_GLOBAL_SETTINGS: &str = "CLIENT_GLOBAL_SETTINGS";
/// Environment variable holding the session settings override
pub const ENV_SESSION_SETTINGS: &str = "CLIENT_SESSION_SETTINGS";
/// Environment variable holding the greeting text
pub const ENV_DEFAULT_MESSAGE: &str = "CLIENT_DEFAULT_MESSAGE";
/// Environment variable holding the privileged max-input-token table
pub const ENV_MAX_INPUT_TOKENS: &str = "CLIENT_MAX_INPUT_TOKENS";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub accounting: AccountingConfig,
    pub index: IndexConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

/// Quiescence windows of the token-counting chains
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccountingConfig {
    pub input_throttle_ms: u64,
    pub context_throttle_ms: u64,
    pub assistant_throttle_ms: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            input_throttle_ms: 100,
            context_throttle_ms: 100,
            assistant_throttle_ms: 50,
        }
    }
}

impl AccountingConfig {
    pub fn windows(&self) -> ThrottleWindows {
        ThrottleWindows {
            input_content: Duration::from_millis(self.input_throttle_ms),
            context: Duration::from_millis(self.context_throttle_ms),
            current_message: Duration::from_millis(self.assistant_throttle_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Delay before the session index is rebuilt after a session switch
    pub debounce_ms: u64,
    /// Title of the "return to home" option
    pub home_title: String,
    /// Line shown above the home session's contents in that option
    pub home_hint: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            home_title: "Back to main conversation".to_string(),
            home_hint: "Click the logo at the top to return to the main conversation directly."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Placeholder title given to freshly created sessions
    pub new_session_title: String,
    /// Greeting shown in an empty session, overridden by `CLIENT_DEFAULT_MESSAGE`
    pub default_message: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            new_session_title: "New conversation".to_string(),
            default_message: "Hello! Ask me anything. Locked messages stay in context \
                              even after the conversation is cleared."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the on-disk key-value store; platform data dir when unset
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        match directories::ProjectDirs::from("", "", "chat-ledger") {
            Some(proj_dirs) => proj_dirs.data_dir().join("storage"),
            None => PathBuf::from(".chat-ledger"),
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "chat-ledger") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }
}

/// Parsed `CLIENT_*` overrides
///
/// Layers that fail to parse are logged and left as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub global_settings: Option<Overrides>,
    pub session_settings: Option<Overrides>,
    pub default_message: Option<String>,
    pub max_input_tokens: Option<Overrides>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            global_settings: non_empty(ENV_GLOBAL_SETTINGS)
                .and_then(|raw| parse_override(&raw, ENV_GLOBAL_SETTINGS)),
            session_settings: non_empty(ENV_SESSION_SETTINGS)
                .and_then(|raw| parse_override(&raw, ENV_SESSION_SETTINGS)),
            default_message: non_empty(ENV_DEFAULT_MESSAGE),
            max_input_tokens: non_empty(ENV_MAX_INPUT_TOKENS)
                .and_then(|raw| parse_token_table(&raw)),
        }
    }
}

/// Token table override: a JSON object per model, or one number for every model
fn parse_token_table(raw: &str) -> Option<Overrides> {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Number(n)) => Some(
            SimpleModel::ALL
                .iter()
                .map(|m| (m.as_str().to_string(), Value::Number(n.clone())))
                .collect(),
        ),
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            tracing::error!(
                "Error parsing {}: expected an object or a number",
                ENV_MAX_INPUT_TOKENS
            );
            None
        }
        Err(e) => {
            tracing::error!("Error parsing {}: {}", ENV_MAX_INPUT_TOKENS, e);
            None
        }
    }
}

/// Everything the session store needs, resolved once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub env: EnvOverrides,
    pub windows: ThrottleWindows,
    pub index_debounce: Duration,
    pub new_session_title: String,
    pub home_title: String,
    pub home_hint: String,
    pub default_message: String,
    /// Budget used when an API key is configured
    pub privileged_tokens: TokenTable,
    /// Budget used otherwise
    pub default_tokens: TokenTable,
}

impl EngineConfig {
    pub fn new(config: &Config, env: EnvOverrides) -> Self {
        let privileged_tokens =
            merge_settings(&TokenTable::default(), env.max_input_tokens.as_ref(), None);
        let default_message = env
            .default_message
            .clone()
            .unwrap_or_else(|| config.session.default_message.clone());

        Self {
            windows: config.accounting.windows(),
            index_debounce: Duration::from_millis(config.index.debounce_ms),
            new_session_title: config.session.new_session_title.clone(),
            home_title: config.index.home_title.clone(),
            home_hint: config.index.home_hint.clone(),
            default_message,
            privileged_tokens,
            default_tokens: TokenTable::default(),
            env,
        }
    }

    /// Greeting the renderer shows in an empty session
    pub fn greeting(&self) -> ChatMessage {
        ChatMessage::assistant(self.default_message.clone()).with_kind(MessageType::Default)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(&Config::default(), EnvOverrides::default())
    }
}
