//! Canonical type definitions for the core domain
//!
//! Session records, settings and messages as they are persisted in the local
//! store. Field names follow the persisted JSON shape, so records written by
//! earlier clients load unchanged.

use serde::{Deserialize, Serialize};

/// Id of the home session. Always exists conceptually, never deleted.
pub const INDEX_SESSION_ID: &str = "index";

/// Model choice exposed to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SimpleModel {
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[default]
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
}

impl SimpleModel {
    pub const ALL: [SimpleModel; 2] = [SimpleModel::Gpt4o, SimpleModel::Gpt4oMini];

    /// Identifier used in settings records and token tables
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
        }
    }

    /// Concrete model this choice resolves to
    pub fn resolve(self) -> Model {
        match self {
            Self::Gpt4o => Model::Gpt4o20240806,
            Self::Gpt4oMini => Model::Gpt4oMini,
        }
    }
}

impl std::fmt::Display for SimpleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SimpleModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpt-4o" => Ok(Self::Gpt4o),
            "gpt-4o-mini" => Ok(Self::Gpt4oMini),
            other => Err(format!("unknown model: {}", other)),
        }
    }
}

/// Concrete model id sent to the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "gpt-4o-2024-08-06")]
    Gpt4o20240806,
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4o20240806 => "gpt-4o-2024-08-06",
            Self::Gpt4oMini => "gpt-4o-mini",
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// How a message participates in context building
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Greeting shown by the renderer, never persisted as history
    Default,
    /// Pinned: survives clearing and is sent even outside continuous mode
    Locked,
    /// In-flight or error placeholder, never sent
    Temporary,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            kind: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }

    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn is_locked(&self) -> bool {
        self.kind == Some(MessageType::Locked)
    }

    pub fn is_temporary(&self) -> bool {
        self.kind == Some(MessageType::Temporary)
    }
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    #[serde(rename = "APIKey")]
    pub api_key: String,
    pub password: String,
    #[serde(rename = "enterToSend")]
    pub enter_to_send: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            password: String::new(),
            enter_to_send: true,
        }
    }
}

/// Per-session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub title: String,
    #[serde(rename = "saveSession")]
    pub save_session: bool,
    /// Sampling temperature, 0.0 to 2.0
    #[serde(rename = "APITemperature")]
    pub api_temperature: f64,
    #[serde(rename = "continuousDialogue")]
    pub continuous_dialogue: bool,
    pub model: SimpleModel,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            title: String::new(),
            save_session: true,
            api_temperature: 0.6,
            continuous_dialogue: true,
            model: SimpleModel::default(),
        }
    }
}

/// A persisted session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Epoch milliseconds of the last time the session was written
    #[serde(rename = "lastVisit")]
    pub last_visit: i64,
    pub settings: SessionSettings,
    pub messages: Vec<ChatMessage>,
}

impl Session {
    pub fn new(id: impl Into<String>, settings: SessionSettings) -> Self {
        Self {
            id: id.into(),
            last_visit: chrono::Utc::now().timestamp_millis(),
            settings,
            messages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_field_is_optional() {
        let msg: ChatMessage = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.kind, None);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("type"));

        let locked: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"x","type":"locked"}"#).unwrap();
        assert!(locked.is_locked());
    }

    #[test]
    fn test_settings_use_record_field_names() {
        let json = serde_json::to_value(SessionSettings::default()).unwrap();
        assert_eq!(json["saveSession"], true);
        assert_eq!(json["continuousDialogue"], true);
        assert_eq!(json["model"], "gpt-4o-mini");
        assert!((json["APITemperature"].as_f64().unwrap() - 0.6).abs() < f64::EPSILON);

        let global = serde_json::to_value(GlobalSettings::default()).unwrap();
        assert_eq!(global["APIKey"], "");
        assert_eq!(global["enterToSend"], true);
    }

    #[test]
    fn test_simple_model_resolves_to_concrete_model() {
        assert_eq!(SimpleModel::Gpt4o.resolve(), Model::Gpt4o20240806);
        assert_eq!(SimpleModel::Gpt4oMini.resolve(), Model::Gpt4oMini);
        assert_eq!("gpt-4o".parse::<SimpleModel>().unwrap(), SimpleModel::Gpt4o);
        assert!("gpt-3".parse::<SimpleModel>().is_err());
    }

    #[test]
    fn test_unknown_model_fails_to_deserialize() {
        let result: Result<SessionSettings, _> = serde_json::from_str(r#"{"model":"gpt-3.5"}"#);
        assert!(result.is_err());
    }
}
