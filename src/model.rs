use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreError;

/// Upper bound on a message body, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Well-known settings fields.
pub mod fields {
    pub const API_KEY: &str = "apiKey";
    pub const PROVIDER: &str = "provider";
    pub const MODEL: &str = "model";
    pub const MEMORY: &str = "memory";

    pub const CREDENTIALS: &[&str] = &[API_KEY];
    pub const STRING_FIELDS: &[&str] = &[API_KEY, PROVIDER, MODEL, MEMORY];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(StoreError::Validation(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn validate(&self) -> crate::Result<()> {
        if self.text.len() > MAX_MESSAGE_BYTES {
            return Err(StoreError::Validation(format!(
                "message text is {} bytes, limit is {}",
                self.text.len(),
                MAX_MESSAGE_BYTES
            )));
        }
        Ok(())
    }

    /// Decode one stored record, rejecting anything that does not match the schema.
    pub fn from_record(record: &Value) -> crate::Result<Self> {
        let message: Message = serde_json::from_value(record.clone())
            .map_err(|e| StoreError::Validation(format!("malformed message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }
}

/// What a caller hands to `append_message`; the store stamps the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,
}

impl NewMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            meta: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    pub fn stamp(self) -> crate::Result<Message> {
        let message = Message {
            role: self.role,
            text: self.text,
            meta: self.meta,
            timestamp: Utc::now(),
        };
        message.validate()?;
        Ok(message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// The settings record: stable string keys to JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsRecord(pub BTreeMap<String, Value>);

impl SettingsRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

/// Schema check for one settings value.
pub fn validate_setting(key: &str, value: &Value) -> crate::Result<()> {
    if key.is_empty() {
        return Err(StoreError::Validation("empty settings key".to_string()));
    }
    if fields::STRING_FIELDS.contains(&key) && !value.is_string() {
        return Err(StoreError::Validation(format!(
            "settings field {} must be a string",
            key
        )));
    }
    Ok(())
}

pub fn is_credential(key: &str) -> bool {
    fields::CREDENTIALS.contains(&key)
}
