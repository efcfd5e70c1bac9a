//! Notification model
//!
//! The logical message pushed to every live connection of a user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Notification as sent to clients and exchanged between instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub appid: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Map<String, Value>>,
    pub date: DateTime<Utc>,
}

impl Notification {
    #[must_use]
    pub fn new(appid: u64, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            appid,
            message: message.into(),
            title: String::new(),
            priority: 0,
            extras: None,
            date: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach one extra attribute (e.g. `client::display`).
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}
