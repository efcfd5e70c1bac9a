use pushhub_core::{Notification, UserId};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Unit exchanged between instances through the broker
///
/// No sequence number and no acknowledgement: delivery is best effort.
/// `origin` carries the publishing node's id so a node can recognise its own
/// traffic when the subscription echoes it back. Envelopes without it (older
/// publishers) are accepted and treated as foreign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "userID")]
    pub user_id: UserId,
    pub message: Notification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(user_id: UserId, message: Notification, origin: impl Into<String>) -> Self {
        Self {
            user_id,
            message,
            origin: Some(origin.into()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Whether this envelope was published by `node_id`
    #[must_use]
    pub fn is_from(&self, node_id: &str) -> bool {
        self.origin.as_deref() == Some(node_id)
    }
}
