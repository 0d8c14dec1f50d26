//! Core identifiers and the Assignment record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Assignments and schedule entries are keyed by UUID.
pub type AssignmentId = Uuid;

/// Channel-native message identifier, monotonically increasing in
/// channel-native order. Cursor comparisons rely on this ordering.
pub type MessageId = u64;

/// Operator-chosen bot identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotId(pub String);

impl BotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Channel-native channel handle (chat id, room id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A (bot, channel) pairing. At most one Assignment exists per pair; the
/// CRUD collaborator enforces that, the runtime consumes assignments
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub bot: BotId,
    pub channel: ChannelId,
    /// Keys into the handler registry.
    pub handler_type: String,
    pub enabled: bool,
    /// Startup ordering only; lower numbers start first. Does not
    /// serialize message handling across workers.
    pub priority: i32,
    /// Opaque per-assignment handler configuration.
    pub config_override: serde_json::Value,
}

impl Assignment {
    pub fn new(
        bot: impl Into<BotId>,
        channel: impl Into<ChannelId>,
        handler_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot: bot.into(),
            channel: channel.into(),
            handler_type: handler_type.into(),
            enabled: true,
            priority: 0,
            config_override: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config_override = config;
        self
    }
}
