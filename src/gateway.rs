//! Message gateway abstraction: the transport collaborator boundary.
//!
//! The real transport (Telegram, Matrix, ...) lives behind
//! [`MessageGateway`]. [`InProcessGateway`] is the in-memory
//! implementation used by the demo binary and the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::types::{ChannelId, MessageId};

/// Sender tag prefix on messages a bot worker sent.
pub const BOT_TAG_PREFIX: &str = "bot:";

/// Sender tag prefix on messages the scheduler sent.
pub const SCHED_TAG_PREFIX: &str = "sched:";

/// A single channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    /// Origin marker. Messages this system sends carry a `bot:` or
    /// `sched:` tag so they are never re-ingested as triggers.
    pub sender_tag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// True when the message was produced by any bot in this system,
    /// including scheduled sends.
    pub fn is_bot_originated(&self) -> bool {
        self.sender_tag
            .as_deref()
            .is_some_and(|t| t.starts_with(BOT_TAG_PREFIX) || t.starts_with(SCHED_TAG_PREFIX))
    }
}

/// Transport collaborator: fetch and send messages for a channel.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Fetch messages with id strictly greater than `since`, in
    /// channel-native order.
    async fn fetch(
        &self,
        channel: &ChannelId,
        since: Option<MessageId>,
    ) -> Result<Vec<Message>, GatewayError>;

    /// Send a message, tagged with the sender's origin marker. Returns the
    /// channel-native id of the sent message.
    async fn send(
        &self,
        channel: &ChannelId,
        content: &str,
        sender_tag: &str,
    ) -> Result<MessageId, GatewayError>;
}

/// In-memory gateway: per-channel append-only message logs with a global
/// id sequence. Backs the demo binary's local loop and the tests.
pub struct InProcessGateway {
    channels: Mutex<HashMap<ChannelId, Vec<Message>>>,
    next_id: AtomicU64,
}

impl InProcessGateway {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an externally-originated message (an operator or channel
    /// user speaking), untagged or with a caller-supplied tag.
    pub async fn inject(
        &self,
        channel: &ChannelId,
        content: &str,
        sender_tag: Option<&str>,
    ) -> MessageId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            id,
            content: content.to_string(),
            sender_tag: sender_tag.map(String::from),
            timestamp: Utc::now(),
        };
        self.channels
            .lock()
            .await
            .entry(channel.clone())
            .or_default()
            .push(message);
        id
    }

    /// Snapshot of a channel's full log, oldest first.
    pub async fn log(&self, channel: &ChannelId) -> Vec<Message> {
        self.channels
            .lock()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageGateway for InProcessGateway {
    async fn fetch(
        &self,
        channel: &ChannelId,
        since: Option<MessageId>,
    ) -> Result<Vec<Message>, GatewayError> {
        let channels = self.channels.lock().await;
        let Some(log) = channels.get(channel) else {
            return Ok(Vec::new());
        };
        let floor = since.unwrap_or(0);
        Ok(log.iter().filter(|m| m.id > floor).cloned().collect())
    }

    async fn send(
        &self,
        channel: &ChannelId,
        content: &str,
        sender_tag: &str,
    ) -> Result<MessageId, GatewayError> {
        Ok(self.inject(channel, content, Some(sender_tag)).await)
    }
}
