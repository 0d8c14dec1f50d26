//! Bot handler capability interface and the per-type registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::gateway::Message;

/// Outcome of running a handler on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Send this text back to the channel.
    Reply(String),
    /// Nothing to say. Not an error.
    Skip,
}

/// One bot "type". Implementations decide per message whether to respond;
/// the decision content itself (translation, jokes, an LLM call) lives
/// here, outside the orchestration core.
#[async_trait]
pub trait BotHandler: Send + Sync {
    /// Registry key, matched against `Assignment::handler_type`.
    fn type_id(&self) -> &str;

    /// Decide on a single message. `config` is the assignment's opaque
    /// override map. A normal "nothing to say" is `Skip`, never an error.
    async fn process(
        &self,
        message: &Message,
        config: &serde_json::Value,
    ) -> Result<HandlerVerdict, HandlerError>;
}

/// Handlers keyed by type id. Populated at startup, then immutable behind
/// an `Arc`; there is no runtime re-registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn BotHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn BotHandler>) {
        self.handlers.insert(handler.type_id().to_string(), handler);
    }

    pub fn get(&self, type_id: &str) -> Option<Arc<dyn BotHandler>> {
        self.handlers.get(type_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

/// Built-in handler that echoes messages back, optionally gated on a
/// `"prefix"` string in the assignment config. Used by the demo binary.
pub struct EchoHandler;

#[async_trait]
impl BotHandler for EchoHandler {
    fn type_id(&self) -> &str {
        "echo"
    }

    async fn process(
        &self,
        message: &Message,
        config: &serde_json::Value,
    ) -> Result<HandlerVerdict, HandlerError> {
        if let Some(prefix) = config.get("prefix").and_then(|v| v.as_str()) {
            match message.content.strip_prefix(prefix) {
                Some(rest) => return Ok(HandlerVerdict::Reply(rest.trim().to_string())),
                None => return Ok(HandlerVerdict::Skip),
            }
        }
        Ok(HandlerVerdict::Reply(message.content.clone()))
    }
}
