//! Message deduplication and loop prevention.
//!
//! One cursor per (bot, channel). The accept decision and the cursor
//! advance happen under a single per-key lock, so two concurrent polls
//! can never double-process a message. Rejection has no side effects.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::gateway::Message;
use crate::store::Store;
use crate::types::{BotId, ChannelId, MessageId};

type Key = (BotId, ChannelId);

struct CursorSlot {
    /// None until the persisted cursor has been loaded.
    cursor: Option<MessageId>,
    loaded: bool,
}

/// Tracks the last-processed message per (bot, channel) and filters out
/// anything at or below it, plus every bot-originated message.
pub struct Deduplicator {
    store: Arc<dyn Store>,
    slots: Mutex<HashMap<Key, Arc<Mutex<CursorSlot>>>>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The slot for a key; the outer map lock is held only long enough to
    /// clone the per-key handle.
    async fn slot(&self, bot: &BotId, channel: &ChannelId) -> Arc<Mutex<CursorSlot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry((bot.clone(), channel.clone()))
            .or_insert_with(|| {
                Arc::new(Mutex::new(CursorSlot {
                    cursor: None,
                    loaded: false,
                }))
            })
            .clone()
    }

    /// Load the persisted cursor on first touch of a slot.
    async fn ensure_loaded(&self, slot: &mut CursorSlot, bot: &BotId, channel: &ChannelId) {
        if slot.loaded {
            return;
        }
        match self.store.load_cursor(bot, channel).await {
            Ok(cursor) => slot.cursor = cursor,
            Err(e) => {
                tracing::warn!(
                    bot = %bot,
                    channel = %channel,
                    error = %e,
                    "failed to load cursor, starting from scratch"
                );
            }
        }
        slot.loaded = true;
    }

    /// Current cursor for a (bot, channel), for fetch-since calls.
    pub async fn cursor(&self, bot: &BotId, channel: &ChannelId) -> Option<MessageId> {
        let slot = self.slot(bot, channel).await;
        let mut slot = slot.lock().await;
        self.ensure_loaded(&mut slot, bot, channel).await;
        slot.cursor
    }

    /// Decide whether a message should be processed. On accept, the
    /// cursor advances and is persisted; on reject nothing changes.
    pub async fn accept(&self, bot: &BotId, channel: &ChannelId, message: &Message) -> bool {
        if message.is_bot_originated() {
            tracing::debug!(
                bot = %bot,
                channel = %channel,
                message_id = message.id,
                "skipping bot-originated message"
            );
            return false;
        }

        let slot = self.slot(bot, channel).await;
        let mut slot = slot.lock().await;
        self.ensure_loaded(&mut slot, bot, channel).await;

        if slot.cursor.is_some_and(|c| message.id <= c) {
            return false;
        }

        slot.cursor = Some(message.id);
        if let Err(e) = self.store.save_cursor(bot, channel, message.id).await {
            tracing::warn!(
                bot = %bot,
                channel = %channel,
                cursor = message.id,
                error = %e,
                "failed to persist cursor"
            );
        }
        true
    }
}
