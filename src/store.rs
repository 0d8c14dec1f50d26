//! Persistence collaborator boundary.
//!
//! The engine only sees the [`Store`] trait; the real backend (and its
//! schema) belongs to the CRUD collaborator. [`MemoryStore`] implements
//! the trait in memory for the demo binary and the test suite.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::ScheduleEntry;
use crate::types::{Assignment, AssignmentId, BotId, ChannelId, MessageId};

/// Backend-agnostic persistence trait for the orchestration engine.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Assignments ─────────────────────────────────────────────────

    /// All assignments, enabled or not.
    async fn load_assignments(&self) -> Result<Vec<Assignment>, StoreError>;

    async fn get_assignment(&self, id: AssignmentId)
    -> Result<Option<Assignment>, StoreError>;

    /// Assignment ids whose persisted RunningState is true.
    async fn load_running_assignments(&self) -> Result<Vec<AssignmentId>, StoreError>;

    /// Persist operator intent for one assignment.
    async fn save_running_state(
        &self,
        id: AssignmentId,
        running: bool,
    ) -> Result<(), StoreError>;

    // ── Cursors ─────────────────────────────────────────────────────

    async fn load_cursor(
        &self,
        bot: &BotId,
        channel: &ChannelId,
    ) -> Result<Option<MessageId>, StoreError>;

    async fn save_cursor(
        &self,
        bot: &BotId,
        channel: &ChannelId,
        cursor: MessageId,
    ) -> Result<(), StoreError>;

    // ── Activity ────────────────────────────────────────────────────

    /// Best-effort per-channel activity marker for the metrics
    /// collaborator. Callers treat failures as non-fatal.
    async fn record_activity(
        &self,
        channel: &ChannelId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Schedules ───────────────────────────────────────────────────

    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, StoreError>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleEntry>, StoreError>;

    async fn insert_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    async fn update_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    async fn delete_schedule(&self, id: Uuid) -> Result<(), StoreError>;

    /// Persist the outcome of one fire atomically: `last_run_at`,
    /// `next_run_at` and the enabled flag land together.
    async fn save_schedule_run(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Inner {
    assignments: HashMap<AssignmentId, Assignment>,
    running: HashSet<AssignmentId>,
    cursors: HashMap<(BotId, ChannelId), MessageId>,
    activity: HashMap<ChannelId, (u64, DateTime<Utc>)>,
    schedules: HashMap<Uuid, ScheduleEntry>,
}

/// In-memory `Store` implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an assignment (the CRUD collaborator's job in production).
    pub async fn insert_assignment(&self, assignment: Assignment) {
        self.inner
            .write()
            .await
            .assignments
            .insert(assignment.id, assignment);
    }

    /// Recorded activity for a channel: (message count, last message time).
    pub async fn activity(&self, channel: &ChannelId) -> Option<(u64, DateTime<Utc>)> {
        self.inner.read().await.activity.get(channel).copied()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_assignments(&self) -> Result<Vec<Assignment>, StoreError> {
        Ok(self.inner.read().await.assignments.values().cloned().collect())
    }

    async fn get_assignment(
        &self,
        id: AssignmentId,
    ) -> Result<Option<Assignment>, StoreError> {
        Ok(self.inner.read().await.assignments.get(&id).cloned())
    }

    async fn load_running_assignments(&self) -> Result<Vec<AssignmentId>, StoreError> {
        Ok(self.inner.read().await.running.iter().copied().collect())
    }

    async fn save_running_state(
        &self,
        id: AssignmentId,
        running: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if running {
            inner.running.insert(id);
        } else {
            inner.running.remove(&id);
        }
        Ok(())
    }

    async fn load_cursor(
        &self,
        bot: &BotId,
        channel: &ChannelId,
    ) -> Result<Option<MessageId>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .cursors
            .get(&(bot.clone(), channel.clone()))
            .copied())
    }

    async fn save_cursor(
        &self,
        bot: &BotId,
        channel: &ChannelId,
        cursor: MessageId,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .cursors
            .insert((bot.clone(), channel.clone()), cursor);
        Ok(())
    }

    async fn record_activity(
        &self,
        channel: &ChannelId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner.activity.entry(channel.clone()).or_insert((0, at));
        slot.0 += 1;
        slot.1 = at;
        Ok(())
    }

    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self.inner.read().await.schedules.values().cloned().collect())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleEntry>, StoreError> {
        Ok(self.inner.read().await.schedules.get(&id).cloned())
    }

    async fn insert_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .schedules
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.schedules.contains_key(&entry.id) {
            return Err(StoreError::NotFound {
                entity: "schedule".into(),
                id: entry.id.to_string(),
            });
        }
        inner.schedules.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().await.schedules.remove(&id);
        Ok(())
    }

    async fn save_schedule_run(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .schedules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "schedule".into(),
                id: id.to_string(),
            })?;
        entry.last_run_at = last_run_at;
        entry.next_run_at = next_run_at;
        entry.enabled = enabled;
        Ok(())
    }
}
