//! Time-based message scheduler.
//!
//! One tick loop over the due-list. Entries fail independently; a send
//! failure leaves `next_run_at` alone so the entry retries next tick,
//! bounded by a rolling per-day failure cap that disables the entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::gateway::{MessageGateway, SCHED_TAG_PREFIX};
use crate::scheduler::entry::{ScheduleEntry, ScheduleSpec};
use crate::store::Store;
use crate::types::ChannelId;

/// Fields an operator supplies when creating or updating an entry.
#[derive(Debug, Clone)]
pub struct ScheduleDraft {
    pub channel: ChannelId,
    pub message: String,
    pub spec: ScheduleSpec,
}

/// The scheduler owns the runtime copies of all schedule entries and the
/// single tick loop that fires them.
pub struct Scheduler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessageGateway>,
    config: SchedulerConfig,
    entries: RwLock<HashMap<Uuid, ScheduleEntry>>,
    /// Serializes due-cycles and manual triggers so two passes can never
    /// process the same entry concurrently.
    tick_lock: Mutex<()>,
}

impl Scheduler {
    /// Load persisted entries and build the scheduler.
    pub async fn load(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessageGateway>,
        config: SchedulerConfig,
    ) -> Result<Self, ScheduleError> {
        let mut entries = HashMap::new();
        let now = Utc::now();
        for mut entry in store.load_schedules().await? {
            // A persisted recurring entry can arrive without a computed
            // next fire (fresh row, or drift across a long downtime).
            if entry.enabled && entry.next_run_at.is_none() && entry.spec.is_recurring() {
                entry.next_run_at = entry.spec.next_after(now);
            }
            entries.insert(entry.id, entry);
        }
        tracing::info!(count = entries.len(), "loaded schedule entries");
        Ok(Self {
            store,
            gateway,
            config,
            entries: RwLock::new(entries),
            tick_lock: Mutex::new(()),
        })
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        self.config.tick_interval
    }

    /// Create an entry. The spec was validated when built; here the first
    /// fire time is checked so an entry that can never fire is rejected
    /// up front.
    pub async fn create(&self, draft: ScheduleDraft) -> Result<Uuid, ScheduleError> {
        let now = Utc::now();
        let next = match draft.spec.next_after(now) {
            Some(t) => t,
            None => {
                return Err(match &draft.spec {
                    ScheduleSpec::Once { at } => ScheduleError::FireTimeInPast { at: *at },
                    ScheduleSpec::Recurring { expr, .. } => ScheduleError::InvalidExpression {
                        expr: expr.clone(),
                        reason: "no future fire times".into(),
                    },
                });
            }
        };

        let mut entry = ScheduleEntry::new(draft.channel, draft.message, draft.spec);
        entry.next_run_at = Some(next);
        let id = entry.id;

        self.store.insert_schedule(&entry).await?;
        self.entries.write().await.insert(id, entry);
        tracing::info!(schedule_id = %id, next_run_at = %next, "schedule created");
        Ok(id)
    }

    /// Replace an entry's definition. Re-enabling a capped entry resets
    /// its failure window.
    pub async fn update(
        &self,
        id: Uuid,
        draft: ScheduleDraft,
        enabled: bool,
    ) -> Result<(), ScheduleError> {
        let now = Utc::now();
        let next = if enabled {
            match draft.spec.next_after(now) {
                Some(t) => Some(t),
                None => {
                    return Err(match &draft.spec {
                        ScheduleSpec::Once { at } => ScheduleError::FireTimeInPast { at: *at },
                        ScheduleSpec::Recurring { expr, .. } => {
                            ScheduleError::InvalidExpression {
                                expr: expr.clone(),
                                reason: "no future fire times".into(),
                            }
                        }
                    });
                }
            }
        } else {
            None
        };

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or(ScheduleError::NotFound { id })?;

        entry.channel = draft.channel;
        entry.message = draft.message;
        entry.spec = draft.spec;
        entry.enabled = enabled;
        entry.next_run_at = next;
        entry.failures_today = 0;
        entry.failure_window_start = None;
        entry.last_error = None;

        self.store.update_schedule(entry).await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ScheduleError> {
        let removed = self.entries.write().await.remove(&id);
        if removed.is_none() {
            return Err(ScheduleError::NotFound { id });
        }
        self.store.delete_schedule(id).await?;
        tracing::info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<ScheduleEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Force an immediate send, bypassing the due-check. Goes through the
    /// same success/failure handling; a recurring entry's `next_run_at`
    /// is left untouched.
    pub async fn trigger(&self, id: Uuid) -> Result<(), ScheduleError> {
        let _tick = self.tick_lock.lock().await;
        self.fire(id, true).await
    }

    /// One pass over the due-list. Entries are processed independently;
    /// one entry's failure never blocks the rest.
    pub async fn run_due_cycle(&self) {
        let _tick = self.tick_lock.lock().await;
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| e.id)
            .collect();

        for id in due {
            if let Err(e) = self.fire(id, false).await {
                tracing::warn!(schedule_id = %id, error = %e, "scheduled send failed");
            }
        }
    }

    /// Fire one entry. Caller holds the tick lock.
    async fn fire(&self, id: Uuid, manual: bool) -> Result<(), ScheduleError> {
        let (channel, message) = {
            let entries = self.entries.read().await;
            let entry = entries.get(&id).ok_or(ScheduleError::NotFound { id })?;
            if !entry.enabled {
                return Err(ScheduleError::Disabled { id });
            }
            (entry.channel.clone(), entry.message.clone())
        };

        let tag = format!("{SCHED_TAG_PREFIX}{id}");
        let sent = tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.send(&channel, &message, &tag),
        )
        .await
        .unwrap_or_else(|_| {
            Err(crate::error::GatewayError::transient(format!(
                "send timed out after {:?}",
                self.config.gateway_timeout
            )))
        });

        let now = Utc::now();
        match sent {
            Ok(message_id) => {
                let (last_run, next_run, enabled) = {
                    let mut entries = self.entries.write().await;
                    let entry = entries.get_mut(&id).ok_or(ScheduleError::NotFound { id })?;
                    entry.last_run_at = Some(now);
                    entry.failures_today = 0;
                    entry.failure_window_start = None;
                    entry.last_error = None;
                    match &entry.spec {
                        ScheduleSpec::Once { .. } => {
                            entry.enabled = false;
                            entry.next_run_at = None;
                        }
                        ScheduleSpec::Recurring { .. } if !manual => {
                            entry.next_run_at = entry.spec.next_after(now);
                        }
                        ScheduleSpec::Recurring { .. } => {}
                    }
                    (entry.last_run_at, entry.next_run_at, entry.enabled)
                };

                if let Err(e) = self
                    .store
                    .save_schedule_run(id, last_run, next_run, enabled)
                    .await
                {
                    tracing::error!(schedule_id = %id, error = %e, "failed to persist schedule run");
                }
                tracing::info!(
                    schedule_id = %id,
                    channel = %channel,
                    message_id,
                    "scheduled message sent"
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                let mut entries = self.entries.write().await;
                let entry = entries.get_mut(&id).ok_or(ScheduleError::NotFound { id })?;

                // Roll the day window before counting.
                let window_expired = entry
                    .failure_window_start
                    .is_none_or(|w| now - w >= ChronoDuration::days(1));
                if window_expired {
                    entry.failure_window_start = Some(now);
                    entry.failures_today = 0;
                }
                entry.failures_today += 1;
                entry.last_error = Some(reason.clone());

                if entry.failures_today >= self.config.daily_failure_cap {
                    entry.enabled = false;
                    let (last_run, next_run) = (entry.last_run_at, entry.next_run_at);
                    drop(entries);
                    if let Err(persist_err) = self
                        .store
                        .save_schedule_run(id, last_run, next_run, false)
                        .await
                    {
                        tracing::error!(
                            schedule_id = %id,
                            error = %persist_err,
                            "failed to persist schedule disable"
                        );
                    }
                    tracing::error!(
                        schedule_id = %id,
                        cap = self.config.daily_failure_cap,
                        "schedule disabled after hitting daily failure cap"
                    );
                }

                Err(ScheduleError::SendFailed { id, reason })
            }
        }
    }
}

/// Spawn the tick loop. The first immediate interval tick is skipped so
/// boot does not double-fire with a caller-driven cycle.
pub fn spawn_ticker(
    scheduler: Arc<Scheduler>,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(scheduler.tick_interval());
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => scheduler.run_due_cycle().await,
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("scheduler ticker stopped");
    })
}
