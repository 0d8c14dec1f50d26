//! Error types for botherd.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Top-level error type for the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Message gateway failures, split by retryability.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network hiccup or rate limit; retried with backoff.
    #[error("transient gateway failure: {reason}")]
    Transient { reason: String },

    /// Auth/permission/channel-gone; not retried, surfaces as Failed.
    #[error("fatal gateway failure: {reason}")]
    Fatal { reason: String },
}

impl GatewayError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Bot handler failures. "Nothing to say" is not an error; handlers
/// express that with `HandlerVerdict::Skip`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler processing failed: {reason}")]
    Processing { reason: String },

    #[error("invalid handler config: {reason}")]
    Config { reason: String },
}

/// Worker lifecycle errors surfaced by the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("assignment {id} not found")]
    AssignmentNotFound { id: Uuid },

    #[error("assignment {id} is disabled")]
    AssignmentDisabled { id: Uuid },

    #[error("no handler registered for type '{handler_type}'")]
    HandlerNotRegistered { handler_type: String },

    #[error("supervisor has not reconciled yet")]
    NotReconciled,

    #[error("reconcile may only run once")]
    AlreadyReconciled,

    #[error("worker {id} is failed ({reason}); use restart")]
    WorkerFailed { id: Uuid, reason: String },

    #[error("worker {id} did not stop within {timeout:?}")]
    StopTimeout { id: Uuid, timeout: Duration },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Schedule entry errors. Malformed expressions and timezones are
/// rejected at creation time, never at fire time.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("unknown timezone: {tz}")]
    UnknownTimezone { tz: String },

    #[error("fire time {at} is in the past")]
    FireTimeInPast { at: DateTime<Utc> },

    #[error("schedule {id} not found")]
    NotFound { id: Uuid },

    #[error("schedule {id} is disabled")]
    Disabled { id: Uuid },

    #[error("scheduled send for {id} failed: {reason}")]
    SendFailed { id: Uuid, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Persistence collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
