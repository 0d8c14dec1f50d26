//! Worker lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AssignmentId, MessageId};

/// State of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No loop is running.
    Stopped,
    /// Start requested, loop not yet polling.
    Starting,
    /// Polling loop is live.
    Running,
    /// Stop requested, loop winding down.
    Stopping,
    /// Unrecoverable error; only an explicit restart leaves this state.
    Failed,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                // Only via an explicit restart request.
                | (Failed, Starting)
        )
    }

    /// True while a loop task exists for this worker.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// In-memory record for one worker, owned by the supervisor. Created on
/// start request, destroyed on stop completion; Failed records stay
/// queryable until stopped or restarted.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub assignment_id: AssignmentId,
    pub state: WorkerState,
    pub cursor: Option<MessageId>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub messages_handled: u64,
    pub replies_sent: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(assignment_id: AssignmentId) -> Self {
        Self {
            assignment_id,
            state: WorkerState::Stopped,
            cursor: None,
            last_error: None,
            started_at: None,
            consecutive_failures: 0,
            messages_handled: 0,
            replies_sent: 0,
            last_message_at: None,
        }
    }

    /// Transition to a new state, enforcing the guard table.
    pub fn transition_to(&mut self, target: WorkerState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!(
                "cannot transition from {} to {}",
                self.state, target
            ));
        }
        if target == WorkerState::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.state = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(WorkerState::Stopped.can_transition_to(WorkerState::Starting));
        assert!(WorkerState::Starting.can_transition_to(WorkerState::Running));
        assert!(WorkerState::Running.can_transition_to(WorkerState::Stopping));
        assert!(WorkerState::Running.can_transition_to(WorkerState::Failed));
        assert!(WorkerState::Stopping.can_transition_to(WorkerState::Stopped));
        assert!(WorkerState::Failed.can_transition_to(WorkerState::Starting));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Running));
        assert!(!WorkerState::Failed.can_transition_to(WorkerState::Running));
        assert!(!WorkerState::Failed.can_transition_to(WorkerState::Stopped));
        assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Stopping));
        assert!(!WorkerState::Running.can_transition_to(WorkerState::Starting));
    }

    #[test]
    fn live_states() {
        assert!(WorkerState::Starting.is_live());
        assert!(WorkerState::Running.is_live());
        assert!(WorkerState::Stopping.is_live());
        assert!(!WorkerState::Stopped.is_live());
        assert!(!WorkerState::Failed.is_live());
    }

    #[test]
    fn record_lifecycle() {
        let mut rec = WorkerRecord::new(Uuid::new_v4());
        assert_eq!(rec.state, WorkerState::Stopped);
        assert!(rec.started_at.is_none());

        rec.transition_to(WorkerState::Starting).unwrap();
        rec.transition_to(WorkerState::Running).unwrap();
        assert!(rec.started_at.is_some());

        rec.transition_to(WorkerState::Stopping).unwrap();
        rec.transition_to(WorkerState::Stopped).unwrap();
        assert_eq!(rec.state, WorkerState::Stopped);
    }

    #[test]
    fn record_rejects_invalid_transition() {
        let mut rec = WorkerRecord::new(Uuid::new_v4());
        assert!(rec.transition_to(WorkerState::Running).is_err());
        assert_eq!(rec.state, WorkerState::Stopped);
    }

    #[test]
    fn state_display_and_serde() {
        assert_eq!(WorkerState::Running.to_string(), "running");
        let json = serde_json::to_string(&WorkerState::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let parsed: WorkerState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, WorkerState::Failed);
    }
}
