use crate::execution::error::ExecutionError;
use crate::remote::ConnectionDescriptor;
use crate::shared::ids::{InteractionId, SessionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Running, SessionStatus::WaitingInput)
                | (SessionStatus::Running, SessionStatus::Completed)
                | (SessionStatus::Running, SessionStatus::Failed)
                | (SessionStatus::Running, SessionStatus::Cancelled)
                | (SessionStatus::Running, SessionStatus::TimedOut)
                | (SessionStatus::WaitingInput, SessionStatus::Running)
                | (SessionStatus::WaitingInput, SessionStatus::Failed)
                | (SessionStatus::WaitingInput, SessionStatus::Cancelled)
                | (SessionStatus::WaitingInput, SessionStatus::TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Cancelled
                | SessionStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::WaitingInput => "WAITING_INPUT",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one run. Only the engine thread that owns the session
/// mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub session_id: SessionId,
    pub plan_name: String,
    pub status: SessionStatus,
    pub cursor: usize,
    pub step_count: usize,
    pub plan_digest: String,
    pub connection: ConnectionDescriptor,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub last_completed_step: Option<usize>,
    #[serde(default)]
    pub current_interaction: Option<InteractionId>,
    #[serde(default)]
    pub terminal_reason: Option<String>,
}

impl ExecutionSession {
    pub fn new(
        session_id: SessionId,
        plan_name: impl Into<String>,
        step_count: usize,
        plan_digest: impl Into<String>,
        connection: ConnectionDescriptor,
        now: i64,
    ) -> Self {
        Self {
            session_id,
            plan_name: plan_name.into(),
            status: SessionStatus::Running,
            cursor: 0,
            step_count,
            plan_digest: plan_digest.into(),
            connection,
            created_at: now,
            updated_at: now,
            current_step_id: None,
            last_completed_step: None,
            current_interaction: None,
            terminal_reason: None,
        }
    }

    pub fn transition(
        &mut self,
        next: SessionStatus,
        now: i64,
        reason: Option<String>,
    ) -> Result<(), ExecutionError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.terminal_reason = reason;
            self.current_interaction = None;
        } else {
            self.terminal_reason = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for status in [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
            SessionStatus::TimedOut,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(SessionStatus::Running));
        }
        assert!(SessionStatus::WaitingInput.can_transition_to(SessionStatus::Running));
        assert!(!SessionStatus::WaitingInput.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn transition_records_reason_and_rejects_illegal_moves() {
        let mut session = ExecutionSession::new(
            SessionId::parse("sess-a").expect("id"),
            "plan",
            2,
            "digest",
            ConnectionDescriptor::local(),
            1,
        );
        session
            .transition(SessionStatus::Failed, 5, Some("step b failed".to_string()))
            .expect("fail");
        assert_eq!(session.updated_at, 5);
        assert_eq!(session.terminal_reason.as_deref(), Some("step b failed"));
        let err = session
            .transition(SessionStatus::Running, 6, None)
            .expect_err("terminal");
        assert!(matches!(err, ExecutionError::InvalidTransition { .. }));
    }

    #[test]
    fn status_serializes_in_upper_snake_case() {
        let body = serde_json::to_string(&SessionStatus::WaitingInput).expect("json");
        assert_eq!(body, "\"WAITING_INPUT\"");
    }
}
