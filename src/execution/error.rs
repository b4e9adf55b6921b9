use crate::config::ConfigError;
use crate::execution::session::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("variable `{name}` holds a value that is not a {expected}")]
    TypeMismatch { name: String, expected: String },
    #[error("variable name `{name}` is invalid; expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidVariableName { name: String },
    #[error("the global variable scope is read-only (attempted write to `{name}`)")]
    ReadOnlyScope { name: String },
    #[error("interaction `{interaction_id}` was already completed")]
    AlreadyCompleted { interaction_id: String },
    #[error("interaction `{interaction_id}` timed out after {timeout_ms}ms")]
    InteractionTimeout {
        interaction_id: String,
        timeout_ms: u64,
    },
    #[error("interaction `{interaction_id}` was cancelled")]
    Cancelled { interaction_id: String },
    #[error("session `{session_id}` already has pending interaction `{interaction_id}`")]
    InteractionPending {
        session_id: String,
        interaction_id: String,
    },
    #[error("interaction `{interaction_id}` is not awaiting a response")]
    UnknownInteraction { interaction_id: String },
    #[error("session `{session_id}` not found")]
    UnknownSession { session_id: String },
    #[error("session `{session_id}` is already running")]
    SessionBusy { session_id: String },
    #[error("session state transition `{from}` -> `{to}` is invalid")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("step list is invalid: {0}")]
    InvalidStepList(String),
    #[error("condition `{expression}` is invalid: {reason}")]
    InvalidCondition { expression: String, reason: String },
    #[error("template is invalid: {0}")]
    InvalidTemplate(String),
    #[error("template references undefined variable `{name}`")]
    UndefinedVariable { name: String },
    #[error("plan digest mismatch: expected {expected}, got {actual}")]
    PlanMismatch { expected: String, actual: String },
    #[error("snapshot belongs to session `{snapshot}` but context is for `{context}`")]
    SnapshotMismatch { snapshot: String, context: String },
    #[error("identifier allocation failed: {0}")]
    IdAllocation(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("sqlite error at {path}: {source}")]
    Sqlite {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl From<ConfigError> for ExecutionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
