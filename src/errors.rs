use thiserror::Error;

/// The central error type for the healing pipeline.
///
/// Public entry points (`classify`, `analyze`, `handle`) never surface this
/// type; it flows between internal stages and is absorbed at those
/// boundaries into low-confidence results or the emergency path.
#[derive(Error, Debug)]
pub enum HealingError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Invalid alert pattern '{name}': {reason}")]
    InvalidAlertPattern { name: String, reason: String },

    #[error("Invalid classification rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the persistent store collaborator.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("Failed to serialize record: {0}")]
    Serialization(String),
}

/// Failures of the alert dispatcher collaborator.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Channel '{channel}' rejected alert: {message}")]
    Channel { channel: String, message: String },

    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),
}

#[derive(Error, Debug, Clone)]
pub enum RecoveryError {
    #[error("Circuit breaker open for target '{target}'")]
    CircuitOpen { target: String },

    #[error("Recovery action '{action}' failed: {message}")]
    ActionFailed { action: String, message: String },

    #[error("Recovery action '{action}' timed out after {millis}ms")]
    ActionTimeout { action: String, millis: u64 },

    #[error("Recovery session {session_id} aborted: {reason}")]
    SessionAborted { session_id: String, reason: String },

    #[error("Participant '{agent_id}' did not respond within {millis}ms")]
    ParticipantTimeout { agent_id: String, millis: u64 },
}

pub type Result<T> = std::result::Result<T, HealingError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_INPUT_ERROR: u8 = 3;

/// Determine the process exit code for an error surfaced by the CLI.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<HealingError>() {
        return match err {
            HealingError::Config(_)
            | HealingError::InvalidAlertPattern { .. }
            | HealingError::InvalidRule { .. } => EXIT_CONFIG_ERROR,
            _ => EXIT_ERROR,
        };
    }

    if e.downcast_ref::<serde_json::Error>().is_some() {
        return EXIT_INPUT_ERROR;
    }
    if e.downcast_ref::<toml::de::Error>().is_some() {
        return EXIT_CONFIG_ERROR;
    }

    EXIT_ERROR
}
