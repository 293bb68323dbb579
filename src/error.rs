//! Dispatcher error types

use thiserror::Error;

/// Dispatcher error type
#[derive(Error, Debug)]
pub enum Error {
    /// A send or control call was refused before any batch state was touched
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The agent could not be reached or rejected a command
    #[error("Agent error: {0}")]
    Agent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Report export error
    #[error("Report error: {0}")]
    Report(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Reasons a batch cannot start (or a control call cannot apply).
///
/// These are surfaced synchronously and never leave partial batch state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    /// Agent is not installed or not reachable
    #[error("The messaging agent is not installed or not running. Start the agent and try again.")]
    AgentUnavailable,

    /// Agent is reachable but its messaging session is not authenticated
    #[error("The messaging session is not authenticated. Link the session in the agent and try again.")]
    SessionInactive,

    /// Request has no deliverable recipients
    #[error("No recipients with a delivery address were provided")]
    NoRecipients,

    /// Throttle policy is inconsistent
    #[error("Invalid throttle policy: {0}")]
    InvalidThrottle(String),

    /// Another batch is still active
    #[error("A batch is already in progress; cancel it or wait for it to finish")]
    BatchInFlight,
}

impl Error {
    /// Returns the precondition failure, if this is one.
    pub fn precondition(&self) -> Option<&PreconditionError> {
        match self {
            Error::Precondition(p) => Some(p),
            _ => None,
        }
    }
}

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, Error>;
