//! NDJSON protocol types for agent communication
//!
//! Every line exchanged with the agent is one JSON object tagged by `type`:
//! - Dispatcher → agent: [`AgentCommand`]
//! - Agent → dispatcher: [`AgentMessage`]
//!
//! Progress and completion notifications are re-published to subscribers as
//! [`AgentEvent`]s; query replies stay inside the bridge.

use crate::batch::{BatchId, BatchRequest, MessageId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Dispatcher → agent
// =============================================================================

/// Command written to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Presence check; answered by `hello_ack`
    Hello { request_id: String },
    /// Session query; answered by `session_status`
    SessionStatus { request_id: String },
    /// Hand over a batch. No synchronous acknowledgement.
    SendBatch { batch: BatchRequest },
    PauseBatch,
    ResumeBatch,
    CancelBatch,
}

// =============================================================================
// Agent → dispatcher
// =============================================================================

/// Message read from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    HelloAck {
        request_id: String,
        version: String,
    },
    SessionStatus {
        request_id: String,
        authenticated: bool,
    },
    Progress(ProgressEvent),
    BatchDone(BatchDoneEvent),
    /// Agent-side failure not tied to a message
    Error { message: String },
    KeepAlive,
}

/// Per-message delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Success,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects
    /// pending → sending → {success | failed}.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Sending | Self::Success | Self::Failed) => true,
            (Self::Sending, Self::Success | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sending => write!(f, "sending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status change for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub batch_id: BatchId,
    pub message_id: MessageId,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Agent-provided delivery confirmation (e.g. a platform message id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_meta: Option<String>,
}

/// Agent's final tally for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDoneEvent {
    pub batch_id: BatchId,
    pub sent: usize,
    pub failed: usize,
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Progress(ProgressEvent),
    BatchDone(BatchDoneEvent),
}

impl AgentEvent {
    pub fn batch_id(&self) -> BatchId {
        match self {
            Self::Progress(p) => p.batch_id,
            Self::BatchDone(d) => d.batch_id,
        }
    }
}

/// Result of probing for the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPresence {
    pub available: bool,
    pub version: Option<String>,
}

impl AgentPresence {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn available(version: impl Into<String>) -> Self {
        Self {
            available: true,
            version: Some(version.into()),
        }
    }
}
