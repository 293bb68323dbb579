//! Agent module: the boundary to the external delivery agent
//!
//! The agent is a separate process that owns the messaging session, pacing
//! and delivery. The dispatcher only ever talks to it through
//! [`AgentBridge`].
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──commands──▶ AgentBridge ──NDJSON stdin──▶ agent process
//!     ▲                        │
//!     └──── Subscription ◀── EventHub ◀──NDJSON stdout── agent process
//! ```
//!
//! Pause, resume and cancel are advisory: they change what the agent does
//! next, and say nothing about messages it has already accepted.

pub mod hub;
pub mod process;
pub mod protocol;
pub mod simulated;

pub use hub::{EventHub, Subscription};
pub use process::ProcessAgent;
pub use protocol::{AgentEvent, AgentPresence, BatchDoneEvent, MessageStatus, ProgressEvent};
pub use simulated::SimulatedAgent;

use crate::batch::BatchRequest;
use crate::error::Result;
use async_trait::async_trait;

/// Commands and event stream of an external delivery agent
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Look for the agent. Never fails; an unreachable agent is reported
    /// as unavailable.
    async fn detect_agent(&self) -> AgentPresence;

    /// Whether the agent's messaging session is authenticated.
    async fn check_session_active(&self) -> bool;

    /// Hand a batch to the agent. Returns once the command is written;
    /// results arrive later as events.
    async fn send_batch(&self, batch: &BatchRequest) -> Result<()>;

    async fn pause_batch(&self) -> Result<()>;

    async fn resume_batch(&self) -> Result<()>;

    async fn cancel_batch(&self) -> Result<()>;

    /// Register for progress and completion events.
    fn subscribe(&self) -> Subscription;
}
