//! massdispatch - Throttled batch messaging through an external delivery agent
//!
//! massdispatch renders one personalized message per recipient, hands the
//! whole batch to a delivery agent that owns the messaging session, and
//! tracks per-message outcomes as the agent reports them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Dispatcher                            │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐  │
//! │  │ BatchBuilder │──▶│ ProgressAggregator│──▶│ ReportExport │  │
//! │  │  + template  │   │  + EventLog (50)  │   │    (CSV)     │  │
//! │  └──────┬───────┘   └─────────▲─────────┘   └──────────────┘  │
//! └─────────┼─────────────────────┼──────────────────────────────┘
//!           │ send / pause /      │ progress, batch_done
//!           │ resume / cancel     │ (one subscription per batch)
//! ┌─────────▼─────────────────────┴──────────────────────────────┐
//! │                AgentBridge (NDJSON over stdio)                │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │
//!                      external delivery agent
//! ```
//!
//! ## Key Features
//!
//! - Placeholder templates (`{name}`, `{company}`, `{email}`, `{phone}`)
//! - Dry runs limited to the first few recipients
//! - Pause, resume and cancel while a batch is in flight
//! - Per-message correlation by id, never by address
//! - Stall detection when the agent goes quiet
//! - Delimited report export of the recent event log
//!
//! ## Modules
//!
//! - [`dispatcher`]: Batch lifecycle state machine
//! - [`agent`]: Agent bridge trait, NDJSON process bridge and simulator
//! - [`batch`]: Recipients, throttle policy and batch construction
//! - [`template`]: Placeholder rendering
//! - [`progress`]: Progress counters and the rolling event log
//! - [`report`]: Report export
//! - [`config`]: Configuration management

pub mod agent;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod progress;
pub mod report;
pub mod template;

pub use agent::{AgentBridge, ProcessAgent, SimulatedAgent};
pub use batch::{Recipient, SendRequest, ThrottlePolicy};
pub use config::DispatchConfig;
pub use dispatcher::{Dispatcher, DispatcherOptions, Outcome, Phase};
pub use error::{Error, PreconditionError, Result};
pub use progress::SendProgress;
