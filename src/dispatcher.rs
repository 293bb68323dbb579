//! Batch dispatcher
//!
//! Owns the lifecycle of at most one batch at a time:
//!
//! ```text
//! Idle ─send_messages─▶ Preparing ─▶ Running ⇄ Paused ─▶ Completed | Cancelled | Stalled
//!                           │
//!                           └─ precondition failed ─▶ Idle
//! ```
//!
//! All state transitions, from control calls and inbound agent events alike,
//! are serialized through one async mutex. Calls into the agent are made
//! with the mutex released. Each batch gets its own event pump task, which
//! owns the batch's subscription; the task handle lives in a [`BatchGuard`]
//! that is taken out of the state on every terminal transition, so the
//! subscription of a finished batch can never receive anything again.

use crate::agent::{AgentBridge, AgentEvent, BatchDoneEvent, Subscription};
use crate::batch::{BatchBuilder, BatchId, BatchRequest, SendRequest, ThrottlePolicy};
use crate::config::DispatchConfig;
use crate::error::{PreconditionError, Result};
use crate::progress::{EventLogEntry, ProgressAggregator, SendProgress, DEFAULT_CAPACITY};
use crate::report::Report;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle phase of the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preparing,
    Running,
    Paused,
    Completed,
    Cancelled,
    Stalled,
}

impl Phase {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Stalled)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// How the last batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The agent reported the batch done
    Completed,
    /// The user cancelled
    Cancelled,
    /// The agent went quiet for longer than the stall timeout
    Stalled,
}

impl From<Outcome> for Phase {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => Phase::Completed,
            Outcome::Cancelled => Phase::Cancelled,
            Outcome::Stalled => Phase::Stalled,
        }
    }
}

/// Tunables for a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub dry_run_limit: usize,
    pub log_capacity: usize,
    pub stall_timeout: Option<Duration>,
    pub default_throttle: ThrottlePolicy,
    pub report_delimiter: char,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            dry_run_limit: 3,
            log_capacity: DEFAULT_CAPACITY,
            stall_timeout: Some(Duration::from_secs(15 * 60)),
            default_throttle: ThrottlePolicy::default(),
            report_delimiter: ',',
        }
    }
}

impl From<&DispatchConfig> for DispatcherOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            dry_run_limit: config.dispatch.dry_run_limit,
            log_capacity: config.dispatch.log_capacity,
            stall_timeout: config.dispatch.stall_timeout(),
            default_throttle: config.dispatch.default_throttle,
            report_delimiter: config.report.delimiter,
        }
    }
}

/// Keeps a batch's event pump alive. Dropping it aborts the pump, which
/// releases the subscription the pump owns.
struct BatchGuard {
    pump: Option<JoinHandle<()>>,
}

impl BatchGuard {
    /// Let a pump that is finishing on its own run to completion.
    fn detach(mut self) {
        self.pump.take();
    }

    /// Abort the pump and wait until its subscription is gone.
    async fn shutdown(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Check for silence again at the given instant
    WaitUntil(Instant),
    Finished,
}

struct State {
    phase: Phase,
    batch: Option<BatchRequest>,
    aggregator: ProgressAggregator,
    guard: Option<BatchGuard>,
    outcome: Option<Outcome>,
    /// Start of the current quiet stretch: batch start, the last event for
    /// the batch, or the last resume
    quiet_since: Instant,
}

impl State {
    fn active_batch_id(&self) -> Option<BatchId> {
        if self.phase.is_active() {
            self.batch.as_ref().map(|b| b.batch_id)
        } else {
            None
        }
    }

    fn is_current(&self, batch_id: BatchId) -> bool {
        self.active_batch_id() == Some(batch_id)
    }

    /// Move the active batch to a terminal phase. Returns the guard so the
    /// caller decides how the pump ends.
    fn finish(&mut self, outcome: Outcome) -> Option<BatchGuard> {
        self.aggregator.deactivate();
        self.phase = outcome.into();
        self.outcome = Some(outcome);
        self.batch = None;
        self.guard.take()
    }
}

struct Inner {
    bridge: Arc<dyn AgentBridge>,
    options: DispatcherOptions,
    builder: BatchBuilder,
    state: Mutex<State>,
    progress_tx: watch::Sender<SendProgress>,
}

impl Inner {
    fn publish(&self, state: &State) {
        self.progress_tx.send_replace(state.aggregator.progress());
    }

    async fn handle_event(&self, event: AgentEvent) -> Flow {
        let mut state = self.state.lock().await;
        if !state.is_current(event.batch_id()) {
            tracing::debug!(batch_id = %event.batch_id(), "Event for inactive batch dropped");
            return Flow::Continue;
        }

        state.quiet_since = Instant::now();
        match event {
            AgentEvent::Progress(progress) => {
                if state.aggregator.apply(&progress) {
                    self.publish(&state);
                }
                Flow::Continue
            }
            AgentEvent::BatchDone(BatchDoneEvent {
                batch_id,
                sent,
                failed,
            }) => {
                state.aggregator.reconcile(sent, failed);
                if let Some(guard) = state.finish(Outcome::Completed) {
                    guard.detach();
                }
                self.publish(&state);
                let progress = state.aggregator.progress();
                tracing::info!(
                    batch_id = %batch_id,
                    total = progress.total,
                    sent = progress.sent,
                    failed = progress.failed,
                    "Batch completed"
                );
                Flow::Finished
            }
        }
    }

    /// Called when the pump's silence deadline passes, or the event stream
    /// ended. Quiet time only counts while running: a paused batch is left
    /// alone, and a batch that heard from the agent or was resumed since the
    /// deadline was set gets a fresh one.
    async fn handle_silence(&self, batch_id: BatchId, stream_closed: bool) -> Flow {
        {
            let mut state = self.state.lock().await;
            if !state.is_current(batch_id) {
                return Flow::Finished;
            }
            if !stream_closed {
                let Some(limit) = self.options.stall_timeout else {
                    return Flow::Continue;
                };
                let now = Instant::now();
                if state.phase == Phase::Paused {
                    return Flow::WaitUntil(now + limit);
                }
                let due = state.quiet_since + limit;
                if due > now {
                    return Flow::WaitUntil(due);
                }
            }

            if let Some(guard) = state.finish(Outcome::Stalled) {
                guard.detach();
            }
            self.publish(&state);
            tracing::warn!(
                batch_id = %batch_id,
                stream_closed,
                progress = %state.aggregator.progress(),
                "Batch stalled: no word from the agent"
            );
        }

        if let Err(e) = self.bridge.cancel_batch().await {
            tracing::warn!(batch_id = %batch_id, "Failed to cancel stalled batch: {}", e);
        }
        Flow::Finished
    }

    /// Leave `Preparing` after a failed start.
    async fn abandon_preparing(&self) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Preparing {
            state.phase = Phase::Idle;
        }
    }
}

/// Returns the dispatcher to `Idle` if a `send_messages` call is dropped
/// while the batch is still being prepared.
struct PreparingGuard {
    inner: Option<Arc<Inner>>,
}

impl PreparingGuard {
    fn disarm(mut self) {
        self.inner.take();
    }
}

impl Drop for PreparingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { inner.abandon_preparing().await });
            }
        }
    }
}

async fn pump(
    inner: Weak<Inner>,
    batch_id: BatchId,
    mut subscription: Subscription,
    stall_timeout: Option<Duration>,
) {
    let mut deadline = stall_timeout.map(|t| Instant::now() + t);

    loop {
        let received = match deadline {
            Some(at) => tokio::time::timeout_at(at, subscription.recv()).await.ok(),
            None => Some(subscription.recv().await),
        };
        let Some(dispatcher) = inner.upgrade() else {
            break;
        };

        let flow = match received {
            Some(Some(event)) => dispatcher.handle_event(event).await,
            Some(None) => dispatcher.handle_silence(batch_id, true).await,
            None => dispatcher.handle_silence(batch_id, false).await,
        };
        match flow {
            Flow::Continue => {}
            Flow::WaitUntil(at) => deadline = Some(at),
            Flow::Finished => break,
        }
    }

    subscription.dispose();
}

/// Cloneable handle to the batch dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(bridge: Arc<dyn AgentBridge>, options: DispatcherOptions) -> Self {
        let (progress_tx, _) = watch::channel(SendProgress::default());
        let builder = BatchBuilder::new(options.dry_run_limit, options.default_throttle);
        let state = State {
            phase: Phase::Idle,
            batch: None,
            aggregator: ProgressAggregator::new(options.log_capacity),
            guard: None,
            outcome: None,
            quiet_since: Instant::now(),
        };
        Self {
            inner: Arc::new(Inner {
                bridge,
                options,
                builder,
                state: Mutex::new(state),
                progress_tx,
            }),
        }
    }

    pub fn from_config(bridge: Arc<dyn AgentBridge>, config: &DispatchConfig) -> Self {
        Self::new(bridge, DispatcherOptions::from(config))
    }

    /// Start a batch.
    ///
    /// Fails without touching the previous batch's progress or log if a
    /// batch is already active, the request is unusable, or the agent is not
    /// ready.
    pub async fn send_messages(&self, request: SendRequest) -> Result<SendProgress> {
        let inner = &self.inner;
        let previous_phase = {
            let mut state = inner.state.lock().await;
            if state.phase.is_active() || state.phase == Phase::Preparing {
                return Err(PreconditionError::BatchInFlight.into());
            }
            std::mem::replace(&mut state.phase, Phase::Preparing)
        };
        let preparing = PreparingGuard {
            inner: Some(inner.clone()),
        };

        let batch = match self.prepare(&request).await {
            Ok(batch) => batch,
            Err(e) => {
                preparing.disarm();
                inner.abandon_preparing().await;
                tracing::info!(previous = %previous_phase, "Batch not started: {}", e);
                return Err(e);
            }
        };

        let subscription = inner.bridge.subscribe();
        if let Err(e) = inner.bridge.send_batch(&batch).await {
            subscription.dispose();
            preparing.disarm();
            inner.abandon_preparing().await;
            tracing::warn!(batch_id = %batch.batch_id, "Agent refused batch: {}", e);
            return Err(e);
        }

        let mut state = inner.state.lock().await;
        preparing.disarm();
        state.aggregator.start(&batch);
        state.phase = Phase::Running;
        state.quiet_since = Instant::now();
        let pump = tokio::spawn(pump(
            Arc::downgrade(inner),
            batch.batch_id,
            subscription,
            inner.options.stall_timeout,
        ));
        state.guard = Some(BatchGuard { pump: Some(pump) });
        tracing::info!(
            batch_id = %batch.batch_id,
            total = batch.len(),
            dry_run = batch.dry_run,
            attachments = batch.attachments.len(),
            "Batch started"
        );
        state.batch = Some(batch);
        inner.publish(&state);
        Ok(state.aggregator.progress())
    }

    async fn prepare(&self, request: &SendRequest) -> Result<BatchRequest> {
        let batch = self.inner.builder.build(request)?;

        let presence = self.inner.bridge.detect_agent().await;
        if !presence.available {
            return Err(PreconditionError::AgentUnavailable.into());
        }
        if !self.inner.bridge.check_session_active().await {
            return Err(PreconditionError::SessionInactive.into());
        }
        Ok(batch)
    }

    /// Toggle pause on the active batch. `Ok(None)` when nothing is active.
    ///
    /// The phase flips before the agent is told; if the agent cannot be
    /// reached the flip is undone, unless the batch moved on meanwhile.
    pub async fn pause_resume(&self) -> Result<Option<SendProgress>> {
        let inner = &self.inner;
        let (batch_id, pausing) = {
            let mut state = inner.state.lock().await;
            let Some(batch_id) = state.active_batch_id() else {
                tracing::debug!("Pause/resume ignored: no active batch");
                return Ok(None);
            };
            let pausing = state.phase == Phase::Running;
            Self::set_paused(&mut state, pausing);
            inner.publish(&state);
            (batch_id, pausing)
        };

        let forwarded = if pausing {
            inner.bridge.pause_batch().await
        } else {
            inner.bridge.resume_batch().await
        };

        let mut state = inner.state.lock().await;
        let toggled = if pausing { Phase::Paused } else { Phase::Running };
        if let Err(e) = forwarded {
            if state.is_current(batch_id) && state.phase == toggled {
                Self::set_paused(&mut state, !pausing);
                inner.publish(&state);
            }
            tracing::warn!(batch_id = %batch_id, "Agent did not accept pause/resume: {}", e);
            return Err(e);
        }
        tracing::info!(batch_id = %batch_id, phase = %toggled, "Batch pause toggled");
        Ok(Some(state.aggregator.progress()))
    }

    fn set_paused(state: &mut State, paused: bool) {
        if paused {
            state.phase = Phase::Paused;
        } else {
            state.phase = Phase::Running;
            state.quiet_since = Instant::now();
        }
        state.aggregator.set_paused(paused);
    }

    /// Cancel the active batch. `None` when nothing is active.
    pub async fn cancel_send(&self) -> Option<SendProgress> {
        let (batch_id, guard, progress) = {
            let mut state = self.inner.state.lock().await;
            let batch_id = state.active_batch_id()?;
            let guard = state.finish(Outcome::Cancelled);
            self.inner.publish(&state);
            let progress = state.aggregator.progress();
            tracing::info!(batch_id = %batch_id, progress = %progress, "Batch cancelled");
            (batch_id, guard, progress)
        };

        if let Some(guard) = guard {
            guard.shutdown().await;
        }
        if let Err(e) = self.inner.bridge.cancel_batch().await {
            tracing::warn!(batch_id = %batch_id, "Agent did not accept cancel: {}", e);
        }
        Some(progress)
    }

    /// Render the event log as a report. `None` when the log is empty.
    pub async fn download_report(&self) -> Option<Report> {
        let entries = self.event_log().await;
        if entries.is_empty() {
            tracing::debug!("Report skipped: event log is empty");
            return None;
        }
        let today = chrono::Local::now().date_naive();
        Some(Report::new(&entries, self.inner.options.report_delimiter, today))
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> SendProgress {
        *self.inner.progress_tx.borrow()
    }

    /// Receiver that observes every progress change
    pub fn watch_progress(&self) -> watch::Receiver<SendProgress> {
        self.inner.progress_tx.subscribe()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    /// Terminal outcome of the most recent batch, if any batch has ended
    pub async fn outcome(&self) -> Option<Outcome> {
        self.inner.state.lock().await.outcome
    }

    /// Event log snapshot, newest first
    pub async fn event_log(&self) -> Vec<EventLogEntry> {
        self.inner.state.lock().await.aggregator.log().snapshot()
    }
}
